// Channel name validation and MQTT-style filter matching.
use crate::{Error, Result};

const MAX_CHANNEL_BYTES: usize = 65_535;

/// Validate a concrete channel name used for publishing.
pub fn validate_channel(channel: &str) -> Result<()> {
    check_common(channel)?;
    if channel.contains(['+', '#']) {
        return Err(invalid(channel, "wildcards are not allowed in a publish channel"));
    }
    Ok(())
}

/// Validate a subscription filter. `+` matches one level, `#` the rest.
pub fn validate_filter(filter: &str) -> Result<()> {
    check_common(filter)?;
    let mut levels = filter.split('/').peekable();
    while let Some(level) = levels.next() {
        if level.contains('#') && (level != "#" || levels.peek().is_some()) {
            return Err(invalid(filter, "`#` must be the whole last level"));
        }
        if level.contains('+') && level != "+" {
            return Err(invalid(filter, "`+` must be a whole level"));
        }
    }
    Ok(())
}

/// Returns true when `channel` is selected by `filter`.
///
/// ```
/// use courier_transport::topic::matches;
///
/// assert!(matches("device/+/response", "device/image/response"));
/// assert!(matches("device/#", "device/image/response"));
/// assert!(!matches("device/+", "device/image/response"));
/// ```
pub fn matches(filter: &str, channel: &str) -> bool {
    // Wildcards never select system channels at the first level.
    if channel.starts_with('$') && filter.starts_with(['+', '#']) {
        return false;
    }
    let mut filter_levels = filter.split('/');
    let mut channel_levels = channel.split('/');
    loop {
        match (filter_levels.next(), channel_levels.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => {}
            (Some(expected), Some(actual)) if expected == actual => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}

fn check_common(value: &str) -> Result<()> {
    if value.is_empty() {
        return Err(invalid(value, "channel must not be empty"));
    }
    if value.len() > MAX_CHANNEL_BYTES {
        return Err(invalid(value, "channel exceeds 65535 bytes"));
    }
    if value.contains('\0') {
        return Err(invalid(value, "channel must not contain NUL"));
    }
    Ok(())
}

fn invalid(channel: &str, reason: &'static str) -> Error {
    Error::InvalidChannel {
        channel: channel.to_string(),
        reason,
    }
}
