// Correlation tokens carried from a request envelope into its response.
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Token that ties a response envelope back to the request that produced it.
///
/// ```
/// use courier_wire::CorrelationId;
///
/// let id = CorrelationId::new();
/// let parsed: CorrelationId = id.to_string().parse().expect("parse");
/// assert_eq!(id, parsed);
/// ```
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationId(Uuid);

impl CorrelationId {
    // Generate a fresh random token for an outgoing request.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for CorrelationId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[error("invalid correlation id: {0}")]
pub struct InvalidCorrelationId(pub String);

impl FromStr for CorrelationId {
    type Err = InvalidCorrelationId;

    fn from_str(input: &str) -> std::result::Result<Self, Self::Err> {
        // Keep the raw input so decode errors point at the offending value.
        let uuid = Uuid::parse_str(input).map_err(|_| InvalidCorrelationId(input.into()))?;
        Ok(Self(uuid))
    }
}
