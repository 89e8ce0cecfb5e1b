// Client error type and the flat error taxonomy callers match on.
use std::path::PathBuf;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Wire(#[from] courier_wire::Error),
    #[error(transparent)]
    Transport(#[from] courier_transport::Error),
    #[error("failed to read {}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid client configuration: {0}")]
    Config(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    PayloadTooLarge,
    MalformedEnvelope,
    DecodeFailure,
    NotConnected,
    ConnectError,
    ConnectTimeout,
    PublishRejected,
    PublishTimeout,
    SubscribeRejected,
    InvalidChannel,
    Io,
    Config,
}

impl Error {
    /// The originating failure class, regardless of which layer raised it.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Wire(err) => match err {
                courier_wire::Error::PayloadTooLarge { .. } => ErrorKind::PayloadTooLarge,
                courier_wire::Error::MalformedEnvelope(_) | courier_wire::Error::Serialize(_) => {
                    ErrorKind::MalformedEnvelope
                }
                courier_wire::Error::DecodeFailure(_) => ErrorKind::DecodeFailure,
            },
            Error::Transport(err) => match err {
                courier_transport::Error::NotConnected => ErrorKind::NotConnected,
                courier_transport::Error::Connect(_) => ErrorKind::ConnectError,
                courier_transport::Error::ConnectTimeout(_) => ErrorKind::ConnectTimeout,
                courier_transport::Error::PublishRejected(_) => ErrorKind::PublishRejected,
                courier_transport::Error::PublishTimeout(_) => ErrorKind::PublishTimeout,
                courier_transport::Error::SubscribeRejected(_) => ErrorKind::SubscribeRejected,
                courier_transport::Error::InvalidChannel { .. } => ErrorKind::InvalidChannel,
            },
            Error::Io { .. } => ErrorKind::Io,
            Error::Config(_) => ErrorKind::Config,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn kind_follows_the_originating_layer() {
        let err = Error::from(courier_wire::Error::PayloadTooLarge {
            size: 200_000,
            limit: 131_072,
        });
        assert_eq!(err.kind(), ErrorKind::PayloadTooLarge);
        let err = Error::from(courier_transport::Error::PublishTimeout(Duration::from_secs(1)));
        assert_eq!(err.kind(), ErrorKind::PublishTimeout);
        assert_eq!(
            Error::Config("bad".to_string()).kind(),
            ErrorKind::Config
        );
    }

    #[test]
    fn transparent_errors_keep_their_message() {
        let err = Error::from(courier_transport::Error::NotConnected);
        assert_eq!(err.to_string(), "session is not connected");
    }
}
