// Request/response correlation over pub/sub channels.
//
// A `Publisher` turns payloads into request envelopes, a bridging stage
// (`Bridge`) answers them, and a `Subscriber` turns response envelopes back
// into `InferenceResult`s. Publisher and Subscriber share a `Correlator` to
// pair each response with the request that produced it.
pub mod bridge;
pub mod config;
pub mod correlation;
pub mod error;
pub mod publisher;
pub mod subscriber;

pub use bridge::{Bridge, BridgeHandle, Inference, InferenceError};
pub use config::ClientConfig;
pub use correlation::{Attribution, Correlator, DEFAULT_MAX_OUTSTANDING};
pub use error::{Error, ErrorKind, Result};
pub use publisher::{PreparedRequest, Publisher};
pub use subscriber::{ErrorHandler, InferenceResult, ListenError, Subscriber};

pub use courier_transport::{ConnectionState, Quality, Session, SessionConfig};
pub use courier_wire::{Codec, CorrelationId, Prediction};
