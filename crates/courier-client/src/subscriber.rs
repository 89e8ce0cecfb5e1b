// Response-side client: decode response envelopes and hand results to a callback.
use courier_transport::{Delivery, Session};
use courier_wire::{Codec, CorrelationId, Outcome};
use std::sync::Arc;

use crate::correlation::{Attribution, Correlator};
use crate::error::Result;

/// A decoded inference result.
#[derive(Debug, Clone, PartialEq)]
pub struct InferenceResult {
    pub label: String,
    pub confidence: f64,
    // Token echoed by the bridging stage, when it sent one.
    pub correlation_id: Option<CorrelationId>,
    pub attribution: Attribution,
}

/// A response that could not be delivered as a result.
#[derive(thiserror::Error, Debug)]
pub enum ListenError {
    #[error("undecodable response on {channel}")]
    Decode {
        channel: String,
        #[source]
        source: courier_wire::Error,
    },
    #[error("bridging stage reported a failure: {message}")]
    Remote {
        message: String,
        correlation_id: Option<CorrelationId>,
    },
}

pub type ErrorHandler = Arc<dyn Fn(ListenError) + Send + Sync>;

/// Consumes response envelopes from one fixed channel.
///
/// Results are pushed to the callback given to [`Subscriber::listen`]; there
/// is no polling interface. A pull-style caller forwards from the callback
/// into its own queue.
#[derive(Clone)]
pub struct Subscriber {
    session: Session,
    channel: String,
    codec: Codec,
    correlator: Option<Correlator>,
    on_error: ErrorHandler,
}

impl Subscriber {
    pub fn new(session: Session, channel: impl Into<String>, codec: Codec) -> Self {
        Self {
            session,
            channel: channel.into(),
            codec,
            correlator: None,
            on_error: Arc::new(log_listen_error),
        }
    }

    // Attribute results to requests sent through a publisher sharing this correlator.
    pub fn with_correlator(mut self, correlator: Correlator) -> Self {
        self.correlator = Some(correlator);
        self
    }

    pub fn on_error<F>(mut self, handler: F) -> Self
    where
        F: Fn(ListenError) + Send + Sync + 'static,
    {
        self.on_error = Arc::new(handler);
        self
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Start delivering results. Calling again replaces the callback.
    pub async fn listen<F>(&self, on_result: F) -> Result<()>
    where
        F: Fn(InferenceResult) + Send + Sync + 'static,
    {
        let codec = self.codec;
        let correlator = self.correlator.clone();
        let on_error = self.on_error.clone();
        self.session
            .subscribe(&self.channel, move |delivery| {
                handle_response(&codec, correlator.as_ref(), &on_error, &on_result, delivery)
            })
            .await?;
        tracing::info!(channel = %self.channel, "listening for results");
        Ok(())
    }

    pub async fn stop(&self) -> Result<bool> {
        Ok(self.session.unsubscribe(&self.channel).await?)
    }
}

fn handle_response(
    codec: &Codec,
    correlator: Option<&Correlator>,
    on_error: &ErrorHandler,
    on_result: &(dyn Fn(InferenceResult) + Send + Sync),
    delivery: Delivery,
) {
    let response = match codec.decode_response(&delivery.payload) {
        Ok(response) => response,
        Err(source) => {
            metrics::counter!("courier_responses_undecodable_total").increment(1);
            on_error(ListenError::Decode {
                channel: delivery.channel.to_string(),
                source,
            });
            return;
        }
    };

    let attribution = match correlator {
        None => Attribution::Unattributed,
        Some(correlator) => match correlator.resolve(response.correlation_id) {
            Some(attribution) => attribution,
            None => {
                metrics::counter!("courier_responses_unmatched_total").increment(1);
                tracing::warn!(
                    channel = %delivery.channel,
                    correlation_id = ?response.correlation_id,
                    "dropping response with no outstanding request"
                );
                return;
            }
        },
    };

    match response.outcome {
        Outcome::Prediction(prediction) => {
            metrics::counter!("courier_results_delivered_total").increment(1);
            tracing::debug!(
                label = %prediction.label,
                confidence = prediction.confidence,
                ?attribution,
                "result received"
            );
            on_result(InferenceResult {
                label: prediction.label,
                confidence: prediction.confidence,
                correlation_id: response.correlation_id,
                attribution,
            });
        }
        Outcome::Failure(message) => on_error(ListenError::Remote {
            message,
            correlation_id: response.correlation_id,
        }),
    }
}

fn log_listen_error(err: ListenError) {
    match &err {
        ListenError::Decode { channel, source } => {
            tracing::warn!(channel = %channel, error = %source, "discarding malformed response");
        }
        ListenError::Remote {
            message,
            correlation_id,
        } => {
            tracing::warn!(correlation_id = ?correlation_id, message = %message, "bridging stage failed");
        }
    }
}
