// Bridging stage harness: consume requests, run inference, publish results.
use courier_transport::{Delivery, Quality, Session};
use courier_wire::{Codec, CorrelationId, Prediction, Response};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::error::Result;

const DEFAULT_QUEUE_DEPTH: usize = 64;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[error("{message}")]
pub struct InferenceError {
    message: String,
}

impl InferenceError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// The inference engine behind a bridging stage. Runs on a blocking thread.
pub trait Inference: Send + Sync + 'static {
    fn infer(&self, payload: &[u8]) -> std::result::Result<Prediction, InferenceError>;
}

impl<F> Inference for F
where
    F: Fn(&[u8]) -> std::result::Result<Prediction, InferenceError> + Send + Sync + 'static,
{
    fn infer(&self, payload: &[u8]) -> std::result::Result<Prediction, InferenceError> {
        self(payload)
    }
}

/// Serves one request channel and answers on one response channel.
///
/// Every request gets exactly one envelope back: a prediction, or an error
/// envelope when the request cannot be decoded or inference fails. The
/// correlation token of the request is echoed in both cases.
pub struct Bridge<I> {
    session: Session,
    request_channel: String,
    response_channel: String,
    codec: Codec,
    quality: Quality,
    queue_depth: usize,
    inference: Arc<I>,
}

impl<I: Inference> Bridge<I> {
    pub fn new(
        session: Session,
        request_channel: impl Into<String>,
        response_channel: impl Into<String>,
        inference: I,
    ) -> Self {
        Self {
            session,
            request_channel: request_channel.into(),
            response_channel: response_channel.into(),
            codec: Codec::default(),
            quality: Quality::AtLeastOnce,
            queue_depth: DEFAULT_QUEUE_DEPTH,
            inference: Arc::new(inference),
        }
    }

    pub fn with_codec(mut self, codec: Codec) -> Self {
        self.codec = codec;
        self
    }

    pub fn with_quality(mut self, quality: Quality) -> Self {
        self.quality = quality;
        self
    }

    // Requests buffered between the dispatch path and the worker.
    pub fn with_queue_depth(mut self, depth: usize) -> Self {
        self.queue_depth = depth.max(1);
        self
    }

    pub async fn start(&self) -> Result<BridgeHandle> {
        let (tx, rx) = mpsc::channel::<Delivery>(self.queue_depth);
        // The dispatch path only enqueues; a full queue sheds the request.
        self.session
            .subscribe(&self.request_channel, move |delivery| {
                if let Err(err) = tx.try_send(delivery) {
                    metrics::counter!("courier_bridge_requests_shed_total").increment(1);
                    tracing::warn!(error = %err, "bridge queue full; dropping request");
                }
            })
            .await?;

        let worker = Worker {
            session: self.session.clone(),
            response_channel: self.response_channel.clone(),
            codec: self.codec,
            quality: self.quality,
            inference: self.inference.clone(),
        };
        let task = tokio::spawn(worker.run(rx));
        tracing::info!(
            request_channel = %self.request_channel,
            response_channel = %self.response_channel,
            "bridge started"
        );
        Ok(BridgeHandle {
            session: self.session.clone(),
            request_channel: self.request_channel.clone(),
            task,
        })
    }
}

/// Running bridge. Dropping the handle leaves the bridge running.
pub struct BridgeHandle {
    session: Session,
    request_channel: String,
    task: JoinHandle<()>,
}

impl BridgeHandle {
    pub async fn stop(self) {
        if let Err(err) = self.session.unsubscribe(&self.request_channel).await {
            tracing::debug!(error = %err, "bridge unsubscribe failed");
        }
        self.task.abort();
    }
}

struct Worker<I> {
    session: Session,
    response_channel: String,
    codec: Codec,
    quality: Quality,
    inference: Arc<I>,
}

impl<I: Inference> Worker<I> {
    async fn run(self, mut requests: mpsc::Receiver<Delivery>) {
        while let Some(delivery) = requests.recv().await {
            let response = self.answer(delivery).await;
            self.reply(response).await;
        }
    }

    async fn answer(&self, delivery: Delivery) -> Response {
        let request = match self.codec.decode_request(&delivery.payload) {
            Ok(request) => request,
            Err(err) => {
                tracing::warn!(channel = %delivery.channel, error = %err, "undecodable request");
                return Response::failure(None, format!("invalid request: {err}"));
            }
        };
        let correlation_id = request.correlation_id;
        let inference = self.inference.clone();
        let payload = request.payload;
        let outcome = tokio::task::spawn_blocking(move || inference.infer(&payload)).await;
        match outcome {
            Ok(Ok(prediction)) => Response::prediction(
                correlation_id,
                prediction.label,
                round_confidence(prediction.confidence),
            ),
            Ok(Err(err)) => {
                tracing::warn!(correlation_id = ?correlation_id, error = %err, "inference failed");
                Response::failure(correlation_id, err.to_string())
            }
            Err(err) => {
                tracing::warn!(correlation_id = ?correlation_id, error = %err, "inference task failed");
                Response::failure(correlation_id, "inference task failed")
            }
        }
    }

    async fn reply(&self, response: Response) {
        let correlation_id: Option<CorrelationId> = response.correlation_id;
        let envelope = match self.codec.encode_response(&response) {
            Ok(envelope) => envelope,
            Err(err) => {
                // A bad prediction still owes the requester an answer.
                tracing::warn!(correlation_id = ?correlation_id, error = %err, "unencodable response");
                match self
                    .codec
                    .encode_response(&Response::failure(correlation_id, err.to_string()))
                {
                    Ok(envelope) => envelope,
                    Err(_) => return,
                }
            }
        };
        match self
            .session
            .publish(&self.response_channel, envelope.into_bytes(), self.quality)
            .await
        {
            Ok(()) => {
                metrics::counter!("courier_bridge_responses_total").increment(1);
                tracing::debug!(correlation_id = ?correlation_id, "response published");
            }
            Err(err) => {
                tracing::warn!(correlation_id = ?correlation_id, error = %err, "response publish failed");
            }
        }
    }
}

// Four decimal places, matching the bridging stage's wire format.
fn round_confidence(confidence: f64) -> f64 {
    (confidence * 10_000.0).round() / 10_000.0
}
