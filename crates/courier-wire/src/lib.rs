// Envelope codec for the request and response channels.
//
// Request envelopes carry the payload as standard base64 text plus open
// metadata. Response envelopes carry a label and a confidence, or an error
// report from the bridging stage. Every envelope is bounded by a byte ceiling
// that is enforced when the envelope is built, never by truncation.
use base64::Engine;
use bytes::Bytes;
use serde_json::{Map, Value};

mod ids;

pub use ids::{CorrelationId, InvalidCorrelationId};

/// Default ceiling for a serialized envelope (128 KiB).
pub const DEFAULT_MAX_ENVELOPE_BYTES: usize = 128 * 1024;

pub const FIELD_PAYLOAD: &str = "payload_encoded";
// Field name the original bridge used for the request payload.
pub const FIELD_PAYLOAD_LEGACY: &str = "image_data";
pub const FIELD_CORRELATION_ID: &str = "correlation_id";
pub const FIELD_LABEL: &str = "label";
// Field name the original bridge used for the label.
pub const FIELD_LABEL_LEGACY: &str = "prediction";
pub const FIELD_CONFIDENCE: &str = "confidence";
pub const FIELD_ERROR: &str = "error";

pub type Metadata = Map<String, Value>;

pub type Result<T> = std::result::Result<T, Error>;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("envelope is {size} bytes, ceiling is {limit} bytes")]
    PayloadTooLarge { size: usize, limit: usize },
    #[error("malformed envelope: {0}")]
    MalformedEnvelope(String),
    #[error("failed to decode envelope: {0}")]
    DecodeFailure(#[source] BoxError),
    #[error("failed to serialize envelope")]
    Serialize(#[source] serde_json::Error),
}

/// A serialized envelope that is known to fit under the codec ceiling.
///
/// Only [`Codec`] builds envelopes, so holding one proves the size check
/// already happened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    bytes: Bytes,
}

impl Envelope {
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn into_bytes(self) -> Bytes {
        self.bytes
    }
}

/// Decoded request envelope.
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    pub payload: Bytes,
    pub correlation_id: Option<CorrelationId>,
    pub metadata: Metadata,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Prediction {
    pub label: String,
    pub confidence: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Prediction(Prediction),
    // Error envelope published by the bridging stage.
    Failure(String),
}

/// Decoded response envelope.
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    pub correlation_id: Option<CorrelationId>,
    pub outcome: Outcome,
}

impl Response {
    pub fn prediction(
        correlation_id: Option<CorrelationId>,
        label: impl Into<String>,
        confidence: f64,
    ) -> Self {
        Self {
            correlation_id,
            outcome: Outcome::Prediction(Prediction {
                label: label.into(),
                confidence,
            }),
        }
    }

    pub fn failure(correlation_id: Option<CorrelationId>, message: impl Into<String>) -> Self {
        Self {
            correlation_id,
            outcome: Outcome::Failure(message.into()),
        }
    }
}

/// Stateless envelope codec with a configurable size ceiling.
///
/// ```
/// use courier_wire::Codec;
///
/// let codec = Codec::default();
/// let envelope = codec
///     .encode_request(b"\x89PNG", None, Default::default())
///     .expect("encode");
/// let request = codec.decode_request(envelope.as_bytes()).expect("decode");
/// assert_eq!(request.payload.as_ref(), b"\x89PNG");
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Codec {
    max_envelope_bytes: usize,
}

impl Default for Codec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_ENVELOPE_BYTES)
    }
}

impl Codec {
    pub fn new(max_envelope_bytes: usize) -> Self {
        Self { max_envelope_bytes }
    }

    pub fn max_envelope_bytes(&self) -> usize {
        self.max_envelope_bytes
    }

    pub fn encode_request(
        &self,
        payload: &[u8],
        correlation_id: Option<CorrelationId>,
        metadata: Metadata,
    ) -> Result<Envelope> {
        // Reject on the base64 length alone before allocating the encoded text.
        let encoded_len = base64::encoded_len(payload.len(), true).unwrap_or(usize::MAX);
        self.check_size(encoded_len)?;
        let encoded = base64::engine::general_purpose::STANDARD.encode(payload);

        let mut fields = Map::with_capacity(metadata.len() + 2);
        for (key, value) in metadata {
            if is_reserved_request_field(&key) {
                continue;
            }
            fields.insert(key, value);
        }
        fields.insert(FIELD_PAYLOAD.to_string(), Value::String(encoded));
        if let Some(id) = correlation_id {
            fields.insert(FIELD_CORRELATION_ID.to_string(), Value::String(id.to_string()));
        }
        self.seal(Value::Object(fields))
    }

    pub fn decode_request(&self, raw: &[u8]) -> Result<Request> {
        let mut fields = parse_object(raw)?;
        let encoded = match fields
            .remove(FIELD_PAYLOAD)
            .or_else(|| fields.remove(FIELD_PAYLOAD_LEGACY))
        {
            Some(Value::String(encoded)) => encoded,
            Some(other) => {
                return Err(Error::MalformedEnvelope(format!(
                    "`{FIELD_PAYLOAD}` must be a string, got {}",
                    type_name(&other)
                )));
            }
            None => {
                return Err(Error::MalformedEnvelope(format!(
                    "missing field `{FIELD_PAYLOAD}`"
                )));
            }
        };
        let payload = base64::engine::general_purpose::STANDARD
            .decode(encoded.as_bytes())
            .map_err(|err| Error::DecodeFailure(Box::new(err)))?;
        let correlation_id = take_correlation_id(&mut fields)?;
        Ok(Request {
            payload: Bytes::from(payload),
            correlation_id,
            metadata: fields,
        })
    }

    pub fn encode_response(&self, response: &Response) -> Result<Envelope> {
        let mut fields = Map::with_capacity(3);
        match &response.outcome {
            Outcome::Prediction(prediction) => {
                check_confidence(prediction.confidence)?;
                fields.insert(
                    FIELD_LABEL.to_string(),
                    Value::String(prediction.label.clone()),
                );
                let confidence = serde_json::Number::from_f64(prediction.confidence)
                    .map(Value::Number)
                    .ok_or_else(|| {
                        Error::MalformedEnvelope("confidence must be finite".to_string())
                    })?;
                fields.insert(FIELD_CONFIDENCE.to_string(), confidence);
            }
            Outcome::Failure(message) => {
                fields.insert(FIELD_ERROR.to_string(), Value::String(message.clone()));
            }
        }
        if let Some(id) = response.correlation_id {
            fields.insert(FIELD_CORRELATION_ID.to_string(), Value::String(id.to_string()));
        }
        self.seal(Value::Object(fields))
    }

    pub fn decode_response(&self, raw: &[u8]) -> Result<Response> {
        let mut fields = parse_object(raw)?;
        let correlation_id = take_correlation_id(&mut fields)?;

        // An error report wins over any partial result fields next to it.
        if let Some(error) = fields.remove(FIELD_ERROR) {
            let message = match error {
                Value::String(message) => message,
                other => other.to_string(),
            };
            return Ok(Response::failure(correlation_id, message));
        }

        let label = match fields
            .remove(FIELD_LABEL)
            .or_else(|| fields.remove(FIELD_LABEL_LEGACY))
        {
            Some(Value::String(label)) => label,
            Some(other) => {
                return Err(Error::MalformedEnvelope(format!(
                    "`{FIELD_LABEL}` must be a string, got {}",
                    type_name(&other)
                )));
            }
            None => {
                return Err(Error::MalformedEnvelope(format!(
                    "missing field `{FIELD_LABEL}`"
                )));
            }
        };
        let confidence = match fields.remove(FIELD_CONFIDENCE) {
            Some(Value::Number(number)) => number.as_f64().ok_or_else(|| {
                Error::MalformedEnvelope(format!("`{FIELD_CONFIDENCE}` is not representable"))
            })?,
            Some(other) => {
                return Err(Error::MalformedEnvelope(format!(
                    "`{FIELD_CONFIDENCE}` must be a number, got {}",
                    type_name(&other)
                )));
            }
            None => {
                return Err(Error::MalformedEnvelope(format!(
                    "missing field `{FIELD_CONFIDENCE}`"
                )));
            }
        };
        check_confidence(confidence)?;
        Ok(Response::prediction(correlation_id, label, confidence))
    }

    fn seal(&self, value: Value) -> Result<Envelope> {
        let bytes = serde_json::to_vec(&value).map_err(Error::Serialize)?;
        self.check_size(bytes.len())?;
        Ok(Envelope {
            bytes: Bytes::from(bytes),
        })
    }

    fn check_size(&self, size: usize) -> Result<()> {
        if size > self.max_envelope_bytes {
            return Err(Error::PayloadTooLarge {
                size,
                limit: self.max_envelope_bytes,
            });
        }
        Ok(())
    }
}

fn is_reserved_request_field(key: &str) -> bool {
    matches!(
        key,
        FIELD_PAYLOAD | FIELD_PAYLOAD_LEGACY | FIELD_CORRELATION_ID
    )
}

fn parse_object(raw: &[u8]) -> Result<Map<String, Value>> {
    let value: Value =
        serde_json::from_slice(raw).map_err(|err| Error::DecodeFailure(Box::new(err)))?;
    match value {
        Value::Object(fields) => Ok(fields),
        other => Err(Error::MalformedEnvelope(format!(
            "envelope must be a JSON object, got {}",
            type_name(&other)
        ))),
    }
}

fn take_correlation_id(fields: &mut Map<String, Value>) -> Result<Option<CorrelationId>> {
    match fields.remove(FIELD_CORRELATION_ID) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(raw)) => raw
            .parse::<CorrelationId>()
            .map(Some)
            .map_err(|err| Error::MalformedEnvelope(err.to_string())),
        Some(other) => Err(Error::MalformedEnvelope(format!(
            "`{FIELD_CORRELATION_ID}` must be a string, got {}",
            type_name(&other)
        ))),
    }
}

fn check_confidence(confidence: f64) -> Result<()> {
    if !confidence.is_finite() || !(0.0..=1.0).contains(&confidence) {
        return Err(Error::MalformedEnvelope(format!(
            "`{FIELD_CONFIDENCE}` {confidence} is outside [0, 1]"
        )));
    }
    Ok(())
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_round_trip_preserves_payload() {
        let codec = Codec::default();
        let payload: Vec<u8> = (0..=255u8).cycle().take(4096).collect();
        let envelope = codec
            .encode_request(&payload, None, Metadata::new())
            .expect("encode");
        let request = codec.decode_request(envelope.as_bytes()).expect("decode");
        assert_eq!(request.payload.as_ref(), payload.as_slice());
        assert_eq!(request.correlation_id, None);
        assert!(request.metadata.is_empty());
    }

    #[test]
    fn empty_payload_round_trips() {
        let codec = Codec::default();
        let envelope = codec
            .encode_request(b"", None, Metadata::new())
            .expect("encode");
        let request = codec.decode_request(envelope.as_bytes()).expect("decode");
        assert!(request.payload.is_empty());
    }

    #[test]
    fn request_carries_correlation_and_metadata() {
        let codec = Codec::default();
        let id = CorrelationId::new();
        let mut metadata = Metadata::new();
        metadata.insert("device_id".to_string(), Value::from("cam-7"));
        // Reserved names in metadata must not clobber the real fields.
        metadata.insert(FIELD_PAYLOAD.to_string(), Value::from("bogus"));
        let envelope = codec
            .encode_request(b"pixels", Some(id), metadata)
            .expect("encode");
        let request = codec.decode_request(envelope.as_bytes()).expect("decode");
        assert_eq!(request.payload.as_ref(), b"pixels");
        assert_eq!(request.correlation_id, Some(id));
        assert_eq!(request.metadata.get("device_id"), Some(&Value::from("cam-7")));
        assert_eq!(request.metadata.len(), 1);
    }

    #[test]
    fn request_wire_shape_uses_payload_encoded() {
        let codec = Codec::default();
        let envelope = codec
            .encode_request(&[0u8; 10], None, Metadata::new())
            .expect("encode");
        let value: Value = serde_json::from_slice(envelope.as_bytes()).expect("json");
        assert_eq!(value, serde_json::json!({ "payload_encoded": "AAAAAAAAAAAAAA==" }));
    }

    #[test]
    fn oversized_payload_is_rejected_before_encoding() {
        let codec = Codec::default();
        // 150000 raw bytes encode to exactly 200000 base64 characters.
        let payload = vec![7u8; 150_000];
        let err = codec
            .encode_request(&payload, None, Metadata::new())
            .expect_err("too large");
        match err {
            Error::PayloadTooLarge { size, limit } => {
                assert_eq!(size, 200_000);
                assert_eq!(limit, DEFAULT_MAX_ENVELOPE_BYTES);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn ceiling_counts_the_whole_envelope() {
        // {"payload_encoded":"AAAA"} is 26 bytes.
        let exact = Codec::new(26);
        exact
            .encode_request(&[0u8; 3], None, Metadata::new())
            .expect("fits exactly");
        let tight = Codec::new(25);
        let err = tight
            .encode_request(&[0u8; 3], None, Metadata::new())
            .expect_err("one byte over");
        assert!(matches!(err, Error::PayloadTooLarge { size: 26, limit: 25 }));
    }

    #[test]
    fn legacy_image_data_field_is_accepted() {
        let codec = Codec::default();
        let request = codec
            .decode_request(br#"{"image_data":"aGVsbG8="}"#)
            .expect("decode");
        assert_eq!(request.payload.as_ref(), b"hello");
    }

    #[test]
    fn request_missing_payload_is_malformed() {
        let codec = Codec::default();
        let err = codec
            .decode_request(br#"{"device_id":"cam"}"#)
            .expect_err("missing");
        assert!(matches!(err, Error::MalformedEnvelope(_)));
    }

    #[test]
    fn request_with_bad_base64_is_a_decode_failure() {
        let codec = Codec::default();
        let err = codec
            .decode_request(br#"{"payload_encoded":"not base64!"}"#)
            .expect_err("bad base64");
        assert!(matches!(err, Error::DecodeFailure(_)));
    }

    #[test]
    fn response_round_trip() {
        let codec = Codec::default();
        let id = CorrelationId::new();
        let envelope = codec
            .encode_response(&Response::prediction(Some(id), "cat", 0.91))
            .expect("encode");
        let response = codec.decode_response(envelope.as_bytes()).expect("decode");
        assert_eq!(response, Response::prediction(Some(id), "cat", 0.91));
    }

    #[test]
    fn response_accepts_prediction_alias() {
        let codec = Codec::default();
        let response = codec
            .decode_response(br#"{"prediction":"tabby","confidence":0.5}"#)
            .expect("decode");
        assert_eq!(response, Response::prediction(None, "tabby", 0.5));
    }

    #[test]
    fn response_with_string_confidence_is_malformed() {
        let codec = Codec::default();
        let err = codec
            .decode_response(br#"{"label":"cat","confidence":"high"}"#)
            .expect_err("wrong type");
        assert!(matches!(err, Error::MalformedEnvelope(_)));
    }

    #[test]
    fn response_confidence_out_of_range_is_malformed() {
        let codec = Codec::default();
        for raw in [
            &br#"{"label":"cat","confidence":1.5}"#[..],
            &br#"{"label":"cat","confidence":-0.1}"#[..],
        ] {
            let err = codec.decode_response(raw).expect_err("out of range");
            assert!(matches!(err, Error::MalformedEnvelope(_)));
        }
    }

    #[test]
    fn response_missing_label_is_malformed() {
        let codec = Codec::default();
        let err = codec
            .decode_response(br#"{"confidence":0.2}"#)
            .expect_err("missing label");
        assert!(matches!(err, Error::MalformedEnvelope(_)));
    }

    #[test]
    fn error_envelope_decodes_to_failure() {
        let codec = Codec::default();
        let response = codec
            .decode_response(br#"{"error":"Image preprocessing failed","traceback":"..."}"#)
            .expect("decode");
        assert_eq!(
            response.outcome,
            Outcome::Failure("Image preprocessing failed".to_string())
        );
    }

    #[test]
    fn non_json_response_is_a_decode_failure() {
        let codec = Codec::default();
        let err = codec.decode_response(b"\xff\xfe").expect_err("not json");
        assert!(matches!(err, Error::DecodeFailure(_)));
        let err = codec.decode_response(b"[1,2]").expect_err("not an object");
        assert!(matches!(err, Error::MalformedEnvelope(_)));
    }

    #[test]
    fn bad_correlation_id_is_malformed() {
        let codec = Codec::default();
        let err = codec
            .decode_response(br#"{"label":"cat","confidence":0.1,"correlation_id":"nope"}"#)
            .expect_err("bad id");
        assert!(matches!(err, Error::MalformedEnvelope(_)));
    }

    #[test]
    fn encode_response_rejects_invalid_confidence() {
        let codec = Codec::default();
        let err = codec
            .encode_response(&Response::prediction(None, "cat", f64::NAN))
            .expect_err("nan");
        assert!(matches!(err, Error::MalformedEnvelope(_)));
    }
}
