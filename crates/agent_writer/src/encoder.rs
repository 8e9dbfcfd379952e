use crate::error::EncodeError;
use serde::Serialize;

/// Turns one trace into an opaque payload for the transport.
///
/// Called on the serializer thread only. An error drops the trace; it is
/// never retried.
pub trait TraceEncoder<S>: Send + Sync {
    fn encode(&self, trace: &[S]) -> Result<Vec<u8>, EncodeError>;
}

/// Encodes a trace as a JSON array of spans.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonEncoder;

impl<S: Serialize> TraceEncoder<S> for JsonEncoder {
    fn encode(&self, trace: &[S]) -> Result<Vec<u8>, EncodeError> {
        serde_json::to_vec(trace).map_err(|e| EncodeError::Serialization(e.to_string()))
    }
}

impl<S, F> TraceEncoder<S> for F
where
    F: Fn(&[S]) -> Result<Vec<u8>, EncodeError> + Send + Sync,
{
    fn encode(&self, trace: &[S]) -> Result<Vec<u8>, EncodeError> {
        self(trace)
    }
}
