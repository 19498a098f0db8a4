//! Wire codec seam.
//!
//! Engines never serialize values themselves; they hand them to a
//! [`Formatter`]. The formatter also names the MIME type used for the HTTP
//! `Content-Type`/`Accept` headers and decides whether socket frames are sent
//! as binary or text.

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use futures::stream::BoxStream;
use serde_json::Value;

use crate::errors::{Error, Result};

/// Encodes values to bytes and back.
#[async_trait]
pub trait Formatter: Send + Sync {
    /// MIME type of the encoding.
    fn content_type(&self) -> &'static str;

    /// Whether encoded values are binary (otherwise UTF-8 text).
    fn is_binary(&self) -> bool {
        false
    }

    /// Encode a value.
    fn encode(&self, value: &Value) -> Result<Vec<u8>>;

    /// Decode a complete buffer.
    fn decode(&self, bytes: &[u8]) -> Result<Value>;

    /// Decode a chunked body.
    ///
    /// The default collects every chunk and decodes the result; formats with
    /// an incremental parser override it.
    async fn decode_stream(&self, mut chunks: BoxStream<'static, Result<Bytes>>) -> Result<Value> {
        let mut buffer = Vec::new();
        while let Some(chunk) = chunks.next().await {
            buffer.extend_from_slice(&chunk?);
        }
        self.decode(&buffer)
    }
}

/// JSON formatter backed by `serde_json`.
#[derive(Clone, Copy, Debug, Default)]
pub struct JsonFormatter;

#[async_trait]
impl Formatter for JsonFormatter {
    fn content_type(&self) -> &'static str {
        "application/json"
    }

    fn encode(&self, value: &Value) -> Result<Vec<u8>> {
        serde_json::to_vec(value).map_err(Error::from)
    }

    fn decode(&self, bytes: &[u8]) -> Result<Value> {
        serde_json::from_slice(bytes).map_err(Error::from)
    }

    async fn decode_stream(&self, mut chunks: BoxStream<'static, Result<Bytes>>) -> Result<Value> {
        let mut buffer = Vec::new();
        while let Some(chunk) = chunks.next().await {
            buffer.extend_from_slice(&chunk?);
        }
        let mut de = serde_json::Deserializer::from_slice(&buffer);
        let value: Value = serde::Deserialize::deserialize(&mut de)?;
        de.end()?;
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn json_roundtrip() {
        let f = JsonFormatter;
        let bytes = f.encode(&json!({"a": 1})).unwrap();
        assert_eq!(f.decode(&bytes).unwrap(), json!({"a": 1}));
        assert_eq!(f.content_type(), "application/json");
        assert!(!f.is_binary());
    }

    #[test]
    fn decode_garbage_is_codec_error() {
        let err = JsonFormatter.decode(b"{nope").unwrap_err();
        assert!(matches!(err, Error::Codec(_)));
    }

    #[tokio::test]
    async fn stream_decode_joins_chunks() {
        let chunks = futures::stream::iter(vec![
            Ok(Bytes::from_static(b"{\"result\":")),
            Ok(Bytes::from_static(b" [1, 2]}")),
        ])
        .boxed();
        let value = JsonFormatter.decode_stream(chunks).await.unwrap();
        assert_eq!(value, json!({"result": [1, 2]}));
    }

    #[tokio::test]
    async fn stream_decode_propagates_chunk_errors() {
        let chunks = futures::stream::iter(vec![
            Ok(Bytes::from_static(b"{")),
            Err(Error::aborted("connection reset")),
        ])
        .boxed();
        let err = JsonFormatter.decode_stream(chunks).await.unwrap_err();
        assert!(matches!(err, Error::Aborted { .. }));
    }
}
