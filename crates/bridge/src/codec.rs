//! Binary payload codec.
//!
//! Every structured payload and every success result crossing the dispatcher
//! is a `bincode` document produced with the same options: varint integers,
//! trailing bytes rejected, and a size limit.

use crate::value::{EngineValue, FunctionRef};
use bincode::Options;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Default ceiling for a single encoded payload.
pub const DEFAULT_PAYLOAD_LIMIT: u64 = 16 * 1024 * 1024;

/// First byte of an `evalScript` payload carrying an encoded [`EvalRequest`].
/// A script cannot start with NUL, so plain sources never collide with it.
pub const EVAL_REQUEST_TAG: u8 = 0;

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("malformed payload: {0}")]
    Malformed(String),
    #[error("payload is not valid UTF-8: {0}")]
    Utf8(#[from] std::string::FromUtf8Error),
    #[error("payload encoding failed: {0}")]
    Encode(String),
}

/// `evalScript` payload. Without options it travels as raw UTF-8 source.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvalRequest {
    pub source: String,
    /// Name shown in stack traces.
    pub file_name: Option<String>,
    /// Evaluate as an ES module; the result is its namespace object.
    pub module: bool,
    /// Overrides the engine's configured strictness for this call.
    pub strict: Option<bool>,
}

impl EvalRequest {
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            ..Default::default()
        }
    }

    pub fn has_options(&self) -> bool {
        self.file_name.is_some() || self.module || self.strict.is_some()
    }
}

/// `callFunction` payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallRequest {
    pub function: FunctionRef,
    #[serde(default)]
    pub args: Vec<EngineValue>,
}

/// `setGlobal` payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GlobalAssignment {
    pub name: String,
    pub value: EngineValue,
}

/// Optional `createEngine` payload. `None` keeps the configured default.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineOptions {
    pub memory_limit_bytes: Option<u64>,
    pub max_stack_size_bytes: Option<u64>,
    pub execution_timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, Copy)]
pub struct Codec {
    limit: u64,
}

impl Default for Codec {
    fn default() -> Self {
        Self::new(DEFAULT_PAYLOAD_LIMIT)
    }
}

impl Codec {
    pub fn new(limit: u64) -> Self {
        Self { limit }
    }

    pub fn limit(&self) -> u64 {
        self.limit
    }

    fn options(&self) -> impl Options {
        bincode::DefaultOptions::new()
            .with_limit(self.limit)
            .reject_trailing_bytes()
    }

    pub fn encode<T: Serialize + ?Sized>(&self, value: &T) -> Result<Vec<u8>, CodecError> {
        self.options()
            .serialize(value)
            .map_err(|e| CodecError::Encode(e.to_string()))
    }

    pub fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T, CodecError> {
        self.options()
            .deserialize(bytes)
            .map_err(|e| CodecError::Malformed(e.to_string()))
    }

    pub fn encode_value(&self, value: &EngineValue) -> Result<Vec<u8>, CodecError> {
        self.encode(value)
    }

    pub fn decode_value(&self, bytes: &[u8]) -> Result<EngineValue, CodecError> {
        self.decode(bytes)
    }

    /// Raw source when there are no options, else the tag byte and a bincode document.
    pub fn encode_eval(&self, request: &EvalRequest) -> Result<Vec<u8>, CodecError> {
        if !request.has_options() {
            return Ok(request.source.as_bytes().to_vec());
        }
        let mut bytes = vec![EVAL_REQUEST_TAG];
        bytes.extend(self.encode(request)?);
        Ok(bytes)
    }

    pub fn decode_eval(&self, bytes: &[u8]) -> Result<EvalRequest, CodecError> {
        match bytes.split_first() {
            Some((&EVAL_REQUEST_TAG, rest)) => self.decode(rest),
            _ => Ok(EvalRequest::new(decode_text(bytes)?)),
        }
    }

    /// Decode `createEngine` options; an empty payload means defaults.
    pub fn decode_options(&self, bytes: &[u8]) -> Result<EngineOptions, CodecError> {
        if bytes.is_empty() {
            return Ok(EngineOptions::default());
        }
        self.decode(bytes)
    }
}

/// Script sources and global names travel as raw UTF-8.
pub fn decode_text(bytes: &[u8]) -> Result<String, CodecError> {
    Ok(String::from_utf8(bytes.to_vec())?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_value_survives_codec() {
        let codec = Codec::default();
        let v = EngineValue::Array(vec![
            EngineValue::Int(-5),
            EngineValue::Float(0.25),
            EngineValue::BigInt("-123456789012345678901234567890".into()),
            EngineValue::Undefined,
        ]);
        let bytes = codec.encode_value(&v).unwrap();
        assert_eq!(codec.decode_value(&bytes).unwrap(), v);
    }

    #[test]
    fn test_trailing_bytes_rejected() {
        let codec = Codec::default();
        let mut bytes = codec.encode_value(&EngineValue::Bool(true)).unwrap();
        bytes.push(0);
        assert!(matches!(
            codec.decode_value(&bytes),
            Err(CodecError::Malformed(_))
        ));
    }

    #[test]
    fn test_garbage_is_malformed() {
        let codec = Codec::default();
        assert!(codec.decode::<CallRequest>(&[0xff, 0xff, 0xff]).is_err());
        assert!(codec.decode_value(&[]).is_err());
    }

    #[test]
    fn test_limit_enforced() {
        let codec = Codec::new(16);
        let big = EngineValue::String("x".repeat(64));
        assert!(codec.encode_value(&big).is_err());
    }

    #[test]
    fn test_empty_options_payload_means_defaults() {
        let codec = Codec::default();
        assert_eq!(codec.decode_options(&[]).unwrap(), EngineOptions::default());
        let opts = EngineOptions {
            memory_limit_bytes: Some(1 << 20),
            ..Default::default()
        };
        let bytes = codec.encode(&opts).unwrap();
        assert_eq!(codec.decode_options(&bytes).unwrap(), opts);
    }

    #[test]
    fn test_eval_payload_forms() {
        let codec = Codec::default();
        let plain = EvalRequest::new("1 + 1");
        assert_eq!(codec.encode_eval(&plain).unwrap(), b"1 + 1".to_vec());
        assert_eq!(codec.decode_eval(b"1 + 1").unwrap(), plain);
        assert_eq!(codec.decode_eval(&[]).unwrap(), EvalRequest::new(""));

        let named = EvalRequest {
            file_name: Some("main.js".into()),
            strict: Some(true),
            ..EvalRequest::new("x")
        };
        let bytes = codec.encode_eval(&named).unwrap();
        assert_eq!(bytes[0], EVAL_REQUEST_TAG);
        assert_eq!(codec.decode_eval(&bytes).unwrap(), named);
        assert!(codec.decode_eval(&[EVAL_REQUEST_TAG, 0xff]).is_err());
    }

    #[test]
    fn test_decode_text() {
        assert_eq!(decode_text(b"1+1").unwrap(), "1+1");
        assert!(matches!(decode_text(&[0xc3, 0x28]), Err(CodecError::Utf8(_))));
    }
}
