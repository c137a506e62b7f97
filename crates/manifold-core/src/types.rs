//! JSON-RPC envelope types and the method-conditional codec.
//!
//! The multiplexer forwards request and response bodies verbatim, so the
//! engine-API wire schema is treated as opaque JSON except for the handful
//! of fields the dispatcher has to inspect: the election markers
//! (`timestamp`, `slot`) on the request side and the payload status on the
//! response side. Decoding is a tagged sum over the method name — the
//! recognized methods get typed params, everything else keeps its raw
//! values untouched.
//!
//! # Recognized methods
//!
//! | method prefix                 | params shape                            |
//! |-------------------------------|-----------------------------------------|
//! | `engine_newPayload*`          | `[ExecutionPayload]`                    |
//! | `engine_forkchoiceUpdated*`   | `[ForkchoiceState, PayloadAttributes?]` |
//! | `builder_payloadAttributes`   | `[BuilderPayloadAttributes]`            |
//! | any other                     | raw values, undecoded                   |

use serde::{
    ser::{SerializeSeq, SerializeStruct},
    Deserialize, Serialize, Serializer,
};
use serde_json::Value;
use thiserror::Error;

/// JSON-RPC protocol version string.
pub const JSONRPC_VERSION: &str = "2.0";

/// Prefix shared by every engine-API method.
pub const ENGINE_METHOD_PREFIX: &str = "engine_";

/// Prefix of the versioned `engine_newPayload` methods.
pub const NEW_PAYLOAD_METHOD_PREFIX: &str = "engine_newPayload";

/// Prefix of the versioned `engine_forkchoiceUpdated` methods.
pub const FORKCHOICE_METHOD_PREFIX: &str = "engine_forkchoiceUpdated";

/// Method a beacon client uses to push proposal attributes to builders.
pub const BUILDER_ATTRIBUTES_METHOD: &str = "builder_payloadAttributes";

/// Returns whether a method belongs to the engine API namespace.
#[must_use]
pub fn is_engine_method(method: &str) -> bool {
    method.starts_with(ENGINE_METHOD_PREFIX)
}

/// Returns whether a method is a versioned `engine_newPayload` call.
#[must_use]
pub fn is_new_payload_method(method: &str) -> bool {
    method.starts_with(NEW_PAYLOAD_METHOD_PREFIX)
}

/// Returns whether a method is a versioned `engine_forkchoiceUpdated` call.
#[must_use]
pub fn is_forkchoice_method(method: &str) -> bool {
    method.starts_with(FORKCHOICE_METHOD_PREFIX)
}

/// Errors produced while decoding an inbound JSON-RPC body.
///
/// Unknown methods never fail decoding; only malformed JSON and
/// method-specific payload violations do.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("malformed JSON-RPC body: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("{method} expects at least {expected} parameter(s), got {got}")]
    Arity {
        method: String,
        expected: usize,
        got: usize,
    },
}

/// Serde adapter for the engine API's 0x-prefixed hex quantities.
pub mod quantity {
    use serde::{de, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &u64, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&format!("0x{value:x}"))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u64, D::Error> {
        let raw = String::deserialize(deserializer)?;
        let digits = raw
            .strip_prefix("0x")
            .ok_or_else(|| de::Error::custom("quantity is missing the 0x prefix"))?;
        u64::from_str_radix(digits, 16).map_err(de::Error::custom)
    }
}

/// The first parameter of `engine_newPayload*`.
///
/// Only `timestamp` is probed; every other field rides along in `extra`
/// so re-encoding loses nothing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionPayload {
    #[serde(with = "quantity")]
    pub timestamp: u64,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

/// The first parameter of `engine_forkchoiceUpdated*`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ForkchoiceState {
    pub head_block_hash: String,
    pub safe_block_hash: String,
    pub finalized_block_hash: String,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

/// The optional second parameter of `engine_forkchoiceUpdated*`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PayloadAttributes {
    #[serde(with = "quantity")]
    pub timestamp: u64,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

/// The first parameter of `builder_payloadAttributes`.
///
/// The slot is a plain JSON number; this is a builder-side extension, not
/// an engine hex quantity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuilderPayloadAttributes {
    pub slot: u64,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

/// Request params, typed for the recognized methods and raw otherwise.
///
/// Insertion order within `params` is preserved: typed variants remember
/// their fixed positions, the opaque variant keeps the original `Vec`.
#[derive(Debug, Clone, PartialEq)]
pub enum RequestParams {
    NewPayload(Box<ExecutionPayload>),
    ForkchoiceUpdated(Box<ForkchoiceState>, Option<PayloadAttributes>),
    BuilderAttributes(Box<BuilderPayloadAttributes>),
    Opaque(Vec<Value>),
}

impl RequestParams {
    fn decode(method: &str, params: Vec<Value>) -> Result<Self, CodecError> {
        let got = params.len();
        let arity = |expected: usize| CodecError::Arity {
            method: method.to_owned(),
            expected,
            got,
        };

        if is_new_payload_method(method) {
            let payload = params.into_iter().next().ok_or_else(|| arity(1))?;
            Ok(Self::NewPayload(Box::new(serde_json::from_value(payload)?)))
        } else if is_forkchoice_method(method) {
            let mut params = params.into_iter();
            let state = params.next().ok_or_else(|| arity(1))?;
            let state: ForkchoiceState = serde_json::from_value(state)?;
            // A JSON null second parameter means "no attributes", not an error.
            let attributes = match params.next() {
                None | Some(Value::Null) => None,
                Some(value) => Some(serde_json::from_value(value)?),
            };
            Ok(Self::ForkchoiceUpdated(Box::new(state), attributes))
        } else if method == BUILDER_ATTRIBUTES_METHOD {
            let attributes = params.into_iter().next().ok_or_else(|| arity(1))?;
            Ok(Self::BuilderAttributes(Box::new(serde_json::from_value(
                attributes,
            )?)))
        } else {
            Ok(Self::Opaque(params))
        }
    }
}

impl Serialize for RequestParams {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::NewPayload(payload) => {
                let mut seq = serializer.serialize_seq(Some(1))?;
                seq.serialize_element(payload)?;
                seq.end()
            }
            Self::ForkchoiceUpdated(state, attributes) => {
                let mut seq = serializer.serialize_seq(Some(2))?;
                seq.serialize_element(state)?;
                seq.serialize_element(attributes)?;
                seq.end()
            }
            Self::BuilderAttributes(attributes) => {
                let mut seq = serializer.serialize_seq(Some(1))?;
                seq.serialize_element(attributes)?;
                seq.end()
            }
            Self::Opaque(values) => values.serialize(serializer),
        }
    }
}

/// A decoded JSON-RPC request envelope.
#[derive(Debug, Clone, PartialEq)]
pub struct RpcRequest {
    pub jsonrpc: String,
    pub method: String,
    pub id: i64,
    pub params: RequestParams,
}

impl RpcRequest {
    /// Decodes a request body, eagerly typing the params of recognized
    /// methods.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::Malformed`] for invalid JSON or a recognized
    /// method whose payload fails to decode, and [`CodecError::Arity`] for
    /// a recognized method with too few parameters.
    pub fn decode(body: &[u8]) -> Result<Self, CodecError> {
        #[derive(Deserialize)]
        struct Envelope {
            #[serde(default)]
            jsonrpc: String,
            #[serde(default)]
            method: String,
            #[serde(default)]
            id: i64,
            #[serde(default)]
            params: Vec<Value>,
        }

        let envelope: Envelope = serde_json::from_slice(body)?;
        let params = RequestParams::decode(&envelope.method, envelope.params)?;
        Ok(Self {
            jsonrpc: envelope.jsonrpc,
            method: envelope.method,
            id: envelope.id,
            params,
        })
    }

    /// Encodes the request back to JSON bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn encode(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }

    /// The timestamp election marker, when the method carries one.
    #[must_use]
    pub fn timestamp_marker(&self) -> Option<u64> {
        match &self.params {
            RequestParams::NewPayload(payload) => Some(payload.timestamp),
            RequestParams::ForkchoiceUpdated(_, Some(attributes)) => Some(attributes.timestamp),
            _ => None,
        }
    }

    /// The slot election marker, when the method carries one.
    #[must_use]
    pub fn slot_marker(&self) -> Option<u64> {
        match &self.params {
            RequestParams::BuilderAttributes(attributes) => Some(attributes.slot),
            _ => None,
        }
    }
}

impl Serialize for RpcRequest {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut state = serializer.serialize_struct("RpcRequest", 4)?;
        state.serialize_field("jsonrpc", &self.jsonrpc)?;
        state.serialize_field("method", &self.method)?;
        state.serialize_field("params", &self.params)?;
        state.serialize_field("id", &self.id)?;
        state.end()
    }
}

/// A JSON-RPC response envelope with a method-conditional result type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcResponse<T = Value> {
    #[serde(default)]
    pub jsonrpc: String,
    #[serde(default)]
    pub id: i64,
    pub result: T,
}

/// The result of `engine_newPayload*`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PayloadStatus {
    pub status: String,
    #[serde(default)]
    pub latest_valid_hash: Option<String>,
    #[serde(default)]
    pub validation_error: Option<String>,
}

/// The result of `engine_forkchoiceUpdated*`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ForkchoiceResult {
    pub payload_status: PayloadStatus,
    #[serde(default)]
    pub payload_id: Option<String>,
}

/// Extracts the payload status string from a response body, for the
/// methods that carry one.
///
/// Returns `Ok(None)` for methods without a probed status.
///
/// # Errors
///
/// Returns [`CodecError::Malformed`] when a probed response fails to
/// decode.
pub fn extract_status(method: &str, body: &[u8]) -> Result<Option<String>, CodecError> {
    if is_new_payload_method(method) {
        let response: RpcResponse<PayloadStatus> = serde_json::from_slice(body)?;
        Ok(Some(response.result.status))
    } else if is_forkchoice_method(method) {
        let response: RpcResponse<ForkchoiceResult> = serde_json::from_slice(body)?;
        Ok(Some(response.result.payload_status.status))
    } else {
        Ok(None)
    }
}
