//! JSON message codec.
//!
//! A message is an object with two keys: a metadata map of strings and a
//! data value. Key names are configurable; the defaults are `meta` and
//! `data`. Data decoding applies coercions so that arbitrary JSON payloads
//! always yield a byte string (see [`JsonCodec::decode`]).

use std::io::BufRead;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use bridge_message::{Envelope, Metadata};
use bytes::Bytes;
use serde_json::{Map, Value};

use crate::codec::{MAX_DATA_SIZE, MessageCodec};
use crate::error::{CodecError, CodecResult};

/// Hard limit on messages decoded from a single stream.
pub const MAX_STREAM_MESSAGES: usize = 100_000;
/// Hard limit on the wire size of a single streamed message.
pub const MAX_STREAM_MESSAGE_SIZE: usize = 1024 * 1024;

/// Maximum nesting depth of a decoded document.
const MAX_DEPTH: usize = 50;
/// Maximum length of a decoded array.
const MAX_ARRAY_LEN: usize = 10_000;

/// JSON object codec.
#[derive(Debug, Clone)]
pub struct JsonCodec {
    meta_key: String,
    data_key: String,
}

impl Default for JsonCodec {
    fn default() -> Self {
        Self {
            meta_key: "meta".to_string(),
            data_key: "data".to_string(),
        }
    }
}

impl JsonCodec {
    /// Create a codec with custom metadata and data key names.
    #[must_use]
    pub fn with_keys(meta_key: impl Into<String>, data_key: impl Into<String>) -> Self {
        Self {
            meta_key: meta_key.into(),
            data_key: data_key.into(),
        }
    }

    fn envelope_from_value(&self, value: &Value) -> CodecResult<Envelope> {
        validate_structure(value)?;

        let obj = value
            .as_object()
            .ok_or_else(|| CodecError::Decode("message must be a JSON object".to_string()))?;

        let metadata = match obj.get(&self.meta_key) {
            None | Some(Value::Null) => Metadata::new(),
            Some(Value::Object(m)) => metadata_from_object(m)?,
            Some(_) => return Err(CodecError::Decode("metadata must be string map".to_string())),
        };

        let data = match obj.get(&self.data_key) {
            None => Bytes::new(),
            Some(v) => value_to_data(v)?,
        };
        if data.len() > MAX_DATA_SIZE {
            return Err(CodecError::MessageTooLarge {
                size: data.len(),
                limit: MAX_DATA_SIZE,
            });
        }

        Ok(Envelope::new(metadata, data))
    }
}

impl MessageCodec for JsonCodec {
    fn encode_value(&self, value: &Value) -> CodecResult<Bytes> {
        serde_json::to_vec(value)
            .map(Bytes::from)
            .map_err(|e| CodecError::Encode(e.to_string()))
    }

    fn encode(&self, metadata: &Metadata, data: &[u8]) -> CodecResult<Bytes> {
        let mut meta = Map::new();
        for (k, v) in metadata.iter() {
            meta.insert(k.to_string(), Value::String(v.to_string()));
        }

        let data_value = match std::str::from_utf8(data) {
            Ok(text) => Value::String(text.to_string()),
            Err(_) => Value::String(BASE64.encode(data)),
        };

        let mut obj = Map::new();
        obj.insert(self.meta_key.clone(), Value::Object(meta));
        obj.insert(self.data_key.clone(), data_value);

        serde_json::to_vec(&Value::Object(obj))
            .map(Bytes::from)
            .map_err(|e| CodecError::Encode(e.to_string()))
    }

    fn decode(&self, bytes: &[u8]) -> CodecResult<Envelope> {
        // Size validation precedes parsing.
        if bytes.len() > MAX_DATA_SIZE {
            return Err(CodecError::MessageTooLarge {
                size: bytes.len(),
                limit: MAX_DATA_SIZE,
            });
        }
        let value: Value =
            serde_json::from_slice(bytes).map_err(|e| CodecError::Decode(e.to_string()))?;
        self.envelope_from_value(&value)
    }

    fn decode_stream<'r>(
        &self,
        reader: Box<dyn BufRead + Send + 'r>,
    ) -> Box<dyn Iterator<Item = CodecResult<Envelope>> + Send + 'r> {
        Box::new(JsonStream {
            codec: self.clone(),
            items: serde_json::Deserializer::from_reader(reader).into_iter(),
            count: 0,
            last_offset: 0,
            done: false,
        })
    }
}

/// Lazy decoder over sequential whitespace-separated JSON values.
struct JsonStream<'r> {
    codec: JsonCodec,
    items: serde_json::StreamDeserializer<
        'static,
        serde_json::de::IoRead<Box<dyn BufRead + Send + 'r>>,
        Value,
    >,
    count: usize,
    last_offset: usize,
    done: bool,
}

impl Iterator for JsonStream<'_> {
    type Item = CodecResult<Envelope>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        if self.count >= MAX_STREAM_MESSAGES {
            self.done = true;
            return Some(Err(CodecError::TooManyMessages {
                limit: MAX_STREAM_MESSAGES,
            }));
        }

        let value = match self.items.next() {
            None => {
                self.done = true;
                return None;
            },
            Some(Err(e)) => {
                // A parse failure poisons the rest of the byte stream.
                self.done = true;
                return Some(Err(CodecError::Decode(e.to_string())));
            },
            Some(Ok(v)) => v,
        };

        let offset = self.items.byte_offset();
        let size = offset.saturating_sub(self.last_offset);
        self.last_offset = offset;
        self.count += 1;

        if size > MAX_STREAM_MESSAGE_SIZE {
            return Some(Err(CodecError::MessageTooLarge {
                size,
                limit: MAX_STREAM_MESSAGE_SIZE,
            }));
        }

        Some(self.codec.envelope_from_value(&value))
    }
}

fn metadata_from_object(m: &Map<String, Value>) -> CodecResult<Metadata> {
    let mut metadata = Metadata::new();
    for (k, v) in m {
        let Value::String(s) = v else {
            return Err(CodecError::Decode("metadata must be string map".to_string()));
        };
        metadata.insert(k.clone(), s.clone())?;
    }
    Ok(metadata)
}

/// Coerce a JSON data value into bytes, in priority order: nested
/// object/array re-encoded as JSON, base64-decodable string decoded,
/// other string as raw UTF-8, number/boolean as text, null as empty.
fn value_to_data(value: &Value) -> CodecResult<Bytes> {
    match value {
        Value::Object(_) | Value::Array(_) => serde_json::to_vec(value)
            .map(Bytes::from)
            .map_err(|e| CodecError::Decode(e.to_string())),
        Value::String(s) => match BASE64.decode(s) {
            Ok(decoded) => Ok(Bytes::from(decoded)),
            Err(_) => Ok(Bytes::from(s.clone().into_bytes())),
        },
        Value::Number(n) => Ok(Bytes::from(n.to_string().into_bytes())),
        Value::Bool(b) => Ok(Bytes::from(b.to_string().into_bytes())),
        Value::Null => Ok(Bytes::new()),
    }
}

/// Structural validation after parse: nesting depth and array length.
fn validate_structure(value: &Value) -> CodecResult<()> {
    fn walk(value: &Value, depth: usize) -> CodecResult<()> {
        if depth > MAX_DEPTH {
            return Err(CodecError::DepthExceeded { limit: MAX_DEPTH });
        }
        match value {
            Value::Array(items) => {
                if items.len() > MAX_ARRAY_LEN {
                    return Err(CodecError::ArrayTooLong {
                        len: items.len(),
                        limit: MAX_ARRAY_LEN,
                    });
                }
                for item in items {
                    walk(item, depth + 1)?;
                }
                Ok(())
            },
            Value::Object(m) => {
                for v in m.values() {
                    walk(v, depth + 1)?;
                }
                Ok(())
            },
            _ => Ok(()),
        }
    }
    walk(value, 1)
}
