//! CBOR message codec.
//!
//! Same logical shape as the JSON codec (a map with a metadata key and a
//! data key), with data carried as a native CBOR byte string so round
//! trips are bit-exact. Concatenated CBOR items form a stream.

use std::io::BufRead;

use bridge_message::{Envelope, Metadata};
use bytes::Bytes;
use ciborium::Value;

use crate::codec::{MAX_DATA_SIZE, MessageCodec};
use crate::error::{CodecError, CodecResult};

/// CBOR map codec.
#[derive(Debug, Clone)]
pub struct CborCodec {
    meta_key: String,
    data_key: String,
}

impl Default for CborCodec {
    fn default() -> Self {
        Self {
            meta_key: "meta".to_string(),
            data_key: "data".to_string(),
        }
    }
}

impl CborCodec {
    /// Create a codec with custom metadata and data key names.
    #[must_use]
    pub fn with_keys(meta_key: impl Into<String>, data_key: impl Into<String>) -> Self {
        Self {
            meta_key: meta_key.into(),
            data_key: data_key.into(),
        }
    }

    fn envelope_from_value(&self, value: &Value) -> CodecResult<Envelope> {
        let Value::Map(entries) = value else {
            return Err(CodecError::Decode("message must be a CBOR map".to_string()));
        };

        let mut metadata = Metadata::new();
        let mut data = Bytes::new();

        for (key, val) in entries {
            let Value::Text(key) = key else {
                return Err(CodecError::Decode("map keys must be text".to_string()));
            };
            if *key == self.meta_key {
                metadata = metadata_from_value(val)?;
            } else if *key == self.data_key {
                data = value_to_data(val)?;
            }
        }

        if data.len() > MAX_DATA_SIZE {
            return Err(CodecError::MessageTooLarge {
                size: data.len(),
                limit: MAX_DATA_SIZE,
            });
        }

        Ok(Envelope::new(metadata, data))
    }
}

impl MessageCodec for CborCodec {
    fn encode_value(&self, value: &serde_json::Value) -> CodecResult<Bytes> {
        let mut out = Vec::new();
        ciborium::ser::into_writer(value, &mut out)
            .map_err(|e| CodecError::Encode(e.to_string()))?;
        Ok(Bytes::from(out))
    }

    fn encode(&self, metadata: &Metadata, data: &[u8]) -> CodecResult<Bytes> {
        let meta_entries: Vec<(Value, Value)> = metadata
            .iter()
            .map(|(k, v)| (Value::Text(k.to_string()), Value::Text(v.to_string())))
            .collect();

        let doc = Value::Map(vec![
            (
                Value::Text(self.meta_key.clone()),
                Value::Map(meta_entries),
            ),
            (
                Value::Text(self.data_key.clone()),
                Value::Bytes(data.to_vec()),
            ),
        ]);

        let mut out = Vec::new();
        ciborium::ser::into_writer(&doc, &mut out).map_err(|e| CodecError::Encode(e.to_string()))?;
        Ok(Bytes::from(out))
    }

    fn decode(&self, bytes: &[u8]) -> CodecResult<Envelope> {
        if bytes.len() > MAX_DATA_SIZE {
            return Err(CodecError::MessageTooLarge {
                size: bytes.len(),
                limit: MAX_DATA_SIZE,
            });
        }
        let value: Value =
            ciborium::de::from_reader(bytes).map_err(|e| CodecError::Decode(e.to_string()))?;
        self.envelope_from_value(&value)
    }

    fn decode_stream<'r>(
        &self,
        reader: Box<dyn BufRead + Send + 'r>,
    ) -> Box<dyn Iterator<Item = CodecResult<Envelope>> + Send + 'r> {
        Box::new(CborStream {
            codec: self.clone(),
            reader,
            done: false,
        })
    }
}

/// Lazy decoder over concatenated CBOR items.
struct CborStream<'r> {
    codec: CborCodec,
    reader: Box<dyn BufRead + Send + 'r>,
    done: bool,
}

impl Iterator for CborStream<'_> {
    type Item = CodecResult<Envelope>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.reader.fill_buf() {
            Ok(buf) if buf.is_empty() => {
                self.done = true;
                return None;
            },
            Ok(_) => {},
            Err(e) => {
                self.done = true;
                return Some(Err(CodecError::Io(e)));
            },
        }
        match ciborium::de::from_reader::<Value, _>(&mut self.reader) {
            Ok(value) => Some(self.codec.envelope_from_value(&value)),
            Err(e) => {
                self.done = true;
                Some(Err(CodecError::Decode(e.to_string())))
            },
        }
    }
}

fn metadata_from_value(value: &Value) -> CodecResult<Metadata> {
    let Value::Map(entries) = value else {
        return Err(CodecError::Decode("metadata must be string map".to_string()));
    };
    let mut metadata = Metadata::new();
    for (k, v) in entries {
        let (Value::Text(k), Value::Text(v)) = (k, v) else {
            return Err(CodecError::Decode("metadata must be string map".to_string()));
        };
        metadata.insert(k.clone(), v.clone())?;
    }
    Ok(metadata)
}

fn value_to_data(value: &Value) -> CodecResult<Bytes> {
    match value {
        Value::Bytes(b) => Ok(Bytes::from(b.clone())),
        Value::Text(s) => Ok(Bytes::from(s.clone().into_bytes())),
        Value::Integer(i) => Ok(Bytes::from(i128::from(*i).to_string().into_bytes())),
        Value::Float(f) => Ok(Bytes::from(f.to_string().into_bytes())),
        Value::Bool(b) => Ok(Bytes::from(b.to_string().into_bytes())),
        Value::Null => Ok(Bytes::new()),
        other @ (Value::Array(_) | Value::Map(_) | Value::Tag(..)) => {
            let mut out = Vec::new();
            ciborium::ser::into_writer(other, &mut out)
                .map_err(|e| CodecError::Decode(e.to_string()))?;
            Ok(Bytes::from(out))
        },
        _ => Err(CodecError::Unsupported("unrecognized CBOR value".to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip_bytes() {
        let codec = CborCodec::default();
        let metadata = Metadata::try_from_pairs([("id", "7")]).unwrap();
        let data = [0u8, 1, 2, 254, 255];

        let encoded = codec.encode(&metadata, &data).unwrap();
        let envelope = codec.decode(&encoded).unwrap();
        assert_eq!(envelope.metadata.get("id"), Some("7"));
        assert_eq!(envelope.data.as_ref(), &data);
    }

    #[test]
    fn test_concatenated_stream() {
        let codec = CborCodec::default();
        let mut stream = Vec::new();
        for i in 0..3 {
            let metadata = Metadata::try_from_pairs([("n", i.to_string().as_str())]).unwrap();
            stream.extend_from_slice(&codec.encode(&metadata, b"payload").unwrap());
        }

        let items: Vec<_> = codec.decode_stream(Box::new(stream.as_slice())).collect();
        assert_eq!(items.len(), 3);
        for (i, item) in items.iter().enumerate() {
            let envelope = item.as_ref().unwrap();
            assert_eq!(envelope.metadata.get("n"), Some(i.to_string().as_str()));
            assert_eq!(envelope.data, Bytes::from_static(b"payload"));
        }
    }

    #[test]
    fn test_metadata_must_be_string_map() {
        let codec = CborCodec::default();
        let doc = Value::Map(vec![(
            Value::Text("meta".to_string()),
            Value::Map(vec![(Value::Text("k".to_string()), Value::Integer(1.into()))]),
        )]);
        let mut bytes = Vec::new();
        ciborium::ser::into_writer(&doc, &mut bytes).unwrap();
        let err = codec.decode(&bytes).unwrap_err();
        assert!(err.to_string().contains("metadata must be string map"));
    }

    #[test]
    fn test_text_data_coerced_to_utf8() {
        let codec = CborCodec::default();
        let doc = Value::Map(vec![(
            Value::Text("data".to_string()),
            Value::Text("hello".to_string()),
        )]);
        let mut bytes = Vec::new();
        ciborium::ser::into_writer(&doc, &mut bytes).unwrap();
        let envelope = codec.decode(&bytes).unwrap();
        assert_eq!(envelope.data, Bytes::from_static(b"hello"));
    }
}
