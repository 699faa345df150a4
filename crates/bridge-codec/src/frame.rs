//! The CLI-frame binary format.
//!
//! A stream is a concatenation of frames; each frame carries one
//! `(metadata, data)` pair. The layout is length-prefixed throughout so
//! arbitrary binary payloads need no escaping and framing stays
//! unambiguous:
//!
//! ```text
//! magic   : 4 bytes, 0x45 0x42 0x46 0x31 ("EBF1")
//! meta    : u32 BE entry count
//!           per entry: u32 BE key length, key bytes (UTF-8),
//!                      u32 BE value length, value bytes (UTF-8)
//! data    : u64 BE byte count, payload bytes
//! ```
//!
//! No trailing delimiter; frames concatenate directly. These constants are
//! fixed once and must never change: external processes interoperate with
//! them bit-exactly.

use std::io::{BufRead, ErrorKind, Read};

use bridge_message::{
    Envelope, MAX_METADATA_KEY_LEN, MAX_METADATA_VALUE_LEN, Metadata,
};
use bytes::Bytes;

use crate::codec::{MAX_DATA_SIZE, MessageCodec};
use crate::error::{CodecError, CodecResult};

/// The fixed frame marker.
pub const FRAME_MAGIC: [u8; 4] = *b"EBF1";

/// Encode one frame.
///
/// # Errors
///
/// Returns [`CodecError::Oversize`] when a key or value exceeds the u32
/// length field.
pub fn encode_frame(metadata: &Metadata, data: &[u8]) -> CodecResult<Bytes> {
    let mut out = Vec::with_capacity(FRAME_MAGIC.len() + 12 + data.len());
    out.extend_from_slice(&FRAME_MAGIC);

    let count = u32::try_from(metadata.len()).map_err(|_| CodecError::Oversize {
        what: "metadata entry count",
        len: metadata.len(),
    })?;
    out.extend_from_slice(&count.to_be_bytes());

    for (key, value) in metadata.iter() {
        write_string(&mut out, key, "metadata key")?;
        write_string(&mut out, value, "metadata value")?;
    }

    out.extend_from_slice(&(data.len() as u64).to_be_bytes());
    out.extend_from_slice(data);
    Ok(Bytes::from(out))
}

fn write_string(out: &mut Vec<u8>, s: &str, what: &'static str) -> CodecResult<()> {
    let len = u32::try_from(s.len()).map_err(|_| CodecError::Oversize {
        what,
        len: s.len(),
    })?;
    out.extend_from_slice(&len.to_be_bytes());
    out.extend_from_slice(s.as_bytes());
    Ok(())
}

/// Reads frames off a byte stream.
///
/// Clean end-of-stream before a frame starts ends the sequence silently;
/// truncation anywhere inside a frame is [`CodecError::UnexpectedEof`].
pub struct FrameDecoder<R> {
    reader: R,
    done: bool,
}

impl<R: BufRead> FrameDecoder<R> {
    /// Wrap a reader.
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            done: false,
        }
    }

    /// Read the next frame. `None` means clean end-of-stream.
    pub fn read_frame(&mut self) -> Option<CodecResult<Envelope>> {
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
        let frame = self.read_frame_inner();
        if frame.is_err() {
            self.done = true;
        }
        Some(frame)
    }

    fn read_frame_inner(&mut self) -> CodecResult<Envelope> {
        let mut magic = [0u8; FRAME_MAGIC.len()];
        read_exact(&mut self.reader, &mut magic)?;
        if magic != FRAME_MAGIC {
            return Err(CodecError::InvalidMarker);
        }

        let count = read_u32(&mut self.reader)?;
        let mut metadata = Metadata::new();
        for _ in 0..count {
            let key = self.read_string(MAX_METADATA_KEY_LEN, "metadata key")?;
            let value = self.read_string(MAX_METADATA_VALUE_LEN, "metadata value")?;
            metadata.insert(key, value)?;
        }

        let data_len = read_u64(&mut self.reader)?;
        if data_len > MAX_DATA_SIZE as u64 {
            return Err(CodecError::MessageTooLarge {
                size: data_len.min(usize::MAX as u64) as usize,
                limit: MAX_DATA_SIZE,
            });
        }
        let mut data = vec![0u8; data_len as usize];
        read_exact(&mut self.reader, &mut data)?;

        Ok(Envelope::new(metadata, Bytes::from(data)))
    }

    fn read_string(&mut self, max_len: usize, what: &str) -> CodecResult<String> {
        let len = read_u32(&mut self.reader)? as usize;
        if len > max_len {
            return Err(CodecError::Decode(format!(
                "{what} length {len} exceeds {max_len}"
            )));
        }
        let mut buf = vec![0u8; len];
        read_exact(&mut self.reader, &mut buf)?;
        String::from_utf8(buf).map_err(|_| CodecError::Decode(format!("{what} is not UTF-8")))
    }
}

impl<R: BufRead> Iterator for FrameDecoder<R> {
    type Item = CodecResult<Envelope>;

    fn next(&mut self) -> Option<Self::Item> {
        self.read_frame()
    }
}

fn read_exact(reader: &mut impl Read, buf: &mut [u8]) -> CodecResult<()> {
    reader.read_exact(buf).map_err(|e| {
        if e.kind() == ErrorKind::UnexpectedEof {
            CodecError::UnexpectedEof
        } else {
            CodecError::Io(e)
        }
    })
}

fn read_u32(reader: &mut impl Read) -> CodecResult<u32> {
    let mut buf = [0u8; 4];
    read_exact(reader, &mut buf)?;
    Ok(u32::from_be_bytes(buf))
}

fn read_u64(reader: &mut impl Read) -> CodecResult<u64> {
    let mut buf = [0u8; 8];
    read_exact(reader, &mut buf)?;
    Ok(u64::from_be_bytes(buf))
}

/// Codec wrapper over the frame format.
#[derive(Debug, Clone, Copy, Default)]
pub struct CliFrameCodec;

impl MessageCodec for CliFrameCodec {
    fn encode_value(&self, value: &serde_json::Value) -> CodecResult<Bytes> {
        match value {
            serde_json::Value::String(s) => Ok(Bytes::from(s.clone().into_bytes())),
            other => serde_json::to_vec(other)
                .map(Bytes::from)
                .map_err(|e| CodecError::Encode(e.to_string())),
        }
    }

    fn encode(&self, metadata: &Metadata, data: &[u8]) -> CodecResult<Bytes> {
        encode_frame(metadata, data)
    }

    fn decode(&self, bytes: &[u8]) -> CodecResult<Envelope> {
        FrameDecoder::new(bytes)
            .read_frame()
            .unwrap_or_else(|| Err(CodecError::Decode("empty frame input".to_string())))
    }

    fn decode_stream<'r>(
        &self,
        reader: Box<dyn BufRead + Send + 'r>,
    ) -> Box<dyn Iterator<Item = CodecResult<Envelope>> + Send + 'r> {
        Box::new(FrameDecoder::new(reader))
    }
}
