//! Message codecs for the events bridge pipeline.
//!
//! A [`MessageCodec`] converts between an `(metadata, data)` pair and a
//! byte string. The pipeline crosses a process, WASM, or wire boundary
//! through one of four implementations:
//!
//! - [`JsonCodec`]: a JSON object with a metadata map and a data value
//! - [`CborCodec`]: the same logical shape as CBOR
//! - [`CliFrameCodec`]: a self-delimiting, length-prefixed binary framing
//! - [`IdentityCodec`]: raw passthrough for sources that carry their own
//!   wire format
//!
//! Codecs are selected by lowercase token through [`codec_for`]; the
//! identity codec has no token and is constructed explicitly.

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]
#![deny(clippy::unwrap_used)]
#![cfg_attr(test, allow(clippy::unwrap_used))]

mod cbor;
mod codec;
mod error;
mod frame;
mod identity;
mod json;

pub use cbor::CborCodec;
pub use codec::{MAX_DATA_SIZE, MessageCodec, codec_for};
pub use error::{CodecError, CodecResult};
pub use frame::{CliFrameCodec, FRAME_MAGIC, FrameDecoder, encode_frame};
pub use identity::IdentityCodec;
pub use json::{JsonCodec, MAX_STREAM_MESSAGES, MAX_STREAM_MESSAGE_SIZE};
