//! Message core for the events bridge pipeline.
//!
//! This crate provides:
//! - [`Metadata`]: a bounded string-to-string map shared by every message
//! - [`SourceMessage`]: the contract a source connector fulfills for a
//!   single ingested event (read-only view plus ack/nak/reply)
//! - [`RunnerMessage`]: the mutable per-pipeline-message object that layers
//!   a target overlay on top of the source view
//! - [`Envelope`]: an owned `(metadata, data)` pair produced by codecs and
//!   plugin responses
//!
//! # Architecture
//!
//! A source connector produces a [`SourceMessage`]. The dispatcher wraps it
//! as a [`RunnerMessage`] whose target view starts empty. Runners read the
//! *effective* view (target overlaid on source, target winning on key
//! collision) and write into the target view. After the target connector
//! consumes the message, exactly one of ack or nak is delivered to the
//! source, no matter how many times either is invoked.

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]
#![deny(clippy::unwrap_used)]
#![cfg_attr(test, allow(clippy::unwrap_used))]

mod error;
mod message;
mod metadata;
mod source;

pub use error::{ErrorCategory, MessageError, MessageResult};
pub use message::{AckState, RunnerMessage};
pub use metadata::{
    MAX_METADATA_ENTRIES, MAX_METADATA_KEY_LEN, MAX_METADATA_TOTAL_LEN, MAX_METADATA_VALUE_LEN,
    Metadata,
};
pub use source::{Envelope, ReplyData, SourceMessage};
