//! # chainflow-checkpoint - Persistence layer for the workflow engine
//!
//! This crate carries everything the engine needs to make a run durable and
//! reproducible, without depending on the engine itself:
//!
//! - [`EngineCheckpoint`] - a complete, resumable snapshot of a run
//! - [`CheckpointStore`] - the async storage trait backends implement
//! - [`InMemoryCheckpointStore`] - the reference/test implementation
//! - [`codec`] - the tagged JSON codec for big integers, byte sequences,
//!   decimals, and error objects
//! - [`canonical`] - canonical JSON plus the keccak256 spec hash used for
//!   deterministic confirmation summaries
//!
//! Payloads cross this crate's boundary as [`serde_json::Value`] already
//! passed through the tagged codec, so any storage backend that can hold
//! JSON can hold a checkpoint.

pub mod canonical;
pub mod checkpoint;
pub mod codec;
pub mod error;
pub mod memory;
pub mod traits;

pub use canonical::{canonical_json, canonical_json_string, keccak256_hex, spec_hash_keccak256};
pub use checkpoint::{EngineCheckpoint, PauseRecord, PollState};
pub use codec::{
    decode_tagged, encode_bigint, encode_bytes, encode_decimal, encode_error, encode_tagged,
    parse, stringify, CodecError, StringifyOptions, TaggedValue, TAG_KEY,
};
pub use error::{CheckpointError, Result};
pub use memory::InMemoryCheckpointStore;
pub use traits::CheckpointStore;
