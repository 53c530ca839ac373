//! concat-protocol: wire types and MessagePack batch decoding.
//!
//! This is the crate's sole serde boundary — everything above it deals
//! only in [`Record`]/[`FieldValue`], never in `rmpv::Value`.

mod record;
mod wire;

pub use record::{FieldMap, FieldValue, Record};
pub use wire::{BatchDecoder, DecodeError};
