//! Wire and persisted-state messages for peerlink sessions.
//!
//! Messages are declared with `prost` derives directly; there is no `.proto`
//! code generation step. Field tags are part of the wire contract and must
//! never be reused.

#![forbid(unsafe_code)]

pub mod v1;
pub mod conversions;
pub mod validation;

#[cfg(test)]
mod proptests;
