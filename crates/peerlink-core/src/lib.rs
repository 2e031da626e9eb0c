//! peerlink core - session establishment and lifecycle.
//!
//! This crate implements:
//! - The session manager driving the handshake for both roles
//! - The outbound session pool with weighted session selection
//! - Bounded inbound/outbound session caches
//! - The pending message queue released on session establishment
//! - Dead session detection and session state expiry
//! - Conversion of session state to and from persisted records

#![forbid(unsafe_code)]

// Orchestration
pub mod session;
pub mod protocol_factory;

// Session bookkeeping
pub mod pool;
pub mod cache;
pub mod pending_queue;

// Timers
pub mod dead_session;
pub mod expiry;

// Persistence
pub mod store;
pub mod state;

// Collaborators
pub mod directory;
pub mod crypto_client;
pub mod revocation;
pub mod publisher;

// Supporting modules
pub mod errors;
pub mod types;
pub mod config;
pub mod clock;
pub mod messages;
pub mod stats;
pub mod harness;
