//! Outbound record publishing.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use thiserror::Error;

use peerlink_proto::v1::LinkOutMessageV1;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("publish failed: {0}")]
pub struct PublishError(pub String);

/// Sink for link-out records produced outside a request/response flow,
/// such as queued messages released after a handshake.
#[async_trait]
pub trait Publisher: Send + Sync {
    async fn publish(&self, records: Vec<LinkOutMessageV1>) -> Result<(), PublishError>;
}

/// Collects published records in memory.
#[derive(Default, Clone)]
pub struct RecordingPublisher {
    records: Arc<Mutex<Vec<LinkOutMessageV1>>>,
}

impl RecordingPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<LinkOutMessageV1> {
        self.records.lock().clone()
    }

    /// Remove and return everything published so far.
    pub fn take(&self) -> Vec<LinkOutMessageV1> {
        std::mem::take(&mut *self.records.lock())
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }
}

#[async_trait]
impl Publisher for RecordingPublisher {
    async fn publish(&self, records: Vec<LinkOutMessageV1>) -> Result<(), PublishError> {
        self.records.lock().extend(records);
        Ok(())
    }
}
