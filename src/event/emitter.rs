use std::fmt;
use thiserror::Error;

use super::event::RunEvent;

/// Trait representing an abstract event emitter that step operations can clone.
pub trait EventEmitter: Send + Sync + fmt::Debug {
    /// Emit an event in a synchronous, non-blocking manner.
    fn emit(&self, event: RunEvent) -> Result<(), EmitterError>;
}

/// Errors that can occur when emitting an event.
#[derive(Debug, Error)]
pub enum EmitterError {
    #[error("run publisher closed")]
    Closed,
    #[error("event emission failed: {0}")]
    Other(String),
}

impl EmitterError {
    pub fn other(error: impl Into<String>) -> Self {
        Self::Other(error.into())
    }
}

/// Emitter backed by a run's publisher channel.
///
/// Cheap to clone; every clone feeds the same per-run stream.
#[derive(Clone, Debug)]
pub struct RunEmitter {
    sender: flume::Sender<RunEvent>,
}

impl RunEmitter {
    pub(crate) fn new(sender: flume::Sender<RunEvent>) -> Self {
        Self { sender }
    }

    pub(crate) fn sender(&self) -> flume::Sender<RunEvent> {
        self.sender.clone()
    }
}

impl EventEmitter for RunEmitter {
    fn emit(&self, event: RunEvent) -> Result<(), EmitterError> {
        self.sender.send(event).map_err(|_| EmitterError::Closed)
    }
}
