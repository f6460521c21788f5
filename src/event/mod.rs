//! Run event types, sinks, and the per-run stream publisher.
//!
//! The module is organised around the per-run [`RunPublisher`] and helpers
//! for emitting ([`RunEmitter`]) and consuming ([`RunEventStream`]) the
//! ordered event sequence of a single run.

pub mod emitter;
pub mod event;
pub mod publisher;
pub mod sink;

pub use emitter::{EmitterError, EventEmitter, RunEmitter};
pub use event::{
    ApprovalRequiredEvent, CompletedEvent, LogEvent, RunErrorEvent, RunEvent, StepResultEvent,
    TerminalStatus,
};
pub use publisher::{BlockingRunEventIter, RunEventStream, RunPublisher};
pub use sink::{ChannelSink, EventSink, MemorySink, StdOutSink};
