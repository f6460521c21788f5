//! Human-in-the-loop approval gate.
//!
//! Gated steps register an [`ApprovalRequest`] and park on
//! [`ApprovalGate::await_decision`] until a caller resolves it through
//! [`ApprovalGate::decide`].

pub mod gate;
pub mod request;

pub use gate::{ApprovalGate, GateError};
pub use request::{ApprovalRequest, ApprovalStatus, Decision};
