//! The request/reply message set for task dispatch.
//!
//! Workers drive the exchange: they announce availability, receive work or
//! an explicit standby/done signal, and submit results that are always
//! acknowledged. "No work right now" and "no work ever again" are distinct
//! replies so a worker knows whether to back off or exit.

use serde::{Deserialize, Serialize};

use crate::record::Record;

/// Messages a worker sends to the coordinator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Request {
    /// The worker is idle and wants a work item.
    Available,
    /// The result payload of a finished work item.
    Result(Record),
}

/// Messages the coordinator sends back.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Reply {
    /// A work item to process.
    Work(Record),
    /// Nothing to hand out right now; ask again after a backoff.
    Standby,
    /// No work will be handed out again; the worker should exit.
    Done,
    /// The result was received and recorded.
    Ack,
}
