//! Event dispatch errors.

use thiserror::Error;

use crate::manager::EventPriority;

pub type EventResult<T> = Result<T, EventError>;

#[derive(Debug, Error)]
pub enum EventError {
    /// One or more listeners returned an error. Every matching listener was
    /// still invoked; all failures are collected here in invocation order.
    #[error("{count} listener(s) failed while handling {event}", count = .failures.len())]
    ListenerFailures {
        event: &'static str,
        failures: Vec<ListenerFailure>,
    },
}

impl EventError {
    pub fn failures(&self) -> &[ListenerFailure] {
        match self {
            EventError::ListenerFailures { failures, .. } => failures,
        }
    }
}

/// A single listener invocation that returned an error.
#[derive(Debug)]
pub struct ListenerFailure {
    pub listener_id: u64,
    pub channel: String,
    pub priority: EventPriority,
    pub error: anyhow::Error,
}
