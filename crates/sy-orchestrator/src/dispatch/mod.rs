//! Command dispatch
//!
//! Per-command lifecycle with independent ack and completion timers:
//!
//! ```text
//! Pending --ack--> Acked --result--> Success | Error
//! Pending --ack timeout-----------> TimedOut
//! Acked   --completion timeout----> TimedOut
//! ```
//!
//! Exactly one terminal transition ever applies to a command, and every
//! timer is cleared the instant a transition supersedes it.

mod dispatcher;

pub use dispatcher::{CommandDispatcher, CommandOutcome, CommandRecord, RecordStatus};
