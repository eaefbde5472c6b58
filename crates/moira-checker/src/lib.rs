//! Trigger evaluation.
//!
//! [`scheduler::TriggerScheduler`] keeps every trigger in a delay set keyed
//! by its next check time, claims due triggers through a TTL lock in the
//! store and hands them to [`checker::TriggerChecker`]. The checker fetches
//! the trigger targets from a [`source::MetricSource`], walks the new
//! points of each metric and produces the updated check data together with
//! the state transition events to enqueue.

pub mod checker;
pub mod delay;
pub mod error;
pub mod expression;
pub mod rule;
pub mod scheduler;
pub mod series;
pub mod source;
pub mod target;

#[cfg(test)]
mod tests;

pub use checker::{CheckOutcome, CheckSettings, TriggerChecker};
pub use error::{CheckError, Result};
pub use scheduler::{CheckResult, SchedulerSettings, TriggerScheduler};
pub use source::{LocalSource, MetricSource, RemoteSettings, RemoteSource};
