//! Shared data model for the Moira alerting pipeline.
//!
//! Everything that crosses a crate boundary lives here: metric points,
//! triggers and their check data, subscriptions, contacts, pipeline events
//! and scheduled notifications. The types are plain serde structs so the
//! storage backends can persist them as JSON.

pub mod id;
pub mod schedule;
pub mod state;
pub mod types;

#[cfg(test)]
mod tests;
