//! Built-in senders.

pub mod mail;
pub mod script;
pub mod webhook;
