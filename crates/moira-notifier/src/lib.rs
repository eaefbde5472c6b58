//! Notification delivery for the alerting pipeline.
//!
//! Events produced by the checker are fanned out to matching
//! subscriptions by [`fanout::EventWorker`], planned into the due-time
//! queue by [`planner::Planner`] and delivered in per-contact packages by
//! [`dispatcher::Dispatcher`]. [`selfstate::SelfStateMonitor`] watches the
//! pipeline and closes the delivery gate when it degrades.
//!
//! Delivery itself goes through [`Sender`] implementations built by the
//! [`plugin::SenderRegistry`].

pub mod dispatcher;
pub mod error;
pub mod fanout;
pub mod planner;
pub mod plugin;
pub mod selfstate;
pub mod senders;
pub mod template;
pub mod utils;


use async_trait::async_trait;
use moira_common::types::NotificationPackage;
use std::time::Duration;

pub use dispatcher::{DispatchReport, Dispatcher};
pub use error::{NotifyError, Result};
pub use fanout::EventWorker;
pub use planner::Planner;
pub use plugin::{SenderConfig, SenderContext, SenderPlugin, SenderRegistry, Senders};
pub use selfstate::{SelfStateMonitor, SelfStateSettings};

/// Delivers one package to its contact.
///
/// A sender is registered for a contact type and must be safe to call
/// concurrently; the dispatcher sends every package of a batch at once.
#[async_trait]
pub trait Sender: Send + Sync {
    async fn send(&self, package: &NotificationPackage) -> anyhow::Result<()>;

    /// Type name of the sender implementation (e.g., `"webhook"`).
    fn sender_type(&self) -> &str;
}

/// Tuning shared by the fan-out workers and the dispatcher.
#[derive(Debug, Clone)]
pub struct NotifierSettings {
    /// Notifications popped per dispatcher poll.
    pub read_batch_size: usize,
    /// Upper bound for one `Sender::send` call.
    pub sending_timeout: Duration,
    /// Failed notifications older than this are not rescheduled again.
    pub resending_timeout: Duration,
    /// Base delay of a resend, doubled per failure; also the jitter range.
    pub rescheduling_delay: Duration,
    pub max_fail_attempts: u32,
    pub fetch_interval: Duration,
    /// Base URL of the web UI, used to link triggers in messages.
    pub front_uri: String,
}

impl Default for NotifierSettings {
    fn default() -> Self {
        Self {
            read_batch_size: 100,
            sending_timeout: Duration::from_secs(10),
            resending_timeout: Duration::from_secs(24 * 60 * 60),
            rescheduling_delay: Duration::from_secs(60),
            max_fail_attempts: 3,
            fetch_interval: Duration::from_secs(1),
            front_uri: String::new(),
        }
    }
}
