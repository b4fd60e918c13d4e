//! Lease queue: typed publish/consume over the [`crate::ports::QueueStore`].
//!
//! # Message lifecycle
//! ```text
//! PENDING --get--> LEASED --ok--> ACKED (deleted)
//!                    |  \--err, retries > 0--> PENDING (retries - 1)
//!                    |   \-err, retries = 0--> DROPPED (deleted)
//!                    \--heartbeat--> LEASED (earliest_get pushed forward)
//! ```
//! A lease is nothing more than `earliest_get` sitting in the future. A
//! consumer that dies simply stops extending it and the message reappears.

pub mod consumer;
pub mod controller;
pub mod listener;
pub mod publisher;
pub mod topic;

use std::time::Duration;

pub use self::consumer::QueueConsumer;
pub use self::controller::QueueListenerController;
pub use self::listener::{ListenerOutcome, QueueHandler, QueueListener};
pub use self::publisher::QueuePublisher;
pub use self::topic::{
    TOPIC_DELIMITER, TopicScope, combine_elements, resolve_expression_into_list_of_topics,
};

/// Timing and defaults shared by publishers, consumers and listeners.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueSettings {
    /// Lease length granted by `get` and by each renewal.
    pub heartbeat: Duration,
    /// Renew this long before the lease would run out.
    pub renewal_margin: Duration,
    pub get_wait: Duration,
    pub get_poll: Duration,
    /// Re-check interval of a primary-only listener on a standby replica.
    pub standby_poll: Duration,
    pub default_retries: u32,
    pub message_ttl: Duration,
    pub topic_prefix: Option<String>,
}

impl QueueSettings {
    pub fn renewal_period(&self) -> Duration {
        self.heartbeat
            .saturating_sub(self.renewal_margin)
            .max(Duration::from_millis(1))
    }

    pub fn scope(&self, name: &str) -> TopicScope {
        TopicScope::new(name, self.topic_prefix.as_deref())
    }
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            heartbeat: Duration::from_secs(5),
            renewal_margin: Duration::from_millis(500),
            get_wait: Duration::from_secs(3),
            get_poll: Duration::from_secs(1),
            standby_poll: Duration::from_secs(1),
            default_retries: 3,
            message_ttl: Duration::from_secs(7 * 24 * 3600),
            topic_prefix: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renewal_fires_before_lease_expiry() {
        let settings = QueueSettings::default();
        assert_eq!(settings.renewal_period(), Duration::from_millis(4_500));
    }

    #[test]
    fn margin_larger_than_heartbeat_still_renews() {
        let settings = QueueSettings {
            heartbeat: Duration::from_millis(200),
            renewal_margin: Duration::from_secs(1),
            ..QueueSettings::default()
        };
        assert_eq!(settings.renewal_period(), Duration::from_millis(1));
    }

    #[test]
    fn scope_uses_configured_prefix() {
        let settings = QueueSettings {
            topic_prefix: Some("eu".into()),
            ..QueueSettings::default()
        };
        assert_eq!(settings.scope("prune").base(), "eu;prune");
    }
}
