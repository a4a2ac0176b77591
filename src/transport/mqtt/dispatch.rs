//! Topic dispatch registry
//!
//! Maps topic filters (exact or wildcarded) to handlers and fans every
//! inbound message out to all matching handlers in registration order.
//!
//! Matching follows MQTT: levels are split on `/`, a literal level must be
//! equal, `+` matches exactly one level and `#` (legal only as the final
//! level) matches the remainder, including zero levels.

use super::message_handler::{InboundMessage, SubscriptionHandler};
use rumqttc::QoS;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use thiserror::Error;
use tracing::{error, warn};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TopicFilterError {
    #[error("topic filter is empty")]
    Empty,
    #[error("'#' must be the last level of '{0}'")]
    MultiLevelNotLast(String),
    #[error("wildcards must occupy a whole level in '{0}'")]
    PartialWildcard(String),
    #[error("topic filter contains a NUL character")]
    NulCharacter,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Level {
    Literal(String),
    SingleLevel,
    MultiLevel,
}

/// A validated subscription pattern
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicFilter {
    raw: String,
    levels: Vec<Level>,
}

impl TopicFilter {
    pub fn parse(pattern: &str) -> Result<Self, TopicFilterError> {
        if pattern.is_empty() {
            return Err(TopicFilterError::Empty);
        }
        if pattern.contains('\0') {
            return Err(TopicFilterError::NulCharacter);
        }

        let parts: Vec<&str> = pattern.split('/').collect();
        let last = parts.len() - 1;
        let mut levels = Vec::with_capacity(parts.len());

        for (index, part) in parts.into_iter().enumerate() {
            let level = match part {
                "#" if index == last => Level::MultiLevel,
                "#" => return Err(TopicFilterError::MultiLevelNotLast(pattern.to_string())),
                "+" => Level::SingleLevel,
                p if p.contains('#') || p.contains('+') => {
                    return Err(TopicFilterError::PartialWildcard(pattern.to_string()))
                }
                p => Level::Literal(p.to_string()),
            };
            levels.push(level);
        }

        Ok(Self {
            raw: pattern.to_string(),
            levels,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Whether a concrete topic name matches this filter
    pub fn matches(&self, topic: &str) -> bool {
        let mut topic_levels = topic.split('/');

        for level in &self.levels {
            match level {
                Level::MultiLevel => return true,
                Level::SingleLevel => {
                    if topic_levels.next().is_none() {
                        return false;
                    }
                }
                Level::Literal(expected) => match topic_levels.next() {
                    Some(actual) if actual == expected => {}
                    _ => return false,
                },
            }
        }

        topic_levels.next().is_none()
    }
}

impl std::fmt::Display for TopicFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.raw)
    }
}

/// Check a topic name used for publishing
pub fn validate_topic_name(topic: &str) -> Result<(), &'static str> {
    if topic.is_empty() {
        return Err("topic is empty");
    }
    if topic.contains('+') || topic.contains('#') {
        return Err("wildcards are not allowed in topic names");
    }
    if topic.contains('\0') {
        return Err("topic contains a NUL character");
    }
    if topic.len() > usize::from(u16::MAX) {
        return Err("topic is longer than 65535 bytes");
    }
    Ok(())
}

/// Identifier of one registration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

struct Registration {
    id: SubscriptionId,
    filter: TopicFilter,
    qos: QoS,
    handler: Arc<dyn SubscriptionHandler>,
}

/// Outcome of delivering one message
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchReport {
    /// Handlers whose filter matched
    pub matched: usize,
    /// Matched handlers that returned an error or panicked
    pub failed: usize,
}

/// Registry of live subscriptions, guarded by its own lock
#[derive(Default)]
pub struct TopicRegistry {
    registrations: RwLock<Vec<Registration>>,
    next_id: AtomicU64,
}

impl std::fmt::Debug for TopicRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TopicRegistry")
            .field("filters", &self.filters())
            .finish()
    }
}

impl TopicRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a handler for `pattern`; handlers for the same pattern accumulate
    pub fn register(
        &self,
        pattern: &str,
        qos: QoS,
        handler: Arc<dyn SubscriptionHandler>,
    ) -> Result<SubscriptionId, TopicFilterError> {
        let filter = TopicFilter::parse(pattern)?;
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));

        self.registrations
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Registration {
                id,
                filter,
                qos,
                handler,
            });
        Ok(id)
    }

    /// Remove every handler registered under `pattern`, returning how many
    pub fn remove_pattern(&self, pattern: &str) -> usize {
        let mut registrations = self
            .registrations
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let before = registrations.len();
        registrations.retain(|registration| registration.filter.as_str() != pattern);
        before - registrations.len()
    }

    /// Remove a single registration, returning its pattern and whether no
    /// handler for that pattern remains
    pub fn remove(&self, id: SubscriptionId) -> Option<(String, bool)> {
        let mut registrations = self
            .registrations
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let index = registrations.iter().position(|r| r.id == id)?;
        let removed = registrations.remove(index);
        let pattern = removed.filter.as_str();
        let last = !registrations.iter().any(|r| r.filter.as_str() == pattern);
        Some((pattern.to_string(), last))
    }

    pub fn contains(&self, pattern: &str) -> bool {
        self.registrations
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .any(|registration| registration.filter.as_str() == pattern)
    }

    pub fn len(&self) -> usize {
        self.registrations
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Distinct filters in first-registration order, each with the highest
    /// QoS any of its handlers asked for
    pub fn filters(&self) -> Vec<(String, QoS)> {
        let registrations = self
            .registrations
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        let mut filters: Vec<(String, QoS)> = Vec::new();

        for registration in registrations.iter() {
            match filters
                .iter_mut()
                .find(|(pattern, _)| pattern == registration.filter.as_str())
            {
                Some((_, qos)) => {
                    if registration.qos > *qos {
                        *qos = registration.qos;
                    }
                }
                None => filters.push((registration.filter.as_str().to_string(), registration.qos)),
            }
        }
        filters
    }

    /// Deliver a message to every matching handler in registration order
    ///
    /// The lock is released before handlers run, so handlers may subscribe
    /// or unsubscribe. Errors and panics are logged per handler.
    pub fn dispatch(&self, message: &InboundMessage) -> DispatchReport {
        let matching: Vec<(String, Arc<dyn SubscriptionHandler>)> = self
            .registrations
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|registration| registration.filter.matches(&message.topic))
            .map(|registration| {
                (
                    registration.filter.as_str().to_string(),
                    Arc::clone(&registration.handler),
                )
            })
            .collect();

        let mut report = DispatchReport {
            matched: matching.len(),
            failed: 0,
        };

        for (pattern, handler) in matching {
            match panic::catch_unwind(AssertUnwindSafe(|| handler.handle(message))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    report.failed += 1;
                    warn!(
                        topic = %message.topic,
                        pattern = %pattern,
                        error = %e,
                        "Subscription handler failed"
                    );
                }
                Err(payload) => {
                    report.failed += 1;
                    error!(
                        topic = %message.topic,
                        pattern = %pattern,
                        panic = %panic_message(payload.as_ref()),
                        "Subscription handler panicked"
                    );
                }
            }
        }

        if report.matched == 0 {
            tracing::debug!(target: "mqtt_transport", topic = %message.topic, "No handler matched inbound message");
        }
        report
    }
}

/// Best-effort text of a panic payload
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
