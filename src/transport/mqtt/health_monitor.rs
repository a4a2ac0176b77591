//! Session statistics and health assessment for the MQTT client
//!
//! [`ConnectionStats`] is updated by the background tasks with atomic
//! stores so that status reads never contend with the I/O task.
//! [`HealthMonitor`] holds the pure functions interpreting those numbers.

use super::connection::ConnectionState;
use chrono::{DateTime, TimeZone, Utc};
use serde::Serialize;
use std::sync::atomic::{AtomicI64, AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

/// Live counters shared between the client and its background tasks
#[derive(Debug)]
pub struct ConnectionStats {
    /// Reference point for `connected_at_nanos`
    epoch: Instant,
    message_count: AtomicU64,
    reconnect_attempts: AtomicU32,
    reconnect_count: AtomicU32,
    /// Unix millis of the last inbound message, 0 when none
    last_message_ms: AtomicI64,
    /// Nanos since `epoch` plus one of the last ConnAck, 0 when not connected
    connected_at_nanos: AtomicU64,
}

impl Default for ConnectionStats {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionStats {
    pub fn new() -> Self {
        Self {
            epoch: Instant::now(),
            message_count: AtomicU64::new(0),
            reconnect_attempts: AtomicU32::new(0),
            reconnect_count: AtomicU32::new(0),
            last_message_ms: AtomicI64::new(0),
            connected_at_nanos: AtomicU64::new(0),
        }
    }

    pub fn record_message(&self, received_at: DateTime<Utc>) {
        self.message_count.fetch_add(1, Ordering::Relaxed);
        self.last_message_ms
            .store(received_at.timestamp_millis().max(1), Ordering::Relaxed);
    }

    /// A reconnection attempt has been scheduled
    pub fn record_reconnect_attempt(&self, attempt: u32) {
        self.reconnect_attempts.store(attempt, Ordering::Relaxed);
        self.reconnect_count.fetch_add(1, Ordering::Relaxed);
    }

    /// ConnAck received: the failure streak is over
    pub fn record_connected(&self) {
        self.reconnect_attempts.store(0, Ordering::Relaxed);
        let since_epoch = u64::try_from(self.epoch.elapsed().as_nanos()).unwrap_or(u64::MAX - 1);
        self.connected_at_nanos
            .store(since_epoch.saturating_add(1), Ordering::Relaxed);
    }

    pub fn record_disconnected(&self) {
        self.connected_at_nanos.store(0, Ordering::Relaxed);
    }

    /// Clear counters and message history; uptime is left untouched
    pub fn reset(&self) {
        self.message_count.store(0, Ordering::Relaxed);
        self.reconnect_attempts.store(0, Ordering::Relaxed);
        self.reconnect_count.store(0, Ordering::Relaxed);
        self.last_message_ms.store(0, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let last_message_at = match self.last_message_ms.load(Ordering::Relaxed) {
            0 => None,
            ms => Utc.timestamp_millis_opt(ms).single(),
        };
        let uptime = match self.connected_at_nanos.load(Ordering::Relaxed) {
            0 => None,
            nanos => {
                let connected_at = self.epoch + Duration::from_nanos(nanos - 1);
                Some(Instant::now().saturating_duration_since(connected_at))
            }
        };
        let time_since_last_message = last_message_at.map(|at| {
            Utc::now()
                .signed_duration_since(at)
                .to_std()
                .unwrap_or(Duration::ZERO)
        });

        StatsSnapshot {
            message_count: self.message_count.load(Ordering::Relaxed),
            reconnect_attempts: self.reconnect_attempts.load(Ordering::Relaxed),
            reconnect_count: self.reconnect_count.load(Ordering::Relaxed),
            last_message_at,
            time_since_last_message,
            uptime,
        }
    }
}

/// Point-in-time copy of [`ConnectionStats`]
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatsSnapshot {
    /// Inbound messages received
    pub message_count: u64,
    /// Attempts in the current failure streak, zero once connected
    pub reconnect_attempts: u32,
    /// Reconnection attempts over the client lifetime
    pub reconnect_count: u32,
    pub last_message_at: Option<DateTime<Utc>>,
    pub time_since_last_message: Option<Duration>,
    /// Time since the last successful connect, None when not connected
    pub uptime: Option<Duration>,
}

/// Pure health monitoring functions
pub struct HealthMonitor;

impl HealthMonitor {
    /// Check if connection state allows publishing (pure function)
    pub fn can_publish(state: &ConnectionState) -> bool {
        matches!(state, ConnectionState::Connected)
    }

    /// Healthy when connected and either silent so far or recently active
    pub fn is_healthy(stats: &StatsSnapshot) -> bool {
        match (stats.uptime, stats.time_since_last_message) {
            (Some(_), None) => true,
            (Some(_), Some(last_msg)) => last_msg < Duration::from_secs(300),
            _ => false,
        }
    }

    /// Assess connection quality based on a stats snapshot (pure function)
    pub fn assess(stats: &StatsSnapshot) -> ConnectionQuality {
        if !Self::is_healthy(stats) {
            return ConnectionQuality::Critical;
        }

        match (stats.reconnect_count, stats.uptime) {
            (0, Some(uptime)) if uptime > Duration::from_secs(3600) => ConnectionQuality::Excellent,
            (0, Some(_)) => ConnectionQuality::Good,

            (1..=2, Some(uptime)) if uptime > Duration::from_secs(1800) => ConnectionQuality::Good,
            (1..=2, Some(_)) => ConnectionQuality::Fair,

            (3..=5, _) => ConnectionQuality::Fair,
            (6..=10, _) => ConnectionQuality::Poor,

            _ => ConnectionQuality::Critical,
        }
    }

    /// Log connection state transition (pure logging function)
    pub fn log_state_transition(from: ConnectionState, to: ConnectionState) {
        match (from, to) {
            (ConnectionState::Connecting, ConnectionState::Connected) => {
                info!("MQTT connection established");
            }
            (ConnectionState::Connected, ConnectionState::Reconnecting) => {
                warn!("MQTT connection lost, reconnecting");
            }
            (ConnectionState::Connected, ConnectionState::Disconnected) => {
                info!("MQTT connection closed");
            }
            (_, ConnectionState::Error(code)) => {
                error!(%code, "MQTT connection permanently failed");
            }
            _ => {
                tracing::debug!(target: "mqtt_transport", "MQTT connection state: {} -> {}", from, to);
            }
        }
    }
}

/// Connection quality assessment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionQuality {
    /// Stable connection for over an hour
    Excellent,
    Good,
    /// Some reconnections, but working
    Fair,
    /// Frequent reconnections
    Poor,
    /// Not connected or silent for too long
    Critical,
}
