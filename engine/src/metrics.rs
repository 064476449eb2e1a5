//! Sync metrics.
//!
//! A pure aggregator fed with [`MetricsEvent`]s. Nothing on the sync path
//! depends on it; callers log and drop any error it returns.

use crate::{connection::Transition, error::Result, Error, Timestamp};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// Latency samples kept for the rolling average.
pub const LATENCY_WINDOW: usize = 100;

/// Connection transitions kept for diagnostics.
pub const HISTORY_LIMIT: usize = 50;

/// Something worth counting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricsEvent {
    /// A mutation was confirmed by the server
    Confirmed {
        created_at: Timestamp,
        confirmed_at: Timestamp,
    },
    /// A mutation was rejected or exhausted
    Failed { at: Timestamp },
    /// Inbound server updates were applied
    Received { count: usize, at: Timestamp },
    /// The connection state changed
    Connection(Transition),
}

/// Point-in-time copy of the counters.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSnapshot {
    pub total_updates: u64,
    pub successful: u64,
    pub failed: u64,
    pub average_latency_ms: f64,
    pub last_update_at: Option<Timestamp>,
    pub success_rate: f64,
    pub connection_history: Vec<Transition>,
}

#[derive(Debug, Clone, Default)]
pub struct SyncMetrics {
    total_updates: u64,
    successful: u64,
    failed: u64,
    latencies: VecDeque<u64>,
    latency_sum: u64,
    last_update_at: Option<Timestamp>,
    history: VecDeque<Transition>,
}

impl SyncMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one event.
    ///
    /// Samples that make no sense (confirmation before creation, empty
    /// batches) are refused and leave the counters untouched.
    pub fn record(&mut self, event: MetricsEvent) -> Result<()> {
        match event {
            MetricsEvent::Confirmed {
                created_at,
                confirmed_at,
            } => {
                let latency = confirmed_at.checked_sub(created_at).ok_or_else(|| {
                    Error::MetricsFailure(format!(
                        "confirmed at {} before created at {}",
                        confirmed_at, created_at
                    ))
                })?;

                if self.latencies.len() == LATENCY_WINDOW {
                    if let Some(oldest) = self.latencies.pop_front() {
                        self.latency_sum -= oldest;
                    }
                }
                self.latencies.push_back(latency);
                self.latency_sum = self.latency_sum.saturating_add(latency);

                self.successful += 1;
                self.total_updates += 1;
                self.touch(confirmed_at);
            }
            MetricsEvent::Failed { at } => {
                self.failed += 1;
                self.total_updates += 1;
                self.touch(at);
            }
            MetricsEvent::Received { count, at } => {
                if count == 0 {
                    return Err(Error::MetricsFailure("empty batch".into()));
                }
                self.total_updates += count as u64;
                self.touch(at);
            }
            MetricsEvent::Connection(transition) => {
                if self.history.len() == HISTORY_LIMIT {
                    self.history.pop_front();
                }
                self.history.push_back(transition);
            }
        }
        Ok(())
    }

    /// Rolling average latency over the last [`LATENCY_WINDOW`] confirmations.
    pub fn average_latency_ms(&self) -> f64 {
        if self.latencies.is_empty() {
            0.0
        } else {
            self.latency_sum as f64 / self.latencies.len() as f64
        }
    }

    /// Share of settled mutations that were confirmed.
    pub fn success_rate(&self) -> f64 {
        let settled = self.successful + self.failed;
        if settled == 0 {
            0.0
        } else {
            self.successful as f64 / settled as f64
        }
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            total_updates: self.total_updates,
            successful: self.successful,
            failed: self.failed,
            average_latency_ms: self.average_latency_ms(),
            last_update_at: self.last_update_at,
            success_rate: self.success_rate(),
            connection_history: self.history.iter().copied().collect(),
        }
    }

    fn touch(&mut self, at: Timestamp) {
        self.last_update_at = Some(self.last_update_at.map_or(at, |last| last.max(at)));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ConnectionState;

    #[test]
    fn counts_and_rates() {
        let mut metrics = SyncMetrics::new();
        metrics
            .record(MetricsEvent::Confirmed {
                created_at: 100,
                confirmed_at: 150,
            })
            .unwrap();
        metrics
            .record(MetricsEvent::Confirmed {
                created_at: 200,
                confirmed_at: 350,
            })
            .unwrap();
        metrics.record(MetricsEvent::Failed { at: 400 }).unwrap();
        metrics
            .record(MetricsEvent::Received { count: 3, at: 380 })
            .unwrap();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.total_updates, 6);
        assert_eq!(snapshot.successful, 2);
        assert_eq!(snapshot.failed, 1);
        assert_eq!(snapshot.average_latency_ms, 100.0);
        assert_eq!(snapshot.last_update_at, Some(400));
        assert!((snapshot.success_rate - 2.0 / 3.0).abs() < f64::EPSILON);
    }

    #[test]
    fn latency_window_rolls() {
        let mut metrics = SyncMetrics::new();
        for _ in 0..LATENCY_WINDOW {
            metrics
                .record(MetricsEvent::Confirmed {
                    created_at: 0,
                    confirmed_at: 1_000,
                })
                .unwrap();
        }
        for _ in 0..LATENCY_WINDOW {
            metrics
                .record(MetricsEvent::Confirmed {
                    created_at: 0,
                    confirmed_at: 10,
                })
                .unwrap();
        }
        assert_eq!(metrics.average_latency_ms(), 10.0);
    }

    #[test]
    fn unusable_samples_are_refused() {
        let mut metrics = SyncMetrics::new();
        let err = metrics
            .record(MetricsEvent::Confirmed {
                created_at: 500,
                confirmed_at: 100,
            })
            .unwrap_err();
        assert!(matches!(err, Error::MetricsFailure(_)));
        assert!(metrics
            .record(MetricsEvent::Received { count: 0, at: 1 })
            .is_err());
        assert_eq!(metrics.snapshot(), MetricsSnapshot::default());
    }

    #[test]
    fn history_is_bounded() {
        let mut metrics = SyncMetrics::new();
        for at in 0..(HISTORY_LIMIT as u64 + 10) {
            metrics
                .record(MetricsEvent::Connection(Transition {
                    from: ConnectionState::Connected,
                    to: ConnectionState::Degraded,
                    at,
                }))
                .unwrap();
        }
        let history = metrics.snapshot().connection_history;
        assert_eq!(history.len(), HISTORY_LIMIT);
        assert_eq!(history[0].at, 10);
    }
}
