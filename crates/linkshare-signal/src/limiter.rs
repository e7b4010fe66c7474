//! Admission rate limiter
//!
//! Gates new connections per client origin before any session state is
//! touched.
//!
//! This is a moving-window limiter: each origin may be admitted at most
//! `max_hits` times within any span of `window`. Checking and counting is a
//! single operation, so two racing connections from the same origin can
//! never both take the last slot.

use std::collections::{HashMap, VecDeque};
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::time::Instant;
use tracing::{debug, warn};

use linkshare_core::LimitsConfig;

/// Limiter configuration
#[derive(Clone, Debug)]
pub struct LimiterConfig {
    /// Admissions allowed per origin within one window
    pub max_hits: u32,
    /// Moving window length
    pub window: Duration,
}

impl Default for LimiterConfig {
    fn default() -> Self {
        Self::from(&LimitsConfig::default())
    }
}

impl From<&LimitsConfig> for LimiterConfig {
    fn from(limits: &LimitsConfig) -> Self {
        Self {
            max_hits: limits.connections_per_window,
            window: limits.window(),
        }
    }
}

/// Admissions recorded for a single origin, oldest first
#[derive(Debug, Default)]
struct OriginEntry {
    hits: VecDeque<Instant>,
}

impl OriginEntry {
    /// Forget admissions that fell out of the window
    fn cleanup(&mut self, now: Instant, window: Duration) {
        while let Some(oldest) = self.hits.front() {
            if now.duration_since(*oldest) >= window {
                self.hits.pop_front();
            } else {
                break;
            }
        }
    }
}

/// Per-origin moving-window admission limiter
#[derive(Clone)]
pub struct AdmissionLimiter {
    config: LimiterConfig,
    entries: Arc<RwLock<HashMap<IpAddr, OriginEntry>>>,
}

impl AdmissionLimiter {
    /// Create a limiter with default configuration
    pub fn new() -> Self {
        Self::with_config(LimiterConfig::default())
    }

    /// Create a limiter with custom configuration
    pub fn with_config(config: LimiterConfig) -> Self {
        Self {
            config,
            entries: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Try to admit one connection from `origin`.
    ///
    /// Returns `true` and counts the hit if the origin still has quota in
    /// the current window, `false` otherwise. Refused attempts are not
    /// counted.
    pub fn hit(&self, origin: IpAddr) -> bool {
        let now = Instant::now();
        let mut entries = self.entries.write();
        let entry = entries.entry(origin).or_default();

        entry.cleanup(now, self.config.window);

        if entry.hits.len() as u32 >= self.config.max_hits {
            warn!(
                "Admission limiter: refusing {} ({} hits in {}s)",
                origin,
                entry.hits.len(),
                self.config.window.as_secs()
            );
            return false;
        }

        entry.hits.push_back(now);
        debug!(
            "Admission limiter: admitted {} ({}/{})",
            origin,
            entry.hits.len(),
            self.config.max_hits
        );
        true
    }

    /// Admissions left for `origin` in the current window
    pub fn remaining(&self, origin: IpAddr) -> u32 {
        let now = Instant::now();
        let entries = self.entries.read();
        let used = entries
            .get(&origin)
            .map(|e| {
                e.hits
                    .iter()
                    .filter(|t| now.duration_since(**t) < self.config.window)
                    .count() as u32
            })
            .unwrap_or(0);
        self.config.max_hits.saturating_sub(used)
    }

    /// Drop origins with no admissions inside the window to bound memory
    pub fn cleanup_expired(&self) {
        let now = Instant::now();
        let mut entries = self.entries.write();

        entries.retain(|origin, entry| {
            entry.cleanup(now, self.config.window);
            let keep = !entry.hits.is_empty();
            if !keep {
                debug!("Admission limiter: cleaned up entry for {}", origin);
            }
            keep
        });
    }

    /// Get statistics about limiter state
    pub fn stats(&self) -> LimiterStats {
        let now = Instant::now();
        let entries = self.entries.read();
        let limited = entries
            .values()
            .filter(|e| {
                e.hits
                    .iter()
                    .filter(|t| now.duration_since(**t) < self.config.window)
                    .count() as u32
                    >= self.config.max_hits
            })
            .count();

        LimiterStats {
            tracked: entries.len(),
            limited,
        }
    }
}

impl Default for AdmissionLimiter {
    fn default() -> Self {
        Self::new()
    }
}

/// Limiter statistics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LimiterStats {
    /// Origins with recorded admissions
    pub tracked: usize,
    /// Origins currently out of quota
    pub limited: usize,
}
