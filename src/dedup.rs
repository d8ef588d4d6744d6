use crate::tigo::report::{PowerReport, RawReadings};

use std::collections::HashMap;
use std::time::{Duration, Instant};

#[derive(Clone, Copy, Debug)]
struct DedupEntry {
    accepted_at: Instant,
    signature: RawReadings,
}

/// Suppresses power reports that repeat the last accepted readings for the
/// same node within `window`. A zero window disables suppression.
#[derive(Debug, Default)]
pub struct Deduplicator {
    window: Duration,
    last: HashMap<u16, DedupEntry>,
}

impl Deduplicator {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            last: HashMap::new(),
        }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    pub fn enabled(&self) -> bool {
        !self.window.is_zero()
    }

    /// Returns true if `report` should be published.
    pub fn accept(&mut self, report: &PowerReport, now: Instant) -> bool {
        if !self.enabled() {
            return true;
        }

        if let Some(entry) = self.last.get(&report.node_id) {
            if entry.signature == report.raw
                && now.saturating_duration_since(entry.accepted_at) < self.window
            {
                return false;
            }
        }

        self.last.insert(
            report.node_id,
            DedupEntry {
                accepted_at: now,
                signature: report.raw,
            },
        );

        true
    }
}
