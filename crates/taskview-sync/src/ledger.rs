use std::collections::BTreeSet;
use tracing::debug;

pub const DEFAULT_LATE_FILL_WINDOW: u64 = 1024;

/// Outcome of offering a seq-bearing event to the ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Moved the high-water mark forward.
    Advanced,
    /// Below the high-water mark but inside the window and never seen.
    LateFill,
    Duplicate,
    /// Older than the window, or seq 0.
    Stale,
}

impl Admission {
    pub fn is_accepted(self) -> bool {
        matches!(self, Admission::Advanced | Admission::LateFill)
    }
}

/// High-water-mark cursor plus a bounded record of recently accepted seqs.
#[derive(Debug, Clone)]
pub struct SeqLedger {
    last_seq: u64,
    last_ts: f64,
    window: u64,
    accepted: BTreeSet<u64>,
}

impl SeqLedger {
    pub fn new(window: u64) -> Self {
        Self {
            last_seq: 0,
            last_ts: 0.0,
            window,
            accepted: BTreeSet::new(),
        }
    }

    pub fn last_seq(&self) -> u64 {
        self.last_seq
    }

    pub fn last_ts(&self) -> f64 {
        self.last_ts
    }

    pub fn accept(&mut self, seq: u64, ts: f64) -> bool {
        self.admit(seq, ts).is_accepted()
    }

    pub fn admit(&mut self, seq: u64, ts: f64) -> Admission {
        if seq == 0 {
            return Admission::Stale;
        }
        if seq > self.last_seq {
            self.accepted.insert(seq);
            self.last_seq = seq;
            if ts.is_finite() && ts > self.last_ts {
                self.last_ts = ts;
            }
            self.prune();
            return Admission::Advanced;
        }
        if seq < self.floor() {
            debug!("ledger_stale_seq: seq={seq} last_seq={}", self.last_seq);
            return Admission::Stale;
        }
        if !self.accepted.insert(seq) {
            return Admission::Duplicate;
        }
        // ts stays a tie-break hint; a late fill never moves it backwards.
        if ts.is_finite() && ts > self.last_ts {
            self.last_ts = ts;
        }
        debug!("ledger_late_fill: seq={seq} last_seq={}", self.last_seq);
        Admission::LateFill
    }

    fn floor(&self) -> u64 {
        self.last_seq.saturating_sub(self.window)
    }

    fn prune(&mut self) {
        let floor = self.floor();
        if floor == 0 {
            return;
        }
        self.accepted = self.accepted.split_off(&floor);
    }
}

impl Default for SeqLedger {
    fn default() -> Self {
        Self::new(DEFAULT_LATE_FILL_WINDOW)
    }
}
