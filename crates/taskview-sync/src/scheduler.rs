use std::collections::HashSet;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PollKind {
    History,
    Snapshot,
    Delta,
    Files,
}

impl PollKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PollKind::History => "history",
            PollKind::Snapshot => "snapshot",
            PollKind::Delta => "delta",
            PollKind::Files => "files",
        }
    }
}

/// Inputs the scheduler gates on at each tick.
#[derive(Debug, Clone, Copy, Default)]
pub struct PollGate {
    pub busy: bool,
    pub editing: bool,
    pub suspended: bool,
}

/// Fixed-period pull cadence, independent of push health.
#[derive(Debug, Clone)]
pub struct PollScheduler {
    snapshot_every: Duration,
    delta_every: Duration,
    files_every: Duration,
    next_snapshot: Option<Instant>,
    next_delta: Option<Instant>,
    next_files: Option<Instant>,
    next_history: Option<Instant>,
    in_flight: HashSet<PollKind>,
    backfilled: bool,
}

impl PollScheduler {
    pub fn new(snapshot_every: Duration, delta_every: Duration, files_every: Duration) -> Self {
        Self {
            snapshot_every,
            delta_every,
            files_every,
            next_snapshot: None,
            next_delta: None,
            next_files: None,
            next_history: None,
            in_flight: HashSet::new(),
            backfilled: false,
        }
    }

    pub fn backfilled(&self) -> bool {
        self.backfilled
    }

    pub fn in_flight(&self, kind: PollKind) -> bool {
        self.in_flight.contains(&kind)
    }

    /// Returns the polls to issue now and marks them in flight.
    pub fn due(&mut self, now: Instant, gate: PollGate) -> Vec<PollKind> {
        let mut due = Vec::new();
        if gate.suspended {
            return due;
        }
        if !self.backfilled && Self::ready(self.next_history, now) && !self.in_flight(PollKind::History) {
            self.next_history = Some(now + self.snapshot_every);
            due.push(PollKind::History);
        }
        if Self::ready(self.next_snapshot, now) && !self.in_flight(PollKind::Snapshot) {
            self.next_snapshot = Some(now + self.snapshot_every);
            due.push(PollKind::Snapshot);
        }
        if self.backfilled && Self::ready(self.next_delta, now) && !self.in_flight(PollKind::Delta) {
            self.next_delta = Some(now + self.delta_every);
            due.push(PollKind::Delta);
        }
        if gate.busy
            && !gate.editing
            && Self::ready(self.next_files, now)
            && !self.in_flight(PollKind::Files)
        {
            self.next_files = Some(now + self.files_every);
            due.push(PollKind::Files);
        }
        for kind in &due {
            self.in_flight.insert(*kind);
        }
        due
    }

    /// Claims an out-of-cadence poll (delta paging, on-demand file list).
    pub fn claim(&mut self, kind: PollKind) -> bool {
        if kind == PollKind::Delta && !self.backfilled {
            return false;
        }
        self.in_flight.insert(kind)
    }

    pub fn finished(&mut self, kind: PollKind) {
        self.in_flight.remove(&kind);
    }

    pub fn mark_backfilled(&mut self, now: Instant) {
        if !self.backfilled {
            self.backfilled = true;
            self.next_delta = Some(now + self.delta_every);
        }
    }

    fn ready(next: Option<Instant>, now: Instant) -> bool {
        next.map_or(true, |at| now >= at)
    }
}
