use std::time::{Duration, Instant};

/// Token handed out by [`LazyCache::begin`]; only the matching completion is applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchTicket(u64);

impl FetchTicket {
    pub fn id(&self) -> u64 {
        self.0
    }
}

/// Pull-through cache filled on demand with at most one fetch in flight.
///
/// There is no expiry. A value is replaced only by a later successful fetch,
/// and fetches are spaced by `min_interval` measured from the start of the
/// last successful one.
#[derive(Debug, Clone)]
pub struct LazyCache<T> {
    value: Option<T>,
    min_interval: Duration,
    generation: u64,
    in_flight: Option<(u64, Instant)>,
    last_success: Option<Instant>,
}

impl<T> LazyCache<T> {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            value: None,
            min_interval,
            generation: 0,
            in_flight: None,
            last_success: None,
        }
    }

    pub fn value(&self) -> Option<&T> {
        self.value.as_ref()
    }

    /// Dependents render a placeholder until the first value lands.
    pub fn is_loading(&self) -> bool {
        self.value.is_none()
    }

    pub fn is_fetching(&self) -> bool {
        self.in_flight.is_some()
    }

    pub fn begin(&mut self, now: Instant) -> Option<FetchTicket> {
        if self.in_flight.is_some() {
            return None;
        }
        if let Some(last) = self.last_success {
            if now.saturating_duration_since(last) < self.min_interval {
                return None;
            }
        }
        self.generation += 1;
        self.in_flight = Some((self.generation, now));
        Some(FetchTicket(self.generation))
    }

    /// Stores the value if `ticket` is the fetch currently in flight.
    pub fn complete(&mut self, ticket: FetchTicket, value: T) -> bool {
        match self.in_flight {
            Some((id, started)) if id == ticket.0 => {
                self.in_flight = None;
                self.last_success = Some(started);
                self.value = Some(value);
                true
            }
            _ => false,
        }
    }

    pub fn fail(&mut self, ticket: FetchTicket) -> bool {
        match self.in_flight {
            Some((id, _)) if id == ticket.0 => {
                self.in_flight = None;
                true
            }
            _ => false,
        }
    }
}
