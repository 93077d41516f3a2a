use std::fmt;
use std::time::{Duration, Instant};
use tracing::{info, warn};

pub const DEFAULT_THROTTLE: Duration = Duration::from_millis(2_500);
const TRANSIENT_THRESHOLD: u32 = 2;

/// User-facing classification of a failed call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureTier {
    /// Connect error or timeout.
    Unreachable,
    Unauthorized,
    NotFound,
    /// 409 or a busy answer.
    Conflict,
    ServerError,
    /// Body could not be decoded.
    Malformed,
}

impl FailureTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureTier::Unreachable => "unreachable",
            FailureTier::Unauthorized => "unauthorized",
            FailureTier::NotFound => "not_found",
            FailureTier::Conflict => "conflict",
            FailureTier::ServerError => "server_error",
            FailureTier::Malformed => "malformed",
        }
    }

    pub fn message(&self) -> &'static str {
        match self {
            FailureTier::Unreachable => "server unreachable; retrying",
            FailureTier::Unauthorized => "not authorized; check the admin token and restart",
            FailureTier::NotFound => "not found; the task may have been deleted",
            FailureTier::Conflict => "server busy; try again shortly",
            FailureTier::ServerError => "server error; retrying",
            FailureTier::Malformed => "unexpected response from server",
        }
    }

    /// Transient tiers wait for a repeat before they are shown.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            FailureTier::Unreachable | FailureTier::ServerError | FailureTier::Malformed
        )
    }
}

impl fmt::Display for FailureTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HealthSignal {
    Quiet,
    Show(String),
    Cleared,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthWarning {
    pub source: &'static str,
    pub tier: FailureTier,
    pub message: String,
}

/// Consecutive-failure counter with per-message throttling.
///
/// One counter covers every source: any successful call resets it and
/// clears whatever warning is showing.
#[derive(Debug, Clone)]
pub struct HealthMonitor {
    throttle: Duration,
    consecutive: u32,
    visible: Option<HealthWarning>,
    last_shown: Option<(String, Instant)>,
    auth_blocked: bool,
}

impl HealthMonitor {
    pub fn new(throttle: Duration) -> Self {
        Self {
            throttle,
            consecutive: 0,
            visible: None,
            last_shown: None,
            auth_blocked: false,
        }
    }

    pub fn visible(&self) -> Option<&HealthWarning> {
        self.visible.as_ref()
    }

    /// Polling stays off once the server rejected our credentials.
    pub fn auth_blocked(&self) -> bool {
        self.auth_blocked
    }

    pub fn record_failure(
        &mut self,
        source: &'static str,
        tier: FailureTier,
        detail: &str,
        now: Instant,
    ) -> HealthSignal {
        self.consecutive = self.consecutive.saturating_add(1);
        let count = self.consecutive;
        warn!("transport_failure: source={source} tier={tier} count={count} detail={detail}");

        if tier == FailureTier::Unauthorized {
            self.auth_blocked = true;
        }
        if tier.is_transient() && count < TRANSIENT_THRESHOLD {
            return HealthSignal::Quiet;
        }

        let message = format!("{source}: {}", tier.message());
        self.visible = Some(HealthWarning {
            source,
            tier,
            message: message.clone(),
        });
        if let Some((last, at)) = &self.last_shown {
            if *last == message && now.saturating_duration_since(*at) < self.throttle {
                return HealthSignal::Quiet;
            }
        }
        self.last_shown = Some((message.clone(), now));
        HealthSignal::Show(message)
    }

    pub fn record_success(&mut self, source: &'static str) -> HealthSignal {
        self.consecutive = 0;
        self.auth_blocked = false;
        let Some(warning) = self.visible.take() else {
            return HealthSignal::Quiet;
        };
        info!("transport_recovered: source={source} cleared={}", warning.source);
        self.last_shown = None;
        HealthSignal::Cleared
    }
}

impl Default for HealthMonitor {
    fn default() -> Self {
        Self::new(DEFAULT_THROTTLE)
    }
}
