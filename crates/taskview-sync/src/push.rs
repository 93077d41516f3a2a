use crate::transport::TaskApi;
use eventsource_stream::Eventsource;
use futures_util::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use taskview_core::wire::{decode_push_frame, PushFrame};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq)]
pub enum PushEvent {
    Connected,
    Frame(PushFrame),
    Disconnected { reason: String },
}

#[derive(Debug, Clone, Copy)]
pub struct PushBackoff {
    pub initial: Duration,
    pub max: Duration,
}

/// Keeps the push channel open, reconnecting with backoff, until the
/// receiving side goes away. Events are decoded only as far as JSON;
/// routing and dedup happen downstream.
pub async fn run_push_listener(
    api: Arc<dyn TaskApi>,
    tx: mpsc::Sender<PushEvent>,
    backoff_policy: PushBackoff,
) {
    let mut backoff = backoff_policy.initial;

    loop {
        if tx.is_closed() {
            return;
        }
        let stream = match api.open_push().await {
            Ok(stream) => stream,
            Err(err) => {
                warn!("push_connect_error: {err}");
                let reason = err.to_string();
                if tx.send(PushEvent::Disconnected { reason }).await.is_err() {
                    return;
                }
                tokio::time::sleep(backoff).await;
                backoff = next_backoff(backoff, backoff_policy.max);
                continue;
            }
        };
        backoff = backoff_policy.initial;
        info!("push_connected");
        if tx.send(PushEvent::Connected).await.is_err() {
            return;
        }

        let mut events = Box::pin(stream.eventsource());
        let reason = loop {
            match events.next().await {
                Some(Ok(event)) => match decode_push_frame(&event.event, &event.data) {
                    Ok(push) => {
                        debug!("push_frame: type={}", push.kind);
                        if tx.send(PushEvent::Frame(push)).await.is_err() {
                            return;
                        }
                    }
                    Err(err) => warn!("push_frame_invalid: event={} err={err}", event.event),
                },
                Some(Err(err)) => break err.to_string(),
                None => break "stream closed".to_string(),
            }
        };

        warn!("push_disconnected: {reason}");
        if tx.send(PushEvent::Disconnected { reason }).await.is_err() {
            return;
        }
        tokio::time::sleep(backoff).await;
        backoff = next_backoff(backoff, backoff_policy.max);
    }
}

pub fn next_backoff(current: Duration, max: Duration) -> Duration {
    let next = current + current;
    if next > max {
        max
    } else {
        next
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_up_to_cap() {
        let max = Duration::from_secs(10);
        let mut delay = Duration::from_secs(1);
        let mut seen = Vec::new();
        for _ in 0..6 {
            delay = next_backoff(delay, max);
            seen.push(delay.as_secs());
        }
        assert_eq!(seen, vec![2, 4, 8, 10, 10, 10]);
    }
}
