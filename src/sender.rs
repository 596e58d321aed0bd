//! Batching sender: drains the queue, flushes on size or interval, retries with
//! exponential backoff.

use crate::client::{ClientError, ServerApi};
use crate::config::SenderConfig;
use crate::event::{Event, EventBatch};
use crate::queue::QueueConsumer;
use crate::state::SharedState;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Result of delivering one batch.
#[derive(Debug)]
pub enum FlushOutcome {
    Sent { attempts: u32 },
    Failed { attempts: u32, error: ClientError },
}

impl FlushOutcome {
    pub fn is_sent(&self) -> bool {
        matches!(self, FlushOutcome::Sent { .. })
    }

    pub fn attempts(&self) -> u32 {
        match self {
            FlushOutcome::Sent { attempts } | FlushOutcome::Failed { attempts, .. } => *attempts,
        }
    }
}

pub struct BatchSender {
    config: SenderConfig,
    api: Arc<dyn ServerApi>,
    state: SharedState,
}

impl BatchSender {
    pub fn new(config: SenderConfig, api: Arc<dyn ServerApi>, state: SharedState) -> Self {
        Self { config, api, state }
    }

    fn batch_size(&self) -> usize {
        self.config.batch_size.max(1)
    }

    /// Delay before retry `n` (1-based): `retry_delay * 2^(n-1)`, capped.
    pub fn backoff_delay(&self, n: u32) -> Duration {
        let base = self.config.retry_delay();
        let cap = self.config.max_retry_delay().max(base);
        let factor = 1u32.checked_shl(n.saturating_sub(1)).unwrap_or(u32::MAX);
        base.checked_mul(factor).map_or(cap, |d| d.min(cap))
    }

    /// Run until cancelled or the queue closes, then flush what is left.
    pub async fn run(self, mut queue: QueueConsumer, cancel: CancellationToken) {
        let batch_size = self.batch_size();
        let interval = self.config.send_interval();
        let mut pending: Vec<Event> = Vec::with_capacity(batch_size);
        let mut deadline = Instant::now() + interval;

        info!(batch_size, interval_secs = interval.as_secs(), "sender started");

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                next = queue.dequeue() => match next {
                    Some(ev) => {
                        pending.push(ev);
                        if pending.len() >= batch_size {
                            self.flush(&mut pending, &cancel).await;
                            deadline = Instant::now() + interval;
                        }
                    }
                    None => break,
                },
                _ = sleep_until(deadline) => {
                    if !pending.is_empty() {
                        self.flush(&mut pending, &cancel).await;
                    }
                    deadline = Instant::now() + interval;
                }
            }
        }

        // The final flush gets one attempt per batch so it fits the shutdown grace.
        cancel.cancel();
        pending.extend(queue.drain());
        let remaining = pending.len();
        while !pending.is_empty() {
            self.flush(&mut pending, &cancel).await;
        }
        info!(flushed = remaining, "sender stopped");
    }

    /// Send up to one batch worth of events from the front of `pending`.
    async fn flush(&self, pending: &mut Vec<Event>, cancel: &CancellationToken) {
        let n = pending.len().min(self.batch_size());
        let events: Vec<Event> = pending.drain(..n).collect();
        self.send_batch(events, cancel).await;
    }

    /// Deliver one batch, updating counters. Never re-queues.
    ///
    /// Once `cancel` fires no further retries are made and the batch is
    /// counted as failed.
    pub async fn send_batch(&self, mut events: Vec<Event>, cancel: &CancellationToken) -> FlushOutcome {
        let agent_id = self.state.agent_id();
        for ev in &mut events {
            ev.stamp_agent_id(&agent_id);
        }
        let count = events.len() as u64;
        let batch = EventBatch::new(agent_id, events);

        let outcome = self.deliver(&batch, cancel).await;
        match &outcome {
            FlushOutcome::Sent { attempts } => {
                self.state.record_batch_sent(count);
                debug!(batch_id = %batch.batch_id, events = count, attempts, "batch sent");
            }
            FlushOutcome::Failed { attempts, error } => {
                self.state.record_batch_failed(count);
                warn!(
                    batch_id = %batch.batch_id,
                    events = count,
                    attempts,
                    error = %error,
                    "batch dropped"
                );
            }
        }
        outcome
    }

    async fn deliver(&self, batch: &EventBatch, cancel: &CancellationToken) -> FlushOutcome {
        let max_attempts = self.config.retry_attempts.saturating_add(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.api.send_events(batch).await {
                Ok(()) => {
                    if attempt > 1 {
                        info!(attempts = attempt, "batch sent after retry");
                    }
                    return FlushOutcome::Sent { attempts: attempt };
                }
                Err(error) => {
                    if attempt >= max_attempts || !error.is_retryable() || cancel.is_cancelled() {
                        return FlushOutcome::Failed {
                            attempts: attempt,
                            error,
                        };
                    }
                    let delay = self.backoff_delay(attempt);
                    warn!(
                        attempt,
                        max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %error,
                        "batch send failed, retrying"
                    );
                    tokio::select! {
                        _ = cancel.cancelled() => {
                            return FlushOutcome::Failed {
                                attempts: attempt,
                                error,
                            };
                        }
                        _ = sleep(delay) => {}
                    }
                }
            }
        }
    }
}
