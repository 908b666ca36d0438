//! Periodic background work and the outbound chat queue.
//!
//! `PeriodicRoutine` generalizes the credits timer, the reconnect watchdog,
//! and anything else C7 needs to poll on every tick into one trait + a
//! typed registry, replacing a reflection-style "find the routine of this
//! type" lookup with ordinary `Vec` iteration. `OutboundQueue` is the
//! bounded, cloneable-sender channel producers (routines, the event
//! adapter) push chat replies into; C7 drains it once per tick, gated by
//! the cooldown.
//!
//! Design Notes:
//! - Kept intentionally narrow: name + start + tick. Anything heavier
//!   (filesystem discovery, sandboxing) is out of scope for a chat bot.
//! - `tick` returns the chat lines the routine wants sent, rather than
//!   reaching into a shared sender itself, so routines stay unit-testable
//!   without a channel in the loop.

use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender, TrySendError, bounded};

/// One independently-ticking background concern (credits announcements,
/// reconnect backoff, periodic stat logging, ...).
pub trait PeriodicRoutine: Send {
    /// Stable human-readable identifier (for logs/diagnostics).
    fn name(&self) -> &'static str;
    /// Called once when the routine is registered. Default no-op.
    fn start(&mut self) -> anyhow::Result<()> {
        Ok(())
    }
    /// Called on every runtime tick; returns any chat lines this routine
    /// wants enqueued onto the outbound queue this tick.
    fn tick(&mut self, now: Instant) -> Vec<String>;
}

/// Holds every registered routine and drives them uniformly each tick.
#[derive(Default)]
pub struct RoutineRegistry {
    routines: Vec<Box<dyn PeriodicRoutine>>,
}

impl RoutineRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<R: PeriodicRoutine + 'static>(&mut self, routine: R) {
        self.routines.push(Box::new(routine));
    }

    /// Calls `start` on every registered routine, short-circuiting (and
    /// returning) on the first error with which routine failed.
    pub fn start_all(&mut self) -> anyhow::Result<()> {
        for routine in &mut self.routines {
            routine
                .start()
                .map_err(|err| err.context(format!("routine '{}' failed to start", routine.name())))?;
        }
        Ok(())
    }

    /// Ticks every routine and returns the concatenation of everything they
    /// produced this tick, in registration order.
    pub fn tick_all(&mut self, now: Instant) -> Vec<String> {
        let mut out = Vec::new();
        for routine in &mut self.routines {
            out.extend(routine.tick(now));
        }
        out
    }

    pub fn len(&self) -> usize {
        self.routines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routines.is_empty()
    }
}

/// Bounded, cloneable-sender outbound chat queue. Producers push on
/// whatever thread they run on; C7 drains a budgeted number of messages
/// each tick once `MessageCooldown` has elapsed since the last send. Full
/// queues drop the newest message rather than blocking the producer, since
/// the producer is usually chat-event handling that must stay responsive.
#[derive(Clone)]
pub struct OutboundQueue {
    tx: Sender<String>,
    rx: Receiver<String>,
}

impl OutboundQueue {
    pub fn new(capacity: usize) -> Self {
        let (tx, rx) = bounded(capacity);
        Self { tx, rx }
    }

    pub fn sender(&self) -> Sender<String> {
        self.tx.clone()
    }

    pub fn push(&self, message: String) -> bool {
        match self.tx.try_send(message) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                core_events::OUTBOUND_DROPPED.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                tracing::warn!(target: "routines.outbound", "outbound queue full, dropping message");
                false
            }
            Err(TrySendError::Disconnected(_)) => false,
        }
    }

    /// Splits `message` at the configured `limit` (spec §6: "messages longer than the limit are
    /// split at a safe boundary") and pushes each resulting chunk in order. A limit of `0` or a
    /// message already within bounds is pushed unsplit. Returns the number of chunks pushed (each
    /// subject to the same drop-on-full policy as `push`).
    pub fn push_with_limit(&self, message: String, limit: usize) -> usize {
        if limit == 0 || message.chars().count() <= limit {
            self.push(message);
            return 1;
        }
        let mut pushed = 0;
        let mut remaining = message.as_str();
        while !remaining.is_empty() {
            let mut cut = remaining
                .char_indices()
                .nth(limit)
                .map(|(idx, _)| idx)
                .unwrap_or(remaining.len());
            if cut < remaining.len() {
                if let Some(space) = remaining[..cut].rfind(char::is_whitespace) {
                    if space > 0 {
                        cut = space;
                    }
                }
            }
            let (chunk, rest) = remaining.split_at(cut);
            self.push(chunk.trim_end().to_string());
            pushed += 1;
            remaining = rest.trim_start();
        }
        pushed
    }

    /// Pops the next queued message without blocking, or `None` if empty.
    pub fn pop(&self) -> Option<String> {
        match self.rx.try_recv() {
            Ok(msg) => {
                core_events::OUTBOUND_SENT.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                Some(msg)
            }
            Err(_) => None,
        }
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }
}

/// Exponential backoff with full jitter for the transport reconnect
/// routine, per the spec's "reconnect with exponential backoff and jitter"
/// error-handling policy.
pub struct ReconnectBackoff {
    base: Duration,
    max: Duration,
    attempt: u32,
}

impl ReconnectBackoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self { base, max, attempt: 0 }
    }

    /// Computes the next delay and advances the attempt counter. Delay grows
    /// as `base * 2^attempt`, capped at `max`, then jittered uniformly in
    /// `[0, delay]` so many simultaneous reconnects don't all retry at once.
    pub fn next_delay(&mut self) -> Duration {
        let exp = self.base.saturating_mul(1u32.checked_shl(self.attempt).unwrap_or(u32::MAX));
        let capped = exp.min(self.max);
        self.attempt = self.attempt.saturating_add(1);
        let jitter_fraction: f64 = rand::random::<f64>();
        capped.mul_f64(jitter_fraction)
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }
}
