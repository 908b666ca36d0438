//! Core event types and channel helpers for the input-sequence bot runtime.
//!
//! The owner thread (C7, `bot-bin`) drains a single bounded `tokio::mpsc`
//! channel of `Event`s. Producers — the chat transport, the tick source —
//! never touch shared state directly; they only push `Event`s here.

use std::sync::atomic::AtomicU64;
use tokio::sync::mpsc::Sender;
use tokio::task::JoinHandle;

// -------------------------------------------------------------------------------------------------
// Channel policy
// -------------------------------------------------------------------------------------------------
// A bounded mpsc channel sized by `EVENT_CHANNEL_CAP` provides memory safety and natural producer
// backpressure. The single transport producer uses `send().await`, which will park rather than
// drop events until space is available: preserving input fidelity is preferred over lossy behavior
// on this channel specifically (the separate *outbound* chat queue, owned by core-routines, is
// where overflow-drop policy actually applies).
pub const EVENT_CHANNEL_CAP: usize = 4096;

// -------------------------------------------------------------------------------------------------
// Telemetry
// -------------------------------------------------------------------------------------------------
// Simple atomic counters (no locking, relaxed fetch_add). Minimal on purpose; a future metrics
// crate integration can export them via structured events. Inspectable in tests or periodically
// logged by a periodic routine.
pub static MESSAGES_RECEIVED: AtomicU64 = AtomicU64::new(0);
pub static EXPANSIONS_FAILED: AtomicU64 = AtomicU64::new(0);
pub static INPUTS_PARSED_VALID: AtomicU64 = AtomicU64::new(0);
pub static INPUTS_PARSED_REJECTED: AtomicU64 = AtomicU64::new(0);
pub static SEQUENCES_EXECUTED: AtomicU64 = AtomicU64::new(0);
pub static SEQUENCES_CANCELLED: AtomicU64 = AtomicU64::new(0);
pub static OUTBOUND_SENT: AtomicU64 = AtomicU64::new(0);
pub static OUTBOUND_DROPPED: AtomicU64 = AtomicU64::new(0);
pub static PORT_QUEUE_OVERFLOWS: AtomicU64 = AtomicU64::new(0);
pub static RECONNECT_ATTEMPTS: AtomicU64 = AtomicU64::new(0);

/// Events raised by the chat transport (spec §6, "consumed" events). Whisper/host/sub events carry
/// just enough to drive the periodic-routine and chat-reply surfaces that sit outside this core;
/// the input pipeline only ever reacts to `MessageReceived`.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    Connected,
    Disconnected,
    Reconnected,
    JoinedChannel { channel: String },
    MessageReceived { user: String, text: String },
    WhisperReceived { user: String, text: String },
    HostReceived { host_user: String, viewers: u32 },
    Subscription { user: String },
    Resubscription { user: String, months: u32 },
}

/// Top-level event enum consumed by the central event/tick loop (C7).
#[derive(Debug, Clone)]
pub enum Event {
    Transport(TransportEvent),
    /// Periodic monotonic tick driving the tick-loop's cooldown drain and registered routines.
    Tick,
    Shutdown,
}

// -------------------------------------------------------------------------------------------------
// Event hooks (no-op scaffolding)
// -------------------------------------------------------------------------------------------------
/// Optional hooks observing events at the loop boundary. Kept minimal to avoid cross-crate
/// coupling; higher layers can supply their own for diagnostics.
pub trait EventHooks: Send + Sync + 'static {
    fn pre_handle(&self, _event: &Event) {}
    fn post_handle(&self, _event: &Event) {}
}

pub struct NoopEventHooks;

impl EventHooks for NoopEventHooks {}

// -------------------------------------------------------------------------------------------------
// Async event sources
// -------------------------------------------------------------------------------------------------
// Generalizes the ad-hoc tick task into a unified trait so future producers (transport reconnects,
// whisper pollers) register uniformly. Each source owns its own async task lifecycle; on channel
// send failure (consumer dropped) it must terminate promptly.

/// Trait implemented by any async event producer. Implementors usually hold configuration and
/// spawn one background task that pushes `Event`s into the shared channel.
pub trait AsyncEventSource: Send + 'static {
    /// Human-readable stable identifier (used for logging / diagnostics).
    fn name(&self) -> &'static str;
    /// Consume self and spawn the background task, returning a JoinHandle. Implementors should
    /// stop when `tx.send(..).await` returns Err (channel closed) or on their own internal stop
    /// condition, and must avoid busy loops by awaiting timers or external IO futures.
    fn spawn(self: Box<Self>, tx: Sender<Event>) -> JoinHandle<()>;
}

// -------------------------------------------------------------------------------------------------
// Chat transport (outbound half)
// -------------------------------------------------------------------------------------------------
// `AsyncEventSource` covers the inbound half (events raised by the transport); `ChatTransport`
// covers `SendMessage` (spec §6). Kept as its own trait since a real IRC-style client's send path
// and receive loop usually run over different halves of the same connection and are implemented
// independently, even though both sides typically share one concrete struct.

/// Outbound half of the chat transport: delivers one reply line. Implementors back the same
/// transport whose inbound events arrive as `TransportEvent::MessageReceived`.
pub trait ChatTransport: Send + Sync {
    fn send_message(&self, text: &str) -> anyhow::Result<()>;
}

/// Registry of event sources. Stores boxed trait objects and spawns them all at startup.
#[derive(Default)]
pub struct EventSourceRegistry {
    sources: Vec<Box<dyn AsyncEventSource>>,
}

impl EventSourceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<S: AsyncEventSource>(&mut self, source: S) {
        self.sources.push(Box::new(source));
    }

    pub fn spawn_all(&mut self, tx: &Sender<Event>) -> Vec<JoinHandle<()>> {
        let mut out = Vec::with_capacity(self.sources.len());
        for src in self.sources.drain(..) {
            let name = src.name();
            tracing::info!(target: "runtime.events", source = name, "spawning event source");
            out.push(src.spawn(tx.clone()));
        }
        out
    }
}

/// Built-in monotonic tick source. Emits `Event::Tick` every configured interval, clamped by the
/// caller to `[MinSleepTime, MaxSleepTime]` per spec §4.7.
pub struct TickEventSource {
    interval: std::time::Duration,
}

impl TickEventSource {
    pub fn new(interval: std::time::Duration) -> Self {
        Self { interval }
    }
}

impl AsyncEventSource for TickEventSource {
    fn name(&self) -> &'static str {
        "tick"
    }
    fn spawn(self: Box<Self>, tx: Sender<Event>) -> JoinHandle<()> {
        let dur = self.interval;
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(dur);
            loop {
                interval.tick().await;
                if tx.send(Event::Tick).await.is_err() {
                    break;
                }
            }
        })
    }
}
