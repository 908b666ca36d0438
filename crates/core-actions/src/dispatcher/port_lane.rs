//! Per-port FIFO worker lanes. Each port gets its own queue and background
//! task so different ports execute fully in parallel; within a port,
//! sequences drain strictly in arrival order. A lane that falls behind
//! drops its oldest queued sequence rather than growing unbounded or
//! blocking the caller — staying responsive to new chat input matters more
//! than guaranteeing every queued sequence eventually runs.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};

use core_hid::VirtualHidBackend;
use core_input::{InputSequence, ParserConfig};
use core_state::ControllerManager;
use tokio::sync::Notify;

use super::cancel::CancelToken;
use super::hold::HeldSet;

pub const PORT_QUEUE_CAPACITY: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionOutcome {
    Completed,
    Cancelled,
    /// A chord hit a device error partway through; everything held was
    /// released before giving up on the rest of the sequence.
    Dropped,
}

pub struct ExecutionRequest {
    pub port: usize,
    pub sequence: InputSequence,
}

struct DropOldestQueue<T> {
    inner: Mutex<VecDeque<T>>,
    notify: Notify,
    capacity: usize,
}

impl<T> DropOldestQueue<T> {
    fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(VecDeque::with_capacity(capacity)),
            notify: Notify::new(),
            capacity,
        }
    }

    fn push(&self, item: T) {
        let mut guard = self.inner.lock().expect("port queue lock poisoned");
        if guard.len() >= self.capacity {
            guard.pop_front();
            core_events::PORT_QUEUE_OVERFLOWS.fetch_add(1, Ordering::Relaxed);
        }
        guard.push_back(item);
        drop(guard);
        self.notify.notify_one();
    }

    async fn pop(&self) -> T {
        loop {
            {
                let mut guard = self.inner.lock().expect("port queue lock poisoned");
                if let Some(item) = guard.pop_front() {
                    return item;
                }
            }
            self.notify.notified().await;
        }
    }
}

struct PortLane {
    queue: Arc<DropOldestQueue<ExecutionRequest>>,
    cancel: CancelToken,
}

/// Owns the shared controller state and one worker lane per port.
pub struct Executor<B: VirtualHidBackend + 'static> {
    controllers: Arc<Mutex<ControllerManager<B>>>,
    lanes: HashMap<usize, PortLane>,
}

impl<B: VirtualHidBackend + 'static> Executor<B> {
    pub fn new(controllers: ControllerManager<B>, cfg: ParserConfig) -> Self {
        let port_count = controllers.port_count();
        let controllers = Arc::new(Mutex::new(controllers));
        let mut lanes = HashMap::with_capacity(port_count);
        for port in 0..port_count {
            let queue = Arc::new(DropOldestQueue::new(PORT_QUEUE_CAPACITY));
            let cancel = CancelToken::new();
            spawn_lane(controllers.clone(), queue.clone(), cancel.clone(), cfg.clone());
            lanes.insert(port, PortLane { queue, cancel });
        }
        Self { controllers, lanes }
    }

    /// Enqueues a sequence for its port's lane. Returns `false` if the port
    /// has no lane (out of range), in which case the caller has already
    /// failed port validation upstream and this should not happen.
    pub fn submit(&self, request: ExecutionRequest) -> bool {
        match self.lanes.get(&request.port) {
            Some(lane) => {
                lane.queue.push(request);
                true
            }
            None => false,
        }
    }

    /// Requests cancellation of whatever sequence `port`'s lane is currently
    /// running. Polled between subsequences, so a chord in progress still
    /// finishes atomically.
    pub fn cancel_port(&self, port: usize) {
        if let Some(lane) = self.lanes.get(&port) {
            lane.cancel.cancel();
        }
    }

    pub fn controllers(&self) -> &Arc<Mutex<ControllerManager<B>>> {
        &self.controllers
    }
}

fn spawn_lane<B: VirtualHidBackend + 'static>(
    controllers: Arc<Mutex<ControllerManager<B>>>,
    queue: Arc<DropOldestQueue<ExecutionRequest>>,
    cancel: CancelToken,
    cfg: ParserConfig,
) {
    tokio::spawn(async move {
        let mut held = HeldSet::new();
        loop {
            let request = queue.pop().await;
            let outcome = run_sequence(&request, &controllers, &mut held, &cfg, &cancel).await;
            tracing::debug!(target: "actions.executor", port = request.port, outcome = ?outcome, "sequence executed");
        }
    });
}

async fn run_sequence<B: VirtualHidBackend>(
    request: &ExecutionRequest,
    controllers: &Arc<Mutex<ControllerManager<B>>>,
    held: &mut HeldSet,
    cfg: &ParserConfig,
    cancel: &CancelToken,
) -> ExecutionOutcome {
    for sub in &request.sequence.subsequences {
        if cancel.take_and_reset() {
            held.release_all(controllers);
            core_events::SEQUENCES_CANCELLED.fetch_add(1, Ordering::Relaxed);
            return ExecutionOutcome::Cancelled;
        }
        if let Err(err) = super::chord::apply_chord(controllers, request.port, sub, held, cfg).await {
            tracing::warn!(target: "actions.executor", port = request.port, error = %err, "chord failed, abandoning sequence");
            held.release_all(controllers);
            return ExecutionOutcome::Dropped;
        }
    }
    held.release_all(controllers);
    core_events::SEQUENCES_EXECUTED.fetch_add(1, Ordering::Relaxed);
    ExecutionOutcome::Completed
}

#[cfg(test)]
mod tests {
    use super::*;
    use core_hid::NullHidBackend;
    use core_input::{DurationUnit, Input, InputSubSequence};
    use std::time::Duration;

    fn quick_sequence(name: &str) -> InputSequence {
        InputSequence {
            subsequences: vec![InputSubSequence {
                inputs: vec![Input {
                    name: name.to_string(),
                    port: None,
                    duration_value: 1,
                    duration_unit: DurationUnit::Ms,
                    hold: false,
                    release: false,
                    percent: None,
                }],
            }],
            total_duration_ms: 1,
            outcome: core_input::ValidationOutcome::Valid,
        }
    }

    #[tokio::test]
    async fn submitted_sequence_presses_and_releases() {
        let mut mgr = ControllerManager::new(NullHidBackend::new(), 1);
        mgr.acquire(0).unwrap();
        let executor = Executor::new(mgr, ParserConfig::default());
        assert!(executor.submit(ExecutionRequest {
            port: 0,
            sequence: quick_sequence("a"),
        }));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!executor.controllers().lock().unwrap().is_pressed(0, "a"));
    }

    #[tokio::test]
    async fn submit_to_unknown_port_fails() {
        let mgr = ControllerManager::new(NullHidBackend::new(), 1);
        let executor = Executor::new(mgr, ParserConfig::default());
        assert!(!executor.submit(ExecutionRequest {
            port: 7,
            sequence: quick_sequence("a"),
        }));
    }

    #[tokio::test]
    async fn queue_drops_oldest_when_full() {
        let queue = DropOldestQueue::new(2);
        queue.push(1);
        queue.push(2);
        queue.push(3);
        assert_eq!(queue.pop().await, 2);
        assert_eq!(queue.pop().await, 3);
    }
}
