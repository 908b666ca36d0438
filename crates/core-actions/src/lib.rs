//! Executor: turns a validated `InputSequence` into per-port HID calls.
//!
//! Module decomposition:
//! * `port_lane` - bounded per-port queue and worker task, oldest-drop overflow
//! * `chord`     - applying one subsequence (press, single update, sleep, release)
//! * `hold`      - carrying `_`/`-` held state across subsequences of one sequence
//! * `cancel`    - cooperative cancellation polled between subsequences
//!
//! Different ports run fully in parallel (one worker task each); within a
//! port, sequences execute strictly FIFO and a chord's press/update/sleep/
//! release never interleaves with another chord on the same port.

mod dispatcher;

pub use dispatcher::cancel::CancelToken;
pub use dispatcher::port_lane::{ExecutionOutcome, ExecutionRequest, Executor, PORT_QUEUE_CAPACITY};
