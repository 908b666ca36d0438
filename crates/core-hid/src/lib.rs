//! Virtual HID backend abstraction.
//!
//! A `VirtualHidBackend` owns zero or more virtual gamepad devices and accepts
//! button/axis calls for a given port. The bot never talks to real hardware:
//! ship builds wire up whatever backend a deployment target provides, while
//! `NullHidBackend` below records calls for tests and for hosts with no
//! gamepad emulation available at all.

use std::sync::Mutex;
use thiserror::Error;

/// Bounds a deployment clamps the requested controller count to (spec's
/// `GetMinControllerCount`/`GetMaxControllerCount`). `NullHidBackend` has no
/// real device limit, so these are generous constants rather than a query
/// against hardware.
pub const MIN_CONTROLLER_COUNT: usize = 1;
pub const MAX_CONTROLLER_COUNT: usize = 8;

#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("port {0} has no acquired device")]
    NotAcquired(usize),
    #[error("device on port {0} is gone")]
    DeviceGone(usize),
}

/// One recorded call against a virtual device, used by `NullHidBackend` and tests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HidCall {
    Acquire { port: usize },
    Release { port: usize },
    Press { port: usize, button: String },
    Release_ { port: usize, button: String },
    SetAxis { port: usize, axis: String, value: i16 },
    Update { port: usize },
}

/// An acquired handle to a single virtual controller slot.
pub struct DeviceHandle {
    pub port: usize,
}

/// Backend trait implemented by whatever virtual-gamepad mechanism a deployment
/// target provides. All methods are synchronous: the executor (core-actions)
/// calls them directly from its per-port worker lane, never across an await
/// point, so a backend never needs to be `Send`-shared beyond that lane.
pub trait VirtualHidBackend: Send {
    /// Acquire a device for `port`, returning a handle or an error if the
    /// underlying OS/driver refuses (out of slots, permission denied, etc).
    fn acquire(&mut self, port: usize) -> Result<DeviceHandle, DeviceError>;
    /// Release a previously acquired device. Must be idempotent.
    fn release(&mut self, port: usize);
    fn press(&mut self, port: usize, button: &str) -> Result<(), DeviceError>;
    fn release_button(&mut self, port: usize, button: &str) -> Result<(), DeviceError>;
    fn set_axis(&mut self, port: usize, axis: &str, value: i16) -> Result<(), DeviceError>;
    /// Commits the button/axis state queued by `press`/`release_button`/`set_axis`
    /// since the last `update` in one atomic report to the device. The executor
    /// calls this exactly once per chord, never in the middle of applying one.
    fn update(&mut self, port: usize) -> Result<(), DeviceError>;
}

/// A backend that performs no real I/O: it records every call it receives and
/// logs at trace level instead of touching hardware. Used by `bot-bin` when no
/// real gamepad-emulation driver is configured, and by tests throughout the
/// executor and controller-manager layers.
#[derive(Default)]
pub struct NullHidBackend {
    acquired: Vec<bool>,
    calls: Mutex<Vec<HidCall>>,
}

impl NullHidBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> Vec<HidCall> {
        self.calls.lock().expect("null backend call log poisoned").clone()
    }

    fn ensure_slot(&mut self, port: usize) {
        if self.acquired.len() <= port {
            self.acquired.resize(port + 1, false);
        }
    }

    fn record(&self, call: HidCall) {
        self.calls.lock().expect("null backend call log poisoned").push(call);
    }
}

impl VirtualHidBackend for NullHidBackend {
    fn acquire(&mut self, port: usize) -> Result<DeviceHandle, DeviceError> {
        self.ensure_slot(port);
        self.acquired[port] = true;
        self.record(HidCall::Acquire { port });
        tracing::trace!(target: "hid.null", port, "acquire");
        Ok(DeviceHandle { port })
    }

    fn release(&mut self, port: usize) {
        self.ensure_slot(port);
        self.acquired[port] = false;
        self.record(HidCall::Release { port });
        tracing::trace!(target: "hid.null", port, "release");
    }

    fn press(&mut self, port: usize, button: &str) -> Result<(), DeviceError> {
        self.ensure_slot(port);
        if !self.acquired[port] {
            return Err(DeviceError::NotAcquired(port));
        }
        self.record(HidCall::Press {
            port,
            button: button.to_string(),
        });
        tracing::trace!(target: "hid.null", port, button, "press");
        Ok(())
    }

    fn release_button(&mut self, port: usize, button: &str) -> Result<(), DeviceError> {
        self.ensure_slot(port);
        if !self.acquired[port] {
            return Err(DeviceError::NotAcquired(port));
        }
        self.record(HidCall::Release_ {
            port,
            button: button.to_string(),
        });
        tracing::trace!(target: "hid.null", port, button, "release_button");
        Ok(())
    }

    fn set_axis(&mut self, port: usize, axis: &str, value: i16) -> Result<(), DeviceError> {
        self.ensure_slot(port);
        if !self.acquired[port] {
            return Err(DeviceError::NotAcquired(port));
        }
        self.record(HidCall::SetAxis {
            port,
            axis: axis.to_string(),
            value,
        });
        tracing::trace!(target: "hid.null", port, axis, value, "set_axis");
        Ok(())
    }

    fn update(&mut self, port: usize) -> Result<(), DeviceError> {
        self.ensure_slot(port);
        if !self.acquired[port] {
            return Err(DeviceError::NotAcquired(port));
        }
        self.record(HidCall::Update { port });
        tracing::trace!(target: "hid.null", port, "update");
        Ok(())
    }
}

/// RAII guard ensuring a virtual controller's device slot is released even if
/// the caller early-returns or panics while holding it.
pub struct RaiiControllerGuard<'a> {
    backend: &'a mut dyn VirtualHidBackend,
    port: usize,
    active: bool,
}

impl<'a> RaiiControllerGuard<'a> {
    pub fn acquire(
        backend: &'a mut dyn VirtualHidBackend,
        port: usize,
    ) -> Result<Self, DeviceError> {
        backend.acquire(port)?;
        Ok(Self {
            backend,
            port,
            active: true,
        })
    }

    pub fn port(&self) -> usize {
        self.port
    }

    pub fn press(&mut self, button: &str) -> Result<(), DeviceError> {
        self.backend.press(self.port, button)
    }

    pub fn release_button(&mut self, button: &str) -> Result<(), DeviceError> {
        self.backend.release_button(self.port, button)
    }

    pub fn set_axis(&mut self, axis: &str, value: i16) -> Result<(), DeviceError> {
        self.backend.set_axis(self.port, axis, value)
    }

    pub fn update(&mut self) -> Result<(), DeviceError> {
        self.backend.update(self.port)
    }
}

impl<'a> Drop for RaiiControllerGuard<'a> {
    fn drop(&mut self) {
        if self.active {
            self.backend.release(self.port);
            self.active = false;
        }
    }
}
