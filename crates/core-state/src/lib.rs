//! Users, permissions, and virtual controller assignment.
//!
//! `UserStore` tracks everyone who has ever spoken in chat, `Blacklist` maps
//! input names to the access level required to use them, and
//! `ControllerManager` owns the live `core-hid` backend plus the per-port
//! press state built on top of it. None of these types touch chat
//! transport or parsing directly; they're the state the rest of the
//! pipeline reads and mutates.

use std::collections::{HashMap, HashSet};

use core_hid::{DeviceError, VirtualHidBackend};
use thiserror::Error;

/// Access levels, ordered low to high. Derived `Ord` follows declaration
/// order, so `User < Whitelisted < Vip < Moderator < Admin < Superadmin`
/// holds without any manual discriminant bookkeeping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum AccessLevel {
    User,
    Whitelisted,
    Vip,
    Moderator,
    Admin,
    Superadmin,
}

/// A chatter known to the bot. Names are stored lowercase; callers are
/// expected to normalize before constructing one (enforced in debug builds
/// only, since the normalization itself lives at the transport boundary).
#[derive(Debug, Clone)]
pub struct User {
    pub name: String,
    pub access_level: AccessLevel,
    pub opted_out: bool,
    pub auto_whitelisted: bool,
    pub message_count: u64,
    pub valid_input_count: u64,
    pub port: Option<usize>,
    pub silenced: bool,
}

impl User {
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        debug_assert_eq!(name, name.to_ascii_lowercase(), "user names must be pre-lowercased");
        Self {
            name,
            access_level: AccessLevel::User,
            opted_out: false,
            auto_whitelisted: false,
            message_count: 0,
            valid_input_count: 0,
            port: None,
            silenced: false,
        }
    }

    pub fn is_at_least(&self, level: AccessLevel) -> bool {
        self.access_level >= level
    }
}

/// All known users, keyed by lowercase name.
#[derive(Debug, Default)]
pub struct UserStore {
    users: HashMap<String, User>,
}

impl UserStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the existing user or inserts a freshly created one at
    /// `AccessLevel::User`, per spec-level "first message creates the
    /// record" behavior.
    pub fn get_or_create(&mut self, name: &str) -> &mut User {
        let key = name.to_ascii_lowercase();
        self.users.entry(key.clone()).or_insert_with(|| User::new(key))
    }

    pub fn get(&self, name: &str) -> Option<&User> {
        self.users.get(&name.to_ascii_lowercase())
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut User> {
        self.users.get_mut(&name.to_ascii_lowercase())
    }

    pub fn len(&self) -> usize {
        self.users.len()
    }

    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &User> {
        self.users.values()
    }

    /// Applies the auto-whitelist rule: a user below `Whitelisted` who has
    /// supplied at least `threshold` valid inputs is bumped up exactly
    /// once. Returns `true` if this call changed the user's level.
    pub fn apply_auto_whitelist(&mut self, name: &str, threshold: u64, enabled: bool) -> bool {
        if !enabled {
            return false;
        }
        let Some(user) = self.users.get_mut(&name.to_ascii_lowercase()) else {
            return false;
        };
        if user.access_level >= AccessLevel::Whitelisted || user.auto_whitelisted {
            return false;
        }
        if user.valid_input_count >= threshold {
            user.access_level = AccessLevel::Whitelisted;
            user.auto_whitelisted = true;
            tracing::info!(target: "state.users", user = %user.name, "auto_whitelisted");
            true
        } else {
            false
        }
    }
}

/// Maps input names to the minimum access level required to use them.
/// Inputs absent from the map are unrestricted.
#[derive(Debug, Default)]
pub struct Blacklist {
    required: HashMap<String, AccessLevel>,
}

impl Blacklist {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, input_name: &str, level: AccessLevel) {
        self.required.insert(input_name.to_ascii_lowercase(), level);
    }

    pub fn clear(&mut self, input_name: &str) {
        self.required.remove(&input_name.to_ascii_lowercase());
    }

    pub fn required_level(&self, input_name: &str) -> Option<AccessLevel> {
        self.required.get(&input_name.to_ascii_lowercase()).copied()
    }

    /// Adapter for `core_input::ParseContext::required_level`, which works
    /// in plain ordinals rather than this crate's enum.
    pub fn required_level_ordinal(&self, input_name: &str) -> Option<u8> {
        self.required_level(input_name).map(|lvl| lvl as u8)
    }
}

#[derive(Debug, Error)]
pub enum PortError {
    #[error("port {port} is out of range (controller count is {count})")]
    OutOfRange { port: usize, count: usize },
    #[error("port {0} is already acquired")]
    AlreadyAcquired(usize),
    #[error("port {0} has no acquired controller")]
    NotAcquired(usize),
    #[error(transparent)]
    Device(#[from] DeviceError),
}

/// Tracked state for one virtual gamepad slot, independent of whatever
/// backend actually owns the device.
#[derive(Debug, Default)]
pub struct VirtualController {
    pub acquired: bool,
    pub pressed: HashSet<String>,
}

/// Owns the live HID backend plus per-port bookkeeping. Generic over the
/// backend so tests and `NullHidBackend` deployments share this same
/// dispatch logic as a real driver would.
pub struct ControllerManager<B: VirtualHidBackend> {
    backend: B,
    controllers: Vec<VirtualController>,
}

impl<B: VirtualHidBackend> ControllerManager<B> {
    pub fn new(backend: B, port_count: usize) -> Self {
        Self {
            backend,
            controllers: (0..port_count).map(|_| VirtualController::default()).collect(),
        }
    }

    pub fn port_count(&self) -> usize {
        self.controllers.len()
    }

    pub fn is_port_valid(&self, port: usize) -> bool {
        port < self.controllers.len()
    }

    pub fn is_acquired(&self, port: usize) -> bool {
        self.controllers.get(port).is_some_and(|c| c.acquired)
    }

    /// Direct access to the underlying backend, mainly so tests can inspect
    /// a `NullHidBackend`'s recorded call log.
    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn acquire(&mut self, port: usize) -> Result<(), PortError> {
        self.check_range(port)?;
        if self.controllers[port].acquired {
            return Err(PortError::AlreadyAcquired(port));
        }
        self.backend.acquire(port)?;
        self.controllers[port].acquired = true;
        tracing::info!(target: "state.controllers", port, "acquired");
        Ok(())
    }

    pub fn release(&mut self, port: usize) -> Result<(), PortError> {
        self.check_range(port)?;
        if !self.controllers[port].acquired {
            return Ok(());
        }
        self.backend.release(port);
        self.controllers[port].acquired = false;
        self.controllers[port].pressed.clear();
        tracing::info!(target: "state.controllers", port, "released");
        Ok(())
    }

    pub fn press(&mut self, port: usize, button: &str) -> Result<(), PortError> {
        self.ensure_acquired(port)?;
        self.backend.press(port, button)?;
        self.controllers[port].pressed.insert(button.to_string());
        Ok(())
    }

    pub fn release_button(&mut self, port: usize, button: &str) -> Result<(), PortError> {
        self.ensure_acquired(port)?;
        self.backend.release_button(port, button)?;
        self.controllers[port].pressed.remove(button);
        Ok(())
    }

    pub fn set_axis(&mut self, port: usize, axis: &str, value: i16) -> Result<(), PortError> {
        self.ensure_acquired(port)?;
        self.backend.set_axis(port, axis, value)?;
        Ok(())
    }

    /// Commits queued press/release/axis calls for `port` in one atomic
    /// report. Must be called exactly once per chord, never mid-chord.
    pub fn update(&mut self, port: usize) -> Result<(), PortError> {
        self.ensure_acquired(port)?;
        self.backend.update(port)?;
        Ok(())
    }

    pub fn is_pressed(&self, port: usize, button: &str) -> bool {
        self.controllers.get(port).is_some_and(|c| c.pressed.contains(button))
    }

    fn check_range(&self, port: usize) -> Result<(), PortError> {
        if port >= self.controllers.len() {
            return Err(PortError::OutOfRange {
                port,
                count: self.controllers.len(),
            });
        }
        Ok(())
    }

    fn ensure_acquired(&mut self, port: usize) -> Result<(), PortError> {
        self.check_range(port)?;
        if !self.controllers[port].acquired {
            return Err(PortError::NotAcquired(port));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core_hid::NullHidBackend;

    #[test]
    fn access_level_ordering() {
        assert!(AccessLevel::Whitelisted > AccessLevel::User);
        assert!(AccessLevel::Superadmin > AccessLevel::Admin);
        assert!(AccessLevel::Vip < AccessLevel::Moderator);
    }

    #[test]
    fn get_or_create_is_idempotent() {
        let mut store = UserStore::new();
        store.get_or_create("Alice").message_count += 1;
        store.get_or_create("alice").message_count += 1;
        assert_eq!(store.get("ALICE").unwrap().message_count, 2);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn auto_whitelist_bumps_once() {
        let mut store = UserStore::new();
        store.get_or_create("bob").valid_input_count = 50;
        assert!(store.apply_auto_whitelist("bob", 20, true));
        assert_eq!(store.get("bob").unwrap().access_level, AccessLevel::Whitelisted);
        // Manually demote and confirm the once-only latch still blocks a repeat bump.
        store.get_mut("bob").unwrap().access_level = AccessLevel::User;
        assert!(!store.apply_auto_whitelist("bob", 20, true));
    }

    #[test]
    fn auto_whitelist_respects_disabled_flag() {
        let mut store = UserStore::new();
        store.get_or_create("carol").valid_input_count = 999;
        assert!(!store.apply_auto_whitelist("carol", 1, false));
    }

    #[test]
    fn blacklist_lookup_is_case_insensitive() {
        let mut bl = Blacklist::new();
        bl.set("Start", AccessLevel::Moderator);
        assert_eq!(bl.required_level("start"), Some(AccessLevel::Moderator));
        assert_eq!(bl.required_level_ordinal("START"), Some(AccessLevel::Moderator as u8));
    }

    #[test]
    fn acquire_then_press_then_release() {
        let mut mgr = ControllerManager::new(NullHidBackend::new(), 2);
        mgr.acquire(0).unwrap();
        mgr.press(0, "a").unwrap();
        assert!(mgr.is_pressed(0, "a"));
        mgr.release_button(0, "a").unwrap();
        assert!(!mgr.is_pressed(0, "a"));
        mgr.release(0).unwrap();
    }

    #[test]
    fn update_commits_after_press() {
        let mut mgr = ControllerManager::new(NullHidBackend::new(), 1);
        mgr.acquire(0).unwrap();
        mgr.press(0, "a").unwrap();
        mgr.update(0).unwrap();
    }

    #[test]
    fn press_without_acquire_is_not_acquired_error() {
        let mut mgr = ControllerManager::new(NullHidBackend::new(), 1);
        let err = mgr.press(0, "a").unwrap_err();
        assert!(matches!(err, PortError::NotAcquired(0)));
    }

    #[test]
    fn is_acquired_reflects_acquire_and_release() {
        let mut mgr = ControllerManager::new(NullHidBackend::new(), 1);
        assert!(!mgr.is_acquired(0));
        mgr.acquire(0).unwrap();
        assert!(mgr.is_acquired(0));
        mgr.release(0).unwrap();
        assert!(!mgr.is_acquired(0));
    }

    #[test]
    fn out_of_range_port_is_rejected() {
        let mut mgr = ControllerManager::new(NullHidBackend::new(), 1);
        let err = mgr.acquire(5).unwrap_err();
        assert!(matches!(err, PortError::OutOfRange { port: 5, count: 1 }));
    }

    #[test]
    fn double_acquire_is_rejected() {
        let mut mgr = ControllerManager::new(NullHidBackend::new(), 1);
        mgr.acquire(0).unwrap();
        let err = mgr.acquire(0).unwrap_err();
        assert!(matches!(err, PortError::AlreadyAcquired(0)));
    }

    #[test]
    fn release_clears_pressed_state() {
        let mut mgr = ControllerManager::new(NullHidBackend::new(), 1);
        mgr.acquire(0).unwrap();
        mgr.press(0, "a").unwrap();
        mgr.release(0).unwrap();
        assert!(!mgr.is_pressed(0, "a"));
    }
}
