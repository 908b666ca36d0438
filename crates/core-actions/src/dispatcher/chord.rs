//! Applies one subsequence (chord): press/set_axis every member, commit with
//! a single `update`, sleep for the chord's duration, then release
//! non-held members and commit again.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use core_hid::VirtualHidBackend;
use core_input::{Input, InputSubSequence, ParserConfig};
use core_state::{ControllerManager, PortError};

use super::hold::{HeldEntry, HeldSet};

fn percent_to_axis_value(percent: u8) -> i16 {
    // 0-100% maps onto the full signed 16-bit axis range, matching the
    // `i16::MIN..=i16::MAX` convention most virtual-gamepad axis APIs use.
    let scaled = (percent as i32 * i16::MAX as i32) / 100;
    scaled as i16
}

fn target_port(input: &Input, default_port: usize) -> usize {
    input.port.unwrap_or(default_port)
}

fn touched_ports(sub: &InputSubSequence, default_port: usize) -> HashSet<usize> {
    sub.inputs.iter().map(|i| target_port(i, default_port)).collect()
}

/// Executes one chord end to end, returning the milliseconds it slept for.
pub async fn apply_chord<B: VirtualHidBackend>(
    controllers: &Arc<Mutex<ControllerManager<B>>>,
    default_port: usize,
    sub: &InputSubSequence,
    held: &mut HeldSet,
    cfg: &ParserConfig,
) -> Result<u64, PortError> {
    {
        let mut mgr = controllers.lock().expect("controller manager lock poisoned");
        for input in &sub.inputs {
            let port = target_port(input, default_port);
            if input.release {
                held.take(&input.name, port);
                mgr.release_button(port, &input.name)?;
                continue;
            }
            if let Some(percent) = input.percent {
                mgr.set_axis(port, &input.name, percent_to_axis_value(percent))?;
            } else {
                mgr.press(port, &input.name)?;
            }
        }
        for port in touched_ports(sub, default_port) {
            mgr.update(port)?;
        }
    }

    let duration_ms = sub.max_duration_ms(cfg);
    tokio::time::sleep(Duration::from_millis(duration_ms)).await;

    {
        let mut mgr = controllers.lock().expect("controller manager lock poisoned");
        for input in &sub.inputs {
            if input.release {
                continue;
            }
            let port = target_port(input, default_port);
            if input.hold {
                held.insert(HeldEntry {
                    name: input.name.clone(),
                    port,
                    is_axis: input.percent.is_some(),
                });
                continue;
            }
            if input.percent.is_some() {
                mgr.set_axis(port, &input.name, 0)?;
            } else {
                mgr.release_button(port, &input.name)?;
            }
        }
        for port in touched_ports(sub, default_port) {
            mgr.update(port)?;
        }
    }

    Ok(duration_ms)
}

#[cfg(test)]
mod tests {
    use super::*;
    use core_hid::{HidCall, NullHidBackend};
    use core_input::DurationUnit;

    fn input(name: &str, hold: bool, release: bool) -> Input {
        Input {
            name: name.to_string(),
            port: None,
            duration_value: 5,
            duration_unit: DurationUnit::Ms,
            hold,
            release,
            percent: None,
        }
    }

    #[tokio::test]
    async fn plain_press_releases_after_sleep() {
        let controllers = Arc::new(Mutex::new(ControllerManager::new(NullHidBackend::new(), 1)));
        controllers.lock().unwrap().acquire(0).unwrap();
        let mut held = HeldSet::new();
        let cfg = ParserConfig::default();
        let sub = InputSubSequence {
            inputs: vec![input("a", false, false)],
        };
        apply_chord(&controllers, 0, &sub, &mut held, &cfg).await.unwrap();
        assert!(held.is_empty());
        assert!(!controllers.lock().unwrap().is_pressed(0, "a"));
    }

    #[tokio::test]
    async fn held_input_stays_pressed_after_chord() {
        let controllers = Arc::new(Mutex::new(ControllerManager::new(NullHidBackend::new(), 1)));
        controllers.lock().unwrap().acquire(0).unwrap();
        let mut held = HeldSet::new();
        let cfg = ParserConfig::default();
        let sub = InputSubSequence {
            inputs: vec![input("a", true, false)],
        };
        apply_chord(&controllers, 0, &sub, &mut held, &cfg).await.unwrap();
        assert!(!held.is_empty());
        assert!(controllers.lock().unwrap().is_pressed(0, "a"));
    }

    #[tokio::test]
    async fn explicit_release_consumes_hold_without_repressing() {
        let controllers = Arc::new(Mutex::new(ControllerManager::new(NullHidBackend::new(), 1)));
        controllers.lock().unwrap().acquire(0).unwrap();
        let mut held = HeldSet::new();
        held.insert(HeldEntry {
            name: "a".into(),
            port: 0,
            is_axis: false,
        });
        controllers.lock().unwrap().press(0, "a").unwrap();
        let cfg = ParserConfig::default();
        let sub = InputSubSequence {
            inputs: vec![input("a", false, true)],
        };
        apply_chord(&controllers, 0, &sub, &mut held, &cfg).await.unwrap();
        assert!(held.is_empty());
        assert!(!controllers.lock().unwrap().is_pressed(0, "a"));
        // The release flag only ever clears a hold; it must never re-press.
        let mgr = controllers.lock().unwrap();
        assert!(!mgr.backend().calls().iter().any(|c| matches!(c, HidCall::Press { .. })));
    }

    #[tokio::test]
    async fn single_update_per_chord_not_per_button() {
        let controllers = Arc::new(Mutex::new(ControllerManager::new(NullHidBackend::new(), 1)));
        controllers.lock().unwrap().acquire(0).unwrap();
        let mut held = HeldSet::new();
        let cfg = ParserConfig::default();
        let sub = InputSubSequence {
            inputs: vec![input("a", false, false), input("b", false, false)],
        };
        apply_chord(&controllers, 0, &sub, &mut held, &cfg).await.unwrap();
        // One update after the press phase, one after the release phase: two
        // total for a two-button chord, never one per button.
        let mgr = controllers.lock().unwrap();
        let update_count = mgr.backend().calls().iter().filter(|c| matches!(c, HidCall::Update { .. })).count();
        assert_eq!(update_count, 2);
    }
}
