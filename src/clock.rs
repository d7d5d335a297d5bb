// Copyright (c) 2025 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use std::sync::{Arc, Mutex};

use canonical_error::{CanonicalError, internal_error};
use log::{info, warn};

use crate::error::config_error;

/// Board clock and power control. Everything here is opaque to the engine
/// beyond success or failure.
pub trait ClockController: Send + Sync {
    /// Physically enables or disables one clock-gate bit.
    fn gate(&self, bit: u32, on: bool) -> Result<(), CanonicalError>;

    fn enable(&self, _name: &str) -> Result<(), CanonicalError> {
        Ok(())
    }

    fn disable(&self, _name: &str) -> Result<(), CanonicalError> {
        Ok(())
    }

    fn set_rate(&self, _name: &str, _channel: u32, _scenario: u32)
                -> Result<(), CanonicalError> {
        Ok(())
    }
}

#[derive(Debug)]
struct GateSlot {
    bit: u32,
    refcnt: u32,
}

/// Reference-counted clock gates shared between units. A gate is switched on
/// at the 0->1 edge and off at the N->0 edge of its slot's count.
pub struct ClockGate {
    controller: Arc<dyn ClockController>,
    slots: Mutex<Vec<GateSlot>>,
}

impl ClockGate {
    /// `bits[i]` is the gate bit of slot `i`.
    pub fn new(controller: Arc<dyn ClockController>, bits: &[u32]) -> Self {
        ClockGate{controller,
                  slots: Mutex::new(bits.iter().map(|bit| GateSlot{bit: *bit, refcnt: 0})
                                    .collect())}
    }

    pub fn controller(&self) -> &Arc<dyn ClockController> {
        &self.controller
    }

    /// Takes a reference on slot `idx`. Returns the new count.
    pub fn on(&self, idx: usize) -> Result<u32, CanonicalError> {
        let mut slots = self.slots.lock()
            .map_err(|_| internal_error("clock gate table poisoned"))?;
        let slot = slots.get_mut(idx).ok_or_else(
            || config_error(format!("no clock gate slot {}", idx).as_str()))?;
        if slot.refcnt == 0 {
            self.controller.gate(slot.bit, true)?;
        }
        slot.refcnt += 1;
        Ok(slot.refcnt)
    }

    /// Drops a reference on slot `idx`. Returns the new count.
    pub fn off(&self, idx: usize) -> Result<u32, CanonicalError> {
        let mut slots = self.slots.lock()
            .map_err(|_| internal_error("clock gate table poisoned"))?;
        let slot = slots.get_mut(idx).ok_or_else(
            || config_error(format!("no clock gate slot {}", idx).as_str()))?;
        if slot.refcnt == 0 {
            warn!("clock gate slot {} (bit {}) released while off", idx, slot.bit);
            return Ok(0);
        }
        if slot.refcnt == 1 {
            self.controller.gate(slot.bit, false)?;
        }
        slot.refcnt -= 1;
        Ok(slot.refcnt)
    }

    pub fn refcount(&self, idx: usize) -> u32 {
        match self.slots.lock() {
            Ok(slots) => slots.get(idx).map_or(0, |s| s.refcnt),
            Err(_) => 0,
        }
    }

    pub fn dump(&self) {
        if let Ok(slots) = self.slots.lock() {
            for (idx, slot) in slots.iter().enumerate() {
                info!("clock gate slot {}: bit {} refcnt {}", idx, slot.bit, slot.refcnt);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use crate::sim_ip::SimClock;

    #[test]
    fn concurrent_on_enables_once() {
        let controller = Arc::new(SimClock::default());
        let gate = Arc::new(ClockGate::new(controller.clone(), &[4, 7]));
        let handles: Vec<_> = (0..2).map(|_| {
            let gate = gate.clone();
            thread::spawn(move || gate.on(1).unwrap())
        }).collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(gate.refcount(1), 2);
        assert_eq!(controller.enables(), 1);

        gate.off(1).unwrap();
        assert_eq!(controller.disables(), 0);
        gate.off(1).unwrap();
        assert_eq!(controller.disables(), 1);
        assert_eq!(gate.refcount(1), 0);
    }

    #[test]
    fn release_while_off_is_ignored() {
        let controller = Arc::new(SimClock::default());
        let gate = ClockGate::new(controller.clone(), &[0]);
        assert_eq!(gate.off(0).unwrap(), 0);
        assert_eq!(controller.disables(), 0);
        assert!(gate.on(3).is_err());
    }
}
