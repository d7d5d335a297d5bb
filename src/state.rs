// Copyright (c) 2025 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

// Per-unit hardware state.
//
//   OPEN --> INIT --> CONFIG ---> RUN
//   | ^      | ^^     | ^           |
//   |_|      |_||     |_|           |
//               |___________________|
//
// OPEN is set at open and cleared at close. INIT is held per instance. CONFIG
// is set when a shot is programmed and cleared by the frame start interrupt,
// which sets RUN. RUN is cleared by the frame end interrupt. TUNESET and
// SECONDARY_CHANNEL_STARTED are independent of that cycle.

use std::fmt;

use canonical_error::CanonicalError;

use crate::error::{config_error, protocol_violation_error};
use crate::ids::STREAM_COUNT;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum HwFlag {
    Open,
    Init,
    Config,
    Run,
    TuneSet,
    SecondaryChannelStarted,
}

impl HwFlag {
    fn mask(self) -> u8 {
        1 << (self as u8)
    }
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct HwState {
    flags: u8,
    // Bit i set when instance i holds INIT.
    init_instances: u32,
}

impl HwState {
    pub fn is_set(&self, flag: HwFlag) -> bool {
        self.flags & flag.mask() != 0
    }

    fn set(&mut self, flag: HwFlag) {
        self.flags |= flag.mask();
    }

    fn clear(&mut self, flag: HwFlag) {
        self.flags &= !flag.mask();
    }

    pub fn is_initialized_for(&self, instance: usize) -> bool {
        self.init_instances & (1 << instance) != 0
    }

    pub fn open(&mut self) {
        self.set(HwFlag::Open);
    }

    pub fn init(&mut self, instance: usize) -> Result<(), CanonicalError> {
        if !self.is_set(HwFlag::Open) {
            return Err(config_error("init before open"));
        }
        if instance >= STREAM_COUNT {
            return Err(config_error(
                format!("instance table full (instance {})", instance).as_str()));
        }
        self.init_instances |= 1 << instance;
        self.set(HwFlag::Init);
        Ok(())
    }

    pub fn deinit(&mut self, instance: usize) {
        self.init_instances &= !(1 << instance);
        if self.init_instances == 0 {
            self.clear(HwFlag::Init);
        }
    }

    pub fn configure(&mut self) -> Result<(), CanonicalError> {
        if !self.is_set(HwFlag::Init) {
            return Err(config_error("configure before init"));
        }
        self.set(HwFlag::Config);
        Ok(())
    }

    pub fn frame_start(&mut self) -> Result<(), CanonicalError> {
        if self.is_set(HwFlag::Run) {
            return Err(protocol_violation_error("frame start while already running"));
        }
        if !self.is_set(HwFlag::Config) {
            return Err(protocol_violation_error("frame start without configuration"));
        }
        self.clear(HwFlag::Config);
        self.set(HwFlag::Run);
        Ok(())
    }

    pub fn frame_end(&mut self) -> Result<(), CanonicalError> {
        if !self.is_set(HwFlag::Run) {
            return Err(protocol_violation_error("frame end while not running"));
        }
        self.clear(HwFlag::Run);
        Ok(())
    }

    pub fn abort_config(&mut self) {
        self.clear(HwFlag::Config);
    }

    pub fn abort_run(&mut self) {
        self.clear(HwFlag::Run);
    }

    pub fn set_tuneset(&mut self, applied: bool) {
        if applied { self.set(HwFlag::TuneSet) } else { self.clear(HwFlag::TuneSet) }
    }

    pub fn set_secondary_channel(&mut self, started: bool) {
        if started {
            self.set(HwFlag::SecondaryChannelStarted)
        } else {
            self.clear(HwFlag::SecondaryChannelStarted)
        }
    }

    pub fn close(&mut self) -> Result<(), CanonicalError> {
        if !self.is_set(HwFlag::Open) {
            return Err(config_error("close without open"));
        }
        *self = HwState::default();
        Ok(())
    }
}

impl fmt::Display for HwState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:#04x}/{:#x}", self.flags, self.init_instances)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{error_kind, ErrorKind};

    fn initialized() -> HwState {
        let mut state = HwState::default();
        state.open();
        state.init(0).unwrap();
        state
    }

    #[test]
    fn full_cycle() {
        let mut state = initialized();
        state.configure().unwrap();
        state.frame_start().unwrap();
        assert!(state.is_set(HwFlag::Run));
        assert!(!state.is_set(HwFlag::Config));
        state.frame_end().unwrap();
        assert!(!state.is_set(HwFlag::Run));
        // Eligible for the next configuration.
        state.configure().unwrap();
    }

    #[test]
    fn run_requires_config() {
        let mut state = initialized();
        let err = state.frame_start().unwrap_err();
        assert_eq!(error_kind(&err), ErrorKind::ProtocolViolation);
        assert!(!state.is_set(HwFlag::Run));
    }

    #[test]
    fn double_frame_start_is_a_violation() {
        let mut state = initialized();
        state.configure().unwrap();
        state.frame_start().unwrap();
        state.configure().unwrap();
        let before = state;
        assert!(state.frame_start().is_err());
        assert_eq!(state, before);
    }

    #[test]
    fn ordering_is_enforced() {
        let mut state = HwState::default();
        assert!(state.init(0).is_err());
        assert!(state.configure().is_err());
        assert_eq!(error_kind(&state.close().unwrap_err()), ErrorKind::Config);
    }

    #[test]
    fn init_is_per_instance() {
        let mut state = initialized();
        state.init(2).unwrap();
        state.deinit(0);
        assert!(state.is_set(HwFlag::Init));
        assert!(state.is_initialized_for(2));
        state.deinit(2);
        assert!(!state.is_set(HwFlag::Init));
        assert!(state.init(STREAM_COUNT).is_err());
    }

    #[test]
    fn close_clears_everything() {
        let mut state = initialized();
        state.set_tuneset(true);
        state.set_secondary_channel(true);
        state.configure().unwrap();
        state.close().unwrap();
        assert_eq!(state, HwState::default());
    }
}
