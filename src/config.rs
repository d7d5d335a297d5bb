// Copyright (c) 2025 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use std::time::Duration;

pub const MAX_HW_FRAME: usize = 20;
pub const MAX_HW_FRAME_LATE: usize = 5;
pub const SHOT_TIMEOUT: Duration = Duration::from_millis(3000);
pub const HW_STOP_TIMEOUT: Duration = Duration::from_millis(250);
pub const DEFAULT_BUG_THRESHOLD: u32 = 10;
pub const EVENT_QUEUE_DEPTH: usize = 64;

/// What happens once protocol violations exceed the threshold.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Escalation {
    /// Keep logging and counting.
    LogOnly,
    /// Take the offending unit out of service: its frames resolve not-done
    /// and it rejects further shots until closed.
    FailUnit,
    /// Panic.
    Abort,
}

#[derive(Copy, Clone, Debug)]
pub struct ViolationPolicy {
    /// Violations tolerated before escalating.
    pub threshold: u32,
    pub escalation: Escalation,
}

impl Default for ViolationPolicy {
    fn default() -> Self {
        ViolationPolicy{threshold: DEFAULT_BUG_THRESHOLD,
                        escalation: Escalation::FailUnit}
    }
}

#[derive(Clone, Debug)]
pub struct HwConfig {
    pub max_hw_frame: usize,
    pub max_hw_frame_late: usize,
    pub shot_timeout: Duration,
    /// Bound on waiting for V-blank when stopping a sensor.
    pub stop_timeout: Duration,
    /// Depth of the interrupt/command queue feeding the engine.
    pub event_queue_depth: usize,
    /// Gate unit clocks off while idle.
    pub clock_gating: bool,
    pub violation_policy: ViolationPolicy,
}

impl Default for HwConfig {
    fn default() -> Self {
        HwConfig{max_hw_frame: MAX_HW_FRAME,
                 max_hw_frame_late: MAX_HW_FRAME_LATE,
                 shot_timeout: SHOT_TIMEOUT,
                 stop_timeout: HW_STOP_TIMEOUT,
                 event_queue_depth: EVENT_QUEUE_DEPTH,
                 clock_gating: true,
                 violation_policy: ViolationPolicy::default()}
    }
}
