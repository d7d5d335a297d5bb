// Copyright (c) 2025 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

// The orchestrator owns every unit and the per-group frame queues. It turns
// submissions into shots, routes interrupts back to the frames they belong
// to, and guarantees each submitted frame is resolved exactly once.

use std::sync::Arc;

use bytes::Bytes;
use canonical_error::{CanonicalError, failed_precondition_error, not_found_error};
use log::{debug, error, info, warn};
use tokio::sync::{mpsc, watch};

use crate::clock::ClockGate;
use crate::config::{Escalation, HwConfig};
use crate::error::{ErrorKind, config_error, error_kind, protocol_violation_error};
use crate::frame::{Completion, DoneType, Frame, FrameKey, FrameNotifier};
use crate::frame_queue::{FrameQueue, Placement};
use crate::hw_ip::{EndOutcome, HwIp, HwIpCount, ParamRegion, StartOutcome, VState};
use crate::ids::{GROUP_ID_MAX, GroupId, HwId, HwMap, STREAM_COUNT, SensorPosition,
                 hw_id_from_group, instance_index};
use crate::setfile::parse_header;
use crate::watchdog::ShotTimeout;

// Late-frame warnings are logged once per this many late frames.
const LATE_LOG_PERIOD: u32 = 32;

/// Clock name used with the clock controller for pipeline-wide calls.
pub const PIPE_CLOCK: &str = "pipe";

/// One frame as handed over by the upstream submitter.
pub struct Submission {
    pub instance: u32,
    pub group: GroupId,
    pub frame: Frame,
    pub region: Option<Arc<ParamRegion>>,
    pub lindex: u32,
    pub hindex: u32,
    /// Units to run. Empty means every unit of the group.
    pub hw_map: HwMap,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum IrqKind {
    FrameStart,
    ConfigLock,
    FrameEnd,
    DmaEnd,
}

/// An interrupt as reported by a unit.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct HwEvent {
    pub hw: HwId,
    pub instance: u32,
    pub fcount: u32,
    pub kind: IrqKind,
}

impl HwEvent {
    pub fn new(hw: HwId, instance: u32, fcount: u32, kind: IrqKind) -> Self {
        HwEvent{hw, instance, fcount, kind}
    }

    pub fn key(&self) -> FrameKey {
        FrameKey{instance: self.instance, fcount: self.fcount}
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct HwStats {
    pub rsccount: u32,
    pub bug_count: u32,
    /// Frames in the primary queues, summed over groups.
    pub queued: usize,
    pub late: usize,
    pub units: Vec<(HwId, HwIpCount)>,
}

/// Shots arm their watchdog on the current tokio runtime, so submissions
/// must be made from within one. Elsewhere they are rolled back with a
/// resource error.
pub struct Orchestrator {
    config: HwConfig,
    // Indexed by HwId::slot().
    units: Vec<Option<HwIp>>,
    // Indexed by GroupId.
    queues: Vec<FrameQueue>,
    // Units composing each group, per instance.
    topology: [[HwMap; GROUP_ID_MAX]; STREAM_COUNT],
    hw_map: [HwMap; STREAM_COUNT],
    sensor_position: [SensorPosition; STREAM_COUNT],
    streaming: [bool; STREAM_COUNT],
    clk_gate: Option<Arc<ClockGate>>,

    rsccount: u32,
    bug_count: u32,
    log_count: u32,

    notifier: Arc<dyn FrameNotifier>,
    timeouts: mpsc::UnboundedSender<ShotTimeout>,
}

impl Orchestrator {
    /// Returns the orchestrator and the receiver its watchdogs report
    /// expiries on; feed those back through `handle_timeout()`.
    pub fn new(config: HwConfig, notifier: Arc<dyn FrameNotifier>)
               -> (Self, mpsc::UnboundedReceiver<ShotTimeout>) {
        let (timeouts, expired) = mpsc::unbounded_channel();
        let queues = (0..GROUP_ID_MAX)
            .map(|_| FrameQueue::new(config.max_hw_frame, config.max_hw_frame_late))
            .collect();
        (Orchestrator{units: (0..HwId::SLOT_COUNT).map(|_| None).collect(),
                      queues,
                      topology: [[HwMap::empty(); GROUP_ID_MAX]; STREAM_COUNT],
                      hw_map: [HwMap::empty(); STREAM_COUNT],
                      sensor_position: [SensorPosition::default(); STREAM_COUNT],
                      streaming: [false; STREAM_COUNT],
                      clk_gate: None,
                      rsccount: 0,
                      bug_count: 0,
                      log_count: 0,
                      notifier,
                      timeouts,
                      config},
         expired)
    }

    pub fn with_clock_gate(mut self, gate: Arc<ClockGate>) -> Self {
        self.clk_gate = Some(gate);
        self
    }

    pub fn config(&self) -> &HwConfig {
        &self.config
    }

    pub fn bug_count(&self) -> u32 {
        self.bug_count
    }

    pub fn rsccount(&self) -> u32 {
        self.rsccount
    }

    pub fn unit(&self, hw: HwId) -> Option<&HwIp> {
        self.units[hw.slot()].as_ref()
    }

    pub fn units(&self) -> impl Iterator<Item = &HwIp> {
        self.units.iter().flatten()
    }

    pub fn queue(&self, group: GroupId) -> Option<&FrameQueue> {
        self.queues.get(group.0 as usize)
    }

    pub fn hw_map(&self, instance: u32) -> HwMap {
        self.hw_map.get(instance as usize).copied().unwrap_or_default()
    }

    pub fn topology(&self, instance: u32, group: GroupId) -> HwMap {
        self.topology.get(instance as usize)
            .and_then(|groups| groups.get(group.0 as usize))
            .copied()
            .unwrap_or_default()
    }

    pub fn is_streaming(&self, instance: u32) -> bool {
        self.streaming.get(instance as usize).copied().unwrap_or(false)
    }

    pub fn subscribe_vstate(&self, hw: HwId) -> Option<watch::Receiver<VState>> {
        self.unit(hw).map(|unit| unit.subscribe_vstate())
    }

    fn unit_mut(&mut self, hw: HwId) -> Result<&mut HwIp, CanonicalError> {
        self.units[hw.slot()].as_mut().ok_or_else(
            || not_found_error(format!("{} is not probed", hw).as_str()))
    }

    /// Adds a unit to the arena.
    pub fn probe(&mut self, unit: HwIp) -> Result<(), CanonicalError> {
        let slot = unit.id().slot();
        if self.units[slot].is_some() {
            return Err(config_error(format!("{} probed twice", unit.id()).as_str()));
        }
        info!("probed {}{}", unit.name(), if unit.is_leader() { " (leader)" } else { "" });
        self.units[slot] = Some(unit);
        Ok(())
    }

    /// Opens and initialises `hw` as a member of `group` for `instance`.
    pub fn open(&mut self, hw: HwId, instance: u32, group: GroupId, reprocessing: bool,
                module_id: u32) -> Result<(), CanonicalError> {
        let slot = instance_index(instance)?;
        let g = group.index()?;
        if self.hw_map[slot].contains(hw) {
            return Err(config_error(
                format!("[{}] {} is already open", instance, hw).as_str()));
        }
        let unit = self.unit_mut(hw)?;
        unit.open(instance, group)?;
        if let Err(e) = unit.init(instance, group, reprocessing, module_id) {
            if let Err(close_err) = unit.close(instance) {
                warn!("[{}][{}] close after failed init: {:?}", instance, hw, close_err);
            }
            return Err(e);
        }
        self.topology[slot][g].insert(hw);
        self.hw_map[slot].insert(hw);
        self.rsccount += 1;
        info!("[{}][G{}] {} opened, hw_map {}", instance, g, hw, self.hw_map[slot]);
        Ok(())
    }

    /// Detaches `hw` from `instance`. Frames of the instance still waiting on
    /// the unit are resolved not-done first.
    pub fn close(&mut self, hw: HwId, instance: u32) -> Result<(), CanonicalError> {
        let slot = instance_index(instance)?;
        if !self.hw_map[slot].contains(hw) {
            return Err(config_error(
                format!("[{}] {} is not open", instance, hw).as_str()));
        }
        for g in 0..GROUP_ID_MAX {
            let stuck: Vec<FrameKey> = self.queues[g].pending_on(hw).into_iter()
                .filter(|key| key.instance == instance)
                .collect();
            for key in &stuck {
                warn!("{} {} closing with frame outstanding", key, hw);
                self.resolve_frame(g, *key, DoneType::Unprocessed);
            }
            if !stuck.is_empty() {
                self.dispatch_logged(g);
            }
        }
        let closed = self.unit_mut(hw)?.close(instance)?;
        for map in self.topology[slot].iter_mut() {
            map.remove(hw);
        }
        self.hw_map[slot].remove(hw);
        self.rsccount = self.rsccount.saturating_sub(1);
        info!("[{}] {} {}", instance, hw, if closed { "closed" } else { "released" });
        Ok(())
    }

    pub fn set_sensor_position(&mut self, instance: u32, position: SensorPosition)
                               -> Result<(), CanonicalError> {
        let slot = instance_index(instance)?;
        self.sensor_position[slot] = position;
        Ok(())
    }

    pub fn sensor_position(&self, instance: u32) -> SensorPosition {
        self.sensor_position.get(instance as usize).copied().unwrap_or_default()
    }

    /// Stages a parameter delta on the given units (all of the instance's
    /// units if `hw_map` is empty). Applied at each unit's next shot.
    pub fn set_param(&mut self, instance: u32, hw_map: HwMap, region: Arc<ParamRegion>,
                     lindex: u32, hindex: u32) -> Result<(), CanonicalError> {
        let slot = instance_index(instance)?;
        let targets = if hw_map.is_empty() {
            self.hw_map[slot]
        } else {
            hw_map.intersect(self.hw_map[slot])
        };
        for hw in targets.iter() {
            self.unit_mut(hw)?.stage_param(instance, region.clone(), lindex, hindex)?;
        }
        Ok(())
    }

    /// Queues `frame` on `group` and shoots it on every member unit that is
    /// free. A frame that is not accepted is resolved not-done before the
    /// error is returned.
    pub fn grp_shot(&mut self, instance: u32, group: GroupId, frame: Frame)
                    -> Result<Placement, CanonicalError> {
        self.shot_frame(instance, group, frame, HwMap::empty())
    }

    pub fn submit(&mut self, submission: Submission) -> Result<Placement, CanonicalError> {
        let Submission{instance, group, mut frame, region, lindex, hindex, hw_map} = submission;
        frame.instance = instance;
        frame.group = group;
        if region.is_some() || lindex != 0 || hindex != 0 {
            let region = region.unwrap_or_default();
            if let Err(e) = self.set_param(instance, hw_map, region, lindex, hindex) {
                return Err(self.reject(frame, DoneType::Unprocessed, e));
            }
        }
        self.shot_frame(instance, group, frame, hw_map)
    }

    fn shot_frame(&mut self, instance: u32, group: GroupId, mut frame: Frame, active: HwMap)
                  -> Result<Placement, CanonicalError> {
        frame.instance = instance;
        frame.group = group;
        let (slot, g) = match (instance_index(instance), group.index()) {
            (Ok(slot), Ok(g)) => (slot, g),
            (Err(e), _) | (_, Err(e)) => {
                return Err(self.reject(frame, DoneType::Unprocessed, e));
            },
        };
        let mut members = self.topology[slot][g];
        if !active.is_empty() {
            members = members.intersect(active);
        }
        if members.is_empty() {
            let e = config_error(
                format!("[{}][G{}] no open units for shot", instance, g).as_str());
            return Err(self.reject(frame, DoneType::Unprocessed, e));
        }
        let failed = members.iter().find(
            |hw| self.units[hw.slot()].as_ref().map_or(true, |unit| unit.is_failed()));
        if let Some(hw) = failed {
            let e = failed_precondition_error(format!("{} is out of service", hw).as_str());
            return Err(self.reject(frame, DoneType::Unprocessed, e));
        }

        let key = frame.key();
        let placement = match self.queues[g].admit(key) {
            Ok(placement) => placement,
            Err(e) => {
                let done_type = if error_kind(&e) == ErrorKind::Resource {
                    DoneType::Overflow
                } else {
                    DoneType::InvalidFrameNumber
                };
                return Err(self.reject(frame, done_type, e));
            },
        };
        frame.pending = members;
        frame.shot = HwMap::empty();
        self.queues[g].push(frame)?;
        if placement == Placement::Late {
            if self.log_count % LATE_LOG_PERIOD == 0 {
                warn!("{} group {} queue full, held late ({} late)",
                      key, g, self.queues[g].late_len());
            }
            self.log_count += 1;
            return Ok(placement);
        }
        self.dispatch_group(g)?;
        Ok(placement)
    }

    /// Routes one interrupt. Errors are protocol violations, already counted.
    pub fn handle_irq(&mut self, event: HwEvent) -> Result<(), CanonicalError> {
        instance_index(event.instance)?;
        let key = event.key();
        let hw = event.hw;
        let unit = self.unit_mut(hw)?;
        let Some(group) = unit.group(event.instance) else {
            debug!("{} {} {:?} for unbound instance ignored", key, hw, event.kind);
            return Ok(());
        };
        let g = group.index()?;
        match event.kind {
            IrqKind::FrameStart => match unit.frame_start(key) {
                Ok(StartOutcome::Started{free}) => {
                    if free {
                        self.dispatch_group(g)?;
                    }
                    Ok(())
                },
                Ok(StartOutcome::Stale) => {
                    debug!("{} {} stale frame start", key, hw);
                    Ok(())
                },
                Err(e) => self.record_violation(hw, key, e),
            },
            IrqKind::ConfigLock => {
                unit.config_lock(key);
                self.dispatch_group(g)
            },
            IrqKind::FrameEnd => match unit.frame_end(key) {
                Ok(EndOutcome::Done) => self.complete(g, hw, key),
                Ok(EndOutcome::NextBuffer(buffer)) => self.shot_next_buffer(g, hw, key, buffer),
                Ok(EndOutcome::Stale) => {
                    debug!("{} {} stale frame end", key, hw);
                    Ok(())
                },
                Err(e) => self.record_violation(hw, key, e),
            },
            IrqKind::DmaEnd => {
                unit.dma_end(key);
                Ok(())
            },
        }
    }

    /// Resolves the frame of an expired watchdog as not-done with Timeout.
    /// Expiries that lost a race with completion are ignored.
    pub fn handle_timeout(&mut self, timeout: ShotTimeout) -> Result<(), CanonicalError> {
        let ShotTimeout{hw, key, ..} = timeout;
        let Some(unit) = self.units[hw.slot()].as_mut() else { return Ok(()) };
        if !unit.watchdog.accepts(&timeout) {
            debug!("{} {} stale watchdog expiry", key, hw);
            return Ok(());
        }
        unit.watchdog.expire();
        error!("{} {} shot timeout ({:?}), state {}",
               key, hw, self.config.shot_timeout, unit.state());
        let group = unit.group(key.instance).and_then(|g| g.index().ok());
        let resolved = match group {
            Some(g) => self.resolve_frame(g, key, DoneType::Timeout),
            None => false,
        };
        if !resolved {
            if let Some(unit) = self.units[hw.slot()].as_mut() {
                unit.abort(key);
                unit.idle_clock();
            }
        }
        self.note_bug(hw);
        if let Some(g) = group {
            self.dispatch_group(g)?;
        }
        Ok(())
    }

    /// Loads calibration tables for every unit of `instance`, for the
    /// instance's current sensor position. Units whose tables fail to load
    /// keep their previous tables; the first such error is returned.
    pub fn load_setfile(&mut self, instance: u32, blob: Bytes)
                        -> Result<usize, CanonicalError> {
        let slot = instance_index(instance)?;
        let header = parse_header(&blob)?;
        let position = self.sensor_position[slot];
        let mut loaded = 0;
        let mut first_err = None;
        for hw in self.hw_map[slot].iter() {
            let Some(unit) = self.units[hw.slot()].as_mut() else { continue };
            match unit.load_setfile(instance, position, &blob, &header) {
                Ok(true) => loaded += 1,
                Ok(false) => (),
                Err(e) => {
                    error!("[{}] {} setfile load failed, keeping previous tables: {:?}",
                           instance, hw, e);
                    first_err.get_or_insert(e);
                },
            }
        }
        info!("[{}] setfile v{} loaded into {} units ({:?})",
              instance, header.version as u32, loaded, position);
        match first_err {
            Some(e) => Err(e),
            None => Ok(loaded),
        }
    }

    /// Applies `scenario` on every unit of `instance` that has tables.
    pub fn apply_setfile(&mut self, instance: u32, scenario: u32)
                         -> Result<usize, CanonicalError> {
        let slot = instance_index(instance)?;
        let position = self.sensor_position[slot];
        let mut applied = 0;
        for hw in self.hw_map[slot].iter() {
            let Some(unit) = self.units[hw.slot()].as_mut() else { continue };
            if !unit.apply_setfile(instance, position, scenario)? {
                continue;
            }
            applied += 1;
            if let Some(gate) = &self.clk_gate {
                gate.controller().set_rate(unit.name(), instance, scenario)?;
            }
        }
        Ok(applied)
    }

    pub fn delete_setfile(&mut self, instance: u32) -> Result<(), CanonicalError> {
        let slot = instance_index(instance)?;
        let position = self.sensor_position[slot];
        for hw in self.hw_map[slot].iter() {
            if let Some(unit) = self.units[hw.slot()].as_mut() {
                unit.delete_setfile(instance, position)?;
            }
        }
        Ok(())
    }

    /// Starts on-the-fly streaming into the leaders of `instance`.
    pub fn sensor_start(&mut self, instance: u32) -> Result<(), CanonicalError> {
        let slot = instance_index(instance)?;
        let members = self.hw_map[slot];
        if members.is_empty() {
            return Err(failed_precondition_error(
                format!("[{}] sensor start with no open units", instance).as_str()));
        }
        if let Some(gate) = &self.clk_gate {
            gate.controller().enable(PIPE_CLOCK)?;
        }
        for hw in members.iter() {
            let Some(unit) = self.units[hw.slot()].as_mut() else { continue };
            if unit.is_leader() {
                unit.set_otf_start(true);
            }
        }
        self.streaming[slot] = true;
        info!("[{}] sensor start, hw_map {}", instance, members);
        Ok(())
    }

    /// Stops streaming. Callers wait for V-blank on every unit beforehand.
    pub fn sensor_stop(&mut self, instance: u32) -> Result<(), CanonicalError> {
        let slot = instance_index(instance)?;
        if !self.streaming[slot] {
            debug!("[{}] sensor already stopped", instance);
            return Ok(());
        }
        for hw in self.hw_map[slot].iter() {
            if let Some(unit) = self.units[hw.slot()].as_mut() {
                unit.set_otf_start(false);
                if unit.vstate() != VState::Blank {
                    warn!("[{}] {} stopping outside V-blank", instance, hw);
                }
            }
        }
        if let Some(gate) = &self.clk_gate {
            gate.controller().disable(PIPE_CLOCK)?;
        }
        self.streaming[slot] = false;
        info!("[{}] sensor stop", instance);
        Ok(())
    }

    pub fn process_start(&mut self, instance: u32, group: GroupId)
                         -> Result<(), CanonicalError> {
        let slot = instance_index(instance)?;
        let members = self.topology[slot][group.index()?];
        if members.is_empty() {
            return Err(config_error(
                format!("[{}][G{}] process start with no units", instance, group.0).as_str()));
        }
        for hw in members.iter() {
            let active = self.hw_map[slot];
            let unit = self.unit_mut(hw)?;
            unit.enable(instance, active)?;
            if hw == HwId::Vra {
                // VRA runs its second (detection) channel while processing.
                unit.set_secondary_channel(true);
            }
        }
        info!("[{}][G{}] process start, units {}", instance, group.0, members);
        Ok(())
    }

    /// Flushes every frame of `instance` from `group` as not-done and disables
    /// the group's units. Returns the number of frames flushed.
    pub fn process_stop(&mut self, instance: u32, group: GroupId)
                        -> Result<usize, CanonicalError> {
        let slot = instance_index(instance)?;
        let g = group.index()?;
        let flushed = self.queues[g].drain_instance(instance);
        let count = flushed.len();
        for (frame, placement) in flushed {
            self.release_frame(frame, flush_done_type(placement));
        }
        let members = self.topology[slot][g];
        let active = self.hw_map[slot];
        for hw in members.iter() {
            if let Some(unit) = self.units[hw.slot()].as_mut() {
                if let Err(e) = unit.disable(instance, active) {
                    warn!("[{}] {} disable failed: {:?}", instance, hw, e);
                }
                if hw == HwId::Vra {
                    unit.set_secondary_channel(false);
                }
            }
        }
        info!("[{}][G{}] process stop, {} frames flushed", instance, g, count);
        if count > 0 {
            // Frames of other instances may have queued behind the flushed ones.
            self.dispatch_logged(g);
        }
        Ok(count)
    }

    /// Resolves every outstanding frame of every group as not-done. Returns
    /// the number of frames flushed.
    pub fn clear(&mut self) -> usize {
        let mut count = 0;
        for g in 0..GROUP_ID_MAX {
            for (frame, placement) in self.queues[g].flush() {
                self.release_frame(frame, flush_done_type(placement));
                count += 1;
            }
        }
        if count > 0 {
            info!("cleared {} outstanding frames", count);
        }
        count
    }

    pub fn size_dump(&self) {
        for unit in self.units() {
            unit.size_dump();
        }
    }

    pub fn clk_gate_dump(&self) {
        match &self.clk_gate {
            Some(gate) => gate.dump(),
            None => info!("no clock gates"),
        }
    }

    pub fn stats(&self) -> HwStats {
        HwStats{rsccount: self.rsccount,
                bug_count: self.bug_count,
                queued: self.queues.iter().map(|q| q.len()).sum(),
                late: self.queues.iter().map(|q| q.late_len()).sum(),
                units: self.units().map(|unit| (unit.id(), unit.count())).collect()}
    }

    pub fn print_frame_counts(&self) {
        for unit in self.units() {
            let count = unit.count();
            info!("{}: fs {} cl {} fe {} dma {} [F{}] state {}",
                  unit.name(), count.fs, count.cl, count.fe, count.dma,
                  unit.fcount(), unit.state());
            unit.dump_debug();
        }
        for (g, queue) in self.queues.iter().enumerate() {
            if !queue.is_empty() {
                info!("G{}: {} queued {:?}, {} late", g, queue.len(), queue.keys(),
                      queue.late_len());
            }
        }
    }

    // Shoots every free unit with the oldest frame it has not been shot for.
    // A failed shot rolls the whole frame back; dispatching then continues
    // and the first failure is returned.
    fn dispatch_group(&mut self, g: usize) -> Result<(), CanonicalError> {
        let mut first_err = None;
        loop {
            self.queues[g].promote_late();
            let mut progressed = false;
            for hw in HwId::ALL {
                let Some(key) = self.queues[g].next_for(hw) else { continue };
                if !self.units[hw.slot()].as_ref().is_some_and(|unit| unit.is_free()) {
                    continue;
                }
                if let Err(e) = self.shot_one(g, hw, key) {
                    error!("{} {} shot failed, rolling back frame: {:?}", key, hw, e);
                    self.resolve_frame(g, key, DoneType::Unprocessed);
                    first_err.get_or_insert(e);
                }
                progressed = true;
            }
            if !progressed {
                break;
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn dispatch_logged(&mut self, g: usize) {
        if let Err(e) = self.dispatch_group(g) {
            warn!("group {} dispatch: {:?}", g, e);
        }
    }

    fn shot_one(&mut self, g: usize, hw: HwId, key: FrameKey) -> Result<(), CanonicalError> {
        let Orchestrator{units, queues, hw_map, config, timeouts, ..} = &mut *self;
        let Some(unit) = units[hw.slot()].as_mut() else {
            return Err(not_found_error(format!("{} is not probed", hw).as_str()));
        };
        let Some(frame) = queues[g].get_mut(key) else {
            return Err(protocol_violation_error(format!("{} left the queue", key).as_str()));
        };
        let active = hw_map[key.instance as usize];
        unit.shot(frame, active, config.clock_gating)?;
        frame.shot.insert(hw);
        unit.arm_watchdog(config.shot_timeout, timeouts)?;
        debug!("{} {} shot", key, hw);
        Ok(())
    }

    fn shot_next_buffer(&mut self, g: usize, hw: HwId, key: FrameKey, buffer: u32)
                        -> Result<(), CanonicalError> {
        let result = {
            let Orchestrator{units, queues, hw_map, ..} = &mut *self;
            match (units[hw.slot()].as_mut(), queues[g].get(key)) {
                (Some(unit), Some(frame)) => {
                    unit.shot_buffer(frame, buffer, hw_map[key.instance as usize])
                },
                _ => Err(protocol_violation_error(
                    format!("{} multi-buffer frame left the queue", key).as_str())),
            }
        };
        match result {
            Ok(()) => {
                debug!("{} {} buffer {} shot", key, hw, buffer);
                Ok(())
            },
            Err(e) => {
                error!("{} {} buffer {} shot failed: {:?}", key, hw, buffer, e);
                self.resolve_frame(g, key, DoneType::Unprocessed);
                self.dispatch_logged(g);
                Err(e)
            },
        }
    }

    // `hw` finished `key`: collect its metadata, retire the frame once the
    // whole group is done, and give the unit its next frame.
    fn complete(&mut self, g: usize, hw: HwId, key: FrameKey) -> Result<(), CanonicalError> {
        {
            let Orchestrator{units, queues, hw_map, config, timeouts, ..} = &mut *self;
            if let Some(unit) = units[hw.slot()].as_mut() {
                if let Some(frame) = queues[g].get_mut(key) {
                    unit.get_meta(frame, hw_map[key.instance as usize]);
                }
                unit.idle_clock();
                if let Err(e) = unit.arm_watchdog(config.shot_timeout, timeouts) {
                    warn!("{} watchdog not armed: {:?}", hw, e);
                }
            }
        }
        match self.queues[g].complete(hw, key) {
            Ok(done) => {
                for frame in done {
                    self.notify(frame, DoneType::Success);
                }
            },
            Err(e) => {
                // Keep the frame from leaking.
                self.resolve_frame(g, key, DoneType::InvalidFrameNumber);
                self.dispatch_logged(g);
                return self.record_violation(hw, key, e);
            },
        }
        self.dispatch_group(g)
    }

    // Removes `key` from group `g` and resolves it. Returns false if it was
    // no longer queued.
    fn resolve_frame(&mut self, g: usize, key: FrameKey, done_type: DoneType) -> bool {
        match self.queues[g].remove(key) {
            Some(frame) => {
                self.release_frame(frame, done_type);
                true
            },
            None => false,
        }
    }

    // Releases every unit still holding `frame` and notifies the submitter.
    fn release_frame(&mut self, frame: Frame, done_type: DoneType) {
        let key = frame.key();
        {
            let Orchestrator{units, config, timeouts, ..} = &mut *self;
            for hw in frame.shot_map().intersect(frame.pending()).iter() {
                let Some(unit) = units[hw.slot()].as_mut() else { continue };
                unit.abort(key);
                unit.frame_ndone(&frame, done_type);
                unit.idle_clock();
                if let Err(e) = unit.arm_watchdog(config.shot_timeout, timeouts) {
                    warn!("{} watchdog not armed: {:?}", hw, e);
                }
            }
        }
        self.notify(frame, done_type);
    }

    fn reject(&self, frame: Frame, done_type: DoneType, err: CanonicalError)
              -> CanonicalError {
        warn!("{} rejected ({:?}): {:?}", frame.key(), done_type, err);
        self.notify(frame, done_type);
        err
    }

    fn notify(&self, frame: Frame, done_type: DoneType) {
        let output_id = self.output_id(&frame);
        if done_type == DoneType::Success {
            debug!("{} done by {}", frame.key(), output_id);
        } else {
            info!("{} not done by {}: {:?}", frame.key(), output_id, done_type);
        }
        self.notifier.notify(Completion{frame, output_id, done_type});
    }

    // The group leader reports on behalf of the group.
    fn output_id(&self, frame: &Frame) -> HwId {
        let members = self.topology(frame.instance, frame.group)
            .union(frame.shot_map())
            .union(frame.pending());
        let id = members.iter()
            .find(|hw| self.unit(*hw).is_some_and(|unit| unit.is_leader()))
            .or_else(|| members.iter().next())
            .or_else(|| hw_id_from_group(frame.group))
            .unwrap_or(HwId::Taa0);
        id
    }

    fn record_violation(&mut self, hw: HwId, key: FrameKey, err: CanonicalError)
                        -> Result<(), CanonicalError> {
        error!("{} {} protocol violation: {:?}", key, hw, err);
        self.note_bug(hw);
        Err(err)
    }

    fn note_bug(&mut self, hw: HwId) {
        self.bug_count += 1;
        let policy = self.config.violation_policy;
        if self.bug_count <= policy.threshold {
            return;
        }
        match policy.escalation {
            Escalation::LogOnly => {
                warn!("{} hardware bugs, over threshold {}", self.bug_count, policy.threshold);
            },
            Escalation::FailUnit => self.fail_unit(hw),
            Escalation::Abort => {
                panic!("{}: {} hardware bugs, over threshold {}",
                       hw, self.bug_count, policy.threshold);
            },
        }
    }

    // Takes `hw` out of service and resolves every frame waiting on it.
    fn fail_unit(&mut self, hw: HwId) {
        let Some(unit) = self.units[hw.slot()].as_mut() else { return };
        if unit.is_failed() {
            return;
        }
        unit.fail();
        error!("{} taken out of service after {} hardware bugs", hw, self.bug_count);
        for g in 0..GROUP_ID_MAX {
            let stuck = self.queues[g].pending_on(hw);
            for key in &stuck {
                self.resolve_frame(g, *key, DoneType::Unprocessed);
            }
            if !stuck.is_empty() {
                self.dispatch_logged(g);
            }
        }
    }
}

fn flush_done_type(placement: Placement) -> DoneType {
    match placement {
        Placement::Queued => DoneType::Unprocessed,
        Placement::Late => DoneType::LateFrame,
    }
}
