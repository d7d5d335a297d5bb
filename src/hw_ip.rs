// Copyright (c) 2025 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use canonical_error::{CanonicalError, failed_precondition_error};
use chrono::{DateTime, Local};
use log::{debug, info, warn};
use tokio::sync::{mpsc, watch};

use crate::clock::ClockGate;
use crate::error::{config_error, protocol_violation_error, resource_error};
use crate::frame::{DoneType, Frame, FrameKey};
use crate::ids::{GroupId, HwId, HwMap, SensorPosition, STREAM_COUNT, instance_index};
use crate::setfile::{IpSetfile, SetfileHeader};
use crate::state::{HwFlag, HwState};
use crate::watchdog::{ShotTimeout, ShotWatchdog};

/// Number of recent frames whose debug timestamps are retained.
pub const DEBUG_FRAME_COUNT: usize = 3;
const DEBUG_POINT_MAX: usize = 4;
// Force-resolved frames remembered so their late interrupts read as stale.
const ABORTED_HISTORY: usize = 4;

/// A register-mapped address window, `[start, end)`.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct RegWindow {
    pub start: u64,
    pub end: u64,
}

impl RegWindow {
    pub fn len(&self) -> u64 {
        self.end.saturating_sub(self.start)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Identity of a unit, as seen by its capability implementation.
#[derive(Clone, Debug)]
pub struct IpInfo {
    pub id: HwId,
    pub name: String,
    pub is_leader: bool,
    pub regs: Option<RegWindow>,
    pub regs_b: Option<RegWindow>,
}

/// Parameter region of one instance. Opaque to the engine; `lindex`/`hindex`
/// select which fields changed.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ParamRegion {
    pub data: Vec<u32>,
}

/// Capabilities of one accelerator type. Every operation is optional; the
/// defaults succeed without doing anything.
pub trait HwIpOps: Send {
    fn open(&mut self, _info: &IpInfo, _instance: u32, _group: GroupId)
            -> Result<(), CanonicalError> {
        Ok(())
    }

    fn init(&mut self, _info: &IpInfo, _instance: u32, _group: GroupId,
            _reprocessing: bool, _module_id: u32) -> Result<(), CanonicalError> {
        Ok(())
    }

    fn deinit(&mut self, _info: &IpInfo, _instance: u32) -> Result<(), CanonicalError> {
        Ok(())
    }

    fn close(&mut self, _info: &IpInfo, _instance: u32) -> Result<(), CanonicalError> {
        Ok(())
    }

    fn enable(&mut self, _info: &IpInfo, _instance: u32, _hw_map: HwMap)
              -> Result<(), CanonicalError> {
        Ok(())
    }

    fn disable(&mut self, _info: &IpInfo, _instance: u32, _hw_map: HwMap)
               -> Result<(), CanonicalError> {
        Ok(())
    }

    /// Programs the unit for `frame`. Returns before the hardware runs;
    /// progress is reported through interrupts.
    fn shot(&mut self, _info: &IpInfo, _frame: &Frame, _hw_map: HwMap)
            -> Result<(), CanonicalError> {
        Ok(())
    }

    /// Re-programs the unit for buffer `buffer` of a multi-buffer frame.
    fn shot_buffer(&mut self, _info: &IpInfo, _frame: &Frame, _buffer: u32,
                   _hw_map: HwMap) -> Result<(), CanonicalError> {
        Ok(())
    }

    /// Applies a staged parameter delta. Called just before `shot`.
    fn set_param(&mut self, _info: &IpInfo, _region: &ParamRegion, _lindex: u32,
                 _hindex: u32, _instance: u32, _hw_map: HwMap)
                 -> Result<(), CanonicalError> {
        Ok(())
    }

    fn get_meta(&mut self, _info: &IpInfo, _frame: &mut Frame, _hw_map: HwMap)
                -> Result<(), CanonicalError> {
        Ok(())
    }

    fn frame_ndone(&mut self, _info: &IpInfo, _frame: &Frame, _instance: u32,
                   _done_type: DoneType) -> Result<(), CanonicalError> {
        Ok(())
    }

    fn load_setfile(&mut self, _info: &IpInfo, _instance: u32, _setfile: &IpSetfile)
                    -> Result<(), CanonicalError> {
        Ok(())
    }

    /// Writes one calibration table to the unit.
    fn apply_setfile(&mut self, _info: &IpInfo, _scenario: u32, _instance: u32,
                     _table: &[u8]) -> Result<(), CanonicalError> {
        Ok(())
    }

    fn delete_setfile(&mut self, _info: &IpInfo, _instance: u32)
                      -> Result<(), CanonicalError> {
        Ok(())
    }

    fn size_dump(&self, _info: &IpInfo) {}
}

/// Interrupt counters: frame start, config lock, frame end, DMA end.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct HwIpCount {
    pub fs: u32,
    pub cl: u32,
    pub fe: u32,
    pub dma: u32,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum DebugPoint {
    Shot = 0,
    FrameStart,
    FrameEnd,
    DmaEnd,
}

#[derive(Copy, Clone, Debug, Default)]
pub struct HwDebugInfo {
    pub fcount: u32,
    pub time: [Option<DateTime<Local>>; DEBUG_POINT_MAX],
}

/// Streaming handshake: Valid between frame start and frame end.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum VState {
    #[default]
    Blank,
    Valid,
}

/// A frame this unit has been shot for.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) struct ShotContext {
    pub key: FrameKey,
    pub num_buffers: u32,
    pub cur_s_int: u32,
    pub cur_e_int: u32,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum StartOutcome {
    /// `free` tells whether the unit can take its next configuration.
    Started { free: bool },
    /// The frame was already resolved (timeout or flush).
    Stale,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum EndOutcome {
    /// Multi-buffer frame; buffer `n` is next.
    NextBuffer(u32),
    Done,
    Stale,
}

/// One accelerator instance.
pub struct HwIp {
    info: IpInfo,
    ops: Box<dyn HwIpOps>,
    state: HwState,
    count: HwIpCount,
    debug: [HwDebugInfo; DEBUG_FRAME_COUNT],
    debug_index: usize,

    fcount: u32,
    instance: u32,
    // Number of opens not yet matched by a close.
    rsccount: u32,
    failed: bool,
    otf_start: bool,

    groups: [Option<GroupId>; STREAM_COUNT],
    regions: [Option<Arc<ParamRegion>>; STREAM_COUNT],
    lindex: [u32; STREAM_COUNT],
    hindex: [u32; STREAM_COUNT],

    // Sub-IP table used from v2 setfiles.
    setfile_index: Option<u32>,
    setfiles: [Option<IpSetfile>; SensorPosition::COUNT],

    clk_gate: Option<(Arc<ClockGate>, usize)>,
    gate_refs: u32,
    gate_busy: bool,

    pub(crate) watchdog: ShotWatchdog,
    configured: Option<ShotContext>,
    running: Option<ShotContext>,
    aborted: VecDeque<FrameKey>,
    vstate: watch::Sender<VState>,
}

impl HwIp {
    pub fn new(id: HwId, ops: Box<dyn HwIpOps>) -> Self {
        let (vstate, _) = watch::channel(VState::Blank);
        HwIp{info: IpInfo{id, name: id.name().to_string(), is_leader: false,
                          regs: None, regs_b: None},
             ops,
             state: HwState::default(),
             count: HwIpCount::default(),
             debug: [HwDebugInfo::default(); DEBUG_FRAME_COUNT],
             debug_index: 0,
             fcount: 0,
             instance: 0,
             rsccount: 0,
             failed: false,
             otf_start: false,
             groups: [None; STREAM_COUNT],
             regions: Default::default(),
             lindex: [0; STREAM_COUNT],
             hindex: [0; STREAM_COUNT],
             setfile_index: None,
             setfiles: Default::default(),
             clk_gate: None,
             gate_refs: 0,
             gate_busy: false,
             watchdog: ShotWatchdog::new(),
             configured: None,
             running: None,
             aborted: VecDeque::with_capacity(ABORTED_HISTORY),
             vstate}
    }

    pub fn leader(mut self, is_leader: bool) -> Self {
        self.info.is_leader = is_leader;
        self
    }

    pub fn with_regs(mut self, regs: RegWindow, regs_b: Option<RegWindow>) -> Self {
        self.info.regs = Some(regs);
        self.info.regs_b = regs_b;
        self
    }

    pub fn with_setfile_index(mut self, index: u32) -> Self {
        self.setfile_index = Some(index);
        self
    }

    pub fn with_clock_gate(mut self, gate: Arc<ClockGate>, idx: usize) -> Self {
        self.clk_gate = Some((gate, idx));
        self
    }

    pub fn id(&self) -> HwId {
        self.info.id
    }

    pub fn name(&self) -> &str {
        &self.info.name
    }

    pub fn info(&self) -> &IpInfo {
        &self.info
    }

    pub fn is_leader(&self) -> bool {
        self.info.is_leader
    }

    pub fn state(&self) -> HwState {
        self.state
    }

    pub fn count(&self) -> HwIpCount {
        self.count
    }

    pub fn rsccount(&self) -> u32 {
        self.rsccount
    }

    /// Last frame number shot.
    pub fn fcount(&self) -> u32 {
        self.fcount
    }

    /// Instance of the last frame shot.
    pub fn instance(&self) -> u32 {
        self.instance
    }

    pub fn is_failed(&self) -> bool {
        self.failed
    }

    pub fn otf_started(&self) -> bool {
        self.otf_start
    }

    pub fn group(&self, instance: u32) -> Option<GroupId> {
        self.groups.get(instance as usize).copied().flatten()
    }

    pub fn debug_info(&self) -> &[HwDebugInfo] {
        &self.debug
    }

    pub fn vstate(&self) -> VState {
        *self.vstate.borrow()
    }

    pub fn subscribe_vstate(&self) -> watch::Receiver<VState> {
        self.vstate.subscribe()
    }

    pub fn applied_scenario(&self, position: SensorPosition) -> Option<u32> {
        self.setfiles[position.index()].as_ref().and_then(|s| s.applied_scenario)
    }

    pub fn has_setfile(&self, position: SensorPosition) -> bool {
        self.setfiles[position.index()].is_some()
    }

    /// True when the unit can be programmed with its next frame.
    pub fn is_free(&self) -> bool {
        !self.failed &&
            self.state.is_set(HwFlag::Open) &&
            self.configured.is_none() &&
            self.running.map_or(true, |r| r.cur_s_int >= r.num_buffers)
    }

    pub(crate) fn oldest_outstanding(&self) -> Option<FrameKey> {
        self.running.or(self.configured).map(|ctx| ctx.key)
    }

    /// Takes one open reference for `instance`. An instance holds at most
    /// one reference until it closes.
    pub fn open(&mut self, instance: u32, group: GroupId) -> Result<(), CanonicalError> {
        let slot = instance_index(instance)?;
        if self.groups[slot].is_some() {
            return Err(config_error(
                format!("[{}][{}] already open", instance, self.info.name).as_str()));
        }
        if self.rsccount == 0 {
            if let Err(e) = self.ops.open(&self.info, instance, group) {
                return Err(resource_error(
                    format!("{} open failed: {:?}", self.info.name, e).as_str()));
            }
            self.count = HwIpCount::default();
            self.debug = [HwDebugInfo::default(); DEBUG_FRAME_COUNT];
            self.fcount = 0;
            self.failed = false;
            self.state.open();
            info!("[{}][{}] opened", instance, self.info.name);
        }
        self.rsccount += 1;
        self.groups[slot] = Some(group);
        Ok(())
    }

    pub fn init(&mut self, instance: u32, group: GroupId, reprocessing: bool,
                module_id: u32) -> Result<(), CanonicalError> {
        let slot = instance_index(instance)?;
        if !self.state.is_set(HwFlag::Open) {
            return Err(config_error(
                format!("{} init before open", self.info.name).as_str()));
        }
        self.ops.init(&self.info, instance, group, reprocessing, module_id)?;
        self.state.init(slot)?;
        self.groups[slot] = Some(group);
        debug!("[{}][{}] init group {} module {:#x}{}", instance, self.info.name,
               group, module_id, if reprocessing { " (reprocessing)" } else { "" });
        Ok(())
    }

    /// Drops one open reference. Returns true when this was the last one and
    /// the unit is now closed.
    pub fn close(&mut self, instance: u32) -> Result<bool, CanonicalError> {
        let slot = instance_index(instance)?;
        if !self.state.is_set(HwFlag::Open) {
            return Err(config_error(
                format!("{} close without open", self.info.name).as_str()));
        }
        if let Err(e) = self.ops.deinit(&self.info, instance) {
            warn!("[{}][{}] deinit failed: {:?}", instance, self.info.name, e);
        }
        self.state.deinit(slot);
        self.groups[slot] = None;
        self.regions[slot] = None;
        self.lindex[slot] = 0;
        self.hindex[slot] = 0;
        self.rsccount = self.rsccount.saturating_sub(1);
        if self.rsccount > 0 {
            return Ok(false);
        }

        self.watchdog.cancel();
        self.configured = None;
        self.running = None;
        self.aborted.clear();
        self.clock_gate(instance, false, true);
        if let Err(e) = self.ops.close(&self.info, instance) {
            warn!("[{}][{}] close failed: {:?}", instance, self.info.name, e);
        }
        self.state.close()?;
        self.otf_start = false;
        self.vstate.send_replace(VState::Blank);
        info!("[{}][{}] closed", instance, self.info.name);
        Ok(true)
    }

    pub fn enable(&mut self, instance: u32, hw_map: HwMap) -> Result<(), CanonicalError> {
        self.ops.enable(&self.info, instance, hw_map)
    }

    pub fn disable(&mut self, instance: u32, hw_map: HwMap) -> Result<(), CanonicalError> {
        self.ops.disable(&self.info, instance, hw_map)
    }

    pub fn set_otf_start(&mut self, started: bool) {
        self.otf_start = started;
    }

    pub fn set_secondary_channel(&mut self, started: bool) {
        self.state.set_secondary_channel(started);
    }

    /// Stages a parameter delta for the next shot of `instance`. Deltas
    /// accumulate until applied.
    pub fn stage_param(&mut self, instance: u32, region: Arc<ParamRegion>,
                       lindex: u32, hindex: u32) -> Result<(), CanonicalError> {
        let slot = instance_index(instance)?;
        if !self.state.is_initialized_for(slot) {
            return Err(config_error(
                format!("[{}][{}] set_param before init", instance, self.info.name).as_str()));
        }
        self.regions[slot] = Some(region);
        self.lindex[slot] |= lindex;
        self.hindex[slot] |= hindex;
        Ok(())
    }

    pub fn has_staged_param(&self, instance: u32) -> bool {
        let slot = instance as usize;
        slot < STREAM_COUNT && (self.lindex[slot] != 0 || self.hindex[slot] != 0)
    }

    pub fn shot(&mut self, frame: &Frame, hw_map: HwMap, clock_gating: bool)
                -> Result<(), CanonicalError> {
        let slot = instance_index(frame.instance)?;
        if self.failed {
            return Err(failed_precondition_error(
                format!("{} is out of service", self.info.name).as_str()));
        }
        if !self.state.is_initialized_for(slot) {
            return Err(config_error(
                format!("[{}][{}] shot before init", frame.instance, self.info.name).as_str()));
        }
        if !self.is_free() {
            return Err(failed_precondition_error(
                format!("{} busy, cannot take {}", self.info.name, frame.key()).as_str()));
        }

        if frame.has_param_update() || self.has_staged_param(frame.instance) {
            let lindex = self.lindex[slot] | frame.lindex;
            let hindex = self.hindex[slot] | frame.hindex;
            let region = self.regions[slot].clone().unwrap_or_default();
            self.ops.set_param(&self.info, &region, lindex, hindex, frame.instance, hw_map)?;
            self.lindex[slot] = 0;
            self.hindex[slot] = 0;
        }
        if clock_gating && !self.gate_busy {
            self.gate_busy = true;
            self.clock_gate(frame.instance, true, false);
        }
        if let Err(e) = self.ops.shot(&self.info, frame, hw_map) {
            self.idle_clock();
            return Err(e);
        }
        self.state.configure()?;
        self.configured = Some(ShotContext{key: frame.key(),
                                           num_buffers: frame.num_buffers.max(1),
                                           cur_s_int: 0,
                                           cur_e_int: 0});
        self.fcount = frame.fcount;
        self.instance = frame.instance;
        self.debug_point(frame.fcount, DebugPoint::Shot);
        Ok(())
    }

    /// Re-arms the next buffer of the multi-buffer frame in progress.
    pub fn shot_buffer(&mut self, frame: &Frame, buffer: u32, hw_map: HwMap)
                       -> Result<(), CanonicalError> {
        self.ops.shot_buffer(&self.info, frame, buffer, hw_map)?;
        self.state.configure()?;
        self.debug_point(frame.fcount, DebugPoint::Shot);
        Ok(())
    }

    pub fn frame_start(&mut self, key: FrameKey) -> Result<StartOutcome, CanonicalError> {
        self.count.fs += 1;
        self.debug_point(key.fcount, DebugPoint::FrameStart);
        if self.aborted.contains(&key) {
            return Ok(StartOutcome::Stale);
        }
        let next_buffer = matches!(self.running,
                                   Some(run) if run.key == key && run.cur_s_int < run.num_buffers);
        if next_buffer {
            self.state.frame_start()?;
            if let Some(run) = self.running.as_mut() {
                run.cur_s_int += 1;
            }
        } else {
            match self.configured {
                Some(ctx) if ctx.key == key => {
                    self.state.frame_start()?;
                    self.configured = None;
                    self.running = Some(ShotContext{cur_s_int: 1, ..ctx});
                },
                None if self.running.is_none() => return Ok(StartOutcome::Stale),
                _ => {
                    return Err(protocol_violation_error(
                        format!("{} frame start {} but configured {:?} running {:?}",
                                self.info.name, key,
                                self.configured.map(|c| c.key),
                                self.running.map(|r| r.key)).as_str()));
                },
            }
        }
        self.vstate.send_replace(VState::Valid);
        Ok(StartOutcome::Started{free: self.is_free()})
    }

    pub fn config_lock(&mut self, _key: FrameKey) {
        self.count.cl += 1;
    }

    pub fn frame_end(&mut self, key: FrameKey) -> Result<EndOutcome, CanonicalError> {
        self.count.fe += 1;
        self.debug_point(key.fcount, DebugPoint::FrameEnd);
        if self.aborted.contains(&key) {
            return Ok(EndOutcome::Stale);
        }
        let run = match self.running {
            Some(run) if run.key == key => run,
            None if self.configured.map_or(true, |c| c.key != key) => {
                return Ok(EndOutcome::Stale);
            },
            _ => {
                return Err(protocol_violation_error(
                    format!("{} frame end {} but running {:?}",
                            self.info.name, key, self.running.map(|r| r.key)).as_str()));
            },
        };
        self.state.frame_end()?;
        self.vstate.send_replace(VState::Blank);
        let cur_e_int = run.cur_e_int + 1;
        if cur_e_int < run.num_buffers {
            self.running = Some(ShotContext{cur_e_int, ..run});
            return Ok(EndOutcome::NextBuffer(cur_e_int));
        }
        // Cancel before the frame is reported so the watchdog cannot fire on
        // a completed frame.
        if self.watchdog.armed_for() == Some(key) {
            self.watchdog.cancel();
        }
        self.running = None;
        Ok(EndOutcome::Done)
    }

    pub fn dma_end(&mut self, key: FrameKey) {
        self.count.dma += 1;
        self.debug_point(key.fcount, DebugPoint::DmaEnd);
    }

    /// Forgets `key` wherever this unit holds it. Returns true if it did.
    pub fn abort(&mut self, key: FrameKey) -> bool {
        let mut held = false;
        if self.configured.is_some_and(|c| c.key == key) {
            self.configured = None;
            self.state.abort_config();
            held = true;
        }
        if let Some(run) = self.running.filter(|r| r.key == key) {
            if run.cur_s_int < run.num_buffers {
                // Next buffer was already re-armed.
                self.state.abort_config();
            }
            self.state.abort_run();
            self.running = None;
            self.vstate.send_replace(VState::Blank);
            held = true;
        }
        if self.watchdog.armed_for() == Some(key) {
            self.watchdog.cancel();
        }
        if held {
            if self.aborted.len() == ABORTED_HISTORY {
                self.aborted.pop_front();
            }
            self.aborted.push_back(key);
        }
        held
    }

    /// Arms the watchdog for the oldest outstanding frame unless it is
    /// already armed.
    pub(crate) fn arm_watchdog(&mut self, timeout: Duration,
                               expired: &mpsc::UnboundedSender<ShotTimeout>)
                               -> Result<(), CanonicalError> {
        if self.watchdog.armed_for().is_some() {
            return Ok(());
        }
        match self.oldest_outstanding() {
            Some(key) => self.watchdog.arm(self.info.id, key, timeout, expired),
            None => Ok(()),
        }
    }

    /// Drops the busy clock reference once nothing is outstanding.
    pub(crate) fn idle_clock(&mut self) {
        if self.gate_busy && self.configured.is_none() && self.running.is_none() {
            self.gate_busy = false;
            self.clock_gate(self.instance, false, false);
        }
    }

    pub(crate) fn fail(&mut self) {
        self.failed = true;
    }

    pub fn get_meta(&mut self, frame: &mut Frame, hw_map: HwMap) {
        if let Err(e) = self.ops.get_meta(&self.info, frame, hw_map) {
            warn!("[{}][{}] get_meta for frame {} failed: {:?}",
                  frame.instance, self.info.name, frame.fcount, e);
        }
    }

    pub fn frame_ndone(&mut self, frame: &Frame, done_type: DoneType) {
        if let Err(e) = self.ops.frame_ndone(&self.info, frame, frame.instance, done_type) {
            warn!("[{}][{}] frame_ndone for frame {} failed: {:?}",
                  frame.instance, self.info.name, frame.fcount, e);
        }
    }

    /// Loads this unit's tables from a parsed blob. On failure the previously
    /// loaded tables stay in place. Returns false if the blob has no tables
    /// for this unit.
    pub fn load_setfile(&mut self, instance: u32, position: SensorPosition, blob: &Bytes,
                        header: &SetfileHeader) -> Result<bool, CanonicalError> {
        let Some(subip) = header.subip_index(self.info.id.design_bit(), self.setfile_index)
        else {
            debug!("[{}][{}] no setfile tables", instance, self.info.name);
            return Ok(false);
        };
        let setfile = IpSetfile::load(blob, header, subip)?;
        self.ops.load_setfile(&self.info, instance, &setfile)?;
        info!("[{}][{}] setfile v{} loaded: sub-IP {}, {} setfiles, {} scenarios",
              instance, self.info.name, header.version as u32, subip,
              setfile.using_count, setfile.num_scenarios());
        self.setfiles[position.index()] = Some(setfile);
        self.state.set_tuneset(false);
        Ok(true)
    }

    /// Returns false if no tables are loaded for `position`.
    pub fn apply_setfile(&mut self, instance: u32, position: SensorPosition, scenario: u32)
                         -> Result<bool, CanonicalError> {
        let Some(setfile) = self.setfiles[position.index()].as_mut() else {
            return Ok(false);
        };
        if setfile.applied_scenario == Some(scenario) && self.state.is_set(HwFlag::TuneSet) {
            debug!("[{}][{}] scenario {} already applied", instance, self.info.name, scenario);
            return Ok(true);
        }
        let entry = setfile.resolve(scenario)?;
        let table = setfile.data(entry);
        self.ops.apply_setfile(&self.info, scenario, instance, &table)?;
        setfile.applied_scenario = Some(scenario);
        self.state.set_tuneset(true);
        info!("[{}][{}] setfile scenario {} applied ({} bytes at {:#x})",
              instance, self.info.name, scenario, entry.size, entry.addr);
        Ok(true)
    }

    pub fn delete_setfile(&mut self, instance: u32, position: SensorPosition)
                          -> Result<(), CanonicalError> {
        if self.setfiles[position.index()].take().is_some() {
            self.ops.delete_setfile(&self.info, instance)?;
            self.state.set_tuneset(false);
        }
        Ok(())
    }

    /// Takes (`on`) or drops a clock-gate reference. With `close`, drops every
    /// reference this unit holds.
    pub fn clock_gate(&mut self, instance: u32, on: bool, close: bool) {
        let Some((gate, idx)) = &self.clk_gate else { return };
        if close {
            while self.gate_refs > 0 {
                if let Err(e) = gate.off(*idx) {
                    warn!("[{}][{}] clock gate off failed: {:?}", instance, self.info.name, e);
                }
                self.gate_refs -= 1;
            }
            self.gate_busy = false;
            return;
        }
        if on {
            match gate.on(*idx) {
                Ok(_) => self.gate_refs += 1,
                Err(e) => warn!("[{}][{}] clock gate on failed: {:?}",
                                instance, self.info.name, e),
            }
        } else if self.gate_refs > 0 {
            if let Err(e) = gate.off(*idx) {
                warn!("[{}][{}] clock gate off failed: {:?}", instance, self.info.name, e);
            }
            self.gate_refs -= 1;
        }
    }

    pub fn size_dump(&self) {
        for (label, regs) in [("regs", self.info.regs), ("regs_b", self.info.regs_b)] {
            if let Some(regs) = regs {
                info!("{} {}: {:#x}..{:#x} ({} bytes)",
                      self.info.name, label, regs.start, regs.end, regs.len());
            }
        }
        self.ops.size_dump(&self.info);
    }

    pub fn dump_debug(&self) {
        const POINTS: [&str; DEBUG_POINT_MAX] = ["shot", "fs", "fe", "dma"];
        for record in &self.debug {
            let times: Vec<String> = record.time.iter().zip(POINTS)
                .map(|(time, point)| match time {
                    Some(t) => format!("{}={}", point, t.format("%T%.6f")),
                    None => format!("{}=-", point),
                }).collect();
            info!("{} [F{}] {}", self.info.name, record.fcount, times.join(" "));
        }
    }

    fn debug_point(&mut self, fcount: u32, point: DebugPoint) {
        if self.debug[self.debug_index].fcount != fcount {
            self.debug_index = (self.debug_index + 1) % DEBUG_FRAME_COUNT;
            self.debug[self.debug_index] = HwDebugInfo{fcount, ..Default::default()};
        }
        self.debug[self.debug_index].time[point as usize] = Some(Local::now());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{error_kind, ErrorKind};
    use crate::setfile::{SetfileBuilder, SetfileVersion, parse_header};
    use crate::sim_ip::{OpCall, SimClock, SimIp, SimLog};

    fn ready_unit(log: &SimLog) -> HwIp {
        let mut unit = HwIp::new(HwId::Isp0, Box::new(SimIp::new(log.clone())));
        unit.open(0, GroupId::ISP0).unwrap();
        unit.init(0, GroupId::ISP0, false, 0x1234).unwrap();
        unit
    }

    fn frame(fcount: u32) -> Frame {
        let mut frame = Frame::new(fcount);
        frame.group = GroupId::ISP0;
        frame
    }

    #[test]
    fn repeated_open_initialises_once() {
        let log = SimLog::new();
        let mut unit = ready_unit(&log);
        unit.open(1, GroupId::ISP0).unwrap();
        assert_eq!(unit.rsccount(), 2);
        assert_eq!(log.count(|c| matches!(c, OpCall::Open{..})), 1);

        // Instance 1 already holds its reference.
        let err = unit.open(1, GroupId::ISP0).unwrap_err();
        assert_eq!(error_kind(&err), ErrorKind::Config);
        assert_eq!(unit.rsccount(), 2);

        assert!(!unit.close(1).unwrap());
        assert!(unit.state().is_set(HwFlag::Open));
        assert!(unit.close(0).unwrap());
        assert!(!unit.state().is_set(HwFlag::Open));
        assert_eq!(log.count(|c| matches!(c, OpCall::Close{..})), 1);
        assert_eq!(error_kind(&unit.close(0).unwrap_err()), ErrorKind::Config);
    }

    #[test]
    fn failed_open_is_a_resource_error() {
        let log = SimLog::new();
        let mut unit = HwIp::new(HwId::Isp0, Box::new(SimIp::new(log).fail_open()));
        let err = unit.open(0, GroupId::ISP0).unwrap_err();
        assert_eq!(error_kind(&err), ErrorKind::Resource);
        assert_eq!(unit.rsccount(), 0);
    }

    #[test]
    fn shot_cycle() {
        let log = SimLog::new();
        let mut unit = ready_unit(&log);
        let f = frame(1);
        unit.shot(&f, HwMap::empty().with(HwId::Isp0), false).unwrap();
        assert!(unit.state().is_set(HwFlag::Config));
        assert!(!unit.is_free());

        assert_eq!(unit.frame_start(f.key()).unwrap(), StartOutcome::Started{free: true});
        assert!(unit.state().is_set(HwFlag::Run));
        assert_eq!(unit.vstate(), VState::Valid);
        assert_eq!(unit.frame_end(f.key()).unwrap(), EndOutcome::Done);
        assert!(!unit.state().is_set(HwFlag::Run));
        assert_eq!(unit.vstate(), VState::Blank);
        assert_eq!(unit.count(), HwIpCount{fs: 1, cl: 0, fe: 1, dma: 0});
        assert_eq!(unit.debug_info().iter().filter(|d| d.fcount == 1).count(), 1);
    }

    #[test]
    fn shot_requires_init_and_a_free_unit() {
        let log = SimLog::new();
        let mut unit = ready_unit(&log);
        let mut other = frame(1);
        other.instance = 3;
        assert_eq!(error_kind(&unit.shot(&other, HwMap::empty(), false).unwrap_err()),
                   ErrorKind::Config);
        unit.shot(&frame(1), HwMap::empty(), false).unwrap();
        assert!(unit.shot(&frame(2), HwMap::empty(), false).is_err());
    }

    #[test]
    fn staged_params_are_applied_before_shot() {
        let log = SimLog::new();
        let mut unit = ready_unit(&log);
        let region = Arc::new(ParamRegion{data: vec![7; 4]});
        unit.stage_param(0, region, 0x3, 0).unwrap();
        unit.stage_param(0, Arc::new(ParamRegion::default()), 0x4, 0x1).unwrap();
        assert!(unit.has_staged_param(0));
        unit.shot(&frame(1), HwMap::empty(), false).unwrap();
        assert!(!unit.has_staged_param(0));
        let calls = log.calls_for(HwId::Isp0);
        let set_param = calls.iter().position(|c| *c == OpCall::SetParam{
            instance: 0, lindex: 0x7, hindex: 0x1}).unwrap();
        let shot = calls.iter().position(|c| matches!(c, OpCall::Shot{..})).unwrap();
        assert!(set_param < shot);
    }

    #[test]
    fn frame_params_merge_with_staged_ones() {
        let log = SimLog::new();
        let mut unit = ready_unit(&log);
        unit.stage_param(0, Arc::new(ParamRegion::default()), 0x1, 0).unwrap();
        unit.shot(&frame(1).with_params(0x10, 0x2), HwMap::empty(), false).unwrap();
        unit.frame_start(frame(1).key()).unwrap();
        unit.frame_end(frame(1).key()).unwrap();
        // No update at all: set_param is skipped.
        unit.shot(&frame(2), HwMap::empty(), false).unwrap();
        let set_params: Vec<OpCall> = log.calls_for(HwId::Isp0).into_iter()
            .filter(|c| matches!(c, OpCall::SetParam{..}))
            .collect();
        assert_eq!(set_params, vec![OpCall::SetParam{instance: 0, lindex: 0x11, hindex: 0x2}]);
    }

    #[test]
    fn frame_start_checks() {
        let log = SimLog::new();
        let mut unit = ready_unit(&log);
        // Nothing outstanding: stale.
        assert_eq!(unit.frame_start(frame(9).key()).unwrap(), StartOutcome::Stale);

        unit.shot(&frame(1), HwMap::empty(), false).unwrap();
        let err = unit.frame_start(frame(2).key()).unwrap_err();
        assert_eq!(error_kind(&err), ErrorKind::ProtocolViolation);
        unit.frame_start(frame(1).key()).unwrap();
        // Double frame start.
        let err = unit.frame_start(frame(1).key()).unwrap_err();
        assert_eq!(error_kind(&err), ErrorKind::ProtocolViolation);
        assert!(unit.state().is_set(HwFlag::Run));
    }

    #[test]
    fn next_frame_start_before_frame_end_is_a_violation() {
        let log = SimLog::new();
        let mut unit = ready_unit(&log);
        unit.shot(&frame(1), HwMap::empty(), false).unwrap();
        unit.frame_start(frame(1).key()).unwrap();
        unit.shot(&frame(2), HwMap::empty(), false).unwrap();
        assert!(unit.frame_start(frame(2).key()).is_err());
        unit.frame_end(frame(1).key()).unwrap();
        unit.frame_start(frame(2).key()).unwrap();
    }

    #[test]
    fn multi_buffer_accounting() {
        let log = SimLog::new();
        let mut unit = ready_unit(&log);
        let f = frame(5).with_buffers(vec![
            crate::frame::BufferRef{index: 0, dva: 0},
            crate::frame::BufferRef{index: 1, dva: 0},
            crate::frame::BufferRef{index: 2, dva: 0}]);
        unit.shot(&f, HwMap::empty(), false).unwrap();
        assert_eq!(unit.frame_start(f.key()).unwrap(), StartOutcome::Started{free: false});
        assert_eq!(unit.frame_end(f.key()).unwrap(), EndOutcome::NextBuffer(1));
        // Buffer 1 must be re-armed before it can start.
        assert!(unit.frame_start(f.key()).is_err());
        unit.shot_buffer(&f, 1, HwMap::empty()).unwrap();
        unit.frame_start(f.key()).unwrap();
        assert_eq!(unit.frame_end(f.key()).unwrap(), EndOutcome::NextBuffer(2));
        unit.shot_buffer(&f, 2, HwMap::empty()).unwrap();
        assert_eq!(unit.frame_start(f.key()).unwrap(), StartOutcome::Started{free: true});
        assert_eq!(unit.frame_end(f.key()).unwrap(), EndOutcome::Done);
        assert_eq!(log.count(|c| matches!(c, OpCall::ShotBuffer{..})), 2);
    }

    #[test]
    fn abort_releases_only_the_given_frame() {
        let log = SimLog::new();
        let mut unit = ready_unit(&log);
        unit.shot(&frame(1), HwMap::empty(), false).unwrap();
        unit.frame_start(frame(1).key()).unwrap();
        unit.shot(&frame(2), HwMap::empty(), false).unwrap();
        assert!(unit.abort(frame(1).key()));
        assert!(!unit.state().is_set(HwFlag::Run));
        assert!(unit.state().is_set(HwFlag::Config));
        assert_eq!(unit.oldest_outstanding(), Some(frame(2).key()));
        assert!(!unit.abort(frame(1).key()));
        // Late interrupts for the aborted frame are stale.
        assert_eq!(unit.frame_end(frame(1).key()).unwrap(), EndOutcome::Stale);
        assert_eq!(unit.frame_start(frame(1).key()).unwrap(), StartOutcome::Stale);
        assert!(unit.state().is_set(HwFlag::Config));
    }

    #[test]
    fn setfile_apply_and_skip() {
        let log = SimLog::new();
        let mut unit = ready_unit(&log);
        let blob = SetfileBuilder::new(SetfileVersion::V3, 3)
            .designed_bits(1 << 3)
            .sub_ip(vec![0, 1, 1], vec![vec![1; 8], vec![2; 16]])
            .build();
        let header = parse_header(&blob).unwrap();
        let rear = SensorPosition::Rear;
        assert!(unit.load_setfile(0, rear, &blob, &header).unwrap());

        assert!(unit.apply_setfile(0, rear, 1).unwrap());
        assert_eq!(unit.applied_scenario(rear), Some(1));
        assert!(unit.state().is_set(HwFlag::TuneSet));
        // Same scenario again is skipped.
        unit.apply_setfile(0, rear, 1).unwrap();
        assert_eq!(log.count(|c| matches!(c, OpCall::ApplySetfile{..})), 1);

        let err = unit.apply_setfile(0, rear, 3).unwrap_err();
        assert_eq!(error_kind(&err), ErrorKind::Config);
        assert_eq!(unit.applied_scenario(rear), Some(1));

        assert!(!unit.apply_setfile(0, SensorPosition::Front, 0).unwrap());
        unit.delete_setfile(0, rear).unwrap();
        assert!(!unit.has_setfile(rear));
        assert!(!unit.state().is_set(HwFlag::TuneSet));
    }

    #[test]
    fn corrupt_reload_keeps_previous_tables() {
        let log = SimLog::new();
        let mut unit = ready_unit(&log);
        let blob = SetfileBuilder::new(SetfileVersion::V3, 1)
            .designed_bits(1 << 3)
            .sub_ip(vec![0], vec![vec![1; 8]])
            .build();
        let header = parse_header(&blob).unwrap();
        unit.load_setfile(0, SensorPosition::Rear, &blob, &header).unwrap();
        unit.apply_setfile(0, SensorPosition::Rear, 0).unwrap();

        let short = blob.slice(..blob.len() - 4);
        let err = unit.load_setfile(0, SensorPosition::Rear, &short, &header).unwrap_err();
        assert_eq!(error_kind(&err), ErrorKind::CorruptSetfile);
        assert_eq!(unit.applied_scenario(SensorPosition::Rear), Some(0));
    }

    #[test]
    fn clock_gate_shared_between_units() {
        let clock = Arc::new(SimClock::default());
        let gate = Arc::new(ClockGate::new(clock.clone(), &[12]));
        let log = SimLog::new();
        let mut a = HwIp::new(HwId::Mcsc0, Box::new(SimIp::new(log.clone())))
            .with_clock_gate(gate.clone(), 0);
        let mut b = HwIp::new(HwId::Mcsc1, Box::new(SimIp::new(log)))
            .with_clock_gate(gate.clone(), 0);
        a.clock_gate(0, true, false);
        b.clock_gate(0, true, false);
        assert_eq!(gate.refcount(0), 2);
        assert_eq!(clock.enables(), 1);
        a.clock_gate(0, false, true);
        assert_eq!(gate.refcount(0), 1);
        b.clock_gate(0, false, false);
        assert_eq!(clock.disables(), 1);
    }
}
