// Copyright (c) 2025 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

// Simulated accelerator that records every capability call. For testing and
// for exercising the engine without hardware.

use std::sync::{Arc, Mutex};
use std::sync::atomic::{AtomicU32, Ordering};

use canonical_error::{CanonicalError, failed_precondition_error};
use log::debug;

use crate::clock::ClockController;
use crate::error::resource_error;
use crate::frame::{DoneType, Frame, FrameKey};
use crate::hw_ip::{HwIpOps, IpInfo, ParamRegion};
use crate::ids::{GroupId, HwId, HwMap};
use crate::setfile::IpSetfile;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum OpCall {
    Open { instance: u32, group: GroupId },
    Init { instance: u32, module_id: u32 },
    Deinit { instance: u32 },
    Close { instance: u32 },
    Enable { instance: u32 },
    Disable { instance: u32 },
    Shot { key: FrameKey },
    ShotBuffer { key: FrameKey, buffer: u32 },
    SetParam { instance: u32, lindex: u32, hindex: u32 },
    GetMeta { key: FrameKey },
    FrameNdone { key: FrameKey, done_type: DoneType },
    LoadSetfile { instance: u32, using_count: u32 },
    ApplySetfile { scenario: u32, size: usize },
    DeleteSetfile { instance: u32 },
}

/// Call history shared by any number of simulated units.
#[derive(Clone, Default)]
pub struct SimLog {
    calls: Arc<Mutex<Vec<(HwId, OpCall)>>>,
}

impl SimLog {
    pub fn new() -> Self {
        SimLog::default()
    }

    fn record(&self, hw: HwId, call: OpCall) {
        debug!("{}: {:?}", hw, call);
        if let Ok(mut calls) = self.calls.lock() {
            calls.push((hw, call));
        }
    }

    pub fn calls(&self) -> Vec<(HwId, OpCall)> {
        match self.calls.lock() {
            Ok(calls) => calls.clone(),
            Err(_) => Vec::new(),
        }
    }

    pub fn calls_for(&self, hw: HwId) -> Vec<OpCall> {
        self.calls().into_iter().filter(|(id, _)| *id == hw).map(|(_, c)| c).collect()
    }

    pub fn count(&self, pred: impl Fn(&OpCall) -> bool) -> usize {
        self.calls().iter().filter(|(_, c)| pred(c)).count()
    }

    pub fn clear(&self) {
        if let Ok(mut calls) = self.calls.lock() {
            calls.clear();
        }
    }
}

pub struct SimIp {
    log: SimLog,
    fail_open: bool,
    fail_shot_at: Option<u32>,
}

impl SimIp {
    pub fn new(log: SimLog) -> Self {
        SimIp{log, fail_open: false, fail_shot_at: None}
    }

    /// Makes the first physical open fail.
    pub fn fail_open(mut self) -> Self {
        self.fail_open = true;
        self
    }

    /// Makes the shot of frame `fcount` fail.
    pub fn fail_shot_at(mut self, fcount: u32) -> Self {
        self.fail_shot_at = Some(fcount);
        self
    }
}

impl HwIpOps for SimIp {
    fn open(&mut self, info: &IpInfo, instance: u32, group: GroupId)
            -> Result<(), CanonicalError> {
        if self.fail_open {
            return Err(resource_error(format!("{} has no memory", info.name).as_str()));
        }
        self.log.record(info.id, OpCall::Open{instance, group});
        Ok(())
    }

    fn init(&mut self, info: &IpInfo, instance: u32, _group: GroupId,
            _reprocessing: bool, module_id: u32) -> Result<(), CanonicalError> {
        self.log.record(info.id, OpCall::Init{instance, module_id});
        Ok(())
    }

    fn deinit(&mut self, info: &IpInfo, instance: u32) -> Result<(), CanonicalError> {
        self.log.record(info.id, OpCall::Deinit{instance});
        Ok(())
    }

    fn close(&mut self, info: &IpInfo, instance: u32) -> Result<(), CanonicalError> {
        self.log.record(info.id, OpCall::Close{instance});
        Ok(())
    }

    fn enable(&mut self, info: &IpInfo, instance: u32, _hw_map: HwMap)
              -> Result<(), CanonicalError> {
        self.log.record(info.id, OpCall::Enable{instance});
        Ok(())
    }

    fn disable(&mut self, info: &IpInfo, instance: u32, _hw_map: HwMap)
               -> Result<(), CanonicalError> {
        self.log.record(info.id, OpCall::Disable{instance});
        Ok(())
    }

    fn shot(&mut self, info: &IpInfo, frame: &Frame, _hw_map: HwMap)
            -> Result<(), CanonicalError> {
        if self.fail_shot_at == Some(frame.fcount) {
            return Err(failed_precondition_error(
                format!("{} rejected frame {}", info.name, frame.fcount).as_str()));
        }
        self.log.record(info.id, OpCall::Shot{key: frame.key()});
        Ok(())
    }

    fn shot_buffer(&mut self, info: &IpInfo, frame: &Frame, buffer: u32,
                   _hw_map: HwMap) -> Result<(), CanonicalError> {
        self.log.record(info.id, OpCall::ShotBuffer{key: frame.key(), buffer});
        Ok(())
    }

    fn set_param(&mut self, info: &IpInfo, _region: &ParamRegion, lindex: u32,
                 hindex: u32, instance: u32, _hw_map: HwMap)
                 -> Result<(), CanonicalError> {
        self.log.record(info.id, OpCall::SetParam{instance, lindex, hindex});
        Ok(())
    }

    fn get_meta(&mut self, info: &IpInfo, frame: &mut Frame, _hw_map: HwMap)
                -> Result<(), CanonicalError> {
        self.log.record(info.id, OpCall::GetMeta{key: frame.key()});
        frame.meta.insert(info.id, vec![frame.fcount, info.id.raw()]);
        Ok(())
    }

    fn frame_ndone(&mut self, info: &IpInfo, frame: &Frame, _instance: u32,
                   done_type: DoneType) -> Result<(), CanonicalError> {
        self.log.record(info.id, OpCall::FrameNdone{key: frame.key(), done_type});
        Ok(())
    }

    fn load_setfile(&mut self, info: &IpInfo, instance: u32, setfile: &IpSetfile)
                    -> Result<(), CanonicalError> {
        self.log.record(info.id, OpCall::LoadSetfile{instance,
                                                     using_count: setfile.using_count});
        Ok(())
    }

    fn apply_setfile(&mut self, info: &IpInfo, scenario: u32, _instance: u32,
                     table: &[u8]) -> Result<(), CanonicalError> {
        self.log.record(info.id, OpCall::ApplySetfile{scenario, size: table.len()});
        Ok(())
    }

    fn delete_setfile(&mut self, info: &IpInfo, instance: u32)
                      -> Result<(), CanonicalError> {
        self.log.record(info.id, OpCall::DeleteSetfile{instance});
        Ok(())
    }
}

/// Clock controller that counts physical gate edges.
#[derive(Default)]
pub struct SimClock {
    enables: AtomicU32,
    disables: AtomicU32,
    rate_sets: AtomicU32,
}

impl SimClock {
    pub fn enables(&self) -> u32 {
        self.enables.load(Ordering::SeqCst)
    }

    pub fn disables(&self) -> u32 {
        self.disables.load(Ordering::SeqCst)
    }

    pub fn rate_sets(&self) -> u32 {
        self.rate_sets.load(Ordering::SeqCst)
    }
}

impl ClockController for SimClock {
    fn gate(&self, bit: u32, on: bool) -> Result<(), CanonicalError> {
        debug!("clock gate bit {} {}", bit, if on { "on" } else { "off" });
        if on {
            self.enables.fetch_add(1, Ordering::SeqCst);
        } else {
            self.disables.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }

    fn set_rate(&self, name: &str, channel: u32, scenario: u32)
                -> Result<(), CanonicalError> {
        debug!("clock {} rate for channel {} scenario {}", name, channel, scenario);
        self.rate_sets.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
