// Copyright (c) 2025 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use std::collections::BTreeMap;
use std::fmt;

use log::warn;
use tokio::sync::mpsc;

use crate::ids::{GroupId, HwId, HwMap};

/// How a frame was resolved. Anything but Success is a not-done completion.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum DoneType {
    Success,
    Unprocessed,
    LateFrame,
    Overflow,
    InvalidFrameNumber,
    Timeout,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum ShotType {
    Internal,
    #[default]
    External,
    /// Held in the late queue before being shot.
    Late,
    /// More than one buffer per frame.
    Multi,
}

/// Identifies a frame within a group queue. Frame numbers are only unique
/// within one instance.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct FrameKey {
    pub instance: u32,
    pub fcount: u32,
}

impl fmt::Display for FrameKey {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "[I{}][F{}]", self.instance, self.fcount)
    }
}

/// Opaque reference to a DMA buffer owned by the submitter.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct BufferRef {
    pub index: u32,
    pub dva: u64,
}

/// One logical camera frame crossing the pipeline.
#[derive(Clone, Debug)]
pub struct Frame {
    pub fcount: u32,
    pub instance: u32,
    pub group: GroupId,

    /// Low/high 32-bit masks of the parameter region fields this frame updates.
    pub lindex: u32,
    pub hindex: u32,

    /// Buffers per frame; more than one makes this a multi-buffer shot.
    pub num_buffers: u32,
    pub buffers: Vec<BufferRef>,
    pub shot_type: ShotType,

    /// Post-processing metadata collected from each unit after frame end.
    pub meta: BTreeMap<HwId, Vec<u32>>,

    // Units that have not yet completed this frame.
    pub(crate) pending: HwMap,
    // Units that have been issued a shot for this frame.
    pub(crate) shot: HwMap,
}

impl Frame {
    pub fn new(fcount: u32) -> Self {
        Frame{fcount,
              instance: 0,
              group: GroupId::TAA0,
              lindex: 0,
              hindex: 0,
              num_buffers: 1,
              buffers: Vec::new(),
              shot_type: ShotType::External,
              meta: BTreeMap::new(),
              pending: HwMap::empty(),
              shot: HwMap::empty()}
    }

    pub fn with_params(mut self, lindex: u32, hindex: u32) -> Self {
        self.lindex = lindex;
        self.hindex = hindex;
        self
    }

    pub fn with_buffers(mut self, buffers: Vec<BufferRef>) -> Self {
        self.num_buffers = buffers.len().max(1) as u32;
        if self.num_buffers > 1 {
            self.shot_type = ShotType::Multi;
        }
        self.buffers = buffers;
        self
    }

    pub fn key(&self) -> FrameKey {
        FrameKey{instance: self.instance, fcount: self.fcount}
    }

    pub fn has_param_update(&self) -> bool {
        self.lindex != 0 || self.hindex != 0
    }

    /// Units still expected to report this frame done.
    pub fn pending(&self) -> HwMap {
        self.pending
    }

    /// Units that were issued a shot for this frame.
    pub fn shot_map(&self) -> HwMap {
        self.shot
    }
}

/// Outward signal of pipeline progress: every submitted frame yields exactly
/// one of these.
#[derive(Debug)]
pub struct Completion {
    pub frame: Frame,
    pub output_id: HwId,
    pub done_type: DoneType,
}

impl Completion {
    pub fn is_done(&self) -> bool {
        self.done_type == DoneType::Success
    }
}

/// Downstream collaborator receiving frame done/not-done notifications.
pub trait FrameNotifier: Send + Sync {
    fn notify(&self, completion: Completion);
}

/// FrameNotifier that forwards completions over a channel.
pub struct ChannelNotifier {
    tx: mpsc::UnboundedSender<Completion>,
}

impl ChannelNotifier {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Completion>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (ChannelNotifier{tx}, rx)
    }
}

impl FrameNotifier for ChannelNotifier {
    fn notify(&self, completion: Completion) {
        let key = completion.frame.key();
        if self.tx.send(completion).is_err() {
            warn!("completion for {} dropped, receiver is gone", key);
        }
    }
}
