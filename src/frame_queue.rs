// Copyright (c) 2025 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

// Ordered in-flight frames of one pipeline group. Frames leave in submission
// order. When the primary queue is full, frames overflow into a bounded late
// queue and wait there, unconfigured, until room frees.

use std::collections::VecDeque;

use canonical_error::CanonicalError;
use log::debug;

use crate::error::{config_error, protocol_violation_error, resource_error};
use crate::frame::{Frame, FrameKey, ShotType};
use crate::ids::HwId;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Placement {
    Queued,
    /// Held in the late queue; the submitter should back off.
    Late,
}

pub struct FrameQueue {
    frames: VecDeque<Frame>,
    late: VecDeque<Frame>,
    capacity: usize,
    late_capacity: usize,
}

impl FrameQueue {
    pub fn new(capacity: usize, late_capacity: usize) -> Self {
        FrameQueue{frames: VecDeque::with_capacity(capacity),
                   late: VecDeque::with_capacity(late_capacity),
                   capacity,
                   late_capacity}
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn late_len(&self) -> usize {
        self.late.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty() && self.late.is_empty()
    }

    pub fn head(&self) -> Option<&Frame> {
        self.frames.front()
    }

    pub fn contains(&self, key: FrameKey) -> bool {
        self.frames.iter().chain(self.late.iter()).any(|f| f.key() == key)
    }

    /// Where a frame with `key` would be placed, without placing it.
    pub fn admit(&self, key: FrameKey) -> Result<Placement, CanonicalError> {
        if self.contains(key) {
            return Err(config_error(
                format!("frame {} is already in flight", key).as_str()));
        }
        if self.frames.len() < self.capacity && self.late.is_empty() {
            return Ok(Placement::Queued);
        }
        if self.late.len() < self.late_capacity {
            return Ok(Placement::Late);
        }
        Err(resource_error(
            format!("frame queue full ({}+{}), rejecting {}",
                    self.capacity, self.late_capacity, key).as_str()))
    }

    pub fn push(&mut self, frame: Frame) -> Result<Placement, CanonicalError> {
        let placement = self.admit(frame.key())?;
        match placement {
            Placement::Queued => self.frames.push_back(frame),
            Placement::Late => self.late.push_back(frame),
        }
        Ok(placement)
    }

    /// Frames in the late queue are not eligible for configuration.
    pub fn get(&self, key: FrameKey) -> Option<&Frame> {
        self.frames.iter().find(|f| f.key() == key)
    }

    pub fn get_mut(&mut self, key: FrameKey) -> Option<&mut Frame> {
        self.frames.iter_mut().find(|f| f.key() == key)
    }

    /// Frames, late ones included, still waiting on `hw`.
    pub fn pending_on(&self, hw: HwId) -> Vec<FrameKey> {
        self.frames.iter().chain(self.late.iter())
            .filter(|f| f.pending.contains(hw))
            .map(|f| f.key())
            .collect()
    }

    /// Oldest frame that `hw` has yet to be shot for.
    pub fn next_for(&self, hw: HwId) -> Option<FrameKey> {
        self.frames.iter()
            .find(|f| f.pending.contains(hw) && !f.shot.contains(hw))
            .map(|f| f.key())
    }

    /// Records that `hw` finished frame `key`. `key` must be the oldest frame
    /// still pending on `hw`; otherwise nothing changes and a protocol
    /// violation is returned. Returns the frames that left the queue, which
    /// are those at the head with no unit left pending.
    pub fn complete(&mut self, hw: HwId, key: FrameKey)
                    -> Result<Vec<Frame>, CanonicalError> {
        let pos = self.frames.iter().position(|f| f.pending.contains(hw));
        let pos = match pos {
            Some(pos) if self.frames[pos].key() == key => pos,
            Some(pos) => {
                return Err(protocol_violation_error(
                    format!("{} done for {} but expected {}",
                            hw, key, self.frames[pos].key()).as_str()));
            },
            None => {
                return Err(protocol_violation_error(
                    format!("{} done for {} but nothing is pending", hw, key).as_str()));
            },
        };
        self.frames[pos].pending.remove(hw);
        let mut done = Vec::new();
        while self.frames.front().is_some_and(|f| f.pending.is_empty()) {
            if let Some(frame) = self.frames.pop_front() {
                done.push(frame);
            }
        }
        Ok(done)
    }

    pub fn remove(&mut self, key: FrameKey) -> Option<Frame> {
        if let Some(pos) = self.frames.iter().position(|f| f.key() == key) {
            return self.frames.remove(pos);
        }
        let pos = self.late.iter().position(|f| f.key() == key)?;
        self.late.remove(pos)
    }

    /// Moves late frames into the primary queue while there is room.
    pub fn promote_late(&mut self) -> Vec<FrameKey> {
        let mut promoted = Vec::new();
        while self.frames.len() < self.capacity {
            let Some(mut frame) = self.late.pop_front() else { break };
            frame.shot_type = ShotType::Late;
            debug!("promoting late frame {}", frame.key());
            promoted.push(frame.key());
            self.frames.push_back(frame);
        }
        promoted
    }

    /// Removes every frame, oldest first, late frames last.
    pub fn flush(&mut self) -> Vec<(Frame, Placement)> {
        self.frames.drain(..).map(|f| (f, Placement::Queued))
            .chain(self.late.drain(..).map(|f| (f, Placement::Late)))
            .collect()
    }

    /// Removes every frame belonging to `instance`.
    pub fn drain_instance(&mut self, instance: u32) -> Vec<(Frame, Placement)> {
        let mut drained = Vec::new();
        for (queue, placement) in [(&mut self.frames, Placement::Queued),
                                   (&mut self.late, Placement::Late)] {
            let mut kept = VecDeque::with_capacity(queue.len());
            for frame in queue.drain(..) {
                if frame.instance == instance {
                    drained.push((frame, placement));
                } else {
                    kept.push_back(frame);
                }
            }
            *queue = kept;
        }
        drained
    }

    pub fn keys(&self) -> Vec<FrameKey> {
        self.frames.iter().map(|f| f.key()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{error_kind, ErrorKind};
    use crate::ids::HwMap;

    fn frame_for(fcount: u32, units: HwMap) -> Frame {
        let mut frame = Frame::new(fcount);
        frame.pending = units;
        frame
    }

    fn key(fcount: u32) -> FrameKey {
        FrameKey{instance: 0, fcount}
    }

    #[test]
    fn completes_in_fifo_order() {
        let units = HwMap::empty().with(HwId::Taa0);
        let mut queue = FrameQueue::new(20, 5);
        for fcount in 1..=3 {
            assert_eq!(queue.push(frame_for(fcount, units)).unwrap(), Placement::Queued);
        }
        let done = queue.complete(HwId::Taa0, key(1)).unwrap();
        assert_eq!(done.len(), 1);
        assert_eq!(done[0].fcount, 1);
        assert_eq!(queue.keys(), vec![key(2), key(3)]);
    }

    #[test]
    fn out_of_order_completion_leaves_queue_intact() {
        let units = HwMap::empty().with(HwId::Taa0);
        let mut queue = FrameQueue::new(20, 5);
        queue.push(frame_for(1, units)).unwrap();
        queue.push(frame_for(2, units)).unwrap();
        let err = queue.complete(HwId::Taa0, key(2)).unwrap_err();
        assert_eq!(error_kind(&err), ErrorKind::ProtocolViolation);
        assert_eq!(queue.head().unwrap().fcount, 1);
        assert!(queue.head().unwrap().pending.contains(HwId::Taa0));
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn group_frame_leaves_after_every_member() {
        let units = HwMap::empty().with(HwId::Taa0).with(HwId::Isp0);
        let mut queue = FrameQueue::new(20, 5);
        queue.push(frame_for(1, units)).unwrap();
        queue.push(frame_for(2, units)).unwrap();
        // The leader may run ahead of the next unit.
        assert!(queue.complete(HwId::Taa0, key(1)).unwrap().is_empty());
        assert!(queue.complete(HwId::Taa0, key(2)).unwrap().is_empty());
        let done = queue.complete(HwId::Isp0, key(1)).unwrap();
        assert_eq!(done.iter().map(|f| f.fcount).collect::<Vec<_>>(), vec![1]);
        let done = queue.complete(HwId::Isp0, key(2)).unwrap();
        assert_eq!(done.iter().map(|f| f.fcount).collect::<Vec<_>>(), vec![2]);
        assert!(queue.is_empty());
    }

    #[test]
    fn overflow_goes_late_then_rejects() {
        let units = HwMap::empty().with(HwId::Taa0);
        let mut queue = FrameQueue::new(2, 1);
        queue.push(frame_for(1, units)).unwrap();
        queue.push(frame_for(2, units)).unwrap();
        assert_eq!(queue.push(frame_for(3, units)).unwrap(), Placement::Late);
        let err = queue.push(frame_for(4, units)).unwrap_err();
        assert_eq!(error_kind(&err), ErrorKind::Resource);
        assert!(queue.admit(key(4)).is_err());
        assert_eq!(queue.pending_on(HwId::Taa0), vec![key(1), key(2), key(3)]);
        // Late frames are not eligible for configuration.
        assert!(queue.get(key(3)).is_none());

        queue.complete(HwId::Taa0, key(1)).unwrap();
        assert_eq!(queue.promote_late(), vec![key(3)]);
        assert_eq!(queue.get(key(3)).unwrap().shot_type, ShotType::Late);
        assert_eq!(queue.late_len(), 0);
    }

    #[test]
    fn duplicate_frames_are_rejected() {
        let units = HwMap::empty().with(HwId::Taa0);
        let mut queue = FrameQueue::new(20, 5);
        queue.push(frame_for(1, units)).unwrap();
        let err = queue.push(frame_for(1, units)).unwrap_err();
        assert_eq!(error_kind(&err), ErrorKind::Config);
    }

    #[test]
    fn next_for_skips_frames_already_shot() {
        let units = HwMap::empty().with(HwId::Taa0).with(HwId::Isp0);
        let mut queue = FrameQueue::new(20, 5);
        queue.push(frame_for(1, units)).unwrap();
        queue.push(frame_for(2, units)).unwrap();
        queue.get_mut(key(1)).unwrap().shot.insert(HwId::Taa0);
        assert_eq!(queue.next_for(HwId::Taa0), Some(key(2)));
        assert_eq!(queue.next_for(HwId::Isp0), Some(key(1)));
        assert_eq!(queue.next_for(HwId::Mcsc0), None);
    }

    #[test]
    fn flush_and_drain() {
        let units = HwMap::empty().with(HwId::Taa0);
        let mut queue = FrameQueue::new(1, 5);
        queue.push(frame_for(1, units)).unwrap();
        let mut other = frame_for(1, units);
        other.instance = 1;
        queue.push(other).unwrap();
        queue.push(frame_for(2, units)).unwrap();

        let drained = queue.drain_instance(1);
        assert_eq!(drained.len(), 1);
        assert_eq!(drained[0].0.instance, 1);
        assert_eq!(drained[0].1, Placement::Late);

        let flushed = queue.flush();
        assert_eq!(flushed.iter().map(|(f, p)| (f.fcount, *p)).collect::<Vec<_>>(),
                   vec![(1, Placement::Queued), (2, Placement::Late)]);
        assert!(queue.is_empty());
    }

    #[test]
    fn remove_finds_late_frames() {
        let units = HwMap::empty().with(HwId::Taa0);
        let mut queue = FrameQueue::new(1, 2);
        queue.push(frame_for(1, units)).unwrap();
        queue.push(frame_for(2, units)).unwrap();
        assert_eq!(queue.remove(key(2)).unwrap().fcount, 2);
        assert!(queue.remove(key(2)).is_none());
        assert_eq!(queue.late_len(), 0);
    }
}
