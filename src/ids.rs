// Copyright (c) 2025 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use std::fmt;

use canonical_error::CanonicalError;

use crate::error::config_error;

/// Number of concurrently active pipeline instances (camera sessions).
pub const STREAM_COUNT: usize = 8;

/// Number of pipeline groups, each with its own frame queue.
pub const GROUP_ID_MAX: usize = 16;

/// Identifies one hardware accelerator. The numeric order is the pipeline
/// order: frames flow from lower ids to higher ids.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum HwId {
    Taa0 = 1,
    Taa1,
    Isp0,
    Isp1,
    Drc,  // = 5
    Scc,
    Dis,
    Tdnr,
    Tpu0,
    Tpu1,  // = 10
    Scp,
    Mcsc0,
    Mcsc1,
    Fd,
    Vra,  // = 15
    Dcp,
    Srdz,
}

impl HwId {
    pub const ALL: [HwId; 17] = [
        HwId::Taa0, HwId::Taa1, HwId::Isp0, HwId::Isp1, HwId::Drc, HwId::Scc,
        HwId::Dis, HwId::Tdnr, HwId::Tpu0, HwId::Tpu1, HwId::Scp, HwId::Mcsc0,
        HwId::Mcsc1, HwId::Fd, HwId::Vra, HwId::Dcp, HwId::Srdz,
    ];

    /// Number of slots in the unit arena.
    pub const SLOT_COUNT: usize = HwId::ALL.len();

    pub fn from_raw(raw: u32) -> Option<HwId> {
        if raw == 0 {
            return None;
        }
        HwId::ALL.get(raw as usize - 1).copied()
    }

    pub fn raw(self) -> u32 {
        self as u32
    }

    /// Index into the unit arena.
    pub fn slot(self) -> usize {
        self as usize - 1
    }

    pub fn name(self) -> &'static str {
        match self {
            HwId::Taa0 => "3AA0",
            HwId::Taa1 => "3AA1",
            HwId::Isp0 => "ISP0",
            HwId::Isp1 => "ISP1",
            HwId::Drc => "DRC",
            HwId::Scc => "SCC",
            HwId::Dis => "DIS",
            HwId::Tdnr => "3DNR",
            HwId::Tpu0 => "TPU0",
            HwId::Tpu1 => "TPU1",
            HwId::Scp => "SCP",
            HwId::Mcsc0 => "MCSC0",
            HwId::Mcsc1 => "MCSC1",
            HwId::Fd => "FD",
            HwId::Vra => "VRA",
            HwId::Dcp => "DCP",
            HwId::Srdz => "SRDZ",
        }
    }

    /// Bit of this unit's calibration tables in a v3 setfile's design mask.
    pub fn design_bit(self) -> Option<u32> {
        match self {
            HwId::Taa0 | HwId::Taa1 | HwId::Isp0 | HwId::Isp1 => Some(3),
            HwId::Drc => Some(4),
            HwId::Scc => Some(5),
            HwId::Tpu0 | HwId::Tpu1 => Some(6),
            HwId::Dis => Some(7),
            HwId::Tdnr => Some(8),
            HwId::Scp | HwId::Mcsc0 | HwId::Mcsc1 => Some(9),
            HwId::Fd | HwId::Vra => Some(10),
            HwId::Dcp | HwId::Srdz => None,
        }
    }
}

impl fmt::Display for HwId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Set of active hardware ids. Iteration yields ids in pipeline order.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct HwMap(u64);

impl HwMap {
    pub const fn empty() -> HwMap {
        HwMap(0)
    }

    pub fn bits(&self) -> u64 {
        self.0
    }

    fn mask(id: HwId) -> u64 {
        1 << id.raw()
    }

    pub fn with(mut self, id: HwId) -> HwMap {
        self.insert(id);
        self
    }

    pub fn insert(&mut self, id: HwId) {
        self.0 |= Self::mask(id);
    }

    pub fn remove(&mut self, id: HwId) {
        self.0 &= !Self::mask(id);
    }

    pub fn contains(&self, id: HwId) -> bool {
        self.0 & Self::mask(id) != 0
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    pub fn len(&self) -> usize {
        self.0.count_ones() as usize
    }

    pub fn intersect(&self, other: HwMap) -> HwMap {
        HwMap(self.0 & other.0)
    }

    pub fn union(&self, other: HwMap) -> HwMap {
        HwMap(self.0 | other.0)
    }

    pub fn iter(&self) -> impl Iterator<Item = HwId> + '_ {
        HwId::ALL.iter().copied().filter(move |id| self.contains(*id))
    }
}

impl FromIterator<HwId> for HwMap {
    fn from_iter<I: IntoIterator<Item = HwId>>(iter: I) -> Self {
        let mut map = HwMap::empty();
        for id in iter {
            map.insert(id);
        }
        map
    }
}

impl fmt::Display for HwMap {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// A pipeline group: the units that process one logical stream of frames.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct GroupId(pub u32);

impl GroupId {
    pub const TAA0: GroupId = GroupId(0);
    pub const TAA1: GroupId = GroupId(1);
    pub const ISP0: GroupId = GroupId(2);
    pub const ISP1: GroupId = GroupId(3);
    pub const DIS: GroupId = GroupId(4);
    pub const DCP: GroupId = GroupId(5);
    pub const MCS0: GroupId = GroupId(6);
    pub const MCS1: GroupId = GroupId(7);
    pub const VRA: GroupId = GroupId(8);

    pub fn index(self) -> Result<usize, CanonicalError> {
        if self.0 as usize >= GROUP_ID_MAX {
            return Err(config_error(
                format!("group {} out of range (max {})", self.0, GROUP_ID_MAX).as_str()));
        }
        Ok(self.0 as usize)
    }
}

impl fmt::Display for GroupId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "G{}", self.0)
    }
}

/// Returns the unit that leads `group` in the default topology.
pub fn hw_id_from_group(group: GroupId) -> Option<HwId> {
    match group {
        GroupId::TAA0 => Some(HwId::Taa0),
        GroupId::TAA1 => Some(HwId::Taa1),
        GroupId::ISP0 => Some(HwId::Isp0),
        GroupId::ISP1 => Some(HwId::Isp1),
        GroupId::DIS => Some(HwId::Tpu0),
        GroupId::DCP => Some(HwId::Dcp),
        GroupId::MCS0 => Some(HwId::Mcsc0),
        GroupId::MCS1 => Some(HwId::Mcsc1),
        GroupId::VRA => Some(HwId::Vra),
        _ => None,
    }
}

/// Validates an instance number and returns it as a table index.
pub fn instance_index(instance: u32) -> Result<usize, CanonicalError> {
    if instance as usize >= STREAM_COUNT {
        return Err(config_error(
            format!("instance {} out of range (max {})", instance, STREAM_COUNT).as_str()));
    }
    Ok(instance as usize)
}

/// Which sensor a pipeline instance is fed from. Selects the setfile slot.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum SensorPosition {
    #[default]
    Rear,
    Front,
    Rear2,
    Front2,
}

impl SensorPosition {
    pub const COUNT: usize = 4;

    pub fn index(self) -> usize {
        self as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hw_map_iterates_in_pipeline_order() {
        let map = HwMap::empty().with(HwId::Mcsc0).with(HwId::Taa0).with(HwId::Isp0);
        let ids: Vec<HwId> = map.iter().collect();
        assert_eq!(ids, vec![HwId::Taa0, HwId::Isp0, HwId::Mcsc0]);
        assert_eq!(map.len(), 3);
    }

    #[test]
    fn raw_ids_and_slots() {
        assert_eq!(HwId::from_raw(1), Some(HwId::Taa0));
        assert_eq!(HwId::from_raw(17), Some(HwId::Srdz));
        assert_eq!(HwId::from_raw(0), None);
        assert_eq!(HwId::from_raw(18), None);
        assert_eq!(HwId::Vra.raw(), 15);
        assert_eq!(HwId::Taa0.slot(), 0);
    }

    #[test]
    fn out_of_range_instance_and_group() {
        assert!(instance_index(STREAM_COUNT as u32).is_err());
        assert_eq!(instance_index(3).unwrap(), 3);
        assert!(GroupId(GROUP_ID_MAX as u32).index().is_err());
    }
}
