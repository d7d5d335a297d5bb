// Copyright (c) 2025 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use std::sync::Arc;

use canonical_error::{CanonicalError, not_found_error};
use log::info;

use crate::clock::ClockGate;
use crate::hardware::Orchestrator;
use crate::hw_ip::{HwIp, HwIpOps, RegWindow};
use crate::ids::{GROUP_ID_MAX, GroupId, HwId, hw_id_from_group};

const REG_BASE: u64 = 0x1400_0000;
const REG_STRIDE: u64 = 0x1_0000;

/// How to bring up one unit.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IpDesc {
    pub id: HwId,
    pub is_leader: bool,
    pub regs: Option<RegWindow>,
    pub regs_b: Option<RegWindow>,
    /// Sub-IP table used with v2 setfiles.
    pub setfile_index: Option<u32>,
    pub clock_slot: Option<usize>,
}

/// True if `id` leads some group of the default topology.
pub fn is_group_leader(id: HwId) -> bool {
    (0..GROUP_ID_MAX as u32).any(|g| hw_id_from_group(GroupId(g)) == Some(id))
}

// Distinct design bits of `ids`, ascending.
fn design_bits(ids: &[HwId]) -> Vec<u32> {
    let mut bits: Vec<u32> = ids.iter().filter_map(|id| id.design_bit()).collect();
    bits.sort_unstable();
    bits.dedup();
    bits
}

/// Descriptors for `ids` in the default layout. Each unit gets one register
/// window (MCSC units a second one), units sharing a design bit share a v2
/// sub-IP table and a clock-gate slot.
pub fn default_descs(ids: &[HwId]) -> Vec<IpDesc> {
    let bits = design_bits(ids);
    ids.iter().map(|&id| {
        let start = REG_BASE + id.slot() as u64 * REG_STRIDE;
        let regs_b = match id {
            HwId::Mcsc0 | HwId::Mcsc1 => Some(RegWindow{start: start + REG_STRIDE / 2,
                                                        end: start + REG_STRIDE}),
            _ => None,
        };
        let slot = id.design_bit().and_then(|bit| bits.iter().position(|b| *b == bit));
        IpDesc{id,
               is_leader: is_group_leader(id),
               regs: Some(RegWindow{start, end: start + REG_STRIDE / 2}),
               regs_b,
               setfile_index: slot.map(|s| s as u32),
               clock_slot: slot}
    }).collect()
}

/// Gate bit of each clock slot used by `descs`.
pub fn gate_bits(descs: &[IpDesc]) -> Vec<u32> {
    let ids: Vec<HwId> = descs.iter().map(|d| d.id).collect();
    design_bits(&ids)
}

/// Builds and probes a unit for each descriptor. `make_ops` supplies each
/// unit's capability implementation. Returns the number of units probed.
pub fn probe_chain(orch: &mut Orchestrator, descs: &[IpDesc], gate: Option<Arc<ClockGate>>,
                   mut make_ops: impl FnMut(HwId) -> Box<dyn HwIpOps>)
                   -> Result<usize, CanonicalError> {
    if descs.is_empty() {
        return Err(not_found_error("No units to probe"));
    }
    for desc in descs {
        let mut unit = HwIp::new(desc.id, make_ops(desc.id)).leader(desc.is_leader);
        if let Some(regs) = desc.regs {
            unit = unit.with_regs(regs, desc.regs_b);
        }
        if let Some(index) = desc.setfile_index {
            unit = unit.with_setfile_index(index);
        }
        if let (Some(gate), Some(slot)) = (&gate, desc.clock_slot) {
            unit = unit.with_clock_gate(gate.clone(), slot);
        }
        orch.probe(unit)?;
    }
    info!("probed {} units", descs.len());
    Ok(descs.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HwConfig;
    use crate::frame::ChannelNotifier;
    use crate::sim_ip::{SimClock, SimIp, SimLog};

    #[test]
    fn default_layout() {
        let descs = default_descs(&[HwId::Taa0, HwId::Isp0, HwId::Mcsc0, HwId::Dcp]);
        assert!(descs[0].is_leader);
        assert_eq!(descs[0].clock_slot, descs[1].clock_slot);
        assert_eq!(descs[2].setfile_index, Some(1));
        assert!(descs[2].regs_b.is_some());
        assert_eq!(descs[3].clock_slot, None);
        assert_eq!(gate_bits(&descs), vec![3, 9]);
        assert!(!is_group_leader(HwId::Drc));
    }

    #[tokio::test]
    async fn probe_chain_shares_clock_gates() {
        let (notifier, _done) = ChannelNotifier::new();
        let (mut orch, _expired) = Orchestrator::new(HwConfig::default(), Arc::new(notifier));
        let descs = default_descs(&[HwId::Taa0, HwId::Isp0]);
        let clock = Arc::new(SimClock::default());
        let gate = Arc::new(ClockGate::new(clock.clone(), &gate_bits(&descs)));
        let log = SimLog::new();
        let probed = probe_chain(&mut orch, &descs, Some(gate.clone()),
                                 |_| Box::new(SimIp::new(log.clone()))).unwrap();
        assert_eq!(probed, 2);
        assert!(probe_chain(&mut orch, &descs, None,
                            |_| Box::new(SimIp::new(log.clone()))).is_err());

        orch.open(HwId::Taa0, 0, GroupId::TAA0, false, 0).unwrap();
        orch.open(HwId::Isp0, 0, GroupId::TAA0, false, 0).unwrap();
        orch.grp_shot(0, GroupId::TAA0, crate::frame::Frame::new(1)).unwrap();
        assert_eq!(gate.refcount(0), 2);
        assert_eq!(clock.enables(), 1);
    }
}
