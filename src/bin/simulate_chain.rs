// Copyright (c) 2025 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use env_logger;
use log::{error, info, warn};

use ipchain::clock::ClockGate;
use ipchain::config::{Escalation, HwConfig, ViolationPolicy};
use ipchain::engine::Engine;
use ipchain::frame::{ChannelNotifier, Frame};
use ipchain::hardware::{HwEvent, IrqKind, Orchestrator};
use ipchain::ids::{GroupId, HwId};
use ipchain::probe::{default_descs, gate_bits, probe_chain};
use ipchain::setfile::{SetfileBuilder, SetfileVersion};
use ipchain::sim_ip::{SimClock, SimIp, SimLog};

const INSTANCE: u32 = 0;
const CHAIN: [HwId; 3] = [HwId::Taa0, HwId::Isp0, HwId::Mcsc0];

/// Utility program that streams frames through a simulated 3AA -> ISP -> MCSC
/// chain and reports how each one was resolved.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about=None)]
struct Args {
    /// Number of frames to stream.
    #[arg(short, long, default_value_t = 8)]
    frames: u32,

    /// Frames submitted ahead of the one being processed.
    #[arg(short, long, default_value_t = 2)]
    depth: u32,

    /// Per-shot watchdog, in milliseconds.
    #[arg(short, long, default_value_t = 200)]
    timeout_ms: u64,

    /// Protocol violations tolerated before a unit is taken out of service.
    #[arg(long, default_value_t = 10)]
    threshold: u32,

    /// The last unit never reports the end of the final frame.
    #[arg(long, default_value_t = false)]
    hang: bool,
}

#[tokio::main]
async fn main() {
    // If any thread panics, bail out.
    std::panic::set_hook(Box::new(|panic_info| {
        eprintln!("Thread panicked: {}", panic_info);
        std::process::exit(1);
    }));
    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();
    let shot_timeout = Duration::from_millis(args.timeout_ms);

    let config = HwConfig{shot_timeout,
                          violation_policy: ViolationPolicy{threshold: args.threshold,
                                                            escalation: Escalation::FailUnit},
                          ..HwConfig::default()};
    let descs = default_descs(&CHAIN);
    let bits = gate_bits(&descs);
    let clock = Arc::new(SimClock::default());
    let gate = Arc::new(ClockGate::new(clock.clone(), &bits));
    let (notifier, mut done) = ChannelNotifier::new();
    let (orch, expired) = Orchestrator::new(config, Arc::new(notifier));
    let mut orch = orch.with_clock_gate(gate.clone());
    let log = SimLog::new();
    if let Err(e) = probe_chain(&mut orch, &descs, Some(gate),
                                |_| Box::new(SimIp::new(log.clone()))) {
        error!("probe failed: {:?}", e);
        std::process::exit(1);
    }

    let (handle, irq) = Engine::start(orch, expired);
    for hw in CHAIN {
        handle.open(hw, INSTANCE, GroupId::TAA0, false, 0).await.unwrap();
    }

    // One table per designed unit type, two scenarios each.
    let designed = bits.iter().fold(0u32, |mask, bit| mask | (1 << bit));
    let mut builder = SetfileBuilder::new(SetfileVersion::V3, 2)
        .designed_bits(designed)
        .codes("SIM", "r0");
    for _ in &bits {
        builder = builder.sub_ip(vec![0, 1], vec![vec![0xa5; 64], vec![0x5a; 128]]);
    }
    let loaded = handle.load_setfile(INSTANCE, builder.build()).await.unwrap();
    let applied = handle.apply_setfile(INSTANCE, 1).await.unwrap();
    info!("setfile loaded into {} units, scenario 1 applied on {}", loaded, applied);

    handle.process_start(INSTANCE, GroupId::TAA0).await.unwrap();
    handle.sensor_start(INSTANCE).await.unwrap();

    // The first frame programs the whole parameter region.
    let mut submitted = 1;
    handle.grp_shot(INSTANCE, GroupId::TAA0,
                    Frame::new(submitted).with_params(u32::MAX, u32::MAX)).await.unwrap();
    while submitted < args.depth.max(1).min(args.frames) {
        submitted += 1;
        handle.grp_shot(INSTANCE, GroupId::TAA0, Frame::new(submitted)).await.unwrap();
    }
    let mut succeeded = 0;
    for fcount in 1..=args.frames {
        for (i, hw) in CHAIN.into_iter().enumerate() {
            let hang = args.hang && fcount == args.frames && i == CHAIN.len() - 1;
            let mut kinds = vec![IrqKind::FrameStart, IrqKind::ConfigLock];
            if !hang {
                kinds.extend([IrqKind::FrameEnd, IrqKind::DmaEnd]);
            }
            for kind in kinds {
                if let Err(e) = irq.raise(HwEvent::new(hw, INSTANCE, fcount, kind)) {
                    warn!("{:?}", e);
                }
            }
        }
        match tokio::time::timeout(shot_timeout * 2, done.recv()).await {
            Ok(Some(completion)) => {
                info!("frame {} resolved by {}: {:?}", completion.frame.fcount,
                      completion.output_id, completion.done_type);
                if completion.is_done() {
                    succeeded += 1;
                }
            },
            Ok(None) => break,
            Err(_) => warn!("frame {} was never resolved", fcount),
        }
        if submitted < args.frames {
            submitted += 1;
            if let Err(e) = handle.grp_shot(INSTANCE, GroupId::TAA0,
                                            Frame::new(submitted)).await {
                warn!("frame {} rejected: {:?}", submitted, e);
            }
        }
    }

    let stats = handle.stats().await.unwrap();
    info!("{}/{} frames done, {} hardware bugs", succeeded, args.frames, stats.bug_count);
    handle.dump().await.unwrap();
    handle.sensor_stop(INSTANCE).await.unwrap();
    let flushed = handle.process_stop(INSTANCE, GroupId::TAA0).await.unwrap();
    if flushed > 0 {
        info!("{} frames flushed at stop", flushed);
    }
    handle.shutdown().await.unwrap();
    info!("{} capability calls, clock gated on {} / off {} times",
          log.calls().len(), clock.enables(), clock.disables());
}
