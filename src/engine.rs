// Copyright (c) 2025 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

// Runs an Orchestrator on a single consumer task. Interrupt sources enqueue
// events without blocking on their own queue; submitters send commands on
// another and await the reply. Every state transition happens on the consumer
// task. Pending interrupts are always handled before watchdog expiries and
// commands, so a command backlog never delays or drops an interrupt.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use canonical_error::{CanonicalError, not_found_error, unavailable_error};
use log::{debug, info, warn};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::sync::mpsc::error::TrySendError;

use crate::error::{resource_error, timeout_error};
use crate::frame::Frame;
use crate::frame_queue::Placement;
use crate::hardware::{HwEvent, HwStats, Orchestrator, Submission};
use crate::hw_ip::{ParamRegion, VState};
use crate::ids::{GroupId, HwId, HwMap, SensorPosition};
use crate::watchdog::ShotTimeout;

type Reply<T> = oneshot::Sender<Result<T, CanonicalError>>;

enum Command {
    Open { hw: HwId, instance: u32, group: GroupId, reprocessing: bool, module_id: u32,
           reply: Reply<()> },
    Close { hw: HwId, instance: u32, reply: Reply<()> },
    SetSensorPosition { instance: u32, position: SensorPosition, reply: Reply<()> },
    SetParam { instance: u32, hw_map: HwMap, region: Arc<ParamRegion>, lindex: u32,
               hindex: u32, reply: Reply<()> },
    GrpShot { instance: u32, group: GroupId, frame: Frame, reply: Reply<Placement> },
    Submit { submission: Submission, reply: Reply<Placement> },
    LoadSetfile { instance: u32, blob: Bytes, reply: Reply<usize> },
    ApplySetfile { instance: u32, scenario: u32, reply: Reply<usize> },
    DeleteSetfile { instance: u32, reply: Reply<()> },
    SensorStart { instance: u32, reply: Reply<()> },
    SensorStop { instance: u32, reply: Reply<()> },
    ProcessStart { instance: u32, group: GroupId, reply: Reply<()> },
    ProcessStop { instance: u32, group: GroupId, reply: Reply<usize> },
    SubscribeVState { hw: HwId, reply: oneshot::Sender<Option<watch::Receiver<VState>>> },
    VStates { instance: u32, reply: oneshot::Sender<Vec<(HwId, watch::Receiver<VState>)>> },
    Stats { reply: oneshot::Sender<HwStats> },
    Dump { reply: oneshot::Sender<()> },
    Shutdown { reply: oneshot::Sender<Orchestrator> },
}

pub struct Engine {
    orch: Orchestrator,
    irqs: mpsc::Receiver<HwEvent>,
    commands: mpsc::Receiver<Command>,
    expired: mpsc::UnboundedReceiver<ShotTimeout>,
}

impl Engine {
    /// Spawns the consumer task. `expired` is the watchdog receiver returned
    /// by `Orchestrator::new()`. The interrupt and command queues each hold
    /// `event_queue_depth` entries.
    pub fn start(orch: Orchestrator, expired: mpsc::UnboundedReceiver<ShotTimeout>)
                 -> (EngineHandle, IrqSender) {
        let depth = orch.config().event_queue_depth.max(1);
        let (irq_tx, irqs) = mpsc::channel(depth);
        let (tx, commands) = mpsc::channel(depth);
        let stop_timeout = orch.config().stop_timeout;
        tokio::spawn(Engine{orch, irqs, commands, expired}.run());
        (EngineHandle{tx, stop_timeout}, IrqSender{tx: irq_tx})
    }

    async fn run(self) {
        let Engine{mut orch, mut irqs, mut commands, mut expired} = self;
        info!("engine started");
        loop {
            tokio::select! {
                biased;

                // Disabled once every IrqSender is gone.
                Some(event) = irqs.recv() => {
                    if let Err(e) = orch.handle_irq(event) {
                        warn!("{:?} {} {:?}: {:?}", event.kind, event.key(), event.hw, e);
                    }
                },
                Some(timeout) = expired.recv() => {
                    if let Err(e) = orch.handle_timeout(timeout) {
                        warn!("watchdog {:?}: {:?}", timeout, e);
                    }
                },
                command = commands.recv() => match command {
                    Some(Command::Shutdown{reply}) => {
                        orch.clear();
                        info!("engine stopped");
                        let _ = reply.send(orch);
                        return;
                    },
                    Some(command) => execute(&mut orch, command),
                    None => {
                        info!("engine handles dropped, stopping");
                        break;
                    },
                },
            }
        }
        orch.clear();
    }
}

fn execute(orch: &mut Orchestrator, command: Command) {
    match command {
        Command::Open{hw, instance, group, reprocessing, module_id, reply} => {
            let _ = reply.send(orch.open(hw, instance, group, reprocessing, module_id));
        },
        Command::Close{hw, instance, reply} => {
            let _ = reply.send(orch.close(hw, instance));
        },
        Command::SetSensorPosition{instance, position, reply} => {
            let _ = reply.send(orch.set_sensor_position(instance, position));
        },
        Command::SetParam{instance, hw_map, region, lindex, hindex, reply} => {
            let _ = reply.send(orch.set_param(instance, hw_map, region, lindex, hindex));
        },
        Command::GrpShot{instance, group, frame, reply} => {
            let _ = reply.send(orch.grp_shot(instance, group, frame));
        },
        Command::Submit{submission, reply} => {
            let _ = reply.send(orch.submit(submission));
        },
        Command::LoadSetfile{instance, blob, reply} => {
            let _ = reply.send(orch.load_setfile(instance, blob));
        },
        Command::ApplySetfile{instance, scenario, reply} => {
            let _ = reply.send(orch.apply_setfile(instance, scenario));
        },
        Command::DeleteSetfile{instance, reply} => {
            let _ = reply.send(orch.delete_setfile(instance));
        },
        Command::SensorStart{instance, reply} => {
            let _ = reply.send(orch.sensor_start(instance));
        },
        Command::SensorStop{instance, reply} => {
            let _ = reply.send(orch.sensor_stop(instance));
        },
        Command::ProcessStart{instance, group, reply} => {
            let _ = reply.send(orch.process_start(instance, group));
        },
        Command::ProcessStop{instance, group, reply} => {
            let _ = reply.send(orch.process_stop(instance, group));
        },
        Command::SubscribeVState{hw, reply} => {
            let _ = reply.send(orch.subscribe_vstate(hw));
        },
        Command::VStates{instance, reply} => {
            let vstates = orch.hw_map(instance).iter()
                .filter_map(|hw| orch.subscribe_vstate(hw).map(|rx| (hw, rx)))
                .collect();
            let _ = reply.send(vstates);
        },
        Command::Stats{reply} => {
            let _ = reply.send(orch.stats());
        },
        Command::Dump{reply} => {
            orch.size_dump();
            orch.clk_gate_dump();
            orch.print_frame_counts();
            let _ = reply.send(());
        },
        Command::Shutdown{..} => unreachable!("handled by the engine loop"),
    }
}

/// Interrupt-domain entry point. Never blocks.
#[derive(Clone)]
pub struct IrqSender {
    tx: mpsc::Sender<HwEvent>,
}

impl IrqSender {
    /// Enqueues an interrupt event. A full queue is a resource error; the
    /// event is dropped and the unit's watchdog resolves the frame.
    pub fn raise(&self, event: HwEvent) -> Result<(), CanonicalError> {
        match self.tx.try_send(event) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => Err(resource_error(
                format!("interrupt queue full, dropped {:?} {}", event.kind, event.key()).as_str())),
            Err(TrySendError::Closed(_)) => Err(unavailable_error("engine stopped")),
        }
    }
}

/// Submission-domain handle. Each call is answered by the engine task.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<Command>,
    stop_timeout: Duration,
}

impl EngineHandle {
    async fn request<T>(&self, command: impl FnOnce(oneshot::Sender<T>) -> Command)
                        -> Result<T, CanonicalError> {
        let (reply, response) = oneshot::channel();
        self.tx.send(command(reply)).await
            .map_err(|_| unavailable_error("engine stopped"))?;
        response.await.map_err(|_| unavailable_error("engine dropped the request"))
    }

    pub async fn open(&self, hw: HwId, instance: u32, group: GroupId, reprocessing: bool,
                      module_id: u32) -> Result<(), CanonicalError> {
        self.request(|reply| Command::Open{hw, instance, group, reprocessing, module_id,
                                           reply}).await?
    }

    pub async fn close(&self, hw: HwId, instance: u32) -> Result<(), CanonicalError> {
        self.request(|reply| Command::Close{hw, instance, reply}).await?
    }

    pub async fn set_sensor_position(&self, instance: u32, position: SensorPosition)
                                     -> Result<(), CanonicalError> {
        self.request(|reply| Command::SetSensorPosition{instance, position, reply}).await?
    }

    pub async fn set_param(&self, instance: u32, hw_map: HwMap, region: Arc<ParamRegion>,
                           lindex: u32, hindex: u32) -> Result<(), CanonicalError> {
        self.request(|reply| Command::SetParam{instance, hw_map, region, lindex, hindex,
                                               reply}).await?
    }

    pub async fn grp_shot(&self, instance: u32, group: GroupId, frame: Frame)
                          -> Result<Placement, CanonicalError> {
        self.request(|reply| Command::GrpShot{instance, group, frame, reply}).await?
    }

    pub async fn submit(&self, submission: Submission) -> Result<Placement, CanonicalError> {
        self.request(|reply| Command::Submit{submission, reply}).await?
    }

    pub async fn load_setfile(&self, instance: u32, blob: Bytes)
                              -> Result<usize, CanonicalError> {
        self.request(|reply| Command::LoadSetfile{instance, blob, reply}).await?
    }

    pub async fn apply_setfile(&self, instance: u32, scenario: u32)
                               -> Result<usize, CanonicalError> {
        self.request(|reply| Command::ApplySetfile{instance, scenario, reply}).await?
    }

    pub async fn delete_setfile(&self, instance: u32) -> Result<(), CanonicalError> {
        self.request(|reply| Command::DeleteSetfile{instance, reply}).await?
    }

    pub async fn sensor_start(&self, instance: u32) -> Result<(), CanonicalError> {
        self.request(|reply| Command::SensorStart{instance, reply}).await?
    }

    /// Waits up to the configured stop timeout for every unit of `instance`
    /// to reach V-blank, then stops the sensor. Units still in V-valid are
    /// logged and stopped regardless.
    pub async fn sensor_stop(&self, instance: u32) -> Result<(), CanonicalError> {
        let vstates = self.request(|reply| Command::VStates{instance, reply}).await?;
        let deadline = tokio::time::Instant::now() + self.stop_timeout;
        for (hw, mut rx) in vstates {
            let wait = tokio::time::timeout_at(deadline, rx.wait_for(|v| *v == VState::Blank));
            match wait.await {
                Ok(Ok(_)) => (),
                Ok(Err(_)) => debug!("[{}] {} gone while stopping", instance, hw),
                Err(_) => warn!("[{}] {} not in V-blank after {:?}, stopping anyway",
                                instance, hw, self.stop_timeout),
            }
        }
        self.request(|reply| Command::SensorStop{instance, reply}).await?
    }

    pub async fn process_start(&self, instance: u32, group: GroupId)
                               -> Result<(), CanonicalError> {
        self.request(|reply| Command::ProcessStart{instance, group, reply}).await?
    }

    /// Returns the number of frames flushed.
    pub async fn process_stop(&self, instance: u32, group: GroupId)
                              -> Result<usize, CanonicalError> {
        self.request(|reply| Command::ProcessStop{instance, group, reply}).await?
    }

    /// Waits until `hw` reports `state`.
    pub async fn wait_vstate(&self, hw: HwId, state: VState, timeout: Duration)
                             -> Result<(), CanonicalError> {
        let mut rx = self.request(|reply| Command::SubscribeVState{hw, reply}).await?
            .ok_or_else(|| not_found_error(format!("{} is not probed", hw).as_str()))?;
        let result = match tokio::time::timeout(timeout, rx.wait_for(|v| *v == state)).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(_)) => Err(unavailable_error("engine stopped")),
            Err(_) => Err(timeout_error(
                format!("{} not {:?} after {:?}", hw, state, timeout).as_str())),
        };
        result
    }

    pub async fn stats(&self) -> Result<HwStats, CanonicalError> {
        self.request(|reply| Command::Stats{reply}).await
    }

    /// Logs register windows, clock gates and per-unit frame counts.
    pub async fn dump(&self) -> Result<(), CanonicalError> {
        self.request(|reply| Command::Dump{reply}).await
    }

    /// Resolves every outstanding frame and stops the engine, handing the
    /// orchestrator back.
    pub async fn shutdown(self) -> Result<Orchestrator, CanonicalError> {
        self.request(|reply| Command::Shutdown{reply}).await
    }
}
