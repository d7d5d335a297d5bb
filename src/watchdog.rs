// Copyright (c) 2025 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

// Per-unit shot watchdog. Expiry is delivered as a message to the engine's
// consumer task rather than acted on in the timer itself. Each arm/cancel
// bumps a generation, so an expiry already in flight when the watchdog was
// cancelled is recognised as stale and dropped.

use std::time::Duration;

use canonical_error::CanonicalError;
use log::debug;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::error::resource_error;
use crate::frame::FrameKey;
use crate::ids::HwId;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ShotTimeout {
    pub hw: HwId,
    pub key: FrameKey,
    pub generation: u64,
}

struct Armed {
    key: FrameKey,
    timer: JoinHandle<()>,
}

#[derive(Default)]
pub struct ShotWatchdog {
    generation: u64,
    armed: Option<Armed>,
}

impl ShotWatchdog {
    pub fn new() -> Self {
        ShotWatchdog::default()
    }

    /// The timer runs on the calling tokio runtime. Outside of one the
    /// watchdog stays disarmed and a resource error is returned.
    pub fn arm(&mut self, hw: HwId, key: FrameKey, timeout: Duration,
               expired: &mpsc::UnboundedSender<ShotTimeout>)
               -> Result<(), CanonicalError> {
        self.cancel();
        let runtime = Handle::try_current().map_err(|e| resource_error(
            format!("no runtime for {} watchdog: {}", hw.name(), e).as_str()))?;
        let generation = self.generation;
        let expired = expired.clone();
        let timer = runtime.spawn(async move {
            tokio::time::sleep(timeout).await;
            // Engine gone means nothing left to time out.
            let _ = expired.send(ShotTimeout{hw, key, generation});
        });
        self.armed = Some(Armed{key, timer});
        Ok(())
    }

    /// Returns the frame the watchdog was guarding, if any.
    pub fn cancel(&mut self) -> Option<FrameKey> {
        self.generation += 1;
        let armed = self.armed.take()?;
        armed.timer.abort();
        debug!("watchdog for {} cancelled", armed.key);
        Some(armed.key)
    }

    pub fn armed_for(&self) -> Option<FrameKey> {
        self.armed.as_ref().map(|a| a.key)
    }

    /// True when `timeout` is the live expiry of the current arming.
    pub fn accepts(&self, timeout: &ShotTimeout) -> bool {
        self.armed_for() == Some(timeout.key) && self.generation == timeout.generation
    }

    /// Marks the watchdog as fired.
    pub fn expire(&mut self) {
        self.armed = None;
        self.generation += 1;
    }
}

impl Drop for ShotWatchdog {
    fn drop(&mut self) {
        if let Some(armed) = self.armed.take() {
            armed.timer.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ErrorKind, error_kind};

    fn key(fcount: u32) -> FrameKey {
        FrameKey{instance: 0, fcount}
    }

    #[tokio::test(start_paused = true)]
    async fn fires_after_timeout() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut watchdog = ShotWatchdog::new();
        watchdog.arm(HwId::Isp0, key(4), Duration::from_millis(3000), &tx).unwrap();
        let timeout = rx.recv().await.unwrap();
        assert_eq!(timeout.hw, HwId::Isp0);
        assert_eq!(timeout.key, key(4));
        assert!(watchdog.accepts(&timeout));
        watchdog.expire();
        assert!(!watchdog.accepts(&timeout));
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_watchdog_never_fires() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut watchdog = ShotWatchdog::new();
        watchdog.arm(HwId::Isp0, key(1), Duration::from_millis(10), &tx).unwrap();
        assert_eq!(watchdog.cancel(), Some(key(1)));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn rearm_makes_earlier_expiry_stale() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut watchdog = ShotWatchdog::new();
        watchdog.arm(HwId::Taa0, key(1), Duration::from_millis(10), &tx).unwrap();
        // First arming runs at generation 1.
        let stale = ShotTimeout{hw: HwId::Taa0, key: key(1), generation: 1};
        assert!(watchdog.accepts(&stale));
        watchdog.arm(HwId::Taa0, key(1), Duration::from_millis(10), &tx).unwrap();
        assert!(!watchdog.accepts(&stale));
        let live = rx.recv().await.unwrap();
        assert!(watchdog.accepts(&live));
    }

    #[test]
    fn arming_outside_a_runtime_is_a_resource_error() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut watchdog = ShotWatchdog::new();
        let err = watchdog.arm(HwId::Isp0, key(1), Duration::from_millis(10), &tx)
            .unwrap_err();
        assert_eq!(error_kind(&err), ErrorKind::Resource);
        assert_eq!(watchdog.armed_for(), None);
    }
}
