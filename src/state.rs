//! Downstream view of the ventilation unit, fed from decoded telegrams.
//!
//! This is what a host automation platform would hold for its fan entity;
//! the `listen` command uses it to keep a current picture and to turn the
//! fault bit into edge-triggered notifications: one warning when a fault
//! appears, one notice when it clears, nothing in between.

use std::sync::Mutex;

use tracing::{info, warn};

use crate::payloads::Payload;
use crate::presets::Preset;

#[derive(Clone, Copy, Debug, Default, PartialEq, serde::Serialize)]
pub struct StateSnapshot {
    pub preset: Option<Preset>,
    pub co2_ppm: Option<u16>,
    pub relative_humidity: Option<u8>,
    pub vent_demand: Option<u8>,
    pub has_fault: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FaultTransition {
    Unchanged,
    Raised,
    Cleared,
}

#[derive(Default)]
struct Inner {
    snapshot: StateSnapshot,
    fault_notified: bool,
}

#[derive(Default)]
pub struct FanStateTracker {
    inner: Mutex<Inner>,
}

impl FanStateTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> StateSnapshot {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).snapshot
    }

    /// Fold one decoded payload into the tracked state.
    ///
    /// Returns the fault edge for fan-state reports so callers can surface
    /// notifications; repeated reports with the same fault level return
    /// [`FaultTransition::Unchanged`].
    pub fn record(&self, payload: &Payload) -> FaultTransition {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        match payload {
            Payload::Co2Level { ppm } => {
                inner.snapshot.co2_ppm = *ppm;
                FaultTransition::Unchanged
            }
            Payload::RelativeHumidity { percent } => {
                inner.snapshot.relative_humidity = *percent;
                FaultTransition::Unchanged
            }
            Payload::VentDemand { percent } => {
                inner.snapshot.vent_demand = *percent;
                FaultTransition::Unchanged
            }
            Payload::FanState { preset, has_fault } => {
                inner.snapshot.preset = *preset;
                inner.snapshot.has_fault = *has_fault;
                match (*has_fault, inner.fault_notified) {
                    (true, false) => {
                        inner.fault_notified = true;
                        warn!("ventilation unit reported a fault");
                        FaultTransition::Raised
                    }
                    (false, true) => {
                        inner.fault_notified = false;
                        info!("ventilation unit fault cleared");
                        FaultTransition::Cleared
                    }
                    _ => FaultTransition::Unchanged,
                }
            }
            Payload::FanMode { .. } | Payload::DeviceInfo { .. } => FaultTransition::Unchanged,
        }
    }
}
