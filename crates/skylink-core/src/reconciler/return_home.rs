// ── Return-home reconciler ──
//
// Return-home brings the airframe back when the link drops or the pilot
// asks for it. The device reports the preferred return target, a bounded
// minimum return altitude, and the behavior at the end of the flight
// back. Writes are delta-only: an intent that matches the authoritative
// value is accepted without touching the device (altitude compared at
// metre resolution, which is what the firmware stores).

use std::sync::{Arc, Mutex};

use arc_swap::ArcSwapOption;
use serde::{Deserialize, Serialize};
use strum::Display;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use skylink_api::peripheral::{PushFrame, ReturnHomeFrame};
use skylink_api::{PeripheralKind, PushUpdate, SettingWrite};

use crate::command::{self, CommandGateway};
use crate::config::CoreConfig;
use crate::connection::ActiveDevice;
use crate::error::ValidationError;
use crate::reconciler::{Observed, Reconciler, SupportState, check_range};
use crate::store::StateStore;
use crate::stream::StateStream;
use crate::subscription::{self, SubscriptionHandle};
use crate::sync::recover;

mod preset {
    pub const DEFAULT_MIN_ALTITUDE: f64 = 30.0;
    pub const MIN_ALTITUDE_FLOOR: f64 = 20.0;
    pub const MIN_ALTITUDE_CEILING: f64 = 100.0;
}

/// Where the airframe returns to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, Serialize, Deserialize)]
pub enum RthTarget {
    TakeOffPosition,
    PilotPosition,
    NotRepresentable(u32),
}

impl RthTarget {
    pub(crate) fn from_code(code: u32) -> Self {
        match code {
            0 => Self::TakeOffPosition,
            1 => Self::PilotPosition,
            other => Self::NotRepresentable(other),
        }
    }

    pub(crate) fn code(self) -> u32 {
        match self {
            Self::TakeOffPosition => 0,
            Self::PilotPosition => 1,
            Self::NotRepresentable(code) => code,
        }
    }

    pub fn is_representable(self) -> bool {
        !matches!(self, Self::NotRepresentable(_))
    }
}

/// What the airframe does once it arrives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, Serialize, Deserialize)]
pub enum RthEndingBehavior {
    Hovering,
    Landing,
    NotRepresentable(u32),
}

impl RthEndingBehavior {
    pub(crate) fn from_code(code: u32) -> Self {
        match code {
            0 => Self::Hovering,
            1 => Self::Landing,
            other => Self::NotRepresentable(other),
        }
    }

    pub(crate) fn code(self) -> u32 {
        match self {
            Self::Hovering => 0,
            Self::Landing => 1,
            Self::NotRepresentable(code) => code,
        }
    }

    pub fn is_representable(self) -> bool {
        !matches!(self, Self::NotRepresentable(_))
    }
}

/// Immutable return-home state as presented to consumers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReturnHomeSnapshot {
    pub support: SupportState,
    pub target: RthTarget,
    pub min_altitude: f64,
    pub min_altitude_floor: f64,
    pub min_altitude_ceiling: f64,
    pub ending_behavior: RthEndingBehavior,
    pub updating: bool,
}

impl ReturnHomeSnapshot {
    pub fn preset() -> Self {
        Self {
            support: SupportState::Unknown,
            target: RthTarget::TakeOffPosition,
            min_altitude: preset::DEFAULT_MIN_ALTITUDE,
            min_altitude_floor: preset::MIN_ALTITUDE_FLOOR,
            min_altitude_ceiling: preset::MIN_ALTITUDE_CEILING,
            ending_behavior: RthEndingBehavior::Hovering,
            updating: false,
        }
    }

    pub fn is_editable(&self) -> bool {
        self.support != SupportState::Unsupported
    }
}

/// User intents against return-home settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ReturnHomeIntent {
    SetTarget(RthTarget),
    SetMinAltitude(f64),
    SetEndingBehavior(RthEndingBehavior),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum SettingKey {
    Target,
    MinAltitude,
    EndingBehavior,
}

#[derive(Debug, Clone, PartialEq)]
enum Target {
    Code(u32),
    Metres(f64),
}

/// Per-feature composition unit for return-home settings.
#[derive(Clone)]
pub struct ReturnHomeReconciler {
    inner: Arc<Inner>,
}

struct Inner {
    store: StateStore<ReturnHomeSnapshot>,
    gateway: CommandGateway<SettingKey, Target>,
    observed: Mutex<Observed<ReturnHomeFrame>>,
    device: ArcSwapOption<ActiveDevice>,
    subs: Mutex<Vec<SubscriptionHandle>>,
    cancel: CancellationToken,
}

impl ReturnHomeReconciler {
    pub fn new(config: &CoreConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                store: StateStore::new(ReturnHomeSnapshot::preset()),
                gateway: CommandGateway::new(config.command_timeout),
                observed: Mutex::new(Observed::default()),
                device: ArcSwapOption::const_empty(),
                subs: Mutex::new(Vec::new()),
                cancel: CancellationToken::new(),
            }),
        }
    }

    pub fn snapshot(&self) -> ReturnHomeSnapshot {
        self.inner.store.get()
    }

    pub fn observe(&self) -> tokio::sync::watch::Receiver<ReturnHomeSnapshot> {
        self.inner.store.observe()
    }

    pub fn stream(&self) -> StateStream<ReturnHomeSnapshot> {
        self.inner.store.stream()
    }

    /// Validate and issue an intent. Intents matching the authoritative
    /// value are accepted without a device write.
    pub fn apply(&self, intent: ReturnHomeIntent) -> Result<(), ValidationError> {
        let inner = &self.inner;
        let Some(device) = inner.device.load_full() else {
            return Err(ValidationError::Disconnected);
        };
        let snap = inner.store.get();
        if !snap.is_editable() {
            return Err(ValidationError::NotEditable {
                setting: "return home",
            });
        }

        match intent {
            ReturnHomeIntent::SetTarget(target) => {
                if !target.is_representable() {
                    return Err(ValidationError::Invalid {
                        setting: "return home target",
                        reason: "cannot request a target this build does not know".into(),
                    });
                }
                if snap.target == target && !inner.gateway.is_updating(&SettingKey::Target) {
                    return Ok(());
                }
                let seq = inner
                    .gateway
                    .issue(SettingKey::Target, Target::Code(target.code()));
                inner.write(&device, SettingWrite::ReturnHomeTarget(target.code()));
                self.schedule_expiry(SettingKey::Target, seq);
            }
            ReturnHomeIntent::SetMinAltitude(altitude) => {
                check_range(
                    "return home minimum altitude",
                    altitude,
                    snap.min_altitude_floor,
                    snap.min_altitude_ceiling,
                )?;
                // Firmware stores whole metres; a sub-metre delta is noise.
                if snap.min_altitude.round() == altitude.round()
                    && !inner.gateway.is_updating(&SettingKey::MinAltitude)
                {
                    return Ok(());
                }
                let seq = inner
                    .gateway
                    .issue(SettingKey::MinAltitude, Target::Metres(altitude));
                inner.write(&device, SettingWrite::ReturnHomeMinAltitude(altitude));
                self.schedule_expiry(SettingKey::MinAltitude, seq);
            }
            ReturnHomeIntent::SetEndingBehavior(behavior) => {
                if !behavior.is_representable() {
                    return Err(ValidationError::Invalid {
                        setting: "return home ending behavior",
                        reason: "cannot request a behavior this build does not know".into(),
                    });
                }
                if snap.ending_behavior == behavior
                    && !inner.gateway.is_updating(&SettingKey::EndingBehavior)
                {
                    return Ok(());
                }
                let seq = inner
                    .gateway
                    .issue(SettingKey::EndingBehavior, Target::Code(behavior.code()));
                inner.write(&device, SettingWrite::ReturnHomeEndingBehavior(behavior.code()));
                self.schedule_expiry(SettingKey::EndingBehavior, seq);
            }
        }

        inner.republish();
        Ok(())
    }

    fn schedule_expiry(&self, key: SettingKey, sequence: u64) {
        let weak = Arc::downgrade(&self.inner);
        let timeout = self.inner.gateway.command_timeout();
        command::schedule_expiry(timeout, self.inner.cancel.child_token(), move || {
            let Some(inner) = weak.upgrade() else { return };
            if inner.gateway.expire(&key, sequence) {
                warn!(?key, sequence, "return-home command expired without device echo");
                inner.republish();
            }
        });
    }
}

impl Inner {
    fn derive(&self) -> ReturnHomeSnapshot {
        let observed = recover(self.observed.lock());
        let mut snap = match &observed.peripheral.value {
            Some(frame) => ReturnHomeSnapshot {
                support: observed.support,
                target: RthTarget::from_code(frame.target_code),
                min_altitude: frame.min_altitude.value,
                min_altitude_floor: frame.min_altitude.min,
                min_altitude_ceiling: frame.min_altitude.max,
                ending_behavior: RthEndingBehavior::from_code(frame.ending_behavior_code),
                updating: false,
            },
            None => {
                let mut snap = ReturnHomeSnapshot::preset();
                snap.support = observed.support;
                snap
            }
        };
        drop(observed);

        if let Some(Target::Code(code)) = self.gateway.pending_target(&SettingKey::Target) {
            snap.target = RthTarget::from_code(code);
        }
        if let Some(Target::Metres(altitude)) =
            self.gateway.pending_target(&SettingKey::MinAltitude)
        {
            snap.min_altitude = altitude;
        }
        if let Some(Target::Code(code)) = self.gateway.pending_target(&SettingKey::EndingBehavior) {
            snap.ending_behavior = RthEndingBehavior::from_code(code);
        }
        snap.updating = self.gateway.any_updating();
        snap
    }

    fn republish(&self) {
        self.store.publish(self.derive());
    }

    fn write(&self, device: &ActiveDevice, write: SettingWrite) {
        if let Err(error) = device.link.write(write.clone()) {
            warn!(%error, ?write, "return-home write failed; command will expire");
        }
    }

    fn on_update(&self, generation: u64, update: PushUpdate) {
        match update {
            PushUpdate::Value(PushFrame::ReturnHome(frame)) => {
                if let Some(seq) = self
                    .gateway
                    .settle_matching(&SettingKey::Target, &Target::Code(frame.target_code))
                {
                    debug!(sequence = seq, "return-home target echo settled");
                }
                if let Some(seq) = self.gateway.settle_matching(
                    &SettingKey::MinAltitude,
                    &Target::Metres(frame.min_altitude.value),
                ) {
                    debug!(sequence = seq, "return-home altitude echo settled");
                }
                if let Some(seq) = self.gateway.settle_matching(
                    &SettingKey::EndingBehavior,
                    &Target::Code(frame.ending_behavior_code),
                ) {
                    debug!(sequence = seq, "return-home ending behavior echo settled");
                }

                recover(self.observed.lock()).record_value(frame, generation);
                self.republish();
            }
            PushUpdate::Unsupported | PushUpdate::Absent => {
                recover(self.observed.lock()).record_unsupported();
                self.gateway.clear_all();
                self.republish();
            }
            PushUpdate::Value(other) => {
                warn!(peripheral = %other.peripheral(), "unexpected frame on return-home channel");
            }
        }
    }

    fn cancel_subscriptions(&self) {
        for handle in recover(self.subs.lock()).drain(..) {
            handle.cancel();
        }
    }
}

impl Reconciler for ReturnHomeReconciler {
    fn attach(&self, device: &Arc<ActiveDevice>) {
        let inner = &self.inner;
        if inner.device.load_full().map(|d| d.generation) == Some(device.generation) {
            return;
        }

        inner.cancel_subscriptions();
        inner.gateway.clear_all();
        inner.device.store(Some(Arc::clone(device)));

        let generation = device.generation;
        let weak = Arc::downgrade(inner);
        let handle = subscription::subscribe(
            device.link.as_ref(),
            PeripheralKind::ReturnHome,
            generation,
            move |update| {
                if let Some(inner) = weak.upgrade() {
                    inner.on_update(generation, update);
                }
            },
        );
        recover(inner.subs.lock()).push(handle);
        inner.republish();
    }

    fn detach(&self) {
        let inner = &self.inner;
        inner.cancel_subscriptions();
        inner.device.store(None);
        if inner.gateway.clear_all() > 0 {
            debug!("dropped in-flight return-home commands on disconnect");
        }
        inner.republish();
    }

    fn shutdown(&self) {
        self.detach();
        self.inner.cancel.cancel();
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn codes_degrade_to_not_representable() {
        assert_eq!(RthTarget::from_code(0), RthTarget::TakeOffPosition);
        assert_eq!(RthTarget::from_code(1), RthTarget::PilotPosition);
        assert_eq!(RthTarget::from_code(4), RthTarget::NotRepresentable(4));
        assert_eq!(RthEndingBehavior::from_code(1), RthEndingBehavior::Landing);
        assert_eq!(
            RthEndingBehavior::from_code(9),
            RthEndingBehavior::NotRepresentable(9)
        );
    }

    #[test]
    fn unrepresentable_target_is_rejected_before_connectivity() {
        let reconciler = ReturnHomeReconciler::new(&CoreConfig::default());
        // Disconnected wins over parameter checks -- no device, no bounds.
        assert_eq!(
            reconciler.apply(ReturnHomeIntent::SetTarget(RthTarget::NotRepresentable(4))),
            Err(ValidationError::Disconnected)
        );
    }

    #[test]
    fn preset_is_within_its_own_bounds() {
        let snap = ReturnHomeSnapshot::preset();
        assert!(snap.min_altitude >= snap.min_altitude_floor);
        assert!(snap.min_altitude <= snap.min_altitude_ceiling);
    }
}
