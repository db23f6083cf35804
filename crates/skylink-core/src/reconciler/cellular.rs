// ── Cellular reconciler ──
//
// The cellular modem extends the control link over a mobile network.
// The device reports SIM presence, link availability, an activation flag,
// and the APN configuration (auto-selected or manual). Not every airframe
// carries a modem: an explicit "unsupported" push degrades the whole
// feature to a permanently non-editable entry.

use std::sync::{Arc, Mutex};

use arc_swap::ArcSwapOption;
use serde::{Deserialize, Serialize};
use strum::Display;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use skylink_api::peripheral::{CellularFrame, PushFrame};
use skylink_api::{PeripheralKind, PushUpdate, SettingWrite};

use crate::command::{self, CommandGateway};
use crate::config::CoreConfig;
use crate::connection::ActiveDevice;
use crate::error::ValidationError;
use crate::reconciler::{Observed, Reconciler, SupportState};
use crate::store::StateStore;
use crate::stream::StateStream;
use crate::subscription::{self, SubscriptionHandle};
use crate::sync::recover;

/// Reported state of the cellular link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, Serialize, Deserialize)]
pub enum CellularAvailability {
    Off,
    Available,
    NotRepresentable(u32),
}

impl CellularAvailability {
    pub(crate) fn from_code(code: u32) -> Self {
        match code {
            0 => Self::Off,
            1 => Self::Available,
            other => Self::NotRepresentable(other),
        }
    }
}

/// How the APN is chosen.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ApnSelection {
    Auto,
    Manual { url: String },
}

/// Immutable cellular state as presented to consumers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CellularSnapshot {
    pub support: SupportState,
    pub sim_inserted: bool,
    pub availability: CellularAvailability,
    pub activated: bool,
    pub apn: ApnSelection,
    pub updating: bool,
}

impl CellularSnapshot {
    pub fn preset() -> Self {
        Self {
            support: SupportState::Unknown,
            sim_inserted: false,
            availability: CellularAvailability::Off,
            activated: true,
            apn: ApnSelection::Auto,
            updating: false,
        }
    }

    pub fn is_editable(&self) -> bool {
        self.support != SupportState::Unsupported
    }
}

/// User intents against the cellular modem.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum CellularIntent {
    SetActivation(bool),
    SelectApnAuto,
    SelectApnManual {
        url: String,
        username: String,
        password: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum SettingKey {
    Activation,
    Apn,
}

#[derive(Debug, Clone, PartialEq)]
enum Target {
    Activation(bool),
    Apn { manual: bool, url: Option<String> },
}

/// Per-feature composition unit for the cellular modem.
#[derive(Clone)]
pub struct CellularReconciler {
    inner: Arc<Inner>,
}

struct Inner {
    store: StateStore<CellularSnapshot>,
    gateway: CommandGateway<SettingKey, Target>,
    observed: Mutex<Observed<CellularFrame>>,
    device: ArcSwapOption<ActiveDevice>,
    subs: Mutex<Vec<SubscriptionHandle>>,
    cancel: CancellationToken,
}

impl CellularReconciler {
    pub fn new(config: &CoreConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                store: StateStore::new(CellularSnapshot::preset()),
                gateway: CommandGateway::new(config.command_timeout),
                observed: Mutex::new(Observed::default()),
                device: ArcSwapOption::const_empty(),
                subs: Mutex::new(Vec::new()),
                cancel: CancellationToken::new(),
            }),
        }
    }

    pub fn snapshot(&self) -> CellularSnapshot {
        self.inner.store.get()
    }

    pub fn observe(&self) -> tokio::sync::watch::Receiver<CellularSnapshot> {
        self.inner.store.observe()
    }

    pub fn stream(&self) -> StateStream<CellularSnapshot> {
        self.inner.store.stream()
    }

    /// Validate and issue an intent.
    pub fn apply(&self, intent: CellularIntent) -> Result<(), ValidationError> {
        let inner = &self.inner;
        let Some(device) = inner.device.load_full() else {
            return Err(ValidationError::Disconnected);
        };
        let snap = inner.store.get();
        if !snap.is_editable() {
            return Err(ValidationError::NotEditable { setting: "cellular" });
        }

        match intent {
            CellularIntent::SetActivation(on) => {
                let seq = inner.gateway.issue(SettingKey::Activation, Target::Activation(on));
                inner.write(&device, SettingWrite::CellularActivation(on));
                self.schedule_expiry(SettingKey::Activation, seq);
            }
            CellularIntent::SelectApnAuto => {
                let seq = inner.gateway.issue(
                    SettingKey::Apn,
                    Target::Apn {
                        manual: false,
                        url: None,
                    },
                );
                inner.write(&device, SettingWrite::CellularApnAuto);
                self.schedule_expiry(SettingKey::Apn, seq);
            }
            CellularIntent::SelectApnManual {
                url,
                username,
                password,
            } => {
                if url.trim().is_empty() {
                    return Err(ValidationError::Invalid {
                        setting: "cellular apn",
                        reason: "manual selection requires a non-empty APN url".into(),
                    });
                }
                let seq = inner.gateway.issue(
                    SettingKey::Apn,
                    Target::Apn {
                        manual: true,
                        url: Some(url.clone()),
                    },
                );
                inner.write(
                    &device,
                    SettingWrite::CellularApnManual {
                        url,
                        username,
                        password,
                    },
                );
                self.schedule_expiry(SettingKey::Apn, seq);
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
                warn!(?key, sequence, "cellular command expired without device echo");
                inner.republish();
            }
        });
    }
}

impl Inner {
    fn derive(&self) -> CellularSnapshot {
        let observed = recover(self.observed.lock());
        let mut snap = match &observed.peripheral.value {
            Some(frame) => CellularSnapshot {
                support: observed.support,
                sim_inserted: frame.sim_inserted,
                availability: CellularAvailability::from_code(frame.availability_code),
                activated: frame.activated,
                apn: if frame.apn_manual {
                    ApnSelection::Manual {
                        url: frame.apn_url.clone().unwrap_or_default(),
                    }
                } else {
                    ApnSelection::Auto
                },
                updating: false,
            },
            None => {
                let mut snap = CellularSnapshot::preset();
                snap.support = observed.support;
                snap
            }
        };
        drop(observed);

        if let Some(Target::Activation(on)) = self.gateway.pending_target(&SettingKey::Activation) {
            snap.activated = on;
        }
        if let Some(Target::Apn { manual, url }) = self.gateway.pending_target(&SettingKey::Apn) {
            snap.apn = if manual {
                ApnSelection::Manual {
                    url: url.unwrap_or_default(),
                }
            } else {
                ApnSelection::Auto
            };
        }
        snap.updating = self.gateway.any_updating();
        snap
    }

    fn republish(&self) {
        self.store.publish(self.derive());
    }

    fn write(&self, device: &ActiveDevice, write: SettingWrite) {
        if let Err(error) = device.link.write(write.clone()) {
            warn!(%error, ?write, "cellular write failed; command will expire");
        }
    }

    fn on_update(&self, generation: u64, update: PushUpdate) {
        match update {
            PushUpdate::Value(PushFrame::Cellular(frame)) => {
                if let Some(seq) = self
                    .gateway
                    .settle_matching(&SettingKey::Activation, &Target::Activation(frame.activated))
                {
                    debug!(sequence = seq, "cellular activation echo settled");
                }
                let apn = Target::Apn {
                    manual: frame.apn_manual,
                    url: frame.apn_url.clone(),
                };
                if let Some(seq) = self.gateway.settle_matching(&SettingKey::Apn, &apn) {
                    debug!(sequence = seq, "cellular apn echo settled");
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
                warn!(peripheral = %other.peripheral(), "unexpected frame on cellular channel");
            }
        }
    }

    fn cancel_subscriptions(&self) {
        for handle in recover(self.subs.lock()).drain(..) {
            handle.cancel();
        }
    }
}

impl Reconciler for CellularReconciler {
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
            PeripheralKind::Cellular,
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
            debug!("dropped in-flight cellular commands on disconnect");
        }
        inner.republish();
    }

    fn shutdown(&self) {
        self.detach();
        self.inner.cancel.cancel();
    }
}
