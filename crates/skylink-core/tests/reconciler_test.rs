// End-to-end reconciliation scenarios against the simulated device:
// connection lifecycle, write ordering, sequence guarding, expiry, and
// teardown safety.

#![allow(clippy::unwrap_used)]

use std::sync::Arc;
use std::time::Duration;

use pretty_assertions::assert_eq;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use skylink_api::peripheral::{
    BoundedValue, CellularFrame, GeofenceFrame, PushFrame, ReturnHomeFrame,
};
use skylink_api::{PeripheralKind, SettingWrite, SimDevice};
use skylink_core::{
    ActiveDevice, CellularIntent, CellularReconciler, ConnectionRegistry, CoreConfig,
    GeofenceIntent, GeofenceMode, GeofenceReconciler, Reconciler, ReturnHomeIntent,
    ReturnHomeReconciler, RthEndingBehavior, RthTarget, SupportState, ValidationError,
    spawn_binding,
};

fn geofence_frame(mode_code: u32, altitude: f64, distance: f64) -> PushFrame {
    PushFrame::Geofence(GeofenceFrame {
        mode_code,
        max_altitude: BoundedValue::new(altitude, 10.0, 150.0),
        max_distance: BoundedValue::new(distance, 100.0, 4000.0),
    })
}

fn cellular_frame(activated: bool) -> PushFrame {
    PushFrame::Cellular(CellularFrame {
        sim_inserted: true,
        activated,
        availability_code: 1,
        apn_manual: false,
        apn_url: None,
    })
}

fn active_device(sim: &SimDevice, generation: u64) -> Arc<ActiveDevice> {
    sim.set_generation(generation);
    Arc::new(ActiveDevice {
        handle: sim.handle(),
        link: Arc::new(sim.clone()),
        generation,
    })
}

/// Wait until the observed snapshot satisfies `pred`, or fail after a
/// second.
async fn wait_until<S: Clone>(rx: &mut watch::Receiver<S>, pred: impl Fn(&S) -> bool) -> S {
    tokio::time::timeout(Duration::from_secs(1), async {
        loop {
            {
                let snap = rx.borrow_and_update().clone();
                if pred(&snap) {
                    return snap;
                }
            }
            rx.changed().await.expect("store dropped");
        }
    })
    .await
    .expect("snapshot condition not reached in time")
}

async fn settle() {
    tokio::time::sleep(Duration::from_millis(50)).await;
}

// ── Geofence scenarios ───────────────────────────────────────────────

#[tokio::test]
async fn activation_writes_altitude_before_mode() {
    let sim = SimDevice::new("SIM-000001", "sim-quad");
    sim.set_auto_echo(true);
    let reconciler = GeofenceReconciler::new(&CoreConfig::default());
    reconciler.attach(&active_device(&sim, 1));

    sim.push_frame(geofence_frame(0, 100.0, 300.0));
    let mut rx = reconciler.observe();
    wait_until(&mut rx, |s| s.support == SupportState::Supported).await;
    sim.take_writes();

    reconciler
        .apply(GeofenceIntent::Activate {
            altitude: 120.0,
            distance: 100.0,
        })
        .unwrap();

    // Optimistic snapshot is visible immediately.
    let optimistic = reconciler.snapshot();
    assert!(optimistic.updating);
    assert_eq!(optimistic.altitude, 120.0);
    assert_eq!(optimistic.mode, GeofenceMode::Cylinder);

    let settled = wait_until(&mut rx, |s| {
        !s.updating && s.mode == GeofenceMode::Cylinder && s.altitude == 120.0
    })
    .await;
    assert_eq!(settled.distance, 100.0);

    // Altitude bound is written before the mode flips.
    assert_eq!(
        sim.writes(),
        vec![
            SettingWrite::GeofenceMaxAltitude(120.0),
            SettingWrite::GeofenceMaxDistance(100.0),
            SettingWrite::GeofenceMode(1),
        ]
    );
}

#[tokio::test]
async fn deactivation_writes_mode_before_altitude() {
    let sim = SimDevice::new("SIM-000001", "sim-quad");
    sim.set_auto_echo(true);
    let reconciler = GeofenceReconciler::new(&CoreConfig::default());
    reconciler.attach(&active_device(&sim, 1));

    sim.push_frame(geofence_frame(1, 120.0, 100.0));
    let mut rx = reconciler.observe();
    wait_until(&mut rx, |s| s.mode == GeofenceMode::Cylinder).await;
    sim.take_writes();

    reconciler.apply(GeofenceIntent::Deactivate).unwrap();
    wait_until(&mut rx, |s| !s.updating && s.mode == GeofenceMode::Altitude).await;

    // Mode flip comes first; the ceiling release follows.
    assert_eq!(
        sim.writes(),
        vec![
            SettingWrite::GeofenceMode(0),
            SettingWrite::GeofenceMaxAltitude(150.0),
        ]
    );
}

#[tokio::test]
async fn stale_echo_does_not_clear_newer_command() {
    let sim = SimDevice::new("SIM-000001", "sim-quad");
    let reconciler = GeofenceReconciler::new(&CoreConfig::default());
    reconciler.attach(&active_device(&sim, 1));

    sim.push_frame(geofence_frame(0, 100.0, 300.0));
    let mut rx = reconciler.observe();
    wait_until(&mut rx, |s| s.support == SupportState::Supported).await;

    // Command A, then command B for the same setting.
    reconciler.apply(GeofenceIntent::SetAltitude(120.0)).unwrap();
    reconciler.apply(GeofenceIntent::SetAltitude(130.0)).unwrap();

    // A's echo arrives after B was issued: it must not settle B.
    sim.push_frame(geofence_frame(0, 120.0, 300.0));
    settle().await;
    let snap = reconciler.snapshot();
    assert!(snap.updating);
    assert_eq!(snap.altitude, 130.0);

    // B's own echo settles it.
    sim.push_frame(geofence_frame(0, 130.0, 300.0));
    let settled = wait_until(&mut rx, |s| !s.updating).await;
    assert_eq!(settled.altitude, 130.0);
}

#[tokio::test]
async fn disconnect_mid_command_reverts_to_authoritative_value() {
    let sim = SimDevice::new("SIM-000001", "sim-quad");
    let reconciler = GeofenceReconciler::new(&CoreConfig::default());
    reconciler.attach(&active_device(&sim, 1));

    sim.push_frame(geofence_frame(0, 100.0, 300.0));
    let mut rx = reconciler.observe();
    wait_until(&mut rx, |s| s.support == SupportState::Supported).await;

    reconciler.apply(GeofenceIntent::SetAltitude(50.0)).unwrap();
    assert!(reconciler.snapshot().updating);
    assert_eq!(reconciler.snapshot().altitude, 50.0);

    // No echo ever arrives -- the device is gone.
    reconciler.detach();
    let snap = reconciler.snapshot();
    assert!(!snap.updating);
    assert_eq!(snap.altitude, 100.0);
}

#[tokio::test(start_paused = true)]
async fn command_expires_and_reverts_without_echo() {
    let sim = SimDevice::new("SIM-000001", "sim-quad");
    let config = CoreConfig::default().with_command_timeout(Duration::from_secs(2));
    let reconciler = GeofenceReconciler::new(&config);
    reconciler.attach(&active_device(&sim, 1));

    sim.push_frame(geofence_frame(0, 100.0, 300.0));
    let mut rx = reconciler.observe();
    wait_until(&mut rx, |s| s.support == SupportState::Supported).await;

    reconciler.apply(GeofenceIntent::SetAltitude(120.0)).unwrap();
    assert!(reconciler.snapshot().updating);

    // Jump past the configured timeout; no echo ever arrives.
    tokio::time::sleep(Duration::from_secs(3)).await;
    tokio::task::yield_now().await;

    let snap = reconciler.snapshot();
    assert!(!snap.updating);
    assert_eq!(snap.altitude, 100.0);
}

#[tokio::test]
async fn teardown_blocks_late_callbacks() {
    let sim = SimDevice::new("SIM-000001", "sim-quad");
    let reconciler = GeofenceReconciler::new(&CoreConfig::default());
    reconciler.attach(&active_device(&sim, 1));

    sim.push_frame(geofence_frame(0, 100.0, 300.0));
    let mut rx = reconciler.observe();
    wait_until(&mut rx, |s| s.support == SupportState::Supported).await;
    let before = reconciler.snapshot();

    reconciler.shutdown();
    sim.push_frame(geofence_frame(1, 42.0, 999.0));
    settle().await;

    assert_eq!(reconciler.snapshot(), before);
}

#[tokio::test]
async fn stale_generation_pushes_are_dropped() {
    let sim = SimDevice::new("SIM-000001", "sim-quad");
    let reconciler = GeofenceReconciler::new(&CoreConfig::default());
    reconciler.attach(&active_device(&sim, 2));

    sim.push_with_generation(1, geofence_frame(0, 100.0, 300.0));
    settle().await;

    assert_eq!(reconciler.snapshot().support, SupportState::Unknown);
}

#[tokio::test]
async fn out_of_range_intent_is_rejected_without_write() {
    let sim = SimDevice::new("SIM-000001", "sim-quad");
    let reconciler = GeofenceReconciler::new(&CoreConfig::default());
    reconciler.attach(&active_device(&sim, 1));

    sim.push_frame(geofence_frame(0, 100.0, 300.0));
    let mut rx = reconciler.observe();
    wait_until(&mut rx, |s| s.support == SupportState::Supported).await;
    sim.take_writes();

    let result = reconciler.apply(GeofenceIntent::SetAltitude(400.0));
    assert_eq!(
        result,
        Err(ValidationError::OutOfRange {
            setting: "geofence altitude",
            value: 400.0,
            min: 10.0,
            max: 150.0,
        })
    );
    assert!(sim.writes().is_empty());
    assert!(!reconciler.snapshot().updating);
}

#[tokio::test]
async fn reset_reissues_factory_defaults_in_activation_order() {
    let sim = SimDevice::new("SIM-000001", "sim-quad");
    sim.set_auto_echo(true);
    let reconciler = GeofenceReconciler::new(&CoreConfig::default());
    reconciler.attach(&active_device(&sim, 1));

    sim.push_frame(geofence_frame(0, 42.0, 1500.0));
    let mut rx = reconciler.observe();
    wait_until(&mut rx, |s| s.support == SupportState::Supported).await;
    sim.take_writes();

    reconciler.reset_to_defaults().unwrap();
    let settled = wait_until(&mut rx, |s| !s.updating).await;
    assert_eq!(settled.altitude, 100.0);
    assert_eq!(settled.distance, 300.0);
    assert_eq!(settled.mode, GeofenceMode::Cylinder);
    assert_eq!(
        sim.writes(),
        vec![
            SettingWrite::GeofenceMaxAltitude(100.0),
            SettingWrite::GeofenceMaxDistance(300.0),
            SettingWrite::GeofenceMode(1),
        ]
    );
}

// ── Connection lifecycle scenarios ───────────────────────────────────

#[tokio::test]
async fn store_retains_last_snapshot_across_reconnect() {
    let reconciler = GeofenceReconciler::new(&CoreConfig::default());

    let sim_a = SimDevice::new("SIM-00000A", "sim-quad");
    reconciler.attach(&active_device(&sim_a, 1));
    sim_a.push_frame(geofence_frame(1, 110.0, 500.0));
    let mut rx = reconciler.observe();
    wait_until(&mut rx, |s| s.altitude == 110.0).await;

    // A new device replaces the old one. The old subscription is gone,
    // but the last known snapshot survives until the new device reports.
    let sim_b = SimDevice::new("SIM-00000B", "sim-quad");
    reconciler.attach(&active_device(&sim_b, 2));
    sim_a.push_frame(geofence_frame(1, 55.0, 500.0));
    settle().await;
    assert_eq!(reconciler.snapshot().altitude, 110.0);

    sim_b.push_frame(geofence_frame(1, 77.0, 500.0));
    wait_until(&mut rx, |s| s.altitude == 77.0).await;
}

#[tokio::test]
async fn binding_task_attaches_and_detaches_with_registry() {
    let registry = ConnectionRegistry::new();
    let reconciler = Arc::new(GeofenceReconciler::new(&CoreConfig::default()));
    let cancel = CancellationToken::new();
    let task = spawn_binding(
        Arc::clone(&reconciler) as Arc<dyn Reconciler>,
        &registry,
        cancel.clone(),
    );

    let sim = SimDevice::new("SIM-000001", "sim-quad");
    registry.connecting();
    let generation = registry.device_connected(sim.handle(), Arc::new(sim.clone()));
    sim.set_generation(generation);
    settle().await;

    sim.push_frame(geofence_frame(0, 90.0, 300.0));
    let mut rx = reconciler.observe();
    wait_until(&mut rx, |s| s.altitude == 90.0).await;

    reconciler.apply(GeofenceIntent::SetAltitude(60.0)).unwrap();
    registry.device_disconnected();
    wait_until(&mut rx, |s| !s.updating && s.altitude == 90.0).await;

    cancel.cancel();
    task.await.unwrap();
}

// ── Cellular scenarios ───────────────────────────────────────────────

#[tokio::test]
async fn unsupported_peripheral_degrades_to_non_editable() {
    let sim = SimDevice::new("SIM-000001", "sim-quad");
    let reconciler = CellularReconciler::new(&CoreConfig::default());
    reconciler.attach(&active_device(&sim, 1));

    sim.push_unsupported(PeripheralKind::Cellular);
    let mut rx = reconciler.observe();
    let snap = wait_until(&mut rx, |s| s.support == SupportState::Unsupported).await;
    assert!(!snap.is_editable());

    assert_eq!(
        reconciler.apply(CellularIntent::SetActivation(false)),
        Err(ValidationError::NotEditable { setting: "cellular" })
    );
    assert!(sim.writes().is_empty());
}

#[tokio::test]
async fn cellular_activation_round_trip() {
    let sim = SimDevice::new("SIM-000001", "sim-quad");
    sim.set_auto_echo(true);
    let reconciler = CellularReconciler::new(&CoreConfig::default());
    reconciler.attach(&active_device(&sim, 1));

    sim.push_frame(cellular_frame(true));
    let mut rx = reconciler.observe();
    wait_until(&mut rx, |s| s.support == SupportState::Supported).await;

    reconciler.apply(CellularIntent::SetActivation(false)).unwrap();
    let settled = wait_until(&mut rx, |s| !s.updating && !s.activated).await;
    assert!(settled.sim_inserted);
    assert_eq!(sim.writes(), vec![SettingWrite::CellularActivation(false)]);
}

// ── Return-home scenarios ────────────────────────────────────────────

#[tokio::test]
async fn return_home_writes_only_deltas() {
    let sim = SimDevice::new("SIM-000001", "sim-quad");
    sim.set_auto_echo(true);
    let reconciler = ReturnHomeReconciler::new(&CoreConfig::default());
    reconciler.attach(&active_device(&sim, 1));

    sim.push_frame(PushFrame::ReturnHome(ReturnHomeFrame {
        target_code: 0,
        min_altitude: BoundedValue::new(30.0, 20.0, 100.0),
        ending_behavior_code: 0,
    }));
    let mut rx = reconciler.observe();
    wait_until(&mut rx, |s| s.support == SupportState::Supported).await;

    // Intents matching the authoritative state touch nothing.
    reconciler
        .apply(ReturnHomeIntent::SetTarget(RthTarget::TakeOffPosition))
        .unwrap();
    reconciler
        .apply(ReturnHomeIntent::SetMinAltitude(30.4))
        .unwrap();
    assert!(sim.writes().is_empty());
    assert!(!reconciler.snapshot().updating);

    // A real delta goes through the tracked command path.
    reconciler
        .apply(ReturnHomeIntent::SetMinAltitude(45.0))
        .unwrap();
    let settled = wait_until(&mut rx, |s| !s.updating && s.min_altitude == 45.0).await;
    assert_eq!(settled.target, RthTarget::TakeOffPosition);
    assert_eq!(sim.writes(), vec![SettingWrite::ReturnHomeMinAltitude(45.0)]);

    reconciler
        .apply(ReturnHomeIntent::SetEndingBehavior(RthEndingBehavior::Landing))
        .unwrap();
    wait_until(&mut rx, |s| {
        !s.updating && s.ending_behavior == RthEndingBehavior::Landing
    })
    .await;
}

#[tokio::test]
async fn features_do_not_contend_across_stores() {
    let sim = SimDevice::new("SIM-000001", "sim-quad");
    let geofence = GeofenceReconciler::new(&CoreConfig::default());
    let cellular = CellularReconciler::new(&CoreConfig::default());
    let device = active_device(&sim, 1);
    geofence.attach(&device);
    cellular.attach(&device);

    sim.push_frame(geofence_frame(0, 100.0, 300.0));
    sim.push_frame(cellular_frame(true));

    let mut geofence_rx = geofence.observe();
    let mut cellular_rx = cellular.observe();
    wait_until(&mut geofence_rx, |s| s.support == SupportState::Supported).await;
    wait_until(&mut cellular_rx, |s| s.support == SupportState::Supported).await;

    // A cellular-only update leaves the geofence snapshot untouched.
    let geofence_before = geofence.snapshot();
    sim.push_frame(cellular_frame(false));
    wait_until(&mut cellular_rx, |s| !s.activated).await;
    assert_eq!(geofence.snapshot(), geofence_before);
}
