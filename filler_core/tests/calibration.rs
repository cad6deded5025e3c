use std::sync::Arc;

use filler_core::mocks::{MemorySettings, ScriptedOperator};
use filler_core::{
    CalibrationSession, FillerError, HandshakeCfg, HandshakeManager, SessionState, StationRegistry,
    StationSpec, Ticker,
};
use filler_hardware::{DeviceProfile, Fault, SimHandle, SimulatedOpener};
use filler_traits::clock::test_clock::TestClock;

const PORT: &str = "/dev/ttyACM0";

/// One station attached through a normal handshake.
fn attached(profile: DeviceProfile, factor: f32) -> (StationRegistry, SimHandle, Ticker) {
    let opener = Arc::new(SimulatedOpener::new().with_device(PORT, profile));
    let handle = opener.handle(PORT).unwrap();
    let clock = TestClock::new();
    let mut ticker = Ticker::new(Arc::new(clock));
    let mut registry = StationRegistry::new(vec![StationSpec {
        calibration_factor: factor,
        ..StationSpec::new("SCL1000")
    }]);
    HandshakeManager::new(opener.clone(), HandshakeCfg::default())
        .scan(&opener.ports(), &mut registry, &mut ticker)
        .unwrap();
    assert!(registry.get(0).unwrap().is_connected());
    (registry, handle, ticker)
}

#[test]
fn computed_factor_is_persisted_and_applied() {
    let (mut registry, handle, mut ticker) = attached(DeviceProfile::new("SCL1000").computed_factor(412.5), 1.0);
    let mut settings = MemorySettings::new().with_calibration(0, 1.0);
    let mut op = ScriptedOperator::default();

    let factor = CalibrationSession::new(0)
        .run(&mut registry, &mut op, &mut settings, &mut ticker)
        .unwrap();

    assert_eq!(factor, 412.5);
    assert_eq!(handle.reference_weight(), Some(500.0));
    assert_eq!(settings.calibration.get(&0), Some(&412.5));
    assert_eq!(settings.calibration_writes, 1);
    let st = registry.get(0).unwrap();
    assert_eq!(st.calibration_factor(), 412.5);
    assert_eq!(st.state(), SessionState::Idle);
    assert!(st.has_link());
}

#[test]
fn operator_reference_weight_is_sent() {
    let (mut registry, handle, mut ticker) = attached(DeviceProfile::new("SCL1000"), 1.0);
    let mut settings = MemorySettings::new();
    let mut op = ScriptedOperator {
        reference_g: Some(250.0),
        ..ScriptedOperator::default()
    };
    CalibrationSession::new(0)
        .run(&mut registry, &mut op, &mut settings, &mut ticker)
        .unwrap();
    assert_eq!(handle.reference_weight(), Some(250.0));
}

#[test]
fn unplug_mid_session_keeps_previous_factor() {
    let (mut registry, _handle, mut ticker) = attached(
        DeviceProfile::new("SCL1000")
            .computed_factor(999.0)
            .fault(Fault::UnplugAfterReferenceWeight),
        3.5,
    );
    let mut settings = MemorySettings::new().with_calibration(0, 3.5);
    let before = settings.calibration.clone();
    let mut op = ScriptedOperator::default();

    let err = CalibrationSession::new(0)
        .run(&mut registry, &mut op, &mut settings, &mut ticker)
        .unwrap_err();

    assert!(err.is_link_failure(), "got {err:?}");
    assert_eq!(settings.calibration, before);
    assert_eq!(settings.calibration_writes, 0);
    let st = registry.get(0).unwrap();
    assert!(!st.is_connected());
    assert!(!st.has_link());
    assert_eq!(st.state(), SessionState::Disconnected);
    assert_eq!(st.calibration_factor(), 3.5);
}

#[test]
fn garbled_factor_line_is_skipped() {
    let (mut registry, _handle, mut ticker) = attached(
        DeviceProfile::new("SCL1000")
            .computed_factor(88.25)
            .fault(Fault::GarbledFactorOnce),
        1.0,
    );
    let mut settings = MemorySettings::new();
    let mut op = ScriptedOperator::default();
    let factor = CalibrationSession::new(0)
        .run(&mut registry, &mut op, &mut settings, &mut ticker)
        .unwrap();
    assert_eq!(factor, 88.25);
    assert_eq!(settings.calibration_writes, 1);
}

#[test]
fn declined_session_is_cancelled_and_keeps_the_link() {
    let (mut registry, _handle, mut ticker) = attached(DeviceProfile::new("SCL1000"), 2.0);
    let mut settings = MemorySettings::new();
    let mut op = ScriptedOperator {
        decline_reference: true,
        ..ScriptedOperator::default()
    };
    let err = CalibrationSession::new(0)
        .run(&mut registry, &mut op, &mut settings, &mut ticker)
        .unwrap_err();
    assert_eq!(err, FillerError::Cancelled);
    assert_eq!(settings.calibration_writes, 0);
    let st = registry.get(0).unwrap();
    assert!(st.is_connected());
    assert!(st.has_link());
    assert_eq!(st.state(), SessionState::Idle);
    assert_eq!(st.calibration_factor(), 2.0);
}

#[test]
fn disconnected_station_cannot_calibrate() {
    let mut registry = StationRegistry::new(vec![StationSpec::new("SCL1000")]);
    let clock = TestClock::new();
    let mut ticker = Ticker::new(Arc::new(clock));
    let mut settings = MemorySettings::new();
    let err = CalibrationSession::new(0)
        .run(&mut registry, &mut ScriptedOperator::default(), &mut settings, &mut ticker)
        .unwrap_err();
    assert!(matches!(err, FillerError::State(_)));
}
