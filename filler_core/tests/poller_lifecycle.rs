use std::sync::Arc;
use std::time::{Duration, Instant};

use filler_core::{
    HandshakeCfg, HandshakeManager, Opcode, Outgoing, SessionState, StationBus, StationEvent,
    StationPoller, StationRegistry, StationSpec, Ticker,
};
use filler_hardware::{DeviceProfile, SimHandle, SimulatedOpener};
use filler_traits::MonotonicClock;
use filler_traits::clock::test_clock::TestClock;

fn attached(serials: &[&str]) -> (StationRegistry, Vec<SimHandle>, Ticker) {
    let mut opener = SimulatedOpener::new();
    for (i, s) in serials.iter().enumerate() {
        opener = opener.with_device(&format!("/dev/ttyACM{i}"), DeviceProfile::new(*s));
    }
    let opener = Arc::new(opener);
    let handles = opener.ports().iter().map(|p| opener.handle(p).unwrap()).collect();
    let mut ticker = Ticker::new(Arc::new(TestClock::new()));
    let mut registry = StationRegistry::new(serials.iter().map(|s| StationSpec::new(*s)).collect());
    HandshakeManager::new(opener.clone(), HandshakeCfg::default())
        .scan(&opener.ports(), &mut registry, &mut ticker)
        .unwrap();
    (registry, handles, ticker)
}

fn spawn(registry: &mut StationRegistry) -> StationPoller {
    StationPoller::spawn(registry.lend_links(), Duration::from_millis(1), MonotonicClock::new())
}

/// Refresh until `done` holds or two seconds pass.
fn refresh_until(
    poller: &mut StationPoller,
    registry: &mut StationRegistry,
    ticker: &mut Ticker,
    mut done: impl FnMut(&StationRegistry) -> bool,
) -> Vec<(usize, StationEvent)> {
    let deadline = Instant::now() + Duration::from_secs(2);
    let mut seen = Vec::new();
    while Instant::now() < deadline {
        seen.extend(poller.refresh(registry, ticker).unwrap());
        if done(registry) {
            return seen;
        }
        std::thread::sleep(Duration::from_millis(2));
    }
    panic!("condition not reached; events so far: {seen:?}");
}

#[test]
fn weights_flow_through_the_worker() {
    let (mut registry, handles, mut t) = attached(&["SCL1000", "SCL1001"]);
    let mut poller = spawn(&mut registry);
    handles[1].set_weight(42.5);

    let seen = refresh_until(&mut poller, &mut registry, &mut t, |r| {
        r.get(1).unwrap().current_weight() == 42.5
    });
    assert!(seen.contains(&(1, StationEvent::Weight(42.5))));
    assert_eq!(registry.get(0).unwrap().current_weight(), 0.0);
    drop(poller);
}

#[test]
fn commands_are_sent_by_the_worker() {
    let (mut registry, handles, mut t) = attached(&["SCL1000"]);
    handles[0].set_weight(12.0);
    let mut poller = spawn(&mut registry);
    refresh_until(&mut poller, &mut registry, &mut t, |r| r.get(0).unwrap().current_weight() == 12.0);

    registry.get_mut(0).unwrap().set_state(SessionState::Taring).unwrap();
    poller.send(&mut registry, 0, Outgoing::Command(Opcode::Tare)).unwrap();
    refresh_until(&mut poller, &mut registry, &mut t, |r| {
        r.get(0).unwrap().state() == SessionState::Idle
    });
    assert_eq!(registry.get(0).unwrap().current_weight(), 0.0);
    assert_eq!(handles[0].tare_offset(), 12.0);
}

#[test]
fn shutdown_hands_links_back() {
    let (mut registry, _handles, _t) = attached(&["SCL1000", "SCL1001"]);
    let poller = spawn(&mut registry);
    assert!(registry.iter().all(|s| !s.has_link() && s.is_connected()));

    let links = poller.shutdown();
    assert_eq!(links.len(), 2);
    registry.return_links(links);
    assert!(registry.iter().all(|s| s.has_link()));
}

#[test]
fn dropping_the_poller_joins_the_worker() {
    let (mut registry, _handles, _t) = attached(&["SCL1000"]);
    let poller = spawn(&mut registry);
    let started = Instant::now();
    drop(poller);
    assert!(started.elapsed() < Duration::from_secs(1));
}

#[test]
fn unplugged_station_is_demoted() {
    let (mut registry, handles, mut t) = attached(&["SCL1000", "SCL1001"]);
    let mut poller = spawn(&mut registry);
    handles[0].unplug();

    let seen = refresh_until(&mut poller, &mut registry, &mut t, |r| !r.get(0).unwrap().is_connected());
    assert!(seen.iter().any(|(i, e)| *i == 0 && matches!(e, StationEvent::LinkLost(_))));
    assert_eq!(registry.get(0).unwrap().state(), SessionState::Disconnected);
    assert!(
        poller
            .send(&mut registry, 0, Outgoing::Command(Opcode::Tare))
            .is_err()
    );

    let links = poller.shutdown();
    assert_eq!(links.iter().map(|(i, _)| *i).collect::<Vec<_>>(), vec![1]);
    registry.return_links(links);
    assert!(!registry.get(0).unwrap().has_link());
    assert!(registry.get(1).unwrap().has_link());
}
