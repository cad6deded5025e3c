//! How steps and the runtime reach the stations.
//!
//! [`DirectBus`] drives registry-owned links on the caller's thread
//! (cooperative model). [`crate::poller::StationPoller`] implements the same
//! trait for the worker-thread model.

use crate::error::{FillerError, LinkResult};
use crate::handshake::{HandshakeManager, ScanReport};
use crate::protocol::{Outgoing, StationEvent};
use crate::registry::StationRegistry;
use crate::sched::Ticker;

pub trait StationBus {
    /// Pull pending device events into the registry; returns what was applied.
    fn refresh(
        &mut self,
        registry: &mut StationRegistry,
        ticker: &mut Ticker,
    ) -> LinkResult<Vec<(usize, StationEvent)>>;

    /// Send one frame to a station.
    fn send(&mut self, registry: &mut StationRegistry, index: usize, out: Outgoing) -> LinkResult<()>;

    /// Re-run the handshake over ports not already attached, if supported.
    fn rescan(
        &mut self,
        _registry: &mut StationRegistry,
        _ticker: &mut Ticker,
    ) -> LinkResult<Option<ScanReport>> {
        Ok(None)
    }
}

/// Cooperative bus over the registry's own links.
#[derive(Default)]
pub struct DirectBus {
    rescan: Option<(HandshakeManager, Vec<String>)>,
}

impl DirectBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allow operator-requested rescans over `ports`.
    pub fn with_rescan(mut self, manager: HandshakeManager, ports: Vec<String>) -> Self {
        self.rescan = Some((manager, ports));
        self
    }
}

impl StationBus for DirectBus {
    fn refresh(
        &mut self,
        registry: &mut StationRegistry,
        ticker: &mut Ticker,
    ) -> LinkResult<Vec<(usize, StationEvent)>> {
        let mut out = Vec::new();
        for index in 0..registry.len() {
            let Some(link) = registry.get_mut(index).and_then(|s| s.link_mut()) else {
                continue;
            };
            let mut events = Vec::new();
            loop {
                match link.try_read_frame(ticker) {
                    Ok(Some(frame)) => events.push(frame.into_event()),
                    Ok(None) => break,
                    Err(FillerError::Cancelled) => return Err(FillerError::Cancelled),
                    Err(FillerError::LinkFailure(reason)) => {
                        events.push(StationEvent::LinkLost(reason));
                        break;
                    }
                    Err(e) => tracing::warn!(station = index, error = %e, "dropping bad frame"),
                }
            }
            for ev in events {
                registry.apply(index, &ev);
                out.push((index, ev));
            }
        }
        Ok(out)
    }

    fn send(&mut self, registry: &mut StationRegistry, index: usize, out: Outgoing) -> LinkResult<()> {
        let link = registry
            .get_mut(index)
            .and_then(|s| s.link_mut())
            .ok_or_else(|| FillerError::State(format!("station {index} has no link")))?;
        match link.send(out) {
            Err(e) if e.is_link_failure() => {
                registry.demote(index, &e.to_string());
                Err(e)
            }
            other => other,
        }
    }

    fn rescan(
        &mut self,
        registry: &mut StationRegistry,
        ticker: &mut Ticker,
    ) -> LinkResult<Option<ScanReport>> {
        match &self.rescan {
            Some((manager, ports)) => manager.scan(ports, registry, ticker).map(Some),
            None => Ok(None),
        }
    }
}
