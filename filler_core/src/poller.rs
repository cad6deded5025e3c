//! Background station polling (worker-thread model).
//!
//! Spawns a thread that owns every lent station link, decodes incoming frames
//! in wire order per station, stores live weights through the shared
//! `WeightCell`s and pushes `StationUpdate`s over a channel. The orchestrator
//! thread drains the channel on its own tick and applies the updates; no
//! Station field other than the weight is touched across threads.
//!
//! Each `StationPoller` spawns exactly one thread, shut down when the poller is
//! dropped. `shutdown` additionally hands the surviving links back.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel as xch;
use filler_traits::Clock;

use crate::atomic::WeightCell;
use crate::bus::StationBus;
use crate::error::{FillerError, LinkResult};
use crate::link::StationLink;
use crate::protocol::{Outgoing, StationEvent};
use crate::registry::StationRegistry;
use crate::sched::Ticker;

/// One event from one station, in that station's wire order.
#[derive(Debug, Clone, PartialEq)]
pub struct StationUpdate {
    pub index: usize,
    pub event: StationEvent,
}

#[derive(Debug)]
enum Command {
    Send { index: usize, out: Outgoing },
}

struct Owned {
    index: usize,
    link: StationLink,
    weight: WeightCell,
}

pub struct StationPoller {
    rx: xch::Receiver<StationUpdate>,
    cmd_tx: xch::Sender<Command>,
    shutdown: Arc<AtomicBool>,
    join_handle: Option<JoinHandle<Vec<(usize, StationLink)>>>,
}

impl StationPoller {
    pub fn spawn<C: Clock + Send + Sync + 'static>(
        links: Vec<(usize, StationLink, WeightCell)>,
        period: Duration,
        clock: C,
    ) -> Self {
        let (tx, rx) = xch::unbounded();
        let (cmd_tx, cmd_rx) = xch::unbounded::<Command>();
        let shutdown = Arc::new(AtomicBool::new(false));
        let shutdown_clone = shutdown.clone();
        let clock: Arc<dyn Clock + Send + Sync> = Arc::new(clock);

        let join_handle = std::thread::spawn(move || {
            let mut ticker = Ticker::new(clock);
            let mut owned: Vec<Owned> = links
                .into_iter()
                .map(|(index, link, weight)| Owned { index, link, weight })
                .collect();
            tracing::debug!(stations = owned.len(), "station poller started");

            'run: loop {
                if shutdown_clone.load(Ordering::Relaxed) {
                    tracing::debug!("station poller received shutdown signal");
                    break;
                }

                let mut lost = Vec::new();
                for cmd in cmd_rx.try_iter() {
                    let Command::Send { index, out } = cmd;
                    let Some(slot) = owned.iter_mut().find(|o| o.index == index) else {
                        tracing::warn!(station = index, ?out, "send to station not owned by poller");
                        continue;
                    };
                    if let Err(e) = slot.link.send(out) {
                        tracing::warn!(station = index, error = %e, "poller send failed");
                        if let FillerError::LinkFailure(reason) = e {
                            let _ = tx.send(StationUpdate {
                                index,
                                event: StationEvent::LinkLost(reason),
                            });
                            lost.push(index);
                        }
                    }
                }
                for slot in &mut owned {
                    if lost.contains(&slot.index) {
                        continue;
                    }
                    loop {
                        match slot.link.try_read_frame(&mut ticker) {
                            Ok(Some(frame)) => {
                                let event = frame.into_event();
                                if let StationEvent::Weight(w) | StationEvent::FinalWeight(w) = event {
                                    slot.weight.store(w);
                                }
                                // Consumer gone; exit gracefully.
                                if tx.send(StationUpdate { index: slot.index, event }).is_err() {
                                    break 'run;
                                }
                            }
                            Ok(None) => break,
                            Err(FillerError::LinkFailure(reason)) => {
                                let _ = tx.send(StationUpdate {
                                    index: slot.index,
                                    event: StationEvent::LinkLost(reason),
                                });
                                lost.push(slot.index);
                                break;
                            }
                            Err(e) => {
                                tracing::warn!(station = slot.index, error = %e, "poller dropped bad frame");
                            }
                        }
                    }
                }
                owned.retain(|o| !lost.contains(&o.index));

                if shutdown_clone.load(Ordering::Relaxed) {
                    break;
                }
                if ticker.wait(period).is_err() {
                    break;
                }
            }
            tracing::trace!("station poller exiting cleanly");
            owned.into_iter().map(|o| (o.index, o.link)).collect()
        });

        Self {
            rx,
            cmd_tx,
            shutdown,
            join_handle: Some(join_handle),
        }
    }

    /// Every update queued since the last drain, in arrival order.
    pub fn drain(&self) -> Vec<StationUpdate> {
        self.rx.try_iter().collect()
    }

    /// Stop the thread and take back the links it still owns.
    pub fn shutdown(mut self) -> Vec<(usize, StationLink)> {
        self.shutdown.store(true, Ordering::Relaxed);
        match self.join_handle.take().map(JoinHandle::join) {
            Some(Ok(links)) => links,
            Some(Err(e)) => {
                tracing::warn!(?e, "station poller panicked during shutdown");
                Vec::new()
            }
            None => Vec::new(),
        }
    }
}

impl Drop for StationPoller {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
        if let Some(handle) = self.join_handle.take() {
            match handle.join() {
                Ok(_) => tracing::trace!("station poller joined"),
                Err(e) => tracing::warn!(?e, "station poller panicked during shutdown"),
            }
        }
    }
}

impl StationBus for StationPoller {
    fn refresh(
        &mut self,
        registry: &mut StationRegistry,
        _ticker: &mut Ticker,
    ) -> LinkResult<Vec<(usize, StationEvent)>> {
        let updates = self.drain();
        let mut out = Vec::with_capacity(updates.len());
        for u in updates {
            registry.apply(u.index, &u.event);
            out.push((u.index, u.event));
        }
        Ok(out)
    }

    fn send(&mut self, registry: &mut StationRegistry, index: usize, out: Outgoing) -> LinkResult<()> {
        if !registry.get(index).is_some_and(|s| s.is_connected()) {
            return Err(FillerError::State(format!("station {index} is not connected")));
        }
        self.cmd_tx
            .send(Command::Send { index, out })
            .map_err(|_| FillerError::State("station poller has stopped".into()))
    }
}
