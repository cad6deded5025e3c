//! Single scheduler tick used by every wait loop.
//!
//! Link reads, handshake polls and operator waits all suspend through
//! [`Ticker::wait`], which pumps the host UI (cooperative model), checks the
//! shared cancel flag and then sleeps on the injected clock. Worker threads
//! run the same loops with a pump-less ticker.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use filler_traits::{Clock, MonotonicClock};

use crate::error::{FillerError, LinkResult};

/// Processes pending UI/input events; called once per tick.
pub trait UiPump {
    fn pump(&mut self);
}

impl<F: FnMut()> UiPump for F {
    fn pump(&mut self) {
        self()
    }
}

pub struct Ticker {
    clock: Arc<dyn Clock + Send + Sync>,
    pump: Option<Box<dyn UiPump + Send>>,
    cancel: Option<Arc<AtomicBool>>,
}

impl Default for Ticker {
    fn default() -> Self {
        Self::new(Arc::new(MonotonicClock::new()))
    }
}

impl std::fmt::Debug for Ticker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ticker")
            .field("pump", &self.pump.is_some())
            .field("cancelled", &self.cancelled())
            .finish()
    }
}

impl Ticker {
    pub fn new(clock: Arc<dyn Clock + Send + Sync>) -> Self {
        Self {
            clock,
            pump: None,
            cancel: None,
        }
    }

    pub fn with_pump(mut self, pump: impl UiPump + Send + 'static) -> Self {
        self.pump = Some(Box::new(pump));
        self
    }

    pub fn with_cancel(mut self, flag: Arc<AtomicBool>) -> Self {
        self.cancel = Some(flag);
        self
    }

    pub fn cancelled(&self) -> bool {
        self.cancel
            .as_ref()
            .is_some_and(|c| c.load(Ordering::Relaxed))
    }

    pub fn now(&self) -> Instant {
        self.clock.now()
    }

    pub fn clock(&self) -> Arc<dyn Clock + Send + Sync> {
        self.clock.clone()
    }

    /// One cooperative suspension: pump, honor cancellation, sleep `d`.
    pub fn wait(&mut self, d: Duration) -> LinkResult<()> {
        if let Some(p) = self.pump.as_mut() {
            p.pump();
        }
        if self.cancelled() {
            return Err(FillerError::Cancelled);
        }
        self.clock.sleep(d);
        Ok(())
    }

    /// True once `deadline` (if any) has passed on this ticker's clock.
    pub fn expired(&self, deadline: Option<Instant>) -> bool {
        deadline.is_some_and(|d| self.clock.now() >= d)
    }

    pub fn deadline(&self, timeout: Option<Duration>) -> Option<Instant> {
        timeout.map(|t| self.clock.now() + t)
    }
}
