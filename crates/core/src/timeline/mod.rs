use serde::{Deserialize, Serialize};
use tokio::sync::broadcast::{self, error::RecvError, error::TryRecvError};
use tracing::trace;

use crate::{BridgeError, Result};

/// Logical time report from the render thread.
#[derive(Debug, Default, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ClockTick {
    /// Engine time at the previous report, in seconds.
    pub previous_time: f64,
    pub current_time: f64,
    /// Audio covered by one report interval, in seconds.
    pub report_latency: f64,
}

impl ClockTick {
    pub fn delta(&self) -> f64 {
        self.current_time - self.previous_time
    }
}

/// Follows the render thread's logical time through its tick stream.
#[derive(Debug)]
pub struct TransportClock {
    ticks: broadcast::Receiver<ClockTick>,
    last: Option<ClockTick>,
}

impl TransportClock {
    pub fn new(ticks: broadcast::Receiver<ClockTick>) -> Self {
        Self { ticks, last: None }
    }

    /// Applies every queued tick without waiting and returns the newest.
    pub fn poll(&mut self) -> Option<ClockTick> {
        loop {
            match self.ticks.try_recv() {
                Ok(tick) => self.last = Some(tick),
                Err(TryRecvError::Lagged(skipped)) => {
                    trace!(skipped, "transport clock skipped stale ticks");
                }
                Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => break,
            }
        }
        self.last
    }

    /// Waits for the next tick.
    pub async fn next_tick(&mut self) -> Result<ClockTick> {
        loop {
            match self.ticks.recv().await {
                Ok(tick) => {
                    self.last = Some(tick);
                    return Ok(tick);
                }
                Err(RecvError::Lagged(skipped)) => {
                    trace!(skipped, "transport clock skipped stale ticks");
                }
                Err(RecvError::Closed) => return Err(BridgeError::Disconnected),
            }
        }
    }

    /// Engine time of the newest observed tick, zero before the first.
    pub fn now(&self) -> f64 {
        self.last.map(|tick| tick.current_time).unwrap_or(0.0)
    }

    pub fn last_tick(&self) -> Option<ClockTick> {
        self.last
    }
}
