//! Host frame clock.
//!
//! The host loop calls [`FrameClock::begin_frame`] once per tick. Stages hold a
//! [`FrameWaiter`] and await [`FrameWaiter::next_frame`] at every slice
//! boundary, which suspends them until the host's next tick.

use std::sync::Arc;

use tokio::sync::watch;

use crate::error::{EngineError, Result};

/// Shared tick source. Cheap to clone.
#[derive(Clone)]
pub struct FrameClock {
    tx: Arc<watch::Sender<u64>>, // Current frame number
}

impl FrameClock {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(0u64);
        Self { tx: Arc::new(tx) }
    }

    /// Mark the start of a new host frame and wake every waiting stage.
    ///
    /// # Returns
    /// The new frame number.
    pub fn begin_frame(&self) -> u64 {
        let mut frame = 0;
        self.tx.send_modify(|f| {
            *f += 1;
            frame = *f;
        });
        frame
    }

    /// Current frame number.
    pub fn frame(&self) -> u64 {
        *self.tx.borrow()
    }

    /// Create a waiter that treats the current frame as already seen.
    pub fn waiter(&self) -> FrameWaiter {
        FrameWaiter { rx: self.tx.subscribe() }
    }
}

impl Default for FrameClock {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-task handle used to suspend until the next frame.
pub struct FrameWaiter {
    rx: watch::Receiver<u64>,
}

impl FrameWaiter {
    /// Suspend until the host begins another frame.
    ///
    /// # Errors
    /// Returns [`EngineError::ClockClosed`] if every clock handle was dropped.
    pub async fn next_frame(&mut self) -> Result<u64> {
        self.rx.changed().await.map_err(|_| EngineError::ClockClosed)?;
        Ok(*self.rx.borrow_and_update())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_waiter_wakes_on_next_frame() {
        let clock = FrameClock::new();
        let mut waiter = clock.waiter();

        let handle = tokio::spawn(async move { waiter.next_frame().await.unwrap() });
        tokio::task::yield_now().await;
        clock.begin_frame();

        assert_eq!(handle.await.unwrap(), 1);
        assert_eq!(clock.frame(), 1);
    }

    #[tokio::test]
    async fn test_closed_clock_errors() {
        let clock = FrameClock::new();
        let mut waiter = clock.waiter();
        drop(clock);
        assert!(matches!(waiter.next_frame().await, Err(EngineError::ClockClosed)));
    }
}
