//! # Clock and Timer Abstractions
//!
//! The recovery core never reads the system clock or spawns timers on its
//! own; both come in through these traits so tests can drive time manually
//! and embedders can plug their event loop in.
//!
//! [`ThreadTimerService`] is the default implementation: one worker thread
//! per scheduled tick, fed by a `crossbeam-channel` ticker and stopped
//! through a cancellation channel.

#![forbid(unsafe_code)]

use core::time::Duration;

use crossbeam_channel::{bounded, select, tick, Sender};

use crate::types::Instant;

/// Monotonic clock source.
pub trait Clock: Send + Sync {
    /// Current monotonic timestamp.
    fn now(&self) -> Instant;
}

/// Handle to a scheduled recurring callback.
///
/// Cancellation is idempotent. Dropping the handle also stops the schedule.
pub trait TimerHandle: Send {
    fn cancel(&self);
}

/// Timer scheduling service.
pub trait TimerService: Send + Sync {
    /// Invoke `callback` every `period` until the returned handle is
    /// cancelled or dropped.
    fn schedule_every(
        &self,
        callback: Box<dyn FnMut() + Send>,
        period: Duration,
    ) -> Box<dyn TimerHandle>;
}

/// Clock backed by [`std::time::Instant`], anchored at construction.
#[derive(Debug)]
pub struct MonotonicClock {
    origin: std::time::Instant,
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self {
            origin: std::time::Instant::now(),
        }
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for MonotonicClock {
    fn now(&self) -> Instant {
        let nanos = u64::try_from(self.origin.elapsed().as_nanos()).unwrap_or(u64::MAX);
        Instant::from_nanos(nanos)
    }
}

/// Timer service that runs each schedule on a dedicated worker thread.
#[derive(Debug, Default)]
pub struct ThreadTimerService;

impl ThreadTimerService {
    pub fn new() -> Self {
        Self
    }
}

struct ThreadTimerHandle {
    stop: Sender<()>,
}

impl TimerHandle for ThreadTimerHandle {
    fn cancel(&self) {
        // The worker may already have exited; a closed channel is fine.
        let _ = self.stop.try_send(());
    }
}

impl Drop for ThreadTimerHandle {
    fn drop(&mut self) {
        // Closing the channel wakes the worker and stops the schedule.
        let _ = self.stop.try_send(());
    }
}

impl TimerService for ThreadTimerService {
    fn schedule_every(
        &self,
        mut callback: Box<dyn FnMut() + Send>,
        period: Duration,
    ) -> Box<dyn TimerHandle> {
        let (stop_tx, stop_rx) = bounded::<()>(1);
        let ticker = tick(period);

        std::thread::spawn(move || loop {
            select! {
                recv(ticker) -> _ => callback(),
                recv(stop_rx) -> msg => {
                    // Explicit cancel or handle dropped (channel closed).
                    let _ = msg;
                    break;
                }
            }
        });

        Box::new(ThreadTimerHandle { stop: stop_tx })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_monotonic_clock_advances() {
        let clock = MonotonicClock::new();
        let a = clock.now();
        std::thread::sleep(Duration::from_millis(2));
        let b = clock.now();
        assert!(b > a);
    }

    #[test]
    fn test_thread_timer_ticks_and_cancels() {
        let service = ThreadTimerService::new();
        let count = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&count);

        let handle = service.schedule_every(
            Box::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
            Duration::from_millis(5),
        );

        std::thread::sleep(Duration::from_millis(60));
        assert!(count.load(Ordering::SeqCst) >= 1);

        handle.cancel();
        std::thread::sleep(Duration::from_millis(10));
        let after_cancel = count.load(Ordering::SeqCst);
        std::thread::sleep(Duration::from_millis(30));
        // At most one tick can race the cancellation.
        assert!(count.load(Ordering::SeqCst) <= after_cancel + 1);
    }
}
