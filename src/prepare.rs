//! Background preparation of CPU-side assets.
//!
//! Building a sprite bitmap or validating a shader does not need the device,
//! so it can run off the render thread. A [`Handoff`] runs the job on a
//! short-lived worker thread and publishes the result over a channel. The
//! render thread polls with [`Handoff::try_take`] at its resolve point only.
//!
//! Every request bumps a generation counter. Results from older requests are
//! dropped when they arrive, so a burst of colour changes uploads only the
//! last sprite.

use std::io;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::thread;
use std::time::{Duration, Instant};

struct Prepared<T> {
    generation: u64,
    value: T,
}

/// Single-slot producer/consumer handoff with stale-result dropping.
pub struct Handoff<T> {
    tx: Sender<Prepared<T>>,
    rx: Receiver<Prepared<T>>,
    generation: u64,
    delivered: u64,
    background: bool,
    name: &'static str,
}

impl<T: Send + 'static> Handoff<T> {
    /// Create a handoff. With `background` off, jobs run inline in
    /// [`request`](Self::request) and the result is ready immediately.
    pub fn new(name: &'static str, background: bool) -> Self {
        let (tx, rx) = mpsc::channel();
        Self {
            tx,
            rx,
            generation: 0,
            delivered: 0,
            background,
            name,
        }
    }

    /// Start a job, superseding any request still in flight.
    ///
    /// Returns the generation of the new request. If the worker thread
    /// cannot be spawned the request is withdrawn and the error returned, so
    /// the caller can build the value itself.
    pub fn request<F>(&mut self, build: F) -> io::Result<u64>
    where
        F: FnOnce() -> T + Send + 'static,
    {
        self.generation += 1;
        let generation = self.generation;
        let tx = self.tx.clone();

        if !self.background {
            let _ = tx.send(Prepared {
                generation,
                value: build(),
            });
            return Ok(generation);
        }

        let spawned = thread::Builder::new()
            .name(format!("flowtrails-{}", self.name))
            .spawn(move || {
                // The receiver outlives every worker unless the handoff was dropped
                let _ = tx.send(Prepared {
                    generation,
                    value: build(),
                });
            });

        match spawned {
            Ok(_) => Ok(generation),
            Err(e) => {
                self.delivered = self.generation;
                Err(e)
            }
        }
    }

    /// Take the result of the latest request if it has arrived.
    ///
    /// Never blocks. Results of superseded requests are discarded.
    pub fn try_take(&mut self) -> Option<T> {
        let mut latest = None;
        while let Ok(prepared) = self.rx.try_recv() {
            if let Some(value) = self.accept(prepared) {
                latest = Some(value);
            }
        }
        latest
    }

    /// Block until the latest request completes or `timeout` elapses.
    pub fn wait_timeout(&mut self, timeout: Duration) -> Option<T> {
        let deadline = Instant::now() + timeout;
        while self.is_pending() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match self.rx.recv_timeout(remaining) {
                Ok(prepared) => {
                    if let Some(value) = self.accept(prepared) {
                        return Some(value);
                    }
                }
                Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => {
                    return None;
                }
            }
        }
        None
    }

    /// Drop whatever is in flight; its result will be ignored.
    pub fn cancel(&mut self) {
        self.generation += 1;
        self.delivered = self.generation;
    }

    /// True while the latest request has not been delivered.
    pub fn is_pending(&self) -> bool {
        self.delivered < self.generation
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    fn accept(&mut self, prepared: Prepared<T>) -> Option<T> {
        if prepared.generation != self.generation {
            tracing::trace!(
                handoff = self.name,
                stale = prepared.generation,
                current = self.generation,
                "dropping stale result"
            );
            return None;
        }
        self.delivered = prepared.generation;
        Some(prepared.value)
    }
}

impl<T> std::fmt::Debug for Handoff<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Handoff")
            .field("name", &self.name)
            .field("generation", &self.generation)
            .field("delivered", &self.delivered)
            .field("background", &self.background)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Barrier};

    const WAIT: Duration = Duration::from_secs(5);

    #[test]
    fn test_inline_result_is_ready() {
        let mut handoff = Handoff::new("test", false);
        handoff.request(|| 7).unwrap();
        assert!(handoff.is_pending());
        assert_eq!(handoff.try_take(), Some(7));
        assert!(!handoff.is_pending());
        assert_eq!(handoff.try_take(), None);
    }

    #[test]
    fn test_background_result_arrives() {
        let mut handoff = Handoff::new("test", true);
        handoff.request(|| String::from("sprite")).unwrap();
        assert_eq!(handoff.wait_timeout(WAIT).as_deref(), Some("sprite"));
    }

    #[test]
    fn test_stale_results_dropped() {
        let mut handoff = Handoff::new("test", false);
        handoff.request(|| 1).unwrap();
        handoff.request(|| 2).unwrap();
        handoff.request(|| 3).unwrap();
        assert_eq!(handoff.try_take(), Some(3));
        assert_eq!(handoff.try_take(), None);
    }

    #[test]
    fn test_slow_stale_worker_ignored() {
        let mut handoff = Handoff::new("test", true);
        let gate = Arc::new(Barrier::new(2));
        let worker_gate = gate.clone();

        handoff
            .request(move || {
                worker_gate.wait();
                1
            })
            .unwrap();
        handoff.request(|| 2).unwrap();

        assert_eq!(handoff.wait_timeout(WAIT), Some(2));
        gate.wait();
        // Give the first worker time to publish, then make sure it is ignored
        thread::sleep(Duration::from_millis(20));
        assert_eq!(handoff.try_take(), None);
    }

    #[test]
    fn test_cancel_discards_in_flight() {
        let mut handoff = Handoff::new("test", false);
        handoff.request(|| 5).unwrap();
        handoff.cancel();
        assert!(!handoff.is_pending());
        assert_eq!(handoff.try_take(), None);
    }
}
