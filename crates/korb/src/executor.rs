// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Upcall executor.
//!
//! All application-visible work produced by a connection (dispatch
//! execution, sent confirmations, reply delivery, close callbacks) runs
//! here, outside the connection's internal lock. A dispatch may itself
//! synchronously enqueue new traffic on the same connection without
//! deadlocking.

use std::io;
use std::thread::{self, JoinHandle};

use crossbeam::channel::{unbounded, Receiver, Sender};

/// One unit of application-visible work.
pub type Upcall = Box<dyn FnOnce() + Send>;

/// Fixed worker pool draining a queue of upcalls.
pub struct UpcallExecutor {
    tx: Option<Sender<Upcall>>,
    workers: Vec<JoinHandle<()>>,
}

impl UpcallExecutor {
    /// Spawn `threads` workers (at least one).
    pub fn new(threads: usize) -> io::Result<Self> {
        let threads = threads.max(1);
        let (tx, rx) = unbounded::<Upcall>();

        let mut workers = Vec::with_capacity(threads);
        for i in 0..threads {
            let rx: Receiver<Upcall> = rx.clone();
            let handle = thread::Builder::new()
                .name(format!("korb-upcall-{}", i))
                .spawn(move || {
                    while let Ok(upcall) = rx.recv() {
                        upcall();
                    }
                })?;
            workers.push(handle);
        }

        Ok(Self {
            tx: Some(tx),
            workers,
        })
    }

    /// Queue one upcall.
    pub fn execute(&self, upcall: Upcall) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(upcall);
        }
    }

    /// Queue a batch of upcalls in order.
    pub fn execute_all(&self, upcalls: Vec<Upcall>) {
        for upcall in upcalls {
            self.execute(upcall);
        }
    }

    /// Stop accepting work and join the workers after the queue drains.
    pub fn shutdown(&mut self) {
        self.tx = None;
        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }
    }
}

impl Drop for UpcallExecutor {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for UpcallExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpcallExecutor")
            .field("workers", &self.workers.len())
            .field("running", &self.tx.is_some())
            .finish()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn test_executes_queued_upcalls() {
        let counter = Arc::new(AtomicUsize::new(0));
        let mut executor = UpcallExecutor::new(2).unwrap();

        for _ in 0..10 {
            let counter = counter.clone();
            executor.execute(Box::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            }));
        }

        executor.shutdown();
        assert_eq!(counter.load(Ordering::SeqCst), 10);
    }

    #[test]
    fn test_single_worker_preserves_order() {
        let log = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let mut executor = UpcallExecutor::new(1).unwrap();

        for i in 0..5 {
            let log = log.clone();
            executor.execute(Box::new(move || {
                log.lock().push(i);
            }));
        }

        executor.shutdown();
        assert_eq!(*log.lock(), vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_upcall_may_queue_more_work() {
        let counter = Arc::new(AtomicUsize::new(0));
        let executor = Arc::new(UpcallExecutor::new(2).unwrap());

        let inner_counter = counter.clone();
        let inner_executor = executor.clone();
        executor.execute(Box::new(move || {
            inner_counter.fetch_add(1, Ordering::SeqCst);
            let c = inner_counter.clone();
            inner_executor.execute(Box::new(move || {
                c.fetch_add(1, Ordering::SeqCst);
            }));
        }));

        // Give the chained work a moment to drain.
        std::thread::sleep(Duration::from_millis(100));
        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }
}
