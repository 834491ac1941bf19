// SPDX-FileCopyrightText: 2025 Contributors to the Capture Bridge project.
// SPDX-License-Identifier: Apache-2.0

//! Background operations.
//!
//! An [`Operation`] runs one closure on its own thread. It can be cancelled
//! cooperatively and awaited with a deadline. Dropping an unfinished
//! operation cancels it and detaches the thread.

use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread::{self, JoinHandle},
    time::Duration,
};

use capture_media::{Error, Result};
use crossbeam_channel::{Receiver, RecvTimeoutError};
use tracing::{debug, error};

/// Cancellation flag shared with a running operation.
#[derive(Clone, Debug, Default)]
pub(crate) struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub(crate) fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub(crate) fn is_canceled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    /// Fails with [`Error::Canceled`] once cancellation was requested.
    pub(crate) fn check(&self) -> Result<()> {
        if self.is_canceled() {
            return Err(Error::Canceled);
        }
        Ok(())
    }
}

pub(crate) struct Operation {
    name: String,
    cancel: CancelToken,
    done: Receiver<()>,
    handle: Option<JoinHandle<()>>,
}

impl Operation {
    /// Spawns `body` on a new thread named `name`.
    pub(crate) fn spawn<F>(name: &str, body: F) -> Result<Self>
    where
        F: FnOnce(CancelToken) + Send + 'static,
    {
        let cancel = CancelToken::default();
        let (done_tx, done) = crossbeam_channel::bounded(1);
        let token = cancel.clone();
        let handle = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                body(token);
                let _ = done_tx.send(());
            })
            .map_err(|e| Error::ResourceExhausted(format!("{name} thread: {e}")))?;

        debug!("Operation {} started", name);
        Ok(Self {
            name: name.to_string(),
            cancel,
            done,
            handle: Some(handle),
        })
    }

    pub(crate) fn cancel(&self) {
        self.cancel.cancel();
    }

    pub(crate) fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|handle| !handle.is_finished())
    }

    /// Waits up to `timeout` for the operation to finish.
    ///
    /// Called from the operation's own thread it returns immediately. On
    /// timeout the operation keeps running and can be awaited again.
    ///
    /// # Errors
    ///
    /// [`Error::Timeout`] when the deadline elapses first.
    pub(crate) fn wait(&mut self, timeout: Duration) -> Result<()> {
        let Some(handle) = self.handle.take() else {
            return Ok(());
        };
        if handle.thread().id() == thread::current().id() {
            return Ok(());
        }

        match self.done.recv_timeout(timeout) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                if handle.join().is_err() {
                    error!("Operation {} panicked", self.name);
                }
                debug!("Operation {} finished", self.name);
                Ok(())
            }
            Err(RecvTimeoutError::Timeout) => {
                self.handle = Some(handle);
                Err(Error::Timeout)
            }
        }
    }
}

impl Drop for Operation {
    fn drop(&mut self) {
        if self.is_running() {
            debug!("Detaching unfinished operation {}", self.name);
            self.cancel();
        }
    }
}

impl std::fmt::Debug for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Operation")
            .field("name", &self.name)
            .field("running", &self.is_running())
            .field("canceled", &self.cancel.is_canceled())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wait_joins_a_finished_operation() {
        let mut operation = Operation::spawn("op-finish", |_| {}).unwrap();
        operation.wait(Duration::from_secs(5)).unwrap();
        assert!(!operation.is_running());
        // Waiting again is a no-op.
        operation.wait(Duration::from_millis(1)).unwrap();
    }

    #[test]
    fn cancellation_is_observed_by_the_body() {
        let (tx, rx) = crossbeam_channel::bounded(1);
        let mut operation = Operation::spawn("op-cancel", move |cancel| {
            while !cancel.is_canceled() {
                thread::sleep(Duration::from_millis(1));
            }
            let _ = tx.send(cancel.check());
        })
        .unwrap();

        operation.cancel();
        operation.wait(Duration::from_secs(5)).unwrap();
        assert_eq!(rx.recv().unwrap(), Err(Error::Canceled));
    }

    #[test]
    fn wait_times_out_and_can_be_retried() {
        let (release_tx, release_rx) = crossbeam_channel::bounded::<()>(1);
        let mut operation = Operation::spawn("op-slow", move |_| {
            let _ = release_rx.recv();
        })
        .unwrap();

        assert_eq!(operation.wait(Duration::from_millis(20)), Err(Error::Timeout));
        assert!(operation.is_running());

        release_tx.send(()).unwrap();
        operation.wait(Duration::from_secs(5)).unwrap();
    }
}
