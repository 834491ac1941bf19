// SPDX-FileCopyrightText: 2025 Contributors to the Capture Bridge project.
// SPDX-License-Identifier: Apache-2.0

//! Serial background work queue.
//!
//! [`AsyncDispatchQueue`] hands every enqueued item to one invocation callback
//! on a dedicated worker thread, one item at a time and in submission order.
//!
//! ## Close semantics
//!
//! [`AsyncDispatchQueue::close`] stops accepting new items and then drains:
//! every item enqueued before the close is still delivered before the worker
//! exits. Closing from inside the callback is allowed; in that case the
//! worker finishes the drain on its own and is not joined.

use std::{
    sync::Mutex,
    thread::{self, JoinHandle, ThreadId},
};

use crossbeam_channel::{Receiver, Sender};
use tracing::{debug, error, trace};

use crate::{Error, Result};

enum Work<T> {
    Item(T),
    Close,
}

struct QueueState<T> {
    sender: Option<Sender<Work<T>>>,
    worker: Option<JoinHandle<()>>,
}

/// Serial work queue backed by one worker thread.
///
/// # Examples
///
/// ```
/// use std::sync::{Arc, Mutex};
/// use capture_media::AsyncDispatchQueue;
///
/// # fn main() -> Result<(), capture_media::Error> {
/// let seen = Arc::new(Mutex::new(Vec::new()));
/// let sink = seen.clone();
/// let queue = AsyncDispatchQueue::new("doc-queue", move |item: u32| {
///     sink.lock().unwrap().push(item);
/// })?;
///
/// queue.enqueue(1)?;
/// queue.enqueue(2)?;
/// queue.close();
///
/// assert_eq!(*seen.lock().unwrap(), vec![1, 2]);
/// assert!(queue.enqueue(3).is_err());
/// # Ok(())
/// # }
/// ```
pub struct AsyncDispatchQueue<T: Send + 'static> {
    state: Mutex<QueueState<T>>,
    worker_id: ThreadId,
    name: String,
}

impl<T: Send + 'static> AsyncDispatchQueue<T> {
    /// Starts a queue whose worker thread calls `callback` once per item.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ResourceExhausted`] if the worker thread cannot be spawned.
    pub fn new<F>(name: &str, callback: F) -> Result<Self>
    where
        F: Fn(T) + Send + 'static,
    {
        let (sender, receiver) = crossbeam_channel::unbounded();
        let worker = thread::Builder::new()
            .name(name.to_owned())
            .spawn(move || run_worker(receiver, callback))
            .map_err(|e| Error::ResourceExhausted(format!("dispatch worker: {e}")))?;
        let worker_id = worker.thread().id();

        Ok(Self {
            state: Mutex::new(QueueState {
                sender: Some(sender),
                worker: Some(worker),
            }),
            worker_id,
            name: name.to_owned(),
        })
    }

    /// Queues `item` for delivery.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ShutDown`] once the queue is closed.
    pub fn enqueue(&self, item: T) -> Result<()> {
        let state = self.state.lock().map_err(|_| Error::poisoned("dispatch queue"))?;
        let sender = state.sender.as_ref().ok_or(Error::ShutDown)?;
        sender.send(Work::Item(item)).map_err(|_| Error::ShutDown)
    }

    /// Returns true once [`Self::close`] has been called.
    pub fn is_closed(&self) -> bool {
        self.state
            .lock()
            .map(|state| state.sender.is_none())
            .unwrap_or(true)
    }

    /// Stops accepting items and drains the ones already queued.
    ///
    /// Blocks until the worker has delivered the remaining items, unless
    /// called from the worker itself. Calling it again is a no-op.
    pub fn close(&self) {
        let worker = {
            let Ok(mut state) = self.state.lock() else {
                error!("Dispatch queue {} lock poisoned during close", self.name);
                return;
            };
            let Some(sender) = state.sender.take() else {
                return;
            };
            if sender.send(Work::Close).is_err() {
                debug!("Dispatch worker {} already gone", self.name);
            }
            state.worker.take()
        };

        if thread::current().id() == self.worker_id {
            return;
        }
        if let Some(worker) = worker
            && worker.join().is_err()
        {
            error!("Dispatch worker {} panicked", self.name);
        }
    }
}

impl<T: Send + 'static> Drop for AsyncDispatchQueue<T> {
    fn drop(&mut self) {
        self.close();
    }
}

fn run_worker<T, F>(receiver: Receiver<Work<T>>, callback: F)
where
    F: Fn(T),
{
    while let Ok(work) = receiver.recv() {
        match work {
            Work::Item(item) => callback(item),
            Work::Close => break,
        }
    }
    trace!("Dispatch worker exiting");
}

#[cfg(test)]
mod tests {
    use std::{
        sync::{Arc, atomic::AtomicBool, atomic::Ordering},
        time::Duration,
    };

    use super::*;

    #[test]
    fn delivers_in_submission_order() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let queue = AsyncDispatchQueue::new("order", move |item: usize| {
            sink.lock().unwrap().push(item);
        })
        .unwrap();

        for item in 0..100 {
            queue.enqueue(item).unwrap();
        }
        queue.close();

        assert_eq!(*seen.lock().unwrap(), (0..100).collect::<Vec<_>>());
    }

    #[test]
    fn close_drains_queued_items() {
        let (gate_tx, gate_rx) = crossbeam_channel::bounded::<()>(0);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let queue = AsyncDispatchQueue::new("drain", move |item: u32| {
            if item == 0 {
                let _ = gate_rx.recv_timeout(Duration::from_secs(5));
            }
            sink.lock().unwrap().push(item);
        })
        .unwrap();

        queue.enqueue(0).unwrap();
        queue.enqueue(1).unwrap();
        queue.enqueue(2).unwrap();
        gate_tx.send(()).unwrap();
        queue.close();

        assert_eq!(*seen.lock().unwrap(), vec![0, 1, 2]);
    }

    #[test]
    fn close_is_idempotent_and_rejects_new_items() {
        let queue = AsyncDispatchQueue::new("idempotent", |_: u8| {}).unwrap();
        queue.close();
        queue.close();
        assert!(queue.is_closed());
        assert_eq!(queue.enqueue(1), Err(Error::ShutDown));
    }

    #[test]
    fn callback_runs_off_the_caller_thread() {
        let caller = thread::current().id();
        let same_thread = Arc::new(AtomicBool::new(true));
        let flag = same_thread.clone();
        let queue = AsyncDispatchQueue::new("thread", move |_: ()| {
            flag.store(thread::current().id() == caller, Ordering::SeqCst);
        })
        .unwrap();
        queue.enqueue(()).unwrap();
        queue.close();
        assert!(!same_thread.load(Ordering::SeqCst));
    }

    #[test]
    fn callback_may_enqueue_and_close() {
        let slot: Arc<Mutex<Option<Arc<AsyncDispatchQueue<u32>>>>> = Arc::new(Mutex::new(None));
        let seen = Arc::new(Mutex::new(Vec::new()));
        let (done_tx, done_rx) = crossbeam_channel::bounded(1);

        let queue_slot = slot.clone();
        let sink = seen.clone();
        let queue = Arc::new(
            AsyncDispatchQueue::new("reentrant", move |item: u32| {
                sink.lock().unwrap().push(item);
                let queue = queue_slot.lock().unwrap().clone();
                if let Some(queue) = queue {
                    if item == 0 {
                        queue.enqueue(1).unwrap();
                    } else {
                        queue.close();
                        let _ = done_tx.send(());
                    }
                }
            })
            .unwrap(),
        );
        *slot.lock().unwrap() = Some(queue.clone());

        queue.enqueue(0).unwrap();
        done_rx.recv_timeout(Duration::from_secs(5)).unwrap();

        assert_eq!(*seen.lock().unwrap(), vec![0, 1]);
        assert!(queue.is_closed());
        slot.lock().unwrap().take();
    }
}
