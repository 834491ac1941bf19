// SPDX-FileCopyrightText: 2025 Contributors to the Capture Bridge project.
// SPDX-License-Identifier: Apache-2.0

//! Consumer side of the dispatch queue.
//!
//! A [`PayloadRouter`] owns an [`AsyncDispatchQueue`] of [`DispatchItem`]s.
//! Producers submit items from any thread; the dispatch worker demultiplexes
//! each one into exactly one [`RouterEvent`] and hands it to every subscriber.
//!
//! [`PayloadRouter::close`] stops accepting items, delivers the ones already
//! queued, and only then marks the router shut down. Items the worker picks up
//! after that point (possible when close is requested from a subscriber) are
//! released without notification.
//!
//! Subscribers run on the dispatch worker, never on the submitting thread.
//! A slow subscriber delays the release of payload envelopes and therefore
//! the return of producer credits, which throttles the producer.

use std::{
    any::Any,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
};

use tracing::{debug, trace, warn};

use crate::{
    AsyncDispatchQueue, Error, Result,
    config::PipelineConfig,
    media::{
        descriptor::{EncodingProfile, MediaDescriptor, MediaKind},
        properties::PropertySet,
    },
    payload::PayloadEnvelope,
};

/// One unit of work on the dispatch queue.
pub enum DispatchItem {
    /// An accepted media sample.
    Payload(PayloadEnvelope),
    /// The encoding profile of the session changed.
    Profile(EncodingProfile),
    /// Side metadata, for example a forwarded stream marker.
    Metadata(PropertySet),
    /// The format of one stream was (re)announced.
    Description {
        /// Stream the description belongs to.
        stream_id: u32,
        /// The stream's format.
        descriptor: Arc<MediaDescriptor>,
    },
    /// An item of a kind the router does not know. Dropped on delivery.
    Opaque(Box<dyn Any + Send>),
}

impl std::fmt::Debug for DispatchItem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DispatchItem::Payload(envelope) => f.debug_tuple("Payload").field(envelope).finish(),
            DispatchItem::Profile(profile) => f.debug_tuple("Profile").field(profile).finish(),
            DispatchItem::Metadata(properties) => f.debug_tuple("Metadata").field(properties).finish(),
            DispatchItem::Description { stream_id, descriptor } => f
                .debug_struct("Description")
                .field("stream_id", stream_id)
                .field("descriptor", descriptor)
                .finish(),
            DispatchItem::Opaque(_) => f.write_str("Opaque"),
        }
    }
}

/// Typed notification raised to subscribers.
#[derive(Debug)]
pub enum RouterEvent<'a> {
    /// The session's encoding profile changed.
    ProfileChanged(&'a EncodingProfile),
    /// An audio, video or container payload arrived.
    PayloadReceived(&'a PayloadEnvelope),
    /// Side metadata arrived.
    MetadataReceived(&'a PropertySet),
    /// A stream's format was announced.
    DescriptionChanged {
        /// Stream the description belongs to.
        stream_id: u32,
        /// The stream's format.
        descriptor: &'a MediaDescriptor,
    },
}

/// Identifies one subscription for [`PayloadRouter::unsubscribe`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SubscriptionToken(u64);

type Subscriber = Arc<dyn Fn(&RouterEvent<'_>) + Send + Sync>;

struct RouterShared {
    accepting: AtomicBool,
    shutdown: AtomicBool,
    next_token: AtomicU64,
    subscribers: Mutex<Vec<(SubscriptionToken, Subscriber)>>,
}

impl RouterShared {
    fn on_invoke(&self, item: DispatchItem) {
        if self.shutdown.load(Ordering::Acquire) {
            trace!("Router closed, dropping {:?}", item);
            return;
        }

        let subscribers: Vec<Subscriber> = match self.subscribers.lock() {
            Ok(subscribers) => subscribers.iter().map(|(_, s)| s.clone()).collect(),
            Err(_) => {
                warn!("Router subscriber list poisoned, dropping item");
                return;
            }
        };

        let event = match &item {
            DispatchItem::Payload(envelope) if envelope.kind() == MediaKind::Unknown => {
                trace!("Dropping payload of unknown kind from stream {}", envelope.stream_id());
                return;
            }
            DispatchItem::Payload(envelope) => RouterEvent::PayloadReceived(envelope),
            DispatchItem::Profile(profile) => RouterEvent::ProfileChanged(profile),
            DispatchItem::Metadata(properties) => RouterEvent::MetadataReceived(properties),
            DispatchItem::Description { stream_id, descriptor } => RouterEvent::DescriptionChanged {
                stream_id: *stream_id,
                descriptor,
            },
            DispatchItem::Opaque(_) => {
                trace!("Ignoring opaque dispatch item");
                return;
            }
        };

        for subscriber in &subscribers {
            subscriber(&event);
        }
    }
}

/// Demultiplexes dispatched items into typed subscriber notifications.
///
/// # Examples
///
/// ```
/// use std::sync::{Arc, Mutex};
/// use capture_media::{
///     PayloadRouter, RouterEvent,
///     config::PipelineConfig,
///     media::properties::PropertySet,
/// };
///
/// # fn main() -> Result<(), capture_media::Error> {
/// let router = PayloadRouter::new(&PipelineConfig::default())?;
/// let seen = Arc::new(Mutex::new(0));
/// let counter = seen.clone();
/// router.subscribe(move |event| {
///     if let RouterEvent::MetadataReceived(_) = event {
///         *counter.lock().unwrap() += 1;
///     }
/// });
///
/// router.submit_metadata(PropertySet::default())?;
/// router.close();
/// assert_eq!(*seen.lock().unwrap(), 1);
/// # Ok(())
/// # }
/// ```
pub struct PayloadRouter {
    shared: Arc<RouterShared>,
    queue: AsyncDispatchQueue<DispatchItem>,
}

impl PayloadRouter {
    /// Creates a router and starts its dispatch worker.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ResourceExhausted`] if the worker cannot be spawned.
    pub fn new(config: &PipelineConfig) -> Result<Self> {
        let shared = Arc::new(RouterShared {
            accepting: AtomicBool::new(true),
            shutdown: AtomicBool::new(false),
            next_token: AtomicU64::new(1),
            subscribers: Mutex::new(Vec::new()),
        });
        let worker_shared = shared.clone();
        let queue = AsyncDispatchQueue::new(&config.dispatch_thread_name, move |item| {
            worker_shared.on_invoke(item)
        })?;
        debug!("Payload router started on {}", config.dispatch_thread_name);

        Ok(Self { shared, queue })
    }

    /// Registers `subscriber` for every subsequent event.
    pub fn subscribe<F>(&self, subscriber: F) -> SubscriptionToken
    where
        F: Fn(&RouterEvent<'_>) + Send + Sync + 'static,
    {
        let token = SubscriptionToken(self.shared.next_token.fetch_add(1, Ordering::Relaxed));
        match self.shared.subscribers.lock() {
            Ok(mut subscribers) => subscribers.push((token, Arc::new(subscriber))),
            Err(_) => warn!("Router subscriber list poisoned, subscription {:?} lost", token),
        }
        token
    }

    /// Removes a subscription. Returns false if the token was not registered.
    ///
    /// A notification already in progress on the worker may still reach the
    /// removed subscriber.
    pub fn unsubscribe(&self, token: SubscriptionToken) -> bool {
        let Ok(mut subscribers) = self.shared.subscribers.lock() else {
            return false;
        };
        let before = subscribers.len();
        subscribers.retain(|(t, _)| *t != token);
        subscribers.len() != before
    }

    /// Queues any dispatch item.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ShutDown`] once the router is closed. The item is
    /// dropped in that case.
    pub fn enqueue(&self, item: DispatchItem) -> Result<()> {
        if !self.shared.accepting.load(Ordering::Acquire) {
            return Err(Error::ShutDown);
        }
        self.queue.enqueue(item)
    }

    /// Queues a payload envelope.
    pub fn submit(&self, envelope: PayloadEnvelope) -> Result<()> {
        self.enqueue(DispatchItem::Payload(envelope))
    }

    /// Queues a profile-changed notification.
    pub fn submit_profile(&self, profile: EncodingProfile) -> Result<()> {
        self.enqueue(DispatchItem::Profile(profile))
    }

    /// Queues side metadata.
    pub fn submit_metadata(&self, properties: PropertySet) -> Result<()> {
        self.enqueue(DispatchItem::Metadata(properties))
    }

    /// Queues a stream description announcement.
    pub fn submit_description(&self, stream_id: u32, descriptor: Arc<MediaDescriptor>) -> Result<()> {
        self.enqueue(DispatchItem::Description { stream_id, descriptor })
    }

    /// Returns true once [`Self::close`] has been called.
    pub fn is_closed(&self) -> bool {
        !self.shared.accepting.load(Ordering::Acquire)
    }

    /// Rejects new items, delivers the queued ones, then drops all
    /// subscribers.
    ///
    /// Called from a subscriber, it returns without waiting and the remaining
    /// items are released undelivered. Calling it again is a no-op.
    pub fn close(&self) {
        if !self.shared.accepting.swap(false, Ordering::AcqRel) {
            return;
        }
        self.queue.close();
        self.shared.shutdown.store(true, Ordering::Release);
        if let Ok(mut subscribers) = self.shared.subscribers.lock() {
            subscribers.clear();
        }
        debug!("Payload router closed");
    }
}

impl Drop for PayloadRouter {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::media::{
        descriptor::{AudioFormat, VideoFormat},
        properties,
        sample::MediaSample,
    };

    fn envelope(descriptor: MediaDescriptor, timestamp: i64) -> PayloadEnvelope {
        PayloadEnvelope::new(0, Arc::new(descriptor), MediaSample::new(timestamp, vec![1, 2, 3]))
    }

    fn recorder(router: &PayloadRouter) -> Arc<Mutex<Vec<String>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        router.subscribe(move |event| {
            let label = match event {
                RouterEvent::ProfileChanged(_) => "profile".to_string(),
                RouterEvent::PayloadReceived(envelope) => format!("payload@{}", envelope.timestamp()),
                RouterEvent::MetadataReceived(_) => "metadata".to_string(),
                RouterEvent::DescriptionChanged { stream_id, .. } => format!("description#{stream_id}"),
            };
            sink.lock().unwrap().push(label);
        });
        seen
    }

    #[test]
    fn items_map_to_one_event_each() {
        let router = PayloadRouter::new(&PipelineConfig::default()).unwrap();
        let seen = recorder(&router);

        router.submit_profile(EncodingProfile::default()).unwrap();
        router
            .submit(envelope(MediaDescriptor::Video(VideoFormat::bgra8(2, 2)), 10))
            .unwrap();
        router
            .submit(envelope(MediaDescriptor::Audio(AudioFormat::float_stereo()), 20))
            .unwrap();
        router.submit_metadata(PropertySet::default()).unwrap();
        router
            .submit_description(3, Arc::new(MediaDescriptor::Video(VideoFormat::bgra8(2, 2))))
            .unwrap();

        // Close drains, so everything above has been observed afterwards.
        router.close();

        assert_eq!(
            *seen.lock().unwrap(),
            vec!["profile", "payload@10", "payload@20", "metadata", "description#3"]
        );
    }

    #[test]
    fn unknown_and_opaque_items_are_ignored() {
        let router = PayloadRouter::new(&PipelineConfig::default()).unwrap();
        let seen = recorder(&router);

        router
            .submit(envelope(MediaDescriptor::Unknown { subtype: "x".into() }, 1))
            .unwrap();
        router.enqueue(DispatchItem::Opaque(Box::new(42u32))).unwrap();
        let mut marker = PropertySet::default();
        marker.insert(properties::MARKER_TYPE, "tick");
        router.submit_metadata(marker).unwrap();
        router.close();

        assert_eq!(*seen.lock().unwrap(), vec!["metadata"]);
    }

    #[test]
    fn every_subscriber_is_notified_until_unsubscribed() {
        let router = PayloadRouter::new(&PipelineConfig::default()).unwrap();
        let first = recorder(&router);
        let second = Arc::new(Mutex::new(0));
        let counter = second.clone();
        let token = router.subscribe(move |_| *counter.lock().unwrap() += 1);

        router.submit_metadata(PropertySet::default()).unwrap();
        let (tx, rx) = crossbeam_channel::bounded(1);
        router.subscribe(move |_| {
            let _ = tx.try_send(());
        });
        router.submit_metadata(PropertySet::default()).unwrap();
        rx.recv_timeout(Duration::from_secs(5)).unwrap();

        assert!(router.unsubscribe(token));
        assert!(!router.unsubscribe(token));
        router.submit_metadata(PropertySet::default()).unwrap();
        router.close();

        assert_eq!(first.lock().unwrap().len(), 3);
        assert_eq!(*second.lock().unwrap(), 2);
    }

    #[test]
    fn closed_router_rejects_and_stays_quiet() {
        let router = PayloadRouter::new(&PipelineConfig::default()).unwrap();
        let seen = recorder(&router);
        router.close();
        router.close();

        assert!(router.is_closed());
        assert_eq!(router.submit_metadata(PropertySet::default()), Err(Error::ShutDown));
        assert!(seen.lock().unwrap().is_empty());
    }

    #[test]
    fn invocation_after_close_request_is_a_no_op() {
        let router = PayloadRouter::new(&PipelineConfig::default()).unwrap();
        let seen = recorder(&router);
        router.shared.shutdown.store(true, Ordering::Release);
        router.shared.on_invoke(DispatchItem::Metadata(PropertySet::default()));
        assert!(seen.lock().unwrap().is_empty());
    }
}
