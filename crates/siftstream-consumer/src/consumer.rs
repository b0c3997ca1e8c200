use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use siftstream_core::wire::ControlMessage;
use siftstream_core::{ConsumerError, ConsumerEvent, StreamHash, Transport, TransportEvent};

use crate::config::ConsumerConfig;
use crate::framer::LineFramer;
use crate::registry::{self, SharedRegistry, Subscription, SubscriptionFuture};
use crate::router::{self, RouteAction};
use crate::watchdog::Watchdog;

/// Subscribe/unsubscribe front end over one multiplexed stream.
///
/// Inbound chunks arrive on one unbounded channel and are framed and routed
/// on a single listener task, so registry transitions happen strictly in
/// delimiter order. Subscribe and unsubscribe return immediately; subscribe
/// futures complete when the server's status record for that hash arrives.
pub struct StreamConsumer<T: Transport> {
    inner: Arc<Inner<T>>,
}

impl<T: Transport> Clone for StreamConsumer<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

struct Inner<T: Transport> {
    transport: T,
    registry: SharedRegistry,
    framer: Mutex<LineFramer>,
    events: broadcast::Sender<ConsumerEvent>,
    watchdog: Watchdog,
    // Some while a listener is attached to the transport.
    listener: Mutex<Option<JoinHandle<()>>>,
    // Set while a background start is in flight.
    starting: AtomicBool,
}

impl<T: Transport> StreamConsumer<T> {
    /// Must be called from within a tokio runtime.
    pub fn new(transport: T, config: &ConsumerConfig) -> Self {
        Self::with_registry(transport, registry::Registry::shared(), config)
    }

    /// Use a registry that is also visible to the transport, so reconnects
    /// can carry the currently known hashes in the connect path.
    pub fn with_registry(transport: T, registry: SharedRegistry, config: &ConsumerConfig) -> Self {
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        let timeout = config.interaction_timeout();

        let inner = Arc::new_cyclic(|weak: &Weak<Inner<T>>| {
            let weak = weak.clone();
            let watchdog = Watchdog::spawn(timeout, move || {
                let weak = weak.clone();
                async move {
                    if let Some(inner) = weak.upgrade() {
                        let _ = inner.recycle().await;
                    }
                }
            });
            Inner {
                transport,
                registry,
                framer: Mutex::new(LineFramer::new()),
                events,
                watchdog,
                listener: Mutex::new(None),
                starting: AtomicBool::new(false),
            }
        });

        Self { inner }
    }

    /// Receive outward events. Each receiver sees every event sent after it subscribed.
    pub fn events(&self) -> broadcast::Receiver<ConsumerEvent> {
        self.inner.events.subscribe()
    }

    pub fn transport(&self) -> &T {
        &self.inner.transport
    }

    pub fn registry(&self) -> SharedRegistry {
        Arc::clone(&self.inner.registry)
    }

    /// Current snapshot for `hash`, if tracked.
    pub fn subscription(&self, hash: &StreamHash) -> Option<Subscription> {
        self.inner.registry.lock().get(hash).cloned()
    }

    /// Track `hash` and ask the server to start sending it.
    ///
    /// Repeated calls for a tracked hash return the same future and send
    /// nothing. If the transport is not running it is started in the
    /// background and the control message is written once it is up.
    pub fn subscribe(&self, hash: &str) -> Result<SubscriptionFuture, ConsumerError> {
        let hash = StreamHash::parse(hash)?;
        let future = self.inner.subscribe_hash(&hash);
        self.ensure_started();
        Ok(future)
    }

    /// Stop tracking `hash`. Completes immediately without waiting for the server.
    pub fn unsubscribe(&self, hash: &str) -> Result<Subscription, ConsumerError> {
        let hash = StreamHash::parse(hash).map_err(|_| ConsumerError::UnknownHash(hash.to_string()))?;
        self.inner.unsubscribe_hash(&hash)
    }

    /// Make the tracked set equal `desired`.
    ///
    /// Returns the subscribe futures (in `desired` order, malformed hashes
    /// as immediate failures) followed by the unsubscribe results. Starts
    /// the transport in the background if it is not running.
    pub fn reconcile<S: AsRef<str>>(&self, desired: &[S]) -> Vec<SubscriptionFuture> {
        self.inner.watchdog.rearm();

        let parsed: Vec<Result<StreamHash, ConsumerError>> =
            desired.iter().map(|raw| StreamHash::parse(raw.as_ref())).collect();
        let wanted: Vec<StreamHash> = parsed.iter().filter_map(|r| r.as_ref().ok().cloned()).collect();

        let (to_subscribe, to_unsubscribe) = self.inner.registry.lock().diff(&wanted);

        let unsubscribed: Vec<SubscriptionFuture> = to_unsubscribe
            .iter()
            .map(|hash| registry::ready(self.inner.unsubscribe_hash(hash)))
            .collect();

        let mut remaining: HashSet<StreamHash> = to_subscribe.into_iter().collect();
        let mut futures: Vec<SubscriptionFuture> = Vec::with_capacity(parsed.len() + unsubscribed.len());
        for result in parsed {
            match result {
                Ok(hash) => {
                    if remaining.remove(&hash) {
                        futures.push(self.inner.subscribe_hash(&hash));
                    }
                }
                Err(e) => futures.push(registry::ready(Err(e))),
            }
        }
        futures.extend(unsubscribed);

        self.ensure_started();
        futures
    }

    /// Attach to the transport (once) and start it, then write any
    /// subscribe messages that could not be sent before.
    pub async fn start(&self) -> Result<(), ConsumerError> {
        self.inner.attach_listener();
        self.inner.transport.start().await?;
        self.inner.announce_pending();
        Ok(())
    }

    /// Drop all subscriptions, send a stop request and stop the transport.
    ///
    /// Pending subscribe futures complete with [`ConsumerError::Cancelled`].
    pub async fn shutdown(&self) -> Result<(), ConsumerError> {
        if let Some(handle) = self.inner.listener.lock().take() {
            handle.abort();
        }
        self.inner.registry.lock().clear();
        self.inner.framer.lock().clear();
        self.inner.watchdog.cancel();

        if let Err(e) = self.inner.transport.write(&ControlMessage::Stop.to_json()) {
            debug!(error = %e, "stop message not sent");
        }
        self.inner.transport.stop().await?;
        info!("stream consumer shut down");
        Ok(())
    }

    /// Stop and reconnect the transport now, then resubscribe every known hash.
    pub async fn recycle(&self) -> Result<(), ConsumerError> {
        self.inner.recycle().await
    }

    /// Whether a listener is currently attached to the transport.
    pub fn is_listening(&self) -> bool {
        self.inner.listener.lock().is_some()
    }

    fn ensure_started(&self) {
        if self.inner.transport.started() || self.inner.starting.swap(true, Ordering::SeqCst) {
            return;
        }
        let consumer = self.clone();
        tokio::spawn(async move {
            let result = consumer.start().await;
            consumer.inner.starting.store(false, Ordering::SeqCst);
            if let Err(e) = result {
                consumer.inner.report("failed to start", &e);
            }
        });
    }
}

async fn listen<T: Transport>(inner: Weak<Inner<T>>, mut rx: mpsc::UnboundedReceiver<TransportEvent>) {
    while let Some(event) = rx.recv().await {
        let Some(inner) = inner.upgrade() else {
            break;
        };
        inner.on_transport_event(event);
    }
    debug!("transport event channel closed");
}

impl<T: Transport> Inner<T> {
    fn emit(&self, event: ConsumerEvent) {
        match &event {
            ConsumerEvent::Error { message } => error!(detail = %message, "stream error"),
            ConsumerEvent::Warning { message, .. } => warn!(detail = %message, "stream warning"),
            ConsumerEvent::Debug { message } => debug!("{message}"),
            ConsumerEvent::Recycle => info!("connection recycled"),
            other => tracing::trace!(event = other.event_type(), "stream event"),
        }
        let _ = self.events.send(event);
    }

    /// Surface a local failure as an `error` event.
    fn report(&self, context: &str, err: &ConsumerError) {
        error!(kind = err.error_kind(), error = %err, "{context}");
        let _ = self.events.send(ConsumerEvent::error(format!("{context}: {err}")));
    }

    fn attach_listener(self: &Arc<Self>) {
        let mut listener = self.listener.lock();
        if listener.is_some() {
            return;
        }
        let (tx, rx) = mpsc::unbounded_channel();
        self.transport.attach(tx);
        *listener = Some(tokio::spawn(listen(Arc::downgrade(self), rx)));
    }

    /// Returns whether the message reached the transport.
    fn write_control(&self, message: &ControlMessage) -> bool {
        if !self.transport.started() {
            return false;
        }
        match self.transport.write(&message.to_json()) {
            Ok(()) => true,
            Err(e) => {
                warn!(error = %e, "failed to write control message");
                false
            }
        }
    }

    fn subscribe_hash(&self, hash: &StreamHash) -> SubscriptionFuture {
        let mut registry = self.registry.lock();
        let (future, created) = registry.insert_pending(hash);
        if created {
            debug!(hash = %hash, "subscribing");
            if self.write_control(&ControlMessage::Subscribe { hash: hash.clone() }) {
                registry.mark_announced(hash);
            }
        }
        future
    }

    fn unsubscribe_hash(&self, hash: &StreamHash) -> Result<Subscription, ConsumerError> {
        let mut registry = self.registry.lock();
        if !registry.contains(hash) {
            return Err(ConsumerError::UnknownHash(hash.to_string()));
        }
        debug!(hash = %hash, "unsubscribing");
        self.write_control(&ControlMessage::Unsubscribe { hash: hash.clone() });
        registry
            .remove(hash)
            .ok_or_else(|| ConsumerError::UnknownHash(hash.to_string()))
    }

    /// Write subscribe messages for pending hashes that have not been sent yet.
    fn announce_pending(&self) {
        let mut registry = self.registry.lock();
        for hash in registry.unannounced() {
            if !self.write_control(&ControlMessage::Subscribe { hash: hash.clone() }) {
                break;
            }
            registry.mark_announced(&hash);
        }
    }

    /// Return every entry to pending and ask for all of them again.
    fn resubscribe(&self) {
        let count = self.registry.lock().mark_all_pending().len();
        info!(count, "resubscribing");
        self.announce_pending();
    }

    fn on_transport_event(self: &Arc<Self>, event: TransportEvent) {
        match event {
            TransportEvent::Data(chunk) => {
                let records = self.framer.lock().feed(&chunk);
                for record in records {
                    match record {
                        Ok(value) => self.handle_record(value),
                        Err(e) => self.emit(ConsumerEvent::warning(e.to_string())),
                    }
                }
            }
            TransportEvent::End { status } => {
                let status = status.map_or_else(|| "none".to_string(), |s| s.to_string());
                self.emit(ConsumerEvent::warning(format!(
                    "end event received with status code {status}"
                )));
                self.framer.lock().clear();
            }
            TransportEvent::Recovered { reason } => {
                self.emit(ConsumerEvent::debug(format!("recovered from {reason}")));
                self.announce_pending();
            }
        }
    }

    fn handle_record(self: &Arc<Self>, record: serde_json::Value) {
        let routed = {
            let mut registry = self.registry.lock();
            router::route(record, &mut registry)
        };

        match routed.action {
            Some(RouteAction::RearmWatchdog) => self.watchdog.rearm(),
            Some(RouteAction::RecoverAndResubscribe(failure)) => {
                warn!(kind = failure.error_kind(), error = %failure, "recovering after server failure");
                let inner = Arc::clone(self);
                tokio::spawn(async move {
                    match inner.transport.recover().await {
                        Ok(()) => inner.resubscribe(),
                        Err(e) => inner.report("failed to recover", &e.into()),
                    }
                });
            }
            None => {}
        }

        for event in routed.events {
            self.emit(event);
        }
    }

    async fn recycle(&self) -> Result<(), ConsumerError> {
        self.emit(ConsumerEvent::debug("recycling connection"));

        let result = match self.transport.stop().await {
            Ok(()) => self.transport.recover().await,
            Err(e) => Err(e),
        };

        match result {
            Ok(()) => {
                self.resubscribe();
                self.emit(ConsumerEvent::Recycle);
                Ok(())
            }
            Err(e) => {
                self.report("failed to reconnect", &e.clone().into());
                Err(ConsumerError::RecycleFailed(e.to_string()))
            }
        }
    }
}
