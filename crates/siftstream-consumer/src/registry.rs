//! Identifier → subscription bookkeeping with single-assignment completion.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use futures::future::{self, BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::oneshot;

use siftstream_core::{ConsumerError, StreamHash};

/// Lifecycle of one subscription.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionState {
    Pending,
    Subscribed,
    Unsubscribed,
}

/// Snapshot handed to callers when a subscription completes.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Subscription {
    pub hash: StreamHash,
    pub state: SubscriptionState,
}

pub type SubscriptionResult = Result<Subscription, ConsumerError>;

/// Cloneable completion future. Every clone observes the same outcome.
pub type SubscriptionFuture = Shared<BoxFuture<'static, SubscriptionResult>>;

/// A future that is already complete.
pub fn ready(result: SubscriptionResult) -> SubscriptionFuture {
    future::ready(result).boxed().shared()
}

struct Entry {
    subscription: Subscription,
    // Taken on first resolve/reject so completion happens once.
    completer: Option<oneshot::Sender<SubscriptionResult>>,
    future: SubscriptionFuture,
    // Whether a subscribe message for this entry has reached the transport.
    announced: bool,
}

impl Entry {
    fn pending(hash: StreamHash) -> Self {
        let (tx, rx) = oneshot::channel();
        let future = rx
            .map(|received| received.unwrap_or(Err(ConsumerError::Cancelled)))
            .boxed()
            .shared();
        Self {
            subscription: Subscription {
                hash,
                state: SubscriptionState::Pending,
            },
            completer: Some(tx),
            future,
            announced: false,
        }
    }

    fn complete(&mut self, result: SubscriptionResult) {
        if let Some(tx) = self.completer.take() {
            let _ = tx.send(result);
        }
    }
}

/// Registry shared between the consumer and its transport's path builder.
pub type SharedRegistry = Arc<Mutex<Registry>>;

/// At most one entry per hash. A second subscribe for a known hash gets the
/// existing future back.
#[derive(Default)]
pub struct Registry {
    entries: HashMap<StreamHash, Entry>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared() -> SharedRegistry {
        Arc::new(Mutex::new(Self::new()))
    }

    /// Returns the hash's future and whether a new pending entry was created.
    pub fn insert_pending(&mut self, hash: &StreamHash) -> (SubscriptionFuture, bool) {
        if let Some(entry) = self.entries.get(hash) {
            return (entry.future.clone(), false);
        }
        let entry = Entry::pending(hash.clone());
        let future = entry.future.clone();
        self.entries.insert(hash.clone(), entry);
        (future, true)
    }

    /// Remove an entry, returning its final `Unsubscribed` snapshot.
    ///
    /// A still-pending future is completed with that snapshot.
    pub fn remove(&mut self, hash: &StreamHash) -> Option<Subscription> {
        let mut entry = self.entries.remove(hash)?;
        entry.subscription.state = SubscriptionState::Unsubscribed;
        let snapshot = entry.subscription.clone();
        entry.complete(Ok(snapshot.clone()));
        Some(snapshot)
    }

    /// Mark subscribed and resolve. Returns false when the hash is unknown.
    pub fn resolve(&mut self, hash: &StreamHash) -> bool {
        let Some(entry) = self.entries.get_mut(hash) else {
            return false;
        };
        entry.subscription.state = SubscriptionState::Subscribed;
        let snapshot = entry.subscription.clone();
        entry.complete(Ok(snapshot));
        true
    }

    /// Reject and drop the entry. Returns false when the hash is unknown.
    pub fn reject(&mut self, hash: &StreamHash, message: &str) -> bool {
        let Some(mut entry) = self.entries.remove(hash) else {
            return false;
        };
        entry.complete(Err(ConsumerError::SubscriptionRejected {
            hash: hash.to_string(),
            message: message.to_string(),
        }));
        true
    }

    /// Put every entry back to pending and return their hashes.
    ///
    /// Entries count as unannounced until [`Registry::mark_announced`].
    pub fn mark_all_pending(&mut self) -> Vec<StreamHash> {
        self.entries
            .values_mut()
            .map(|entry| {
                entry.subscription.state = SubscriptionState::Pending;
                entry.announced = false;
                entry.subscription.hash.clone()
            })
            .collect()
    }

    /// Record that the subscribe message for `hash` was written.
    pub fn mark_announced(&mut self, hash: &StreamHash) {
        if let Some(entry) = self.entries.get_mut(hash) {
            entry.announced = true;
        }
    }

    /// Pending hashes whose subscribe message has not been written yet.
    pub fn unannounced(&self) -> Vec<StreamHash> {
        let mut hashes: Vec<StreamHash> = self
            .entries
            .values()
            .filter(|e| !e.announced && e.subscription.state == SubscriptionState::Pending)
            .map(|e| e.subscription.hash.clone())
            .collect();
        hashes.sort();
        hashes
    }

    /// Drop every entry. Pending futures complete with `Cancelled`.
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// `(desired - current, current - desired)`, duplicates in `desired` ignored.
    pub fn diff(&self, desired: &[StreamHash]) -> (Vec<StreamHash>, Vec<StreamHash>) {
        let mut seen = HashSet::new();
        let to_subscribe = desired
            .iter()
            .filter(|h| !self.entries.contains_key(*h) && seen.insert(*h))
            .cloned()
            .collect();

        let wanted: HashSet<&StreamHash> = desired.iter().collect();
        let to_unsubscribe = self
            .entries
            .keys()
            .filter(|h| !wanted.contains(h))
            .cloned()
            .collect();

        (to_subscribe, to_unsubscribe)
    }

    pub fn get(&self, hash: &StreamHash) -> Option<&Subscription> {
        self.entries.get(hash).map(|e| &e.subscription)
    }

    pub fn contains(&self, hash: &StreamHash) -> bool {
        self.entries.contains_key(hash)
    }

    pub fn hashes(&self) -> Vec<StreamHash> {
        self.entries.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::FutureExt;

    fn hash(c: char) -> StreamHash {
        StreamHash::parse(&c.to_string().repeat(32)).unwrap()
    }

    #[test]
    fn second_insert_returns_existing_future() {
        let mut registry = Registry::new();
        let a = hash('a');

        let (first, created) = registry.insert_pending(&a);
        assert!(created);
        let (second, created_again) = registry.insert_pending(&a);
        assert!(!created_again);
        assert_eq!(registry.len(), 1);

        assert!(registry.resolve(&a));
        let one = first.now_or_never().unwrap().unwrap();
        let two = second.now_or_never().unwrap().unwrap();
        assert_eq!(one, two);
        assert_eq!(one.state, SubscriptionState::Subscribed);
    }

    #[test]
    fn resolve_only_completes_once() {
        let mut registry = Registry::new();
        let a = hash('a');
        let (fut, _) = registry.insert_pending(&a);

        assert!(registry.resolve(&a));
        assert!(registry.reject(&a, "late"));
        let result = fut.now_or_never().unwrap();
        assert!(result.is_ok());
        assert!(!registry.contains(&a));
    }

    #[test]
    fn reject_removes_entry() {
        let mut registry = Registry::new();
        let a = hash('a');
        let (fut, _) = registry.insert_pending(&a);

        assert!(registry.reject(&a, "The hash doesn't exist"));
        assert!(registry.is_empty());
        let err = fut.now_or_never().unwrap().unwrap_err();
        assert!(matches!(err, ConsumerError::SubscriptionRejected { .. }));
    }

    #[test]
    fn unknown_hash_is_ignored() {
        let mut registry = Registry::new();
        assert!(!registry.resolve(&hash('a')));
        assert!(!registry.reject(&hash('a'), "x"));
        assert!(registry.remove(&hash('a')).is_none());
    }

    #[test]
    fn remove_marks_unsubscribed() {
        let mut registry = Registry::new();
        let a = hash('a');
        let (fut, _) = registry.insert_pending(&a);

        let removed = registry.remove(&a).unwrap();
        assert_eq!(removed.state, SubscriptionState::Unsubscribed);
        assert!(registry.is_empty());
        assert_eq!(fut.now_or_never().unwrap().unwrap(), removed);
    }

    #[test]
    fn clear_cancels_pending() {
        let mut registry = Registry::new();
        let (fut, _) = registry.insert_pending(&hash('a'));
        registry.clear();
        let err = fut.now_or_never().unwrap().unwrap_err();
        assert!(matches!(err, ConsumerError::Cancelled));
    }

    #[test]
    fn diff_computes_both_directions() {
        let mut registry = Registry::new();
        let (a, b, c) = (hash('a'), hash('b'), hash('c'));
        registry.insert_pending(&a);
        registry.insert_pending(&b);

        let (sub, unsub) = registry.diff(&[a.clone(), c.clone(), c.clone()]);
        assert_eq!(sub, vec![c]);
        assert_eq!(unsub, vec![b]);
    }

    #[test]
    fn diff_against_empty_desired() {
        let mut registry = Registry::new();
        registry.insert_pending(&hash('a'));
        registry.insert_pending(&hash('b'));

        let (sub, mut unsub) = registry.diff(&[]);
        unsub.sort();
        assert!(sub.is_empty());
        assert_eq!(unsub, vec![hash('a'), hash('b')]);
    }

    #[test]
    fn mark_all_pending_keeps_entries() {
        let mut registry = Registry::new();
        let a = hash('a');
        registry.insert_pending(&a);
        registry.resolve(&a);

        let hashes = registry.mark_all_pending();
        assert_eq!(hashes, vec![a.clone()]);
        assert_eq!(registry.get(&a).unwrap().state, SubscriptionState::Pending);
    }

    #[test]
    fn unannounced_lists_pending_until_written() {
        let mut registry = Registry::new();
        let (a, b) = (hash('a'), hash('b'));
        registry.insert_pending(&b);
        registry.insert_pending(&a);
        assert_eq!(registry.unannounced(), vec![a.clone(), b.clone()]);

        registry.mark_announced(&a);
        registry.resolve(&b);
        assert!(registry.unannounced().is_empty());

        registry.mark_all_pending();
        assert_eq!(registry.unannounced(), vec![a, b]);
    }
}
