//! Classifies decoded records and applies their registry transitions.
//!
//! Hash extraction from status messages depends on the server's free-text
//! wording; the patterns below must track it exactly.

use std::sync::LazyLock;

use regex::Regex;
use serde_json::Value;

use siftstream_core::wire::STOP_ACKNOWLEDGEMENT;
use siftstream_core::{ConsumerError, ConsumerEvent, StreamHash};

use crate::registry::Registry;

static SUBSCRIBED: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)successfully subscribed to hash (\S+)").expect("valid subscribed pattern")
});

static MISSING: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)the hash (\S+) doesn't exist").expect("valid missing pattern")
});

/// Shape of one inbound record, in priority order.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RecordKind {
    Failure,
    Success,
    Warning,
    Delete,
    Tick,
    Interaction,
    Unknown,
}

/// Side effect the caller must carry out after routing a record.
#[derive(Clone, Debug)]
pub enum RouteAction {
    RearmWatchdog,
    /// Recover the transport, then resubscribe every known hash.
    RecoverAndResubscribe(ConsumerError),
}

#[derive(Debug, Default)]
pub struct Routed {
    pub events: Vec<ConsumerEvent>,
    pub action: Option<RouteAction>,
}

/// First match wins.
pub fn classify(record: &Value) -> RecordKind {
    match record.get("status").and_then(Value::as_str) {
        Some("failure") => return RecordKind::Failure,
        Some("success") => return RecordKind::Success,
        Some("warning") => return RecordKind::Warning,
        _ => {}
    }

    let data = record.get("data");
    if data.and_then(|d| d.get("deleted")).and_then(Value::as_bool) == Some(true) {
        RecordKind::Delete
    } else if record.get("tick").is_some() {
        RecordKind::Tick
    } else if data.and_then(|d| d.get("interaction")).is_some() {
        RecordKind::Interaction
    } else {
        RecordKind::Unknown
    }
}

/// Hash named in a "successfully subscribed to hash ..." message.
pub fn subscribed_hash(message: &str) -> Option<StreamHash> {
    capture_hash(&SUBSCRIBED, message)
}

/// Hash named in a "the hash ... doesn't exist" message.
pub fn missing_hash(message: &str) -> Option<StreamHash> {
    capture_hash(&MISSING, message)
}

fn capture_hash(pattern: &Regex, message: &str) -> Option<StreamHash> {
    let captured = pattern.captures(message)?.get(1)?;
    StreamHash::parse(captured.as_str()).ok()
}

fn message_of(record: &Value) -> String {
    record
        .get("message")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

/// Route one record: update the registry and collect outward events.
pub fn route(record: Value, registry: &mut Registry) -> Routed {
    let mut routed = Routed::default();

    match classify(&record) {
        RecordKind::Failure => {
            let message = message_of(&record);
            if message != STOP_ACKNOWLEDGEMENT {
                routed.action = Some(RouteAction::RecoverAndResubscribe(ConsumerError::ServerFailure(
                    message.clone(),
                )));
            }
            routed.events.push(ConsumerEvent::Error { message });
        }
        RecordKind::Success => {
            let message = message_of(&record);
            if let Some(hash) = subscribed_hash(&message) {
                if registry.resolve(&hash) {
                    tracing::debug!(hash = %hash, "subscription confirmed");
                }
            }
            routed.events.push(ConsumerEvent::Success { message, record });
        }
        RecordKind::Warning => {
            let message = message_of(&record);
            if let Some(hash) = missing_hash(&message) {
                if registry.reject(&hash, &message) {
                    tracing::debug!(hash = %hash, "subscription rejected");
                }
            }
            routed.events.push(ConsumerEvent::Warning {
                message,
                record: Some(record),
            });
        }
        RecordKind::Delete => {
            routed.action = Some(RouteAction::RearmWatchdog);
            routed.events.push(ConsumerEvent::Delete { record });
        }
        RecordKind::Tick => {
            routed.action = Some(RouteAction::RearmWatchdog);
            routed.events.push(ConsumerEvent::Tick { record });
        }
        RecordKind::Interaction => {
            routed.action = Some(RouteAction::RearmWatchdog);
            routed.events.push(ConsumerEvent::Interaction { record });
        }
        RecordKind::Unknown => {
            routed.events.push(ConsumerEvent::UnknownEvent { record });
        }
    }

    routed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::SubscriptionState;
    use futures::FutureExt;
    use serde_json::json;
    use siftstream_core::ConsumerError;

    const HASH: &str = "69ec6f20f05f513e3b144b90fecc2e3f";

    fn hash() -> StreamHash {
        StreamHash::parse(HASH).unwrap()
    }

    #[test]
    fn classification_priority() {
        assert_eq!(classify(&json!({"status": "failure", "tick": 1})), RecordKind::Failure);
        assert_eq!(classify(&json!({"status": "success"})), RecordKind::Success);
        assert_eq!(classify(&json!({"status": "warning"})), RecordKind::Warning);
        assert_eq!(
            classify(&json!({"tick": 1, "data": {"deleted": true, "interaction": {}}})),
            RecordKind::Delete
        );
        assert_eq!(classify(&json!({"tick": 1, "data": {"interaction": {}}})), RecordKind::Tick);
        assert_eq!(classify(&json!({"data": {"interaction": {}}})), RecordKind::Interaction);
        assert_eq!(classify(&json!({"data": {"deleted": false}})), RecordKind::Unknown);
        assert_eq!(classify(&json!({"status": "connected"})), RecordKind::Unknown);
        assert_eq!(classify(&json!([1, 2])), RecordKind::Unknown);
    }

    #[test]
    fn extracts_hashes_case_insensitively() {
        let msg = format!("Successfully subscribed to hash {}", HASH.to_uppercase());
        assert_eq!(subscribed_hash(&msg), Some(hash()));
        let msg = format!("The hash {HASH} doesn't exist");
        assert_eq!(missing_hash(&msg), Some(hash()));
        assert_eq!(missing_hash("the HASH abc123 doesn't exist"), None);
        assert_eq!(subscribed_hash("subscribed somewhere else"), None);
    }

    #[test]
    fn success_resolves_pending_subscription() {
        let mut registry = Registry::new();
        let (fut, _) = registry.insert_pending(&hash());

        let record = json!({
            "status": "success",
            "message": format!("Successfully subscribed to hash {HASH}"),
        });
        let routed = route(record.clone(), &mut registry);

        assert_eq!(registry.get(&hash()).unwrap().state, SubscriptionState::Subscribed);
        let subscription = fut.now_or_never().unwrap().unwrap();
        assert_eq!(subscription.hash, hash());
        assert!(routed.action.is_none());
        assert!(matches!(
            &routed.events[..],
            [ConsumerEvent::Success { record: r, .. }] if *r == record
        ));
    }

    #[test]
    fn success_against_empty_registry_only_emits() {
        let mut registry = Registry::new();
        let record = json!({
            "status": "success",
            "message": format!("Successfully subscribed to hash {HASH}"),
        });
        let routed = route(record, &mut registry);
        assert!(registry.is_empty());
        assert_eq!(routed.events.len(), 1);
        assert_eq!(routed.events[0].event_type(), "success");
    }

    #[test]
    fn warning_rejects_and_removes() {
        let mut registry = Registry::new();
        let (fut, _) = registry.insert_pending(&hash());

        let record = json!({
            "status": "warning",
            "message": format!("The hash {HASH} doesn't exist"),
        });
        let routed = route(record, &mut registry);

        assert!(registry.is_empty());
        let err = fut.now_or_never().unwrap().unwrap_err();
        assert!(matches!(err, ConsumerError::SubscriptionRejected { ref hash, .. } if hash == HASH));
        assert!(matches!(
            &routed.events[..],
            [ConsumerEvent::Warning { record: Some(_), .. }]
        ));
    }

    #[test]
    fn failure_requests_recovery() {
        let mut registry = Registry::new();
        let routed = route(json!({"status": "failure", "message": "boom"}), &mut registry);
        assert!(matches!(
            routed.action,
            Some(RouteAction::RecoverAndResubscribe(ConsumerError::ServerFailure(ref m))) if m == "boom"
        ));
        assert!(matches!(&routed.events[..], [ConsumerEvent::Error { message }] if message == "boom"));
    }

    #[test]
    fn stop_acknowledgement_does_not_recover() {
        let mut registry = Registry::new();
        let routed = route(
            json!({"status": "failure", "message": STOP_ACKNOWLEDGEMENT}),
            &mut registry,
        );
        assert!(routed.action.is_none());
        assert_eq!(routed.events[0].event_type(), "error");
    }

    #[test]
    fn activity_rearms_watchdog() {
        let mut registry = Registry::new();
        for (record, kind) in [
            (json!({"data": {"deleted": true}}), "delete"),
            (json!({"tick": 1_700_000_000}), "tick"),
            (json!({"data": {"interaction": {"id": "1"}}}), "interaction"),
        ] {
            let routed = route(record, &mut registry);
            assert!(matches!(routed.action, Some(RouteAction::RearmWatchdog)));
            assert_eq!(routed.events[0].event_type(), kind);
        }
    }

    #[test]
    fn unknown_passes_record_through() {
        let mut registry = Registry::new();
        let record = json!({"something": "else"});
        let routed = route(record.clone(), &mut registry);
        assert!(routed.action.is_none());
        assert!(matches!(&routed.events[..], [ConsumerEvent::UnknownEvent { record: r }] if *r == record));
    }
}
