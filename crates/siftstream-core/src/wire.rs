//! Wire format for control messages sent up the stream and the
//! connection path the stream is opened against.

use serde::Serialize;

use crate::hash::StreamHash;

/// Failure message the server sends in response to our own stop request.
pub const STOP_ACKNOWLEDGEMENT: &str = "A stop message was received. You will now be disconnected";

/// Control message written verbatim to the open stream.
///
/// Hashes are carried in their normalised lowercase form, not as the caller spelled them.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "action", rename_all = "lowercase")]
pub enum ControlMessage {
    Subscribe { hash: StreamHash },
    Unsubscribe { hash: StreamHash },
    Stop,
}

impl ControlMessage {
    /// Single-line JSON encoding.
    pub fn to_json(&self) -> String {
        // Serializing a tagged enum of strings cannot fail.
        serde_json::to_string(self).unwrap_or_default()
    }
}

/// Build `<base>?statuses=true[&hashes=a,b,...]` from the hashes known at connect time.
pub fn connect_path<'a>(base: &str, hashes: impl IntoIterator<Item = &'a StreamHash>) -> String {
    let joined = hashes
        .into_iter()
        .map(StreamHash::as_str)
        .collect::<Vec<_>>()
        .join(",");

    let mut path = format!("{base}?statuses=true");
    if !joined.is_empty() {
        path.push_str("&hashes=");
        path.push_str(&joined);
    }
    path
}
