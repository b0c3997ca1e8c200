pub mod errors;
pub mod events;
pub mod hash;
pub mod transport;
pub mod wire;

pub use errors::{ConsumerError, TransportError};
pub use events::ConsumerEvent;
pub use hash::StreamHash;
pub use transport::{Transport, TransportEvent};
