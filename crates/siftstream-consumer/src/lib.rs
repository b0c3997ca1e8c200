pub mod config;
pub mod consumer;
pub mod framer;
pub mod http;
pub mod registry;
pub mod router;
pub mod watchdog;

pub mod mock;

pub use config::{load_config, ConsumerConfig, TransportConfig};
pub use consumer::StreamConsumer;
pub use http::{http_consumer, HttpTransport};
pub use mock::MockTransport;
pub use registry::{Subscription, SubscriptionFuture, SubscriptionState};
