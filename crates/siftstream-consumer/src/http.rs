//! reqwest-backed [`Transport`]: one long-lived request whose body carries
//! control messages up while the response body streams records down.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use parking_lot::Mutex;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::{Client, Method};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use siftstream_core::wire::connect_path;
use siftstream_core::{Transport, TransportError, TransportEvent};

use crate::config::{ConsumerConfig, TransportConfig};
use crate::consumer::StreamConsumer;
use crate::registry::{Registry, SharedRegistry};

/// Produces the request path for the next connection attempt.
pub type PathSource = Arc<dyn Fn() -> String + Send + Sync>;

#[derive(Clone, Debug)]
enum ConnectionState {
    Connecting,
    Connected,
    Failed(TransportError),
    Stopped,
}

struct Connection {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
    state: watch::Receiver<ConnectionState>,
}

struct Shared {
    client: Client,
    base_url: String,
    headers: HeaderMap,
    path: PathSource,
    config: TransportConfig,
    sink: Mutex<Option<mpsc::UnboundedSender<TransportEvent>>>,
    started: AtomicBool,
    writer: Mutex<Option<mpsc::UnboundedSender<Bytes>>>,
}

pub struct HttpTransport {
    shared: Arc<Shared>,
    connection: Mutex<Option<Connection>>,
}

impl HttpTransport {
    pub fn new(config: &ConsumerConfig, path: PathSource) -> Result<Self, TransportError> {
        let client = Client::builder()
            .connect_timeout(config.transport.connect_timeout())
            .build()
            .map_err(|e| TransportError::Connect(e.to_string()))?;

        Ok(Self {
            shared: Arc::new(Shared {
                client,
                base_url: config.base_url.trim_end_matches('/').to_string(),
                headers: build_headers(config),
                path,
                config: config.transport.clone(),
                sink: Mutex::new(None),
                started: AtomicBool::new(false),
                writer: Mutex::new(None),
            }),
            connection: Mutex::new(None),
        })
    }
}

impl Shared {
    fn emit(&self, event: TransportEvent) {
        if let Some(sink) = self.sink.lock().as_ref() {
            let _ = sink.send(event);
        }
    }
}

/// Build a consumer whose transport reconnects with the registry's hashes in the path.
///
/// Must be called from within a tokio runtime.
pub fn http_consumer(config: &ConsumerConfig) -> Result<StreamConsumer<HttpTransport>, TransportError> {
    let registry: SharedRegistry = Registry::shared();
    let path_registry = Arc::clone(&registry);
    let base_path = config.path.clone();

    let path: PathSource = Arc::new(move || {
        let mut hashes = path_registry.lock().hashes();
        hashes.sort();
        connect_path(&base_path, &hashes)
    });

    let transport = HttpTransport::new(config, path)?;
    Ok(StreamConsumer::with_registry(transport, registry, config))
}

fn build_headers(config: &ConsumerConfig) -> HeaderMap {
    let mut headers = HeaderMap::new();
    for (name, value) in &config.headers {
        match (HeaderName::try_from(name.as_str()), HeaderValue::try_from(value.as_str())) {
            (Ok(name), Ok(value)) => {
                let _ = headers.insert(name, value);
            }
            _ => warn!(header = %name, "skipping invalid header"),
        }
    }
    headers
}

/// Exponential backoff with jitter: `base * 2^attempt`, capped, then ± `jitter_factor`.
fn retry_delay(config: &TransportConfig, attempt: u32) -> Duration {
    let exp_delay = config.base_delay_ms as f64 * 2.0_f64.powi(attempt.min(30) as i32);
    let capped = exp_delay.min(config.max_delay_ms as f64);

    let jitter_range = capped * config.jitter_factor;
    let jitter = (random_u64() % (jitter_range as u64 * 2 + 1)) as f64 - jitter_range;
    let final_ms = (capped + jitter).max(0.0);

    Duration::from_millis(final_ms as u64)
}

/// Simple non-cryptographic random u64 using thread-local state.
fn random_u64() -> u64 {
    use std::cell::Cell;
    use std::time::SystemTime;

    thread_local! {
        static STATE: Cell<u64> = Cell::new(
            SystemTime::now()
                .duration_since(SystemTime::UNIX_EPOCH)
                .unwrap_or_default()
                .as_nanos() as u64
                | 1
        );
    }

    STATE.with(|s| {
        // xorshift64
        let mut x = s.get();
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        s.set(x);
        x
    })
}

async fn open(shared: &Shared) -> Result<(reqwest::Response, mpsc::UnboundedSender<Bytes>), TransportError> {
    let (tx, rx) = mpsc::unbounded_channel::<Bytes>();
    // The server expects the request body to be open before it answers.
    let _ = tx.send(Bytes::from_static(b"\n"));
    let body = reqwest::Body::wrap_stream(UnboundedReceiverStream::new(rx).map(Ok::<_, std::io::Error>));

    let url = format!("{}{}", shared.base_url, (shared.path)());
    debug!(url = %url, "opening stream");

    let response = shared
        .client
        .request(Method::GET, &url)
        .headers(shared.headers.clone())
        .body(body)
        .send()
        .await
        .map_err(|e| TransportError::Connect(e.to_string()))?;

    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(TransportError::Status {
            status: status.as_u16(),
            body,
        });
    }

    Ok((response, tx))
}

/// Forward body chunks until the body ends, errors, or the connection is cancelled.
/// Returns the error text if the body failed.
async fn pump(response: reqwest::Response, shared: &Shared, cancel: &CancellationToken) -> Option<String> {
    let mut body = response.bytes_stream();
    loop {
        tokio::select! {
            () = cancel.cancelled() => return None,
            chunk = body.next() => match chunk {
                Some(Ok(bytes)) => {
                    shared.emit(TransportEvent::Data(bytes));
                }
                Some(Err(e)) => return Some(e.to_string()),
                None => return None,
            }
        }
    }
}

async fn run_connection(
    shared: Arc<Shared>,
    cancel: CancellationToken,
    state: watch::Sender<ConnectionState>,
) {
    let mut attempt: u32 = 0;
    let mut reconnect_reason: Option<String> = None;

    loop {
        let opened = tokio::select! {
            () = cancel.cancelled() => break,
            opened = open(&shared) => opened,
        };

        match opened {
            Ok((response, writer)) => {
                attempt = 0;
                let status = response.status().as_u16();
                *shared.writer.lock() = Some(writer);
                shared.started.store(true, Ordering::SeqCst);
                state.send_replace(ConnectionState::Connected);
                if let Some(reason) = reconnect_reason.take() {
                    info!(reason = %reason, "stream reconnected");
                    shared.emit(TransportEvent::Recovered { reason });
                }

                let failure = pump(response, &shared, &cancel).await;

                shared.started.store(false, Ordering::SeqCst);
                *shared.writer.lock() = None;
                shared.emit(TransportEvent::End { status: Some(status) });

                if cancel.is_cancelled() {
                    break;
                }
                state.send_replace(ConnectionState::Connecting);
                reconnect_reason = Some(failure.unwrap_or_else(|| "end of stream".to_string()));
            }
            Err(e) => {
                if !e.is_retryable() || attempt >= shared.config.max_retries {
                    warn!(error = %e, attempts = attempt + 1, "giving up on stream connection");
                    state.send_replace(ConnectionState::Failed(e));
                    return;
                }
                reconnect_reason = Some(e.to_string());
            }
        }

        let delay = retry_delay(&shared.config, attempt);
        attempt = attempt.saturating_add(1);
        warn!(
            attempt,
            delay_ms = delay.as_millis() as u64,
            reason = reconnect_reason.as_deref().unwrap_or_default(),
            "reconnecting stream"
        );

        tokio::select! {
            () = cancel.cancelled() => break,
            () = tokio::time::sleep(delay) => {}
        }
    }

    shared.started.store(false, Ordering::SeqCst);
    *shared.writer.lock() = None;
    state.send_replace(ConnectionState::Stopped);
}

#[async_trait]
impl Transport for HttpTransport {
    async fn start(&self) -> Result<(), TransportError> {
        let mut state = {
            let mut connection = self.connection.lock();
            match connection.as_ref() {
                Some(conn) if !conn.handle.is_finished() => conn.state.clone(),
                _ => {
                    let (state_tx, state_rx) = watch::channel(ConnectionState::Connecting);
                    let cancel = CancellationToken::new();
                    let handle = tokio::spawn(run_connection(
                        Arc::clone(&self.shared),
                        cancel.clone(),
                        state_tx,
                    ));
                    *connection = Some(Connection {
                        cancel,
                        handle,
                        state: state_rx.clone(),
                    });
                    state_rx
                }
            }
        };

        loop {
            let current = state.borrow_and_update().clone();
            match current {
                ConnectionState::Connected => return Ok(()),
                ConnectionState::Failed(e) => return Err(e),
                ConnectionState::Stopped => return Err(TransportError::Stopped),
                ConnectionState::Connecting => {}
            }
            if state.changed().await.is_err() {
                return Err(TransportError::Stopped);
            }
        }
    }

    async fn stop(&self) -> Result<(), TransportError> {
        let connection = self.connection.lock().take();
        if let Some(connection) = connection {
            connection.cancel.cancel();
            let _ = connection.handle.await;
        }
        self.shared.started.store(false, Ordering::SeqCst);
        *self.shared.writer.lock() = None;
        Ok(())
    }

    async fn recover(&self) -> Result<(), TransportError> {
        self.stop().await?;
        self.start().await?;
        self.shared.emit(TransportEvent::Recovered {
            reason: "recover requested".to_string(),
        });
        Ok(())
    }

    fn write(&self, message: &str) -> Result<(), TransportError> {
        let writer = self.shared.writer.lock();
        let Some(tx) = writer.as_ref() else {
            return Err(TransportError::NotStarted);
        };
        tx.send(Bytes::copy_from_slice(message.as_bytes()))
            .map_err(|_| TransportError::Write("request body closed".to_string()))
    }

    fn started(&self) -> bool {
        self.shared.started.load(Ordering::SeqCst)
    }

    fn attach(&self, sink: mpsc::UnboundedSender<TransportEvent>) {
        *self.shared.sink.lock() = Some(sink);
    }
}

impl Drop for HttpTransport {
    fn drop(&mut self) {
        if let Some(connection) = self.connection.get_mut().take() {
            connection.cancel.cancel();
        }
    }
}
