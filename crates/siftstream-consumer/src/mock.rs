use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use siftstream_core::{Transport, TransportError, TransportEvent};

/// Scripted transport for deterministic tests without network I/O.
///
/// Each of `start`/`stop`/`recover` pops its next scripted outcome, and
/// succeeds once its script is exhausted.
pub struct MockTransport {
    started: AtomicBool,
    writes: Mutex<Vec<String>>,
    start_results: Mutex<VecDeque<Result<(), TransportError>>>,
    stop_results: Mutex<VecDeque<Result<(), TransportError>>>,
    recover_results: Mutex<VecDeque<Result<(), TransportError>>>,
    start_calls: AtomicUsize,
    stop_calls: AtomicUsize,
    recover_calls: AtomicUsize,
    sink: Mutex<Option<mpsc::UnboundedSender<TransportEvent>>>,
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl MockTransport {
    pub fn new() -> Self {
        Self {
            started: AtomicBool::new(false),
            writes: Mutex::new(Vec::new()),
            start_results: Mutex::new(VecDeque::new()),
            stop_results: Mutex::new(VecDeque::new()),
            recover_results: Mutex::new(VecDeque::new()),
            start_calls: AtomicUsize::new(0),
            stop_calls: AtomicUsize::new(0),
            recover_calls: AtomicUsize::new(0),
            sink: Mutex::new(None),
        }
    }

    /// A transport that already reports itself started.
    pub fn started() -> Self {
        let mock = Self::new();
        mock.started.store(true, Ordering::SeqCst);
        mock
    }

    pub fn script_start(&self, result: Result<(), TransportError>) {
        self.start_results.lock().push_back(result);
    }

    pub fn script_stop(&self, result: Result<(), TransportError>) {
        self.stop_results.lock().push_back(result);
    }

    pub fn script_recover(&self, result: Result<(), TransportError>) {
        self.recover_results.lock().push_back(result);
    }

    /// Deliver a body chunk to the attached sink. Dropped when nothing is attached.
    pub fn push_data(&self, chunk: impl Into<Bytes>) {
        self.push(TransportEvent::Data(chunk.into()));
    }

    pub fn push_end(&self, status: Option<u16>) {
        self.push(TransportEvent::End { status });
    }

    pub fn push_recovered(&self, reason: &str) {
        self.push(TransportEvent::Recovered {
            reason: reason.to_string(),
        });
    }

    fn push(&self, event: TransportEvent) {
        if let Some(sink) = self.sink.lock().as_ref() {
            let _ = sink.send(event);
        }
    }

    pub fn writes(&self) -> Vec<String> {
        self.writes.lock().clone()
    }

    pub fn start_calls(&self) -> usize {
        self.start_calls.load(Ordering::SeqCst)
    }

    pub fn stop_calls(&self) -> usize {
        self.stop_calls.load(Ordering::SeqCst)
    }

    pub fn recover_calls(&self) -> usize {
        self.recover_calls.load(Ordering::SeqCst)
    }

    /// Whether an attached sink still has a live receiver.
    pub fn has_listener(&self) -> bool {
        self.sink.lock().as_ref().is_some_and(|sink| !sink.is_closed())
    }

    /// Flip the started flag without going through `start`, as a transport
    /// does when it reconnects on its own.
    pub fn set_started(&self, started: bool) {
        self.started.store(started, Ordering::SeqCst);
    }
}

fn next_outcome(script: &Mutex<VecDeque<Result<(), TransportError>>>) -> Result<(), TransportError> {
    script.lock().pop_front().unwrap_or(Ok(()))
}

#[async_trait]
impl Transport for MockTransport {
    async fn start(&self) -> Result<(), TransportError> {
        self.start_calls.fetch_add(1, Ordering::SeqCst);
        next_outcome(&self.start_results)?;
        self.started.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn stop(&self) -> Result<(), TransportError> {
        self.stop_calls.fetch_add(1, Ordering::SeqCst);
        next_outcome(&self.stop_results)?;
        self.started.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn recover(&self) -> Result<(), TransportError> {
        self.recover_calls.fetch_add(1, Ordering::SeqCst);
        next_outcome(&self.recover_results)?;
        self.started.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn write(&self, message: &str) -> Result<(), TransportError> {
        if !self.started.load(Ordering::SeqCst) {
            return Err(TransportError::NotStarted);
        }
        self.writes.lock().push(message.to_string());
        Ok(())
    }

    fn started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    fn attach(&self, sink: mpsc::UnboundedSender<TransportEvent>) {
        *self.sink.lock() = Some(sink);
    }
}
