//! A controllable [`LowerLayer`] test double, in the spirit of the
//! contract-test mock transports used elsewhere in this codebase: it never
//! touches real I/O, and every asynchronous completion is driven by the
//! test explicitly calling one of the `fire_*` methods rather than by a
//! background thread.

use std::net::SocketAddr;
use std::sync::Arc;

use parking_lot::Mutex;
use spark_stream_engine::{CloseOutcome, EngineError, LlCallbacks, LowerLayer, OpenOutcome};

/// Whether `open`/`close` on a [`MockLowerLayer`] settle synchronously or
/// require the test to call `fire_open_done`/`fire_close_done`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OpenMode {
    Immediate,
    Deferred,
}

struct Inner {
    callbacks: Option<Arc<dyn LlCallbacks>>,
    open_mode: OpenMode,
    write_log: Vec<u8>,
    write_cap: Option<usize>,
    read_enabled: bool,
    write_enabled: bool,
    next_write_err: Option<String>,
    next_open_err: Option<String>,
    closed: bool,
}

pub struct MockLowerLayer {
    inner: Mutex<Inner>,
}

impl MockLowerLayer {
    pub fn new(open_mode: OpenMode) -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(Inner {
                callbacks: None,
                open_mode,
                write_log: Vec::new(),
                write_cap: None,
                read_enabled: false,
                write_enabled: false,
                next_write_err: None,
                next_open_err: None,
                closed: false,
            }),
        })
    }

    /// Cap every future `write` at `cap` bytes, to exercise short writes.
    pub fn cap_writes(&self, cap: usize) {
        self.inner.lock().write_cap = Some(cap);
    }

    /// Make the very next `open()` fail synchronously with `message`.
    pub fn fail_next_open(&self, message: impl Into<String>) {
        self.inner.lock().next_open_err = Some(message.into());
    }

    /// Make the very next `write()` fail synchronously with `message`.
    pub fn fail_next_write(&self, message: impl Into<String>) {
        self.inner.lock().next_write_err = Some(message.into());
    }

    pub fn written(&self) -> Vec<u8> {
        self.inner.lock().write_log.clone()
    }

    pub fn read_enabled(&self) -> bool {
        self.inner.lock().read_enabled
    }

    pub fn write_enabled(&self) -> bool {
        self.inner.lock().write_enabled
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    /// Push inbound bytes into the engine as if they arrived on the wire.
    /// Returns the number of bytes the engine consumed.
    pub fn deliver(&self, buf: &[u8]) -> usize {
        let callbacks = self.inner.lock().callbacks.clone().expect("open() not called yet");
        callbacks.on_read(None, buf)
    }

    /// Deliver a latched read-side error.
    pub fn deliver_error(&self, err: EngineError) {
        let callbacks = self.inner.lock().callbacks.clone().expect("open() not called yet");
        callbacks.on_read(Some(&err), &[]);
    }

    pub fn fire_write_ready(&self) {
        let callbacks = self.inner.lock().callbacks.clone().expect("open() not called yet");
        callbacks.on_write_ready();
    }

    pub fn fire_urgent(&self) {
        let callbacks = self.inner.lock().callbacks.clone().expect("open() not called yet");
        callbacks.on_urgent();
    }

    /// Complete a deferred open. Only valid after `open()` returned
    /// `OpenOutcome::InProgress`.
    pub fn fire_open_done(&self, result: Result<(), EngineError>) {
        let callbacks = self.inner.lock().callbacks.clone().expect("open() not called yet");
        callbacks.on_open_done(result);
    }

    /// Complete a deferred close. Only valid after `close()` returned
    /// `CloseOutcome::InProgress`.
    pub fn fire_close_done(&self) {
        self.inner.lock().closed = true;
        let callbacks = self.inner.lock().callbacks.clone().expect("open() not called yet");
        callbacks.on_close_done();
    }
}

impl LowerLayer for MockLowerLayer {
    fn open(&self, callbacks: Arc<dyn LlCallbacks>) -> spark_stream_engine::Result<OpenOutcome> {
        let mut inner = self.inner.lock();
        if let Some(message) = inner.next_open_err.take() {
            return Err(EngineError::comm_error(MockError(message)));
        }
        inner.callbacks = Some(callbacks);
        Ok(match inner.open_mode {
            OpenMode::Immediate => OpenOutcome::Ready,
            OpenMode::Deferred => OpenOutcome::InProgress,
        })
    }

    fn close(&self) -> CloseOutcome {
        let mut inner = self.inner.lock();
        match inner.open_mode {
            OpenMode::Immediate => {
                inner.closed = true;
                CloseOutcome::Ready
            }
            OpenMode::Deferred => CloseOutcome::InProgress,
        }
    }

    fn write(&self, buf: &[u8]) -> spark_stream_engine::Result<usize> {
        let mut inner = self.inner.lock();
        if let Some(message) = inner.next_write_err.take() {
            return Err(EngineError::comm_error(MockError(message)));
        }
        let n = inner.write_cap.map(|cap| buf.len().min(cap)).unwrap_or(buf.len());
        inner.write_log.extend_from_slice(&buf[..n]);
        Ok(n)
    }

    fn set_read_callback_enable(&self, enable: bool) {
        self.inner.lock().read_enabled = enable;
    }

    fn set_write_callback_enable(&self, enable: bool) {
        self.inner.lock().write_enabled = enable;
    }

    fn raddr_to_str(&self) -> Option<String> {
        Some("mock:0".to_string())
    }

    fn remote_addr(&self) -> Option<SocketAddr> {
        None
    }

    fn remote_id(&self) -> Option<String> {
        None
    }
}

#[derive(Debug)]
struct MockError(String);

impl std::fmt::Display for MockError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::error::Error for MockError {}
