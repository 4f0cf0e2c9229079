//! A controllable [`Filter`] test double that can stall a handshake behind
//! an `Again` retry and can hold bytes pending on either side, to exercise
//! paths `IdentityFilter` never takes (a handshake driven by the timer, and
//! a real `CLOSE_WAIT_DRAIN`).

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use spark_stream_engine::{Filter, FilterCallbacks, HandshakeProgress, Result, Sink};

struct Inner {
    callbacks: Option<Arc<dyn FilterCallbacks>>,
    connect_steps_remaining: usize,
    disconnect_steps_remaining: usize,
    retry_delay: Duration,
    ul_pending: Vec<u8>,
}

/// Reports `HandshakeProgress::Again(retry_delay)` for `steps` polls of
/// `try_connect`/`try_disconnect` before finally reporting `Done`, and can
/// be told to retain outbound bytes across one `ul_write` call to force a
/// real `CLOSE_WAIT_DRAIN`.
pub struct HandshakeFilter {
    inner: Mutex<Inner>,
}

impl HandshakeFilter {
    pub fn new(connect_steps: usize, disconnect_steps: usize, retry_delay: Duration) -> Self {
        Self {
            inner: Mutex::new(Inner {
                callbacks: None,
                connect_steps_remaining: connect_steps,
                disconnect_steps_remaining: disconnect_steps,
                retry_delay,
                ul_pending: Vec::new(),
            }),
        }
    }
}

impl Filter for HandshakeFilter {
    fn setup(&mut self, callbacks: Arc<dyn FilterCallbacks>) {
        self.inner.lock().callbacks = Some(callbacks);
    }

    fn ul_write_pending(&self) -> bool {
        !self.inner.lock().ul_pending.is_empty()
    }

    fn try_connect(&mut self, _timeout: Duration) -> Result<HandshakeProgress> {
        let mut inner = self.inner.lock();
        if inner.connect_steps_remaining == 0 {
            return Ok(HandshakeProgress::Done);
        }
        inner.connect_steps_remaining -= 1;
        Ok(HandshakeProgress::Again(inner.retry_delay))
    }

    fn try_disconnect(&mut self, _timeout: Duration) -> Result<HandshakeProgress> {
        let mut inner = self.inner.lock();
        if inner.disconnect_steps_remaining == 0 {
            return Ok(HandshakeProgress::Done);
        }
        inner.disconnect_steps_remaining -= 1;
        Ok(HandshakeProgress::Again(inner.retry_delay))
    }

    fn ul_write(&mut self, sink: &mut dyn Sink, buf: &[u8]) -> Result<usize> {
        let mut inner = self.inner.lock();
        if !inner.ul_pending.is_empty() {
            let n = sink.accept(&inner.ul_pending.clone());
            inner.ul_pending.drain(..n);
        }
        if !inner.ul_pending.is_empty() {
            // Still blocked on whatever was already buffered; take the new
            // bytes into the buffer too rather than attempt the sink again
            // out of order.
            inner.ul_pending.extend_from_slice(buf);
            return Ok(buf.len());
        }
        let n = sink.accept(buf);
        if n < buf.len() {
            inner.ul_pending.extend_from_slice(&buf[n..]);
        }
        Ok(buf.len())
    }

    fn ll_write(&mut self, sink: &mut dyn Sink, buf: &[u8]) -> Result<usize> {
        Ok(sink.accept(buf))
    }
}
