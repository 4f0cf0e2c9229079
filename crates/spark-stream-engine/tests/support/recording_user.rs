use parking_lot::Mutex;
use spark_stream_engine::{EngineError, ReadFlags, UserCallbacks};

#[derive(Default)]
struct Inner {
    read_bytes: Vec<u8>,
    read_errors: Vec<String>,
    write_ready_count: usize,
    urgent_count: usize,
}

/// Records every callback delivered to it, for assertion by the test.
#[derive(Default)]
pub struct RecordingUser {
    inner: Mutex<Inner>,
}

impl RecordingUser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn received(&self) -> Vec<u8> {
        self.inner.lock().read_bytes.clone()
    }

    pub fn read_errors(&self) -> Vec<String> {
        self.inner.lock().read_errors.clone()
    }

    pub fn write_ready_count(&self) -> usize {
        self.inner.lock().write_ready_count
    }

    pub fn urgent_count(&self) -> usize {
        self.inner.lock().urgent_count
    }
}

impl UserCallbacks for RecordingUser {
    fn on_read(&self, err: Option<&EngineError>, buf: &[u8], _flags: ReadFlags) -> usize {
        let mut inner = self.inner.lock();
        if let Some(err) = err {
            inner.read_errors.push(err.to_string());
            return 0;
        }
        inner.read_bytes.extend_from_slice(buf);
        buf.len()
    }

    fn on_write_ready(&self) {
        self.inner.lock().write_ready_count += 1;
    }

    fn on_urgent(&self) {
        self.inner.lock().urgent_count += 1;
    }
}
