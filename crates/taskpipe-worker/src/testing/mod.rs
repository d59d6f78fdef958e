//! Shared helpers for worker unit tests.

use std::io;
use std::sync::{Arc, Mutex, PoisonError};

use taskpipe_protocol::{Response, decode_response};

/// A writer that appends to a shared buffer, so tests can inspect what the
/// engine emitted.
#[derive(Clone, Default)]
pub(crate) struct SharedBuf {
    bytes: Arc<Mutex<Vec<u8>>>,
}

impl SharedBuf {
    /// Decodes every line written so far as a [`Response`].
    pub(crate) fn lines(&self) -> Vec<Response> {
        let bytes = self.bytes.lock().unwrap_or_else(PoisonError::into_inner);
        String::from_utf8(bytes.clone())
            .expect("utf8 output")
            .lines()
            .map(|line| decode_response(line).expect("decodable response"))
            .collect()
    }
}

impl io::Write for SharedBuf {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.bytes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
