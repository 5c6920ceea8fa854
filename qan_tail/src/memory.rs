//! An in-memory reader.

use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;

use crate::{Error, Line, Reader, ReaderMetrics, buffer::LineBuffer};

#[derive(Debug)]
struct State {
    buffer: LineBuffer,
    pos: u64,
    closed: bool,
}

#[derive(Debug)]
/// Serves lines from a fixed byte sequence, then reports end of stream.
pub struct MemoryReader {
    size: u64,
    state: Mutex<State>,
}

impl MemoryReader {
    /// Create a reader over `bytes`.
    #[must_use]
    pub fn new(bytes: impl AsRef<[u8]>) -> Self {
        let bytes = bytes.as_ref();
        let mut buffer = LineBuffer::default();
        buffer.extend(bytes);
        Self {
            size: bytes.len() as u64,
            state: Mutex::new(State {
                buffer,
                pos: 0,
                closed: false,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl Reader for MemoryReader {
    async fn next_line(&self) -> Result<Line, Error> {
        let mut state = self.lock();
        if state.closed {
            return Err(Error::Closed);
        }
        let line = state
            .buffer
            .take_line()
            .or_else(|| state.buffer.take_remainder())
            .ok_or(Error::Closed)?;
        state.pos += line.len;
        Ok(line)
    }

    fn close(&self) -> Result<(), Error> {
        self.lock().closed = true;
        Ok(())
    }

    fn metrics(&self) -> Option<ReaderMetrics> {
        let state = self.lock();
        (!state.closed).then_some(ReaderMetrics {
            input_size: self.size,
            input_pos: state.pos,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::MemoryReader;
    use crate::{Error, Reader, ReaderMetrics};

    #[tokio::test]
    async fn serves_lines_then_closes() {
        let reader = MemoryReader::new("# Time: 1\nSELECT 1;\n");
        assert_eq!(reader.next_line().await.expect("line").text, "# Time: 1\n");
        assert_eq!(
            reader.metrics(),
            Some(ReaderMetrics {
                input_size: 20,
                input_pos: 10
            })
        );
        assert_eq!(reader.next_line().await.expect("line").text, "SELECT 1;\n");
        let end = reader.next_line().await;
        assert!(end.as_ref().is_err_and(Error::is_closed), "{end:?}");
    }

    #[tokio::test]
    async fn position_counts_raw_bytes() {
        let reader = MemoryReader::new(b"select '\xff\xff';\nb\n");
        let line = reader.next_line().await.expect("line");
        assert_eq!(line.text, "select '\u{fffd}\u{fffd}';\n");
        assert_eq!(line.len, 13);
        assert_eq!(
            reader.metrics(),
            Some(ReaderMetrics {
                input_size: 15,
                input_pos: 13
            })
        );
    }

    #[tokio::test]
    async fn close_hides_metrics() {
        let reader = MemoryReader::new("a\n");
        reader.close().expect("close");
        assert_eq!(reader.metrics(), None);
        assert!(matches!(reader.next_line().await, Err(Error::Closed)));
    }
}
