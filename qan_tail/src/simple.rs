//! A one-pass reader over a finite file.
//!
//! [`SimpleReader`] is what offline digestion of an existing slow log uses:
//! it reads the file front to back once and reports [`Error::Closed`] at end
//! of file instead of waiting for more data. A final line without a `\n` is
//! returned as-is before the end of the stream.

use std::{
    io::SeekFrom,
    path::{Path, PathBuf},
    sync::{
        Mutex, MutexGuard, PoisonError,
        atomic::{AtomicBool, Ordering},
    },
};

use async_trait::async_trait;
use tokio::{
    fs,
    io::{AsyncReadExt, AsyncSeekExt},
    sync::Mutex as AsyncMutex,
};

use crate::{Error, IoOp, Line, Reader, ReaderMetrics, buffer::LineBuffer};

const READ_CHUNK_BYTES: usize = 64 * 1024;

#[derive(Debug)]
struct State {
    file: Option<fs::File>,
    buffer: LineBuffer,
    pos: u64,
}

#[derive(Debug)]
/// Reads a file once, front to back.
pub struct SimpleReader {
    path: PathBuf,
    size: u64,
    state: AsyncMutex<State>,
    metrics: Mutex<Option<ReaderMetrics>>,
    closed: AtomicBool,
}

impl SimpleReader {
    /// Open `path`, reading from byte `offset`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] if the file cannot be opened or positioned.
    pub async fn open(path: impl Into<PathBuf>, offset: u64) -> Result<Self, Error> {
        let path = path.into();
        let mut file = fs::File::open(&path).await.map_err(|err| Error::Io {
            path: path.clone(),
            operation: IoOp::Open,
            err,
        })?;
        let size = file
            .metadata()
            .await
            .map_err(|err| Error::Io {
                path: path.clone(),
                operation: IoOp::Metadata,
                err,
            })?
            .len();
        let pos = offset.min(size);
        file.seek(SeekFrom::Start(pos))
            .await
            .map_err(|err| Error::Io {
                path: path.clone(),
                operation: IoOp::Seek,
                err,
            })?;

        Ok(Self {
            path,
            size,
            state: AsyncMutex::new(State {
                file: Some(file),
                buffer: LineBuffer::default(),
                pos,
            }),
            metrics: Mutex::new(Some(ReaderMetrics {
                input_size: size,
                input_pos: pos,
            })),
            closed: AtomicBool::new(false),
        })
    }

    /// The path being read.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock_metrics(&self) -> MutexGuard<'_, Option<ReaderMetrics>> {
        self.metrics.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl Reader for SimpleReader {
    async fn next_line(&self) -> Result<Line, Error> {
        let mut state = self.state.lock().await;
        let mut chunk = vec![0; READ_CHUNK_BYTES];
        loop {
            if let Some(line) = state.buffer.take_line() {
                return Ok(line);
            }
            if self.closed.load(Ordering::SeqCst) {
                state.file = None;
                return Err(Error::Closed);
            }
            let Some(file) = state.file.as_mut() else {
                return Err(Error::Closed);
            };

            let n = file.read(&mut chunk).await.map_err(|err| Error::Io {
                path: self.path.clone(),
                operation: IoOp::Read,
                err,
            })?;
            if n == 0 {
                state.file = None;
                return state.buffer.take_remainder().ok_or(Error::Closed);
            }
            state.buffer.extend(&chunk[..n]);
            state.pos += n as u64;

            let mut metrics = self.lock_metrics();
            if metrics.is_some() {
                *metrics = Some(ReaderMetrics {
                    input_size: self.size.max(state.pos),
                    input_pos: state.pos,
                });
            }
        }
    }

    fn close(&self) -> Result<(), Error> {
        self.closed.store(true, Ordering::SeqCst);
        *self.lock_metrics() = None;
        // A read in flight drops the file itself once it sees the flag.
        if let Ok(mut state) = self.state.try_lock() {
            state.file = None;
        }
        Ok(())
    }

    fn metrics(&self) -> Option<ReaderMetrics> {
        *self.lock_metrics()
    }
}
