//! The rotation aware tailing reader.
//!
//! [`Tailer`] reads a named file forever. It does not watch the file system
//! for events but polls: whenever a read comes back empty it compares the
//! identity and size of whatever the path now resolves to against the file it
//! holds open, then sleeps for the poll interval. There are three outcomes:
//!
//! * The path resolves to a different file (rename based rotation or a
//!   retargeted symlink). Late writes to the old file are drained, then the
//!   path is reopened at offset 0.
//! * The same file shrank below the read position (copy-truncate rotation).
//!   The read position is reset to offset 0 of the same file.
//! * Nothing changed. Reading continues from the current position.
//!
//! A trailing fragment without a `\n` is carried across both kinds of reset
//! and prefixed to whatever is read next. Its bytes are not counted in the
//! [`Line::len`] of the line it completes, which only covers the new input.

use std::{
    io::{ErrorKind, SeekFrom},
    path::{Path, PathBuf},
    sync::{
        Mutex, MutexGuard, PoisonError,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use metrics::counter;
use tokio::{
    fs,
    io::{AsyncReadExt, AsyncSeekExt},
    sync::Mutex as AsyncMutex,
};
use tracing::{debug, info};

use crate::{Error, IoOp, Line, Reader, ReaderMetrics, buffer::LineBuffer};

const READ_CHUNK_BYTES: usize = 64 * 1024;

/// The identity of an open file, stable across renames.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileIdentity {
    device: u64,
    inode: u64,
}

impl FileIdentity {
    #[cfg(unix)]
    fn of(metadata: &std::fs::Metadata) -> Self {
        use std::os::unix::fs::MetadataExt;

        Self {
            device: metadata.dev(),
            inode: metadata.ino(),
        }
    }

    // Without stable identity metadata every file compares equal and a
    // replacement is only noticed through the size check.
    #[cfg(not(unix))]
    fn of(_metadata: &std::fs::Metadata) -> Self {
        Self {
            device: 0,
            inode: 0,
        }
    }
}

/// What the tailed path looks like compared to the open file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Change {
    Unchanged { size: u64 },
    Rotated,
    Truncated { size: u64 },
}

#[derive(Debug)]
struct Input {
    file: fs::File,
    identity: FileIdentity,
    pos: u64,
    size: u64,
}

impl Input {
    async fn open(path: &Path) -> Result<Self, Error> {
        let file = fs::File::open(path).await.map_err(|err| Error::Io {
            path: PathBuf::from(path),
            operation: IoOp::Open,
            err,
        })?;
        let metadata = file.metadata().await.map_err(|err| Error::Io {
            path: PathBuf::from(path),
            operation: IoOp::Metadata,
            err,
        })?;
        Ok(Self {
            file,
            identity: FileIdentity::of(&metadata),
            pos: 0,
            size: metadata.len(),
        })
    }

    async fn seek(&mut self, path: &Path, offset: u64) -> Result<(), Error> {
        self.file
            .seek(SeekFrom::Start(offset))
            .await
            .map_err(|err| Error::Io {
                path: PathBuf::from(path),
                operation: IoOp::Seek,
                err,
            })?;
        self.pos = offset;
        Ok(())
    }

    async fn read_chunk(
        &mut self,
        path: &Path,
        chunk: &mut [u8],
        buffer: &mut LineBuffer,
    ) -> Result<u64, Error> {
        let n = self.file.read(chunk).await.map_err(|err| Error::Io {
            path: PathBuf::from(path),
            operation: IoOp::Read,
            err,
        })?;
        buffer.extend(&chunk[..n]);
        let n = n as u64;
        self.pos += n;
        self.size = self.size.max(self.pos);
        Ok(n)
    }

    async fn change(&self, path: &Path) -> Result<Change, Error> {
        let metadata = match fs::metadata(path).await {
            Ok(metadata) => metadata,
            // The old file was renamed away and the new one is not there
            // yet. Keep reading what we hold.
            Err(err) if err.kind() == ErrorKind::NotFound => {
                return Ok(Change::Unchanged { size: self.size });
            }
            Err(err) => {
                return Err(Error::Io {
                    path: PathBuf::from(path),
                    operation: IoOp::Metadata,
                    err,
                });
            }
        };

        let size = metadata.len();
        if FileIdentity::of(&metadata) != self.identity {
            Ok(Change::Rotated)
        } else if size < self.pos {
            Ok(Change::Truncated { size })
        } else {
            Ok(Change::Unchanged { size })
        }
    }

    fn metrics(&self) -> ReaderMetrics {
        ReaderMetrics {
            input_size: self.size,
            input_pos: self.pos,
        }
    }
}

#[derive(Debug)]
struct State {
    input: Option<Input>,
    buffer: LineBuffer,
    chunk: Vec<u8>,
}

#[derive(Debug)]
/// A reader that follows a file path across rotation and truncation.
///
/// If the path is a symlink the file it resolves to is read, and a retargeted
/// symlink is treated exactly like a rotation.
pub struct Tailer {
    path: PathBuf,
    poll_interval: Duration,
    state: AsyncMutex<State>,
    metrics: Mutex<Option<ReaderMetrics>>,
    generation: AtomicU64,
    close: qan_signal::Trigger,
    closed: qan_signal::Watcher,
    labels: Vec<(String, String)>,
}

impl Tailer {
    /// Open `path` for tailing from its first byte.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] immediately if the file cannot be opened, for
    /// instance because it does not exist or permissions are wrong. There is no
    /// retry.
    pub async fn open(path: impl Into<PathBuf>, poll_interval: Duration) -> Result<Self, Error> {
        Self::open_at(path, 0, poll_interval).await
    }

    /// Open `path` for tailing from byte `offset`, clamped to the current
    /// file size.
    ///
    /// # Errors
    ///
    /// See [`Tailer::open`].
    pub async fn open_at(
        path: impl Into<PathBuf>,
        offset: u64,
        poll_interval: Duration,
    ) -> Result<Self, Error> {
        let path = path.into();
        let mut input = Input::open(&path).await?;
        let offset = offset.min(input.size);
        if offset > 0 {
            input.seek(&path, offset).await?;
        }
        info!(
            "tailing {path} from offset {offset} of {size}",
            path = path.display(),
            size = input.size
        );

        let (closed, close) = qan_signal::signal();
        let labels = vec![("path".to_string(), path.display().to_string())];
        Ok(Self {
            metrics: Mutex::new(Some(input.metrics())),
            state: AsyncMutex::new(State {
                input: Some(input),
                buffer: LineBuffer::default(),
                chunk: vec![0; READ_CHUNK_BYTES],
            }),
            path,
            poll_interval,
            generation: AtomicU64::new(0),
            close,
            closed,
            labels,
        })
    }

    /// The path being tailed.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock_metrics(&self) -> MutexGuard<'_, Option<ReaderMetrics>> {
        self.metrics.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn publish(&self, input: &Input) {
        let mut metrics = self.lock_metrics();
        // A closed reader never reports progress again.
        if !self.close.is_signaled() {
            *metrics = Some(input.metrics());
        }
    }

    /// Make one attempt to get more bytes into the line buffer. Returns
    /// [`Error::Empty`] if nothing changed and the caller should sleep.
    async fn poll(&self, state: &mut State) -> Result<(), Error> {
        let State {
            input,
            buffer,
            chunk,
        } = state;
        let Some(input) = input.as_mut() else {
            return Err(Error::Closed);
        };

        let n = input.read_chunk(&self.path, chunk, buffer).await?;
        if n > 0 {
            counter!("tail_bytes_read", &self.labels).increment(n);
            self.publish(input);
            return Ok(());
        }

        match input.change(&self.path).await? {
            Change::Unchanged { size } => {
                input.size = size.max(input.pos);
                self.publish(input);
                Err(Error::Empty)
            }
            Change::Truncated { size } => {
                info!(
                    "{path} truncated from {pos} to {size} bytes, reading from start",
                    path = self.path.display(),
                    pos = input.pos
                );
                input.seek(&self.path, 0).await?;
                input.size = size;
                buffer.carry();
                self.generation.fetch_add(1, Ordering::SeqCst);
                counter!("tail_truncations", &self.labels).increment(1);
                self.publish(input);
                Ok(())
            }
            Change::Rotated => {
                // Finish whatever the writer put into the old file before
                // moving on.
                let n = input.read_chunk(&self.path, chunk, buffer).await?;
                if n > 0 {
                    counter!("tail_bytes_read", &self.labels).increment(n);
                    self.publish(input);
                    return Ok(());
                }

                match Input::open(&self.path).await {
                    Ok(next) => {
                        info!(
                            "{path} rotated after {pos} bytes, reopening",
                            path = self.path.display(),
                            pos = input.pos
                        );
                        *input = next;
                        buffer.carry();
                        self.generation.fetch_add(1, Ordering::SeqCst);
                        counter!("tail_rotations", &self.labels).increment(1);
                        self.publish(input);
                        Ok(())
                    }
                    Err(Error::Io { err, .. }) if err.kind() == ErrorKind::NotFound => {
                        debug!(
                            "{path} vanished during reopen, retrying",
                            path = self.path.display()
                        );
                        Err(Error::Empty)
                    }
                    Err(err) => Err(err),
                }
            }
        }
    }
}

#[async_trait]
impl Reader for Tailer {
    async fn next_line(&self) -> Result<Line, Error> {
        let mut closed = self.closed.clone();
        loop {
            {
                let mut state = self.state.lock().await;
                if let Some(line) = state.buffer.take_line() {
                    return Ok(line);
                }
                if closed.try_recv() {
                    state.input = None;
                    return Err(Error::Closed);
                }
                match self.poll(&mut state).await {
                    Ok(()) => continue,
                    Err(Error::Empty) => {}
                    Err(err) => return Err(err),
                }
            }

            // Sleep without holding the state so `close` and `metrics` are
            // never stuck behind an idle reader.
            tokio::select! {
                () = tokio::time::sleep(self.poll_interval) => {}
                () = closed.recv() => {}
            }
        }
    }

    fn close(&self) -> Result<(), Error> {
        if self.close.signal() {
            info!("closing tailer for {path}", path = self.path.display());
        }
        *self.lock_metrics() = None;
        // Release the descriptor now if no read is in flight, otherwise the
        // reading task does so when it observes the signal.
        if let Ok(mut state) = self.state.try_lock() {
            state.input = None;
        }
        Ok(())
    }

    fn metrics(&self) -> Option<ReaderMetrics> {
        *self.lock_metrics()
    }

    fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use std::{
        fs::{self, OpenOptions},
        io::Write,
        path::Path,
        sync::Arc,
        time::Duration,
    };

    use tokio::time::timeout;

    use super::Tailer;
    use crate::{Error, IoOp, Line, Reader, ReaderMetrics};

    const POLL: Duration = Duration::from_millis(10);
    const WAIT: Duration = Duration::from_secs(5);

    fn append(path: &Path, bytes: &str) {
        let mut fp = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .expect("open for append");
        fp.write_all(bytes.as_bytes()).expect("append");
    }

    fn truncate_and_write(path: &Path, bytes: &str) {
        let mut fp = OpenOptions::new()
            .write(true)
            .truncate(true)
            .open(path)
            .expect("open for truncate");
        fp.write_all(bytes.as_bytes()).expect("write");
    }

    async fn next(reader: &Tailer) -> Line {
        timeout(WAIT, reader.next_line())
            .await
            .expect("no line before timeout")
            .expect("next_line failed")
    }

    async fn line(reader: &Tailer) -> String {
        next(reader).await.text
    }

    fn metrics(input_size: u64, input_pos: u64) -> Option<ReaderMetrics> {
        Some(ReaderMetrics {
            input_size,
            input_pos,
        })
    }

    #[tokio::test]
    async fn truncation_resumes_from_start() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("slow.log");
        append(&path, "");

        let reader = Tailer::open(&path, POLL).await.expect("open");
        assert_eq!(reader.metrics(), metrics(0, 0));

        append(&path, "0\n");
        assert_eq!(line(&reader).await, "0\n");
        assert_eq!(reader.metrics(), metrics(2, 2));

        append(&path, "1\n2\n3");
        assert_eq!(line(&reader).await, "1\n");
        assert_eq!(line(&reader).await, "2\n");
        assert_eq!(reader.metrics(), metrics(7, 7));
        assert_eq!(reader.generation(), 0);

        truncate_and_write(&path, "\n4\n5");
        // The held fragment "3" is completed by the first byte of the new
        // content. Only that byte belongs to the new file.
        let completed = next(&reader).await;
        assert_eq!(completed.text, "3\n");
        assert_eq!(completed.len, 1);
        assert_eq!(reader.generation(), 1);
        assert_eq!(next(&reader).await.len, 2);
        assert_eq!(reader.metrics(), metrics(4, 4));
        assert_eq!(reader.generation(), 1);
    }

    #[tokio::test]
    async fn rename_rotation_drains_old_file_first() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("slow.log");
        append(&path, "old 1\n");

        let reader = Tailer::open(&path, POLL).await.expect("open");
        assert_eq!(line(&reader).await, "old 1\n");

        append(&path, "old 2\n");
        fs::rename(&path, dir.path().join("slow.log.1")).expect("rename");
        append(&path, "new 1\n");

        assert_eq!(line(&reader).await, "old 2\n");
        assert_eq!(line(&reader).await, "new 1\n");
        assert_eq!(reader.metrics(), metrics(6, 6));
        assert_eq!(reader.generation(), 1);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn symlink_retarget_is_a_rotation() {
        let dir = tempfile::tempdir().expect("tempdir");
        let first = dir.path().join("first.log");
        let second = dir.path().join("second.log");
        let link = dir.path().join("slow.log");
        append(&first, "first\n");
        append(&second, "second\n");
        std::os::unix::fs::symlink(&first, &link).expect("symlink");

        let reader = Tailer::open(&link, POLL).await.expect("open");
        assert_eq!(line(&reader).await, "first\n");

        let staging = dir.path().join("slow.log.tmp");
        std::os::unix::fs::symlink(&second, &staging).expect("symlink");
        fs::rename(&staging, &link).expect("retarget");

        assert_eq!(line(&reader).await, "second\n");
        assert_eq!(reader.metrics(), metrics(7, 7));
    }

    #[tokio::test]
    async fn partial_line_waits_for_terminator() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("slow.log");
        append(&path, "SELECT");

        let reader = Tailer::open(&path, POLL).await.expect("open");
        assert!(
            timeout(Duration::from_millis(100), reader.next_line())
                .await
                .is_err(),
            "fragment must not be emitted"
        );

        append(&path, " 1;\n");
        assert_eq!(line(&reader).await, "SELECT 1;\n");
    }

    #[tokio::test]
    async fn open_at_skips_to_offset() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("slow.log");
        append(&path, "skip\nkeep\n");

        let reader = Tailer::open_at(&path, 5, POLL).await.expect("open");
        assert_eq!(reader.metrics(), metrics(10, 5));
        assert_eq!(line(&reader).await, "keep\n");
    }

    #[tokio::test]
    async fn close_unblocks_waiting_reader() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("slow.log");
        append(&path, "");

        // A long poll interval proves close does not wait for a poll cycle.
        let reader = Arc::new(
            Tailer::open(&path, Duration::from_secs(3600))
                .await
                .expect("open"),
        );
        let waiting = Arc::clone(&reader);
        let handle = tokio::spawn(async move { waiting.next_line().await });
        tokio::time::sleep(Duration::from_millis(50)).await;

        reader.close().expect("close");
        let res = timeout(WAIT, handle)
            .await
            .expect("reader still blocked")
            .expect("task panicked");
        assert!(matches!(res, Err(Error::Closed)));
        assert_eq!(reader.metrics(), None);

        // Closing twice is harmless and the stream stays closed.
        reader.close().expect("second close");
        assert!(matches!(reader.next_line().await, Err(Error::Closed)));
    }

    #[tokio::test]
    async fn buffered_lines_survive_close() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("slow.log");
        append(&path, "a\nb\n");

        let reader = Tailer::open(&path, POLL).await.expect("open");
        assert_eq!(line(&reader).await, "a\n");
        reader.close().expect("close");
        assert_eq!(line(&reader).await, "b\n");
        assert!(matches!(reader.next_line().await, Err(Error::Closed)));
    }

    #[tokio::test]
    async fn missing_file_is_fatal() {
        let dir = tempfile::tempdir().expect("tempdir");
        let res = Tailer::open(dir.path().join("absent.log"), POLL).await;
        match res {
            Err(Error::Io { operation, err, .. }) => {
                assert_eq!(operation, IoOp::Open);
                assert_eq!(err.kind(), std::io::ErrorKind::NotFound);
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }
}
