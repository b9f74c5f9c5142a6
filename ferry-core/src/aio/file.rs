use std::collections::VecDeque;
use std::io::{Seek, SeekFrom};
use std::path::Path;
use std::sync::{Arc, Mutex};

use ferry_common::FerryError;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::{Aio, Reader, Writer};
use crate::buffer_pool::{BufferLease, BufferPool, BufferWaiter};

#[derive(Default)]
struct ReaderState {
    ready: VecDeque<BufferLease>,
    finished: bool,
    error: Option<String>,
    waiter: Option<BufferWaiter>,
}

fn wake<S>(state: &Mutex<S>, f: impl FnOnce(&mut S) -> Option<BufferWaiter>) {
    let waiter = {
        #[allow(clippy::unwrap_used, reason = "panic on poison")]
        let mut state = state.lock().unwrap();
        f(&mut state)
    };
    if let Some(waiter) = waiter {
        waiter();
    }
}

/// Reads a local file ahead of the consumer on a background task, as far
/// as the pool allows.
pub struct FileReader {
    name: String,
    state: Arc<Mutex<ReaderState>>,
    task: JoinHandle<()>,
}

impl FileReader {
    pub fn open(path: &Path, offset: u64, pool: BufferPool) -> Result<Self, FerryError> {
        let mut file = std::fs::File::open(path)?;
        file.seek(SeekFrom::Start(offset))?;
        let mut file = tokio::fs::File::from_std(file);
        let name = path.display().to_string();
        let state = Arc::new(Mutex::new(ReaderState::default()));

        let task = tokio::spawn({
            let state = state.clone();
            let name = name.clone();
            async move {
                loop {
                    let mut lease = pool.lease().await;
                    let capacity = lease.capacity();
                    lease.resize(capacity, 0);
                    let result = file.read(&mut lease[..]).await;
                    let done = !matches!(result, Ok(n) if n > 0);
                    wake(&state, |state| {
                        match result {
                            Ok(0) => state.finished = true,
                            Ok(n) => {
                                lease.truncate(n);
                                state.ready.push_back(lease);
                            }
                            Err(error) => {
                                warn!(file = %name, %error, "Read failed");
                                state.error = Some(error.to_string());
                            }
                        }
                        state.waiter.take()
                    });
                    if done {
                        break;
                    }
                }
            }
        });

        Ok(Self { name, state, task })
    }
}

impl Reader for FileReader {
    fn name(&self) -> &str {
        &self.name
    }

    fn read(&mut self, waiter: &BufferWaiter) -> Aio<Option<BufferLease>> {
        #[allow(clippy::unwrap_used, reason = "panic on poison")]
        let mut state = self.state.lock().unwrap();
        if let Some(lease) = state.ready.pop_front() {
            return Aio::Ok(Some(lease));
        }
        if let Some(error) = &state.error {
            return Aio::Error(FerryError::Io(std::io::Error::other(error.clone())));
        }
        if state.finished {
            return Aio::Ok(None);
        }
        state.waiter = Some(waiter.clone());
        Aio::Wait
    }
}

impl Drop for FileReader {
    fn drop(&mut self) {
        self.task.abort();
    }
}

enum WriterMessage {
    Data(BufferLease),
    Finalize,
}

#[derive(Default)]
struct WriterState {
    finalized: bool,
    error: Option<String>,
    waiter: Option<BufferWaiter>,
}

/// Writes buffers to a local file on a background task. The queue cannot
/// grow past the pool size since every entry holds a lease.
pub struct FileWriter {
    name: String,
    pool: BufferPool,
    tx: mpsc::UnboundedSender<WriterMessage>,
    state: Arc<Mutex<WriterState>>,
    finalize_sent: bool,
}

impl FileWriter {
    pub fn open(
        path: &Path,
        offset: u64,
        preallocate: Option<u64>,
        pool: BufferPool,
    ) -> Result<Self, FerryError> {
        let mut file = std::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        file.set_len(offset)?;
        if let Some(size) = preallocate.filter(|s| *s > offset) {
            debug!(file = %path.display(), size, "Preallocating");
            file.set_len(size)?;
        }
        file.seek(SeekFrom::Start(offset))?;
        let mut file = tokio::fs::File::from_std(file);

        let name = path.display().to_string();
        let state = Arc::new(Mutex::new(WriterState::default()));
        let (tx, mut rx) = mpsc::unbounded_channel();

        tokio::spawn({
            let state = state.clone();
            let name = name.clone();
            async move {
                let mut position = offset;
                while let Some(message) = rx.recv().await {
                    let result = match message {
                        WriterMessage::Data(lease) => {
                            let result = file.write_all(&lease).await;
                            position += lease.len() as u64;
                            drop(lease);
                            match result {
                                Ok(()) => continue,
                                Err(error) => Err(error),
                            }
                        }
                        WriterMessage::Finalize => finish(&mut file, position).await,
                    };
                    wake(&state, |state| {
                        match result {
                            Ok(()) => state.finalized = true,
                            Err(error) => {
                                warn!(file = %name, %error, "Write failed");
                                state.error = Some(error.to_string());
                            }
                        }
                        state.waiter.take()
                    });
                    break;
                }
            }
        });

        Ok(Self {
            name,
            pool,
            tx,
            state,
            finalize_sent: false,
        })
    }

    fn check(&self) -> Result<bool, FerryError> {
        #[allow(clippy::unwrap_used, reason = "panic on poison")]
        let state = self.state.lock().unwrap();
        match &state.error {
            Some(error) => Err(FerryError::Io(std::io::Error::other(error.clone()))),
            None => Ok(state.finalized),
        }
    }
}

async fn finish(file: &mut tokio::fs::File, position: u64) -> std::io::Result<()> {
    file.flush().await?;
    // drop preallocated space past the data
    file.set_len(position).await?;
    file.sync_data().await
}

impl Writer for FileWriter {
    fn name(&self) -> &str {
        &self.name
    }

    fn get_buffer(&mut self, waiter: &BufferWaiter) -> Aio<BufferLease> {
        if let Err(error) = self.check() {
            return Aio::Error(error);
        }
        match self.pool.try_lease(Some(waiter)) {
            Some(lease) => Aio::Ok(lease),
            None => Aio::Wait,
        }
    }

    fn add_buffer(&mut self, buffer: BufferLease, _waiter: &BufferWaiter) -> Aio<()> {
        if let Err(error) = self.check() {
            return Aio::Error(error);
        }
        if buffer.is_empty() {
            return Aio::Ok(());
        }
        match self.tx.send(WriterMessage::Data(buffer)) {
            Ok(()) => Aio::Ok(()),
            Err(_) => Aio::Error(FerryError::Io(std::io::ErrorKind::BrokenPipe.into())),
        }
    }

    fn finalize(&mut self, waiter: &BufferWaiter) -> Aio<()> {
        if !self.finalize_sent {
            self.finalize_sent = true;
            if self.tx.send(WriterMessage::Finalize).is_err() {
                return Aio::Error(FerryError::Io(std::io::ErrorKind::BrokenPipe.into()));
            }
        }
        #[allow(clippy::unwrap_used, reason = "panic on poison")]
        let mut state = self.state.lock().unwrap();
        if let Some(error) = &state.error {
            return Aio::Error(FerryError::Io(std::io::Error::other(error.clone())));
        }
        if state.finalized {
            return Aio::Ok(());
        }
        state.waiter = Some(waiter.clone());
        Aio::Wait
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;
    use crate::aio::AsyncWaiter;

    #[tokio::test]
    async fn reads_file_from_offset() {
        let mut source = tempfile::NamedTempFile::new().unwrap();
        source.write_all(b"hello world").unwrap();

        let pool = BufferPool::new(2, 4);
        let mut reader = FileReader::open(source.path(), 6, pool).unwrap();
        let waiter = AsyncWaiter::default();
        let mut data = Vec::new();
        while let Some(buffer) = waiter.read(&mut reader).await.unwrap() {
            data.extend_from_slice(&buffer);
        }
        assert_eq!(data, b"world");
    }

    #[tokio::test]
    async fn writes_and_trims_preallocation() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.bin");
        std::fs::write(&path, b"keepXXXX").unwrap();

        let pool = BufferPool::new(2, 4);
        let mut writer = FileWriter::open(&path, 4, Some(100), pool).unwrap();
        let waiter = AsyncWaiter::default();
        for chunk in [&b"abcd"[..], b"ef"] {
            let mut buffer = waiter.get_buffer(&mut writer).await.unwrap();
            buffer.extend_from_slice(chunk);
            waiter.add_buffer(&mut writer, buffer).await.unwrap();
        }
        waiter.finalize(&mut writer).await.unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"keepabcdef");
    }

    #[tokio::test]
    async fn missing_file_fails_to_open() {
        let dir = tempfile::tempdir().unwrap();
        let pool = BufferPool::new(1, 4);
        assert!(FileReader::open(&dir.path().join("nope"), 0, pool).is_err());
    }
}
