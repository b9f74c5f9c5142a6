//! Buffer producers and consumers sitting between a socket and local data.
//!
//! Every call answers [Aio::Wait] instead of blocking. The waiter given to
//! that call is invoked exactly once when it makes sense to call again.

use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use ferry_common::{FerryError, LocalEndpoint};
use tokio::sync::Notify;

use crate::buffer_pool::{BufferLease, BufferPool, BufferWaiter};

mod file;
mod memory;

pub use file::{FileReader, FileWriter};
pub use memory::{MemoryReader, MemoryWriter};

#[derive(Debug)]
pub enum Aio<T> {
    Ok(T),
    /// Nothing can be done now, the waiter will be called.
    Wait,
    Error(FerryError),
}

impl<T> Aio<T> {
    pub fn is_wait(&self) -> bool {
        matches!(self, Aio::Wait)
    }
}

pub trait Reader: Send {
    fn name(&self) -> &str;

    /// The next filled buffer, `None` once all data has been read.
    fn read(&mut self, waiter: &BufferWaiter) -> Aio<Option<BufferLease>>;
}

pub trait Writer: Send {
    fn name(&self) -> &str;

    /// An empty buffer to fill and pass to [Writer::add_buffer].
    fn get_buffer(&mut self, waiter: &BufferWaiter) -> Aio<BufferLease>;

    /// Always takes the buffer. `Wait` means the writer is backlogged and
    /// the waiter fires once it caught up.
    fn add_buffer(&mut self, buffer: BufferLease, waiter: &BufferWaiter) -> Aio<()>;

    /// Flushes everything written so far. Returns `Ok` once the data is
    /// durable.
    fn finalize(&mut self, waiter: &BufferWaiter) -> Aio<()>;
}

/// Where a transfer reads from: knows the source's size and time and opens
/// a [Reader] at an offset.
#[derive(Clone, Debug)]
pub struct ReaderFactory {
    endpoint: LocalEndpoint,
}

impl ReaderFactory {
    pub fn new(endpoint: LocalEndpoint) -> Self {
        Self { endpoint }
    }

    pub fn name(&self) -> String {
        endpoint_name(&self.endpoint)
    }

    pub fn size(&self) -> Option<u64> {
        match &self.endpoint {
            LocalEndpoint::File(path) => std::fs::metadata(path).ok().map(|m| m.len()),
            LocalEndpoint::Memory(file) => Some(file.len()),
        }
    }

    pub fn mtime(&self) -> Option<DateTime<Utc>> {
        match &self.endpoint {
            LocalEndpoint::File(path) => std::fs::metadata(path)
                .and_then(|m| m.modified())
                .ok()
                .map(DateTime::<Utc>::from),
            LocalEndpoint::Memory(_) => None,
        }
    }

    pub fn open(&self, offset: u64, pool: &BufferPool) -> Result<Box<dyn Reader>, FerryError> {
        Ok(match &self.endpoint {
            LocalEndpoint::File(path) => Box::new(FileReader::open(path, offset, pool.clone())?),
            LocalEndpoint::Memory(file) => {
                Box::new(MemoryReader::new(file.clone(), offset, pool.clone()))
            }
        })
    }
}

/// Where a transfer writes to.
#[derive(Clone, Debug)]
pub struct WriterFactory {
    endpoint: LocalEndpoint,
    preallocate: bool,
}

impl WriterFactory {
    pub fn new(endpoint: LocalEndpoint) -> Self {
        Self {
            endpoint,
            preallocate: false,
        }
    }

    pub fn with_preallocation(mut self, enabled: bool) -> Self {
        self.preallocate = enabled;
        self
    }

    pub fn name(&self) -> String {
        endpoint_name(&self.endpoint)
    }

    pub fn is_file(&self) -> bool {
        matches!(self.endpoint, LocalEndpoint::File(_))
    }

    /// Size of what is already there, for resuming.
    pub fn size(&self) -> Option<u64> {
        match &self.endpoint {
            LocalEndpoint::File(path) => std::fs::metadata(path).ok().map(|m| m.len()),
            LocalEndpoint::Memory(file) => Some(file.len()),
        }
    }

    pub fn mtime(&self) -> Option<DateTime<Utc>> {
        match &self.endpoint {
            LocalEndpoint::File(path) => std::fs::metadata(path)
                .and_then(|m| m.modified())
                .ok()
                .map(DateTime::<Utc>::from),
            LocalEndpoint::Memory(_) => None,
        }
    }

    /// Creates missing parent directories of a local target file and returns
    /// the topmost one that was created.
    pub fn ensure_parent_dir(&self) -> Result<Option<PathBuf>, FerryError> {
        let LocalEndpoint::File(path) = &self.endpoint else {
            return Ok(None);
        };
        let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) else {
            return Ok(None);
        };
        let mut topmost = None;
        let mut dir = parent;
        while !dir.exists() {
            topmost = Some(dir.to_path_buf());
            match dir.parent() {
                Some(p) if !p.as_os_str().is_empty() => dir = p,
                _ => break,
            }
        }
        if topmost.is_some() {
            std::fs::create_dir_all(parent)?;
        }
        Ok(topmost)
    }

    pub fn set_mtime(&self, time: DateTime<Utc>) -> Result<(), FerryError> {
        if let LocalEndpoint::File(path) = &self.endpoint {
            let file = std::fs::OpenOptions::new().write(true).open(path)?;
            file.set_modified(time.into())?;
        }
        Ok(())
    }

    /// Opens the target, truncated to `offset`. `expected_size` is used to
    /// reserve disk space when preallocation is on.
    pub fn open(
        &self,
        offset: u64,
        expected_size: Option<u64>,
        pool: &BufferPool,
    ) -> Result<Box<dyn Writer>, FerryError> {
        Ok(match &self.endpoint {
            LocalEndpoint::File(path) => Box::new(FileWriter::open(
                path,
                offset,
                expected_size.filter(|_| self.preallocate),
                pool.clone(),
            )?),
            LocalEndpoint::Memory(file) => {
                Box::new(MemoryWriter::new(file.clone(), offset, pool.clone()))
            }
        })
    }
}

fn endpoint_name(endpoint: &LocalEndpoint) -> String {
    match endpoint {
        LocalEndpoint::File(path) => path.display().to_string(),
        LocalEndpoint::Memory(_) => "memory".into(),
    }
}

/// Bridges the waiter callbacks into `async` code.
#[derive(Clone)]
pub struct AsyncWaiter {
    notify: Arc<Notify>,
    waiter: BufferWaiter,
}

impl Default for AsyncWaiter {
    fn default() -> Self {
        let notify = Arc::new(Notify::new());
        let waiter: BufferWaiter = {
            let notify = notify.clone();
            Arc::new(move || notify.notify_one())
        };
        Self { notify, waiter }
    }
}

impl AsyncWaiter {
    pub fn waiter(&self) -> &BufferWaiter {
        &self.waiter
    }

    pub async fn poll<T>(&self, mut op: impl FnMut(&BufferWaiter) -> Aio<T>) -> Result<T, FerryError> {
        loop {
            match op(&self.waiter) {
                Aio::Ok(value) => return Ok(value),
                Aio::Error(error) => return Err(error),
                Aio::Wait => self.notify.notified().await,
            }
        }
    }

    pub async fn read(&self, reader: &mut dyn Reader) -> Result<Option<BufferLease>, FerryError> {
        self.poll(|w| reader.read(w)).await
    }

    pub async fn get_buffer(&self, writer: &mut dyn Writer) -> Result<BufferLease, FerryError> {
        self.poll(|w| writer.get_buffer(w)).await
    }

    pub async fn add_buffer(
        &self,
        writer: &mut dyn Writer,
        buffer: BufferLease,
    ) -> Result<(), FerryError> {
        let mut buffer = Some(buffer);
        self.poll(|w| match buffer.take() {
            Some(b) => writer.add_buffer(b, w),
            None => Aio::Ok(()),
        })
        .await
    }

    pub async fn finalize(&self, writer: &mut dyn Writer) -> Result<(), FerryError> {
        self.poll(|w| writer.finalize(w)).await
    }
}

#[cfg(test)]
mod tests {
    use ferry_common::MemoryFile;

    use super::*;

    #[tokio::test]
    async fn memory_round_trip_through_factories() {
        let pool = BufferPool::new(2, 4);
        let source = MemoryFile::from_bytes(b"0123456789");
        let target = MemoryFile::new();

        let readers = ReaderFactory::new(LocalEndpoint::Memory(source));
        let writers = WriterFactory::new(LocalEndpoint::Memory(target.clone()));
        assert_eq!(readers.size(), Some(10));

        let mut reader = readers.open(2, &pool).unwrap();
        let mut writer = writers.open(0, None, &pool).unwrap();
        let waiter = AsyncWaiter::default();
        while let Some(buffer) = waiter.read(reader.as_mut()).await.unwrap() {
            let mut out = waiter.get_buffer(writer.as_mut()).await.unwrap();
            out.extend_from_slice(&buffer);
            drop(buffer);
            waiter.add_buffer(writer.as_mut(), out).await.unwrap();
        }
        waiter.finalize(writer.as_mut()).await.unwrap();
        assert_eq!(&target.contents()[..], b"23456789");
    }

    #[test]
    fn reports_topmost_created_directory() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("a").join("b").join("file.txt");
        let writers = WriterFactory::new(LocalEndpoint::File(target.clone()));
        assert_eq!(
            writers.ensure_parent_dir().unwrap(),
            Some(dir.path().join("a"))
        );
        assert!(target.parent().unwrap().is_dir());
        assert_eq!(writers.ensure_parent_dir().unwrap(), None);
    }
}
