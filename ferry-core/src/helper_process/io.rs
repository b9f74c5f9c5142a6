use ferry_common::FerryError;

use super::{format_range, SharedRegion};
use crate::aio::{Aio, Reader, Writer};
use crate::buffer_pool::{BufferLease, BufferWaiter};

/// What to do after a buffer request of the helper was looked at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IoStep {
    /// Write this line to the helper
    Answer(String),
    /// The local side is not ready, the waiter will be called
    Wait,
    /// The local side is complete
    Done,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Pending {
    Nothing,
    /// Next buffer for the helper to fill or to send
    Buffer,
    Finalize,
}

enum Local {
    Download(Box<dyn Writer>),
    Upload(Box<dyn Reader>),
}

/// Lends pool buffers to a helper during one transfer. Downloads hand out
/// empty slots the helper fills; uploads hand out filled slots the helper
/// sends. Only `-<offset> <length>` lines cross the pipe.
pub struct HelperIo {
    local: Local,
    /// The buffer the helper currently works on
    lent: Option<BufferLease>,
    pending: Pending,
    transferred: u64,
}

impl HelperIo {
    pub fn download(writer: Box<dyn Writer>) -> Self {
        Self::new(Local::Download(writer))
    }

    pub fn upload(reader: Box<dyn Reader>) -> Self {
        Self::new(Local::Upload(reader))
    }

    fn new(local: Local) -> Self {
        Self {
            local,
            lent: None,
            pending: Pending::Nothing,
            transferred: 0,
        }
    }

    pub fn is_waiting(&self) -> bool {
        self.pending != Pending::Nothing
    }

    /// Bytes moved through the region so far.
    pub fn transferred(&self) -> u64 {
        self.transferred
    }

    /// The helper is done with the lent buffer, having written `written`
    /// bytes into it when downloading, and wants the next one.
    pub fn next_buffer(
        &mut self,
        written: usize,
        region: &SharedRegion,
        waiter: &BufferWaiter,
    ) -> Result<IoStep, FerryError> {
        self.take_back(written, region, waiter)?;
        self.pending = Pending::Buffer;
        self.lend(region, waiter)
    }

    /// The helper finished; for downloads `written` bytes are in the last
    /// lent buffer.
    pub fn finalize(
        &mut self,
        written: usize,
        region: &SharedRegion,
        waiter: &BufferWaiter,
    ) -> Result<IoStep, FerryError> {
        self.take_back(written, region, waiter)?;
        self.pending = Pending::Finalize;
        self.flush(waiter)
    }

    /// Retries what waited. `None` if nothing did.
    pub fn resume(
        &mut self,
        region: &SharedRegion,
        waiter: &BufferWaiter,
    ) -> Result<Option<IoStep>, FerryError> {
        match self.pending {
            Pending::Nothing => Ok(None),
            Pending::Buffer => self.lend(region, waiter).map(Some),
            Pending::Finalize => self.flush(waiter).map(Some),
        }
    }

    fn take_back(
        &mut self,
        written: usize,
        region: &SharedRegion,
        waiter: &BufferWaiter,
    ) -> Result<(), FerryError> {
        let Some(mut lease) = self.lent.take() else {
            if written > 0 {
                return Err(FerryError::Other(
                    format!("helper reported {written} bytes without a buffer").into(),
                ));
            }
            return Ok(());
        };
        match &mut self.local {
            Local::Download(writer) => {
                region.load(&mut lease, written).map_err(FerryError::other)?;
                self.transferred += written as u64;
                match writer.add_buffer(lease, waiter) {
                    Aio::Error(error) => Err(error),
                    // backlog shows up again in get_buffer
                    Aio::Ok(()) | Aio::Wait => Ok(()),
                }
            }
            Local::Upload(_) => Ok(()),
        }
    }

    fn lend(&mut self, region: &SharedRegion, waiter: &BufferWaiter) -> Result<IoStep, FerryError> {
        let lease = match &mut self.local {
            Local::Download(writer) => match writer.get_buffer(waiter) {
                Aio::Ok(lease) => lease,
                Aio::Wait => return Ok(IoStep::Wait),
                Aio::Error(error) => return Err(error),
            },
            Local::Upload(reader) => match reader.read(waiter) {
                Aio::Ok(Some(lease)) => {
                    region.store(&lease).map_err(FerryError::other)?;
                    self.transferred += lease.len() as u64;
                    lease
                }
                Aio::Ok(None) => {
                    self.pending = Pending::Nothing;
                    return Ok(IoStep::Answer(format_range(0, 0)));
                }
                Aio::Wait => return Ok(IoStep::Wait),
                Aio::Error(error) => return Err(error),
            },
        };
        self.pending = Pending::Nothing;
        let len = match self.local {
            Local::Download(_) => lease.capacity(),
            Local::Upload(_) => lease.len(),
        };
        let line = format_range(lease.region_offset(), len);
        self.lent = Some(lease);
        Ok(IoStep::Answer(line))
    }

    fn flush(&mut self, waiter: &BufferWaiter) -> Result<IoStep, FerryError> {
        if let Local::Download(writer) = &mut self.local {
            match writer.finalize(waiter) {
                Aio::Ok(()) => {}
                Aio::Wait => return Ok(IoStep::Wait),
                Aio::Error(error) => return Err(error),
            }
        }
        self.pending = Pending::Nothing;
        Ok(IoStep::Done)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use ferry_common::MemoryFile;

    use super::*;
    use crate::aio::{MemoryReader, MemoryWriter};
    use crate::buffer_pool::BufferPool;
    use crate::helper_process::parse_range;

    fn noop() -> BufferWaiter {
        Arc::new(|| {})
    }

    #[test]
    fn download_hands_out_slots_and_finalizes() {
        let pool = BufferPool::new(4, 8);
        let region = SharedRegion::for_pool(&pool).unwrap();
        let target = MemoryFile::new();
        let writer = MemoryWriter::new(target.clone(), 0, pool.clone());
        let mut io = HelperIo::download(Box::new(writer));
        let waiter = noop();

        let mut written = 0;
        for chunk in [&b"hello, "[..], b"world"] {
            let IoStep::Answer(line) = io.next_buffer(written, &region, &waiter).unwrap() else {
                panic!("expected a buffer");
            };
            let (offset, len) = parse_range(&line).unwrap();
            assert_eq!(len, 8);
            region.write_at(offset, chunk).unwrap();
            written = chunk.len();
        }
        assert_eq!(io.finalize(written, &region, &waiter).unwrap(), IoStep::Done);
        assert!(!io.is_waiting());
        assert_eq!(io.transferred(), 12);
        assert_eq!(&target.contents()[..], b"hello, world");
    }

    #[test]
    fn download_waits_for_the_pool() {
        let pool = BufferPool::new(1, 8);
        let region = SharedRegion::for_pool(&pool).unwrap();
        let writer = MemoryWriter::new(MemoryFile::new(), 0, pool.clone());
        let mut io = HelperIo::download(Box::new(writer));
        let waiter = noop();

        let held = pool.try_lease(None).unwrap();
        assert_eq!(io.next_buffer(0, &region, &waiter).unwrap(), IoStep::Wait);
        assert!(io.is_waiting());
        drop(held);
        assert!(matches!(
            io.resume(&region, &waiter).unwrap(),
            Some(IoStep::Answer(_))
        ));
        assert!(!io.is_waiting());
    }

    #[test]
    fn upload_sends_filled_slots_then_end() {
        let pool = BufferPool::new(2, 4);
        let region = SharedRegion::for_pool(&pool).unwrap();
        let source = MemoryFile::from_bytes(b"abcdef");
        let reader = MemoryReader::new(source, 0, pool.clone());
        let mut io = HelperIo::upload(Box::new(reader));
        let waiter = noop();

        let mut lengths = vec![];
        loop {
            match io.next_buffer(0, &region, &waiter).unwrap() {
                IoStep::Answer(line) => {
                    let (_, len) = parse_range(&line).unwrap();
                    if len == 0 {
                        break;
                    }
                    lengths.push(len);
                }
                other => panic!("unexpected {other:?}"),
            }
        }
        assert_eq!(lengths, vec![4, 2]);
        assert_eq!(io.transferred(), 6);
        assert_eq!(io.finalize(0, &region, &waiter).unwrap(), IoStep::Done);
    }

    #[test]
    fn bytes_without_a_buffer_are_rejected() {
        let pool = BufferPool::new(1, 8);
        let region = SharedRegion::for_pool(&pool).unwrap();
        let writer = MemoryWriter::new(MemoryFile::new(), 0, pool.clone());
        let mut io = HelperIo::download(Box::new(writer));
        assert!(io.next_buffer(3, &region, &noop()).is_err());
    }
}
