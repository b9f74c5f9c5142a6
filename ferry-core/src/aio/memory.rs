use ferry_common::MemoryFile;

use super::{Aio, Reader, Writer};
use crate::buffer_pool::{BufferLease, BufferPool, BufferWaiter};

pub struct MemoryReader {
    file: MemoryFile,
    offset: u64,
    pool: BufferPool,
}

impl MemoryReader {
    pub fn new(file: MemoryFile, offset: u64, pool: BufferPool) -> Self {
        Self { file, offset, pool }
    }
}

impl Reader for MemoryReader {
    fn name(&self) -> &str {
        "memory"
    }

    fn read(&mut self, waiter: &BufferWaiter) -> Aio<Option<BufferLease>> {
        if self.offset >= self.file.len() {
            return Aio::Ok(None);
        }
        let Some(mut lease) = self.pool.try_lease(Some(waiter)) else {
            return Aio::Wait;
        };
        let capacity = lease.capacity();
        lease.resize(capacity, 0);
        let n = self.file.read_at(self.offset, &mut lease[..]);
        lease.truncate(n);
        self.offset += n as u64;
        Aio::Ok(Some(lease))
    }
}

pub struct MemoryWriter {
    file: MemoryFile,
    pool: BufferPool,
}

impl MemoryWriter {
    pub fn new(file: MemoryFile, offset: u64, pool: BufferPool) -> Self {
        file.truncate(offset);
        Self { file, pool }
    }
}

impl Writer for MemoryWriter {
    fn name(&self) -> &str {
        "memory"
    }

    fn get_buffer(&mut self, waiter: &BufferWaiter) -> Aio<BufferLease> {
        match self.pool.try_lease(Some(waiter)) {
            Some(lease) => Aio::Ok(lease),
            None => Aio::Wait,
        }
    }

    fn add_buffer(&mut self, buffer: BufferLease, _waiter: &BufferWaiter) -> Aio<()> {
        self.file.append(&buffer);
        Aio::Ok(())
    }

    fn finalize(&mut self, _waiter: &BufferWaiter) -> Aio<()> {
        Aio::Ok(())
    }
}
