use std::fs::File;
use std::os::fd::{AsRawFd, OwnedFd};
use std::os::unix::fs::FileExt;

use nix::fcntl::{fcntl, FcntlArg, FdFlag};

use crate::buffer_pool::{BufferLease, BufferPool};

use super::HelperProcessError;

/// File-backed memory mirroring the slots of a [BufferPool]. The helper
/// maps the same file and both sides only exchange `(offset, length)`.
#[derive(Debug)]
pub struct SharedRegion {
    file: File,
    size: u64,
}

impl SharedRegion {
    pub fn for_pool(pool: &BufferPool) -> Result<Self, HelperProcessError> {
        let size = (pool.count() * pool.buffer_size()) as u64;
        let file = tempfile::tempfile()?;
        file.set_len(size)?;
        Ok(Self { file, size })
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    /// A descriptor of the region that survives `exec`, for handing to a
    /// child process. The parent must drop it once the child started.
    pub fn inheritable_fd(&self) -> Result<OwnedFd, HelperProcessError> {
        let fd = OwnedFd::from(self.file.try_clone()?);
        let flags = fcntl(fd.as_raw_fd(), FcntlArg::F_GETFD).map_err(std::io::Error::from)?;
        let flags = FdFlag::from_bits_truncate(flags) - FdFlag::FD_CLOEXEC;
        fcntl(fd.as_raw_fd(), FcntlArg::F_SETFD(flags)).map_err(std::io::Error::from)?;
        Ok(fd)
    }

    /// Publishes the contents of `lease` in its slot.
    pub fn store(&self, lease: &BufferLease) -> Result<(), HelperProcessError> {
        self.check(lease.region_offset(), lease.len())?;
        self.file.write_all_at(lease, lease.region_offset())?;
        Ok(())
    }

    /// Replaces the contents of `lease` with `len` bytes the helper wrote
    /// into its slot.
    pub fn load(&self, lease: &mut BufferLease, len: usize) -> Result<(), HelperProcessError> {
        if len > lease.capacity() {
            return Err(HelperProcessError::Malformed(format!(
                "{len} bytes do not fit a buffer"
            )));
        }
        self.check(lease.region_offset(), len)?;
        let offset = lease.region_offset();
        lease.clear();
        lease.resize(len, 0);
        self.file.read_exact_at(&mut lease[..], offset)?;
        Ok(())
    }

    /// Writes into the region the way a helper does.
    #[cfg(test)]
    pub(crate) fn write_at(&self, offset: u64, data: &[u8]) -> Result<(), HelperProcessError> {
        self.check(offset, data.len())?;
        self.file.write_all_at(data, offset)?;
        Ok(())
    }

    fn check(&self, offset: u64, len: usize) -> Result<(), HelperProcessError> {
        if offset + len as u64 > self.size {
            return Err(HelperProcessError::Malformed(format!(
                "range {offset}+{len} outside the shared region"
            )));
        }
        Ok(())
    }
}

/// `-<offset> <length>` as written to the helper.
pub fn format_range(offset: u64, len: usize) -> String {
    format!("-{offset} {len}")
}

pub fn parse_range(line: &str) -> Option<(u64, usize)> {
    let (offset, len) = line.strip_prefix('-')?.split_once(' ')?;
    Some((offset.parse().ok()?, len.trim().parse().ok()?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slots_round_trip_through_the_file() {
        let pool = BufferPool::new(2, 16);
        let region = SharedRegion::for_pool(&pool).unwrap();
        assert_eq!(region.size(), 32);

        let mut first = pool.try_lease(None).unwrap();
        let mut second = pool.try_lease(None).unwrap();
        first.extend_from_slice(b"hello");
        second.extend_from_slice(b"world!");
        region.store(&first).unwrap();
        region.store(&second).unwrap();

        region.load(&mut first, 3).unwrap();
        assert_eq!(&first[..], b"hel");
        region.load(&mut second, 6).unwrap();
        assert_eq!(&second[..], b"world!");
        assert!(region.load(&mut second, 17).is_err());
    }

    #[test]
    fn child_descriptor_survives_exec() {
        let region = SharedRegion::for_pool(&BufferPool::new(1, 8)).unwrap();
        let own = fcntl(region.file.as_raw_fd(), FcntlArg::F_GETFD).unwrap();
        assert!(FdFlag::from_bits_truncate(own).contains(FdFlag::FD_CLOEXEC));

        let fd = region.inheritable_fd().unwrap();
        assert_ne!(fd.as_raw_fd(), region.file.as_raw_fd());
        let flags = fcntl(fd.as_raw_fd(), FcntlArg::F_GETFD).unwrap();
        assert!(!FdFlag::from_bits_truncate(flags).contains(FdFlag::FD_CLOEXEC));
    }

    #[test]
    fn range_lines() {
        assert_eq!(format_range(131072, 42), "-131072 42");
        assert_eq!(parse_range("-131072 42"), Some((131072, 42)));
        assert_eq!(parse_range("131072 42"), None);
        assert_eq!(parse_range("-x 1"), None);
    }
}
