use std::fmt::Debug;
use std::sync::{Arc, Mutex};

use bytes::{Bytes, BytesMut};
use serde::{Deserialize, Serialize};

#[derive(PartialEq, Eq, Clone, Default)]
pub struct Secret<T>(T);

impl<T> Secret<T> {
    pub const fn new(v: T) -> Self {
        Self(v)
    }

    pub fn expose_secret(&self) -> &T {
        &self.0
    }
}

impl<T> From<T> for Secret<T> {
    fn from(v: T) -> Self {
        Self::new(v)
    }
}

impl<'de, T> Deserialize<'de> for Secret<T>
where
    T: Deserialize<'de>,
{
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let v = Deserialize::deserialize::<D>(deserializer)?;
        Ok(Self::new(v))
    }
}

impl<T> Serialize for Secret<T>
where
    T: Serialize,
{
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        self.0.serialize(serializer)
    }
}

impl<T> Debug for Secret<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "<secret>")
    }
}

/// A growable in-memory file shared between the caller and a transfer.
#[derive(Clone, Default)]
pub struct MemoryFile {
    inner: Arc<Mutex<BytesMut>>,
}

impl MemoryFile {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_bytes(data: impl AsRef<[u8]>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(BytesMut::from(data.as_ref()))),
        }
    }

    #[allow(clippy::unwrap_used, reason = "panic on poison")]
    pub fn contents(&self) -> Bytes {
        self.inner.lock().unwrap().clone().freeze()
    }

    #[allow(clippy::unwrap_used, reason = "panic on poison")]
    pub fn len(&self) -> u64 {
        self.inner.lock().unwrap().len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[allow(clippy::unwrap_used, reason = "panic on poison")]
    pub fn truncate(&self, len: u64) {
        self.inner.lock().unwrap().truncate(len as usize);
    }

    #[allow(clippy::unwrap_used, reason = "panic on poison")]
    pub fn append(&self, data: &[u8]) {
        self.inner.lock().unwrap().extend_from_slice(data);
    }

    /// Copies up to `buf.len()` bytes starting at `offset`.
    #[allow(clippy::unwrap_used, reason = "panic on poison")]
    pub fn read_at(&self, offset: u64, buf: &mut [u8]) -> usize {
        let data = self.inner.lock().unwrap();
        let offset = offset as usize;
        if offset >= data.len() {
            return 0;
        }
        let n = buf.len().min(data.len() - offset);
        buf[..n].copy_from_slice(&data[offset..offset + n]);
        n
    }
}

impl Debug for MemoryFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "MemoryFile({} bytes)", self.len())
    }
}
