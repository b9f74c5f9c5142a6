use std::collections::HashMap;
use std::sync::Mutex;
use std::time::SystemTime;

use chrono::{DateTime, Utc};

use crate::{ServerKey, ServerPath};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub name: String,
    /// `-1` if unknown
    pub size: i64,
    pub is_dir: bool,
    pub is_link: bool,
    pub link_target: Option<String>,
    pub time: Option<DateTime<Utc>>,
    pub permissions: String,
    pub owner_group: String,
    /// Size or time may be outdated, e.g. after an interrupted upload
    pub unsure: bool,
}

impl DirEntry {
    pub fn file(name: impl Into<String>, size: i64) -> Self {
        Self {
            name: name.into(),
            size,
            is_dir: false,
            is_link: false,
            link_target: None,
            time: None,
            permissions: String::new(),
            owner_group: String::new(),
            unsure: false,
        }
    }

    pub fn dir(name: impl Into<String>) -> Self {
        Self {
            is_dir: true,
            ..Self::file(name, -1)
        }
    }
}

#[derive(Debug, Clone)]
pub struct DirectoryListing {
    pub path: ServerPath,
    pub entries: Vec<DirEntry>,
    pub failed: bool,
    /// Some entries were modified locally since the listing was fetched
    pub unsure: bool,
    pub fetched: SystemTime,
}

impl DirectoryListing {
    pub fn new(path: ServerPath, entries: Vec<DirEntry>) -> Self {
        Self {
            path,
            entries,
            failed: false,
            unsure: false,
            fetched: SystemTime::now(),
        }
    }

    /// Index of `name`, preferring an exact match over a case-insensitive
    /// one. The flag tells whether the case matched.
    pub fn find(&self, name: &str) -> Option<(usize, bool)> {
        if let Some(i) = self.entries.iter().position(|e| e.name == name) {
            return Some((i, true));
        }
        self.entries
            .iter()
            .position(|e| e.name.eq_ignore_ascii_case(name))
            .map(|i| (i, false))
    }
}

#[derive(Debug, Clone, Default)]
pub struct FileLookup {
    pub entry: Option<DirEntry>,
    /// A listing of the directory was cached
    pub dir_existed: bool,
    pub matched_case: bool,
}

/// Storage of fetched directory listings. The engine reads and
/// invalidates entries but never owns the storage.
pub trait DirectoryCache: Send + Sync {
    fn store(&self, server: &ServerKey, listing: DirectoryListing);

    fn lookup(&self, server: &ServerKey, path: &ServerPath) -> Option<DirectoryListing>;

    fn lookup_file(&self, server: &ServerKey, path: &ServerPath, filename: &str) -> FileLookup;

    /// Marks the entry as unsure so that the next lookup refreshes it.
    fn invalidate_file(&self, server: &ServerKey, path: &ServerPath, filename: &str);

    /// Inserts or replaces an entry in a cached listing, if one exists.
    fn update_file(&self, server: &ServerKey, path: &ServerPath, entry: DirEntry);

    fn remove_file(&self, server: &ServerKey, path: &ServerPath, filename: &str);

    /// Drops `dirname` from its parent and forgets every listing below it.
    fn remove_dir(&self, server: &ServerKey, path: &ServerPath, dirname: &str);

    fn invalidate_server(&self, server: &ServerKey);
}

#[derive(Default)]
pub struct MemoryDirectoryCache {
    listings: Mutex<HashMap<ServerKey, HashMap<ServerPath, DirectoryListing>>>,
}

impl MemoryDirectoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_listing<F: FnOnce(&mut DirectoryListing)>(
        &self,
        server: &ServerKey,
        path: &ServerPath,
        f: F,
    ) {
        #[allow(clippy::unwrap_used, reason = "panic on poison")]
        let mut listings = self.listings.lock().unwrap();
        if let Some(listing) = listings.get_mut(server).and_then(|l| l.get_mut(path)) {
            f(listing)
        }
    }
}

impl DirectoryCache for MemoryDirectoryCache {
    fn store(&self, server: &ServerKey, listing: DirectoryListing) {
        #[allow(clippy::unwrap_used, reason = "panic on poison")]
        let mut listings = self.listings.lock().unwrap();
        listings
            .entry(server.clone())
            .or_default()
            .insert(listing.path.clone(), listing);
    }

    fn lookup(&self, server: &ServerKey, path: &ServerPath) -> Option<DirectoryListing> {
        #[allow(clippy::unwrap_used, reason = "panic on poison")]
        let listings = self.listings.lock().unwrap();
        listings.get(server).and_then(|l| l.get(path)).cloned()
    }

    fn lookup_file(&self, server: &ServerKey, path: &ServerPath, filename: &str) -> FileLookup {
        let Some(listing) = self.lookup(server, path) else {
            return FileLookup::default();
        };
        match listing.find(filename) {
            Some((index, matched_case)) => FileLookup {
                entry: Some(listing.entries[index].clone()),
                dir_existed: true,
                matched_case,
            },
            None => FileLookup {
                entry: None,
                dir_existed: true,
                matched_case: false,
            },
        }
    }

    fn invalidate_file(&self, server: &ServerKey, path: &ServerPath, filename: &str) {
        self.with_listing(server, path, |listing| {
            if let Some((index, _)) = listing.find(filename) {
                listing.entries[index].unsure = true;
                listing.unsure = true;
            }
        });
    }

    fn update_file(&self, server: &ServerKey, path: &ServerPath, entry: DirEntry) {
        self.with_listing(server, path, |listing| {
            match listing.entries.iter_mut().find(|e| e.name == entry.name) {
                Some(existing) => *existing = entry,
                None => listing.entries.push(entry),
            }
            listing.unsure = true;
        });
    }

    fn remove_file(&self, server: &ServerKey, path: &ServerPath, filename: &str) {
        self.with_listing(server, path, |listing| {
            listing.entries.retain(|e| e.name != filename);
        });
    }

    fn remove_dir(&self, server: &ServerKey, path: &ServerPath, dirname: &str) {
        self.remove_file(server, path, dirname);
        let removed = path.add_segment(dirname);
        #[allow(clippy::unwrap_used, reason = "panic on poison")]
        let mut listings = self.listings.lock().unwrap();
        if let Some(server_listings) = listings.get_mut(server) {
            server_listings.retain(|p, _| *p != removed && !p.is_subdir_of(&removed));
        }
    }

    fn invalidate_server(&self, server: &ServerKey) {
        #[allow(clippy::unwrap_used, reason = "panic on poison")]
        let mut listings = self.listings.lock().unwrap();
        listings.remove(server);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Protocol, Server};

    fn key() -> ServerKey {
        Server::new(Protocol::Ftp, "example.com", 21).key()
    }

    #[test]
    fn lookup_reports_case_and_dir_existence() {
        let cache = MemoryDirectoryCache::new();
        let path = ServerPath::parse("/pub").unwrap();
        assert!(!cache.lookup_file(&key(), &path, "a.txt").dir_existed);

        cache.store(
            &key(),
            DirectoryListing::new(path.clone(), vec![DirEntry::file("A.txt", 10)]),
        );
        let exact = cache.lookup_file(&key(), &path, "A.txt");
        assert!(exact.dir_existed);
        assert!(exact.matched_case);
        assert_eq!(exact.entry.map(|e| e.size), Some(10));

        let folded = cache.lookup_file(&key(), &path, "a.txt");
        assert!(!folded.matched_case);
        assert!(folded.entry.is_some());

        let missing = cache.lookup_file(&key(), &path, "b.txt");
        assert!(missing.dir_existed);
        assert!(missing.entry.is_none());
    }

    #[test]
    fn invalidate_marks_unsure() {
        let cache = MemoryDirectoryCache::new();
        let path = ServerPath::root();
        cache.store(
            &key(),
            DirectoryListing::new(path.clone(), vec![DirEntry::file("f", 1)]),
        );
        cache.invalidate_file(&key(), &path, "f");
        let entry = cache.lookup_file(&key(), &path, "f").entry.unwrap();
        assert!(entry.unsure);
    }

    #[test]
    fn remove_dir_drops_subtree() {
        let cache = MemoryDirectoryCache::new();
        let root = ServerPath::root();
        let sub = ServerPath::parse("/d").unwrap();
        let deeper = ServerPath::parse("/d/e").unwrap();
        cache.store(&key(), DirectoryListing::new(root.clone(), vec![DirEntry::dir("d")]));
        cache.store(&key(), DirectoryListing::new(sub.clone(), vec![DirEntry::dir("e")]));
        cache.store(&key(), DirectoryListing::new(deeper.clone(), vec![]));

        cache.remove_dir(&key(), &root, "d");
        assert!(cache.lookup(&key(), &sub).is_none());
        assert!(cache.lookup(&key(), &deeper).is_none());
        assert!(cache.lookup(&key(), &root).unwrap().entries.is_empty());
    }
}
