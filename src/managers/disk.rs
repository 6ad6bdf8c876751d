use std::{
    collections::HashMap,
    fmt, fs, io,
    path::{Path, PathBuf},
};

use log::{debug, warn};
use lru::LruCache;
use parking_lot::Mutex;

use crate::{Cache, CacheEntry};

/// First word of every entry file
const CACHE_MAGIC: u32 = 0x2015_0306;

/// Length prefix standing for an absent string
const ABSENT: u32 = u32::MAX;

/// Pruning drains the store down to this fraction of the budget
const HYSTERESIS_FACTOR: f32 = 0.9;

/// Implements [`Cache`] as a size-budgeted LRU over a directory of entry
/// files.
///
/// Each entry is one file named by the hash of its cache key, holding the
/// key, the freshness metadata, the response headers, and the raw body in a
/// fixed little-endian layout. Construction does no I/O; the directory is
/// scanned by [`initialize`](Cache::initialize).
pub struct DiskCache {
    root: PathBuf,
    max_size_bytes: u64,
    state: Mutex<DiskState>,
}

struct DiskState {
    /// Eviction index; values are per-entry file sizes
    entries: LruCache<String, u64>,
    total_size: u64,
}

impl fmt::Debug for DiskCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DiskCache")
            .field("root", &self.root)
            .field("max_size_bytes", &self.max_size_bytes)
            .finish_non_exhaustive()
    }
}

impl DiskCache {
    /// Create a cache rooted at `root` with a total size budget
    pub fn new(root: impl Into<PathBuf>, max_size_bytes: u64) -> Self {
        Self {
            root: root.into(),
            max_size_bytes,
            state: Mutex::new(DiskState {
                entries: LruCache::unbounded(),
                total_size: 0,
            }),
        }
    }

    fn entry_path(&self, key: &str) -> PathBuf {
        self.root.join(hex::encode(blake3::hash(key.as_bytes()).as_bytes()))
    }

    fn evict_locked(&self, state: &mut DiskState, key: &str) {
        if let Some(size) = state.entries.pop(key) {
            state.total_size -= size;
        }
        if let Err(error) = remove_if_present(&self.entry_path(key)) {
            warn!("failed to remove cache file for {key}: {error}");
        }
    }

    fn read_locked(
        &self,
        state: &mut DiskState,
        key: &str,
    ) -> io::Result<Option<CacheEntry>> {
        if state.entries.get(key).is_none() {
            return Ok(None);
        }
        let buf = match fs::read(self.entry_path(key)) {
            Ok(buf) => buf,
            Err(error) if error.kind() == io::ErrorKind::NotFound => {
                self.evict_locked(state, key);
                return Ok(None);
            }
            Err(error) => return Err(error),
        };
        match decode_entry(&buf) {
            Ok((stored_key, entry)) if stored_key == key => Ok(Some(entry)),
            Ok(_) | Err(_) => {
                warn!("evicting corrupt cache entry for {key}");
                self.evict_locked(state, key);
                Ok(None)
            }
        }
    }

    fn write_locked(
        &self,
        state: &mut DiskState,
        key: &str,
        entry: &CacheEntry,
    ) -> io::Result<()> {
        let buf = encode_entry(key, entry);
        let size = buf.len() as u64;
        self.prune_locked(state, size);
        fs::create_dir_all(&self.root)?;
        fs::write(self.entry_path(key), &buf)?;
        if let Some(previous) = state.entries.put(key.to_owned(), size) {
            state.total_size -= previous;
        }
        state.total_size += size;
        Ok(())
    }

    fn prune_locked(&self, state: &mut DiskState, incoming: u64) {
        if state.total_size + incoming <= self.max_size_bytes {
            return;
        }
        let budget =
            (self.max_size_bytes as f32 * HYSTERESIS_FACTOR) as u64;
        let before = state.entries.len();
        while state.total_size + incoming > budget {
            let Some((key, size)) = state.entries.pop_lru() else {
                break;
            };
            state.total_size -= size;
            if let Err(error) = remove_if_present(&self.entry_path(&key)) {
                warn!("failed to remove cache file for {key}: {error}");
            }
        }
        debug!(
            "pruned {} entries, {} bytes in use",
            before - state.entries.len(),
            state.total_size
        );
    }
}

impl Cache for DiskCache {
    fn initialize(&self) -> io::Result<()> {
        let mut state = self.state.lock();
        state.entries.clear();
        state.total_size = 0;
        fs::create_dir_all(&self.root)?;
        for dir_entry in fs::read_dir(&self.root)? {
            let path = dir_entry?.path();
            if !path.is_file() {
                continue;
            }
            let buf = fs::read(&path)?;
            match decode_entry(&buf) {
                Ok((key, _)) => {
                    state.entries.put(key, buf.len() as u64);
                    state.total_size += buf.len() as u64;
                }
                Err(_) => {
                    warn!("dropping unreadable cache file {}", path.display());
                    remove_if_present(&path)?;
                }
            }
        }
        debug!(
            "cache initialized: {} entries, {} bytes",
            state.entries.len(),
            state.total_size
        );
        Ok(())
    }

    fn get(&self, key: &str) -> io::Result<Option<CacheEntry>> {
        let mut state = self.state.lock();
        self.read_locked(&mut state, key)
    }

    fn put(&self, key: &str, entry: CacheEntry) -> io::Result<()> {
        let mut state = self.state.lock();
        self.write_locked(&mut state, key, &entry)
    }

    fn invalidate(&self, key: &str, full_expire: bool) -> io::Result<()> {
        // one lock acquisition for the whole read-modify-write; a concurrent
        // put must not land between the read and the write-back
        let mut state = self.state.lock();
        let Some(mut entry) = self.read_locked(&mut state, key)? else {
            return Ok(());
        };
        entry.soft_ttl = 0;
        if full_expire {
            entry.ttl = 0;
        }
        self.write_locked(&mut state, key, &entry)
    }

    fn remove(&self, key: &str) -> io::Result<()> {
        let mut state = self.state.lock();
        self.evict_locked(&mut state, key);
        Ok(())
    }

    fn clear(&self) -> io::Result<()> {
        let mut state = self.state.lock();
        let keys: Vec<String> =
            state.entries.iter().map(|(key, _)| key.clone()).collect();
        for key in keys {
            self.evict_locked(&mut state, &key);
        }
        state.total_size = 0;
        Ok(())
    }
}

fn remove_if_present(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(error) if error.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(error) => Err(error),
    }
}

fn corrupt() -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, "corrupt cache entry")
}

/// Serialize an entry: magic, key, nullable etag, the four time stamps,
/// header count + pairs, then the raw body to end of file. All integers
/// little-endian, strings u32-length-prefixed UTF-8.
fn encode_entry(key: &str, entry: &CacheEntry) -> Vec<u8> {
    let mut buf = Vec::with_capacity(64 + key.len() + entry.data.len());
    push_u32(&mut buf, CACHE_MAGIC);
    push_string(&mut buf, key);
    match &entry.etag {
        Some(etag) => push_string(&mut buf, etag),
        None => push_u32(&mut buf, ABSENT),
    }
    push_i64(&mut buf, entry.server_date);
    push_i64(&mut buf, entry.last_modified);
    push_i64(&mut buf, entry.ttl);
    push_i64(&mut buf, entry.soft_ttl);
    push_u32(&mut buf, entry.response_headers.len() as u32);
    for (name, value) in &entry.response_headers {
        push_string(&mut buf, name);
        push_string(&mut buf, value);
    }
    buf.extend_from_slice(&entry.data);
    buf
}

/// Inverse of [`encode_entry`]; returns the stored key and the entry
fn decode_entry(buf: &[u8]) -> io::Result<(String, CacheEntry)> {
    let mut reader = SliceReader { buf, pos: 0 };
    if reader.u32()? != CACHE_MAGIC {
        return Err(corrupt());
    }
    let key = reader.string()?.ok_or_else(corrupt)?;
    let etag = reader.string()?;
    let server_date = reader.i64()?;
    let last_modified = reader.i64()?;
    let ttl = reader.i64()?;
    let soft_ttl = reader.i64()?;
    let header_count = reader.u32()?;
    let mut response_headers = HashMap::with_capacity(header_count as usize);
    for _ in 0..header_count {
        let name = reader.string()?.ok_or_else(corrupt)?;
        let value = reader.string()?.ok_or_else(corrupt)?;
        response_headers.insert(name, value);
    }
    let data = buf[reader.pos..].to_vec();
    Ok((
        key,
        CacheEntry {
            data,
            etag,
            server_date,
            last_modified,
            ttl,
            soft_ttl,
            response_headers,
        },
    ))
}

fn push_u32(buf: &mut Vec<u8>, value: u32) {
    buf.extend_from_slice(&value.to_le_bytes());
}

fn push_i64(buf: &mut Vec<u8>, value: i64) {
    buf.extend_from_slice(&value.to_le_bytes());
}

fn push_string(buf: &mut Vec<u8>, value: &str) {
    push_u32(buf, value.len() as u32);
    buf.extend_from_slice(value.as_bytes());
}

struct SliceReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl SliceReader<'_> {
    fn bytes(&mut self, len: usize) -> io::Result<&[u8]> {
        let end = self.pos.checked_add(len).ok_or_else(corrupt)?;
        let slice = self.buf.get(self.pos..end).ok_or_else(corrupt)?;
        self.pos = end;
        Ok(slice)
    }

    fn u32(&mut self) -> io::Result<u32> {
        let raw = self.bytes(4)?;
        Ok(u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]))
    }

    fn i64(&mut self) -> io::Result<i64> {
        let raw: [u8; 8] =
            self.bytes(8)?.try_into().map_err(|_| corrupt())?;
        Ok(i64::from_le_bytes(raw))
    }

    /// A length-prefixed string; the [`ABSENT`] sentinel decodes to `None`
    fn string(&mut self) -> io::Result<Option<String>> {
        let len = self.u32()?;
        if len == ABSENT {
            return Ok(None);
        }
        let raw = self.bytes(len as usize)?.to_vec();
        String::from_utf8(raw).map(Some).map_err(|_| corrupt())
    }
}
