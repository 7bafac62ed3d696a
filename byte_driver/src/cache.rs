use crate::ByteDriver;
use log::trace;
use lru::LruCache;
use std::io::{self, ErrorKind};
use std::num::NonZeroUsize;

/// Cache page size in bytes.
pub const PAGE_BYTES: u64 = 64 * 1024;
/// Default total cache budget.
pub const DEFAULT_CACHE_BYTES: u64 = 16 * 1024 * 1024;

/// Write-through LRU page cache over any inner driver.
///
/// Only writes populate the cache; reads consult cached pages first and
/// fall through to the inner driver per page. Pages are always clean
/// (every write also reaches the inner driver), so eviction never writes
/// back and `flush` only forwards.
pub struct CachedByteDriver<D: ByteDriver> {
    pub inner: D,
    pages: LruCache<u64, Vec<u8>>,
}

impl<D: ByteDriver> CachedByteDriver<D> {
    pub fn new(inner: D) -> Self {
        Self::with_budget(inner, DEFAULT_CACHE_BYTES)
    }

    pub fn with_budget(inner: D, budget: u64) -> Self {
        let cap = Self::page_capacity(budget);
        Self {
            inner,
            pages: LruCache::new(cap),
        }
    }

    fn page_capacity(budget: u64) -> NonZeroUsize {
        let pages = (budget / PAGE_BYTES).max(1) as usize;
        NonZeroUsize::new(pages).unwrap()
    }

    /// Install or patch the page holding `[offset, offset + len)` after the
    /// bytes already reached the inner driver.
    fn patch_page(&mut self, base: u64, start: usize, data: &[u8]) -> io::Result<()> {
        if let Some(page) = self.pages.get_mut(&base) {
            page[start..start + data.len()].copy_from_slice(data);
            return Ok(());
        }
        // Fresh page: pull surviving bytes outside the written span from the
        // inner driver, zero-fill past its end.
        let mut page = vec![0u8; PAGE_BYTES as usize];
        let flen = self.inner.len()?;
        let readable = (flen.saturating_sub(base)).min(PAGE_BYTES) as usize;
        let end = start + data.len();
        if start > 0 || end < readable {
            self.inner.read_at(base, &mut page[..readable])?;
        }
        page[start..end].copy_from_slice(data);
        if self.pages.push(base, page).is_some() {
            trace!("page cache evicted an entry installing base {:#x}", base);
        }
        Ok(())
    }
}

impl<D: ByteDriver> ByteDriver for CachedByteDriver<D> {
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> io::Result<()> {
        if buf.is_empty() {
            return Ok(());
        }
        if offset + buf.len() as u64 > self.inner.len()? {
            return Err(io::Error::new(
                ErrorKind::UnexpectedEof,
                format!("read past end of file at offset {}", offset),
            ));
        }
        let mut pos = offset;
        let end = offset + buf.len() as u64;
        while pos < end {
            let base = pos - pos % PAGE_BYTES;
            let start = (pos - base) as usize;
            let take = ((base + PAGE_BYTES).min(end) - pos) as usize;
            let out = &mut buf[(pos - offset) as usize..][..take];
            match self.pages.get(&base) {
                Some(page) => out.copy_from_slice(&page[start..start + take]),
                None => self.inner.read_at(pos, out)?,
            }
            pos += take as u64;
        }
        Ok(())
    }

    fn write_at(&mut self, offset: u64, buf: &[u8]) -> io::Result<()> {
        // write-through first so pages are never the only copy
        self.inner.write_at(offset, buf)?;
        let mut pos = offset;
        let end = offset + buf.len() as u64;
        while pos < end {
            let base = pos - pos % PAGE_BYTES;
            let start = (pos - base) as usize;
            let take = ((base + PAGE_BYTES).min(end) - pos) as usize;
            let src = &buf[(pos - offset) as usize..][..take];
            self.patch_page(base, start, src)?;
            pos += take as u64;
        }
        Ok(())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }

    fn len(&mut self) -> io::Result<u64> {
        self.inner.len()
    }

    fn truncate_to(&mut self, len: u64) -> io::Result<()> {
        // cached pages past the new end would serve stale bytes
        self.pages.clear();
        self.inner.truncate_to(len)
    }

    /// Change the cache budget in bytes. Rejects zero.
    fn set_cache_budget(&mut self, budget: u64) -> io::Result<()> {
        if budget == 0 {
            return Err(io::Error::new(
                ErrorKind::InvalidInput,
                "cache budget must be positive",
            ));
        }
        self.pages.resize(Self::page_capacity(budget));
        Ok(())
    }
}
