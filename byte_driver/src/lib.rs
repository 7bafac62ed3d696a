use std::io;

#[derive(Default, Debug, Clone)]
pub struct DriverStats {
    pub read_cnt: u64,
    pub write_cnt: u64,
    pub flush_cnt: u64,
}

/// ByteDriver abstract interface
///
/// Positional I/O over a byte-addressed store. Offsets are absolute byte
/// positions; a call either transfers the whole buffer or fails. Drivers
/// retry short transfers internally, callers never see partial counts.
pub trait ByteDriver {
    /// Fill `buf` from `offset`. Reading past the end is an error.
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> io::Result<()>;
    /// Write all of `buf` at `offset`, extending the store if needed.
    fn write_at(&mut self, offset: u64, buf: &[u8]) -> io::Result<()>;
    /// Make previous writes durable.
    fn flush(&mut self) -> io::Result<()>;
    /// Current store size in bytes.
    fn len(&mut self) -> io::Result<u64>;
    /// Shrink or extend the store to exactly `len` bytes.
    fn truncate_to(&mut self, len: u64) -> io::Result<()>;
    /// Adjust the driver's cache budget in bytes, if it keeps one.
    /// Drivers without a cache accept any positive value.
    fn set_cache_budget(&mut self, _budget: u64) -> io::Result<()> {
        Ok(())
    }
}

pub mod cache;
pub mod file;
pub mod memory;

pub use cache::CachedByteDriver;
pub use file::FileByteDriver;
pub use memory::MemoryByteDriver;
