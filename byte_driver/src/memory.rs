use crate::{ByteDriver, DriverStats};
use std::io::{self, ErrorKind};

/// In-memory byte store. Backs unit tests and read-only access to
/// buffers that never came from a file.
pub struct MemoryByteDriver {
    pub mem: Vec<u8>,
    pub stats: DriverStats,
}

impl MemoryByteDriver {
    pub fn new() -> Self {
        Self::from_vec(vec![])
    }

    pub fn from_vec(mem: Vec<u8>) -> Self {
        Self {
            mem,
            stats: Default::default(),
        }
    }

    pub fn into_inner(self) -> Vec<u8> {
        self.mem
    }
}

impl Default for MemoryByteDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl ByteDriver for MemoryByteDriver {
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> io::Result<()> {
        self.stats.read_cnt += 1;
        let start = offset as usize;
        let end = start + buf.len();
        if end > self.mem.len() {
            return Err(io::Error::new(
                ErrorKind::UnexpectedEof,
                format!("read past end of buffer at offset {}", offset),
            ));
        }
        buf.copy_from_slice(&self.mem[start..end]);
        Ok(())
    }

    fn write_at(&mut self, offset: u64, buf: &[u8]) -> io::Result<()> {
        self.stats.write_cnt += 1;
        let start = offset as usize;
        let end = start + buf.len();
        if end > self.mem.len() {
            self.mem.resize(end, 0);
        }
        self.mem[start..end].copy_from_slice(buf);
        Ok(())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.stats.flush_cnt += 1;
        Ok(())
    }

    fn len(&mut self) -> io::Result<u64> {
        Ok(self.mem.len() as u64)
    }

    fn truncate_to(&mut self, len: u64) -> io::Result<()> {
        self.mem.resize(len as usize, 0);
        Ok(())
    }
}
