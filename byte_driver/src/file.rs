use crate::{ByteDriver, DriverStats};
use log::debug;
use std::fs::File;
use std::io::{self, ErrorKind};
use std::os::unix::fs::FileExt;

/// Positional file I/O. This is the only type that touches the OS
/// file descriptor; everything above it works in absolute byte offsets.
pub struct FileByteDriver {
    file: File,
    pub stats: DriverStats,
}

impl FileByteDriver {
    pub fn new(file: File) -> Self {
        Self {
            file,
            stats: Default::default(),
        }
    }
}

impl ByteDriver for FileByteDriver {
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> io::Result<()> {
        self.stats.read_cnt += 1;
        let mut pos = offset;
        let mut rest = buf;
        // retry short counts and EINTR until the buffer is satisfied
        while !rest.is_empty() {
            match self.file.read_at(rest, pos) {
                Ok(0) => {
                    return Err(io::Error::new(
                        ErrorKind::UnexpectedEof,
                        format!("read past end of file at offset {}", pos),
                    ))
                }
                Ok(n) => {
                    pos += n as u64;
                    let tmp = rest;
                    rest = &mut tmp[n..];
                }
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    fn write_at(&mut self, offset: u64, buf: &[u8]) -> io::Result<()> {
        self.stats.write_cnt += 1;
        let mut pos = offset;
        let mut rest = buf;
        while !rest.is_empty() {
            match self.file.write_at(rest, pos) {
                Ok(0) => {
                    return Err(io::Error::new(
                        ErrorKind::WriteZero,
                        format!("wrote zero bytes at offset {}", pos),
                    ))
                }
                Ok(n) => {
                    pos += n as u64;
                    rest = &rest[n..];
                }
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.stats.flush_cnt += 1;
        self.file.sync_all()
    }

    fn len(&mut self) -> io::Result<u64> {
        Ok(self.file.metadata()?.len())
    }

    fn truncate_to(&mut self, len: u64) -> io::Result<()> {
        debug!("truncate file to {} bytes", len);
        self.file.set_len(len)
    }
}
