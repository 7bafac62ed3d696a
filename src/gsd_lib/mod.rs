// GSD file layer: append-only container for named, typed chunks grouped
// into frames. The handle buffers a frame's worth of index entries, writes
// payloads through the page cache, and publishes whole frames by relocating
// the index block past the data and swinging the header pointers last.
use log::*;
use std::fs::OpenOptions;
use std::io::ErrorKind;
use std::path::Path;
use zerocopy::{FromBytes, LayoutVerified};

pub use byte_driver;
use byte_driver::{ByteDriver, CachedByteDriver, FileByteDriver};

pub mod desc;
pub mod error;
pub mod index;
pub mod namelist;
pub mod utils;

use desc::*;
use error::{GsdError, Result};
use index::Index;
use namelist::{Namelist, SlotWrite};
use utils::clip_str;

/// Commit threshold in buffered index entries.
pub const DEFAULT_INDEX_ENTRIES_TO_BUFFER: u64 = 4096;
/// Commit threshold in buffered payload bytes.
pub const DEFAULT_MAXIMUM_WRITE_BUFFER_SIZE: u64 = 64 * 1024 * 1024;

/// Canonical open modes. Legacy binary spellings (`rb`, `rb+`, `wb`, `xb`,
/// `ab`) map onto these.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    /// Open existing read-only; reject missing file.
    Read,
    /// Open existing read-write; reject missing file.
    ReadWrite,
    /// Create or truncate, read-write.
    Write,
    /// Create exclusively; fail if the file exists.
    Exclusive,
    /// Open existing read-write for appending; reject missing file.
    Append,
}

impl OpenMode {
    pub fn parse(mode: &str) -> Result<Self> {
        match mode {
            "r" | "rb" => Ok(OpenMode::Read),
            "r+" | "rb+" => Ok(OpenMode::ReadWrite),
            "w" | "wb" => Ok(OpenMode::Write),
            "x" | "xb" => Ok(OpenMode::Exclusive),
            "a" | "ab" => Ok(OpenMode::Append),
            other => Err(GsdError::InvalidArgument(format!(
                "unknown open mode {:?}",
                other
            ))),
        }
    }

    pub fn writable(self) -> bool {
        !matches!(self, OpenMode::Read)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            OpenMode::Read => "r",
            OpenMode::ReadWrite => "r+",
            OpenMode::Write => "w",
            OpenMode::Exclusive => "x",
            OpenMode::Append => "a",
        }
    }
}

/// A chunk read back from the file: raw little-endian payload bytes plus
/// the shape recorded in its index entry.
#[derive(Debug, Clone)]
pub struct ChunkData {
    pub type_code: TypeCode,
    pub n: u64,
    pub m: u32,
    pub data: Vec<u8>,
}

impl ChunkData {
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Borrow the payload as typed elements. `None` when the element size
    /// does not divide the payload or the buffer happens to be misaligned
    /// for `T`.
    pub fn as_slice<T: FromBytes>(&self) -> Option<&[T]> {
        LayoutVerified::<_, [T]>::new_slice(self.data.as_slice()).map(|lv| lv.into_slice())
    }
}

/// An open GSD file.
pub struct GsdFile {
    driver: Box<dyn ByteDriver>,
    name: String,
    mode: OpenMode,
    header: GsdHeader,
    index: Index,
    namelist: Namelist,
    /// Frame number the next chunk is written into; equals the count of
    /// ended frames.
    cur_frame: u64,
    /// Next byte offset for new data; recomputed at every commit.
    frontier: u64,
    /// Payload bytes written since the last commit.
    uncommitted_bytes: u64,
    maximum_write_buffer_size: u64,
    index_entries_to_buffer: u64,
    open: bool,
}

impl GsdFile {
    /// Open a file on disk. `application`, `schema` and `schema_version`
    /// are required when creating (`w`/`x`); on an existing file they are
    /// advisory and never validated against the header.
    pub fn open<P: AsRef<Path>>(
        path: P,
        mode: &str,
        application: Option<&str>,
        schema: Option<&str>,
        schema_version: Option<(u16, u16)>,
    ) -> Result<GsdFile> {
        let mode = OpenMode::parse(mode)?;
        let name = path.as_ref().display().to_string();
        info!("open {} mode {}", name, mode.as_str());
        // fail before touching the filesystem: `w` would truncate first
        if matches!(mode, OpenMode::Write | OpenMode::Exclusive)
            && (application.is_none() || schema.is_none() || schema_version.is_none())
        {
            return Err(GsdError::InvalidArgument(
                "application, schema and schema_version are required to create a file".to_string(),
            ));
        }
        let file = match mode {
            OpenMode::Read => OpenOptions::new().read(true).open(path.as_ref())?,
            OpenMode::ReadWrite | OpenMode::Append => {
                OpenOptions::new().read(true).write(true).open(path.as_ref())?
            }
            OpenMode::Write => OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(true)
                .open(path.as_ref())?,
            OpenMode::Exclusive => OpenOptions::new()
                .read(true)
                .write(true)
                .create_new(true)
                .open(path.as_ref())
                .map_err(|e| {
                    if e.kind() == ErrorKind::AlreadyExists {
                        GsdError::AlreadyExists(name.clone())
                    } else {
                        GsdError::from(e)
                    }
                })?,
        };
        let driver: Box<dyn ByteDriver> = Box::new(CachedByteDriver::new(FileByteDriver::new(file)));
        match mode {
            OpenMode::Write | OpenMode::Exclusive => {
                Self::create(driver, name, mode, application, schema, schema_version)
            }
            _ => Self::load(driver, name, mode),
        }
    }

    /// Read-only access over an arbitrary byte source, e.g. an in-memory
    /// buffer. Behaves like a file opened in mode `r`.
    pub fn open_byte_source(driver: Box<dyn ByteDriver>, name: &str) -> Result<GsdFile> {
        Self::load(driver, name.to_string(), OpenMode::Read)
    }

    fn create(
        driver: Box<dyn ByteDriver>,
        name: String,
        mode: OpenMode,
        application: Option<&str>,
        schema: Option<&str>,
        schema_version: Option<(u16, u16)>,
    ) -> Result<GsdFile> {
        let required = |field: Option<&str>, what: &str| -> Result<String> {
            field
                .map(|s| clip_str(s, MAX_STRING_BYTES).to_string())
                .ok_or_else(|| {
                    GsdError::InvalidArgument(format!("{} is required to create a file", what))
                })
        };
        let application = required(application, "application")?;
        let schema = required(schema, "schema")?;
        let (major, minor) = schema_version.ok_or_else(|| {
            GsdError::InvalidArgument("schema_version is required to create a file".to_string())
        })?;
        let header = GsdHeader {
            magic: GSD_MAGIC,
            index_location: HEADER_SIZE,
            index_allocated_entries: index::INITIAL_INDEX_ENTRIES,
            namelist_location: HEADER_SIZE + index::INITIAL_INDEX_ENTRIES * INDEX_ENTRY_V2_SIZE,
            namelist_allocated_entries: namelist::INITIAL_NAMELIST_ENTRIES,
            schema_version: pack_version(major, minor),
            gsd_version: GSD_CURRENT_VERSION,
            application,
            schema,
        };
        let mut gsd = GsdFile {
            driver,
            name,
            mode,
            header,
            index: Index::new(),
            namelist: Namelist::new(),
            cur_frame: 0,
            frontier: 0,
            uncommitted_bytes: 0,
            maximum_write_buffer_size: DEFAULT_MAXIMUM_WRITE_BUFFER_SIZE,
            index_entries_to_buffer: DEFAULT_INDEX_ENTRIES_TO_BUFFER,
            open: true,
        };
        gsd.write_empty_layout()?;
        Ok(gsd)
    }

    fn load(mut driver: Box<dyn ByteDriver>, name: String, mode: OpenMode) -> Result<GsdFile> {
        let flen = driver.len()?;
        if flen < HEADER_SIZE {
            return Err(GsdError::NotAGsdFile);
        }
        let mut raw = [0u8; HEADER_SIZE as usize];
        driver.read_at(0, &mut raw)?;
        let header = GsdHeader::decode(&raw)?;
        let major = header.version_major();

        let region = |location: u64, entries: u64, entry_size: u64, what: &str| -> Result<u64> {
            let bytes = entries
                .checked_mul(entry_size)
                .ok_or_else(|| GsdError::Corrupt(format!("{} block size overflows", what)))?;
            let end = location
                .checked_add(bytes)
                .ok_or_else(|| GsdError::Corrupt(format!("{} block offset overflows", what)))?;
            if location < HEADER_SIZE || end > flen {
                return Err(GsdError::Corrupt(format!("{} block out of bounds", what)));
            }
            Ok(bytes)
        };

        let index_bytes = region(
            header.index_location,
            header.index_allocated_entries,
            index_entry_size(major),
            "index",
        )?;
        let mut block = vec![0u8; index_bytes as usize];
        driver.read_at(header.index_location, &mut block)?;
        let index = Index::decode_region(&block, major, header.index_allocated_entries)?;

        let namelist_bytes = region(
            header.namelist_location,
            header.namelist_allocated_entries,
            NAMELIST_ENTRY_SIZE,
            "namelist",
        )?;
        let mut block = vec![0u8; namelist_bytes as usize];
        driver.read_at(header.namelist_location, &mut block)?;
        let namelist = Namelist::decode(&block, header.namelist_allocated_entries);

        let cur_frame = index.last_committed_frame().map(|f| f + 1).unwrap_or(0);
        debug!(
            "loaded {}: gsd {}.{}, {} committed entries, {} names, {} frames",
            name,
            major,
            unpack_version(header.gsd_version).1,
            index.committed().len(),
            namelist.len(),
            cur_frame
        );
        Ok(GsdFile {
            driver,
            name,
            mode,
            header,
            index,
            namelist,
            cur_frame,
            frontier: flen,
            uncommitted_bytes: 0,
            maximum_write_buffer_size: DEFAULT_MAXIMUM_WRITE_BUFFER_SIZE,
            index_entries_to_buffer: DEFAULT_INDEX_ENTRIES_TO_BUFFER,
            open: true,
        })
    }

    /// Header plus zeroed index and namelist blocks; shared by create and
    /// truncate.
    fn write_empty_layout(&mut self) -> Result<()> {
        let index_bytes = self.header.index_allocated_entries * INDEX_ENTRY_V2_SIZE;
        let namelist_bytes = self.header.namelist_allocated_entries * NAMELIST_ENTRY_SIZE;
        let end = self.header.namelist_location + namelist_bytes;
        self.driver.truncate_to(end)?;
        self.driver
            .write_at(self.header.index_location, &vec![0u8; index_bytes as usize])?;
        self.driver.write_at(
            self.header.namelist_location,
            &vec![0u8; namelist_bytes as usize],
        )?;
        self.driver.flush()?;
        self.driver.write_at(0, &self.header.encode())?;
        self.driver.flush()?;
        self.frontier = end;
        Ok(())
    }

    fn check_open(&self) -> Result<()> {
        if !self.open {
            return Err(GsdError::InvalidArgument("file is closed".to_string()));
        }
        Ok(())
    }

    fn ensure_writable(&self) -> Result<()> {
        self.check_open()?;
        if !self.mode.writable() {
            return Err(GsdError::ReadOnly);
        }
        Ok(())
    }

    /// Mutating the contents additionally requires the v2 layout; a v1
    /// file must go through `upgrade` first.
    fn ensure_v2_writable(&self) -> Result<()> {
        self.ensure_writable()?;
        if self.header.version_major() == 1 {
            let (major, minor) = unpack_version(self.header.gsd_version);
            return Err(GsdError::UnsupportedVersion { major, minor });
        }
        Ok(())
    }

    /// Buffer one chunk for the current frame. The payload goes to disk
    /// through the cache immediately; the index entry stays in the write
    /// buffer until the frame is committed.
    pub fn write_chunk(
        &mut self,
        name: &str,
        type_code: TypeCode,
        n: u64,
        m: u32,
        data: &[u8],
    ) -> Result<()> {
        self.ensure_v2_writable()?;
        if name.is_empty() {
            return Err(GsdError::InvalidArgument(
                "chunk name must not be empty".to_string(),
            ));
        }
        let expected = n
            .checked_mul(m as u64)
            .and_then(|c| c.checked_mul(type_code.size()))
            .ok_or_else(|| {
                GsdError::InvalidArgument("chunk dimensions overflow".to_string())
            })?;
        if data.len() as u64 != expected {
            return Err(GsdError::InvalidArgument(format!(
                "data is {} bytes but N*M*size is {}",
                data.len(),
                expected
            )));
        }
        let name = clip_str(name, MAX_STRING_BYTES);
        let (id, slot) = self.namelist.insert(name)?;
        if let Some(SlotWrite::InPlace(idx)) = slot {
            let offset = self.header.namelist_location + idx as u64 * NAMELIST_ENTRY_SIZE;
            self.driver.write_at(offset, &encode_name(name))?;
        }
        let location = self.frontier as i64;
        if !data.is_empty() {
            self.driver.write_at(self.frontier, data)?;
        }
        self.frontier += expected;
        self.uncommitted_bytes += expected;
        trace!(
            "write chunk {:?} frame {} N {} M {} at {:#x}",
            name,
            self.cur_frame,
            n,
            m,
            location
        );
        self.index.push_pending(IndexEntry {
            frame: self.cur_frame,
            n,
            location,
            m,
            id,
            type_code: type_code.into(),
            flags: 0,
        });
        Ok(())
    }

    /// Close the current frame. Empty frames are legal. Commits when a
    /// buffer threshold is crossed.
    pub fn end_frame(&mut self) -> Result<()> {
        self.ensure_v2_writable()?;
        self.cur_frame += 1;
        debug!(
            "end frame {} ({} entries buffered)",
            self.cur_frame - 1,
            self.index.pending_len()
        );
        if self.index.pending_len() as u64 >= self.index_entries_to_buffer
            || self.uncommitted_bytes >= self.maximum_write_buffer_size
        {
            self.commit()?;
        }
        Ok(())
    }

    /// Publish every closed frame. Entries of the still-open frame stay in
    /// the write buffer: a flush never publishes a partial frame.
    pub fn flush(&mut self) -> Result<()> {
        self.check_open()?;
        if self.mode.writable() && self.header.version_major() != 1 {
            self.commit()?;
        }
        self.driver.flush()?;
        Ok(())
    }

    /// Write buffered entries of closed frames to a fresh index block at
    /// the frontier and swing the header pointers. The header update is
    /// the linearization point; the old block becomes dead space.
    fn commit(&mut self) -> Result<()> {
        let batch = self.index.take_closed(self.cur_frame);
        let relocate_namelist = self.namelist.needs_realloc();
        if batch.is_empty() && !relocate_namelist {
            return Ok(());
        }
        debug!(
            "commit {}: {} entries, namelist relocation: {}",
            self.name,
            batch.len(),
            relocate_namelist
        );
        if !batch.is_empty() {
            self.index.merge_committed(batch);
            let location = self.frontier;
            let region = self.index.encode_region();
            self.driver.write_at(location, &region)?;
            self.frontier += region.len() as u64;
            self.header.index_location = location;
            self.header.index_allocated_entries = self.index.allocated();
        }
        if relocate_namelist {
            let allocated = self.namelist.grown_capacity();
            let region = self.namelist.encode_region(allocated);
            let location = self.frontier;
            self.driver.write_at(location, &region)?;
            self.frontier += region.len() as u64;
            self.header.namelist_location = location;
            self.header.namelist_allocated_entries = allocated;
            self.namelist.mark_committed(allocated);
        }
        // the new blocks must be durable before the pointer swing
        self.driver.flush()?;
        self.driver.write_at(0, &self.header.encode())?;
        self.driver.flush()?;
        self.uncommitted_bytes = self.index.pending_payload_bytes();
        Ok(())
    }

    /// Commit closed frames and release the handle. Chunks written after
    /// the last `end_frame` are discarded. Idempotent.
    pub fn close(&mut self) -> Result<()> {
        if !self.open {
            return Ok(());
        }
        if self.mode.writable() && self.header.version_major() != 1 {
            self.commit()?;
            let dropped = self.index.pending_len();
            if dropped > 0 {
                warn!(
                    "closing {}: discarding {} chunks written after the last end_frame",
                    self.name, dropped
                );
                self.index.clear_pending();
            }
            self.driver.flush()?;
        }
        self.open = false;
        info!("closed {}", self.name);
        Ok(())
    }

    /// Reset to an empty file, preserving application, schema and schema
    /// version. Buffered chunks are discarded.
    pub fn truncate(&mut self) -> Result<()> {
        self.ensure_writable()?;
        info!("truncate {}", self.name);
        self.index = Index::new();
        self.namelist = Namelist::new();
        self.cur_frame = 0;
        self.uncommitted_bytes = 0;
        self.header.index_location = HEADER_SIZE;
        self.header.index_allocated_entries = index::INITIAL_INDEX_ENTRIES;
        self.header.namelist_location =
            HEADER_SIZE + index::INITIAL_INDEX_ENTRIES * INDEX_ENTRY_V2_SIZE;
        self.header.namelist_allocated_entries = namelist::INITIAL_NAMELIST_ENTRIES;
        self.header.gsd_version = GSD_CURRENT_VERSION;
        self.write_empty_layout()
    }

    /// Rewrite a v1 file's index and namelist as fresh v2 blocks at the
    /// end of the file. Chunk payloads are untouched; afterwards the
    /// handle writes v2.
    pub fn upgrade(&mut self) -> Result<()> {
        self.ensure_writable()?;
        if self.header.version_major() != 1 {
            return Err(GsdError::InvalidArgument(
                "upgrade applies to v1 files only".to_string(),
            ));
        }
        let (major, minor) = unpack_version(GSD_CURRENT_VERSION);
        info!("upgrading {} to gsd {}.{}", self.name, major, minor);
        let index_location = self.frontier;
        let region = self.index.encode_region();
        self.driver.write_at(index_location, &region)?;
        self.frontier += region.len() as u64;
        let namelist_allocated = self.namelist.grown_capacity();
        let namelist_location = self.frontier;
        let region = self.namelist.encode_region(namelist_allocated);
        self.driver.write_at(namelist_location, &region)?;
        self.frontier += region.len() as u64;
        self.driver.flush()?;
        self.header.index_location = index_location;
        self.header.index_allocated_entries = self.index.allocated();
        self.header.namelist_location = namelist_location;
        self.header.namelist_allocated_entries = namelist_allocated;
        self.header.gsd_version = GSD_CURRENT_VERSION;
        self.driver.write_at(0, &self.header.encode())?;
        self.driver.flush()?;
        self.namelist.mark_committed(namelist_allocated);
        Ok(())
    }

    fn find_entry(&self, frame: u64, name: &str) -> Option<IndexEntry> {
        // lookups clip like writes do, so both spellings of an overlong
        // name resolve to the stored one
        let id = self.namelist.id_of(clip_str(name, MAX_STRING_BYTES))?;
        self.index
            .find_committed(frame, id)
            .or_else(|| self.index.find_pending(frame, id))
            .copied()
    }

    /// Test for a chunk without reading or allocating.
    pub fn chunk_exists(&self, frame: u64, name: &str) -> bool {
        self.find_entry(frame, name).is_some()
    }

    /// Read one chunk. Zero-length chunks return an empty buffer with the
    /// declared type.
    pub fn read_chunk(&mut self, frame: u64, name: &str) -> Result<ChunkData> {
        self.check_open()?;
        let entry = self.find_entry(frame, name).ok_or_else(|| GsdError::NotFound {
            frame,
            name: name.to_string(),
        })?;
        let type_code = TypeCode::try_from(entry.type_code).map_err(|_| {
            GsdError::Corrupt(format!("unknown type code {} in index", entry.type_code))
        })?;
        let len = entry
            .payload_len()
            .ok_or_else(|| GsdError::Corrupt("chunk size overflows".to_string()))?;
        if len == 0 {
            return Ok(ChunkData {
                type_code,
                n: entry.n,
                m: entry.m,
                data: vec![],
            });
        }
        if entry.location <= 0 || (entry.location as u64) < HEADER_SIZE {
            return Err(GsdError::Corrupt(format!(
                "chunk location {} inside the header",
                entry.location
            )));
        }
        let location = entry.location as u64;
        let end = location
            .checked_add(len)
            .ok_or_else(|| GsdError::Corrupt("chunk extent overflows".to_string()))?;
        if end > self.driver.len()? {
            return Err(GsdError::Corrupt(
                "chunk extends past end of file".to_string(),
            ));
        }
        let mut data = vec![0u8; len as usize];
        self.driver.read_at(location, &mut data)?;
        Ok(ChunkData {
            type_code,
            n: entry.n,
            m: entry.m,
            data,
        })
    }

    /// All chunk names starting with `prefix`, in id (first write) order.
    pub fn find_matching_chunk_names(&self, prefix: &str) -> Vec<String> {
        self.namelist.matching(prefix)
    }

    /// Number of frames: ended frames on a writable handle, committed
    /// frames on a read-only one.
    pub fn nframes(&self) -> u64 {
        if self.mode.writable() {
            self.cur_frame
        } else {
            self.index
                .last_committed_frame()
                .map(|f| f + 1)
                .unwrap_or(0)
        }
    }

    pub fn application(&self) -> &str {
        &self.header.application
    }

    pub fn schema(&self) -> &str {
        &self.header.schema
    }

    pub fn schema_version(&self) -> (u16, u16) {
        unpack_version(self.header.schema_version)
    }

    pub fn gsd_version(&self) -> (u16, u16) {
        unpack_version(self.header.gsd_version)
    }

    pub fn mode(&self) -> &'static str {
        self.mode.as_str()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn maximum_write_buffer_size(&self) -> u64 {
        self.maximum_write_buffer_size
    }

    pub fn set_maximum_write_buffer_size(&mut self, bytes: u64) -> Result<()> {
        if bytes == 0 {
            return Err(GsdError::InvalidArgument(
                "maximum_write_buffer_size must be positive".to_string(),
            ));
        }
        self.maximum_write_buffer_size = bytes;
        // the page cache budget follows the write buffer budget
        self.driver.set_cache_budget(bytes)?;
        Ok(())
    }

    pub fn index_entries_to_buffer(&self) -> u64 {
        self.index_entries_to_buffer
    }

    pub fn set_index_entries_to_buffer(&mut self, entries: u64) -> Result<()> {
        if entries == 0 {
            return Err(GsdError::InvalidArgument(
                "index_entries_to_buffer must be positive".to_string(),
            ));
        }
        self.index_entries_to_buffer = entries;
        Ok(())
    }
}

impl Drop for GsdFile {
    fn drop(&mut self) {
        if self.open {
            if let Err(e) = self.close() {
                warn!("close on drop failed for {}: {}", self.name, e);
            }
        }
    }
}
