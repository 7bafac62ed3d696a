use crate::gsd_lib::desc::{
    decode_index_entry_v1, decode_index_entry_v2, encode_index_entry_v2, index_entry_size,
    IndexEntry, INDEX_ENTRY_V2_SIZE,
};
use crate::gsd_lib::error::Result;

/// Initial on-disk capacity of the index block, in entries.
pub const INITIAL_INDEX_ENTRIES: u64 = 128;

/// The chunk index: the committed on-disk region mirrored in memory as a
/// `(frame, id)`-sorted vector, plus the write buffer of entries that have
/// not been published yet.
pub struct Index {
    committed: Vec<IndexEntry>,
    pending: Vec<IndexEntry>,
    allocated: u64,
}

impl Index {
    pub fn new() -> Self {
        Self {
            committed: vec![],
            pending: vec![],
            allocated: INITIAL_INDEX_ENTRIES,
        }
    }

    /// Rebuild from the raw on-disk block. The active prefix is the maximal
    /// run of slots with a nonzero location.
    pub fn decode_region(block: &[u8], version_major: u16, allocated: u64) -> Result<Self> {
        let entry_size = index_entry_size(version_major) as usize;
        let mut committed = vec![];
        for slot in block.chunks(entry_size) {
            if slot.len() < entry_size {
                break;
            }
            let entry = if version_major == 1 {
                decode_index_entry_v1(slot)?
            } else {
                decode_index_entry_v2(slot)
            };
            if !entry.is_used() {
                break;
            }
            committed.push(entry);
        }
        Ok(Self {
            committed,
            pending: vec![],
            allocated,
        })
    }

    pub fn committed(&self) -> &[IndexEntry] {
        &self.committed
    }

    pub fn pending(&self) -> &[IndexEntry] {
        &self.pending
    }

    pub fn allocated(&self) -> u64 {
        self.allocated
    }

    pub fn push_pending(&mut self, entry: IndexEntry) {
        self.pending.push(entry);
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn clear_pending(&mut self) {
        self.pending.clear();
    }

    /// Total payload bytes referenced by buffered entries.
    pub fn pending_payload_bytes(&self) -> u64 {
        self.pending
            .iter()
            .map(|e| e.payload_len().unwrap_or(0))
            .sum()
    }

    /// Highest committed frame number, if any.
    pub fn last_committed_frame(&self) -> Option<u64> {
        self.committed.last().map(|e| e.frame)
    }

    /// Locate `(frame, id)` in the committed region: binary search for the
    /// rightmost entry of the frame, then scan left within the frame. With
    /// duplicate ids in one frame the latest written entry wins.
    pub fn find_committed(&self, frame: u64, id: u16) -> Option<&IndexEntry> {
        let upper = self
            .committed
            .partition_point(|e| e.sort_key() <= (frame, id));
        let mut cur = upper.checked_sub(1)?;
        loop {
            let entry = &self.committed[cur];
            if entry.frame != frame {
                return None;
            }
            if entry.id == id {
                return Some(entry);
            }
            cur = cur.checked_sub(1)?;
        }
    }

    /// Locate `(frame, id)` in the write buffer; latest write wins.
    pub fn find_pending(&self, frame: u64, id: u16) -> Option<&IndexEntry> {
        self.pending
            .iter()
            .rev()
            .find(|e| e.frame == frame && e.id == id)
    }

    /// Drain the buffered entries of every frame before `open_frame`,
    /// sorted by `(frame, id)`; entries of the still-open frame stay put.
    pub fn take_closed(&mut self, open_frame: u64) -> Vec<IndexEntry> {
        let mut closed: Vec<IndexEntry> = vec![];
        let mut kept: Vec<IndexEntry> = vec![];
        for entry in self.pending.drain(..) {
            if entry.frame < open_frame {
                closed.push(entry);
            } else {
                kept.push(entry);
            }
        }
        self.pending = kept;
        closed.sort_by_key(|e| e.sort_key());
        closed
    }

    /// Merge a sorted batch into the committed region, doubling the
    /// allocated capacity until everything fits.
    pub fn merge_committed(&mut self, batch: Vec<IndexEntry>) {
        if batch.is_empty() {
            return;
        }
        let mut merged = Vec::with_capacity(self.committed.len() + batch.len());
        let mut new = batch.into_iter().peekable();
        for old in self.committed.drain(..) {
            while matches!(new.peek(), Some(e) if e.sort_key() < old.sort_key()) {
                merged.push(new.next().unwrap());
            }
            merged.push(old);
        }
        merged.extend(new);
        self.committed = merged;
        self.allocated = self.allocated.max(1);
        while self.allocated < self.committed.len() as u64 {
            self.allocated *= 2;
        }
    }

    /// The full v2 block image: active prefix in order, tail slots zeroed.
    pub fn encode_region(&self) -> Vec<u8> {
        let mut out = vec![0u8; (self.allocated * INDEX_ENTRY_V2_SIZE) as usize];
        for (i, entry) in self.committed.iter().enumerate() {
            let offset = i * INDEX_ENTRY_V2_SIZE as usize;
            out[offset..offset + INDEX_ENTRY_V2_SIZE as usize]
                .copy_from_slice(&encode_index_entry_v2(entry));
        }
        out
    }
}

impl Default for Index {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;

    fn entry(frame: u64, id: u16, location: i64) -> IndexEntry {
        IndexEntry {
            frame,
            n: 1,
            location,
            m: 1,
            id,
            type_code: 1,
            flags: 0,
        }
    }

    #[test]
    fn find_in_committed() {
        let mut index = Index::new();
        index.merge_committed(vec![
            entry(0, 0, 300),
            entry(0, 1, 400),
            entry(1, 0, 500),
            entry(1, 2, 600),
            entry(3, 1, 700),
        ]);
        assert_eq!(index.find_committed(0, 1).unwrap().location, 400);
        assert_eq!(index.find_committed(1, 0).unwrap().location, 500);
        assert_eq!(index.find_committed(3, 1).unwrap().location, 700);
        assert!(index.find_committed(1, 1).is_none());
        assert!(index.find_committed(2, 0).is_none());
        assert!(index.find_committed(9, 0).is_none());
    }

    #[test]
    fn duplicate_id_latest_wins() {
        let mut index = Index::new();
        index.merge_committed(vec![entry(0, 5, 300), entry(0, 5, 900)]);
        assert_eq!(index.find_committed(0, 5).unwrap().location, 900);
    }

    #[test]
    fn take_closed_keeps_open_frame() {
        let mut index = Index::new();
        index.push_pending(entry(0, 1, 300));
        index.push_pending(entry(0, 0, 400));
        index.push_pending(entry(1, 0, 500));
        let closed = index.take_closed(1);
        // sorted by (frame, id)
        assert_eq!(
            closed.iter().map(|e| e.id).collect::<Vec<_>>(),
            vec![0, 1]
        );
        assert_eq!(index.pending_len(), 1);
        assert_eq!(index.pending()[0].frame, 1);
    }

    #[test]
    fn merge_grows_by_doubling() {
        let mut index = Index::new();
        let batch: Vec<_> = (0..200u64).map(|f| entry(f, 0, 300 + f as i64)).collect();
        index.merge_committed(batch);
        assert_eq!(index.allocated(), 256);
        assert_eq!(index.committed().len(), 200);
    }

    #[test]
    fn encode_decode_region_roundtrip() -> Result<()> {
        let mut index = Index::new();
        index.merge_committed(vec![entry(0, 0, 300), entry(2, 4, 800)]);
        let block = index.encode_region();
        assert_eq!(block.len(), 128 * 32);
        let back = Index::decode_region(&block, 2, index.allocated())?;
        assert_eq!(back.committed(), index.committed());
        Ok(())
    }

    #[test]
    fn decode_stops_at_first_unused_slot() -> Result<()> {
        let mut index = Index::new();
        index.merge_committed(vec![entry(0, 0, 300)]);
        let mut block = index.encode_region();
        // garbage after the terminator slot must not be decoded
        let tail = block.len() - 32;
        block[tail..].copy_from_slice(&encode_index_entry_v2(&entry(9, 9, 999)));
        let back = Index::decode_region(&block, 2, index.allocated())?;
        assert_eq!(back.committed().len(), 1);
        Ok(())
    }
}
