use crate::gsd_lib::desc::NAMELIST_ENTRY_SIZE;
use crate::gsd_lib::error::{GsdError, Result};
use crate::gsd_lib::utils::decode_fixed_str;
use std::collections::HashMap;

/// Initial on-disk capacity of the namelist block, in 64-byte slots.
pub const INITIAL_NAMELIST_ENTRIES: u64 = 128;

/// Hard cap on distinct names; ids are 16 bits.
pub const MAX_NAMES: usize = u16::MAX as usize;

/// Where the slot for a freshly assigned name goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotWrite {
    /// Spare capacity in the committed block: write slot `index` in place.
    InPlace(u16),
    /// Block is full; the name rides along with the next relocation.
    Deferred,
}

/// Append-only, deduplicated name -> id map. Ids are assigned in
/// first-write order and never change; slots of existing names are never
/// rewritten.
pub struct Namelist {
    names: Vec<String>,
    ids: HashMap<String, u16>,
    allocated: u64,
    needs_realloc: bool,
}

impl Namelist {
    pub fn new() -> Self {
        Self {
            names: vec![],
            ids: HashMap::new(),
            allocated: INITIAL_NAMELIST_ENTRIES,
            needs_realloc: false,
        }
    }

    /// Rebuild from the raw on-disk block. A zeroed first byte ends the
    /// populated prefix.
    pub fn decode(block: &[u8], allocated: u64) -> Self {
        let mut list = Self::new();
        list.allocated = allocated;
        for slot in block.chunks(NAMELIST_ENTRY_SIZE as usize) {
            if slot.is_empty() || slot[0] == 0 {
                break;
            }
            let name = decode_fixed_str(slot);
            let id = list.names.len() as u16;
            list.ids.insert(name.clone(), id);
            list.names.push(name);
        }
        list
    }

    pub fn id_of(&self, name: &str) -> Option<u16> {
        self.ids.get(name).copied()
    }

    /// Assign an id to a new name, or hand back the existing one.
    pub fn insert(&mut self, name: &str) -> Result<(u16, Option<SlotWrite>)> {
        if let Some(id) = self.ids.get(name) {
            return Ok((*id, None));
        }
        if self.names.len() >= MAX_NAMES {
            return Err(GsdError::TooManyNames);
        }
        let id = self.names.len() as u16;
        self.ids.insert(name.to_string(), id);
        self.names.push(name.to_string());
        let slot = if !self.needs_realloc && (id as u64) < self.allocated {
            SlotWrite::InPlace(id)
        } else {
            self.needs_realloc = true;
            SlotWrite::Deferred
        };
        Ok((id, Some(slot)))
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub fn allocated(&self) -> u64 {
        self.allocated
    }

    pub fn needs_realloc(&self) -> bool {
        self.needs_realloc
    }

    /// Capacity of the relocated block: doubled until every name fits.
    pub fn grown_capacity(&self) -> u64 {
        let mut cap = self.allocated.max(INITIAL_NAMELIST_ENTRIES);
        while cap < self.names.len() as u64 {
            cap *= 2;
        }
        cap
    }

    /// The full block image for a relocation: every name in id order, tail
    /// slots zeroed.
    pub fn encode_region(&self, allocated: u64) -> Vec<u8> {
        let mut out = vec![0u8; (allocated * NAMELIST_ENTRY_SIZE) as usize];
        for (i, name) in self.names.iter().enumerate() {
            let offset = i * NAMELIST_ENTRY_SIZE as usize;
            out[offset..offset + NAMELIST_ENTRY_SIZE as usize]
                .copy_from_slice(&crate::gsd_lib::desc::encode_name(name));
        }
        out
    }

    pub fn mark_committed(&mut self, allocated: u64) {
        self.allocated = allocated;
        self.needs_realloc = false;
    }

    /// Names starting with `prefix`, in insertion (id) order.
    pub fn matching(&self, prefix: &str) -> Vec<String> {
        self.names
            .iter()
            .filter(|n| n.starts_with(prefix))
            .cloned()
            .collect()
    }
}

impl Default for Namelist {
    fn default() -> Self {
        Self::new()
    }
}
