//! Two-level segregated-fit allocator over a fixed region.
//!
//! Block metadata lives outside the region in a slot table sized at
//! construction, so `alloc`, `realloc` and `free` never touch the system
//! allocator and are safe to call from the audio callback. Free blocks are
//! binned by size class (a power-of-two first level split into 16 linear
//! second-level classes) with bitmaps, making lookup constant time.
//! Neighbouring free blocks are always coalesced.
//!
//! Callers hold [`Block`] handles. A handle goes stale when its block is freed;
//! stale handles are rejected instead of aliasing a newer allocation.

use crate::platform::Region;
use thiserror::Error;

const GRANULE_LOG: u32 = 4;
/// Allocation granularity and minimum block size.
pub const GRANULE: usize = 1 << GRANULE_LOG;
const SL_LOG: u32 = 4;
const SL_COUNT: usize = 1 << SL_LOG;
const SMALL: usize = 1 << (SL_LOG + GRANULE_LOG);
const FL_COUNT: usize = 57;
const NIL: u32 = u32::MAX;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ArenaError {
    #[error("arena exhausted allocating {requested} bytes")]
    Exhausted { requested: usize },

    #[error("stale or foreign block handle")]
    StaleBlock,

    #[error("arena region is empty")]
    EmptyRegion,
}

/// Handle to an allocated block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Block {
    slot: u32,
    generation: u32,
}

#[derive(Debug, Clone, Copy)]
struct Chunk {
    offset: usize,
    size: usize,
    requested: usize,
    free: bool,
    occupied: bool,
    generation: u32,
    prev_phys: u32,
    next_phys: u32,
    prev_free: u32,
    next_free: u32,
}

impl Chunk {
    const VACANT: Chunk = Chunk {
        offset: 0,
        size: 0,
        requested: 0,
        free: false,
        occupied: false,
        generation: 0,
        prev_phys: NIL,
        next_phys: NIL,
        prev_free: NIL,
        next_free: NIL,
    };
}

/// Snapshot of allocator occupancy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArenaStats {
    pub capacity: usize,
    pub used_bytes: usize,
    pub free_bytes: usize,
    pub free_blocks: usize,
    pub largest_free: usize,
    pub live_blocks: usize,
}

pub struct Arena {
    region: Region,
    capacity: usize,
    chunks: Vec<Chunk>,
    spare: Vec<u32>,
    fl_bitmap: u64,
    sl_bitmap: [u32; FL_COUNT],
    heads: [[u32; SL_COUNT]; FL_COUNT],
    live: usize,
}

fn floor_log2(n: usize) -> u32 {
    usize::BITS - 1 - n.leading_zeros()
}

fn round_to_granule(n: usize) -> Option<usize> {
    n.max(1).checked_add(GRANULE - 1).map(|v| v & !(GRANULE - 1))
}

/// Size class holding blocks of exactly `size` bytes.
fn mapping(size: usize) -> (usize, usize) {
    if size < SMALL {
        (0, size >> GRANULE_LOG)
    } else {
        let log = floor_log2(size);
        let sl = (size >> (log - SL_LOG)) ^ SL_COUNT;
        let fl = (log - (SL_LOG + GRANULE_LOG) + 1) as usize;
        (fl, sl)
    }
}

/// Smallest size class whose blocks are all at least `size` bytes.
fn mapping_search(size: usize) -> Option<(usize, usize)> {
    let rounded = if size < SMALL {
        size
    } else {
        size.checked_add((1usize << (floor_log2(size) - SL_LOG)) - 1)?
    };
    let (fl, sl) = mapping(rounded);
    (fl < FL_COUNT).then_some((fl, sl))
}

impl Arena {
    /// Build an arena over `region` able to track `max_blocks` live and free
    /// blocks at once.
    pub fn new(region: Region, max_blocks: usize) -> Result<Self, ArenaError> {
        let capacity = region.len() & !(GRANULE - 1);
        if capacity == 0 {
            return Err(ArenaError::EmptyRegion);
        }

        let max_blocks = max_blocks.clamp(2, NIL as usize - 1);
        let mut chunks = vec![Chunk::VACANT; max_blocks];
        let mut spare: Vec<u32> = Vec::with_capacity(max_blocks);
        spare.extend((1..max_blocks as u32).rev());

        chunks[0] = Chunk {
            offset: 0,
            size: capacity,
            occupied: true,
            ..Chunk::VACANT
        };

        let mut arena = Self {
            region,
            capacity,
            chunks,
            spare,
            fl_bitmap: 0,
            sl_bitmap: [0; FL_COUNT],
            heads: [[NIL; SL_COUNT]; FL_COUNT],
            live: 0,
        };
        arena.insert_free(0);
        Ok(arena)
    }

    /// Arena over `region` tracking one block per 256 bytes.
    pub fn with_region(region: Region) -> Result<Self, ArenaError> {
        let max_blocks = (region.len() / 256).max(64);
        Self::new(region, max_blocks)
    }

    pub fn on_heap(bytes: usize) -> Result<Self, ArenaError> {
        Self::with_region(Region::heap(bytes))
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn alloc(&mut self, n: usize) -> Result<Block, ArenaError> {
        let exhausted = ArenaError::Exhausted { requested: n };
        let size = round_to_granule(n).ok_or_else(|| exhausted.clone())?;
        let (fl, sl) = mapping_search(size).ok_or_else(|| exhausted.clone())?;
        let (fl, sl) = self.find_free(fl, sl).ok_or(exhausted)?;

        let slot = self.heads[fl][sl];
        self.remove_free(slot);
        self.split(slot, size);

        let chunk = &mut self.chunks[slot as usize];
        chunk.requested = n;
        self.live += 1;
        Ok(Block {
            slot,
            generation: chunk.generation,
        })
    }

    /// Allocate and fill with `data`.
    pub fn alloc_copy(&mut self, data: &[u8]) -> Result<Block, ArenaError> {
        let block = self.alloc(data.len())?;
        let dst = self.bytes_mut(&block).ok_or(ArenaError::StaleBlock)?;
        dst.copy_from_slice(data);
        Ok(block)
    }

    /// Resize a block, in place when the following block is free and large
    /// enough, otherwise by moving. The old handle is stale after a move.
    pub fn realloc(&mut self, block: Block, n: usize) -> Result<Block, ArenaError> {
        let slot = self.validate(&block)?;
        let size = round_to_granule(n).ok_or(ArenaError::Exhausted { requested: n })?;
        let current = self.chunks[slot as usize].size;

        if size <= current {
            self.split(slot, size);
            self.chunks[slot as usize].requested = n;
            return Ok(block);
        }

        let next = self.chunks[slot as usize].next_phys;
        if next != NIL {
            let neighbour = self.chunks[next as usize];
            if neighbour.free && current + neighbour.size >= size {
                self.remove_free(next);
                self.absorb_next(slot);
                self.split(slot, size);
                self.chunks[slot as usize].requested = n;
                return Ok(block);
            }
        }

        let moved = self.alloc(n)?;
        let old = self.chunks[slot as usize];
        let new_offset = self.chunks[moved.slot as usize].offset;
        let keep = old.requested.min(n);
        self.region
            .as_mut_slice()
            .copy_within(old.offset..old.offset + keep, new_offset);
        self.free(block)?;
        Ok(moved)
    }

    pub fn free(&mut self, block: Block) -> Result<(), ArenaError> {
        let slot = self.validate(&block)?;
        let chunk = &mut self.chunks[slot as usize];
        chunk.requested = 0;
        chunk.generation = chunk.generation.wrapping_add(1);
        self.live -= 1;
        self.insert_coalesced(slot);
        Ok(())
    }

    pub fn bytes(&self, block: &Block) -> Option<&[u8]> {
        let slot = self.validate(block).ok()?;
        let chunk = &self.chunks[slot as usize];
        Some(&self.region.as_slice()[chunk.offset..chunk.offset + chunk.requested])
    }

    pub fn bytes_mut(&mut self, block: &Block) -> Option<&mut [u8]> {
        let slot = self.validate(block).ok()?;
        let chunk = self.chunks[slot as usize];
        Some(&mut self.region.as_mut_slice()[chunk.offset..chunk.offset + chunk.requested])
    }

    pub fn stats(&self) -> ArenaStats {
        let mut free_bytes = 0;
        let mut free_blocks = 0;
        let mut largest_free = 0;
        for fl in 0..FL_COUNT {
            for sl in 0..SL_COUNT {
                let mut cursor = self.heads[fl][sl];
                while cursor != NIL {
                    let chunk = &self.chunks[cursor as usize];
                    free_bytes += chunk.size;
                    free_blocks += 1;
                    largest_free = largest_free.max(chunk.size);
                    cursor = chunk.next_free;
                }
            }
        }
        ArenaStats {
            capacity: self.capacity,
            used_bytes: self.capacity - free_bytes,
            free_bytes,
            free_blocks,
            largest_free,
            live_blocks: self.live,
        }
    }

    fn validate(&self, block: &Block) -> Result<u32, ArenaError> {
        match self.chunks.get(block.slot as usize) {
            Some(chunk) if chunk.occupied && !chunk.free && chunk.generation == block.generation => {
                Ok(block.slot)
            }
            _ => Err(ArenaError::StaleBlock),
        }
    }

    fn find_free(&self, fl: usize, sl: usize) -> Option<(usize, usize)> {
        let mut fl = fl;
        let mut sl_map = self.sl_bitmap[fl] & (u32::MAX << sl);
        if sl_map == 0 {
            let shift = fl + 1;
            if shift >= FL_COUNT {
                return None;
            }
            let fl_map = self.fl_bitmap & (u64::MAX << shift);
            if fl_map == 0 {
                return None;
            }
            fl = fl_map.trailing_zeros() as usize;
            sl_map = self.sl_bitmap[fl];
        }
        Some((fl, sl_map.trailing_zeros() as usize))
    }

    fn insert_free(&mut self, slot: u32) {
        let (fl, sl) = mapping(self.chunks[slot as usize].size);
        let head = self.heads[fl][sl];
        {
            let chunk = &mut self.chunks[slot as usize];
            chunk.free = true;
            chunk.prev_free = NIL;
            chunk.next_free = head;
        }
        if head != NIL {
            self.chunks[head as usize].prev_free = slot;
        }
        self.heads[fl][sl] = slot;
        self.sl_bitmap[fl] |= 1 << sl;
        self.fl_bitmap |= 1 << fl;
    }

    fn remove_free(&mut self, slot: u32) {
        let chunk = self.chunks[slot as usize];
        let (fl, sl) = mapping(chunk.size);
        if chunk.prev_free != NIL {
            self.chunks[chunk.prev_free as usize].next_free = chunk.next_free;
        } else {
            self.heads[fl][sl] = chunk.next_free;
        }
        if chunk.next_free != NIL {
            self.chunks[chunk.next_free as usize].prev_free = chunk.prev_free;
        }
        if self.heads[fl][sl] == NIL {
            self.sl_bitmap[fl] &= !(1 << sl);
            if self.sl_bitmap[fl] == 0 {
                self.fl_bitmap &= !(1 << fl);
            }
        }
        let chunk = &mut self.chunks[slot as usize];
        chunk.free = false;
        chunk.prev_free = NIL;
        chunk.next_free = NIL;
    }

    /// Trim `slot` to `size`, returning the tail to the free lists. Without a
    /// spare slot the block simply keeps its tail.
    fn split(&mut self, slot: u32, size: usize) {
        let chunk = self.chunks[slot as usize];
        let remainder = chunk.size - size;
        if remainder < GRANULE {
            return;
        }
        let Some(tail) = self.spare.pop() else {
            return;
        };

        self.chunks[tail as usize] = Chunk {
            offset: chunk.offset + size,
            size: remainder,
            occupied: true,
            free: true,
            generation: self.chunks[tail as usize].generation,
            prev_phys: slot,
            next_phys: chunk.next_phys,
            ..Chunk::VACANT
        };
        if chunk.next_phys != NIL {
            self.chunks[chunk.next_phys as usize].prev_phys = tail;
        }
        let head = &mut self.chunks[slot as usize];
        head.size = size;
        head.next_phys = tail;

        self.insert_coalesced(tail);
    }

    fn insert_coalesced(&mut self, slot: u32) {
        let mut slot = slot;

        let next = self.chunks[slot as usize].next_phys;
        if next != NIL && self.chunks[next as usize].free {
            self.remove_free(next);
            self.absorb_next(slot);
        }

        let prev = self.chunks[slot as usize].prev_phys;
        if prev != NIL && self.chunks[prev as usize].free {
            self.remove_free(prev);
            self.absorb_next(prev);
            slot = prev;
        }

        self.insert_free(slot);
    }

    /// Merge the physical successor of `slot` into it and recycle its slot.
    fn absorb_next(&mut self, slot: u32) {
        let next = self.chunks[slot as usize].next_phys;
        let absorbed = self.chunks[next as usize];
        let chunk = &mut self.chunks[slot as usize];
        chunk.size += absorbed.size;
        chunk.next_phys = absorbed.next_phys;
        if absorbed.next_phys != NIL {
            self.chunks[absorbed.next_phys as usize].prev_phys = slot;
        }

        let vacated = &mut self.chunks[next as usize];
        let generation = vacated.generation.wrapping_add(1);
        *vacated = Chunk {
            generation,
            ..Chunk::VACANT
        };
        self.spare.push(next);
    }
}

impl std::fmt::Debug for Arena {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Arena")
            .field("capacity", &self.capacity)
            .field("live", &self.live)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mapping_classes() {
        assert_eq!(mapping(16), (0, 1));
        assert_eq!(mapping(240), (0, 15));
        assert_eq!(mapping(256), (1, 0));
        assert_eq!(mapping(511), (1, 15));
        assert_eq!(mapping(512), (2, 0));
    }

    #[test]
    fn test_search_rounds_up_within_class() {
        // class (1,0) starts at 256, too small for a 272-byte request
        let (fl, sl) = mapping_search(round_to_granule(260).unwrap()).unwrap();
        assert_eq!((fl, sl), (1, 1));
    }

    #[test]
    fn test_alloc_write_read() {
        let mut arena = Arena::on_heap(64 * 1024).unwrap();
        let block = arena.alloc_copy(b"note on").unwrap();
        assert_eq!(arena.bytes(&block), Some(&b"note on"[..]));
        assert_eq!(arena.stats().live_blocks, 1);
    }

    #[test]
    fn test_alloc_free_cycle_leaves_free_list_unchanged() {
        let mut arena = Arena::on_heap(1024 * 1024).unwrap();
        let before = arena.stats();

        for _ in 0..10_000 {
            let block = arena.alloc(100).unwrap();
            arena.free(block).unwrap();
        }

        assert_eq!(arena.stats(), before);
        assert_eq!(before.free_blocks, 1);
    }

    #[test]
    fn test_interleaved_frees_coalesce() {
        let mut arena = Arena::on_heap(64 * 1024).unwrap();
        let before = arena.stats();

        let blocks: Vec<_> = (0..32).map(|i| arena.alloc(16 + i * 8).unwrap()).collect();
        for block in blocks.iter().step_by(2) {
            arena.free(*block).unwrap();
        }
        assert!(arena.stats().free_blocks > 1);
        for block in blocks.iter().skip(1).step_by(2) {
            arena.free(*block).unwrap();
        }

        assert_eq!(arena.stats(), before);
    }

    #[test]
    fn test_exhaustion_is_reported() {
        let mut arena = Arena::on_heap(4096).unwrap();
        let big = arena.alloc(4000).unwrap();
        assert_eq!(
            arena.alloc(512),
            Err(ArenaError::Exhausted { requested: 512 })
        );
        arena.free(big).unwrap();
        assert!(arena.alloc(512).is_ok());
    }

    #[test]
    fn test_oversized_request_is_exhausted() {
        let mut arena = Arena::on_heap(4096).unwrap();
        assert!(matches!(
            arena.alloc(usize::MAX),
            Err(ArenaError::Exhausted { .. })
        ));
    }

    #[test]
    fn test_stale_handle_rejected() {
        let mut arena = Arena::on_heap(4096).unwrap();
        let block = arena.alloc(32).unwrap();
        arena.free(block).unwrap();
        assert_eq!(arena.free(block), Err(ArenaError::StaleBlock));
        assert_eq!(arena.bytes(&block), None);

        let reused = arena.alloc(32).unwrap();
        assert_ne!(reused, block);
    }

    #[test]
    fn test_realloc_grows_in_place_and_keeps_data() {
        let mut arena = Arena::on_heap(64 * 1024).unwrap();
        let block = arena.alloc_copy(b"abcdef").unwrap();
        let grown = arena.realloc(block, 1024).unwrap();
        assert_eq!(grown, block);
        assert_eq!(&arena.bytes(&grown).unwrap()[..6], b"abcdef");
    }

    #[test]
    fn test_realloc_moves_when_blocked() {
        let mut arena = Arena::on_heap(64 * 1024).unwrap();
        let first = arena.alloc_copy(b"payload").unwrap();
        let _fence = arena.alloc(16).unwrap();

        let moved = arena.realloc(first, 2048).unwrap();
        assert_ne!(moved, first);
        assert_eq!(&arena.bytes(&moved).unwrap()[..7], b"payload");
        assert_eq!(arena.bytes(&first), None);
        assert_eq!(arena.stats().live_blocks, 2);
    }

    #[test]
    fn test_realloc_shrink_releases_tail() {
        let mut arena = Arena::on_heap(64 * 1024).unwrap();
        let block = arena.alloc(4096).unwrap();
        let used_before = arena.stats().used_bytes;
        let shrunk = arena.realloc(block, 64).unwrap();
        assert_eq!(shrunk, block);
        assert!(arena.stats().used_bytes < used_before);
        assert_eq!(arena.bytes(&shrunk).unwrap().len(), 64);
    }

    #[test]
    fn test_empty_region_rejected() {
        assert!(matches!(
            Arena::new(Region::heap(8), 16),
            Err(ArenaError::EmptyRegion)
        ));
    }
}
