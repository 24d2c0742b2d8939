//! Global size-class heap backing the thread-local caches.
//!
//! Memory comes from the OS in chunks; a chunk is carved into objects of a
//! single size class and pushed on that class's global free list. Every
//! operation here runs with the global allocation lock held.

use std::{fmt, ptr::NonNull};

use crate::{
    ThreadError,
    freelist::{BlockPtr, FreeList},
    system,
};

/// Allocation unit. Every size class is a whole number of granules.
pub const GRANULE_BYTES: usize = 16;
/// Size classes served by the thread-local caches.
pub const SIZE_CLASSES: usize = 25;
/// Largest object handed out by `alloc_small`.
pub const MAX_OBJECT_BYTES: usize = (SIZE_CLASSES - 1) * GRANULE_BYTES;
/// Bytes moved to a thread-local list per refill.
pub const REFILL_BYTES: usize = 4096;

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ObjectKind {
    /// May contain pointers, scanned by the marker.
    Normal = 0,
    /// Never scanned.
    PointerFree = 1,
}

impl ObjectKind {
    pub const COUNT: usize = 2;
    pub const ALL: [ObjectKind; Self::COUNT] = [ObjectKind::Normal, ObjectKind::PointerFree];

    #[inline(always)]
    pub const fn index(self) -> usize {
        self as usize
    }
}

/// Granules of an object in `class`. Class 0 is served like class 1.
#[inline(always)]
pub const fn class_granules(class: usize) -> usize {
    if class == 0 { 1 } else { class }
}

#[inline(always)]
pub const fn class_bytes(class: usize) -> usize {
    class_granules(class) * GRANULE_BYTES
}

/// Smallest size class holding `bytes`, if any.
pub const fn size_class_for(bytes: usize) -> Option<usize> {
    let granules = bytes.div_ceil(GRANULE_BYTES);
    if granules < SIZE_CLASSES {
        Some(if granules == 0 { 1 } else { granules })
    } else {
        None
    }
}

struct Chunk {
    base: NonNull<u8>,
    bytes: usize,
}

pub struct GlobalHeap {
    free: [[FreeList; SIZE_CLASSES]; ObjectKind::COUNT],
    carved: [[usize; SIZE_CLASSES]; ObjectKind::COUNT],
    chunks: Vec<Chunk>,
    chunk_bytes: usize,
}

// SAFETY: chunks are owned mappings and the free lists own their blocks;
// all access happens under the global lock.
unsafe impl Send for GlobalHeap {}

impl GlobalHeap {
    pub fn new(chunk_bytes: usize) -> Self {
        debug_assert!(chunk_bytes >= MAX_OBJECT_BYTES);
        Self {
            free: std::array::from_fn(|_| std::array::from_fn(|_| FreeList::new())),
            carved: [[0; SIZE_CLASSES]; ObjectKind::COUNT],
            chunks: Vec::new(),
            chunk_bytes,
        }
    }

    /// Pops one object, growing the class when its list is empty.
    pub fn alloc(&mut self, kind: ObjectKind, class: usize) -> Result<BlockPtr, ThreadError> {
        debug_assert!(class < SIZE_CLASSES);
        if self.free[kind.index()][class].is_empty() {
            self.grow(kind, class)?;
        }
        self.free[kind.index()][class]
            .pop()
            .ok_or(ThreadError::OutOfMemory)
    }

    /// Takes up to a refill's worth of objects for a thread-local list.
    pub fn alloc_many(&mut self, kind: ObjectKind, class: usize) -> Result<FreeList, ThreadError> {
        debug_assert!(class < SIZE_CLASSES);
        if self.free[kind.index()][class].is_empty() {
            self.grow(kind, class)?;
        }
        let batch = (REFILL_BYTES / class_bytes(class)).max(1);
        Ok(self.free[kind.index()][class].split_off(batch))
    }

    /// Returns one object to its global list.
    ///
    /// # Safety
    /// `block` must have come from this heap for the same kind and class
    /// and must not be referenced afterwards.
    pub unsafe fn free(&mut self, kind: ObjectKind, class: usize, block: BlockPtr) {
        debug_assert!(self.owns(block));
        // SAFETY: contract of the caller
        unsafe { self.free[kind.index()][class].push(block) };
    }

    /// Concatenates a flushed thread-local list onto the global list.
    pub fn give_back(&mut self, kind: ObjectKind, class: usize, list: FreeList) {
        self.free[kind.index()][class].append(list);
    }

    pub fn free_len(&self, kind: ObjectKind, class: usize) -> usize {
        self.free[kind.index()][class].len()
    }

    /// Objects ever carved for this class.
    pub fn carved(&self, kind: ObjectKind, class: usize) -> usize {
        self.carved[kind.index()][class]
    }

    pub fn mapped_bytes(&self) -> usize {
        self.chunks.iter().map(|c| c.bytes).sum()
    }

    pub fn owns(&self, block: BlockPtr) -> bool {
        let addr = block.addr();
        self.chunks.iter().any(|c| {
            let base = c.base.as_ptr() as usize;
            addr >= base && addr < base + c.bytes
        })
    }

    #[cold]
    fn grow(&mut self, kind: ObjectKind, class: usize) -> Result<(), ThreadError> {
        let bytes = self.chunk_bytes;
        let Some(base) = system::map_memory(bytes) else {
            log::warn!("heap growth of {bytes} bytes failed");
            return Err(ThreadError::OutOfMemory);
        };
        self.chunks.push(Chunk { base, bytes });

        let size = class_bytes(class);
        let count = bytes / size;
        let list = &mut self.free[kind.index()][class];
        // carve back to front so the list hands out ascending addresses
        for i in (0..count).rev() {
            // SAFETY: inside the fresh mapping, granule aligned
            let block = unsafe { BlockPtr::new(base.add(i * size)) };
            // SAFETY: fresh memory owned by the heap
            unsafe { list.push(block) };
        }
        self.carved[kind.index()][class] += count;
        log::trace!("carved {count} objects of {size} bytes for {kind:?}");
        Ok(())
    }
}

impl Drop for GlobalHeap {
    fn drop(&mut self) {
        for chunk in self.chunks.drain(..) {
            // SAFETY: mapped by `grow` with this size, no list references it
            unsafe { system::unmap_memory(chunk.base, chunk.bytes) };
        }
    }
}

impl fmt::Debug for GlobalHeap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GlobalHeap")
            .field("chunks", &self.chunks.len())
            .field("mapped_bytes", &self.mapped_bytes())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CHUNK: usize = 16 * 1024;

    #[test]
    fn size_class_rounding() {
        assert_eq!(size_class_for(0), Some(1));
        assert_eq!(size_class_for(1), Some(1));
        assert_eq!(size_class_for(16), Some(1));
        assert_eq!(size_class_for(17), Some(2));
        assert_eq!(size_class_for(MAX_OBJECT_BYTES), Some(SIZE_CLASSES - 1));
        assert_eq!(size_class_for(MAX_OBJECT_BYTES + 1), None);
        assert_eq!(class_bytes(0), class_bytes(1));
    }

    #[test]
    fn first_alloc_carves_a_chunk() {
        let mut heap = GlobalHeap::new(CHUNK);
        let block = heap.alloc(ObjectKind::Normal, 3).expect("alloc");
        assert!(heap.owns(block));
        assert_eq!(block.addr() % GRANULE_BYTES, 0);
        let carved = heap.carved(ObjectKind::Normal, 3);
        assert_eq!(carved, CHUNK / class_bytes(3));
        assert_eq!(heap.free_len(ObjectKind::Normal, 3), carved - 1);
        assert_eq!(heap.free_len(ObjectKind::PointerFree, 3), 0, "kinds are separate");
    }

    #[test]
    fn objects_do_not_overlap() {
        let mut heap = GlobalHeap::new(CHUNK);
        let a = heap.alloc(ObjectKind::Normal, 2).unwrap();
        let b = heap.alloc(ObjectKind::Normal, 2).unwrap();
        assert!(a.addr().abs_diff(b.addr()) >= class_bytes(2));
    }

    #[test]
    fn alloc_many_takes_a_refill_batch() {
        let mut heap = GlobalHeap::new(CHUNK);
        let list = heap.alloc_many(ObjectKind::PointerFree, 4).unwrap();
        assert_eq!(list.len(), REFILL_BYTES / class_bytes(4));
        let carved = heap.carved(ObjectKind::PointerFree, 4);
        assert_eq!(heap.free_len(ObjectKind::PointerFree, 4) + list.len(), carved);
        heap.give_back(ObjectKind::PointerFree, 4, list);
        assert_eq!(heap.free_len(ObjectKind::PointerFree, 4), carved);
    }

    #[test]
    fn free_returns_to_global_list() {
        let mut heap = GlobalHeap::new(CHUNK);
        let block = heap.alloc(ObjectKind::Normal, 1).unwrap();
        let before = heap.free_len(ObjectKind::Normal, 1);
        // SAFETY: allocated above, no longer used
        unsafe { heap.free(ObjectKind::Normal, 1, block) };
        assert_eq!(heap.free_len(ObjectKind::Normal, 1), before + 1);
        assert_eq!(heap.alloc(ObjectKind::Normal, 1).unwrap(), block);
    }
}
