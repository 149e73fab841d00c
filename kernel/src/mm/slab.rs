//! Slab allocator
//!
//! Eight size-class caches layered on the buddy allocator. Each slab is one
//! order-1 buddy block (two pages): a fixed-size header at the front, then
//! equal-sized objects. Free objects chain through their own first bytes
//! and carry a poison word that doubles as the double-free sentinel. A
//! cache keeps its slabs on three lists (full, partial, empty) so that
//! allocation never scans.
//!
//! Serialization is the caller's problem (the kernel heap lock); nothing
//! here locks.

use core::ptr::NonNull;

use log::{error, warn};

use super::buddy::BuddyAllocator;
use super::{DirectMap, PhysAddr, PAGE_SIZE};
use crate::error::{KernelError, KernelResult};

/// The eight object size classes.
pub const SLAB_SIZES: [usize; 8] = [16, 32, 64, 128, 256, 512, 1024, 2048];

/// Bytes per slab: one order-1 buddy block.
pub const SLAB_BYTES: usize = 2 * PAGE_SIZE;

/// Buddy order backing one slab.
pub const SLAB_ORDER: u8 = 1;

/// Identifies a live slab header.
pub const SLAB_MAGIC: u64 = 0xCAFE_BABE_DEAD_BABE;

/// Stamped into an object's first word while it is free.
pub const OBJECT_POISON: u64 = 0xDEAD_DEAD_DEAD_DEAD;

/// Header size reserved at the front of each slab. Padded to 64 bytes so
/// the object area starts cache-line aligned.
pub const SLAB_HEADER_SIZE: usize = 64;

/// Empty slabs kept per cache when shrinking.
const SHRINK_KEEP: usize = 2;

/// In-memory slab header, written at the base of the two-page block.
#[repr(C)]
struct SlabHeader {
    magic: u64,
    /// Index into [`SLAB_SIZES`]; recovers the owning cache from a bare
    /// pointer during containment checks.
    size_class: usize,
    phys: u64,
    free_count: usize,
    free_list: Option<NonNull<FreeObject>>,
    next: Option<NonNull<SlabHeader>>,
}

/// Link living in the first bytes of every free object. Allocated objects
/// overwrite it with payload; that is the design, not an accident.
#[repr(C)]
struct FreeObject {
    magic: u64,
    next: Option<NonNull<FreeObject>>,
}

const _: () = assert!(core::mem::size_of::<SlabHeader>() <= SLAB_HEADER_SIZE);
const _: () = assert!(core::mem::size_of::<FreeObject>() <= SLAB_SIZES[0]);

/// Objects that fit one slab of the given class.
pub const fn objects_per_slab(object_size: usize) -> usize {
    (SLAB_BYTES - SLAB_HEADER_SIZE) / object_size
}

/// Smallest size class that fits `size`, if any.
pub fn class_for(size: usize) -> Option<usize> {
    SLAB_SIZES.iter().position(|&s| size <= s)
}

/// Per-size-class cache: three slab lists plus counters.
struct SlabCache {
    object_size: usize,
    objects_per_slab: usize,
    full: Option<NonNull<SlabHeader>>,
    partial: Option<NonNull<SlabHeader>>,
    empty: Option<NonNull<SlabHeader>>,
    total_slabs: usize,
    total_objects: usize,
    allocated_objects: usize,
}

impl SlabCache {
    const fn new(object_size: usize) -> Self {
        Self {
            object_size,
            objects_per_slab: objects_per_slab(object_size),
            full: None,
            partial: None,
            empty: None,
            total_slabs: 0,
            total_objects: 0,
            allocated_objects: 0,
        }
    }
}

/// Counters for one cache, for diagnostics and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlabCacheStats {
    pub object_size: usize,
    pub objects_per_slab: usize,
    pub total_slabs: usize,
    pub total_objects: usize,
    pub allocated_objects: usize,
    pub full_slabs: usize,
    pub partial_slabs: usize,
    pub empty_slabs: usize,
}

/// The slab allocator: one cache per size class.
pub struct SlabAllocator {
    caches: [SlabCache; SLAB_SIZES.len()],
    dm: DirectMap,
}

// SAFETY: All raw pointers target slab memory owned by this allocator's
// caches; access is serialized externally by the heap lock.
unsafe impl Send for SlabAllocator {}

impl SlabAllocator {
    pub const fn new(dm: DirectMap) -> Self {
        Self {
            caches: [
                SlabCache::new(SLAB_SIZES[0]),
                SlabCache::new(SLAB_SIZES[1]),
                SlabCache::new(SLAB_SIZES[2]),
                SlabCache::new(SLAB_SIZES[3]),
                SlabCache::new(SLAB_SIZES[4]),
                SlabCache::new(SLAB_SIZES[5]),
                SlabCache::new(SLAB_SIZES[6]),
                SlabCache::new(SLAB_SIZES[7]),
            ],
            dm,
        }
    }

    /// Allocate an object of the smallest class that fits `size`.
    pub fn alloc(&mut self, size: usize, buddy: &mut BuddyAllocator) -> KernelResult<NonNull<u8>> {
        let class = class_for(size).ok_or(KernelError::InvalidArgument { name: "size" })?;

        // Partial first, then empty, then grow.
        let slab = match self.caches[class].partial.or(self.caches[class].empty) {
            Some(slab) => slab,
            None => self.create_slab(class, buddy)?,
        };

        let cache = &mut self.caches[class];

        // SAFETY: `slab` came off one of this cache's lists (or was just
        // created), so it points at a live header we own; its free list
        // links only point into the same slab's object area.
        unsafe {
            let hdr = slab.as_ptr();
            let Some(obj) = (*hdr).free_list else {
                error!(
                    "slab {:#x} on an allocatable list with an empty free list",
                    (*hdr).phys
                );
                return Err(KernelError::Corruption { addr: (*hdr).phys });
            };

            (*hdr).free_list = (*obj.as_ptr()).next;
            (*hdr).free_count -= 1;
            cache.allocated_objects += 1;

            // Clear the poison so a stale sentinel in untouched memory can
            // never masquerade as a double free later.
            (*obj.as_ptr()).magic = 0;

            if (*hdr).free_count == 0 {
                Self::unlink(cache, slab);
                (*hdr).next = cache.full;
                cache.full = Some(slab);
            } else if (*hdr).free_count == cache.objects_per_slab - 1 {
                Self::unlink(cache, slab);
                (*hdr).next = cache.partial;
                cache.partial = Some(slab);
            }

            Ok(NonNull::new_unchecked(obj.as_ptr() as *mut u8))
        }
    }

    /// Return `ptr` to the slab that contains it.
    pub fn free(&mut self, slab: NonNull<u8>, ptr: NonNull<u8>) {
        let slab = slab.cast::<SlabHeader>();
        // SAFETY: `slab` was produced by `find_containing`, so it points at
        // a live header of ours and `ptr` lies inside its object area.
        unsafe {
            let hdr = slab.as_ptr();
            let class = (*hdr).size_class;
            let cache = &mut self.caches[class];

            let obj = ptr.cast::<FreeObject>();
            (*obj.as_ptr()).magic = OBJECT_POISON;
            (*obj.as_ptr()).next = (*hdr).free_list;
            (*hdr).free_list = Some(obj);
            (*hdr).free_count += 1;
            cache.allocated_objects -= 1;

            if (*hdr).free_count == 1 {
                // Was full, now has room.
                Self::unlink(cache, slab);
                (*hdr).next = cache.partial;
                cache.partial = Some(slab);
            } else if (*hdr).free_count == cache.objects_per_slab {
                Self::unlink(cache, slab);
                (*hdr).next = cache.empty;
                cache.empty = Some(slab);
            }
        }
    }

    /// Containment test: does `ptr` point into a live slab's object area?
    ///
    /// Masks the pointer down to the two-page slab base and validates the
    /// header. The masked read requires `ptr` to point into direct-mapped
    /// memory owned by the allocators, which is true for everything the
    /// heap hands out.
    pub fn find_containing(&self, ptr: *const u8) -> Option<NonNull<u8>> {
        let base = (ptr as usize) & !(SLAB_BYTES - 1);
        let hdr = base as *const SlabHeader;

        // SAFETY: The caller guarantees `ptr` points into allocator-owned
        // direct-mapped memory, so the containing two-page block is
        // readable even when it is not a slab; the magic check rejects
        // non-slab blocks.
        unsafe {
            if (*hdr).magic != SLAB_MAGIC {
                return None;
            }
            let class = (*hdr).size_class;
            if class >= SLAB_SIZES.len() {
                return None;
            }
            let objects_start = base + SLAB_HEADER_SIZE;
            let objects_end = objects_start + objects_per_slab(SLAB_SIZES[class]) * SLAB_SIZES[class];
            let p = ptr as usize;
            if p >= objects_start && p < objects_end {
                NonNull::new(base as *mut u8)
            } else {
                None
            }
        }
    }

    /// Is `ptr` a slab object? Routing predicate for the heap's free path.
    pub fn is_slab_address(&self, ptr: *const u8) -> bool {
        self.find_containing(ptr).is_some()
    }

    /// Whether a free object carries the double-free poison.
    pub fn is_poisoned(ptr: *const u8) -> bool {
        // SAFETY: The caller has already established via `find_containing`
        // that `ptr` lies in a slab object area, which is readable.
        unsafe { (*(ptr as *const FreeObject)).magic == OBJECT_POISON }
    }

    /// Keep at most [`SHRINK_KEEP`] empty slabs per cache, returning the
    /// rest to the buddy.
    pub fn shrink(&mut self, buddy: &mut BuddyAllocator) {
        for class in 0..SLAB_SIZES.len() {
            let cache = &mut self.caches[class];
            let mut kept = 0;
            let mut link: *mut Option<NonNull<SlabHeader>> = &mut cache.empty;

            // SAFETY: Nodes reached through `link` are live headers on this
            // cache's empty list; unlinking happens before the backing
            // pages are returned to the buddy.
            unsafe {
                while let Some(slab) = *link {
                    if kept < SHRINK_KEEP {
                        kept += 1;
                        link = &mut (*slab.as_ptr()).next;
                        continue;
                    }
                    *link = (*slab.as_ptr()).next;
                    let phys = (*slab.as_ptr()).phys;
                    if (*slab.as_ptr()).free_count != cache.objects_per_slab {
                        warn!("destroying slab {:#x} that still has live objects", phys);
                    }
                    cache.total_slabs -= 1;
                    cache.total_objects -= cache.objects_per_slab;
                    // Invalidate the header so stale pointers fail the
                    // containment check.
                    (*slab.as_ptr()).magic = 0;
                    buddy.free_pages(PhysAddr::new(phys), SLAB_ORDER);
                }
            }
        }
    }

    /// Counters for the cache serving `size`.
    pub fn cache_stats(&self, size: usize) -> Option<SlabCacheStats> {
        let class = class_for(size)?;
        let cache = &self.caches[class];
        Some(SlabCacheStats {
            object_size: cache.object_size,
            objects_per_slab: cache.objects_per_slab,
            total_slabs: cache.total_slabs,
            total_objects: cache.total_objects,
            allocated_objects: cache.allocated_objects,
            full_slabs: Self::list_len(cache.full),
            partial_slabs: Self::list_len(cache.partial),
            empty_slabs: Self::list_len(cache.empty),
        })
    }

    fn list_len(mut node: Option<NonNull<SlabHeader>>) -> usize {
        let mut n = 0;
        // SAFETY: List nodes are live headers owned by the cache.
        while let Some(s) = node {
            n += 1;
            node = unsafe { (*s.as_ptr()).next };
        }
        n
    }

    /// Allocate a fresh slab from the buddy and thread its free list.
    fn create_slab(
        &mut self,
        class: usize,
        buddy: &mut BuddyAllocator,
    ) -> KernelResult<NonNull<SlabHeader>> {
        let object_size = SLAB_SIZES[class];
        let phys = buddy.alloc_pages(SLAB_ORDER).map_err(|e| {
            error!("no pages for a new {}-byte slab", object_size);
            e
        })?;

        let base = self.dm.ptr(phys);
        let cache = &mut self.caches[class];

        // SAFETY: `base` addresses a fresh, exclusively owned two-page
        // block; the header and every object slot lie inside it.
        unsafe {
            let hdr = base as *mut SlabHeader;
            hdr.write(SlabHeader {
                magic: SLAB_MAGIC,
                size_class: class,
                phys: phys.as_u64(),
                free_count: cache.objects_per_slab,
                free_list: None,
                next: None,
            });

            let objects_start = base.add(SLAB_HEADER_SIZE);
            for i in (0..cache.objects_per_slab).rev() {
                let obj = objects_start.add(i * object_size) as *mut FreeObject;
                obj.write(FreeObject {
                    magic: OBJECT_POISON,
                    next: (*hdr).free_list,
                });
                (*hdr).free_list = Some(NonNull::new_unchecked(obj));
            }

            let slab = NonNull::new_unchecked(hdr);
            (*hdr).next = cache.empty;
            cache.empty = Some(slab);
            cache.total_slabs += 1;
            cache.total_objects += cache.objects_per_slab;
            Ok(slab)
        }
    }

    /// Unlink `slab` from whichever of the cache's three lists holds it.
    fn unlink(cache: &mut SlabCache, slab: NonNull<SlabHeader>) {
        // Partial first: it is where transitions usually start.
        for head in [&mut cache.partial, &mut cache.full, &mut cache.empty] {
            let mut link: *mut Option<NonNull<SlabHeader>> = head;
            // SAFETY: Nodes reached through `link` are live headers on one
            // of this cache's lists.
            unsafe {
                while let Some(node) = *link {
                    if node == slab {
                        *link = (*node.as_ptr()).next;
                        (*node.as_ptr()).next = None;
                        return;
                    }
                    link = &mut (*node.as_ptr()).next;
                }
            }
        }
    }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;
    use crate::mm::buddy::BuddyAllocator;
    use crate::mm::testing::TestArena;
    use alloc::vec::Vec;

    fn setup(pages: usize) -> (TestArena, BuddyAllocator) {
        let arena = TestArena::new(0x20_0000, pages * PAGE_SIZE);
        let mut buddy = BuddyAllocator::new(arena.dm);
        buddy
            .add_arena(arena.base, (pages * PAGE_SIZE) as u64)
            .expect("arena accepted");
        (arena, buddy)
    }

    #[test]
    fn class_routing_picks_smallest_fit() {
        assert_eq!(class_for(1), Some(0));
        assert_eq!(class_for(16), Some(0));
        assert_eq!(class_for(17), Some(1));
        assert_eq!(class_for(40), Some(2));
        assert_eq!(class_for(2048), Some(7));
        assert_eq!(class_for(2049), None);
    }

    #[test]
    fn objects_per_slab_matches_layout() {
        assert_eq!(objects_per_slab(64), (SLAB_BYTES - SLAB_HEADER_SIZE) / 64);
        assert_eq!(objects_per_slab(64), 127);
        assert_eq!(objects_per_slab(2048), 3);
    }

    #[test]
    fn slab_fills_then_partials_then_empties() {
        let (_arena, mut buddy) = setup(64);
        let mut slab = SlabAllocator::new(buddy.direct_map());

        let n = objects_per_slab(64);
        let mut objs = Vec::new();
        for _ in 0..n {
            objs.push(slab.alloc(64, &mut buddy).expect("slab object"));
        }
        let stats = slab.cache_stats(64).expect("valid class");
        assert_eq!(stats.allocated_objects, n);
        assert_eq!((stats.full_slabs, stats.partial_slabs, stats.empty_slabs), (1, 0, 0));

        // One free moves the slab to partial.
        let last = objs.pop().expect("allocated at least one object");
        let container = slab.find_containing(last.as_ptr()).expect("own object");
        slab.free(container, last);
        let stats = slab.cache_stats(64).expect("valid class");
        assert_eq!((stats.full_slabs, stats.partial_slabs, stats.empty_slabs), (0, 1, 0));

        // Freeing the rest empties it.
        for obj in objs {
            let container = slab.find_containing(obj.as_ptr()).expect("own object");
            slab.free(container, obj);
        }
        let stats = slab.cache_stats(64).expect("valid class");
        assert_eq!((stats.full_slabs, stats.partial_slabs, stats.empty_slabs), (0, 0, 1));
        assert_eq!(stats.allocated_objects, 0);
    }

    #[test]
    fn freed_object_is_reused_lifo() {
        let (_arena, mut buddy) = setup(16);
        let mut slab = SlabAllocator::new(buddy.direct_map());

        let a = slab.alloc(128, &mut buddy).expect("first object");
        let container = slab.find_containing(a.as_ptr()).expect("own object");
        slab.free(container, a);
        let b = slab.alloc(128, &mut buddy).expect("second object");
        assert_eq!(a, b);
    }

    #[test]
    fn containment_rejects_foreign_and_out_of_range_pointers() {
        let (arena, mut buddy) = setup(32);
        let mut slab = SlabAllocator::new(buddy.direct_map());

        let obj = slab.alloc(256, &mut buddy).expect("object");
        assert!(slab.is_slab_address(obj.as_ptr()));

        // A pointer into a plain buddy block is not a slab address.
        let raw = buddy.alloc_pages(1).expect("raw block");
        let raw_ptr = arena.dm.ptr(raw);
        assert!(!slab.is_slab_address(raw_ptr));

        // The header area itself is not in the object range.
        let hdr_ptr = (obj.as_ptr() as usize & !(SLAB_BYTES - 1)) as *const u8;
        assert!(!slab.is_slab_address(hdr_ptr));
    }

    #[test]
    fn poison_marks_free_objects() {
        let (_arena, mut buddy) = setup(16);
        let mut slab = SlabAllocator::new(buddy.direct_map());

        let obj = slab.alloc(64, &mut buddy).expect("object");
        // Live objects have the poison cleared even if never written.
        assert!(!SlabAllocator::is_poisoned(obj.as_ptr()));

        let container = slab.find_containing(obj.as_ptr()).expect("own object");
        slab.free(container, obj);
        assert!(SlabAllocator::is_poisoned(obj.as_ptr()));
    }

    #[test]
    fn shrink_keeps_two_empty_slabs() {
        let (_arena, mut buddy) = setup(64);
        let mut slab = SlabAllocator::new(buddy.direct_map());
        let free_before = buddy.arena_stats(0).free_bytes;

        // Force four slabs into existence by filling three and starting a
        // fourth, then free everything.
        let n = objects_per_slab(1024);
        let mut objs = Vec::new();
        for _ in 0..(3 * n + 1) {
            objs.push(slab.alloc(1024, &mut buddy).expect("slab object"));
        }
        assert_eq!(slab.cache_stats(1024).expect("valid class").total_slabs, 4);
        for obj in objs.drain(..) {
            let container = slab.find_containing(obj.as_ptr()).expect("own object");
            slab.free(container, obj);
        }

        slab.shrink(&mut buddy);
        let stats = slab.cache_stats(1024).expect("valid class");
        assert_eq!(stats.total_slabs, 2);
        assert_eq!(stats.empty_slabs, 2);

        // The two destroyed slabs' pages went back to the buddy.
        assert_eq!(
            buddy.arena_stats(0).free_bytes,
            free_before - 2 * SLAB_BYTES as u64
        );
    }
}
