//! Buddy page-frame allocator
//!
//! One arena per usable memory-map region. Each arena keeps an array of
//! singly-linked free lists, one per block order, and the list nodes live
//! inside the free frames they describe, reached through the direct map.
//! Nothing here takes a lock: callers serialize through the kernel heap
//! lock (or own the allocator outright, as the tests do).
//!
//! Buddy arithmetic works on offsets from the arena base, so an arena does
//! not need to start on a max-order boundary: a block's buddy is the block
//! whose base-relative offset differs exactly in its size bit.

use core::ptr::NonNull;

use log::{error, warn};

use super::{DirectMap, FrameSource, PhysAddr, PAGE_SIZE};
use crate::boot::BootMemoryRegion;
use crate::error::{KernelError, KernelResult};

/// Largest supported block order: 2^20 pages = 4 GiB.
pub const MAX_ORDER: u8 = 20;

/// Maximum number of arenas (memory-map regions) supported.
pub const MAX_ARENAS: usize = 16;

/// Free-list node, written into the first bytes of the free block itself.
#[repr(C)]
struct FreeBlock {
    phys: u64,
    order: u8,
    next: Option<NonNull<FreeBlock>>,
}

/// One contiguous physical region under buddy management.
struct Arena {
    base: u64,
    length: u64,
    max_order: u8,
    free_list: [Option<NonNull<FreeBlock>>; MAX_ORDER as usize + 1],
}

impl Arena {
    const fn block_size(order: u8) -> u64 {
        (1u64 << order) * PAGE_SIZE as u64
    }

    fn contains(&self, addr: u64) -> bool {
        addr >= self.base && addr < self.base + self.length
    }
}

/// Per-order free statistics for one arena.
#[derive(Debug, Clone, Copy, Default)]
pub struct ArenaStats {
    pub free_bytes: u64,
    pub blocks: [u64; MAX_ORDER as usize + 1],
}

/// The buddy allocator: a fixed array of arenas plus the direct-map view
/// used to reach the free-list nodes.
pub struct BuddyAllocator {
    arenas: [Option<Arena>; MAX_ARENAS],
    arena_count: usize,
    dm: DirectMap,
}

// SAFETY: The raw free-list pointers all target physical frames owned by
// this allocator; moving the allocator to another thread moves that
// ownership with it. Callers serialize access externally (heap lock).
unsafe impl Send for BuddyAllocator {}

impl BuddyAllocator {
    pub const fn new(dm: DirectMap) -> Self {
        Self {
            arenas: [const { None }; MAX_ARENAS],
            arena_count: 0,
            dm,
        }
    }

    /// Build the allocator from the boot memory map.
    ///
    /// The first usable entry is skipped on purpose: some firmware presents
    /// the legacy VGA hole as usable and touching it faults under UEFI.
    /// This is boot policy, not a property of the allocator; arenas added
    /// through [`add_arena`](Self::add_arena) are never skipped.
    pub fn from_memory_map(dm: DirectMap, regions: &[BootMemoryRegion]) -> Self {
        let mut buddy = Self::new(dm);
        let mut skipped_first = false;

        for region in regions.iter().filter(|r| r.is_usable()) {
            if !skipped_first {
                skipped_first = true;
                continue;
            }
            // Never hand out the null frame.
            let (base, length) = if region.base == 0 {
                (PAGE_SIZE as u64, region.length.saturating_sub(PAGE_SIZE as u64))
            } else {
                (region.base, region.length)
            };
            match buddy.add_arena(base, length) {
                Ok(idx) => {
                    let stats = buddy.arena_stats(idx);
                    log::info!(
                        "arena {} initialized: base {:#x}, {} KiB free",
                        idx,
                        base,
                        stats.free_bytes / 1024
                    );
                }
                Err(KernelError::ResourceExhausted { .. }) => {
                    warn!("out of arena slots, remaining regions unmanaged");
                    break;
                }
                Err(_) => {}
            }
        }
        buddy
    }

    /// Register `[base, base + length)` as a new arena and populate its
    /// free lists. Returns the arena index.
    pub fn add_arena(&mut self, base: u64, length: u64) -> KernelResult<usize> {
        if self.arena_count >= MAX_ARENAS {
            return Err(KernelError::ResourceExhausted {
                resource: "buddy arenas",
            });
        }

        let aligned_base = super::align_up(base, PAGE_SIZE as u64);
        let end = base + length;
        if aligned_base >= end {
            return Err(KernelError::InvalidArgument { name: "length" });
        }
        let aligned_len = end - aligned_base;
        if aligned_len < PAGE_SIZE as u64 {
            return Err(KernelError::InvalidArgument { name: "length" });
        }

        let mut max_order = 0u8;
        while max_order < MAX_ORDER && Arena::block_size(max_order + 1) <= aligned_len {
            max_order += 1;
        }

        let mut arena = Arena {
            base: aligned_base,
            length: aligned_len,
            max_order,
            free_list: [None; MAX_ORDER as usize + 1],
        };
        Self::populate(self.dm, &mut arena);

        let idx = self.arena_count;
        self.arenas[idx] = Some(arena);
        self.arena_count += 1;
        Ok(idx)
    }

    /// Carve an arena into naturally aligned free blocks, largest first.
    fn populate(dm: DirectMap, arena: &mut Arena) {
        let end = arena.base + arena.length;
        let mut current = arena.base;

        while current < end {
            let remaining = end - current;
            if remaining < PAGE_SIZE as u64 {
                break;
            }

            // Largest order that both fits the remaining span and is
            // aligned (relative to the arena base) to its own size.
            let offset = current - arena.base;
            let mut picked = None;
            for order in (0..=arena.max_order).rev() {
                let size = Arena::block_size(order);
                if size <= remaining && offset & (size - 1) == 0 {
                    picked = Some(order);
                    break;
                }
            }
            let Some(order) = picked else {
                current = super::align_up(current + 1, PAGE_SIZE as u64);
                continue;
            };

            Self::push_block(dm, &mut arena.free_list[order as usize], current, order);
            current += Arena::block_size(order);
        }
    }

    /// Write a free-list node into the block at `phys` and link it in.
    fn push_block(dm: DirectMap, head: &mut Option<NonNull<FreeBlock>>, phys: u64, order: u8) {
        let node = dm.ptr(PhysAddr(phys)) as *mut FreeBlock;
        // SAFETY: `phys` is the base of a free block owned by this arena;
        // nothing else reads the block while it sits on a free list, and
        // page-aligned addresses satisfy FreeBlock's alignment.
        unsafe {
            node.write(FreeBlock {
                phys,
                order,
                next: *head,
            });
            *head = Some(NonNull::new_unchecked(node));
        }
    }

    /// Allocate `2^order` contiguous pages. Returns the physical base.
    pub fn alloc_pages(&mut self, order: u8) -> KernelResult<PhysAddr> {
        if order > MAX_ORDER {
            error!("allocation order {} exceeds maximum {}", order, MAX_ORDER);
            return Err(KernelError::InvalidArgument { name: "order" });
        }

        let dm = self.dm;
        for arena in self.arenas.iter_mut().take(self.arena_count).flatten() {
            // Exact fit first.
            if let Some(node) = arena.free_list[order as usize] {
                // SAFETY: The node sits on this arena's free list, so it
                // points at a live FreeBlock we own.
                unsafe {
                    arena.free_list[order as usize] = node.as_ref().next;
                    return Ok(PhysAddr(node.as_ref().phys));
                }
            }

            // Otherwise split the smallest larger block downward, keeping
            // the left half at each step and shelving the right half.
            for source in order + 1..=arena.max_order {
                let Some(node) = arena.free_list[source as usize] else {
                    continue;
                };
                // SAFETY: As above, the head node is live and owned.
                let addr = unsafe {
                    arena.free_list[source as usize] = node.as_ref().next;
                    node.as_ref().phys
                };

                let mut split = source;
                while split > order {
                    split -= 1;
                    let buddy = addr + Arena::block_size(split);
                    Self::push_block(dm, &mut arena.free_list[split as usize], buddy, split);
                }
                return Ok(PhysAddr(addr));
            }
        }

        Err(KernelError::oom((1usize << order) * PAGE_SIZE))
    }

    /// Return `2^order` pages at `addr`, merging with free buddies upward.
    pub fn free_pages(&mut self, addr: PhysAddr, order: u8) {
        if order > MAX_ORDER {
            error!("free of order {} exceeds maximum {}", order, MAX_ORDER);
            return;
        }

        let dm = self.dm;
        let Some(arena) = self
            .arenas
            .iter_mut()
            .take(self.arena_count)
            .flatten()
            .find(|a| a.contains(addr.0))
        else {
            error!("free of {:#x} which belongs to no arena", addr.0);
            return;
        };

        let mut addr = addr.0;
        let mut order = order;

        while order < arena.max_order {
            let size = Arena::block_size(order);
            let buddy = arena.base + ((addr - arena.base) ^ size);

            // Search this order's list for the buddy and unlink it.
            let mut link: *mut Option<NonNull<FreeBlock>> = &mut arena.free_list[order as usize];
            let mut found = false;
            // SAFETY: Every node reached through `link` is a live free
            // block owned by this arena; `link` always points either at
            // the list head or at a node's `next` field.
            unsafe {
                while let Some(node) = *link {
                    if node.as_ref().phys == buddy {
                        *link = node.as_ref().next;
                        found = true;
                        break;
                    }
                    link = &mut (*node.as_ptr()).next;
                }
            }

            if !found {
                break;
            }
            // The merged block starts at the lower of the two halves.
            addr = addr.min(buddy);
            order += 1;
        }

        // Link only the final block: the loop above already swallowed every
        // buddy the merged block could pair with.
        Self::push_block(dm, &mut arena.free_list[order as usize], addr, order);
    }

    /// Allocate a single page frame.
    pub fn alloc_page(&mut self) -> KernelResult<PhysAddr> {
        self.alloc_pages(0)
    }

    /// Free a single page frame.
    pub fn free_page(&mut self, addr: PhysAddr) {
        self.free_pages(addr, 0)
    }

    pub fn arena_count(&self) -> usize {
        self.arena_count
    }

    pub fn direct_map(&self) -> DirectMap {
        self.dm
    }

    /// Free-block census for one arena.
    pub fn arena_stats(&self, idx: usize) -> ArenaStats {
        let mut stats = ArenaStats::default();
        let Some(arena) = self.arenas.get(idx).and_then(|a| a.as_ref()) else {
            return stats;
        };
        for order in 0..=arena.max_order {
            let mut node = arena.free_list[order as usize];
            // SAFETY: List nodes are live free blocks owned by the arena.
            while let Some(n) = node {
                stats.blocks[order as usize] += 1;
                stats.free_bytes += Arena::block_size(order);
                node = unsafe { n.as_ref().next };
            }
        }
        stats
    }

    /// Bases of the free blocks of one order in one arena, in list order.
    /// Introspection for diagnostics and tests.
    pub fn free_block_bases(&self, idx: usize, order: u8) -> alloc::vec::Vec<u64> {
        let mut bases = alloc::vec::Vec::new();
        let Some(arena) = self.arenas.get(idx).and_then(|a| a.as_ref()) else {
            return bases;
        };
        if order > arena.max_order {
            return bases;
        }
        let mut node = arena.free_list[order as usize];
        // SAFETY: List nodes are live free blocks owned by the arena.
        while let Some(n) = node {
            unsafe {
                bases.push(n.as_ref().phys);
                node = n.as_ref().next;
            }
        }
        bases
    }

    /// Max order of one arena.
    pub fn arena_max_order(&self, idx: usize) -> Option<u8> {
        self.arenas.get(idx).and_then(|a| a.as_ref()).map(|a| a.max_order)
    }
}

impl FrameSource for BuddyAllocator {
    fn alloc_frames(&mut self, order: u8) -> KernelResult<PhysAddr> {
        self.alloc_pages(order)
    }

    fn free_frames(&mut self, addr: PhysAddr, order: u8) {
        self.free_pages(addr, order)
    }
}
