//! Kernel heap: `kalloc` / `kfree`
//!
//! Requests up to 2 KiB go to the slab caches; anything larger takes whole
//! buddy blocks wrapped in a header and trailing magic so that overruns and
//! double frees are caught at free time. The policy on bad frees is
//! deliberate: corrupt memory is logged and leaked, never handed back to
//! the allocators.
//!
//! Every public entry point takes the single IRQ-save heap lock. Page-fault
//! handling and the scheduler allocate, and so do interrupt handlers, so a
//! plain lock here would deadlock the first time an IRQ arrived mid-alloc.

use core::ptr::NonNull;

use log::{error, warn};

use super::buddy::{BuddyAllocator, MAX_ORDER};
use super::slab::{SlabAllocator, OBJECT_POISON};
use super::{DirectMap, FrameSource, PhysAddr, PAGE_SIZE};
use crate::error::{KernelError, KernelResult};
use crate::sync::SpinLock;

/// Live-allocation magic, stamped before and after every buddy-backed
/// allocation.
pub const ALLOC_MAGIC: u64 = 0xDEAD_BEEF_CAFE_BABE;

/// Written over the header magic when a block is freed; shares its value
/// with the slab object poison so both paths detect double frees the same
/// way.
pub const FREED_PATTERN: u64 = OBJECT_POISON;

/// Largest request the slab caches serve.
const SLAB_THRESHOLD: usize = 2048;

/// Header preceding every buddy-backed allocation.
#[repr(C, align(8))]
struct AllocHeader {
    magic: u64,
    size: u32,
    order: u8,
}

const HEADER_SIZE: usize = core::mem::size_of::<AllocHeader>();
const TRAILER_SIZE: usize = core::mem::size_of::<u64>();

/// The kernel heap: buddy + slab behind one lock.
pub struct KernelHeap {
    buddy: BuddyAllocator,
    slab: SlabAllocator,
    dm: DirectMap,
}

impl KernelHeap {
    pub fn new(buddy: BuddyAllocator) -> Self {
        let dm = buddy.direct_map();
        Self {
            buddy,
            slab: SlabAllocator::new(dm),
            dm,
        }
    }

    /// Allocate `size` bytes. Small requests come from the slab caches;
    /// large ones take a buddy block with guard magic on both ends.
    pub fn kalloc(&mut self, size: usize) -> KernelResult<NonNull<u8>> {
        if size == 0 {
            warn!("zero-size allocation request");
            return Err(KernelError::InvalidArgument { name: "size" });
        }

        if size <= SLAB_THRESHOLD {
            match self.slab.alloc(size, &mut self.buddy) {
                Ok(ptr) => return Ok(ptr),
                Err(_) => {
                    warn!("slab allocation failed for {} bytes, trying buddy", size);
                }
            }
        }

        let total = HEADER_SIZE + size + TRAILER_SIZE;
        let mut order: u8 = 0;
        let mut block = PAGE_SIZE;
        while block < total {
            order += 1;
            block <<= 1;
        }
        if order > MAX_ORDER {
            error!("allocation of {} bytes exceeds the largest block", size);
            return Err(KernelError::oom(size));
        }

        let phys = self.buddy.alloc_pages(order)?;
        let base = self.dm.ptr(phys);

        // SAFETY: `base` addresses an exclusively owned block of
        // `2^order` pages; header, payload and trailer all fit in it by
        // the order computation above.
        unsafe {
            let hdr = base as *mut AllocHeader;
            hdr.write(AllocHeader {
                magic: ALLOC_MAGIC,
                size: size as u32,
                order,
            });
            let data = base.add(HEADER_SIZE);
            (data.add(size) as *mut u64).write_unaligned(ALLOC_MAGIC);
            Ok(NonNull::new_unchecked(data))
        }
    }

    /// Free a pointer returned by [`kalloc`](Self::kalloc).
    pub fn kfree(&mut self, ptr: *mut u8) {
        if ptr.is_null() {
            return;
        }

        // Slab objects route by containment; everything else must carry a
        // heap header.
        if let Some(slab) = self.slab.find_containing(ptr) {
            if SlabAllocator::is_poisoned(ptr) {
                error!("double free of slab object at {:p}", ptr);
                return;
            }
            // SAFETY: `find_containing` proved `ptr` is inside this slab's
            // object area and non-null.
            self.slab.free(slab, unsafe { NonNull::new_unchecked(ptr) });
            return;
        }

        // SAFETY: A non-slab pointer from kalloc sits HEADER_SIZE bytes
        // past its block base; header and trailer both lie inside the
        // direct-mapped block the buddy handed out.
        unsafe {
            let hdr = ptr.sub(HEADER_SIZE) as *mut AllocHeader;

            if (*hdr).magic == FREED_PATTERN {
                error!("double free of heap block at {:p}", ptr);
                return;
            }

            let mut corrupt = false;
            if (*hdr).magic != ALLOC_MAGIC {
                error!("heap header overwritten before {:p}", ptr);
                corrupt = true;
            } else {
                let trailer = ptr.add((*hdr).size as usize) as *const u64;
                if trailer.read_unaligned() != ALLOC_MAGIC {
                    error!("heap trailer overwritten past {:p}", ptr);
                    corrupt = true;
                }
            }
            if corrupt {
                // Leak on purpose: a block with bad guards cannot be
                // trusted back into the free lists.
                return;
            }

            (*hdr).magic = FREED_PATTERN;
            let phys = self.dm.phys_of(hdr as *const u8);
            self.buddy.free_pages(phys, (*hdr).order);
        }
    }

    /// Allocate one physical frame.
    pub fn alloc_page(&mut self) -> KernelResult<PhysAddr> {
        self.buddy.alloc_page()
    }

    /// Free one physical frame.
    pub fn free_page(&mut self, phys: PhysAddr) {
        self.buddy.free_page(phys)
    }

    /// Trim the slab caches' empty slabs back into the buddy.
    pub fn shrink(&mut self) {
        self.slab.shrink(&mut self.buddy);
    }

    pub fn buddy(&mut self) -> &mut BuddyAllocator {
        &mut self.buddy
    }

    pub fn slab(&self) -> &SlabAllocator {
        &self.slab
    }
}

impl FrameSource for KernelHeap {
    fn alloc_frames(&mut self, order: u8) -> KernelResult<PhysAddr> {
        self.buddy.alloc_pages(order)
    }

    fn free_frames(&mut self, addr: PhysAddr, order: u8) {
        self.buddy.free_pages(addr, order)
    }
}

// ---------------------------------------------------------------------------
// Global heap
// ---------------------------------------------------------------------------

/// The one kernel heap, behind the IRQ-save heap lock.
static KERNEL_HEAP: SpinLock<Option<KernelHeap>> = SpinLock::new(None);

/// Install the kernel heap. Called once after the buddy is built from the
/// boot memory map.
pub fn init(buddy: BuddyAllocator) {
    let mut heap = KERNEL_HEAP.lock_irqsave();
    if heap.is_some() {
        warn!("kernel heap initialized twice, keeping the first");
        return;
    }
    *heap = Some(KernelHeap::new(buddy));
}

/// Whether [`init`] has run.
pub fn is_initialized() -> bool {
    KERNEL_HEAP.lock_irqsave().is_some()
}

/// Run `f` against the global heap.
pub fn with_heap<R>(f: impl FnOnce(&mut KernelHeap) -> R) -> KernelResult<R> {
    let mut guard = KERNEL_HEAP.lock_irqsave();
    match guard.as_mut() {
        Some(heap) => Ok(f(heap)),
        None => Err(KernelError::NotInitialized { subsystem: "heap" }),
    }
}

/// Allocate `size` bytes from the kernel heap. Returns null on failure.
pub fn kalloc(size: usize) -> *mut u8 {
    match with_heap(|heap| heap.kalloc(size)) {
        Ok(Ok(ptr)) => ptr.as_ptr(),
        _ => core::ptr::null_mut(),
    }
}

/// Free a pointer previously returned by [`kalloc`].
pub fn kfree(ptr: *mut u8) {
    let _ = with_heap(|heap| heap.kfree(ptr));
}

/// Allocate one physical frame. Returns the null address on failure.
pub fn alloc_page() -> PhysAddr {
    match with_heap(|heap| heap.alloc_page()) {
        Ok(Ok(phys)) => phys,
        _ => PhysAddr::zero(),
    }
}

/// Free one physical frame.
pub fn free_page(phys: PhysAddr) {
    let _ = with_heap(|heap| heap.free_page(phys));
}

/// Frame supply backed by the global heap lock, for page-table building
/// and region growth in kernel context.
pub struct GlobalFrames;

impl FrameSource for GlobalFrames {
    fn alloc_frames(&mut self, order: u8) -> KernelResult<PhysAddr> {
        with_heap(|heap| heap.buddy.alloc_pages(order))?
    }

    fn free_frames(&mut self, addr: PhysAddr, order: u8) {
        let _ = with_heap(|heap| heap.buddy.free_pages(addr, order));
    }
}

// ---------------------------------------------------------------------------
// Rust global allocator (bare metal)
// ---------------------------------------------------------------------------

/// Size of the static early-boot heap: carries allocations made before the
/// buddy exists (boot logging, early tables).
#[cfg(all(target_arch = "x86_64", target_os = "none"))]
const EARLY_HEAP_SIZE: usize = 1024 * 1024;

#[cfg(all(target_arch = "x86_64", target_os = "none"))]
#[repr(align(16))]
struct EarlyHeapArea([u8; EARLY_HEAP_SIZE]);

#[cfg(all(target_arch = "x86_64", target_os = "none"))]
static mut EARLY_HEAP_MEMORY: EarlyHeapArea = EarlyHeapArea([0; EARLY_HEAP_SIZE]);

#[cfg(all(target_arch = "x86_64", target_os = "none"))]
static EARLY_HEAP: linked_list_allocator::LockedHeap = linked_list_allocator::LockedHeap::empty();

#[cfg(all(target_arch = "x86_64", target_os = "none"))]
static EARLY_HEAP_READY: core::sync::atomic::AtomicBool =
    core::sync::atomic::AtomicBool::new(false);

/// `GlobalAlloc` adapter: `Box`/`Vec`/`Arc` in the kernel land here.
///
/// Routing: before [`init`] runs (or for alignments above 16, which the
/// size-class heap does not guarantee) allocations come from the early
/// linked-list heap; everything else goes through `kalloc`/`kfree`.
#[cfg(all(target_arch = "x86_64", target_os = "none"))]
pub struct KernelAllocator;

#[cfg(all(target_arch = "x86_64", target_os = "none"))]
impl KernelAllocator {
    pub const fn new() -> Self {
        Self
    }

    fn early_range() -> (usize, usize) {
        // SAFETY: Only the address is taken; the buffer itself is never
        // referenced directly.
        let start = unsafe { core::ptr::addr_of!(EARLY_HEAP_MEMORY) as usize };
        (start, start + EARLY_HEAP_SIZE)
    }

    fn ensure_early_init() {
        use core::sync::atomic::Ordering;
        if !EARLY_HEAP_READY.swap(true, Ordering::AcqRel) {
            // SAFETY: The static buffer is referenced only through the
            // early heap after this point; init runs once, guarded by the
            // atomic swap.
            unsafe {
                let start = core::ptr::addr_of_mut!(EARLY_HEAP_MEMORY) as *mut u8;
                EARLY_HEAP.lock().init(start, EARLY_HEAP_SIZE);
            }
        }
    }
}

#[cfg(all(target_arch = "x86_64", target_os = "none"))]
// SAFETY: Allocations are served either by the locked early heap or by the
// locked kernel heap; frees are routed back to whichever served them by
// address range, so no block ever crosses allocators.
unsafe impl core::alloc::GlobalAlloc for KernelAllocator {
    unsafe fn alloc(&self, layout: core::alloc::Layout) -> *mut u8 {
        Self::ensure_early_init();
        if layout.align() <= 16 && is_initialized() {
            return kalloc(layout.size());
        }
        EARLY_HEAP
            .lock()
            .allocate_first_fit(layout)
            .map(|p| p.as_ptr())
            .unwrap_or(core::ptr::null_mut())
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: core::alloc::Layout) {
        let (start, end) = Self::early_range();
        let addr = ptr as usize;
        if addr >= start && addr < end {
            // SAFETY: The pointer was produced by the early heap with this
            // layout, as established by the range check.
            unsafe {
                EARLY_HEAP
                    .lock()
                    .deallocate(core::ptr::NonNull::new_unchecked(ptr), layout)
            };
        } else {
            kfree(ptr);
        }
    }
}

#[cfg(all(target_arch = "x86_64", target_os = "none"))]
impl Default for KernelAllocator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;
    use crate::mm::slab::SLAB_BYTES;
    use crate::mm::testing::TestArena;

    const MIB: usize = 1024 * 1024;

    fn heap_over(arena: &TestArena) -> KernelHeap {
        let mut buddy = BuddyAllocator::new(arena.dm);
        buddy
            .add_arena(arena.base, arena.len as u64)
            .expect("arena accepted");
        KernelHeap::new(buddy)
    }

    #[test]
    fn small_requests_route_to_slab() {
        let arena = TestArena::new(0x30_0000, 4 * MIB);
        let mut heap = heap_over(&arena);

        let ptr = heap.kalloc(40).expect("small allocation");
        // A 40-byte request lands in the 64-byte cache.
        assert!(heap.slab().is_slab_address(ptr.as_ptr()));
        let stats = heap.slab().cache_stats(40).expect("valid class");
        assert_eq!(stats.object_size, 64);
        assert_eq!(stats.allocated_objects, 1);

        heap.kfree(ptr.as_ptr());
        let stats = heap.slab().cache_stats(40).expect("valid class");
        assert_eq!(stats.allocated_objects, 0);
    }

    #[test]
    fn large_requests_carry_header_and_trailer() {
        let arena = TestArena::new(0x30_0000, 4 * MIB);
        let mut heap = heap_over(&arena);

        let ptr = heap.kalloc(5000).expect("large allocation");
        assert!(!heap.slab().is_slab_address(ptr.as_ptr()));

        // 5000 + header + trailer fits an order-1 block (8 KiB).
        // SAFETY (test): reading guard words this heap just wrote.
        unsafe {
            let hdr = ptr.as_ptr().sub(HEADER_SIZE) as *const AllocHeader;
            assert_eq!((*hdr).magic, ALLOC_MAGIC);
            assert_eq!((*hdr).size, 5000);
            assert_eq!((*hdr).order, 1);
            let trailer = ptr.as_ptr().add(5000) as *const u64;
            assert_eq!(trailer.read_unaligned(), ALLOC_MAGIC);
        }

        let free_before = heap.buddy().arena_stats(0).free_bytes;
        heap.kfree(ptr.as_ptr());
        assert_eq!(
            heap.buddy().arena_stats(0).free_bytes,
            free_before + 2 * PAGE_SIZE as u64
        );
    }

    #[test]
    fn slab_double_free_is_rejected() {
        let arena = TestArena::new(0x30_0000, 4 * MIB);
        let mut heap = heap_over(&arena);

        let ptr = heap.kalloc(100).expect("slab allocation");
        heap.kfree(ptr.as_ptr());
        let stats = heap.slab().cache_stats(100).expect("valid class");
        assert_eq!(stats.allocated_objects, 0);

        // Second free must not corrupt the counters.
        heap.kfree(ptr.as_ptr());
        let stats = heap.slab().cache_stats(100).expect("valid class");
        assert_eq!(stats.allocated_objects, 0);

        // The object is still allocatable afterwards.
        let again = heap.kalloc(100).expect("reallocation");
        assert_eq!(again, ptr);
    }

    #[test]
    fn buddy_double_free_is_rejected() {
        let arena = TestArena::new(0x30_0000, 4 * MIB);
        let mut heap = heap_over(&arena);

        let ptr = heap.kalloc(5000).expect("large allocation");
        heap.kfree(ptr.as_ptr());
        let free_after_first = heap.buddy().arena_stats(0).free_bytes;

        heap.kfree(ptr.as_ptr());
        assert_eq!(heap.buddy().arena_stats(0).free_bytes, free_after_first);
    }

    #[test]
    fn trailer_corruption_suppresses_the_free() {
        let arena = TestArena::new(0x30_0000, 4 * MIB);
        let mut heap = heap_over(&arena);

        let ptr = heap.kalloc(5000).expect("large allocation");
        // SAFETY (test): overwriting the trailer to simulate an overrun.
        unsafe {
            (ptr.as_ptr().add(5000) as *mut u64).write_unaligned(0x4141_4141_4141_4141);
        }

        let free_before = heap.buddy().arena_stats(0).free_bytes;
        heap.kfree(ptr.as_ptr());
        // Leaked, not freed.
        assert_eq!(heap.buddy().arena_stats(0).free_bytes, free_before);
    }

    #[test]
    fn null_and_zero_size_are_handled() {
        let arena = TestArena::new(0x30_0000, MIB);
        let mut heap = heap_over(&arena);

        assert_eq!(
            heap.kalloc(0),
            Err(KernelError::InvalidArgument { name: "size" })
        );
        heap.kfree(core::ptr::null_mut());
    }

    #[test]
    fn boundary_sizes_route_correctly() {
        let arena = TestArena::new(0x30_0000, 4 * MIB);
        let mut heap = heap_over(&arena);

        let at_threshold = heap.kalloc(2048).expect("2048-byte allocation");
        assert!(heap.slab().is_slab_address(at_threshold.as_ptr()));

        let past_threshold = heap.kalloc(2049).expect("2049-byte allocation");
        assert!(!heap.slab().is_slab_address(past_threshold.as_ptr()));

        heap.kfree(at_threshold.as_ptr());
        heap.kfree(past_threshold.as_ptr());
    }

    #[test]
    fn page_helpers_round_trip() {
        let arena = TestArena::new(0x30_0000, MIB);
        let mut heap = heap_over(&arena);

        let page = heap.alloc_page().expect("single frame");
        assert_eq!(page.as_u64() % PAGE_SIZE as u64, 0);
        let free_held = heap.buddy().arena_stats(0).free_bytes;
        heap.free_page(page);
        assert_eq!(
            heap.buddy().arena_stats(0).free_bytes,
            free_held + PAGE_SIZE as u64
        );
    }

    #[test]
    fn shrink_returns_slab_pages() {
        let arena = TestArena::new(0x30_0000, 4 * MIB);
        let mut heap = heap_over(&arena);

        // Create and release enough objects to leave several empty slabs.
        let mut ptrs = alloc::vec::Vec::new();
        for _ in 0..4 * crate::mm::slab::objects_per_slab(512) {
            ptrs.push(heap.kalloc(512).expect("slab object"));
        }
        for p in ptrs {
            heap.kfree(p.as_ptr());
        }
        let before = heap.buddy().arena_stats(0).free_bytes;
        heap.shrink();
        assert_eq!(
            heap.buddy().arena_stats(0).free_bytes,
            before + 2 * SLAB_BYTES as u64
        );
    }
}
