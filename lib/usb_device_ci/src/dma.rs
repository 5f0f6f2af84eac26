use crate::error::{Error, Result};
use core::{
    alloc::Layout,
    ptr::{self, NonNull},
    sync::atomic::{AtomicU32, Ordering},
};
use linked_list_allocator::Heap;
use log::warn;
use spinning_top::Spinlock;
use std::collections::BTreeMap;

/// A physically-contiguous region of memory that the controller can access, addressed by the
/// 32-bit physical addresses that the controller's descriptors hold.
///
/// The controller reads and writes this memory behind our back, so nothing handed out by the
/// pool is ever cached: every word access is performed through an atomic, and each access goes
/// back to memory.
pub struct DmaPool {
    virt_base: usize,
    phys_base: u32,
    size: usize,
    allocator: Spinlock<Allocator>,
    backing: Option<Layout>,
}

struct Allocator {
    heap: Heap,
    live: BTreeMap<u32, Layout>,
}

// The heap only holds pointers into the pool's region, which the pool owns for its lifetime.
unsafe impl Send for Allocator {}

impl DmaPool {
    /// ### Safety
    /// `virt_base..virt_base+size` must be mapped, uncached, owned by the pool for its lifetime,
    /// and map to physical memory starting at `phys_base`. The two must be congruent modulo the
    /// page size, so alignment in one address space is alignment in the other.
    pub unsafe fn new(virt_base: *mut u8, phys_base: u32, size: usize) -> DmaPool {
        assert_eq!((virt_base as usize) % 0x1000, phys_base as usize % 0x1000);
        assert!(phys_base as usize + size <= u32::MAX as usize + 1);

        DmaPool {
            virt_base: virt_base as usize,
            phys_base,
            size,
            allocator: Spinlock::new(Allocator {
                heap: unsafe { Heap::new(virt_base, size) },
                live: BTreeMap::new(),
            }),
            backing: None,
        }
    }

    /// Create a pool backed by ordinary heap memory, pretending it lives at `phys_base`. Only
    /// useful alongside a simulated controller.
    #[cfg(any(test, feature = "sim"))]
    pub fn host(size: usize, phys_base: u32) -> DmaPool {
        let layout = Layout::from_size_align(size, 0x1000).expect("Invalid DMA pool size");
        let memory = unsafe { std::alloc::alloc_zeroed(layout) };
        if memory.is_null() {
            std::alloc::handle_alloc_error(layout);
        }

        let mut pool = unsafe { DmaPool::new(memory, phys_base, size) };
        pool.backing = Some(layout);
        pool
    }

    /// Allocate `size` zeroed bytes, aligned to `align`, and return their physical address.
    pub fn alloc(&self, size: usize, align: usize) -> Result<u32> {
        let layout = Layout::from_size_align(size.max(1), align).map_err(|_| Error::OutOfDmaMemory { size, align })?;

        let mut allocator = self.allocator.lock();
        let ptr = allocator.heap.allocate_first_fit(layout).map_err(|_| Error::OutOfDmaMemory { size, align })?;
        unsafe {
            ptr::write_bytes(ptr.as_ptr(), 0, layout.size());
        }

        let phys = self.virt_to_phys(ptr.as_ptr() as usize);
        allocator.live.insert(phys, layout);
        Ok(phys)
    }

    pub fn free(&self, phys: u32) {
        let mut allocator = self.allocator.lock();
        match allocator.live.remove(&phys) {
            Some(layout) => unsafe {
                let ptr = NonNull::new_unchecked(self.phys_to_virt(phys, layout.size()));
                allocator.heap.deallocate(ptr, layout);
            },
            None => warn!("Tried to free DMA address {:#x}, which is not allocated", phys),
        }
    }

    /// The number of allocations currently live.
    pub fn live_allocations(&self) -> usize {
        self.allocator.lock().live.len()
    }

    pub fn read_u32(&self, phys: u32) -> u32 {
        u32::from_le(self.word(phys).load(Ordering::Acquire))
    }

    pub fn write_u32(&self, phys: u32, value: u32) {
        self.word(phys).store(value.to_le(), Ordering::Release);
    }

    pub fn read_words(&self, phys: u32, words: &mut [u32]) {
        for (i, word) in words.iter_mut().enumerate() {
            *word = self.read_u32(phys + 4 * i as u32);
        }
    }

    pub fn write_words(&self, phys: u32, words: &[u32]) {
        for (i, word) in words.iter().enumerate() {
            self.write_u32(phys + 4 * i as u32, *word);
        }
    }

    /// Copy bulk data out of the pool. Only for buffers the caller currently owns (i.e. not while
    /// the controller may be writing to them).
    pub fn read_bytes(&self, phys: u32, buffer: &mut [u8]) {
        let src = self.phys_to_virt(phys, buffer.len());
        unsafe {
            ptr::copy_nonoverlapping(src, buffer.as_mut_ptr(), buffer.len());
        }
    }

    pub fn write_bytes(&self, phys: u32, data: &[u8]) {
        let dst = self.phys_to_virt(phys, data.len());
        unsafe {
            ptr::copy_nonoverlapping(data.as_ptr(), dst, data.len());
        }
    }

    fn word(&self, phys: u32) -> &AtomicU32 {
        assert!(phys % 4 == 0, "Unaligned DMA word access at {:#x}", phys);
        unsafe { AtomicU32::from_ptr(self.phys_to_virt(phys, 4) as *mut u32) }
    }

    fn phys_to_virt(&self, phys: u32, length: usize) -> *mut u8 {
        let offset = phys.wrapping_sub(self.phys_base) as usize;
        assert!(
            phys >= self.phys_base && offset + length <= self.size,
            "DMA access at {:#x}+{:#x} is outside the pool",
            phys,
            length
        );
        (self.virt_base + offset) as *mut u8
    }

    fn virt_to_phys(&self, virt: usize) -> u32 {
        self.phys_base + (virt - self.virt_base) as u32
    }
}

impl Drop for DmaPool {
    fn drop(&mut self) {
        if let Some(layout) = self.backing {
            unsafe { std::alloc::dealloc(self.virt_base as *mut u8, layout) }
        }
    }
}
