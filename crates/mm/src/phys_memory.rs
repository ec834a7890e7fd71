//! 物理内存
//!
//! [`PhysMemory`] 把引导阶段得到的可用区域一分为二：
//!
//! - 前 `kernel_pages` 页是内核直接映射池，按页用位图管理，供内核堆和
//!   缓冲区缓存取用（[`PhysMemory::alloc_kernel_pages`]）；
//! - 其余页进入引用计数帧表，供页表和用户页使用（[`PhysMemory::alloc_frame`]）。
//!
//! 两部分各自由一把 [`SpinLock`] 保护。

use lazy_static::lazy_static;
use sync::SpinLock;

use crate::address::{Ppn, Vpn};
use crate::arch_ops::arch_ops;
use crate::boot_info::{BootInfoError, MemoryRegion, parse_memory_region};
use crate::config::{KERNEL_MEMORY_SIZE, PAGE_SIZE};
use crate::frame_allocator::FrameAllocator;
use crate::range_allocator::RangeAllocator;

/// 物理内存管理器
pub struct PhysMemory {
    frames: SpinLock<FrameAllocator>,
    /// 内核池位图，以物理页号为下标
    kernel_pool: SpinLock<RangeAllocator>,
}

impl PhysMemory {
    /// 创建未初始化的物理内存管理器
    pub const fn new() -> Self {
        PhysMemory {
            frames: SpinLock::new(FrameAllocator::new()),
            kernel_pool: SpinLock::new(RangeAllocator::empty()),
        }
    }

    /// 接管 `region`，前 `kernel_pages` 页作为内核池。
    pub fn init(&self, region: MemoryRegion, kernel_pages: usize) {
        let first = Ppn::floor(region.base);
        let end = Ppn::floor(region.end());
        assert!(
            first + kernel_pages <= end,
            "kernel pool of {} pages does not fit in {:?}",
            kernel_pages,
            region
        );
        *self.kernel_pool.lock() = RangeAllocator::new(Vpn(first.0), kernel_pages);
        self.frames.lock().init(first + kernel_pages, end);
        log::info!(
            "physical memory {:#x}..{:#x}: {} kernel pages, {} frames",
            region.base,
            region.end(),
            kernel_pages,
            end - (first + kernel_pages)
        );
    }

    /// 分配一帧（引用计数为 1），内容未定义。
    ///
    /// # Panics
    /// 物理内存耗尽时 panic。
    pub fn alloc_frame(&self) -> Ppn {
        self.frames.lock().alloc()
    }

    /// 分配一帧并清零
    pub fn alloc_zeroed_frame(&self) -> Ppn {
        let ppn = self.alloc_frame();
        zero_frame(ppn);
        ppn
    }

    /// 释放一次引用，返回剩余引用数
    pub fn free_frame(&self, ppn: Ppn) -> u8 {
        self.frames.lock().release(ppn)
    }

    /// 增加一次引用，返回新的引用数
    pub fn retain_frame(&self, ppn: Ppn) -> u8 {
        self.frames.lock().retain(ppn)
    }

    /// 帧的引用数
    pub fn frame_refs(&self, ppn: Ppn) -> u8 {
        self.frames.lock().refs(ppn)
    }

    /// 帧是否由帧表管理（设备内存、内核池页不是）
    pub fn manages_frame(&self, ppn: Ppn) -> bool {
        self.frames.lock().manages(ppn)
    }

    /// 空闲帧数
    pub fn free_frames(&self) -> usize {
        self.frames.lock().free_frames()
    }

    /// 帧表管理的总帧数
    pub fn total_frames(&self) -> usize {
        self.frames.lock().total_frames()
    }

    /// 从内核池分配 `count` 个连续页，返回其内核虚拟地址。
    ///
    /// # Panics
    /// 内核池没有足够长的连续空闲段时 panic。
    pub fn alloc_kernel_pages(&self, count: usize) -> usize {
        let first = self.kernel_pool.lock().reserve(count);
        let vaddr = arch_ops().paddr_to_vaddr(first.start_addr());
        log::debug!("alloc kernel pages {:#x} count {}", vaddr, count);
        vaddr
    }

    /// 归还 [`PhysMemory::alloc_kernel_pages`] 得到的页
    pub fn free_kernel_pages(&self, vaddr: usize, count: usize) {
        assert!(vaddr % PAGE_SIZE == 0, "kernel page {:#x} not aligned", vaddr);
        let paddr = arch_ops().vaddr_to_paddr(vaddr);
        self.kernel_pool.lock().release(Vpn::floor(paddr), count);
        log::debug!("free kernel pages {:#x} count {}", vaddr, count);
    }

    /// 内核池空闲页数
    pub fn free_kernel_pages_count(&self) -> usize {
        self.kernel_pool.lock().free_pages()
    }
}

impl Default for PhysMemory {
    fn default() -> Self {
        Self::new()
    }
}

/// 清零一帧
pub(crate) fn zero_frame(ppn: Ppn) {
    let va = arch_ops().paddr_to_vaddr(ppn.start_addr());
    // SAFETY: 帧位于直接映射区，且调用者持有它的引用
    unsafe { core::ptr::write_bytes(va as *mut u8, 0, PAGE_SIZE) };
}

/// 复制整帧内容
pub(crate) fn copy_frame(dst: Ppn, src: Ppn) {
    let ops = arch_ops();
    let d = ops.paddr_to_vaddr(dst.start_addr()) as *mut u8;
    let s = ops.paddr_to_vaddr(src.start_addr()) as *const u8;
    // SAFETY: 两帧都在直接映射区且互不重叠
    unsafe { core::ptr::copy_nonoverlapping(s, d, PAGE_SIZE) };
}

lazy_static! {
    /// 全局物理内存
    pub static ref PHYS_MEMORY: PhysMemory = PhysMemory::new();
}

/// 根据引导信息初始化全局物理内存。
///
/// 从可用区域起点到 [`KERNEL_MEMORY_SIZE`] 之间的页成为内核池。
///
/// # Panics
/// 引导信息无法解析，或可用内存不足以容纳内核区域时 panic。
pub fn init(magic: u32, info: &[u8]) -> MemoryRegion {
    let region = match parse_memory_region(magic, info) {
        Ok(region) => region,
        Err(err) => {
            log::error!("memory inventory rejected: {:?}", err);
            panic!("Memory init failed: {:?}", err);
        }
    };
    if region.base > KERNEL_MEMORY_SIZE || region.end() <= KERNEL_MEMORY_SIZE {
        log::error!("usable memory {:?} cannot hold the kernel region", region);
        panic!("Memory init failed: {:?}", BootInfoError::TooSmall(region));
    }
    let kernel_pages = (KERNEL_MEMORY_SIZE - region.base) / PAGE_SIZE;
    PHYS_MEMORY.init(region, kernel_pages);
    region
}

/// 分配一帧
pub fn alloc_frame() -> Ppn {
    PHYS_MEMORY.alloc_frame()
}

/// 释放一帧的一次引用
pub fn free_frame(ppn: Ppn) {
    PHYS_MEMORY.free_frame(ppn);
}

/// 从内核池分配连续页
pub fn alloc_kernel_pages(count: usize) -> usize {
    PHYS_MEMORY.alloc_kernel_pages(count)
}

/// 归还内核池页
pub fn free_kernel_pages(vaddr: usize, count: usize) {
    PHYS_MEMORY.free_kernel_pages(vaddr, count)
}
