//! 内存管理相关操作的 Mock 实现
//!
//! 物理内存用一块按页对齐、初始为零的宿主机内存模拟：物理地址就是它在这块
//! 内存中的偏移，内核直接映射区的虚拟地址就是宿主机指针。每个测试通过
//! [`MockMmOps::carve`] 切出互不重叠的一段“物理内存”，因此可以并行运行。

use std::alloc::{alloc_zeroed, Layout};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::OnceLock;

/// 模拟物理内存的总大小
pub const PHYS_ARENA_SIZE: usize = 256 << 20;
/// 第一段可切出的物理地址（保留低 1 MiB，让物理地址 0 永远无效）
pub const PHYS_ARENA_BASE: usize = 0x10_0000;

const PAGE_SIZE: usize = 4096;

struct PhysArena {
    host_base: usize,
    next: AtomicUsize,
}

fn arena() -> &'static PhysArena {
    static ARENA: OnceLock<PhysArena> = OnceLock::new();
    ARENA.get_or_init(|| {
        let layout = Layout::from_size_align(PHYS_ARENA_SIZE, PAGE_SIZE).unwrap();
        // SAFETY: layout 非零大小；这块内存在整个测试进程内永不释放
        let ptr = unsafe { alloc_zeroed(layout) };
        assert!(!ptr.is_null(), "failed to reserve the mock physical arena");
        PhysArena {
            host_base: ptr as usize,
            next: AtomicUsize::new(PHYS_ARENA_BASE),
        }
    })
}

/// Mock 的内存管理架构操作
pub struct MockMmOps {
    active_root: AtomicUsize,
    tlb_flushes: AtomicUsize,
}

impl MockMmOps {
    pub const fn new() -> Self {
        Self {
            active_root: AtomicUsize::new(0),
            tlb_flushes: AtomicUsize::new(0),
        }
    }

    /// 物理地址 → 内核虚拟地址（宿主机指针）
    pub fn paddr_to_vaddr(&self, paddr: usize) -> usize {
        debug_assert!(paddr < PHYS_ARENA_SIZE, "paddr {:#x} outside mock memory", paddr);
        arena().host_base + paddr
    }

    /// 内核虚拟地址 → 物理地址
    pub fn vaddr_to_paddr(&self, vaddr: usize) -> usize {
        let base = arena().host_base;
        debug_assert!(vaddr >= base && vaddr < base + PHYS_ARENA_SIZE);
        vaddr - base
    }

    pub fn flush_tlb(&self, _vaddr: usize) {
        self.tlb_flushes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn activate(&self, root_paddr: usize) {
        self.active_root.store(root_paddr, Ordering::Release);
    }

    /// 最近一次激活的页目录物理地址
    pub fn active_root(&self) -> usize {
        self.active_root.load(Ordering::Acquire)
    }

    /// 累计 TLB 刷新次数
    pub fn tlb_flushes(&self) -> usize {
        self.tlb_flushes.load(Ordering::Relaxed)
    }

    /// 切出一段新的物理内存，返回 (起始物理地址, 字节数)
    ///
    /// 内容保证为零。
    pub fn carve(&self, pages: usize) -> (usize, usize) {
        let size = pages * PAGE_SIZE;
        let start = arena().next.fetch_add(size, Ordering::Relaxed);
        assert!(
            start + size <= PHYS_ARENA_SIZE,
            "mock physical arena exhausted"
        );
        (start, size)
    }
}

impl Default for MockMmOps {
    fn default() -> Self {
        Self::new()
    }
}

/// 全局 Mock 实例
pub static MOCK_MM_OPS: MockMmOps = MockMmOps::new();
