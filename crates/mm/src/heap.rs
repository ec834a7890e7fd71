//! 内核堆
//!
//! 小对象按 16 字节起、逐级翻倍到 1024 字节的 size class 分配：每个 arena
//! 是内核池中的一页，页首是 [`ArenaHeader`]，其后切成等长块。大于 1024
//! 字节的请求直接向内核池要整页，页首同样放一个头部记录页数。
//!
//! 块从“头部之后第一个块长整数倍”的位置开始排列，因此每个块都按自身
//! 大小自然对齐，且每页的块数与紧贴头部排列时相同。
//!
//! arena 全部块空闲后，若该 class 持有的 arena 数已超过 [`CACHED_ARENAS`]，
//! 就把这一页还给内核池；否则留作缓存，避免按页反复申请释放。

use core::mem::size_of;
use core::ptr::NonNull;

use lazy_static::lazy_static;
use sync::SpinLock;

use crate::config::PAGE_SIZE;
use crate::phys_memory::{PHYS_MEMORY, PhysMemory};

const ARENA_MAGIC: u32 = 0x4152_454e;
const LARGE_CLASS: u32 = u32::MAX;
const MIN_BLOCK: usize = 16;
/// 最大的 size class
pub const MAX_BLOCK: usize = 1024;
const CLASS_COUNT: usize = 7;
/// 每个 size class 至少保留的 arena 数
pub const CACHED_ARENAS: usize = 4;

/// arena 页首的头部
#[repr(C)]
struct ArenaHeader {
    magic: u32,
    /// size class 下标，大对象为 [`LARGE_CLASS`]
    class: u32,
    /// 小对象 arena：空闲块数；大对象：页数
    count: u32,
    _reserved: u32,
}

const HEADER_SIZE: usize = size_of::<ArenaHeader>();

struct FreeBlock {
    next: Option<NonNull<FreeBlock>>,
}

/// 穿过空闲块本身的单链表
struct FreeList {
    head: Option<NonNull<FreeBlock>>,
    len: usize,
}

// SAFETY: 链表节点都是本堆独占的空闲块，只在 SpinLock 内访问
unsafe impl Send for FreeList {}

impl FreeList {
    const fn new() -> Self {
        FreeList { head: None, len: 0 }
    }

    fn push(&mut self, block: NonNull<u8>) {
        let node = block.cast::<FreeBlock>();
        // SAFETY: 块至少 16 字节且按块长对齐，足以容纳一个指针
        unsafe { node.as_ptr().write(FreeBlock { next: self.head }) };
        self.head = Some(node);
        self.len += 1;
    }

    fn pop(&mut self) -> Option<NonNull<u8>> {
        let node = self.head?;
        // SAFETY: node 来自 push，仍是空闲块
        self.head = unsafe { node.as_ref().next };
        self.len -= 1;
        Some(node.cast())
    }

    /// 只保留满足 `keep` 的块
    fn retain(&mut self, mut keep: impl FnMut(usize) -> bool) {
        let mut link: *mut Option<NonNull<FreeBlock>> = &mut self.head;
        // SAFETY: 遍历的都是链表中的空闲块
        unsafe {
            while let Some(node) = *link {
                if keep(node.as_ptr() as usize) {
                    link = &mut (*node.as_ptr()).next;
                } else {
                    *link = node.as_ref().next;
                    self.len -= 1;
                }
            }
        }
    }
}

struct SizeClass {
    block_size: usize,
    first_offset: usize,
    blocks_per_arena: usize,
    free: FreeList,
    /// 当前持有的 arena 数
    arenas: usize,
}

impl SizeClass {
    const fn new(block_size: usize) -> Self {
        let first_offset = HEADER_SIZE.div_ceil(block_size) * block_size;
        SizeClass {
            block_size,
            first_offset,
            blocks_per_arena: (PAGE_SIZE - first_offset) / block_size,
            free: FreeList::new(),
            arenas: 0,
        }
    }
}

fn arena_of(addr: usize) -> *mut ArenaHeader {
    (addr & !(PAGE_SIZE - 1)) as *mut ArenaHeader
}

fn class_index(size: usize) -> usize {
    let block = size.max(MIN_BLOCK).next_power_of_two();
    (block.trailing_zeros() - MIN_BLOCK.trailing_zeros()) as usize
}

/// 内核堆
pub struct KernelHeap<'m> {
    pages: &'m PhysMemory,
    classes: SpinLock<[SizeClass; CLASS_COUNT]>,
}

impl<'m> KernelHeap<'m> {
    /// 在 `pages` 的内核池之上建立堆
    pub const fn new(pages: &'m PhysMemory) -> Self {
        KernelHeap {
            pages,
            classes: SpinLock::new([
                SizeClass::new(16),
                SizeClass::new(32),
                SizeClass::new(64),
                SizeClass::new(128),
                SizeClass::new(256),
                SizeClass::new(512),
                SizeClass::new(1024),
            ]),
        }
    }

    /// 分配至少 `size` 字节。
    ///
    /// # Panics
    /// 内核池耗尽时 panic。
    pub fn allocate(&self, size: usize) -> NonNull<u8> {
        if size > MAX_BLOCK {
            return self.allocate_large(size);
        }

        let idx = class_index(size);
        let mut classes = self.classes.lock();
        let class = &mut classes[idx];
        if class.free.len == 0 {
            let page = self.pages.alloc_kernel_pages(1);
            // SAFETY: 新分配的整页归本 arena 独占
            unsafe {
                arena_of(page).write(ArenaHeader {
                    magic: ARENA_MAGIC,
                    class: idx as u32,
                    count: class.blocks_per_arena as u32,
                    _reserved: 0,
                });
            }
            for i in (0..class.blocks_per_arena).rev() {
                let block = page + class.first_offset + i * class.block_size;
                // SAFETY: block 落在刚分配的页内，非空
                class.free.push(unsafe { NonNull::new_unchecked(block as *mut u8) });
            }
            class.arenas += 1;
        }

        let block = class
            .free
            .pop()
            .unwrap_or_else(|| panic!("heap: size class {} has no free block", class.block_size));
        // SAFETY: 块属于某个有效 arena，头部在页首
        let arena = unsafe { &mut *arena_of(block.as_ptr() as usize) };
        assert_eq!(arena.magic, ARENA_MAGIC, "heap: corrupted arena on allocate");
        arena.count -= 1;
        block
    }

    fn allocate_large(&self, size: usize) -> NonNull<u8> {
        let pages = (size + HEADER_SIZE).div_ceil(PAGE_SIZE);
        let base = self.pages.alloc_kernel_pages(pages);
        // SAFETY: 新分配的页归本次分配独占
        unsafe {
            arena_of(base).write(ArenaHeader {
                magic: ARENA_MAGIC,
                class: LARGE_CLASS,
                count: pages as u32,
                _reserved: 0,
            });
            NonNull::new_unchecked((base + HEADER_SIZE) as *mut u8)
        }
    }

    /// 释放 [`KernelHeap::allocate`] 返回的指针。
    ///
    /// # Safety
    /// `ptr` 必须来自本堆，且尚未释放。
    ///
    /// # Panics
    /// arena 头部的 magic 不匹配，或检测到重复释放时 panic。
    pub unsafe fn free(&self, ptr: NonNull<u8>) {
        let addr = ptr.as_ptr() as usize;
        let header = arena_of(addr);
        // SAFETY: 调用者保证 ptr 来自本堆，页首就是头部
        let arena = unsafe { &mut *header };
        if arena.magic != ARENA_MAGIC {
            log::error!("heap: bad magic {:#x} in arena {:#x}", arena.magic, header as usize);
            panic!("heap corruption: bad arena magic at {:#x}", addr);
        }

        if arena.class == LARGE_CLASS {
            let pages = arena.count as usize;
            arena.magic = 0;
            self.pages.free_kernel_pages(header as usize, pages);
            return;
        }

        let mut classes = self.classes.lock();
        let class = &mut classes[arena.class as usize];
        let offset = addr - header as usize;
        assert!(
            offset >= class.first_offset && (offset - class.first_offset) % class.block_size == 0,
            "heap: {:#x} is not a block boundary",
            addr
        );
        class.free.push(ptr);
        arena.count += 1;
        assert!(
            arena.count as usize <= class.blocks_per_arena,
            "heap: double free of {:#x}",
            addr
        );

        if arena.count as usize == class.blocks_per_arena && class.arenas > CACHED_ARENAS {
            let page = header as usize;
            class.free.retain(|block| block & !(PAGE_SIZE - 1) != page);
            class.arenas -= 1;
            arena.magic = 0;
            self.pages.free_kernel_pages(page, 1);
        }
    }

    /// 服务 `size` 的 size class 当前的空闲块数
    pub fn free_blocks(&self, size: usize) -> usize {
        self.classes.lock()[class_index(size)].free.len
    }

    /// 服务 `size` 的 size class 当前持有的 arena 数
    pub fn arenas(&self, size: usize) -> usize {
        self.classes.lock()[class_index(size)].arenas
    }

    /// 服务 `size` 的 size class 每个 arena 的块数
    pub fn blocks_per_arena(&self, size: usize) -> usize {
        self.classes.lock()[class_index(size)].blocks_per_arena
    }
}

lazy_static! {
    /// 全局内核堆
    pub static ref KERNEL_HEAP: KernelHeap<'static> = KernelHeap::new(&PHYS_MEMORY);
}

/// 从全局内核堆分配
pub fn kmalloc(size: usize) -> *mut u8 {
    KERNEL_HEAP.allocate(size).as_ptr()
}

/// 释放 [`kmalloc`] 得到的内存，空指针被忽略。
///
/// # Safety
/// `ptr` 必须来自 [`kmalloc`] 且尚未释放。
pub unsafe fn kfree(ptr: *mut u8) {
    if let Some(ptr) = NonNull::new(ptr) {
        // SAFETY: 由调用者保证
        unsafe { KERNEL_HEAP.free(ptr) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_env;

    fn heap(kernel_pages: usize) -> KernelHeap<'static> {
        KernelHeap::new(test_env::phys_memory(kernel_pages, 8))
    }

    #[test]
    fn test_size_class_selection_and_alignment() {
        let heap = heap(16);
        for (size, block) in [(1, 16), (16, 16), (17, 32), (100, 128), (513, 1024), (1024, 1024)] {
            let p = heap.allocate(size);
            assert_eq!(p.as_ptr() as usize % block, 0, "size {} not aligned to {}", size, block);
            assert_eq!(heap.blocks_per_arena(size), (PAGE_SIZE - block.max(HEADER_SIZE)) / block);
            unsafe { heap.free(p) };
        }
        assert_eq!(heap.blocks_per_arena(16), 255);
        assert_eq!(heap.blocks_per_arena(1024), 3);
    }

    #[test]
    fn test_round_trip_restores_free_list_length() {
        let heap = heap(64);
        for size in (1..=4096).step_by(37).chain([1024, 1025, 4096]) {
            // 预热：让该 class 先持有一个 arena
            let warm = heap.allocate(size);
            unsafe { heap.free(warm) };

            let blocks_before = heap.free_blocks(size.min(MAX_BLOCK));
            let pool_before = heap.pages.free_kernel_pages_count();
            let p = heap.allocate(size);
            unsafe { p.as_ptr().write_bytes(0xa5, size) };
            unsafe { heap.free(p) };
            assert_eq!(heap.pages.free_kernel_pages_count(), pool_before, "size {}", size);
            if size <= MAX_BLOCK {
                assert_eq!(heap.free_blocks(size), blocks_before, "size {}", size);
            }
        }
    }

    #[test]
    fn test_large_allocation_uses_whole_pages() {
        let heap = heap(16);
        let pool_before = heap.pages.free_kernel_pages_count();

        let p = heap.allocate(2000);
        let backing = p.as_ptr() as usize - HEADER_SIZE;
        assert_eq!(backing % PAGE_SIZE, 0);
        let header = unsafe { &*arena_of(backing) };
        assert_eq!(header.magic, ARENA_MAGIC);
        assert_eq!(header.class, LARGE_CLASS);
        assert_eq!(header.count, 1);
        assert_eq!(heap.pages.free_kernel_pages_count(), pool_before - 1);

        let q = heap.allocate(PAGE_SIZE);
        assert_eq!(heap.pages.free_kernel_pages_count(), pool_before - 3);

        unsafe { heap.free(p) };
        assert_eq!(heap.pages.free_kernel_pages_count(), pool_before - 2);
        unsafe { heap.free(q) };
        assert_eq!(heap.pages.free_kernel_pages_count(), pool_before);
    }

    #[test]
    fn test_empty_arenas_beyond_cache_are_returned() {
        let heap = heap(16);
        let pool_before = heap.pages.free_kernel_pages_count();
        let per_arena = heap.blocks_per_arena(1024);
        let blocks: alloc::vec::Vec<_> =
            (0..per_arena * 6).map(|_| heap.allocate(1024)).collect();
        assert_eq!(heap.arenas(1024), 6);
        assert_eq!(heap.pages.free_kernel_pages_count(), pool_before - 6);

        for b in blocks {
            unsafe { heap.free(b) };
        }
        assert_eq!(heap.arenas(1024), CACHED_ARENAS);
        assert_eq!(heap.free_blocks(1024), CACHED_ARENAS * per_arena);
        assert_eq!(heap.pages.free_kernel_pages_count(), pool_before - CACHED_ARENAS);
    }

    #[test]
    #[should_panic(expected = "heap corruption")]
    fn test_corrupted_tag_is_fatal() {
        let heap = heap(4);
        let p = heap.allocate(64);
        unsafe {
            (*arena_of(p.as_ptr() as usize)).magic = 0x1234_5678;
            heap.free(p);
        }
    }

    #[test]
    #[should_panic(expected = "double free")]
    fn test_double_free_is_fatal() {
        let heap = heap(4);
        let p = heap.allocate(1024);
        unsafe {
            heap.free(p);
            heap.free(p);
        }
    }
}
