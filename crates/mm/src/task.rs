//! 任务的内存描述

use crate::address::{Vpn, is_page_aligned};
use crate::address_space::AddressSpace;
use crate::config::{USER_EXEC_ADDR, USER_MMAP_ADDR, USER_MMAP_PAGES};
use crate::range_allocator::RangeAllocator;

/// 一个任务拥有的内存状态：地址空间、mmap 位图和程序断点
pub struct TaskMm<'m> {
    pub(crate) space: AddressSpace<'m>,
    pub(crate) vmap: RangeAllocator,
    /// 程序映像的末尾，brk 不能低于它
    pub(crate) end: usize,
    pub(crate) brk: usize,
    privileged: bool,
}

impl<'m> TaskMm<'m> {
    /// 为新任务建立内存状态；程序映像占据 `[USER_EXEC_ADDR, image_end)`。
    ///
    /// `privileged` 为真表示内核任务，它在用户区域之外的缺页是内核错误。
    pub fn new(kernel: &AddressSpace<'m>, image_end: usize, privileged: bool) -> Self {
        assert!(
            is_page_aligned(image_end) && (USER_EXEC_ADDR..=USER_MMAP_ADDR).contains(&image_end),
            "bad program image end {:#x}",
            image_end
        );
        TaskMm {
            space: AddressSpace::new_user(kernel),
            vmap: RangeAllocator::new(Vpn::floor(USER_MMAP_ADDR), USER_MMAP_PAGES),
            end: image_end,
            brk: image_end,
            privileged,
        }
    }

    /// fork：子任务得到写时复制的地址空间和相同的 mmap 位图、断点
    pub fn fork(&mut self) -> TaskMm<'m> {
        TaskMm {
            space: self.space.duplicate(),
            vmap: self.vmap.clone(),
            end: self.end,
            brk: self.brk,
            privileged: self.privileged,
        }
    }

    /// 地址空间
    pub fn space(&self) -> &AddressSpace<'m> {
        &self.space
    }

    /// 可变地址空间
    pub fn space_mut(&mut self) -> &mut AddressSpace<'m> {
        &mut self.space
    }

    /// 当前程序断点
    pub fn current_brk(&self) -> usize {
        self.brk
    }

    /// 程序映像末尾
    pub fn image_end(&self) -> usize {
        self.end
    }

    /// 是否是内核任务
    pub fn is_privileged(&self) -> bool {
        self.privileged
    }

    /// mmap 区域剩余的空闲页数
    pub fn free_mmap_pages(&self) -> usize {
        self.vmap.free_pages()
    }
}
