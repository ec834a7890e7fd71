//! 对一张页表（或页目录）所在帧的原始访问

use crate::address::Ppn;
use crate::arch_ops::arch_ops;
use crate::config::PAGE_TABLE_ENTRIES;

use super::entry::Pte;

/// 位于某个物理帧中的 1024 项表
///
/// 只保存指针，按项读写，不产生长期存在的引用；同一帧可能同时被
/// 多个地址空间共享（fork 之后、写时复制之前）。
#[derive(Clone, Copy)]
pub(crate) struct PageTable {
    ppn: Ppn,
    base: *mut Pte,
}

impl PageTable {
    pub(crate) fn at(ppn: Ppn) -> Self {
        let base = arch_ops().paddr_to_vaddr(ppn.start_addr()) as *mut Pte;
        PageTable { ppn, base }
    }

    pub(crate) fn ppn(&self) -> Ppn {
        self.ppn
    }

    pub(crate) fn get(&self, idx: usize) -> Pte {
        assert!(idx < PAGE_TABLE_ENTRIES);
        // SAFETY: 表帧位于直接映射区，idx 在范围内
        unsafe { self.base.add(idx).read() }
    }

    pub(crate) fn set(&self, idx: usize, pte: Pte) {
        assert!(idx < PAGE_TABLE_ENTRIES);
        // SAFETY: 同 get
        unsafe { self.base.add(idx).write(pte) }
    }

    /// 下标和表项，只列出存在的项
    pub(crate) fn present(&self) -> impl Iterator<Item = (usize, Pte)> + '_ {
        (0..PAGE_TABLE_ENTRIES)
            .map(|idx| (idx, self.get(idx)))
            .filter(|(_, pte)| pte.is_present())
    }
}
