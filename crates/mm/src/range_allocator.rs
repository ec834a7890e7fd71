//! 虚拟范围分配器
//!
//! 一位对应一页，置位表示已占用。用于内核直接映射池，以及每个任务自己的
//! mmap 区域。分配为首次适配：线性扫描第一段足够长的连续空闲位。

use alloc::vec;
use alloc::vec::Vec;

use crate::address::Vpn;

/// 位图范围分配器
#[derive(Debug, Clone)]
pub struct RangeAllocator {
    /// 第 0 位对应的页号
    base: Vpn,
    /// 管理的页数
    pages: usize,
    bitmap: Vec<u64>,
    used: usize,
}

impl RangeAllocator {
    /// 管理从 `base` 开始的 `pages` 页，初始全部空闲。
    pub fn new(base: Vpn, pages: usize) -> Self {
        RangeAllocator {
            base,
            pages,
            bitmap: vec![0; pages.div_ceil(64)],
            used: 0,
        }
    }

    /// 空的分配器（不管理任何页）
    pub const fn empty() -> Self {
        RangeAllocator {
            base: Vpn(0),
            pages: 0,
            bitmap: Vec::new(),
            used: 0,
        }
    }

    #[inline]
    fn test(&self, bit: usize) -> bool {
        self.bitmap[bit / 64] & (1u64 << (bit % 64)) != 0
    }

    #[inline]
    fn set(&mut self, bit: usize, value: bool) {
        if value {
            self.bitmap[bit / 64] |= 1u64 << (bit % 64);
        } else {
            self.bitmap[bit / 64] &= !(1u64 << (bit % 64));
        }
    }

    fn bit_of(&self, vpn: Vpn, count: usize) -> Option<usize> {
        let bit = vpn.0.checked_sub(self.base.0)?;
        (bit.checked_add(count)? <= self.pages).then_some(bit)
    }

    /// 查找并占用 `count` 个连续空闲页，找不到返回 None。
    pub fn try_reserve(&mut self, count: usize) -> Option<Vpn> {
        if count == 0 || count > self.pages - self.used {
            return None;
        }
        let mut run = 0;
        let mut bit = 0;
        while bit < self.pages {
            let word = self.bitmap[bit / 64];
            if bit % 64 == 0 && word == u64::MAX {
                // 整个字都被占用
                run = 0;
                bit += 64;
                continue;
            }
            if self.test(bit) {
                run = 0;
            } else {
                run += 1;
                if run == count {
                    let first = bit + 1 - count;
                    for b in first..=bit {
                        self.set(b, true);
                    }
                    self.used += count;
                    return Some(self.base + first);
                }
            }
            bit += 1;
        }
        None
    }

    /// 占用 `count` 个连续空闲页。
    ///
    /// # Panics
    /// 找不到足够长的空闲段时 panic。
    pub fn reserve(&mut self, count: usize) -> Vpn {
        match self.try_reserve(count) {
            Some(vpn) => vpn,
            None => {
                log::error!(
                    "range allocator at {}: no run of {} free pages ({} of {} used)",
                    self.base,
                    count,
                    self.used,
                    self.pages
                );
                panic!("Scan page fail!!!");
            }
        }
    }

    /// 占用指定位置的页，已被占用的页保持不变。范围越界时返回 false。
    pub fn reserve_at(&mut self, vpn: Vpn, count: usize) -> bool {
        let Some(first) = self.bit_of(vpn, count) else {
            return false;
        };
        for b in first..first + count {
            if !self.test(b) {
                self.set(b, true);
                self.used += 1;
            }
        }
        true
    }

    /// 释放之前占用的页。
    ///
    /// # Panics
    /// 范围越界或其中有未占用的页时 panic。
    pub fn release(&mut self, vpn: Vpn, count: usize) {
        let first = self
            .bit_of(vpn, count)
            .unwrap_or_else(|| panic!("release of {}+{} outside range", vpn, count));
        for b in first..first + count {
            assert!(self.test(b), "releasing unreserved page {}", self.base + b);
            self.set(b, false);
        }
        self.used -= count;
    }

    /// 范围内的页是否全部已被占用
    pub fn is_reserved(&self, vpn: Vpn, count: usize) -> bool {
        self.bit_of(vpn, count)
            .is_some_and(|first| (first..first + count).all(|b| self.test(b)))
    }

    /// 空闲页数
    pub fn free_pages(&self) -> usize {
        self.pages - self.used
    }

    /// 管理的第一页
    pub fn base(&self) -> Vpn {
        self.base
    }
}
