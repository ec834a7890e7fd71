//! 帧分配器
//!
//! 每个物理帧一个 `u8` 引用计数：0 表示空闲，1 表示独占，大于 1 表示被多个
//! 地址空间以写时复制的方式共享。
//!
//! ## 分配策略
//!
//! 从第一个可分配帧开始线性扫描，取第一个计数为 0 的帧。物理内存耗尽
//! 视为不可恢复，直接 panic。
//!
//! 本结构不带锁；全局实例放在 [`PhysMemory`](crate::PhysMemory) 的
//! `SpinLock` 中，修改期间天然处于关中断状态。

use alloc::vec;
use alloc::vec::Vec;

use crate::address::Ppn;

/// 引用计数上限
const MAX_REFS: u8 = u8::MAX;

/// 引用计数帧表
#[derive(Debug)]
pub struct FrameAllocator {
    /// 第一个受管理的帧
    start: Ppn,
    /// 每帧的引用计数
    refs: Vec<u8>,
    /// 计数为 0 的帧数
    free: usize,
}

impl FrameAllocator {
    /// 创建一个空的帧表，需要调用 [`FrameAllocator::init`] 后才能使用。
    pub const fn new() -> Self {
        FrameAllocator {
            start: Ppn(0),
            refs: Vec::new(),
            free: 0,
        }
    }

    /// 接管 `[start, end)` 范围内的帧，全部置为空闲。
    pub fn init(&mut self, start: Ppn, end: Ppn) {
        assert!(start <= end, "frame range {}..{} is inverted", start, end);
        let total = end - start;
        self.start = start;
        self.refs = vec![0; total];
        self.free = total;
    }

    fn index(&self, ppn: Ppn) -> usize {
        assert!(
            ppn >= self.start && ppn.0 < self.start.0 + self.refs.len(),
            "{} is not a managed frame",
            ppn
        );
        ppn - self.start
    }

    /// 分配一帧，引用计数置 1。
    ///
    /// # Panics
    /// 没有空闲帧时 panic。
    pub fn alloc(&mut self) -> Ppn {
        match self.refs.iter().position(|&r| r == 0) {
            Some(idx) => {
                self.refs[idx] = 1;
                self.free -= 1;
                self.start + idx
            }
            None => {
                log::error!("frame allocator: {} frames, none free", self.refs.len());
                panic!("Out of Memory!!!");
            }
        }
    }

    /// 释放一次引用；计数归零时帧重新可分配。返回剩余引用数。
    pub fn release(&mut self, ppn: Ppn) -> u8 {
        let idx = self.index(ppn);
        let refs = &mut self.refs[idx];
        assert!(*refs >= 1, "releasing free frame {}", ppn);
        *refs -= 1;
        if *refs == 0 {
            self.free += 1;
        }
        *refs
    }

    /// 增加一次引用（写时复制共享），返回新的引用数。
    pub fn retain(&mut self, ppn: Ppn) -> u8 {
        let idx = self.index(ppn);
        let refs = &mut self.refs[idx];
        assert!(*refs >= 1, "sharing free frame {}", ppn);
        assert!(*refs < MAX_REFS, "frame {} reference count overflow", ppn);
        *refs += 1;
        *refs
    }

    /// 帧的当前引用数
    pub fn refs(&self, ppn: Ppn) -> u8 {
        self.refs[self.index(ppn)]
    }

    /// 是否为本表管理的帧
    pub fn manages(&self, ppn: Ppn) -> bool {
        ppn >= self.start && ppn.0 < self.start.0 + self.refs.len()
    }

    /// 空闲帧数
    pub fn free_frames(&self) -> usize {
        self.free
    }

    /// 受管理的总帧数
    pub fn total_frames(&self) -> usize {
        self.refs.len()
    }
}

impl Default for FrameAllocator {
    fn default() -> Self {
        Self::new()
    }
}
