//! 中断控制的 Mock 实现

use std::cell::Cell;

thread_local! {
    // 每个线程模拟一个任务自己的中断使能位
    static INTERRUPTS_ENABLED: Cell<bool> = const { Cell::new(true) };
    static DISABLE_DEPTH: Cell<usize> = const { Cell::new(0) };
}

/// 模拟的状态字中断使能位
pub const MOCK_IF_BIT: usize = 0x200;

/// Mock 架构操作
pub struct MockArchOps;

impl MockArchOps {
    pub const fn new() -> Self {
        Self
    }

    /// 关中断，返回之前的状态字
    ///
    /// # Safety
    /// 仅用于测试
    pub unsafe fn read_and_disable_interrupts(&self) -> usize {
        DISABLE_DEPTH.with(|d| d.set(d.get() + 1));
        let was = INTERRUPTS_ENABLED.with(|s| s.replace(false));
        if was {
            MOCK_IF_BIT
        } else {
            0
        }
    }

    /// 恢复状态字
    ///
    /// # Safety
    /// flags 必须来自 read_and_disable_interrupts
    pub unsafe fn restore_interrupts(&self, flags: usize) {
        DISABLE_DEPTH.with(|d| d.set(d.get() - 1));
        INTERRUPTS_ENABLED.with(|s| s.set(flags & MOCK_IF_BIT != 0));
    }

    pub fn interrupt_enable_bit(&self) -> usize {
        MOCK_IF_BIT
    }

    /// 当前线程是否处于开中断状态
    pub fn interrupts_enabled(&self) -> bool {
        INTERRUPTS_ENABLED.with(|s| s.get())
    }

    /// 当前线程尚未恢复的关中断次数
    pub fn disable_depth(&self) -> usize {
        DISABLE_DEPTH.with(|d| d.get())
    }
}

impl Default for MockArchOps {
    fn default() -> Self {
        Self::new()
    }
}

/// 全局 Mock 实例
pub static MOCK_ARCH_OPS: MockArchOps = MockArchOps::new();
