//! 中断保护器
//!
//! 本 crate 只面向单处理器：关中断即关抢占。帧表、堆的 arena 元数据等没有
//! 自带锁的结构，都要求修改期间持有一个 [`IntrGuard`]（通常经由 [`SpinLock`](crate::SpinLock)）。

use crate::arch_ops;

/// 中断保护器，创建时关中断，销毁时恢复之前的中断状态。
///
/// 可以嵌套：内层 guard 恢复的是“已关闭”状态，只有最外层的 guard 会重新开中断。
pub struct IntrGuard {
    flags: usize,
}

impl IntrGuard {
    /// 关中断并返回保护器。
    pub fn new() -> Self {
        // SAFETY: 返回的 flags 只会由本 guard 的 Drop 恢复一次
        let flags = unsafe { arch_ops().read_and_disable_interrupts() };
        IntrGuard { flags }
    }

    /// 进入临界区前中断是否处于开启状态。
    pub fn was_enabled(&self) -> bool {
        self.flags & arch_ops().interrupt_enable_bit() != 0
    }
}

impl Default for IntrGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for IntrGuard {
    fn drop(&mut self) {
        // SAFETY: flags 来自 new() 中的 read_and_disable_interrupts
        unsafe { arch_ops().restore_interrupts(self.flags) };
    }
}
