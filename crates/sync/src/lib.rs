//! 同步原语
//!
//! 向其它内核模块提供基本的锁和同步原语：
//!
//! - [`SpinLock`]：关中断自旋锁，持锁期间当前任务不会被抢占
//! - [`Mutex`]：阻塞互斥锁，拿不到锁的任务在等待队列上睡眠
//! - [`ReentrantLock`]：基于 [`Mutex`] 的可重入锁，同一任务可多次获取
//! - [`WaitList`]：任务等待队列
//!
//! # 架构依赖
//!
//! 此 crate 通过两个 trait 与外部解耦：
//! - [`ArchOps`]：中断控制，使用前调用 [`register_arch_ops`] 注册
//! - [`SchedOps`]：任务阻塞 / 唤醒 / 让出，使用前调用 [`register_sched_ops`] 注册

#![no_std]

extern crate alloc;

mod intr_guard;
mod mutex;
mod raw_spin_lock;
mod sched;
mod spin_lock;
mod wait_list;

pub use intr_guard::*;
pub use mutex::{Mutex, MutexGuard, RawBlockingMutex, ReentrantLock, ReentrantLockGuard, TaskIdSource};
pub use raw_spin_lock::*;
pub use sched::{
    Interrupted, SchedOps, TaskId, TaskState, block_current, current_task, register_sched_ops,
    unblock, yield_now,
};
pub use spin_lock::*;
pub use wait_list::WaitList;

use core::sync::atomic::{AtomicUsize, Ordering};

/// 架构相关操作的 trait
///
/// 由内核的架构层实现并注册，提供中断控制
pub trait ArchOps: Send + Sync {
    /// 读取并禁用中断，返回之前的状态
    ///
    /// # Safety
    /// 调用者必须确保在适当的上下文中调用
    unsafe fn read_and_disable_interrupts(&self) -> usize;

    /// 恢复中断状态
    ///
    /// # Safety
    /// flags 必须是之前 read_and_disable_interrupts 返回的值
    unsafe fn restore_interrupts(&self, flags: usize);

    /// 状态字中的中断使能位（x86 上为 EFLAGS.IF）
    fn interrupt_enable_bit(&self) -> usize;
}

static ARCH_OPS_DATA: AtomicUsize = AtomicUsize::new(0);
static ARCH_OPS_VTABLE: AtomicUsize = AtomicUsize::new(0);

/// 注册架构操作实现
///
/// # Safety
/// 必须在单线程环境下调用，且只能调用一次
pub unsafe fn register_arch_ops(ops: &'static dyn ArchOps) {
    let ptr = ops as *const dyn ArchOps;
    // SAFETY: fat pointer 的布局是 (data, vtable)
    let (data, vtable) = unsafe { core::mem::transmute::<*const dyn ArchOps, (usize, usize)>(ptr) };
    ARCH_OPS_DATA.store(data, Ordering::Release);
    ARCH_OPS_VTABLE.store(vtable, Ordering::Release);
}

#[inline]
pub(crate) fn arch_ops() -> &'static dyn ArchOps {
    let data = ARCH_OPS_DATA.load(Ordering::Acquire);
    let vtable = ARCH_OPS_VTABLE.load(Ordering::Acquire);
    if data == 0 {
        panic!("sync: ArchOps not registered, call register_arch_ops first");
    }
    // SAFETY: data 和 vtable 是通过 register_arch_ops 设置的有效指针
    unsafe { &*core::mem::transmute::<(usize, usize), *const dyn ArchOps>((data, vtable)) }
}
