//! 调度器钩子
//!
//! 任务调度与上下文切换不属于本内核核心；这里只消费三个原语：
//! 阻塞当前任务、唤醒指定任务、主动让出 CPU。调度器在启动时通过
//! [`register_sched_ops`] 注册实现。

use core::fmt;
use core::sync::atomic::{AtomicUsize, Ordering};

/// 任务标识
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(pub usize);

impl TaskId {
    /// 数值形式
    pub const fn as_usize(self) -> usize {
        self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task#{}", self.0)
    }
}

/// 阻塞时任务进入的状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    /// 等待资源（锁、缓冲区、设备）
    Blocked,
    /// 定时睡眠
    Sleeping,
}

/// 调度器操作
pub trait SchedOps: Send + Sync {
    /// 当前正在运行的任务
    fn current_task(&self) -> TaskId;

    /// 阻塞 `task`（总是当前任务），直到有人对它调用 [`SchedOps::unblock`]。
    ///
    /// 返回 unblock 传入的状态码；负值表示被信号等外部机制强行唤醒。
    /// `timeout` 为 None 表示无限等待。
    ///
    /// 实现必须记住“先到的唤醒”：若 unblock 发生在任务登记到等待队列之后、
    /// 真正调用 block 之前，block 必须立即返回。
    fn block(&self, task: TaskId, state: TaskState, timeout: Option<u64>) -> isize;

    /// 唤醒 `task`，`status` 作为其 block 的返回值。
    fn unblock(&self, task: TaskId, status: isize);

    /// 让出 CPU
    fn yield_now(&self);
}

static SCHED_OPS_DATA: AtomicUsize = AtomicUsize::new(0);
static SCHED_OPS_VTABLE: AtomicUsize = AtomicUsize::new(0);

/// 注册调度器操作实现
///
/// # Safety
/// 必须在单线程环境下调用，且只能调用一次
pub unsafe fn register_sched_ops(ops: &'static dyn SchedOps) {
    let ptr = ops as *const dyn SchedOps;
    // SAFETY: fat pointer 的布局是 (data, vtable)
    let (data, vtable) =
        unsafe { core::mem::transmute::<*const dyn SchedOps, (usize, usize)>(ptr) };
    SCHED_OPS_DATA.store(data, Ordering::Release);
    SCHED_OPS_VTABLE.store(vtable, Ordering::Release);
}

#[inline]
fn sched_ops() -> &'static dyn SchedOps {
    let data = SCHED_OPS_DATA.load(Ordering::Acquire);
    let vtable = SCHED_OPS_VTABLE.load(Ordering::Acquire);
    if data == 0 {
        panic!("sync: SchedOps not registered, call register_sched_ops first");
    }
    // SAFETY: data 和 vtable 是通过 register_sched_ops 设置的有效指针
    unsafe { &*core::mem::transmute::<(usize, usize), *const dyn SchedOps>((data, vtable)) }
}

/// 阻塞被外部强行打断，携带唤醒时的负状态码
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Interrupted(pub isize);

impl Interrupted {
    /// 唤醒状态码（负值）
    pub const fn status(self) -> isize {
        self.0
    }
}

/// 当前任务
pub fn current_task() -> TaskId {
    sched_ops().current_task()
}

/// 无限期阻塞当前任务，直到被唤醒。
///
/// 调用前必须已经把当前任务登记到某个等待队列上，且不得持有任何 [`SpinLock`](crate::SpinLock)。
pub fn block_current() -> Result<(), Interrupted> {
    let ops = sched_ops();
    let status = ops.block(ops.current_task(), TaskState::Blocked, None);
    if status < 0 {
        Err(Interrupted(status))
    } else {
        Ok(())
    }
}

/// 唤醒任务
pub fn unblock(task: TaskId, status: isize) {
    sched_ops().unblock(task, status);
}

/// 让出 CPU
pub fn yield_now() {
    sched_ops().yield_now();
}
