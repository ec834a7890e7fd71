//! 阻塞互斥锁与可重入锁
//!
//! 锁本体由 `lock_api` 提供 RAII 封装，这里只实现底层的 [`RawBlockingMutex`]：
//! 锁被占用时当前任务登记到等待队列并阻塞，释放者唤醒队首任务后主动让出 CPU。
//! 可重入锁复用同一个 raw mutex，以当前任务号作为持有者标识，
//! 持有者和重入深度由 `lock_api::RawReentrantMutex` 维护。

use core::num::NonZeroUsize;

use lock_api::{GetThreadId, GuardNoSend, RawMutex};

use crate::sched::{block_current, current_task, unblock, yield_now};
use crate::spin_lock::SpinLock;
use crate::wait_list::WaitList;

/// 正常唤醒的状态码
const EOK: isize = 0;

struct MutexState {
    locked: bool,
    waiters: WaitList,
}

/// 会睡眠的原始互斥锁
pub struct RawBlockingMutex {
    state: SpinLock<MutexState>,
}

unsafe impl RawMutex for RawBlockingMutex {
    #[allow(clippy::declare_interior_mutable_const)]
    const INIT: Self = RawBlockingMutex {
        state: SpinLock::new(MutexState {
            locked: false,
            waiters: WaitList::new(),
        }),
    };

    type GuardMarker = GuardNoSend;

    fn lock(&self) {
        loop {
            let mut state = self.state.lock();
            if !state.locked {
                state.locked = true;
                return;
            }
            let me = current_task();
            state.waiters.push(me);
            drop(state);

            // 获取互斥锁不可失败：被信号打断时退出队列后重新竞争
            if block_current().is_err() {
                self.state.lock().waiters.remove(me);
            }
        }
    }

    fn try_lock(&self) -> bool {
        let mut state = self.state.lock();
        if state.locked {
            false
        } else {
            state.locked = true;
            true
        }
    }

    unsafe fn unlock(&self) {
        let mut state = self.state.lock();
        assert!(state.locked, "unlocking a mutex that is not locked");
        state.locked = false;
        let next = state.waiters.pop();
        drop(state);

        if let Some(task) = next {
            unblock(task, EOK);
            yield_now();
        }
    }

    fn is_locked(&self) -> bool {
        self.state.lock().locked
    }
}

impl RawBlockingMutex {
    /// 正在等待此锁的任务数
    pub fn waiters(&self) -> usize {
        self.state.lock().waiters.len()
    }
}

/// 以当前任务号作为可重入锁的持有者标识
pub struct TaskIdSource;

unsafe impl GetThreadId for TaskIdSource {
    const INIT: Self = TaskIdSource;

    fn nonzero_thread_id(&self) -> NonZeroUsize {
        NonZeroUsize::MIN.saturating_add(current_task().as_usize())
    }
}

/// 阻塞互斥锁
pub type Mutex<T> = lock_api::Mutex<RawBlockingMutex, T>;
/// [`Mutex`] 的保护器
pub type MutexGuard<'a, T> = lock_api::MutexGuard<'a, RawBlockingMutex, T>;

/// 可重入锁：同一任务可以多次获取，获取与释放次数相等时才真正放开。
///
/// 保护器只给出共享引用，需要修改数据时配合 `RefCell` 使用。
pub type ReentrantLock<T> = lock_api::ReentrantMutex<RawBlockingMutex, TaskIdSource, T>;
/// [`ReentrantLock`] 的保护器
pub type ReentrantLockGuard<'a, T> =
    lock_api::ReentrantMutexGuard<'a, RawBlockingMutex, TaskIdSource, T>;
