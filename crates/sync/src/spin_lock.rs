//! 自旋锁封装
//!
//! [`SpinLock`] 是本内核中“调用者必须关抢占”这一约定的载体：帧表、堆的
//! size class 表、设备请求队列等结构都放在 SpinLock 里，修改它们时天然处于关中断状态。

use core::cell::UnsafeCell;
use core::fmt;
use core::ops::{Deref, DerefMut};

use crate::raw_spin_lock::{RawSpinLock, RawSpinLockGuard};

/// 保护一份数据的关中断自旋锁。
///
/// 持锁期间不得阻塞（不得调用 [`block_current`](crate::block_current)），
/// 需要睡眠的路径应先 drop guard。
///
/// ```ignore
/// let lock = SpinLock::new(0);
/// *lock.lock() += 1;
/// ```
pub struct SpinLock<T> {
    raw_lock: RawSpinLock,
    data: UnsafeCell<T>,
}

impl<T> SpinLock<T> {
    /// 创建一个新的 SpinLock。
    pub const fn new(data: T) -> Self {
        SpinLock {
            raw_lock: RawSpinLock::new(),
            data: UnsafeCell::new(data),
        }
    }

    /// 获取锁。
    pub fn lock(&self) -> SpinLockGuard<'_, T> {
        let raw_guard = self.raw_lock.lock();
        SpinLockGuard {
            _raw_guard: raw_guard,
            // SAFETY: 持有 raw_lock 期间只有本 guard 能访问 data
            data: unsafe { &mut *self.data.get() },
        }
    }

    /// 尝试获取锁，失败返回 None。
    pub fn try_lock(&self) -> Option<SpinLockGuard<'_, T>> {
        self.raw_lock.try_lock().map(|raw_guard| SpinLockGuard {
            _raw_guard: raw_guard,
            // SAFETY: 同 lock()
            data: unsafe { &mut *self.data.get() },
        })
    }

    /// 通过独占引用直接访问数据，无需上锁。
    pub fn get_mut(&mut self) -> &mut T {
        self.data.get_mut()
    }

    /// 消耗锁，取出数据。
    pub fn into_inner(self) -> T {
        self.data.into_inner()
    }

    /// 锁当前是否被占用
    pub fn is_locked(&self) -> bool {
        self.raw_lock.is_locked()
    }
}

impl<T: Default> Default for SpinLock<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T> fmt::Debug for SpinLock<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SpinLock")
            .field("locked", &self.is_locked())
            .finish_non_exhaustive()
    }
}

/// [`SpinLock`] 的保护器，离开作用域时释放锁并恢复中断。
pub struct SpinLockGuard<'a, T> {
    _raw_guard: RawSpinLockGuard<'a>,
    data: &'a mut T,
}

impl<T> Deref for SpinLockGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        self.data
    }
}

impl<T> DerefMut for SpinLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        self.data
    }
}

// SAFETY: 对 data 的访问都经过 raw_lock 串行化
unsafe impl<T: Send> Send for SpinLock<T> {}
unsafe impl<T: Send> Sync for SpinLock<T> {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_env;
    use test_support::mock::MOCK_ARCH_OPS;

    #[test]
    fn test_guard_disables_and_restores_interrupts() {
        test_env::init();
        let lock = SpinLock::new(0u32);
        assert!(MOCK_ARCH_OPS.interrupts_enabled());
        {
            let mut guard = lock.lock();
            *guard += 1;
            assert!(!MOCK_ARCH_OPS.interrupts_enabled());
            assert!(lock.is_locked());
        }
        assert!(MOCK_ARCH_OPS.interrupts_enabled());
        assert!(!lock.is_locked());
        assert_eq!(*lock.lock(), 1);
    }

    #[test]
    fn test_try_lock_fails_while_held() {
        test_env::init();
        let lock = SpinLock::new(());
        let guard = lock.lock();
        assert!(lock.try_lock().is_none());
        // 失败的 try_lock 不能把中断重新打开
        assert!(!MOCK_ARCH_OPS.interrupts_enabled());
        drop(guard);
        assert!(lock.try_lock().is_some());
    }

    #[test]
    fn test_nested_locks_restore_outermost_state() {
        test_env::init();
        let a = SpinLock::new(1);
        let b = SpinLock::new(2);
        let ga = a.lock();
        let gb = b.lock();
        drop(gb);
        assert!(!MOCK_ARCH_OPS.interrupts_enabled());
        drop(ga);
        assert!(MOCK_ARCH_OPS.interrupts_enabled());
        assert_eq!(MOCK_ARCH_OPS.disable_depth(), 0);
    }
}
