//! 调度器的 Mock 实现
//!
//! 每个宿主机线程就是一个任务，任务号在线程第一次调用
//! [`MockScheduler::current_task`] 时分配。阻塞用 park 实现，唤醒
//! 先写入状态码再 unpark；状态码就是“唤醒令牌”，所以先唤醒后阻塞
//! 的顺序不会丢失唤醒。

use std::cell::Cell;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, Thread};
use std::time::{Duration, Instant};

/// 模拟信号打断时使用的状态码（-EINTR）
pub const INTERRUPTED_STATUS: isize = -4;

struct TaskSlot {
    thread: Thread,
    token: Mutex<Option<isize>>,
    blocked: AtomicBool,
    blocks: AtomicUsize,
}

thread_local! {
    static CURRENT: Cell<usize> = const { Cell::new(0) };
}

/// 基于线程的 Mock 调度器
pub struct MockScheduler {
    tasks: Mutex<BTreeMap<usize, Arc<TaskSlot>>>,
    next_id: AtomicUsize,
}

impl MockScheduler {
    pub const fn new() -> Self {
        Self {
            tasks: Mutex::new(BTreeMap::new()),
            next_id: AtomicUsize::new(1),
        }
    }

    fn slot(&self, id: usize) -> Arc<TaskSlot> {
        self.tasks
            .lock()
            .unwrap()
            .get(&id)
            .cloned()
            .unwrap_or_else(|| panic!("mock scheduler: unknown task {}", id))
    }

    /// 当前线程对应的任务号
    pub fn current_task(&self) -> usize {
        CURRENT.with(|c| {
            if c.get() == 0 {
                let id = self.next_id.fetch_add(1, Ordering::Relaxed);
                let slot = Arc::new(TaskSlot {
                    thread: thread::current(),
                    token: Mutex::new(None),
                    blocked: AtomicBool::new(false),
                    blocks: AtomicUsize::new(0),
                });
                self.tasks.lock().unwrap().insert(id, slot);
                c.set(id);
            }
            c.get()
        })
    }

    /// 阻塞 `id` 对应的线程直到被唤醒，返回唤醒状态码
    pub fn block(&self, id: usize) -> isize {
        assert_eq!(id, self.current_task(), "mock scheduler: blocking a foreign task");
        let slot = self.slot(id);
        slot.blocks.fetch_add(1, Ordering::AcqRel);
        slot.blocked.store(true, Ordering::Release);
        let status = loop {
            if let Some(status) = slot.token.lock().unwrap().take() {
                break status;
            }
            thread::park();
        };
        slot.blocked.store(false, Ordering::Release);
        status
    }

    /// 唤醒任务；已有未消费的令牌时保留先到的那个
    pub fn unblock(&self, id: usize, status: isize) {
        let slot = self.slot(id);
        {
            let mut token = slot.token.lock().unwrap();
            if token.is_none() {
                *token = Some(status);
            }
        }
        slot.thread.unpark();
    }

    /// 模拟信号强行唤醒
    pub fn interrupt(&self, id: usize) {
        self.unblock(id, INTERRUPTED_STATUS);
    }

    pub fn yield_now(&self) {
        thread::yield_now();
    }

    /// 任务当前是否阻塞在 block 中
    pub fn is_blocked(&self, id: usize) -> bool {
        self.tasks
            .lock()
            .unwrap()
            .get(&id)
            .is_some_and(|slot| slot.blocked.load(Ordering::Acquire))
    }

    /// 等待任务进入阻塞状态，超时则 panic
    pub fn wait_until_blocked(&self, id: usize) {
        let deadline = Instant::now() + Duration::from_secs(10);
        while !self.is_blocked(id) {
            assert!(Instant::now() < deadline, "task {} never blocked", id);
            thread::sleep(Duration::from_millis(1));
        }
    }

    /// 任务累计进入 block 的次数
    pub fn blocks_of(&self, id: usize) -> usize {
        self.tasks
            .lock()
            .unwrap()
            .get(&id)
            .map_or(0, |slot| slot.blocks.load(Ordering::Acquire))
    }

    /// 等待任务第 `n` 次进入阻塞，超时则 panic
    pub fn wait_for_blocks(&self, id: usize, n: usize) {
        let deadline = Instant::now() + Duration::from_secs(10);
        while self.blocks_of(id) < n || !self.is_blocked(id) {
            assert!(Instant::now() < deadline, "task {} never blocked {} times", id, n);
            thread::sleep(Duration::from_millis(1));
        }
    }
}

impl Default for MockScheduler {
    fn default() -> Self {
        Self::new()
    }
}

/// 全局 Mock 实例
pub static MOCK_SCHEDULER: MockScheduler = MockScheduler::new();
