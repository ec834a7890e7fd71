//! 多任务场景下的阻塞锁测试：每个宿主机线程扮演一个任务。

use std::cell::Cell;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc;
use std::thread;

use sync::{ArchOps, Mutex, ReentrantLock, SchedOps, TaskId, TaskState};
use test_support::mock::{MOCK_ARCH_OPS, MOCK_SCHEDULER};

struct TestArch;

impl ArchOps for TestArch {
    unsafe fn read_and_disable_interrupts(&self) -> usize {
        unsafe { MOCK_ARCH_OPS.read_and_disable_interrupts() }
    }

    unsafe fn restore_interrupts(&self, flags: usize) {
        unsafe { MOCK_ARCH_OPS.restore_interrupts(flags) }
    }

    fn interrupt_enable_bit(&self) -> usize {
        MOCK_ARCH_OPS.interrupt_enable_bit()
    }
}

struct TestSched;

impl SchedOps for TestSched {
    fn current_task(&self) -> TaskId {
        TaskId(MOCK_SCHEDULER.current_task())
    }

    fn block(&self, task: TaskId, _state: TaskState, _timeout: Option<u64>) -> isize {
        MOCK_SCHEDULER.block(task.0)
    }

    fn unblock(&self, task: TaskId, status: isize) {
        MOCK_SCHEDULER.unblock(task.0, status)
    }

    fn yield_now(&self) {
        MOCK_SCHEDULER.yield_now()
    }
}

static TEST_ARCH: TestArch = TestArch;
static TEST_SCHED: TestSched = TestSched;

fn init() {
    static ONCE: std::sync::Once = std::sync::Once::new();
    ONCE.call_once(|| unsafe {
        sync::register_arch_ops(&TEST_ARCH);
        sync::register_sched_ops(&TEST_SCHED);
    });
}

#[test]
fn mutex_serializes_concurrent_tasks() {
    init();
    let counter = Arc::new(Mutex::new(0usize));
    let in_section = Arc::new(AtomicUsize::new(0));

    let handles: Vec<_> = (0..4)
        .map(|_| {
            let counter = counter.clone();
            let in_section = in_section.clone();
            thread::spawn(move || {
                for _ in 0..200 {
                    let mut guard = counter.lock();
                    assert_eq!(in_section.fetch_add(1, Ordering::SeqCst), 0);
                    *guard += 1;
                    in_section.fetch_sub(1, Ordering::SeqCst);
                }
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }
    assert_eq!(*counter.lock(), 800);
}

#[test]
fn contended_mutex_blocks_until_unlock() {
    init();
    let m = Arc::new(Mutex::new(Vec::new()));
    let guard = m.lock();

    let (tx, rx) = mpsc::channel();
    let m2 = m.clone();
    let waiter = thread::spawn(move || {
        tx.send(MOCK_SCHEDULER.current_task()).unwrap();
        m2.lock().push("waiter");
    });
    let waiter_id = rx.recv().unwrap();
    MOCK_SCHEDULER.wait_until_blocked(waiter_id);

    drop(guard);
    waiter.join().unwrap();
    assert_eq!(*m.lock(), vec!["waiter"]);
}

#[test]
fn interrupted_waiter_keeps_competing_for_the_mutex() {
    init();
    let m = Arc::new(Mutex::new(0));
    let guard = m.lock();

    let (tx, rx) = mpsc::channel();
    let m2 = m.clone();
    let waiter = thread::spawn(move || {
        tx.send(MOCK_SCHEDULER.current_task()).unwrap();
        *m2.lock() += 1;
    });
    let waiter_id = rx.recv().unwrap();
    MOCK_SCHEDULER.wait_until_blocked(waiter_id);
    let blocks = MOCK_SCHEDULER.blocks_of(waiter_id);
    MOCK_SCHEDULER.interrupt(waiter_id);
    // 被打断后重新排队，锁仍然被持有
    MOCK_SCHEDULER.wait_for_blocks(waiter_id, blocks + 1);
    assert_eq!(unsafe { m.raw() }.waiters(), 1);

    drop(guard);
    waiter.join().unwrap();
    assert_eq!(*m.lock(), 1);
}

#[test]
fn reentrant_lock_excludes_other_tasks_until_fully_released() {
    init();
    let lock = Arc::new(ReentrantLock::new(Cell::new(0)));
    let outer = lock.lock();
    let inner = lock.lock();

    let (tx, rx) = mpsc::channel();
    let lock2 = lock.clone();
    let other = thread::spawn(move || {
        tx.send(MOCK_SCHEDULER.current_task()).unwrap();
        let g = lock2.lock();
        g.set(g.get() + 10);
    });
    let other_id = rx.recv().unwrap();
    MOCK_SCHEDULER.wait_until_blocked(other_id);

    inner.set(1);
    drop(inner);
    // 还剩一层重入，其他任务仍被挡在外面
    assert!(MOCK_SCHEDULER.is_blocked(other_id));
    drop(outer);

    other.join().unwrap();
    assert_eq!(lock.lock().get(), 11);
}
