//! 多任务共享缓存：同键共享、等待与唤醒、信号打断、I/O 失败。
//! 每个宿主机线程扮演一个任务。

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Barrier, Once};
use std::thread;

use bcache::{Buffer, BufferCache, BufferCacheConfig, BufferError};
use device::{BlockDriver, DeviceError, DeviceId, DeviceTable, RamDisk};
use mm::{ArchMmOps, MemoryRegion, PhysMemory};
use sync::{ArchOps, SchedOps, TaskId, TaskState};
use test_support::mock::sched::INTERRUPTED_STATUS;
use test_support::mock::{MOCK_ARCH_OPS, MOCK_MM_OPS, MOCK_SCHEDULER};

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

struct TestMm;

impl ArchMmOps for TestMm {
    fn vaddr_to_paddr(&self, vaddr: usize) -> usize {
        MOCK_MM_OPS.vaddr_to_paddr(vaddr)
    }

    fn paddr_to_vaddr(&self, paddr: usize) -> usize {
        MOCK_MM_OPS.paddr_to_vaddr(paddr)
    }

    fn flush_tlb(&self, vaddr: usize) {
        MOCK_MM_OPS.flush_tlb(vaddr)
    }

    fn activate(&self, root_paddr: usize) {
        MOCK_MM_OPS.activate(root_paddr)
    }
}

static TEST_ARCH: TestArch = TestArch;
static TEST_SCHED: TestSched = TestSched;
static TEST_MM: TestMm = TestMm;

fn memory() -> &'static PhysMemory {
    static ONCE: Once = Once::new();
    ONCE.call_once(|| unsafe {
        sync::register_arch_ops(&TEST_ARCH);
        sync::register_sched_ops(&TEST_SCHED);
        mm::register_arch_ops(&TEST_MM);
    });
    let (base, size) = MOCK_MM_OPS.carve(8);
    let mem: &'static PhysMemory = Box::leak(Box::new(PhysMemory::new()));
    mem.init(MemoryRegion { base, size }, 7);
    mem
}

/// 统计读次数的磁盘，可以设置为读失败
struct CountingDisk {
    inner: RamDisk,
    reads: AtomicUsize,
    fail: bool,
}

impl CountingDisk {
    fn new(fail: bool) -> Self {
        CountingDisk {
            inner: RamDisk::new(64),
            reads: AtomicUsize::new(0),
            fail,
        }
    }
}

impl BlockDriver for CountingDisk {
    fn sector_count(&self) -> usize {
        self.inner.sector_count()
    }

    fn read(&self, buf: &mut [u8], sectors: usize, lba: usize, flags: u32) -> Result<(), DeviceError> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err(DeviceError::Io);
        }
        thread::yield_now();
        self.inner.read(buf, sectors, lba, flags)
    }

    fn write(&self, buf: &[u8], sectors: usize, lba: usize, flags: u32) -> Result<(), DeviceError> {
        self.inner.write(buf, sectors, lba, flags)
    }
}

fn setup(max: usize, fail: bool) -> (BufferCache<'static>, Arc<CountingDisk>, DeviceId) {
    let pages = memory();
    let devices: &'static DeviceTable = Box::leak(Box::new(DeviceTable::new()));
    let disk = Arc::new(CountingDisk::new(fail));
    let dev = devices.install_disk("hda", disk.clone());
    let config = BufferCacheConfig {
        max_buffers_per_class: max,
    };
    (BufferCache::new(pages, devices, config), disk, dev)
}

fn hold_all(cache: &BufferCache<'_>, dev: DeviceId, n: usize) -> Vec<Arc<Buffer>> {
    (0..n)
        .map(|block| cache.get_or_create(dev, block, 1024).unwrap())
        .collect()
}

#[test]
fn same_key_from_many_tasks_shares_one_buffer() {
    let (cache, disk, dev) = setup(8, false);
    let barrier = Barrier::new(6);
    let bufs: Vec<Arc<Buffer>> = thread::scope(|s| {
        let handles: Vec<_> = (0..6)
            .map(|_| {
                s.spawn(|| {
                    barrier.wait();
                    cache.read(dev, 5, 2048).unwrap()
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    assert!(bufs.iter().all(|b| Arc::ptr_eq(b, &bufs[0])));
    assert_eq!(bufs[0].ref_count(), 6);
    // 后来者在缓冲区锁上重新检查有效位，只读一次盘
    assert_eq!(disk.reads.load(Ordering::SeqCst), 1);
    for buf in bufs {
        cache.release(buf).unwrap();
    }
    assert_eq!(cache.idle_buffers(2048), 1);
}

#[test]
fn waiter_sleeps_until_a_buffer_is_released() {
    let (cache, _, dev) = setup(4, false);
    let mut held = hold_all(&cache, dev, 4);
    assert_eq!(cache.buffers(1024), 4);

    let (tx, rx) = mpsc::channel();
    thread::scope(|s| {
        let waiter = s.spawn(|| {
            tx.send(MOCK_SCHEDULER.current_task()).unwrap();
            cache.get_or_create(dev, 10, 1024)
        });
        let task = rx.recv().unwrap();
        MOCK_SCHEDULER.wait_until_blocked(task);
        assert_eq!(cache.waiters(1024), 1);

        // 引用未归零的释放不会唤醒等待者
        let extra = cache.get_or_create(dev, 2, 1024).unwrap();
        cache.release(extra).unwrap();
        assert!(MOCK_SCHEDULER.is_blocked(task));

        cache.release(held.remove(2)).unwrap();
        let buf = waiter.join().unwrap().unwrap();
        assert_eq!(buf.block(), 10);
        assert_eq!(buf.ref_count(), 1);
        held.push(buf);
    });

    assert_eq!(cache.waiters(1024), 0);
    assert_eq!(cache.buffers(1024), 4);
    for buf in held {
        cache.release(buf).unwrap();
    }
}

#[test]
fn interrupted_waiter_gives_up() {
    let (cache, _, dev) = setup(4, false);
    let held = hold_all(&cache, dev, 4);

    let (tx, rx) = mpsc::channel();
    thread::scope(|s| {
        let waiter = s.spawn(|| {
            tx.send(MOCK_SCHEDULER.current_task()).unwrap();
            cache.get_or_create(dev, 10, 1024)
        });
        let task = rx.recv().unwrap();
        MOCK_SCHEDULER.wait_until_blocked(task);
        MOCK_SCHEDULER.interrupt(task);
        let err = waiter.join().unwrap().unwrap_err();
        assert_eq!(err, BufferError::Interrupted(INTERRUPTED_STATUS));
        assert_eq!(err.errno(), -uapi::errno::EINTR);
    });

    assert_eq!(cache.waiters(1024), 0);
    for buf in held {
        cache.release(buf).unwrap();
    }
    assert_eq!(cache.idle_buffers(1024), 4);
}

#[test]
fn failed_read_releases_the_buffer() {
    let (cache, disk, dev) = setup(4, true);
    assert_eq!(
        cache.read(dev, 3, 4096).unwrap_err(),
        BufferError::Device(DeviceError::Io)
    );
    assert_eq!(disk.reads.load(Ordering::SeqCst), 1);
    assert_eq!(cache.idle_buffers(4096), 1);

    let buf = cache.get_or_create(dev, 3, 4096).unwrap();
    assert_eq!(buf.ref_count(), 1);
    assert!(!buf.is_valid());
    cache.release(buf).unwrap();
}

#[test]
fn dirty_partition_block_lands_on_the_parent_disk() {
    let pages = memory();
    let devices: &'static DeviceTable = Box::leak(Box::new(DeviceTable::new()));
    let disk = Arc::new(RamDisk::new(64));
    let hda = devices.install_disk("hda", disk.clone());
    let hda1 = devices.install_partition(hda, "hda1", 8, 32).unwrap();
    let cache = BufferCache::new(pages, devices, BufferCacheConfig::default());

    let buf = cache.read(hda1, 1, 2048).unwrap();
    {
        let guard = buf.lock();
        // 同一任务可以重入缓冲区锁
        let again = buf.lock();
        guard.data_mut()[0] = 0xee;
        assert_eq!(again.data()[0], 0xee);
    }
    buf.mark_dirty();
    assert!(buf.is_dirty());
    cache.write_back(&buf).unwrap();
    assert!(!buf.is_dirty());
    cache.release(buf).unwrap();

    // 分区块 1 = 分区扇区 4..8 = 磁盘扇区 12..16
    assert_eq!(disk.raw_data()[12 * 512], 0xee);
}
