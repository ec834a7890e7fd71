//! 缓冲区
//!
//! 元数据（设备、块号、引用计数、脏/有效标志）由自旋锁保护，随时可读；
//! 块数据由可重入锁保护，读写数据或发起 I/O 前必须持有 [`BufferGuard`]。

use core::cell::{Ref, RefCell, RefMut};
use core::ptr::NonNull;

use device::DeviceId;
use sync::{ReentrantLock, ReentrantLockGuard, SpinLock};

#[derive(Debug, Default)]
pub(crate) struct BufferMeta {
    pub(crate) dev: Option<DeviceId>,
    pub(crate) block: usize,
    pub(crate) count: usize,
    pub(crate) dirty: bool,
    pub(crate) valid: bool,
}

/// 内核页中的一段块数据
pub(crate) struct BlockData {
    ptr: NonNull<u8>,
    len: usize,
}

// SAFETY: 数据区来自内核页，缓冲区永不释放，访问由可重入锁串行化
unsafe impl Send for BlockData {}

impl BlockData {
    fn as_slice(&self) -> &[u8] {
        // SAFETY: ptr 指向 len 字节的独占内核页区域，生存期与缓存相同
        unsafe { core::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }

    fn as_mut_slice(&mut self) -> &mut [u8] {
        // SAFETY: 同上，且 &mut self 保证没有其它切片
        unsafe { core::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }
}

/// 一个磁盘块在内存中的副本。
///
/// 缓冲区一经创建就不会释放，只在 未使用 / 闲置 / 忙 三种状态间循环。
pub struct Buffer {
    pub(crate) class: usize,
    pub(crate) index: usize,
    size: usize,
    pub(crate) meta: SpinLock<BufferMeta>,
    data: ReentrantLock<RefCell<BlockData>>,
}

impl Buffer {
    /// # Safety
    /// `vaddr` 起的 `size` 字节必须是只属于此缓冲区、永不回收的内核内存
    pub(crate) unsafe fn new(class: usize, index: usize, vaddr: usize, size: usize) -> Self {
        // SAFETY: 调用者保证 vaddr 有效，内核页地址非零
        let ptr = unsafe { NonNull::new_unchecked(vaddr as *mut u8) };
        Buffer {
            class,
            index,
            size,
            meta: SpinLock::new(BufferMeta::default()),
            data: ReentrantLock::new(RefCell::new(BlockData { ptr, len: size })),
        }
    }

    /// 所属设备；从未分配过的缓冲区返回 `None`
    pub fn dev(&self) -> Option<DeviceId> {
        self.meta.lock().dev
    }

    /// 块号
    pub fn block(&self) -> usize {
        self.meta.lock().block
    }

    /// 块大小
    pub fn size(&self) -> usize {
        self.size
    }

    /// 内容是否与磁盘一致或更新
    pub fn is_valid(&self) -> bool {
        self.meta.lock().valid
    }

    /// 是否有未写回的修改
    pub fn is_dirty(&self) -> bool {
        self.meta.lock().dirty
    }

    /// 引用计数
    pub fn ref_count(&self) -> usize {
        self.meta.lock().count
    }

    /// 标记内容已修改，释放时写回
    pub fn mark_dirty(&self) {
        let mut meta = self.meta.lock();
        meta.dirty = true;
        meta.valid = true;
    }

    /// 获取缓冲区锁。同一任务可以重复获取。
    pub fn lock(&self) -> BufferGuard<'_> {
        BufferGuard {
            guard: self.data.lock(),
        }
    }
}

impl core::fmt::Debug for Buffer {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let meta = self.meta.lock();
        f.debug_struct("Buffer")
            .field("dev", &meta.dev)
            .field("block", &meta.block)
            .field("size", &self.size)
            .field("count", &meta.count)
            .field("dirty", &meta.dirty)
            .field("valid", &meta.valid)
            .finish()
    }
}

/// 持有缓冲区锁期间访问块数据。
///
/// 数据借用在运行期检查，同一时刻只能存在一个 [`BufferGuard::data_mut`]。
pub struct BufferGuard<'a> {
    guard: ReentrantLockGuard<'a, RefCell<BlockData>>,
}

impl BufferGuard<'_> {
    /// 只读访问
    pub fn data(&self) -> Ref<'_, [u8]> {
        Ref::map(self.guard.borrow(), BlockData::as_slice)
    }

    /// 可写访问；修改后记得 [`Buffer::mark_dirty`]
    pub fn data_mut(&self) -> RefMut<'_, [u8]> {
        RefMut::map(self.guard.borrow_mut(), BlockData::as_mut_slice)
    }
}
