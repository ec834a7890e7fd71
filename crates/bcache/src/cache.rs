//! 缓冲区缓存
//!
//! 按块大小分成三个大小类，每类各有一张 (设备, 块号) 索引表、一条未使用
//! 队列、一条闲置链表和一条等待队列。取缓冲区时依次尝试：命中索引、
//! 未使用队列、闲置链表头（最早闲置者）；都没有就睡眠，直到有缓冲区被释放。
//!
//! 释放总是先写回脏数据，所以闲置的缓冲区可以直接挪作他用。

use alloc::collections::VecDeque;
use alloc::sync::Arc;
use alloc::vec::Vec;

use device::{DeviceError, DeviceId, DeviceTable, Transfer};
use hashbrown::HashMap;
use mm::PhysMemory;
use mm::config::PAGE_SIZE;
use sync::{SpinLock, WaitList};
use uapi::errno::EOK;

use crate::buffer::Buffer;
use crate::idle_list::IdleList;
use crate::{BufferCacheConfig, BufferError};

/// 支持的块大小
pub const BLOCK_SIZES: [usize; 3] = [1024, 2048, 4096];

struct ClassState {
    buffers: Vec<Arc<Buffer>>,
    index: HashMap<(DeviceId, usize), usize>,
    free: VecDeque<usize>,
    idle: IdleList,
    waiters: WaitList,
}

struct SizeClass {
    size: usize,
    state: SpinLock<ClassState>,
}

impl SizeClass {
    fn new(size: usize) -> Self {
        SizeClass {
            size,
            state: SpinLock::new(ClassState {
                buffers: Vec::new(),
                index: HashMap::new(),
                free: VecDeque::new(),
                idle: IdleList::new(),
                waiters: WaitList::new(),
            }),
        }
    }
}

/// 块缓冲区缓存
pub struct BufferCache<'a> {
    pages: &'a PhysMemory,
    devices: &'a DeviceTable,
    config: BufferCacheConfig,
    classes: [SizeClass; 3],
}

impl<'a> BufferCache<'a> {
    /// 从 `pages` 的内核池取数据页，经 `devices` 读写磁盘
    pub fn new(pages: &'a PhysMemory, devices: &'a DeviceTable, config: BufferCacheConfig) -> Self {
        BufferCache {
            pages,
            devices,
            config,
            classes: BLOCK_SIZES.map(SizeClass::new),
        }
    }

    fn class_of(&self, size: usize) -> Result<usize, BufferError> {
        BLOCK_SIZES
            .iter()
            .position(|&s| s == size)
            .ok_or(BufferError::UnsupportedSize(size))
    }

    /// 大小类中已创建的缓冲区数
    pub fn buffers(&self, size: usize) -> usize {
        self.class_of(size)
            .map_or(0, |c| self.classes[c].state.lock().buffers.len())
    }

    /// 大小类中闲置的缓冲区数
    pub fn idle_buffers(&self, size: usize) -> usize {
        self.class_of(size)
            .map_or(0, |c| self.classes[c].state.lock().idle.len())
    }

    /// 在大小类中等待缓冲区的任务数
    pub fn waiters(&self, size: usize) -> usize {
        self.class_of(size)
            .map_or(0, |c| self.classes[c].state.lock().waiters.len())
    }

    /// 切一个内核页补充未使用队列
    fn grow(&self, class: usize, st: &mut ClassState) {
        let size = self.classes[class].size;
        let room = self.config.max_buffers_per_class - st.buffers.len();
        let count = (PAGE_SIZE / size).min(room);
        let vaddr = self.pages.alloc_kernel_pages(1);
        for i in 0..count {
            let index = st.buffers.len();
            // SAFETY: 新分配的内核页永不归还，每个缓冲区独占其中一段
            let buf = unsafe { Buffer::new(class, index, vaddr + i * size, size) };
            st.buffers.push(Arc::new(buf));
            st.free.push_back(index);
        }
        st.idle.grow(st.buffers.len());
        log::debug!("bcache: {} more buffers of {} bytes", count, size);
    }

    /// 取得 (dev, block) 对应的缓冲区并增加引用计数。
    ///
    /// 返回的缓冲区不一定有效；没有可用缓冲区时睡眠等待。
    pub fn get_or_create(
        &self,
        dev: DeviceId,
        block: usize,
        size: usize,
    ) -> Result<Arc<Buffer>, BufferError> {
        let class = self.class_of(size)?;
        let sc = &self.classes[class];
        loop {
            let mut st = sc.state.lock();
            if let Some(&idx) = st.index.get(&(dev, block)) {
                let buf = st.buffers[idx].clone();
                let mut meta = buf.meta.lock();
                if meta.count == 0 {
                    st.idle.remove(idx);
                }
                meta.count += 1;
                drop(meta);
                return Ok(buf);
            }

            if st.free.is_empty() && st.buffers.len() < self.config.max_buffers_per_class {
                self.grow(class, &mut st);
            }
            let picked = match st.free.pop_front() {
                Some(idx) => Some(idx),
                None => st.idle.pop_front(),
            };

            if let Some(idx) = picked {
                let buf = st.buffers[idx].clone();
                let mut meta = buf.meta.lock();
                if let Some(old) = meta.dev {
                    st.index.remove(&(old, meta.block));
                    if meta.dirty {
                        log::error!("bcache: dropping unwritten block {} of {}", meta.block, old);
                    }
                }
                meta.dev = Some(dev);
                meta.block = block;
                meta.count = 1;
                meta.dirty = false;
                meta.valid = false;
                drop(meta);
                st.index.insert((dev, block), idx);
                return Ok(buf);
            }

            let me = sync::current_task();
            st.waiters.push(me);
            drop(st);
            if let Err(interrupted) = sync::block_current() {
                let mut st = sc.state.lock();
                // 已被释放者选中时，把这次唤醒让给下一个等待者
                let next = if st.waiters.remove(me) { None } else { st.waiters.pop() };
                drop(st);
                if let Some(task) = next {
                    sync::unblock(task, EOK);
                }
                return Err(BufferError::Interrupted(interrupted.status()));
            }
        }
    }

    /// 每块对应的扇区数
    fn sectors_per_block(&self, dev: DeviceId, size: usize) -> Result<usize, BufferError> {
        let sector_size = self.devices.sector_size(dev)?;
        if sector_size > size || size % sector_size != 0 {
            return Err(BufferError::UnsupportedGeometry {
                sector_size,
                block_size: size,
            });
        }
        Ok(size / sector_size)
    }

    /// 读入一块。已有效的缓冲区直接返回，不发起 I/O。
    ///
    /// I/O 失败时缓冲区被释放，返回设备错误。
    pub fn read(&self, dev: DeviceId, block: usize, size: usize) -> Result<Arc<Buffer>, BufferError> {
        self.class_of(size)?;
        let sectors = self.sectors_per_block(dev, size)?;
        let buf = self.get_or_create(dev, block, size)?;
        if buf.is_valid() {
            return Ok(buf);
        }

        let filled = {
            let guard = buf.lock();
            // 持锁后再查一次，其它任务可能已经读入
            if buf.is_valid() {
                Ok(())
            } else {
                block
                    .checked_mul(sectors)
                    .ok_or(BufferError::Device(DeviceError::OutOfRange))
                    .and_then(|start| {
                        let mut data = guard.data_mut();
                        self.devices
                            .submit(dev, Transfer::Read(&mut *data), sectors, start, 0)
                            .map_err(BufferError::from)
                    })
                    .map(|()| {
                        let mut meta = buf.meta.lock();
                        meta.valid = true;
                        meta.dirty = false;
                    })
            }
        };

        match filled {
            Ok(()) => Ok(buf),
            Err(err) => {
                log::warn!("bcache: read block {} of {} failed: {:?}", block, dev, err);
                // 缓冲区不脏，释放不会再发起 I/O
                let _ = self.release(buf);
                Err(err)
            }
        }
    }

    /// 写回脏缓冲区；不脏时什么也不做
    pub fn write_back(&self, buf: &Buffer) -> Result<(), BufferError> {
        if !buf.is_dirty() {
            return Ok(());
        }
        let guard = buf.lock();
        let (dev, block) = {
            let meta = buf.meta.lock();
            if !meta.dirty {
                return Ok(());
            }
            match meta.dev {
                Some(dev) => (dev, meta.block),
                None => return Ok(()),
            }
        };
        let sectors = self.sectors_per_block(dev, buf.size())?;
        let start = block
            .checked_mul(sectors)
            .ok_or(BufferError::Device(DeviceError::OutOfRange))?;
        {
            let data = guard.data();
            self.devices
                .submit(dev, Transfer::Write(&*data), sectors, start, 0)?;
        }
        let mut meta = buf.meta.lock();
        meta.dirty = false;
        meta.valid = true;
        Ok(())
    }

    /// 释放一次引用。先写回脏数据；引用归零时缓冲区进入闲置链表，
    /// 并唤醒一个等待者。
    ///
    /// 返回写回的结果，写回失败时引用照样释放。
    ///
    /// # Panics
    /// 缓冲区引用计数已经为 0 时 panic。
    pub fn release(&self, buf: Arc<Buffer>) -> Result<(), BufferError> {
        let flushed = self.write_back(&buf);
        if let Err(err) = &flushed {
            log::warn!("bcache: write back of {:?} failed: {:?}", buf, err);
        }

        let mut st = self.classes[buf.class].state.lock();
        let next = {
            let mut meta = buf.meta.lock();
            assert!(meta.count > 0, "releasing buffer {} with no references", buf.index);
            meta.count -= 1;
            if meta.count == 0 {
                st.idle.push_back(buf.index);
                st.waiters.pop()
            } else {
                None
            }
        };
        drop(st);

        if let Some(task) = next {
            sync::unblock(task, EOK);
        }
        flushed
    }
}
