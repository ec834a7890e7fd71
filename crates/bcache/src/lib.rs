//! 块缓冲区缓存
//!
//! 以 (设备, 块号) 为键缓存 1024 / 2048 / 4096 字节的磁盘块。
//! 缓冲区数据页取自内核页池，读写经设备表的请求队列下发。
//!
//! - [`BufferCache`]：缓存实例
//! - [`Buffer`]：缓冲区，[`Buffer::lock`] 后访问数据
//! - [`read_block`] / [`write_buffer`] / [`release_buffer`]：全局缓存的入口
//!
//! 使用前需注册 `sync` 的中断与调度钩子，以及 `mm` 的架构操作。

#![no_std]

extern crate alloc;

mod buffer;
mod cache;
mod idle_list;

use alloc::sync::Arc;

use device::{BLOCK_DEVICES, DeviceError, DeviceId};
use lazy_static::lazy_static;
use mm::PHYS_MEMORY;
use uapi::errno::{EINTR, EINVAL};

pub use buffer::{Buffer, BufferGuard};
pub use cache::{BLOCK_SIZES, BufferCache};

/// 缓存规模配置
#[derive(Debug, Clone, Copy)]
pub struct BufferCacheConfig {
    /// 每个大小类最多创建的缓冲区数
    pub max_buffers_per_class: usize,
}

impl Default for BufferCacheConfig {
    fn default() -> Self {
        BufferCacheConfig {
            max_buffers_per_class: 64,
        }
    }
}

/// 缓冲区缓存错误
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferError {
    /// 不支持的块大小
    UnsupportedSize(usize),
    /// 扇区大小与块大小不匹配
    UnsupportedGeometry {
        /// 设备扇区大小
        sector_size: usize,
        /// 请求的块大小
        block_size: usize,
    },
    /// 设备读写失败
    Device(DeviceError),
    /// 等待缓冲区时被强行唤醒
    Interrupted(isize),
}

impl BufferError {
    /// 对应的负 errno
    pub fn errno(self) -> isize {
        match self {
            BufferError::UnsupportedSize(_) | BufferError::UnsupportedGeometry { .. } => -EINVAL,
            BufferError::Device(err) => err.errno(),
            BufferError::Interrupted(_) => -EINTR,
        }
    }
}

impl From<DeviceError> for BufferError {
    fn from(err: DeviceError) -> Self {
        match err {
            DeviceError::Interrupted(status) => BufferError::Interrupted(status),
            err => BufferError::Device(err),
        }
    }
}

lazy_static! {
    /// 全局缓冲区缓存
    pub static ref BUFFER_CACHE: BufferCache<'static> =
        BufferCache::new(&PHYS_MEMORY, &BLOCK_DEVICES, BufferCacheConfig::default());
}

/// 从全局缓存读入一块
pub fn read_block(dev: DeviceId, block: usize, size: usize) -> Result<Arc<Buffer>, BufferError> {
    BUFFER_CACHE.read(dev, block, size)
}

/// 写回全局缓存中的缓冲区
pub fn write_buffer(buf: &Buffer) -> Result<(), BufferError> {
    BUFFER_CACHE.write_back(buf)
}

/// 释放全局缓存中的缓冲区
pub fn release_buffer(buf: Arc<Buffer>) -> Result<(), BufferError> {
    BUFFER_CACHE.release(buf)
}
