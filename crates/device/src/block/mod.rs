//! 块设备模块
//!
//! 包含块设备驱动接口、按扇区排序的请求队列和内存模拟磁盘

mod ram_disk;
pub mod request;

use uapi::errno::{EINTR, EINVAL, EIO, ENODEV};

pub use ram_disk::RamDisk;

/// 默认扇区大小
pub const SECTOR_SIZE: usize = 512;

/// 块设备操作错误
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceError {
    /// 设备号不存在
    NoDevice,
    /// 设备不是磁盘（例如把分区当作父设备）
    NotADisk,
    /// 扇区范围越界
    OutOfRange,
    /// 缓冲区小于传输长度
    BadBuffer,
    /// 驱动报告的读写失败
    Io,
    /// 排队等待时被强行唤醒，携带唤醒状态码
    Interrupted(isize),
}

impl DeviceError {
    /// 对应的负 errno
    pub fn errno(self) -> isize {
        match self {
            DeviceError::NoDevice | DeviceError::NotADisk => -ENODEV,
            DeviceError::OutOfRange | DeviceError::BadBuffer => -EINVAL,
            DeviceError::Io => -EIO,
            DeviceError::Interrupted(_) => -EINTR,
        }
    }
}

/// 块设备驱动程序接口
///
/// 读写以扇区为单位，`lba` 是设备上的绝对扇区号。调用方保证同一设备上
/// 同一时刻只有一个请求在执行，驱动内部可以阻塞等待硬件完成。
pub trait BlockDriver: Send + Sync {
    /// 扇区大小（字节）
    fn sector_size(&self) -> usize {
        SECTOR_SIZE
    }

    /// 扇区总数
    fn sector_count(&self) -> usize;

    /// 从 `lba` 开始读取 `sectors` 个扇区到 `buf`
    fn read(&self, buf: &mut [u8], sectors: usize, lba: usize, flags: u32) -> Result<(), DeviceError>;

    /// 把 `buf` 的前 `sectors` 个扇区写到 `lba` 开始处
    fn write(&self, buf: &[u8], sectors: usize, lba: usize, flags: u32) -> Result<(), DeviceError>;
}
