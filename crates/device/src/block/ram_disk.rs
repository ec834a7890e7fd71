//! 内存模拟块设备

use alloc::vec;
use alloc::vec::Vec;

use sync::SpinLock;

use super::{BlockDriver, DeviceError, SECTOR_SIZE};

/// 内存模拟的块设备，扇区大小固定为 512 字节
///
/// 用于测试，也可作为启动时的内存盘
pub struct RamDisk {
    data: SpinLock<Vec<u8>>,
}

impl RamDisk {
    /// 创建 `sectors` 个扇区、内容全零的内存磁盘
    pub fn new(sectors: usize) -> Self {
        Self::from_bytes(vec![0u8; sectors * SECTOR_SIZE])
    }

    /// 从字节数组创建，长度必须是扇区大小的整数倍
    pub fn from_bytes(data: Vec<u8>) -> Self {
        assert!(data.len() % SECTOR_SIZE == 0, "ramdisk size not sector aligned");
        Self {
            data: SpinLock::new(data),
        }
    }

    /// 获取原始数据（用于调试）
    pub fn raw_data(&self) -> Vec<u8> {
        self.data.lock().clone()
    }

    fn span(&self, len: usize, sectors: usize, lba: usize) -> Result<core::ops::Range<usize>, DeviceError> {
        let bytes = sectors.checked_mul(SECTOR_SIZE).ok_or(DeviceError::OutOfRange)?;
        if len < bytes {
            return Err(DeviceError::BadBuffer);
        }
        let start = lba.checked_mul(SECTOR_SIZE).ok_or(DeviceError::OutOfRange)?;
        let end = start.checked_add(bytes).ok_or(DeviceError::OutOfRange)?;
        if end > self.data.lock().len() {
            return Err(DeviceError::OutOfRange);
        }
        Ok(start..end)
    }
}

impl BlockDriver for RamDisk {
    fn sector_count(&self) -> usize {
        self.data.lock().len() / SECTOR_SIZE
    }

    fn read(&self, buf: &mut [u8], sectors: usize, lba: usize, _flags: u32) -> Result<(), DeviceError> {
        let span = self.span(buf.len(), sectors, lba)?;
        let len = span.len();
        buf[..len].copy_from_slice(&self.data.lock()[span]);
        Ok(())
    }

    fn write(&self, buf: &[u8], sectors: usize, lba: usize, _flags: u32) -> Result<(), DeviceError> {
        let span = self.span(buf.len(), sectors, lba)?;
        let len = span.len();
        self.data.lock()[span].copy_from_slice(&buf[..len]);
        Ok(())
    }
}
