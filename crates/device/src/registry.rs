//! 块设备表
//!
//! 设备号从 1 开始分配，0 保留为无效设备。分区是磁盘上的一段连续扇区，
//! 对分区的请求换算成父磁盘上的绝对扇区后，进入父磁盘的请求队列。

use alloc::string::{String, ToString};
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;

use lazy_static::lazy_static;
use sync::{SpinLock, TaskId};
use uapi::errno::EOK;

use crate::block::request::RequestQueue;
use crate::block::{BlockDriver, DeviceError};

/// 设备号
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceId(pub usize);

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "dev{}", self.0)
    }
}

/// 一次传输的方向和缓冲区
pub enum Transfer<'a> {
    /// 从设备读入
    Read(&'a mut [u8]),
    /// 写到设备
    Write(&'a [u8]),
}

impl Transfer<'_> {
    fn len(&self) -> usize {
        match self {
            Transfer::Read(buf) => buf.len(),
            Transfer::Write(buf) => buf.len(),
        }
    }
}

enum DeviceKind {
    Disk {
        driver: Arc<dyn BlockDriver>,
        queue: SpinLock<RequestQueue>,
    },
    Partition {
        parent: DeviceId,
        start: usize,
        count: usize,
    },
}

/// 已安装的块设备
pub struct BlockDevice {
    id: DeviceId,
    name: String,
    kind: DeviceKind,
}

impl BlockDevice {
    /// 设备号
    pub fn id(&self) -> DeviceId {
        self.id
    }

    /// 设备名
    pub fn name(&self) -> &str {
        &self.name
    }

    /// 父磁盘；磁盘本身返回 `None`
    pub fn parent(&self) -> Option<DeviceId> {
        match self.kind {
            DeviceKind::Disk { .. } => None,
            DeviceKind::Partition { parent, .. } => Some(parent),
        }
    }
}

/// 块设备表
pub struct DeviceTable {
    devices: SpinLock<Vec<Arc<BlockDevice>>>,
}

impl DeviceTable {
    /// 空设备表
    pub const fn new() -> Self {
        DeviceTable {
            devices: SpinLock::new(Vec::new()),
        }
    }

    fn install(&self, name: &str, kind: DeviceKind) -> DeviceId {
        let mut devices = self.devices.lock();
        let id = DeviceId(devices.len() + 1);
        devices.push(Arc::new(BlockDevice {
            id,
            name: name.to_string(),
            kind,
        }));
        log::info!("block device {} installed as {}", name, id);
        id
    }

    /// 安装一块磁盘
    pub fn install_disk(&self, name: &str, driver: Arc<dyn BlockDriver>) -> DeviceId {
        self.install(
            name,
            DeviceKind::Disk {
                driver,
                queue: SpinLock::new(RequestQueue::new()),
            },
        )
    }

    /// 在磁盘 `parent` 上安装分区，覆盖 `[start_sector, start_sector + sector_count)`
    pub fn install_partition(
        &self,
        parent: DeviceId,
        name: &str,
        start_sector: usize,
        sector_count: usize,
    ) -> Result<DeviceId, DeviceError> {
        let disk = self.get(parent)?;
        let DeviceKind::Disk { driver, .. } = &disk.kind else {
            return Err(DeviceError::NotADisk);
        };
        let end = start_sector
            .checked_add(sector_count)
            .ok_or(DeviceError::OutOfRange)?;
        if end > driver.sector_count() {
            return Err(DeviceError::OutOfRange);
        }
        Ok(self.install(
            name,
            DeviceKind::Partition {
                parent,
                start: start_sector,
                count: sector_count,
            },
        ))
    }

    /// 查找设备
    pub fn get(&self, dev: DeviceId) -> Result<Arc<BlockDevice>, DeviceError> {
        let devices = self.devices.lock();
        dev.0
            .checked_sub(1)
            .and_then(|idx| devices.get(idx))
            .cloned()
            .ok_or(DeviceError::NoDevice)
    }

    /// 按名字查找设备号
    pub fn find(&self, name: &str) -> Option<DeviceId> {
        self.devices
            .lock()
            .iter()
            .find(|d| d.name == name)
            .map(|d| d.id)
    }

    /// 已安装的设备数
    pub fn len(&self) -> usize {
        self.devices.lock().len()
    }

    /// 是否没有任何设备
    pub fn is_empty(&self) -> bool {
        self.devices.lock().is_empty()
    }

    /// 设备所在的磁盘，以及设备起始扇区在磁盘上的偏移
    fn disk_of(&self, dev: DeviceId) -> Result<(Arc<BlockDevice>, usize), DeviceError> {
        let device = self.get(dev)?;
        match device.kind {
            DeviceKind::Disk { .. } => Ok((device, 0)),
            DeviceKind::Partition { parent, start, .. } => Ok((self.get(parent)?, start)),
        }
    }

    fn driver_of(disk: &BlockDevice) -> Result<(&Arc<dyn BlockDriver>, &SpinLock<RequestQueue>), DeviceError> {
        match &disk.kind {
            DeviceKind::Disk { driver, queue } => Ok((driver, queue)),
            DeviceKind::Partition { .. } => Err(DeviceError::NotADisk),
        }
    }

    /// 扇区大小
    pub fn sector_size(&self, dev: DeviceId) -> Result<usize, DeviceError> {
        let (disk, _) = self.disk_of(dev)?;
        Ok(Self::driver_of(&disk)?.0.sector_size())
    }

    /// 设备第一个扇区在磁盘上的绝对扇区号；磁盘为 0
    pub fn sector_start(&self, dev: DeviceId) -> Result<usize, DeviceError> {
        Ok(self.disk_of(dev)?.1)
    }

    /// 设备扇区数
    pub fn sector_count(&self, dev: DeviceId) -> Result<usize, DeviceError> {
        let device = self.get(dev)?;
        match &device.kind {
            DeviceKind::Disk { driver, .. } => Ok(driver.sector_count()),
            DeviceKind::Partition { count, .. } => Ok(*count),
        }
    }

    /// 提交一次块设备请求并等待完成。
    ///
    /// `start` 是相对 `dev` 的起始扇区。设备空闲时立即执行；否则当前任务
    /// 阻塞，直到按扫描顺序轮到它。执行完毕后唤醒下一个被选中的请求。
    pub fn submit(
        &self,
        dev: DeviceId,
        transfer: Transfer<'_>,
        sectors: usize,
        start: usize,
        flags: u32,
    ) -> Result<(), DeviceError> {
        let (disk, offset) = self.disk_of(dev)?;
        let (driver, queue) = Self::driver_of(&disk)?;

        let end = start.checked_add(sectors).ok_or(DeviceError::OutOfRange)?;
        if end > self.sector_count(dev)? {
            return Err(DeviceError::OutOfRange);
        }
        let bytes = sectors
            .checked_mul(driver.sector_size())
            .ok_or(DeviceError::OutOfRange)?;
        if transfer.len() < bytes {
            return Err(DeviceError::BadBuffer);
        }

        let lba = offset + start;
        let me = sync::current_task();
        let (id, was_empty) = queue.lock().insert(lba, Some(me));
        log::debug!("{} request lba {} sectors {}", disk.id, lba, sectors);

        if !was_empty {
            while !queue.lock().is_selected(id) {
                if let Err(interrupted) = sync::block_current() {
                    let next = queue.lock().abort(id);
                    wake(next);
                    log::debug!("{} request lba {} interrupted", disk.id, lba);
                    return Err(DeviceError::Interrupted(interrupted.status()));
                }
            }
        }

        let ret = match transfer {
            Transfer::Read(buf) => driver.read(buf, sectors, lba, flags),
            Transfer::Write(buf) => driver.write(buf, sectors, lba, flags),
        };
        if let Err(err) = ret {
            log::warn!("{} lba {} failed: {:?}", disk.id, lba, err);
        }

        let next = queue.lock().complete(id);
        wake(next);
        ret
    }
}

impl Default for DeviceTable {
    fn default() -> Self {
        Self::new()
    }
}

fn wake(task: Option<TaskId>) {
    if let Some(task) = task {
        sync::unblock(task, EOK);
    }
}

lazy_static! {
    /// 全局块设备表
    pub static ref BLOCK_DEVICES: DeviceTable = DeviceTable::new();
}

/// 向全局设备表提交请求
pub fn submit_request(
    dev: DeviceId,
    transfer: Transfer<'_>,
    sectors: usize,
    start: usize,
    flags: u32,
) -> Result<(), DeviceError> {
    BLOCK_DEVICES.submit(dev, transfer, sectors, start, flags)
}
