//! 块设备层
//!
//! - [`BlockDriver`]：块设备驱动接口，按扇区读写
//! - [`DeviceTable`]：设备表，管理磁盘与分区，并为每块磁盘维护一条
//!   按扫描顺序（电梯算法）分派的请求队列
//! - [`RamDisk`]：内存模拟磁盘
//!
//! 请求排队时会阻塞提交者，依赖 `sync` crate 注册的调度器钩子。

#![no_std]

extern crate alloc;

pub mod block;
pub mod registry;

pub use block::request::{Direction, RequestId, RequestQueue};
pub use block::{BlockDriver, DeviceError, RamDisk, SECTOR_SIZE};
pub use registry::{BLOCK_DEVICES, BlockDevice, DeviceId, DeviceTable, Transfer, submit_request};
