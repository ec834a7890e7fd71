//! 页表模块
//!
//! 32 位两级页表：页目录与页表各 1024 项，每项 4 字节。表本身放在物理帧里，
//! 通过内核直接映射区访问；地址空间显式持有自己的页目录帧号，不依赖
//! 页目录自映射。

mod entry;
mod table;

pub use entry::{Pte, PteFlags};
pub(crate) use table::PageTable;

/// 分页操作中可能发生的错误
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PagingError {
    /// 虚拟地址未被映射
    NotMapped,
    /// 虚拟地址已被映射
    AlreadyMapped,
    /// 提供了无效的地址
    InvalidAddress,
    /// 映射存在，但权限不允许这次访问
    PermissionDenied,
}

/// 分页操作的结果类型
pub type PagingResult<T> = Result<T, PagingError>;
