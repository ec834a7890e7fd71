//! 页号抽象
//!
//! 地址本身以 `usize` 传递；页号用 [`Ppn`] / [`Vpn`] 两个新类型区分物理与虚拟，
//! 避免把帧号当成虚拟页号写进页表这一类错误。

use core::fmt;
use core::ops::{Add, Sub};

use crate::config::{PAGE_SHIFT, PAGE_SIZE, PAGE_TABLE_ENTRIES};

/// 为页号类型生成公共实现
macro_rules! impl_page_num {
    ($type:ident, $prefix:literal) => {
        impl $type {
            /// 地址所在页的页号（向下取整）
            pub const fn floor(addr: usize) -> Self {
                Self(addr >> PAGE_SHIFT)
            }

            /// 覆盖该地址所需的页号（向上取整）
            pub const fn ceil(addr: usize) -> Self {
                Self((addr + PAGE_SIZE - 1) >> PAGE_SHIFT)
            }

            /// 页的起始地址
            pub const fn start_addr(self) -> usize {
                self.0 << PAGE_SHIFT
            }

            /// 数值形式
            pub const fn as_usize(self) -> usize {
                self.0
            }
        }

        impl Add<usize> for $type {
            type Output = Self;

            fn add(self, rhs: usize) -> Self {
                Self(self.0 + rhs)
            }
        }

        impl Sub<$type> for $type {
            type Output = usize;

            fn sub(self, rhs: $type) -> usize {
                self.0 - rhs.0
            }
        }

        impl fmt::Display for $type {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!($prefix, "({:#x})"), self.0)
            }
        }
    };
}

/// 物理页号（帧号）
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Ppn(pub usize);

/// 虚拟页号
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Vpn(pub usize);

impl_page_num!(Ppn, "Ppn");
impl_page_num!(Vpn, "Vpn");

impl Vpn {
    /// 页目录中的下标（高 10 位）
    pub const fn dir_index(self) -> usize {
        self.0 / PAGE_TABLE_ENTRIES
    }

    /// 页表中的下标（中间 10 位）
    pub const fn table_index(self) -> usize {
        self.0 % PAGE_TABLE_ENTRIES
    }
}

/// 地址是否按页对齐
pub const fn is_page_aligned(addr: usize) -> bool {
    addr & (PAGE_SIZE - 1) == 0
}

/// 向下对齐到页边界
pub const fn page_align_down(addr: usize) -> usize {
    addr & !(PAGE_SIZE - 1)
}

/// 覆盖 `len` 字节所需的页数
pub const fn pages_for(len: usize) -> usize {
    len.div_ceil(PAGE_SIZE)
}
