//! 内存管理子系统
//!
//! 提供物理帧与内核页分配、内核堆、两级页表地址空间（含 fork 写时复制）、
//! 缺页处理以及 brk / mmap / munmap 系统调用。
//!
//! # 架构解耦
//!
//! 通过 [`ArchMmOps`] 与架构特定组件解耦：直接映射区地址转换、TLB 失效和
//! 页目录切换。使用前必须调用 [`register_arch_ops`] 注册实现；锁所需的中断
//! 控制由 `sync` crate 的注册负责。
//!
//! # 布局
//!
//! 所有布局常量见 [`config`]。

#![no_std]

extern crate alloc;

mod arch_ops;
mod file;

pub mod address;
pub mod address_space;
pub mod boot_info;
pub mod config;
pub mod fault;
pub mod frame_allocator;
pub mod heap;
pub mod page_table;
pub mod phys_memory;
pub mod range_allocator;
pub mod syscall;
pub mod task;
pub mod uaccess;

pub use arch_ops::{ArchMmOps, arch_ops, register_arch_ops};
pub use file::MmFile;

pub use address::{Ppn, Vpn};
pub use address_space::AddressSpace;
pub use boot_info::{BootInfoError, MemoryRegion};
pub use fault::{FaultResolution, PageFaultCode, handle_page_fault};
pub use heap::{KERNEL_HEAP, KernelHeap, kfree, kmalloc};
pub use page_table::{PagingError, PagingResult, Pte, PteFlags};
pub use phys_memory::{
    PHYS_MEMORY, PhysMemory, alloc_frame, alloc_kernel_pages, free_frame, free_kernel_pages, init,
};
pub use syscall::MmError;
pub use task::TaskMm;
pub use uaccess::{copy_from_user, copy_to_user};
