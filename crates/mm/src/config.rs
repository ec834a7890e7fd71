//! 内存布局常量
//!
//! 两级页表（10 + 10 + 12 位）下的虚拟地址空间划分：
//!
//! ```text
//! 0                KERNEL_MEMORY_SIZE   USER_MMAP_ADDR   USER_STACK_BOTTOM   USER_STACK_TOP
//! |  内核（所有地址空间共享）| 程序映像 + brk 堆 |  mmap 区域  |      用户栈       |
//! ```

/// 页大小的位数
pub const PAGE_SHIFT: usize = 12;
/// 页大小
pub const PAGE_SIZE: usize = 1 << PAGE_SHIFT;
/// 每张页表 / 页目录的表项数
pub const PAGE_TABLE_ENTRIES: usize = 1024;
/// 一个页目录项覆盖的字节数
pub const DIR_ENTRY_SPAN: usize = PAGE_SIZE * PAGE_TABLE_ENTRIES;

/// 可用物理内存的起始地址
pub const MEMORY_BASE: usize = 0x10_0000;

/// 内核区域大小，内核直接映射池也位于此范围内
pub const KERNEL_MEMORY_SIZE: usize = 0x100_0000;
/// 内核区域占用的页目录项数
pub const KERNEL_DIR_ENTRIES: usize = KERNEL_MEMORY_SIZE / DIR_ENTRY_SPAN;

/// 用户程序映像起始地址
pub const USER_EXEC_ADDR: usize = KERNEL_MEMORY_SIZE;
/// mmap 区域起始地址，也是 brk 的上限
pub const USER_MMAP_ADDR: usize = 0x800_0000;
/// 用户栈顶
pub const USER_STACK_TOP: usize = 0x1000_0000;
/// 用户栈大小
pub const USER_STACK_SIZE: usize = 0x20_0000;
/// 用户栈底，也是 mmap 区域的终点
pub const USER_STACK_BOTTOM: usize = USER_STACK_TOP - USER_STACK_SIZE;
/// 用户空间占用的页目录项上界（不含）
pub const USER_DIR_END: usize = USER_STACK_TOP / DIR_ENTRY_SPAN;

/// mmap 区域页数（每个任务的 mmap 位图大小）
pub const USER_MMAP_PAGES: usize = (USER_STACK_BOTTOM - USER_MMAP_ADDR) / PAGE_SIZE;
