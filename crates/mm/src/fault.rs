//! 缺页处理
//!
//! 按以下顺序分类一次缺页：
//!
//! 1. 地址不在 `[USER_EXEC_ADDR, USER_STACK_TOP)` 内：段错误，终止任务；
//!    内核任务出现这种缺页说明内核本身有错，直接 panic。
//! 2. 页存在且是写访问：以只读方式 mmap 的页终止任务，其余按写时复制处理。
//! 3. 页不存在，且地址低于程序断点或位于用户栈内：分配一个清零页。
//! 4. 其他情况无法处理，panic。

use bitflags::bitflags;

use crate::config::{USER_EXEC_ADDR, USER_STACK_BOTTOM, USER_STACK_TOP};
use crate::page_table::PteFlags;
use crate::task::TaskMm;

bitflags! {
    /// 处理器压入的缺页错误码
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PageFaultCode: u32 {
        /// 页存在（保护错误）；否则是缺页
        const PRESENT = 1 << 0;
        /// 写访问
        const WRITE = 1 << 1;
        /// 用户态访问
        const USER = 1 << 2;
        /// 保留位被置位
        const RESERVED = 1 << 3;
        /// 取指
        const FETCH = 1 << 4;
        /// 保护键违例
        const PROTECTION_KEY = 1 << 5;
        /// 影子栈访问
        const SHADOW_STACK = 1 << 6;
        /// SGX 访问控制
        const SGX = 1 << 15;
    }
}

/// 缺页处理结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultResolution {
    /// 已修复，重新执行触发指令
    Resolved,
    /// 非法访问，任务应以 -1 退出
    Terminate,
}

/// 这次缺页能否由 [`handle_page_fault`] 修复（分类 2 中的写时复制，或分类 3）。
///
/// 内核代替用户访问内存前先用它筛掉非法地址，避免把非法访问当成内核缺页。
pub fn is_resolvable(task: &TaskMm<'_>, vaddr: usize, code: PageFaultCode) -> bool {
    if !(USER_EXEC_ADDR..USER_STACK_TOP).contains(&vaddr) {
        return false;
    }
    if code.contains(PageFaultCode::PRESENT) {
        code.contains(PageFaultCode::WRITE)
            && task
                .space()
                .entry(vaddr)
                .is_some_and(|pte| !pte.flags().contains(PteFlags::READONLY))
    } else {
        vaddr < task.current_brk() || vaddr >= USER_STACK_BOTTOM
    }
}

/// 处理 `task` 在 `vaddr` 处的一次缺页
///
/// # Panics
/// 内核任务访问用户区域之外的地址，或缺页无法归入任何一类时 panic。
pub fn handle_page_fault(task: &mut TaskMm<'_>, vaddr: usize, code: PageFaultCode) -> FaultResolution {
    log::trace!("page fault at {:#x}, code {:?}", vaddr, code);

    if !(USER_EXEC_ADDR..USER_STACK_TOP).contains(&vaddr) {
        if task.is_privileged() {
            log::error!("kernel task faulted at {:#x}, code {:?}", vaddr, code);
            panic!("Page Fault in kernel task at {:#x}", vaddr);
        }
        log::warn!("Segmentation Fault at {:#x}", vaddr);
        return FaultResolution::Terminate;
    }

    if code.contains(PageFaultCode::PRESENT) {
        if code.contains(PageFaultCode::WRITE) {
            let readonly = task
                .space()
                .entry(vaddr)
                .is_some_and(|pte| pte.flags().contains(PteFlags::READONLY));
            if readonly {
                log::warn!("write to read-only mapping at {:#x}", vaddr);
                return FaultResolution::Terminate;
            }
            match task.space_mut().resolve_cow(vaddr) {
                Ok(()) => return FaultResolution::Resolved,
                Err(err) => log::error!("copy on write at {:#x} failed: {:?}", vaddr, err),
            }
        }
    } else if vaddr < task.current_brk() || vaddr >= USER_STACK_BOTTOM {
        task.space_mut().link_page(vaddr);
        return FaultResolution::Resolved;
    }

    log::error!("unhandled page fault at {:#x}, code {:?}", vaddr, code);
    panic!("Page Fault!!! vaddr {:#x} code {:?}", vaddr, code);
}
