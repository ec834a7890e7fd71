//! 内核与用户空间之间的数据复制
//!
//! 逐页检查用户地址；访问失败且缺页可以修复时交给 [`handle_page_fault`]，
//! 修复后重试，这样按需分配和写时复制对系统调用参数同样生效。
//! 无法修复的地址直接返回 [`MmError::BadAddress`]。

use crate::arch_ops::arch_ops;
use crate::config::PAGE_SIZE;
use crate::fault::{FaultResolution, PageFaultCode, handle_page_fault, is_resolvable};
use crate::page_table::PagingError;
use crate::syscall::MmError;
use crate::task::TaskMm;

/// 一页内最多重试的次数：一次缺页和一次写时复制
const MAX_ATTEMPTS: usize = 3;

fn user_page(task: &mut TaskMm<'_>, vaddr: usize, write: bool) -> Result<usize, MmError> {
    for _ in 0..MAX_ATTEMPTS {
        let mut code = PageFaultCode::USER;
        if write {
            code |= PageFaultCode::WRITE;
        }
        match task.space().user_access(vaddr, write) {
            Ok(paddr) => return Ok(paddr),
            Err(PagingError::PermissionDenied) => code |= PageFaultCode::PRESENT,
            Err(_) => {}
        }
        if !is_resolvable(task, vaddr, code) {
            log::debug!("bad user address {:#x}, code {:?}", vaddr, code);
            return Err(MmError::BadAddress);
        }
        if handle_page_fault(task, vaddr, code) == FaultResolution::Terminate {
            return Err(MmError::BadAddress);
        }
    }
    log::warn!("user access at {:#x} still failing after fault handling", vaddr);
    Err(MmError::BadAddress)
}

fn for_each_chunk(
    task: &mut TaskMm<'_>,
    vaddr: usize,
    len: usize,
    write: bool,
    mut f: impl FnMut(*mut u8, core::ops::Range<usize>),
) -> Result<(), MmError> {
    if vaddr.checked_add(len).is_none() {
        return Err(MmError::BadAddress);
    }
    let mut done = 0;
    while done < len {
        let va = vaddr + done;
        let chunk = (PAGE_SIZE - va % PAGE_SIZE).min(len - done);
        let paddr = user_page(task, va, write)?;
        f(arch_ops().paddr_to_vaddr(paddr) as *mut u8, done..done + chunk);
        done += chunk;
    }
    Ok(())
}

/// 把 `data` 写到用户地址 `vaddr`
pub fn copy_to_user(task: &mut TaskMm<'_>, vaddr: usize, data: &[u8]) -> Result<(), MmError> {
    for_each_chunk(task, vaddr, data.len(), true, |dst, range| {
        // SAFETY: dst 指向已确认可写的用户页，长度不跨页
        unsafe { core::ptr::copy_nonoverlapping(data[range.clone()].as_ptr(), dst, range.len()) }
    })
}

/// 从用户地址 `vaddr` 读满 `buf`
pub fn copy_from_user(task: &mut TaskMm<'_>, vaddr: usize, buf: &mut [u8]) -> Result<(), MmError> {
    for_each_chunk(task, vaddr, buf.len(), false, |src, range| {
        let len = range.len();
        // SAFETY: src 指向已确认可读的用户页，长度不跨页
        unsafe { core::ptr::copy_nonoverlapping(src, buf[range].as_mut_ptr(), len) }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address_space::AddressSpace;
    use crate::config::{USER_EXEC_ADDR, USER_MMAP_ADDR, USER_STACK_TOP};
    use uapi::mm::{MapFlags, ProtFlags};
    use crate::test_env::phys_memory;

    #[test]
    fn test_copy_faults_in_stack_pages() {
        let mem = phys_memory(4, 16);
        let kernel = AddressSpace::new_kernel(mem);
        let mut task = TaskMm::new(&kernel, USER_EXEC_ADDR + PAGE_SIZE, false);
        let at = USER_STACK_TOP - PAGE_SIZE - 10;
        copy_to_user(&mut task, at, b"across the page boundary").unwrap();

        let mut back = [0u8; 24];
        copy_from_user(&mut task, at, &mut back).unwrap();
        assert_eq!(&back, b"across the page boundary");
    }

    #[test]
    fn test_copy_to_user_breaks_sharing() {
        let mem = phys_memory(4, 32);
        let kernel = AddressSpace::new_kernel(mem);
        let mut parent = TaskMm::new(&kernel, USER_EXEC_ADDR + PAGE_SIZE, false);
        copy_to_user(&mut parent, USER_EXEC_ADDR, b"old").unwrap();
        let mut child = parent.fork();

        copy_to_user(&mut child, USER_EXEC_ADDR, b"new").unwrap();
        let mut buf = [0u8; 3];
        copy_from_user(&mut parent, USER_EXEC_ADDR, &mut buf).unwrap();
        assert_eq!(&buf, b"old");
        copy_from_user(&mut child, USER_EXEC_ADDR, &mut buf).unwrap();
        assert_eq!(&buf, b"new");
    }

    #[test]
    fn test_bad_user_address() {
        let mem = phys_memory(4, 16);
        let kernel = AddressSpace::new_kernel(mem);
        let mut task = TaskMm::new(&kernel, USER_EXEC_ADDR + PAGE_SIZE, false);
        assert_eq!(copy_to_user(&mut task, 0x1000, b"x"), Err(MmError::BadAddress));
        let mut buf = [0u8; 2];
        assert_eq!(
            copy_from_user(&mut task, usize::MAX, &mut buf),
            Err(MmError::BadAddress)
        );
    }

    #[test]
    fn test_unmapped_gap_is_bad_address() {
        let mem = phys_memory(4, 16);
        let kernel = AddressSpace::new_kernel(mem);
        let mut task = TaskMm::new(&kernel, USER_EXEC_ADDR + PAGE_SIZE, false);
        let free = mem.free_frames();

        // 断点之上、栈之下且没有 mmap 的地址
        let mut buf = [0u8; 4];
        assert_eq!(
            copy_from_user(&mut task, USER_MMAP_ADDR + 0x10000, &mut buf),
            Err(MmError::BadAddress)
        );
        assert_eq!(
            copy_to_user(&mut task, USER_EXEC_ADDR + PAGE_SIZE, b"gap"),
            Err(MmError::BadAddress)
        );
        assert_eq!(mem.free_frames(), free);
    }

    #[test]
    fn test_write_to_readonly_mapping_is_bad_address() {
        let mem = phys_memory(4, 16);
        let kernel = AddressSpace::new_kernel(mem);
        let mut task = TaskMm::new(&kernel, USER_EXEC_ADDR + PAGE_SIZE, false);
        let vaddr = task
            .mmap(0, PAGE_SIZE, ProtFlags::READ, MapFlags::PRIVATE, None, 0)
            .unwrap();
        assert_eq!(copy_to_user(&mut task, vaddr, b"x"), Err(MmError::BadAddress));
        let mut buf = [0xffu8; 1];
        copy_from_user(&mut task, vaddr, &mut buf).unwrap();
        assert_eq!(buf, [0]);
    }

    #[test]
    fn test_kernel_task_bad_address_does_not_panic() {
        let mem = phys_memory(4, 16);
        let kernel = AddressSpace::new_kernel(mem);
        let mut task = TaskMm::new(&kernel, USER_EXEC_ADDR + PAGE_SIZE, true);
        assert_eq!(copy_to_user(&mut task, 0x1000, b"x"), Err(MmError::BadAddress));
    }
}
