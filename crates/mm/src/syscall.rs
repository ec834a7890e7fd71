//! 内存相关系统调用：brk / mmap / munmap
//!
//! 参数错误返回 [`MmError`]，系统调用分发层用 [`MmError::errno`] 转成负的
//! errno 返回给用户。

use uapi::errno::{EFAULT, EINVAL, ENOMEM, EPERM};
use uapi::mm::{MapFlags, ProtFlags};

use crate::address::{Vpn, is_page_aligned, pages_for};
use crate::arch_ops::arch_ops;
use crate::config::{PAGE_SIZE, USER_MMAP_ADDR, USER_STACK_BOTTOM};
use crate::file::MmFile;
use crate::page_table::PteFlags;
use crate::task::TaskMm;

/// 内存系统调用的错误
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MmError {
    /// 参数不合法
    InvalidArgument,
    /// 物理内存或 mmap 区域不足
    NoMemory,
    /// 内核任务不能调用
    NotPermitted,
    /// 用户地址不可访问
    BadAddress,
    /// 读取映射文件失败，携带文件返回的负 errno
    Io(isize),
}

impl MmError {
    /// 对应的负 errno
    pub fn errno(self) -> isize {
        match self {
            MmError::InvalidArgument => -EINVAL,
            MmError::NoMemory => -ENOMEM,
            MmError::NotPermitted => -EPERM,
            MmError::BadAddress => -EFAULT,
            MmError::Io(errno) => errno,
        }
    }
}

fn mmap_range(vaddr: usize, count: usize) -> bool {
    vaddr >= USER_MMAP_ADDR
        && count
            .checked_mul(PAGE_SIZE)
            .and_then(|len| vaddr.checked_add(len))
            .is_some_and(|end| end <= USER_STACK_BOTTOM)
}

impl TaskMm<'_> {
    /// 移动程序断点到 `new_brk`（页对齐，位于 `[映像末尾, USER_MMAP_ADDR]`）。
    ///
    /// 收缩时立即释放被截掉的页；增长时只检查空闲帧是否够用，
    /// 页在首次访问时由缺页处理分配。
    pub fn brk(&mut self, new_brk: usize) -> Result<(), MmError> {
        log::debug!("task brk {:#x}", new_brk);
        if self.is_privileged() {
            log::warn!("brk from a kernel task");
            return Err(MmError::NotPermitted);
        }
        if !is_page_aligned(new_brk) || new_brk < self.end || new_brk > USER_MMAP_ADDR {
            log::warn!("brk {:#x} out of [{:#x}, {:#x}]", new_brk, self.end, USER_MMAP_ADDR);
            return Err(MmError::InvalidArgument);
        }
        let old = self.brk;
        if new_brk < old {
            for page in (new_brk..old).step_by(PAGE_SIZE) {
                self.space.unmap(page);
            }
        } else if (new_brk - old) / PAGE_SIZE > self.space.memory().free_frames() {
            return Err(MmError::NoMemory);
        }
        self.brk = new_brk;
        Ok(())
    }

    /// 建立匿名或文件映射，返回映射起始地址。
    ///
    /// `addr` 为 0 时在 mmap 区域中挑选一段空闲区间，否则必须整段落在 mmap
    /// 区域内且不与已有映射重叠。页立即分配并清零；给出 `file` 时从 `offset`
    /// 处读入映射长度的内容。
    pub fn mmap(
        &mut self,
        addr: usize,
        length: usize,
        prot: ProtFlags,
        flags: MapFlags,
        file: Option<&dyn MmFile>,
        offset: usize,
    ) -> Result<usize, MmError> {
        if length == 0 || !is_page_aligned(addr) {
            return Err(MmError::InvalidArgument);
        }
        let count = pages_for(length);
        if addr != 0 && !mmap_range(addr, count) {
            return Err(MmError::InvalidArgument);
        }
        let vaddr = if addr == 0 {
            match self.vmap.try_reserve(count) {
                Some(vpn) => vpn.start_addr(),
                None => {
                    log::warn!("mmap area exhausted for {} pages", count);
                    return Err(MmError::NoMemory);
                }
            }
        } else {
            if (0..count).any(|i| self.vmap.is_reserved(Vpn::floor(addr + i * PAGE_SIZE), 1)) {
                log::warn!("mmap {:#x} overlaps an existing mapping", addr);
                return Err(MmError::InvalidArgument);
            }
            self.vmap.reserve_at(Vpn::floor(addr), count);
            addr
        };
        // 页本身加上可能要新建或复制的页表
        let needed = count + self.space.table_frames_needed(vaddr, count);
        if needed > self.space.memory().free_frames() {
            self.vmap.release(Vpn::floor(vaddr), count);
            return Err(MmError::NoMemory);
        }

        let mut entry = PteFlags::PRESENT | PteFlags::USER;
        if prot.contains(ProtFlags::WRITE) {
            entry |= PteFlags::WRITABLE;
        } else {
            entry |= PteFlags::READONLY;
        }
        if flags.contains(MapFlags::SHARED) {
            entry |= PteFlags::SHARED;
        }
        if flags.contains(MapFlags::PRIVATE) {
            entry |= PteFlags::PRIVATE;
        }
        for i in 0..count {
            let page = vaddr + i * PAGE_SIZE;
            self.space.link_page(page);
            self.space
                .update_flags(page, entry)
                .map_err(|_| MmError::InvalidArgument)?;
        }

        if let Some(file) = file {
            if let Err(err) = self.fill_from_file(vaddr, length, file, offset) {
                self.unmap_pages(vaddr, count);
                return Err(err);
            }
        }
        log::debug!("mmap {:#x} pages {} prot {:?} flags {:?}", vaddr, count, prot, flags);
        Ok(vaddr)
    }

    fn fill_from_file(
        &mut self,
        vaddr: usize,
        length: usize,
        file: &dyn MmFile,
        offset: usize,
    ) -> Result<(), MmError> {
        let mut done = 0;
        while done < length {
            let chunk = PAGE_SIZE.min(length - done);
            let paddr = self
                .space
                .translate(vaddr + done)
                .ok_or(MmError::BadAddress)?;
            let kva = arch_ops().paddr_to_vaddr(paddr) as *mut u8;
            // SAFETY: 页刚由本次 mmap 建立，位于直接映射区
            let page = unsafe { core::slice::from_raw_parts_mut(kva, chunk) };
            let read = file.read_at(offset + done, page).map_err(MmError::Io)?;
            if read < chunk {
                break;
            }
            done += chunk;
        }
        Ok(())
    }

    fn unmap_pages(&mut self, vaddr: usize, count: usize) {
        for i in 0..count {
            self.space.unmap(vaddr + i * PAGE_SIZE);
        }
        self.vmap.release(Vpn::floor(vaddr), count);
    }

    /// 取消 `[addr, addr + length)` 的映射。区间必须完全由 mmap 建立。
    pub fn munmap(&mut self, addr: usize, length: usize) -> Result<(), MmError> {
        if length == 0 || !is_page_aligned(addr) {
            return Err(MmError::InvalidArgument);
        }
        let count = pages_for(length);
        if !mmap_range(addr, count) || !self.vmap.is_reserved(Vpn::floor(addr), count) {
            log::warn!("munmap of unmapped range {:#x} pages {}", addr, count);
            return Err(MmError::InvalidArgument);
        }
        self.unmap_pages(addr, count);
        Ok(())
    }
}
