//! 地址空间
//!
//! [`AddressSpace`] 拥有一个页目录帧。内核区域的页目录项（前
//! [`KERNEL_DIR_ENTRIES`] 项）在所有地址空间之间共享，用户区域的页表和页
//! 在 fork 后以写时复制的方式共享：
//!
//! - [`AddressSpace::duplicate`] 把父空间中存在的用户页目录项和非共享页表项
//!   置为只读，并为每张页表和每个页帧增加一次引用，然后复制页目录；
//! - 写入时先在页目录一级复制页表（[`AddressSpace::resolve_cow`]），再在页表
//!   一级复制页帧。只剩一个引用时直接恢复可写，不复制。
//!
//! 页帧的引用数等于映射它的地址空间数；页表帧的引用数等于引用它的页目录数。

use crate::address::{Ppn, Vpn};
use crate::arch_ops::arch_ops;
use crate::config::{
    KERNEL_DIR_ENTRIES, PAGE_SIZE, PAGE_TABLE_ENTRIES, USER_DIR_END, USER_EXEC_ADDR,
};
use crate::page_table::{PageTable, PagingError, PagingResult, Pte, PteFlags};
use crate::phys_memory::{PhysMemory, copy_frame};

/// 一个页目录及其下挂的页表
pub struct AddressSpace<'m> {
    mem: &'m PhysMemory,
    root: Ppn,
    kernel: bool,
}

impl<'m> AddressSpace<'m> {
    /// 创建内核地址空间，预先分配内核区域的全部页表，
    /// 之后创建的用户空间直接共享这些页表。
    pub fn new_kernel(mem: &'m PhysMemory) -> Self {
        let root = mem.alloc_zeroed_frame();
        let dir = PageTable::at(root);
        for didx in 0..KERNEL_DIR_ENTRIES {
            let table = mem.alloc_zeroed_frame();
            dir.set(didx, Pte::new(table, PteFlags::PRESENT | PteFlags::WRITABLE));
        }
        log::debug!("kernel address space root {}", root);
        AddressSpace {
            mem,
            root,
            kernel: true,
        }
    }

    /// 创建空的用户地址空间，共享 `kernel` 的内核区域页目录项
    pub fn new_user(kernel: &AddressSpace<'m>) -> Self {
        let mem = kernel.mem;
        let root = mem.alloc_zeroed_frame();
        let dir = PageTable::at(root);
        let kdir = kernel.dir();
        for didx in 0..KERNEL_DIR_ENTRIES {
            dir.set(didx, kdir.get(didx));
        }
        AddressSpace {
            mem,
            root,
            kernel: false,
        }
    }

    /// 页目录所在帧
    pub fn root(&self) -> Ppn {
        self.root
    }

    /// 页帧来源
    pub fn memory(&self) -> &'m PhysMemory {
        self.mem
    }

    /// 是否是内核地址空间
    pub fn is_kernel(&self) -> bool {
        self.kernel
    }

    /// 切换到该地址空间
    pub fn activate(&self) {
        arch_ops().activate(self.root.start_addr());
    }

    fn dir(&self) -> PageTable {
        PageTable::at(self.root)
    }

    fn is_user_dir(didx: usize) -> bool {
        (KERNEL_DIR_ENTRIES..USER_DIR_END).contains(&didx)
    }

    fn base_flags(vaddr: usize) -> PteFlags {
        if vaddr >= USER_EXEC_ADDR {
            PteFlags::PRESENT | PteFlags::WRITABLE | PteFlags::USER
        } else {
            PteFlags::PRESENT | PteFlags::WRITABLE
        }
    }

    /// 地址对应的页表项；页表不存在时返回 `None`。不做写时复制。
    pub fn entry(&self, vaddr: usize) -> Option<Pte> {
        let vpn = Vpn::floor(vaddr);
        let dirent = self.dir().get(vpn.dir_index());
        if !dirent.is_present() {
            return None;
        }
        Some(PageTable::at(dirent.ppn()).get(vpn.table_index()))
    }

    /// 虚拟地址到物理地址；未映射时返回 `None`
    pub fn translate(&self, vaddr: usize) -> Option<usize> {
        self.entry(vaddr)
            .filter(|pte| pte.is_present())
            .map(|pte| pte.ppn().start_addr() + vaddr % PAGE_SIZE)
    }

    /// 按用户态访问检查一页：页目录项和页表项都必须存在且对用户可见，
    /// 写访问还要求两级都可写。成功时返回物理地址。
    pub fn user_access(&self, vaddr: usize, write: bool) -> PagingResult<usize> {
        let vpn = Vpn::floor(vaddr);
        let dirent = self.dir().get(vpn.dir_index());
        if !dirent.is_present() {
            return Err(PagingError::NotMapped);
        }
        let pte = PageTable::at(dirent.ppn()).get(vpn.table_index());
        if !pte.is_present() {
            return Err(PagingError::NotMapped);
        }
        let user = dirent.flags() & pte.flags();
        if !user.contains(PteFlags::USER) || (write && !user.contains(PteFlags::WRITABLE)) {
            return Err(PagingError::PermissionDenied);
        }
        Ok(pte.ppn().start_addr() + vaddr % PAGE_SIZE)
    }

    /// `[vaddr, vaddr + len)` 中每一页是否都允许这次用户态访问
    pub fn check_access(&self, vaddr: usize, len: usize, write: bool) -> bool {
        if len == 0 {
            return true;
        }
        let Some(last) = vaddr.checked_add(len - 1) else {
            return false;
        };
        (Vpn::floor(vaddr).0..=Vpn::floor(last).0)
            .all(|vpn| self.user_access(Vpn(vpn).start_addr(), write).is_ok())
    }

    /// 页目录一级的写时复制：确保 `didx` 指向的页表只属于本空间且可写。
    fn privatize_table(&mut self, didx: usize) -> PageTable {
        let dir = self.dir();
        let dirent = dir.get(didx);
        if dirent.is_writable() {
            return PageTable::at(dirent.ppn());
        }
        let old = dirent.ppn();
        let table = if self.mem.frame_refs(old) == 1 {
            old
        } else {
            let copy = self.mem.alloc_frame();
            copy_frame(copy, old);
            self.mem.free_frame(old);
            log::debug!("copy page table {} -> {}", old, copy);
            copy
        };
        dir.set(didx, Pte::new(table, dirent.flags() | PteFlags::WRITABLE));
        arch_ops().flush_tlb(Vpn(didx * PAGE_TABLE_ENTRIES).start_addr());
        PageTable::at(table)
    }

    /// 可修改的页表，不存在时创建
    fn table_for_update(&mut self, vpn: Vpn) -> PageTable {
        let didx = vpn.dir_index();
        let dir = self.dir();
        let dirent = dir.get(didx);
        if !dirent.is_present() {
            let table = self.mem.alloc_zeroed_frame();
            dir.set(didx, Pte::new(table, Self::base_flags(vpn.start_addr())));
            return PageTable::at(table);
        }
        self.privatize_table(didx)
    }

    /// 在 `[vaddr, vaddr + count 页)` 内建立映射时，页表本身最多还要分配的帧数：
    /// 缺失的页表各需一帧，被写保护且仍共享的页表复制时也需一帧。
    pub fn table_frames_needed(&self, vaddr: usize, count: usize) -> usize {
        if count == 0 {
            return 0;
        }
        let first = Vpn::floor(vaddr);
        let last = Vpn(first.0 + count - 1);
        let dir = self.dir();
        (first.dir_index()..=last.dir_index())
            .filter(|&didx| {
                let dirent = dir.get(didx);
                !dirent.is_present()
                    || (!dirent.is_writable() && self.mem.frame_refs(dirent.ppn()) > 1)
            })
            .count()
    }

    fn present_entry(&self, vaddr: usize) -> Option<Pte> {
        self.entry(vaddr).filter(|pte| pte.is_present())
    }

    fn install(&mut self, vpn: Vpn, frame: Option<Ppn>, flags: PteFlags) -> Ppn {
        let table = self.table_for_update(vpn);
        let ppn = frame.unwrap_or_else(|| self.mem.alloc_zeroed_frame());
        table.set(vpn.table_index(), Pte::new(ppn, flags | PteFlags::PRESENT));
        arch_ops().flush_tlb(vpn.start_addr());
        ppn
    }

    /// 把 `vaddr` 所在页映射到 `frame`，或新分配的一个清零帧。
    ///
    /// 已映射时返回 [`PagingError::AlreadyMapped`]，不改变原映射。
    pub fn map(&mut self, vaddr: usize, frame: Option<Ppn>, flags: PteFlags) -> PagingResult<Ppn> {
        if self.present_entry(vaddr).is_some() {
            return Err(PagingError::AlreadyMapped);
        }
        Ok(self.install(Vpn::floor(vaddr), frame, flags))
    }

    /// 按需分配：`vaddr` 所在页未映射时映射一个清零帧，
    /// 已映射时保持不变。返回该页的帧号。
    pub fn link_page(&mut self, vaddr: usize) -> Ppn {
        match self.present_entry(vaddr) {
            Some(pte) => pte.ppn(),
            None => self.install(Vpn::floor(vaddr), None, Self::base_flags(vaddr)),
        }
    }

    /// 修改已映射页的标志位，帧号不变
    pub fn update_flags(&mut self, vaddr: usize, flags: PteFlags) -> PagingResult<()> {
        let vpn = Vpn::floor(vaddr);
        match self.present_entry(vaddr) {
            Some(pte) => {
                let table = self.table_for_update(vpn);
                table.set(vpn.table_index(), pte.with_flags(flags | PteFlags::PRESENT));
                arch_ops().flush_tlb(vpn.start_addr());
                Ok(())
            }
            None => Err(PagingError::NotMapped),
        }
    }

    /// 取消 `vaddr` 所在页的映射并释放一次帧引用。
    ///
    /// 返回是否确实取消了一个映射。
    pub fn unmap(&mut self, vaddr: usize) -> bool {
        let vpn = Vpn::floor(vaddr);
        let Some(pte) = self.present_entry(vaddr) else {
            return false;
        };
        let table = self.table_for_update(vpn);
        table.set(vpn.table_index(), Pte::EMPTY);
        arch_ops().flush_tlb(vpn.start_addr());
        if self.mem.manages_frame(pte.ppn()) {
            self.mem.free_frame(pte.ppn());
        }
        true
    }

    /// fork：复制出一个与本空间共享全部用户页的新空间。
    ///
    /// 共享映射（[`PteFlags::SHARED`]）保持可写，父子双方写入互相可见。
    pub fn duplicate(&mut self) -> AddressSpace<'m> {
        let dir = self.dir();
        let ops = arch_ops();
        for didx in KERNEL_DIR_ENTRIES..USER_DIR_END {
            let dirent = dir.get(didx);
            if !dirent.is_present() {
                continue;
            }
            let table = PageTable::at(dirent.ppn());
            for (tidx, pte) in table.present() {
                if !pte.flags().contains(PteFlags::SHARED) && pte.is_writable() {
                    table.set(tidx, pte.with_flags(pte.flags() - PteFlags::WRITABLE));
                    ops.flush_tlb(Vpn(didx * PAGE_TABLE_ENTRIES + tidx).start_addr());
                }
                if self.mem.manages_frame(pte.ppn()) {
                    self.mem.retain_frame(pte.ppn());
                }
            }
            dir.set(didx, dirent.with_flags(dirent.flags() - PteFlags::WRITABLE));
            self.mem.retain_frame(dirent.ppn());
        }
        let root = self.mem.alloc_frame();
        copy_frame(root, self.root);
        log::debug!("duplicate address space {} -> {}", self.root, root);
        AddressSpace {
            mem: self.mem,
            root,
            kernel: false,
        }
    }

    /// 处理一次对已映射页的写保护错误。
    ///
    /// 先在页目录一级取得私有页表，再在页表一级取得私有页帧；
    /// 引用数为 1 时只恢复可写位。调用者负责确认该页本身允许写入。
    pub fn resolve_cow(&mut self, vaddr: usize) -> PagingResult<()> {
        let vpn = Vpn::floor(vaddr);
        let didx = vpn.dir_index();
        if !Self::is_user_dir(didx) {
            return Err(PagingError::InvalidAddress);
        }
        if !self.dir().get(didx).is_present() {
            return Err(PagingError::NotMapped);
        }
        let table = self.privatize_table(didx);
        let pte = table.get(vpn.table_index());
        if !pte.is_present() {
            return Err(PagingError::NotMapped);
        }
        if pte.is_writable() {
            return Ok(());
        }
        let old = pte.ppn();
        let frame = if self.mem.frame_refs(old) == 1 {
            old
        } else {
            let copy = self.mem.alloc_frame();
            copy_frame(copy, old);
            self.mem.free_frame(old);
            log::debug!("copy on write {:#x}: {} -> {}", vaddr, old, copy);
            copy
        };
        table.set(
            vpn.table_index(),
            Pte::new(frame, pte.flags() | PteFlags::WRITABLE),
        );
        arch_ops().flush_tlb(vpn.start_addr());
        Ok(())
    }

    /// 以内核身份读取，不检查权限，也不触发写时复制
    pub fn read_bytes(&self, vaddr: usize, buf: &mut [u8]) -> PagingResult<()> {
        let mut done = 0;
        while done < buf.len() {
            let va = vaddr + done;
            let paddr = self.translate(va).ok_or(PagingError::NotMapped)?;
            let chunk = (PAGE_SIZE - va % PAGE_SIZE).min(buf.len() - done);
            let src = arch_ops().paddr_to_vaddr(paddr) as *const u8;
            // SAFETY: 区间位于一个已映射帧内
            unsafe {
                core::ptr::copy_nonoverlapping(src, buf[done..].as_mut_ptr(), chunk);
            }
            done += chunk;
        }
        Ok(())
    }

    /// 以内核身份写入目标帧。
    ///
    /// 不做写时复制，只应用于仍归本空间独占的页（例如刚建立的映射）。
    pub fn write_bytes(&self, vaddr: usize, data: &[u8]) -> PagingResult<()> {
        let mut done = 0;
        while done < data.len() {
            let va = vaddr + done;
            let paddr = self.translate(va).ok_or(PagingError::NotMapped)?;
            let chunk = (PAGE_SIZE - va % PAGE_SIZE).min(data.len() - done);
            let dst = arch_ops().paddr_to_vaddr(paddr) as *mut u8;
            // SAFETY: 同 read_bytes
            unsafe {
                core::ptr::copy_nonoverlapping(data[done..].as_ptr(), dst, chunk);
            }
            done += chunk;
        }
        Ok(())
    }
}

impl Drop for AddressSpace<'_> {
    fn drop(&mut self) {
        let dir = self.dir();
        let first = if self.kernel { 0 } else { KERNEL_DIR_ENTRIES };
        for didx in first..USER_DIR_END {
            let dirent = dir.get(didx);
            if !dirent.is_present() {
                continue;
            }
            let table = PageTable::at(dirent.ppn());
            for (_, pte) in table.present() {
                if self.mem.manages_frame(pte.ppn()) {
                    self.mem.free_frame(pte.ppn());
                }
            }
            self.mem.free_frame(table.ppn());
        }
        self.mem.free_frame(self.root);
        log::debug!("address space {} released", self.root);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_env::phys_memory;

    const HEAP: usize = USER_EXEC_ADDR + 0x10_0000;

    #[test]
    fn test_map_translate_unmap() {
        let mem = phys_memory(4, 32);
        let kernel = AddressSpace::new_kernel(mem);
        let mut space = AddressSpace::new_user(&kernel);
        let free = mem.free_frames();

        let ppn = space.link_page(HEAP + 0x123);
        assert_eq!(space.translate(HEAP + 0x123), Some(ppn.start_addr() + 0x123));
        // 一个页表 + 一个页
        assert_eq!(mem.free_frames(), free - 2);
        assert_eq!(space.link_page(HEAP), ppn);
        assert_eq!(
            space.map(HEAP, None, PteFlags::USER),
            Err(PagingError::AlreadyMapped)
        );
        assert!(space.check_access(HEAP, PAGE_SIZE, true));
        assert!(!space.check_access(HEAP, PAGE_SIZE + 1, false));

        assert!(space.unmap(HEAP));
        assert!(!space.unmap(HEAP));
        assert_eq!(space.translate(HEAP), None);
        assert_eq!(mem.free_frames(), free - 1);
    }

    #[test]
    fn test_new_page_is_zeroed() {
        let mem = phys_memory(4, 16);
        let kernel = AddressSpace::new_kernel(mem);
        let mut space = AddressSpace::new_user(&kernel);
        space.link_page(HEAP);
        space.write_bytes(HEAP, &[0xff; 64]).unwrap();
        assert!(space.unmap(HEAP));
        space.link_page(HEAP + PAGE_SIZE);
        let mut buf = [0xaa; 64];
        space.read_bytes(HEAP + PAGE_SIZE, &mut buf).unwrap();
        assert_eq!(buf, [0; 64]);
    }

    #[test]
    fn test_fork_shares_until_write() {
        let mem = phys_memory(4, 32);
        let kernel = AddressSpace::new_kernel(mem);
        let mut parent = AddressSpace::new_user(&kernel);
        let ppn = parent.link_page(HEAP);
        parent.write_bytes(HEAP, b"parent").unwrap();

        let mut child = parent.duplicate();
        assert_eq!(child.translate(HEAP), parent.translate(HEAP));
        assert_eq!(mem.frame_refs(ppn), 2);
        assert_eq!(parent.user_access(HEAP, true), Err(PagingError::PermissionDenied));
        assert!(child.user_access(HEAP, false).is_ok());

        child.resolve_cow(HEAP).unwrap();
        let copied = child.entry(HEAP).unwrap().ppn();
        assert_ne!(copied, ppn);
        assert_eq!(mem.frame_refs(ppn), 1);
        child.write_bytes(HEAP, b"child!").unwrap();

        let mut buf = [0; 6];
        parent.read_bytes(HEAP, &mut buf).unwrap();
        assert_eq!(&buf, b"parent");

        // 最后一个引用者直接恢复可写
        parent.resolve_cow(HEAP).unwrap();
        assert_eq!(parent.entry(HEAP).unwrap().ppn(), ppn);
        assert!(parent.user_access(HEAP, true).is_ok());
    }

    #[test]
    fn test_unmap_after_fork_drops_one_reference() {
        let mem = phys_memory(4, 32);
        let kernel = AddressSpace::new_kernel(mem);
        let mut parent = AddressSpace::new_user(&kernel);
        let ppn = parent.link_page(HEAP);
        parent.write_bytes(HEAP, b"parent").unwrap();

        let mut child = parent.duplicate();
        assert_eq!(mem.frame_refs(ppn), 2);
        assert!(child.unmap(HEAP));
        assert_eq!(mem.frame_refs(ppn), 1);
        assert_eq!(child.translate(HEAP), None);

        let mut buf = [0; 6];
        parent.read_bytes(HEAP, &mut buf).unwrap();
        assert_eq!(&buf, b"parent");
        assert_eq!(parent.translate(HEAP), Some(ppn.start_addr()));
    }

    #[test]
    fn test_table_frames_needed() {
        let mem = phys_memory(4, 32);
        let kernel = AddressSpace::new_kernel(mem);
        let mut parent = AddressSpace::new_user(&kernel);
        let span = PAGE_TABLE_ENTRIES * PAGE_SIZE;
        assert_eq!(parent.table_frames_needed(HEAP, 0), 0);
        assert_eq!(parent.table_frames_needed(HEAP, 1), 1);
        assert_eq!(parent.table_frames_needed(span * 5 - PAGE_SIZE, 2), 2);

        parent.link_page(HEAP);
        assert_eq!(parent.table_frames_needed(HEAP, 2), 0);
        // fork 之后页表被共享，写入前要复制
        let child = parent.duplicate();
        assert_eq!(child.table_frames_needed(HEAP, 1), 1);
    }

    #[test]
    fn test_shared_mapping_stays_writable_across_fork() {
        let mem = phys_memory(4, 32);
        let kernel = AddressSpace::new_kernel(mem);
        let mut parent = AddressSpace::new_user(&kernel);
        let flags = PteFlags::WRITABLE | PteFlags::USER | PteFlags::SHARED;
        let ppn = parent.map(HEAP, None, flags).unwrap();

        let mut child = parent.duplicate();
        // 页表被写保护，但页表项仍可写：写入前先私有化页表
        assert!(child.entry(HEAP).unwrap().is_writable());
        child.resolve_cow(HEAP).unwrap();
        assert_eq!(child.entry(HEAP).unwrap().ppn(), ppn);

        child.write_bytes(HEAP, b"shared").unwrap();
        let mut buf = [0; 6];
        parent.read_bytes(HEAP, &mut buf).unwrap();
        assert_eq!(&buf, b"shared");
    }

    #[test]
    fn test_drop_returns_every_frame() {
        let mem = phys_memory(4, 64);
        let kernel = AddressSpace::new_kernel(mem);
        let free = mem.free_frames();
        {
            let mut parent = AddressSpace::new_user(&kernel);
            for page in 0..8 {
                parent.link_page(HEAP + page * PAGE_SIZE);
            }
            parent.link_page(crate::config::USER_STACK_TOP - 1);
            let mut child = parent.duplicate();
            child.resolve_cow(HEAP).unwrap();
            drop(parent);
            child.link_page(HEAP + 9 * PAGE_SIZE);
        }
        assert_eq!(mem.free_frames(), free);
    }

    #[test]
    fn test_kernel_entries_are_shared() {
        let mem = phys_memory(4, 16);
        let mut kernel = AddressSpace::new_kernel(mem);
        let frame = mem.alloc_frame();
        kernel.map(0x2000, Some(frame), PteFlags::WRITABLE).unwrap();

        let user = AddressSpace::new_user(&kernel);
        assert_eq!(user.translate(0x2000), Some(frame.start_addr()));
        assert_eq!(user.user_access(0x2000, false), Err(PagingError::PermissionDenied));
        assert_eq!(
            AddressSpace::new_user(&kernel).resolve_cow(0x2000),
            Err(PagingError::InvalidAddress)
        );
    }
}
