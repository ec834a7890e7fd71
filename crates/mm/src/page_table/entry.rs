//! 页表项

use core::fmt;

use bitflags::bitflags;

use crate::address::Ppn;

bitflags! {
    /// 页表项标志位（低 12 位）
    ///
    /// 第 9 到 11 位是留给软件的可用位，记录 mmap 的共享 / 私有 / 只读语义。
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PteFlags: u32 {
        /// 存在
        const PRESENT = 1 << 0;
        /// 可写
        const WRITABLE = 1 << 1;
        /// 用户态可访问
        const USER = 1 << 2;
        /// 写穿
        const WRITE_THROUGH = 1 << 3;
        /// 禁用缓存
        const NO_CACHE = 1 << 4;
        /// 已访问
        const ACCESSED = 1 << 5;
        /// 已写
        const DIRTY = 1 << 6;
        /// 页属性表
        const PAT = 1 << 7;
        /// 全局页
        const GLOBAL = 1 << 8;
        /// 共享映射，fork 时不做写时复制
        const SHARED = 1 << 9;
        /// 私有映射
        const PRIVATE = 1 << 10;
        /// 以只读方式映射，写入是保护错误而不是写时复制
        const READONLY = 1 << 11;
    }
}

const FLAG_MASK: u32 = 0xfff;
const MAX_PPN: usize = 1 << 20;

/// 页表项：高 20 位帧号 + 低 12 位标志
#[repr(transparent)]
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct Pte(u32);

impl Pte {
    /// 空表项
    pub const EMPTY: Pte = Pte(0);

    /// 指向 `ppn` 的表项
    pub fn new(ppn: Ppn, flags: PteFlags) -> Self {
        assert!(ppn.0 < MAX_PPN, "{} not addressable by a 32-bit entry", ppn);
        Pte(((ppn.0 as u32) << 12) | flags.bits())
    }

    /// 帧号
    pub fn ppn(self) -> Ppn {
        Ppn((self.0 >> 12) as usize)
    }

    /// 标志位
    pub fn flags(self) -> PteFlags {
        PteFlags::from_bits_truncate(self.0 & FLAG_MASK)
    }

    /// 是否存在
    pub fn is_present(self) -> bool {
        self.flags().contains(PteFlags::PRESENT)
    }

    /// 是否可写
    pub fn is_writable(self) -> bool {
        self.flags().contains(PteFlags::WRITABLE)
    }

    /// 替换标志位，保留帧号
    pub fn with_flags(self, flags: PteFlags) -> Self {
        Pte((self.0 & !FLAG_MASK) | flags.bits())
    }
}

impl fmt::Debug for Pte {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pte")
            .field("ppn", &self.ppn())
            .field("flags", &self.flags())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entry_packs_frame_and_flags() {
        let pte = Pte::new(Ppn(0x12345), PteFlags::PRESENT | PteFlags::USER | PteFlags::SHARED);
        assert_eq!(pte.ppn(), Ppn(0x12345));
        assert!(pte.is_present());
        assert!(!pte.is_writable());
        let rw = pte.with_flags(pte.flags() | PteFlags::WRITABLE);
        assert_eq!(rw.ppn(), Ppn(0x12345));
        assert!(rw.is_writable());
        assert!(rw.flags().contains(PteFlags::SHARED));
        assert!(!Pte::EMPTY.is_present());
    }
}
