//! mmap / munmap 相关标志

use bitflags::bitflags;

bitflags! {
    /// 映射区域的访问权限 (`PROT_*`)
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ProtFlags: u32 {
        const NONE = 0;
        const READ = 0x1;
        const WRITE = 0x2;
        const EXEC = 0x4;
    }
}

bitflags! {
    /// 映射类型 (`MAP_*`)
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MapFlags: u32 {
        const SHARED = 0x01;
        const PRIVATE = 0x02;
    }
}
