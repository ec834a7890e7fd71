//! 引导阶段的物理内存清单
//!
//! 引导程序把可用内存区域交给内核，格式有两种，靠 magic 区分：
//!
//! - 自带 loader（[`LOADER_MAGIC`]）：`u32` 条目数，随后是紧凑排列的
//!   20 字节条目 `{base: u64, size: u64, kind: u32}`
//! - Multiboot2（[`MULTIBOOT2_MAGIC`]）：`{total_size: u32, reserved: u32}` 头，
//!   随后是 8 字节对齐的 tag 序列；类型 6 为内存图，类型 0 结束
//!
//! 只认 `kind == 1`（可用 RAM）的区域，取其中最大的一块。

use crate::address::is_page_aligned;

/// 自带 loader 的 magic
pub const LOADER_MAGIC: u32 = 0x2022_0205;
/// Multiboot2 引导器放在 eax 中的 magic
pub const MULTIBOOT2_MAGIC: u32 = 0x36d7_6289;

const ZONE_AVAILABLE: u32 = 1;
const LOADER_ENTRY_SIZE: usize = 20;
const MB2_TAG_END: u32 = 0;
const MB2_TAG_MMAP: u32 = 6;

/// 一段连续的可用物理内存
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryRegion {
    /// 起始物理地址
    pub base: usize,
    /// 字节数
    pub size: usize,
}

impl MemoryRegion {
    /// 结束物理地址（不含）
    pub const fn end(&self) -> usize {
        self.base + self.size
    }
}

/// 解析内存清单时的错误
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootInfoError {
    /// 无法识别的 magic
    UnknownMagic(u32),
    /// 数据在声明的长度之前结束
    Truncated,
    /// 没有任何可用 RAM 区域
    NoUsableMemory,
    /// 选中的区域没有按页对齐
    Unaligned(MemoryRegion),
    /// 选中的区域容纳不下内核区域
    TooSmall(MemoryRegion),
}

/// 小端字节读取游标
struct Reader<'a> {
    data: &'a [u8],
}

impl<'a> Reader<'a> {
    fn bytes(&self, offset: usize, len: usize) -> Result<&'a [u8], BootInfoError> {
        self.data
            .get(offset..offset.checked_add(len).ok_or(BootInfoError::Truncated)?)
            .ok_or(BootInfoError::Truncated)
    }

    fn u32_at(&self, offset: usize) -> Result<u32, BootInfoError> {
        let b = self.bytes(offset, 4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn u64_at(&self, offset: usize) -> Result<u64, BootInfoError> {
        let lo = self.u32_at(offset)? as u64;
        let hi = self.u32_at(offset + 4)? as u64;
        Ok(lo | (hi << 32))
    }
}

/// 从引导信息中选出最大的可用内存区域
pub fn parse_memory_region(magic: u32, info: &[u8]) -> Result<MemoryRegion, BootInfoError> {
    let reader = Reader { data: info };
    let mut best: Option<MemoryRegion> = None;
    let mut consider = |base: u64, size: u64, kind: u32| {
        log::debug!("memory zone base {:#x} size {:#x} type {}", base, size, kind);
        if kind != ZONE_AVAILABLE {
            return;
        }
        // 超出地址宽度的部分不可用
        let (Ok(base), Ok(size)) = (usize::try_from(base), usize::try_from(size)) else {
            return;
        };
        if best.is_none_or(|b| size > b.size) {
            best = Some(MemoryRegion { base, size });
        }
    };

    match magic {
        LOADER_MAGIC => {
            let count = reader.u32_at(0)? as usize;
            for i in 0..count {
                let off = 4 + i * LOADER_ENTRY_SIZE;
                consider(
                    reader.u64_at(off)?,
                    reader.u64_at(off + 8)?,
                    reader.u32_at(off + 16)?,
                );
            }
        }
        MULTIBOOT2_MAGIC => {
            let total = reader.u32_at(0)? as usize;
            if total > info.len() {
                return Err(BootInfoError::Truncated);
            }
            let mut tag = 8;
            loop {
                let ty = reader.u32_at(tag)?;
                let size = reader.u32_at(tag + 4)? as usize;
                if ty == MB2_TAG_END {
                    break;
                }
                if size < 8 {
                    return Err(BootInfoError::Truncated);
                }
                if ty == MB2_TAG_MMAP {
                    let entry_size = reader.u32_at(tag + 8)? as usize;
                    if entry_size < 20 {
                        return Err(BootInfoError::Truncated);
                    }
                    let mut entry = tag + 16;
                    while entry + entry_size <= tag + size {
                        consider(
                            reader.u64_at(entry)?,
                            reader.u64_at(entry + 8)?,
                            reader.u32_at(entry + 16)?,
                        );
                        entry += entry_size;
                    }
                }
                tag = (tag + size + 7) & !7;
                if tag >= total {
                    break;
                }
            }
        }
        other => return Err(BootInfoError::UnknownMagic(other)),
    }

    let region = best.ok_or(BootInfoError::NoUsableMemory)?;
    if !is_page_aligned(region.base) || !is_page_aligned(region.size) {
        return Err(BootInfoError::Unaligned(region));
    }
    Ok(region)
}
