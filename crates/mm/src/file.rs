//! 文件映射接口

/// 可被 mmap 映射的文件
///
/// 只需要按偏移读取；映射建立时一次性把内容读入新分配的页。
pub trait MmFile {
    /// 从 `offset` 读取至多 `buf.len()` 字节，返回实际读取的字节数。
    /// 读到文件末尾时返回的字节数可以小于缓冲区长度。
    ///
    /// 失败时返回负的 errno。
    fn read_at(&self, offset: usize, buf: &mut [u8]) -> Result<usize, isize>;
}
