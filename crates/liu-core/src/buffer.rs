//! 可增长缓冲区.
//!
//! 读取器把任意大小的输入块追加到这里, 直到凑够一条完整记录.
//! `read_mark` 之前的字节已被消费, 不再对外暴露; `reset()` 把它们物理移除.
//!
//! ```text
//! 0            read_mark            written_size      capacity
//! |  已消费     |   未读 (ref_data)   |   空闲           |
//! ```

/// 首次分配的最小容量
const MIN_CAPACITY: usize = 64;

/// 追加写入、按水位线消费的字节缓冲区
#[derive(Debug, Default)]
pub struct GrowableBuffer {
    data: Vec<u8>,
    /// 已消费字节数, 始终 <= data.len()
    read_mark: usize,
}

impl GrowableBuffer {
    /// 创建空缓冲区
    pub fn new() -> Self {
        Self::default()
    }

    /// 追加数据, 容量不足时按倍增扩容
    pub fn append(&mut self, bytes: &[u8]) {
        let needed = self.data.len() + bytes.len();
        if needed > self.data.capacity() {
            let target = needed.max(self.data.capacity() * 2).max(MIN_CAPACITY);
            self.data.reserve_exact(target - self.data.len());
        }
        self.data.extend_from_slice(bytes);
    }

    /// 未读区域 `[read_mark, written_size)`
    pub fn ref_data(&self) -> &[u8] {
        &self.data[self.read_mark..]
    }

    /// 未读字节数
    pub fn ref_size(&self) -> usize {
        self.data.len() - self.read_mark
    }

    /// 标记 n 字节已读, 超出部分截断到 written_size
    pub fn mark_as_read(&mut self, n: usize) {
        self.read_mark = self.read_mark.saturating_add(n).min(self.data.len());
    }

    /// 移除已读前缀, 之后 read_mark = 0, written_size = 原未读字节数
    pub fn reset(&mut self) {
        if self.read_mark == 0 {
            return;
        }
        self.data.drain(..self.read_mark);
        self.read_mark = 0;
    }

    /// 丢弃全部内容
    pub fn clear(&mut self) {
        self.data.clear();
        self.read_mark = 0;
    }

    /// 已追加字节总数 (含已读部分)
    pub fn written_size(&self) -> usize {
        self.data.len()
    }

    pub fn read_mark(&self) -> usize {
        self.read_mark
    }

    pub fn capacity(&self) -> usize {
        self.data.capacity()
    }

    /// 是否没有未读数据
    pub fn is_empty(&self) -> bool {
        self.ref_size() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_buffer_追加与消费() {
        let mut buf = GrowableBuffer::new();
        buf.append(b"hello");
        buf.append(b" world");
        assert_eq!(buf.ref_data(), b"hello world");
        buf.mark_as_read(6);
        assert_eq!(buf.ref_data(), b"world");
        assert_eq!(buf.ref_size(), 5);
        assert_eq!(buf.written_size(), 11);
    }

    #[test]
    fn test_buffer_消费量截断() {
        let mut buf = GrowableBuffer::new();
        buf.append(&[1, 2, 3]);
        buf.mark_as_read(10);
        assert_eq!(buf.read_mark(), 3);
        assert!(buf.is_empty());
        buf.mark_as_read(usize::MAX);
        assert_eq!(buf.read_mark(), 3);
    }

    #[test]
    fn test_buffer_压缩() {
        let mut buf = GrowableBuffer::new();
        buf.append(&[1, 2, 3, 4, 5]);
        buf.mark_as_read(2);
        buf.reset();
        assert_eq!(buf.read_mark(), 0);
        assert_eq!(buf.written_size(), 3);
        assert_eq!(buf.ref_data(), &[3, 4, 5]);
        buf.clear();
        assert_eq!(buf.written_size(), 0);
    }

    #[test]
    fn test_buffer_倍增扩容() {
        let mut buf = GrowableBuffer::new();
        buf.append(&[0u8; 10]);
        assert!(buf.capacity() >= MIN_CAPACITY);
        let cap = buf.capacity();
        buf.append(&vec![0u8; cap]);
        assert!(buf.capacity() >= cap * 2);
    }

    #[test]
    fn test_buffer_水位不变式() {
        // 伪随机操作序列, 校验 read_mark <= written_size 且未读区不含已读字节
        let mut buf = GrowableBuffer::new();
        let mut seed = 0x2545_F491u32;
        let mut next = 0u8;
        let mut expected_front = 0u8;
        for _ in 0..2000 {
            seed ^= seed << 13;
            seed ^= seed >> 17;
            seed ^= seed << 5;
            match seed % 3 {
                0 => {
                    let n = (seed >> 8) as usize % 17;
                    let chunk: Vec<u8> = (0..n)
                        .map(|_| {
                            let b = next;
                            next = next.wrapping_add(1);
                            b
                        })
                        .collect();
                    buf.append(&chunk);
                }
                1 => {
                    let n = (seed >> 8) as usize % 13;
                    let consumed = n.min(buf.ref_size());
                    buf.mark_as_read(n);
                    expected_front = expected_front.wrapping_add(consumed as u8);
                }
                _ => buf.reset(),
            }
            assert!(buf.read_mark() <= buf.written_size());
            if let Some(&front) = buf.ref_data().first() {
                assert_eq!(front, expected_front);
            }
        }
    }
}
