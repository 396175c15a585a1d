//! 字节游标 (ByteCursor).
//!
//! 在调用方提供的缓冲区上按 bit 粒度顺序读写, 不做任何堆分配.
//!
//! - [`ByteReader`]: 借用 `&[u8]`, 只修改自身位置
//! - [`ByteWriter`]: 借用 `&mut [u8]`, 修改目标缓冲区与已写入计数
//!
//! 除定长位域外, 还支持 EBML 变长整数:
//! ```text
//! 首字节前导 0 的个数 + 1 = 总宽度 N (1..=8)
//! 1xxx xxxx                       N = 1, 7 bit 数值
//! 01xx xxxx xxxx xxxx             N = 2, 14 bit 数值
//! ...
//! 0000 0001 xxxx ... (7 字节)      N = 8, 56 bit 数值
//! ```
//! 元素 ID 保留标记位原样读写, 大小值去掉标记位. 全 1 数值保留为 "未知大小".

use byteorder::{BigEndian, ByteOrder};

use crate::error::{LiuError, LiuResult};

/// EBML 变长整数最大宽度 (字节)
pub const EBML_MAX_WIDTH: usize = 8;

/// 计算 EBML 大小值的最小编码宽度
///
/// 宽度 N 需满足 `value < 2^(7N) - 1` (全 1 保留给未知大小).
/// 超出 8 字节表示范围时返回 `None`.
pub fn ebml_varint_len(value: u64) -> Option<usize> {
    (1..=EBML_MAX_WIDTH).find(|&width| value < (1u64 << (7 * width)) - 1)
}

/// 计算元素 ID 的字节宽度 (ID 含标记位)
fn element_id_len(id: u64) -> usize {
    let bits = 64 - id.leading_zeros() as usize;
    bits.div_ceil(8).max(1)
}

fn check_width(n: u32) -> LiuResult<()> {
    if n == 0 || n > 64 {
        return Err(LiuError::InvalidArgument(format!(
            "位宽必须在 1..=64 之间, 实际为 {n}"
        )));
    }
    Ok(())
}

/// 只读字节游标
#[derive(Debug, Clone, Copy)]
pub struct ByteReader<'a> {
    data: &'a [u8],
    /// 从缓冲区起点计的 bit 偏移
    bit_pos: usize,
}

impl<'a> ByteReader<'a> {
    /// 创建游标, 从缓冲区起点开始
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, bit_pos: 0 }
    }

    /// 当前字节位置 (向下取整)
    pub fn position(&self) -> usize {
        self.bit_pos / 8
    }

    /// 剩余可读 bit 数
    pub fn remaining_bits(&self) -> u64 {
        (self.data.len() * 8 - self.bit_pos) as u64
    }

    /// 剩余完整字节数
    pub fn remaining(&self) -> usize {
        self.data.len() - self.bit_pos.div_ceil(8)
    }

    /// 是否位于字节边界
    pub fn is_aligned(&self) -> bool {
        self.bit_pos % 8 == 0
    }

    /// 跳到下一个字节边界
    pub fn align_to_byte(&mut self) {
        self.bit_pos = self.bit_pos.div_ceil(8) * 8;
    }

    fn ensure(&self, bits: u64) -> LiuResult<()> {
        let remaining = self.remaining_bits();
        if bits > remaining {
            return Err(LiuError::OutOfBounds {
                requested: bits,
                remaining,
            });
        }
        Ok(())
    }

    fn ensure_aligned(&self, op: &str) -> LiuResult<()> {
        if !self.is_aligned() {
            return Err(LiuError::InvalidArgument(format!(
                "{op} 需要字节对齐, 当前 bit 位置 {}",
                self.bit_pos
            )));
        }
        Ok(())
    }

    /// 读取 n 个 bit (1..=64), 高位在前, 可跨字节
    pub fn bits(&mut self, n: u32) -> LiuResult<u64> {
        check_width(n)?;
        self.ensure(u64::from(n))?;

        let mut value = 0u64;
        let mut left = n;
        while left > 0 {
            let byte = self.data[self.bit_pos / 8];
            let offset = (self.bit_pos % 8) as u32;
            let avail = 8 - offset;
            let take = avail.min(left);
            let mask = ((1u16 << take) - 1) as u8;
            let chunk = (byte >> (avail - take)) & mask;
            value = (value << take) | u64::from(chunk);
            self.bit_pos += take as usize;
            left -= take;
        }
        Ok(value)
    }

    /// 读取 1 bit
    pub fn bit(&mut self) -> LiuResult<bool> {
        Ok(self.bits(1)? == 1)
    }

    /// 读取 EBML 变长整数
    ///
    /// `is_element_id` 为 true 时保留标记位 (元素 ID 原样返回),
    /// 否则去掉标记位返回数值. 失败时游标位置不变.
    pub fn ebml_varint(&mut self, is_element_id: bool) -> LiuResult<u64> {
        self.read_vint(is_element_id).map(|(value, _)| value)
    }

    /// 读取 EBML 大小值, 全 1 (未知大小) 返回 `None`
    pub fn ebml_size(&mut self) -> LiuResult<Option<u64>> {
        let (value, width) = self.read_vint(false)?;
        if value == (1u64 << (7 * width)) - 1 {
            return Ok(None);
        }
        Ok(Some(value))
    }

    fn read_vint(&mut self, keep_marker: bool) -> LiuResult<(u64, usize)> {
        let mut probe = *self;
        let first = probe.bits(8)? as u8;
        if first == 0 {
            return Err(LiuError::CorruptStream(
                "EBML 变长整数首字节为 0".into(),
            ));
        }
        let width = first.leading_zeros() as usize + 1;
        probe.ensure(((width - 1) * 8) as u64)?;

        let mut value = if keep_marker {
            u64::from(first)
        } else {
            u64::from(first & (0xFFu8 >> width))
        };
        for _ in 1..width {
            value = (value << 8) | probe.bits(8)?;
        }
        *self = probe;
        Ok((value, width))
    }

    /// 借出 n 个原始字节 (需字节对齐)
    pub fn raw_bytes(&mut self, n: usize) -> LiuResult<&'a [u8]> {
        self.ensure_aligned("raw_bytes")?;
        self.ensure((n as u64) * 8)?;
        let start = self.bit_pos / 8;
        self.bit_pos += n * 8;
        Ok(&self.data[start..start + n])
    }

    /// 读取 n 字节 UTF-8 字符串 (需字节对齐)
    pub fn raw_string(&mut self, n: usize) -> LiuResult<&'a str> {
        let bytes = self.raw_bytes(n)?;
        std::str::from_utf8(bytes)
            .map_err(|e| LiuError::CorruptStream(format!("字符串不是合法 UTF-8: {e}")))
    }

    /// 借出剩余全部字节 (需字节对齐)
    pub fn rest(&mut self) -> LiuResult<&'a [u8]> {
        let n = self.remaining();
        self.raw_bytes(n)
    }

    /// 跳过 n 字节
    pub fn skip_bytes(&mut self, n: usize) -> LiuResult<()> {
        self.raw_bytes(n).map(|_| ())
    }

    pub fn u8(&mut self) -> LiuResult<u8> {
        Ok(self.raw_bytes(1)?[0])
    }

    pub fn u16(&mut self) -> LiuResult<u16> {
        Ok(BigEndian::read_u16(self.raw_bytes(2)?))
    }

    pub fn i16(&mut self) -> LiuResult<i16> {
        Ok(BigEndian::read_i16(self.raw_bytes(2)?))
    }

    pub fn u24(&mut self) -> LiuResult<u32> {
        Ok(BigEndian::read_u24(self.raw_bytes(3)?))
    }

    pub fn i24(&mut self) -> LiuResult<i32> {
        Ok(BigEndian::read_i24(self.raw_bytes(3)?))
    }

    pub fn u32(&mut self) -> LiuResult<u32> {
        Ok(BigEndian::read_u32(self.raw_bytes(4)?))
    }

    pub fn i32(&mut self) -> LiuResult<i32> {
        Ok(BigEndian::read_i32(self.raw_bytes(4)?))
    }

    pub fn u64(&mut self) -> LiuResult<u64> {
        Ok(BigEndian::read_u64(self.raw_bytes(8)?))
    }

    pub fn f64(&mut self) -> LiuResult<f64> {
        Ok(BigEndian::read_f64(self.raw_bytes(8)?))
    }

    /// 读取 n 字节 (1..=8) 大端无符号整数, 用于 EBML uint 元素体
    pub fn uint_be(&mut self, n: usize) -> LiuResult<u64> {
        if n == 0 {
            return Ok(0);
        }
        if n > 8 {
            return Err(LiuError::InvalidArgument(format!(
                "整数宽度超过 8 字节: {n}"
            )));
        }
        Ok(BigEndian::read_uint(self.raw_bytes(n)?, n))
    }
}

/// 可写字节游标
///
/// 在固定容量的目标缓冲区上顺序写入, 从不越过容量.
#[derive(Debug)]
pub struct ByteWriter<'a> {
    buf: &'a mut [u8],
    bit_pos: usize,
}

impl<'a> ByteWriter<'a> {
    /// 在目标缓冲区上创建写游标
    pub fn new(buf: &'a mut [u8]) -> Self {
        Self { buf, bit_pos: 0 }
    }

    /// 已写入字节数 (不足一字节按一字节计)
    pub fn bytes_written(&self) -> usize {
        self.bit_pos.div_ceil(8)
    }

    /// 已写入的字节
    pub fn written(&self) -> &[u8] {
        &self.buf[..self.bytes_written()]
    }

    /// 剩余可写 bit 数
    pub fn remaining_bits(&self) -> u64 {
        (self.buf.len() * 8 - self.bit_pos) as u64
    }

    pub fn is_aligned(&self) -> bool {
        self.bit_pos % 8 == 0
    }

    /// 用 0 填充到下一个字节边界
    pub fn align_to_byte(&mut self) -> LiuResult<()> {
        let pad = (8 - self.bit_pos % 8) % 8;
        if pad > 0 {
            self.bits(0, pad as u32)?;
        }
        Ok(())
    }

    fn ensure(&self, bits: u64) -> LiuResult<()> {
        let remaining = self.remaining_bits();
        if bits > remaining {
            return Err(LiuError::OutOfBounds {
                requested: bits,
                remaining,
            });
        }
        Ok(())
    }

    /// 写入 value 的低 n 个 bit (1..=64), 高位在前
    pub fn bits(&mut self, value: u64, n: u32) -> LiuResult<()> {
        check_width(n)?;
        if n < 64 && value >> n != 0 {
            return Err(LiuError::InvalidArgument(format!(
                "数值 {value} 超出 {n} bit 表示范围"
            )));
        }
        self.ensure(u64::from(n))?;

        let mut left = n;
        while left > 0 {
            let idx = self.bit_pos / 8;
            let offset = (self.bit_pos % 8) as u32;
            let avail = 8 - offset;
            let take = avail.min(left);
            let chunk = ((value >> (left - take)) & ((1u64 << take) - 1)) as u8;
            let shift = avail - take;
            let mask = (((1u16 << take) - 1) as u8) << shift;
            self.buf[idx] = (self.buf[idx] & !mask) | (chunk << shift);
            self.bit_pos += take as usize;
            left -= take;
        }
        Ok(())
    }

    fn reserve(&mut self, n: usize) -> LiuResult<&mut [u8]> {
        if !self.is_aligned() {
            return Err(LiuError::InvalidArgument(format!(
                "按字节写入需要对齐, 当前 bit 位置 {}",
                self.bit_pos
            )));
        }
        self.ensure((n as u64) * 8)?;
        let start = self.bit_pos / 8;
        self.bit_pos += n * 8;
        Ok(&mut self.buf[start..start + n])
    }

    /// 写入 EBML 变长整数
    ///
    /// 元素 ID 按自身字节长度原样写出; 大小值使用满足标记位约束的最小宽度.
    pub fn ebml_varint(&mut self, value: u64, is_element_id: bool) -> LiuResult<()> {
        if is_element_id {
            let width = element_id_len(value);
            let first = (value >> ((width - 1) * 8)) as u8;
            if width > EBML_MAX_WIDTH || first.leading_zeros() as usize + 1 != width {
                return Err(LiuError::InvalidArgument(format!(
                    "非法 EBML 元素 ID: {value:#X}"
                )));
            }
            return self.bits(value, (width * 8) as u32);
        }

        let width = ebml_varint_len(value).ok_or_else(|| {
            LiuError::InvalidArgument(format!("EBML 大小值过大: {value}"))
        })?;
        let marker = 1u64 << (7 * width);
        self.bits(marker | value, (width * 8) as u32)
    }

    /// 写入指定宽度的 "未知大小" 标记
    pub fn ebml_unknown_size(&mut self, width: usize) -> LiuResult<()> {
        if !(1..=EBML_MAX_WIDTH).contains(&width) {
            return Err(LiuError::InvalidArgument(format!(
                "EBML 宽度必须在 1..=8 之间: {width}"
            )));
        }
        let pattern = (1u64 << (7 * width)) | ((1u64 << (7 * width)) - 1);
        self.bits(pattern, (width * 8) as u32)
    }

    /// 原样写入字节 (需字节对齐)
    pub fn raw_bytes(&mut self, data: &[u8]) -> LiuResult<()> {
        self.reserve(data.len())?.copy_from_slice(data);
        Ok(())
    }

    pub fn raw_string(&mut self, s: &str) -> LiuResult<()> {
        self.raw_bytes(s.as_bytes())
    }

    pub fn u8(&mut self, v: u8) -> LiuResult<()> {
        self.reserve(1)?[0] = v;
        Ok(())
    }

    pub fn u16(&mut self, v: u16) -> LiuResult<()> {
        BigEndian::write_u16(self.reserve(2)?, v);
        Ok(())
    }

    pub fn i16(&mut self, v: i16) -> LiuResult<()> {
        BigEndian::write_i16(self.reserve(2)?, v);
        Ok(())
    }

    pub fn u24(&mut self, v: u32) -> LiuResult<()> {
        if v > 0xFF_FFFF {
            return Err(LiuError::InvalidArgument(format!("数值超出 24 bit: {v}")));
        }
        BigEndian::write_u24(self.reserve(3)?, v);
        Ok(())
    }

    pub fn i24(&mut self, v: i32) -> LiuResult<()> {
        if !(-0x80_0000..=0x7F_FFFF).contains(&v) {
            return Err(LiuError::InvalidArgument(format!("数值超出 24 bit: {v}")));
        }
        BigEndian::write_i24(self.reserve(3)?, v);
        Ok(())
    }

    pub fn u32(&mut self, v: u32) -> LiuResult<()> {
        BigEndian::write_u32(self.reserve(4)?, v);
        Ok(())
    }

    pub fn u64(&mut self, v: u64) -> LiuResult<()> {
        BigEndian::write_u64(self.reserve(8)?, v);
        Ok(())
    }
}
