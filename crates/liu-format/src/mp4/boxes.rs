//! ISO BMFF box 读写工具.
//!
//! ```text
//! Size:       4 bytes (big-endian, 含头部本身)
//! Type:       4 bytes (FourCC)
//! [ExtSize]:  8 bytes (仅当 Size==1 时存在, 64-bit 大小)
//! ```
//!
//! 写入时先占位, 内容写完后用 [`end_box`] 回填大小.

use byteorder::{BigEndian, ByteOrder};

use liu_core::{ByteReader, LiuError, LiuResult};

/// 开始一个 box, 返回起始位置
pub fn begin_box(out: &mut Vec<u8>, box_type: &[u8; 4]) -> usize {
    let start = out.len();
    out.extend_from_slice(&[0; 4]);
    out.extend_from_slice(box_type);
    start
}

/// 开始一个 full box (version + 24 位 flags)
pub fn begin_full_box(out: &mut Vec<u8>, box_type: &[u8; 4], version: u8, flags: u32) -> usize {
    let start = begin_box(out, box_type);
    out.push(version);
    out.extend_from_slice(&flags.to_be_bytes()[1..]);
    start
}

/// 回填 box 大小
pub fn end_box(out: &mut [u8], start: usize) -> LiuResult<()> {
    let size = u32::try_from(out.len() - start)
        .map_err(|_| LiuError::InvalidArgument("MP4: box 大小超出 32 位".into()))?;
    BigEndian::write_u32(&mut out[start..start + 4], size);
    Ok(())
}

/// 已解析的 box 头
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BoxHeader {
    pub box_type: [u8; 4],
    /// 头部大小 (8 或 16)
    pub header_len: usize,
    /// box 总大小 (含头部)
    pub size: u64,
}

impl BoxHeader {
    /// 内容大小
    pub fn body_len(&self) -> u64 {
        self.size - self.header_len as u64
    }
}

/// 解析 box 头, 字节不足时返回 `Ok(None)`
pub fn parse_box_header(data: &[u8]) -> LiuResult<Option<BoxHeader>> {
    if data.len() < 8 {
        return Ok(None);
    }
    let mut r = ByteReader::new(data);
    let size32 = r.u32()?;
    let mut box_type = [0u8; 4];
    box_type.copy_from_slice(r.raw_bytes(4)?);
    let (size, header_len) = match size32 {
        0 => {
            return Err(LiuError::Unsupported(format!(
                "MP4: 不支持延伸到流末尾的 box '{}'",
                fourcc_str(&box_type)
            )));
        }
        1 => {
            if data.len() < 16 {
                return Ok(None);
            }
            (r.u64()?, 16)
        }
        n => (u64::from(n), 8),
    };
    if size < header_len as u64 {
        return Err(LiuError::CorruptStream(format!(
            "MP4: box '{}' 大小 {size} 小于头部",
            fourcc_str(&box_type)
        )));
    }
    Ok(Some(BoxHeader {
        box_type,
        header_len,
        size,
    }))
}

/// FourCC 的可读形式
pub fn fourcc_str(box_type: &[u8; 4]) -> String {
    String::from_utf8_lossy(box_type).into_owned()
}

/// 读取 full box 的 version 与 flags
pub fn full_box_header(r: &mut ByteReader<'_>) -> LiuResult<(u8, u32)> {
    let version = r.u8()?;
    let flags = r.u24()?;
    Ok((version, flags))
}

/// 子 box 迭代器
pub struct Children<'a> {
    data: &'a [u8],
}

/// 遍历容器 box 内容中的子 box
pub fn children(data: &[u8]) -> Children<'_> {
    Children { data }
}

impl<'a> Iterator for Children<'a> {
    type Item = LiuResult<([u8; 4], &'a [u8])>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.data.is_empty() {
            return None;
        }
        let data = self.data;
        let header = match parse_box_header(data) {
            Ok(Some(header)) => header,
            Ok(None) => {
                self.data = &[];
                return Some(Err(LiuError::CorruptStream("MP4: 子 box 头截断".into())));
            }
            Err(err) => {
                self.data = &[];
                return Some(Err(err));
            }
        };
        let Some(end) = usize::try_from(header.size)
            .ok()
            .filter(|&end| end <= data.len())
        else {
            self.data = &[];
            return Some(Err(LiuError::CorruptStream(format!(
                "MP4: 子 box '{}' 超出父 box",
                fourcc_str(&header.box_type)
            ))));
        };
        self.data = &data[end..];
        Some(Ok((header.box_type, &data[header.header_len..end])))
    }
}

/// 查找第一个指定类型的子 box
pub fn find_child<'a>(data: &'a [u8], box_type: &[u8; 4]) -> LiuResult<Option<&'a [u8]>> {
    for child in children(data) {
        let (t, body) = child?;
        if &t == box_type {
            return Ok(Some(body));
        }
    }
    Ok(None)
}

/// 按路径逐层查找
pub fn find_path<'a>(data: &'a [u8], path: &[&[u8; 4]]) -> LiuResult<Option<&'a [u8]>> {
    let mut current = data;
    for box_type in path {
        match find_child(current, box_type)? {
            Some(body) => current = body,
            None => return Ok(None),
        }
    }
    Ok(Some(current))
}
