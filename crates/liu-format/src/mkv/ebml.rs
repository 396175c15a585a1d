//! EBML 元素的读写工具.
//!
//! 元素 = ID (保留标记位的变长整数) + 大小 (变长整数) + 数据.
//! 变长整数本身由 [`ByteReader`]/[`ByteWriter`] 编解码, 这里负责拼装元素.

use liu_core::cursor::EBML_MAX_WIDTH;
use liu_core::{ByteReader, ByteWriter, LiuError, LiuResult};

// ============================================================
// EBML 元素 ID 常量
// ============================================================

pub const EBML_HEADER: u32 = 0x1A45_DFA3;
pub const EBML_VERSION: u32 = 0x4286;
pub const EBML_READ_VERSION: u32 = 0x42F7;
pub const EBML_MAX_ID_LENGTH: u32 = 0x42F2;
pub const EBML_MAX_SIZE_LENGTH: u32 = 0x42F3;
pub const EBML_DOC_TYPE: u32 = 0x4282;
pub const EBML_DOC_TYPE_VERSION: u32 = 0x4287;
pub const EBML_DOC_TYPE_READ_VERSION: u32 = 0x4285;

pub const SEGMENT: u32 = 0x1853_8067;
pub const SEGMENT_INFO: u32 = 0x1549_A966;
pub const INFO_TIMESCALE: u32 = 0x002A_D7B1;
pub const INFO_MUXING_APP: u32 = 0x4D80;
pub const INFO_WRITING_APP: u32 = 0x5741;
pub const TRACKS: u32 = 0x1654_AE6B;
pub const TRACK_ENTRY: u32 = 0xAE;
pub const TRACK_NUMBER: u32 = 0xD7;
pub const TRACK_UID: u32 = 0x73C5;
pub const TRACK_TYPE: u32 = 0x83;
pub const TRACK_CODEC_ID: u32 = 0x86;
pub const TRACK_CODEC_PRIVATE: u32 = 0x63A2;
pub const VIDEO_SETTINGS: u32 = 0xE0;
pub const VIDEO_PIXEL_WIDTH: u32 = 0xB0;
pub const VIDEO_PIXEL_HEIGHT: u32 = 0xBA;
pub const AUDIO_SETTINGS: u32 = 0xE1;
pub const AUDIO_SAMPLING_FREQ: u32 = 0xB5;
pub const AUDIO_CHANNELS: u32 = 0x9F;
pub const AUDIO_BIT_DEPTH: u32 = 0x6264;
pub const CLUSTER: u32 = 0x1F43_B675;
pub const CLUSTER_TIMESTAMP: u32 = 0xE7;
pub const SIMPLE_BLOCK: u32 = 0xA3;
pub const BLOCK_GROUP: u32 = 0xA0;
pub const BLOCK: u32 = 0xA1;
pub const REFERENCE_BLOCK: u32 = 0xFB;

/// TrackType
pub const TRACK_TYPE_VIDEO: u64 = 1;
pub const TRACK_TYPE_AUDIO: u64 = 2;

// ============================================================
// 写入
// ============================================================

/// 写元素 ID (按 ID 自身宽度原样写出)
pub fn put_id(buf: &mut Vec<u8>, id: u32) -> LiuResult<()> {
    let mut tmp = [0u8; EBML_MAX_WIDTH];
    let mut w = ByteWriter::new(&mut tmp);
    w.ebml_varint(u64::from(id), true)?;
    buf.extend_from_slice(w.written());
    Ok(())
}

/// 写元素大小 (最小宽度)
pub fn put_size(buf: &mut Vec<u8>, size: u64) -> LiuResult<()> {
    let mut tmp = [0u8; EBML_MAX_WIDTH];
    let mut w = ByteWriter::new(&mut tmp);
    w.ebml_varint(size, false)?;
    buf.extend_from_slice(w.written());
    Ok(())
}

/// 写 "未知大小" 标记
pub fn put_unknown_size(buf: &mut Vec<u8>, width: usize) -> LiuResult<()> {
    let mut tmp = [0u8; EBML_MAX_WIDTH];
    let mut w = ByteWriter::new(&mut tmp);
    w.ebml_unknown_size(width)?;
    buf.extend_from_slice(w.written());
    Ok(())
}

/// 写完整元素 (ID + size + data)
pub fn put_element(buf: &mut Vec<u8>, id: u32, data: &[u8]) -> LiuResult<()> {
    put_id(buf, id)?;
    put_size(buf, data.len() as u64)?;
    buf.extend_from_slice(data);
    Ok(())
}

/// 写 uint 元素 (最少字节数, 0 占 1 字节)
pub fn put_uint(buf: &mut Vec<u8>, id: u32, value: u64) -> LiuResult<()> {
    let bytes = value.to_be_bytes();
    let skip = (value.leading_zeros() / 8).min(7) as usize;
    put_element(buf, id, &bytes[skip..])
}

/// 写 float64 元素
pub fn put_float(buf: &mut Vec<u8>, id: u32, value: f64) -> LiuResult<()> {
    put_element(buf, id, &value.to_be_bytes())
}

/// 写 string 元素
pub fn put_string(buf: &mut Vec<u8>, id: u32, value: &str) -> LiuResult<()> {
    put_element(buf, id, value.as_bytes())
}

// ============================================================
// 读取
// ============================================================

/// 元素头部
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ElementHeader {
    pub id: u32,
    /// None 表示未知大小
    pub size: Option<u64>,
    /// ID + 大小 的字节数
    pub header_len: usize,
}

/// 从数据开头读取元素头部, 字节不足时返回 `Ok(None)`
pub fn read_element_header(data: &[u8]) -> LiuResult<Option<ElementHeader>> {
    let mut r = ByteReader::new(data);
    let id = match r.ebml_varint(true) {
        Ok(id) => id,
        Err(LiuError::OutOfBounds { .. }) => return Ok(None),
        Err(e) => return Err(e),
    };
    if id > u64::from(u32::MAX) {
        return Err(LiuError::CorruptStream(format!(
            "EBML: 元素 ID 超过 4 字节: {id:#X}"
        )));
    }
    let size = match r.ebml_size() {
        Ok(size) => size,
        Err(LiuError::OutOfBounds { .. }) => return Ok(None),
        Err(e) => return Err(e),
    };
    Ok(Some(ElementHeader {
        id: id as u32,
        size,
        header_len: r.position(),
    }))
}

/// 遍历一个主元素内的子元素 (数据必须完整)
pub fn children(data: &[u8]) -> LiuResult<Vec<(u32, &[u8])>> {
    let mut out = Vec::new();
    let mut pos = 0;
    while pos < data.len() {
        let header = read_element_header(&data[pos..])?
            .ok_or_else(|| LiuError::CorruptStream("EBML: 子元素头部截断".into()))?;
        let size = header
            .size
            .ok_or_else(|| LiuError::CorruptStream("EBML: 子元素不能为未知大小".into()))?;
        let start = pos + header.header_len;
        let end = usize::try_from(size)
            .ok()
            .and_then(|size| start.checked_add(size))
            .filter(|&end| end <= data.len())
            .ok_or_else(|| {
                LiuError::CorruptStream(format!(
                    "EBML: 子元素 {:#X} 大小 {size} 超出父元素",
                    header.id
                ))
            })?;
        out.push((header.id, &data[start..end]));
        pos = end;
    }
    Ok(out)
}

/// 解析 uint 元素数据
pub fn read_uint(data: &[u8]) -> LiuResult<u64> {
    if data.len() > 8 {
        return Err(LiuError::CorruptStream(format!(
            "EBML: uint 元素过长: {} 字节",
            data.len()
        )));
    }
    Ok(data.iter().fold(0u64, |acc, &b| (acc << 8) | u64::from(b)))
}

/// 解析取值不超过 255 的 uint 元素 (声道数、位深)
pub fn read_u8(data: &[u8]) -> LiuResult<u8> {
    let value = read_uint(data)?;
    u8::try_from(value)
        .map_err(|_| LiuError::CorruptStream(format!("EBML: uint 元素超出 u8 范围: {value}")))
}

/// 解析 float 元素数据 (4 或 8 字节)
pub fn read_float(data: &[u8]) -> LiuResult<f64> {
    let mut r = ByteReader::new(data);
    match data.len() {
        0 => Ok(0.0),
        4 => Ok(f64::from(f32::from_bits(r.u32()?))),
        8 => r.f64(),
        n => Err(LiuError::CorruptStream(format!(
            "EBML: float 元素长度非法: {n}"
        ))),
    }
}

/// 解析 string 元素数据 (去掉结尾的 0 填充)
pub fn read_string(data: &[u8]) -> String {
    let end = data.iter().position(|&b| b == 0).unwrap_or(data.len());
    String::from_utf8_lossy(&data[..end]).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ebml_uint_元素() {
        let mut buf = Vec::new();
        put_uint(&mut buf, TRACK_NUMBER, 1).unwrap();
        assert_eq!(buf, vec![0xD7, 0x81, 0x01]);

        buf.clear();
        put_uint(&mut buf, INFO_TIMESCALE, 1_000_000).unwrap();
        assert_eq!(buf, vec![0x2A, 0xD7, 0xB1, 0x83, 0x0F, 0x42, 0x40]);
        assert_eq!(read_uint(&buf[4..]).unwrap(), 1_000_000);

        buf.clear();
        put_uint(&mut buf, TRACK_NUMBER, 0).unwrap();
        assert_eq!(buf, vec![0xD7, 0x81, 0x00]);
    }

    #[test]
    fn test_ebml_元素头部() {
        let mut buf = Vec::new();
        put_id(&mut buf, SEGMENT).unwrap();
        put_unknown_size(&mut buf, 8).unwrap();
        assert_eq!(
            buf,
            vec![0x18, 0x53, 0x80, 0x67, 0x01, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF]
        );
        let header = read_element_header(&buf).unwrap().unwrap();
        assert_eq!(header.id, SEGMENT);
        assert_eq!(header.size, None);
        assert_eq!(header.header_len, 12);

        // 字节不足
        assert_eq!(read_element_header(&buf[..5]).unwrap(), None);
        assert_eq!(read_element_header(&[]).unwrap(), None);
    }

    #[test]
    fn test_ebml_遍历子元素() {
        let mut body = Vec::new();
        put_uint(&mut body, TRACK_NUMBER, 2).unwrap();
        put_string(&mut body, TRACK_CODEC_ID, "A_AAC").unwrap();
        let kids = children(&body).unwrap();
        assert_eq!(kids.len(), 2);
        assert_eq!(kids[1].0, TRACK_CODEC_ID);
        assert_eq!(read_string(kids[1].1), "A_AAC");

        // 子元素大小越界
        let bad = [0xD7, 0x85, 0x01];
        assert!(children(&bad).is_err());
    }

    #[test]
    fn test_ebml_float() {
        let mut buf = Vec::new();
        put_float(&mut buf, AUDIO_SAMPLING_FREQ, 48_000.0).unwrap();
        assert_eq!(read_float(&buf[2..]).unwrap(), 48_000.0);
        assert_eq!(read_float(&44_100.0f32.to_bits().to_be_bytes()).unwrap(), 44_100.0);
        assert!(read_float(&[0, 0, 0]).is_err());
    }
}
