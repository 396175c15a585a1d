//! H.264 NAL 单元工具.
//!
//! # Annex B 格式
//!
//! 使用起始码分隔 NAL 单元: `00 00 01` 或 `00 00 00 01`.
//!
//! # 长度前缀格式 (AVCC)
//!
//! FLV / Matroska / MP4 中使用:
//! ```text
//! [length: 4 bytes BE] [NAL data: length bytes]
//! ```
//!
//! # NAL 头部 (1 字节)
//! ```text
//! forbidden(1) | ref_idc(2) | type(5)
//! ```

use liu_core::{ByteReader, LiuError, LiuResult};

use crate::frame::H264Unit;

/// 4 字节起始码
pub const START_CODE: [u8; 4] = [0x00, 0x00, 0x00, 0x01];

/// 访问单元分隔符 NAL (primary_pic_type = 7, 允许任意切片类型)
pub const AUD_NAL: [u8; 2] = [0x09, 0xF0];

/// NAL 单元类型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NalUnitType {
    /// 非 IDR 切片
    Slice,
    /// 数据分区 A/B/C
    SlicePartition,
    /// IDR 切片 (关键帧)
    SliceIdr,
    /// 增补增强信息
    Sei,
    /// 序列参数集
    Sps,
    /// 图像参数集
    Pps,
    /// 访问单元分隔符
    Aud,
    /// 其它类型
    Other(u8),
}

impl NalUnitType {
    pub fn from_header(header: u8) -> Self {
        match header & 0x1F {
            1 => Self::Slice,
            2..=4 => Self::SlicePartition,
            5 => Self::SliceIdr,
            6 => Self::Sei,
            7 => Self::Sps,
            8 => Self::Pps,
            9 => Self::Aud,
            other => Self::Other(other),
        }
    }

    /// 是否为 VCL (视频编码层) NAL
    pub fn is_vcl(&self) -> bool {
        matches!(self, Self::Slice | Self::SlicePartition | Self::SliceIdr)
    }
}

/// 借用输入缓冲区的 NAL 单元 (不含起始码/长度前缀, 含头部字节)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NalUnit<'a> {
    pub nal_type: NalUnitType,
    pub data: &'a [u8],
}

impl<'a> NalUnit<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self {
            nal_type: NalUnitType::from_header(data[0]),
            data,
        }
    }
}

/// 从 Annex B 字节流中分割出所有 NAL 单元
///
/// 去除每个单元尾部的 0 字节; 空单元被跳过.
pub fn split_annex_b(data: &[u8]) -> Vec<NalUnit<'_>> {
    let starts = find_start_codes(data);
    let mut nalus = Vec::with_capacity(starts.len());

    for (i, &(code_pos, code_len)) in starts.iter().enumerate() {
        let begin = code_pos + code_len;
        let end = starts.get(i + 1).map_or(data.len(), |&(next, _)| next);
        let mut nal_end = end;
        while nal_end > begin && data[nal_end - 1] == 0x00 {
            nal_end -= 1;
        }
        if nal_end > begin {
            nalus.push(NalUnit::new(&data[begin..nal_end]));
        }
    }

    nalus
}

/// 从长度前缀数据中提取 NAL 单元
pub fn split_length_prefixed(data: &[u8], length_size: usize) -> LiuResult<Vec<NalUnit<'_>>> {
    if !(1..=4).contains(&length_size) {
        return Err(LiuError::InvalidArgument(format!(
            "H.264: NAL 长度前缀宽度非法: {length_size}"
        )));
    }

    let mut reader = ByteReader::new(data);
    let mut nalus = Vec::new();
    while reader.remaining() > 0 {
        let len = reader.uint_be(length_size)? as usize;
        if len == 0 {
            continue;
        }
        let nal = reader.raw_bytes(len).map_err(|_| {
            LiuError::CorruptStream(format!(
                "H.264: NAL 长度 {len} 超出剩余数据 {}",
                reader.remaining()
            ))
        })?;
        nalus.push(NalUnit::new(nal));
    }
    Ok(nalus)
}

/// Annex B -> 4 字节长度前缀
pub fn annex_b_to_length_prefixed(data: &[u8]) -> Vec<u8> {
    let nalus = split_annex_b(data);
    let total: usize = nalus.iter().map(|n| n.data.len() + 4).sum();
    let mut out = Vec::with_capacity(total);
    for nalu in &nalus {
        out.extend_from_slice(&(nalu.data.len() as u32).to_be_bytes());
        out.extend_from_slice(nalu.data);
    }
    out
}

/// 长度前缀 -> Annex B (4 字节起始码)
pub fn length_prefixed_to_annex_b(data: &[u8], length_size: usize) -> LiuResult<Vec<u8>> {
    let nalus = split_length_prefixed(data, length_size)?;
    Ok(join_annex_b(nalus.iter().map(|n| n.data)))
}

/// 用 4 字节起始码拼接 NAL 单元
pub fn join_annex_b<'a>(nalus: impl IntoIterator<Item = &'a [u8]>) -> Vec<u8> {
    let mut out = Vec::new();
    for nal in nalus {
        out.extend_from_slice(&START_CODE);
        out.extend_from_slice(nal);
    }
    out
}

/// 判断访问单元类别
///
/// 含 IDR 切片为关键帧, 含其它切片为非关键帧, 只含参数集为配置记录.
pub fn classify_access_unit(data: &[u8]) -> H264Unit {
    let nalus = split_annex_b(data);
    if nalus.iter().any(|n| n.nal_type == NalUnitType::SliceIdr) {
        H264Unit::Keyframe
    } else if nalus.iter().any(|n| n.nal_type.is_vcl()) {
        H264Unit::Interframe
    } else if !nalus.is_empty()
        && nalus
            .iter()
            .all(|n| matches!(n.nal_type, NalUnitType::Sps | NalUnitType::Pps))
    {
        H264Unit::Config
    } else {
        H264Unit::Unknown
    }
}

/// AVCDecoderConfigurationRecord 解析结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AvccConfig {
    pub profile: u8,
    pub compatibility: u8,
    pub level: u8,
    /// NAL 长度前缀大小 (字节)
    pub length_size: usize,
    pub sps_list: Vec<Vec<u8>>,
    pub pps_list: Vec<Vec<u8>>,
}

impl AvccConfig {
    /// 转换为 Annex B 形式的参数集 (SPS 在前, PPS 在后)
    pub fn to_annex_b(&self) -> Vec<u8> {
        join_annex_b(
            self.sps_list
                .iter()
                .chain(self.pps_list.iter())
                .map(Vec::as_slice),
        )
    }
}

/// 解析 avcC 记录
pub fn parse_avcc(data: &[u8]) -> LiuResult<AvccConfig> {
    let corrupt = |what: &str| LiuError::CorruptStream(format!("H.264: avcC {what}"));
    let mut r = ByteReader::new(data);
    let version = r.u8().map_err(|_| corrupt("数据太短"))?;
    if version != 1 {
        return Err(corrupt(&format!("版本号非法: {version}")));
    }
    let profile = r.u8().map_err(|_| corrupt("数据太短"))?;
    let compatibility = r.u8().map_err(|_| corrupt("数据太短"))?;
    let level = r.u8().map_err(|_| corrupt("数据太短"))?;
    let length_size = (r.u8().map_err(|_| corrupt("数据太短"))? & 0x03) as usize + 1;

    let num_sps = (r.u8().map_err(|_| corrupt("缺少 SPS 数量"))? & 0x1F) as usize;
    let mut sps_list = Vec::with_capacity(num_sps);
    for i in 0..num_sps {
        let len = r.u16().map_err(|_| corrupt(&format!("SPS 长度截断, index={i}")))?;
        let sps = r
            .raw_bytes(len as usize)
            .map_err(|_| corrupt(&format!("SPS 数据截断, index={i}, len={len}")))?;
        sps_list.push(sps.to_vec());
    }

    let num_pps = r.u8().map_err(|_| corrupt("缺少 PPS 数量"))? as usize;
    let mut pps_list = Vec::with_capacity(num_pps);
    for i in 0..num_pps {
        let len = r.u16().map_err(|_| corrupt(&format!("PPS 长度截断, index={i}")))?;
        let pps = r
            .raw_bytes(len as usize)
            .map_err(|_| corrupt(&format!("PPS 数据截断, index={i}, len={len}")))?;
        pps_list.push(pps.to_vec());
    }

    Ok(AvccConfig {
        profile,
        compatibility,
        level,
        length_size,
        sps_list,
        pps_list,
    })
}

/// 构建 avcC 记录 (NAL 长度前缀固定 4 字节)
pub fn build_avcc(sps_list: &[&[u8]], pps_list: &[&[u8]]) -> LiuResult<Vec<u8>> {
    let sps0 = sps_list
        .first()
        .ok_or_else(|| LiuError::MissingConfig("missing SPS".into()))?;
    if pps_list.is_empty() {
        return Err(LiuError::MissingConfig("missing PPS".into()));
    }
    if sps0.len() < 4 {
        return Err(LiuError::InvalidArgument("H.264: SPS 数据太短".into()));
    }

    let mut out = vec![
        1,                           // configurationVersion
        sps0[1],                     // profile_idc
        sps0[2],                     // profile_compatibility
        sps0[3],                     // level_idc
        0xFF,                        // lengthSizeMinusOne = 3
        0xE0 | sps_list.len() as u8, // numOfSPS
    ];
    for sps in sps_list {
        out.extend_from_slice(&(sps.len() as u16).to_be_bytes());
        out.extend_from_slice(sps);
    }
    out.push(pps_list.len() as u8);
    for pps in pps_list {
        out.extend_from_slice(&(pps.len() as u16).to_be_bytes());
        out.extend_from_slice(pps);
    }
    Ok(out)
}

/// 将配置记录统一为 avcC
///
/// 接受 avcC 记录 (首字节为 1) 或 Annex B 形式的 SPS/PPS.
pub fn config_to_avcc(data: &[u8]) -> LiuResult<Vec<u8>> {
    if data.first() == Some(&1) && parse_avcc(data).is_ok() {
        return Ok(data.to_vec());
    }
    let nalus = split_annex_b(data);
    let sps: Vec<&[u8]> = nalus
        .iter()
        .filter(|n| n.nal_type == NalUnitType::Sps)
        .map(|n| n.data)
        .collect();
    let pps: Vec<&[u8]> = nalus
        .iter()
        .filter(|n| n.nal_type == NalUnitType::Pps)
        .map(|n| n.data)
        .collect();
    build_avcc(&sps, &pps)
}

/// 将配置记录统一为 Annex B 参数集
pub fn config_to_annex_b(data: &[u8]) -> LiuResult<Vec<u8>> {
    if data.first() == Some(&1) {
        return Ok(parse_avcc(data)?.to_annex_b());
    }
    Ok(data.to_vec())
}

// ============================================================
// 内部工具函数
// ============================================================

/// 查找所有起始码, 返回 (位置, 起始码长度)
fn find_start_codes(data: &[u8]) -> Vec<(usize, usize)> {
    let mut positions = Vec::new();
    let mut i = 0;
    while i + 2 < data.len() {
        if data[i] == 0 && data[i + 1] == 0 {
            if data[i + 2] == 1 {
                positions.push((i, 3));
                i += 3;
                continue;
            }
            if i + 3 < data.len() && data[i + 2] == 0 && data[i + 3] == 1 {
                positions.push((i, 4));
                i += 4;
                continue;
            }
        }
        i += 1;
    }
    positions
}

#[cfg(test)]
mod tests {
    use super::*;

    const SPS: [u8; 6] = [0x67, 0x42, 0xC0, 0x1E, 0xDA, 0x01];
    const PPS: [u8; 4] = [0x68, 0xCE, 0x3C, 0x80];

    fn annex_b_config() -> Vec<u8> {
        join_annex_b([&SPS[..], &PPS[..]])
    }

    #[test]
    fn test_h264_分割_annex_b() {
        let data = [
            0x00, 0x00, 0x00, 0x01, 0x65, 0xAA, 0x00, 0x00, 0x01, 0x41, 0xBB, 0x00,
        ];
        let nalus = split_annex_b(&data);
        assert_eq!(nalus.len(), 2);
        assert_eq!(nalus[0].nal_type, NalUnitType::SliceIdr);
        assert_eq!(nalus[0].data, &[0x65, 0xAA]);
        assert_eq!(nalus[1].data, &[0x41, 0xBB], "尾部 0 字节应被去除");
    }

    #[test]
    fn test_h264_长度前缀往返() {
        let annex_b = join_annex_b([&[0x65u8, 0x88, 0x84][..], &[0x06, 0x05][..]]);
        let avcc = annex_b_to_length_prefixed(&annex_b);
        assert_eq!(&avcc[..4], &[0, 0, 0, 3]);
        assert_eq!(length_prefixed_to_annex_b(&avcc, 4).unwrap(), annex_b);
    }

    #[test]
    fn test_h264_长度前缀截断() {
        let data = [0x00, 0x00, 0x00, 0x09, 0x65];
        assert!(matches!(
            split_length_prefixed(&data, 4),
            Err(LiuError::CorruptStream(_))
        ));
        assert!(split_length_prefixed(&data, 5).is_err());
    }

    #[test]
    fn test_h264_构建与解析_avcc() {
        let avcc = config_to_avcc(&annex_b_config()).unwrap();
        assert_eq!(&avcc[..6], &[1, 0x42, 0xC0, 0x1E, 0xFF, 0xE1]);
        let parsed = parse_avcc(&avcc).unwrap();
        assert_eq!(parsed.length_size, 4);
        assert_eq!(parsed.sps_list, vec![SPS.to_vec()]);
        assert_eq!(parsed.pps_list, vec![PPS.to_vec()]);
        assert_eq!(parsed.to_annex_b(), annex_b_config());
        assert_eq!(config_to_avcc(&avcc).unwrap(), avcc, "avcC 输入应原样返回");
        assert_eq!(config_to_annex_b(&avcc).unwrap(), annex_b_config());
    }

    #[test]
    fn test_h264_缺少参数集() {
        let only_sps = join_annex_b([&SPS[..]]);
        assert!(matches!(
            config_to_avcc(&only_sps),
            Err(LiuError::MissingConfig(_))
        ));
        assert!(matches!(config_to_avcc(&[]), Err(LiuError::MissingConfig(_))));
    }

    #[test]
    fn test_h264_访问单元分类() {
        assert_eq!(classify_access_unit(&annex_b_config()), H264Unit::Config);
        let idr = join_annex_b([&AUD_NAL[..], &[0x65, 0x11][..]]);
        assert_eq!(classify_access_unit(&idr), H264Unit::Keyframe);
        let p = join_annex_b([&[0x41u8, 0x9A][..]]);
        assert_eq!(classify_access_unit(&p), H264Unit::Interframe);
        assert_eq!(classify_access_unit(&[1, 2, 3]), H264Unit::Unknown);
    }
}
