//! AAC 配置记录与 ADTS 头.
//!
//! AudioSpecificConfig (ISO 14496-3) 的前几个字段:
//! ```text
//! audioObjectType(5) | samplingFrequencyIndex(4) [| samplingFrequency(24)] | channelConfiguration(4)
//! ```
//! ADTS 头 (7 字节, 无 CRC) 用于 MPEG-TS 中的 AAC.

use liu_core::{ByteReader, ByteWriter, LiuError, LiuResult};

/// ADTS 采样率索引表
pub const SAMPLE_RATES: [u32; 13] = [
    96000, 88200, 64000, 48000, 44100, 32000, 24000, 22050, 16000, 12000, 11025, 8000, 7350,
];

/// 无 CRC 的 ADTS 头长度
pub const ADTS_HEADER_LEN: usize = 7;

/// ADTS frame_length 字段上限 (13 bit)
const ADTS_MAX_FRAME_LEN: usize = 0x1FFF;

/// 每个 AAC 帧的采样数
pub const SAMPLES_PER_FRAME: u32 = 1024;

/// AudioSpecificConfig 中与封装相关的字段
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioSpecificConfig {
    /// audioObjectType (2 = AAC-LC)
    pub object_type: u8,
    /// 采样率 (Hz)
    pub sample_rate: u32,
    /// channelConfiguration
    pub channels: u8,
}

impl AudioSpecificConfig {
    pub fn new(object_type: u8, sample_rate: u32, channels: u8) -> Self {
        Self {
            object_type,
            sample_rate,
            channels,
        }
    }

    /// 解析 AudioSpecificConfig
    pub fn parse(data: &[u8]) -> LiuResult<Self> {
        let mut r = ByteReader::new(data);
        let corrupt = |_| LiuError::MissingConfig("missing AudioSpecificConfig".into());
        let mut object_type = r.bits(5).map_err(corrupt)? as u8;
        if object_type == 31 {
            object_type = 32 + r.bits(6).map_err(corrupt)? as u8;
        }
        let index = r.bits(4).map_err(corrupt)? as usize;
        let sample_rate = if index == 15 {
            r.bits(24).map_err(corrupt)? as u32
        } else {
            *SAMPLE_RATES.get(index).ok_or_else(|| {
                LiuError::CorruptStream(format!("AAC: 采样率索引非法: {index}"))
            })?
        };
        let channels = r.bits(4).map_err(corrupt)? as u8;
        Ok(Self {
            object_type,
            sample_rate,
            channels,
        })
    }

    /// 采样率在 ADTS 表中的索引
    pub fn sample_rate_index(&self) -> Option<u8> {
        SAMPLE_RATES
            .iter()
            .position(|&r| r == self.sample_rate)
            .map(|i| i as u8)
    }

    /// 序列化为 AudioSpecificConfig 字节
    pub fn to_bytes(&self) -> LiuResult<Vec<u8>> {
        if self.object_type == 0 || self.object_type > 30 {
            return Err(LiuError::Unsupported(format!(
                "AAC: 不支持的 audioObjectType: {}",
                self.object_type
            )));
        }
        let mut buf = [0u8; 5];
        let mut w = ByteWriter::new(&mut buf);
        w.bits(u64::from(self.object_type), 5)?;
        match self.sample_rate_index() {
            Some(index) => w.bits(u64::from(index), 4)?,
            None => {
                w.bits(15, 4)?;
                w.bits(u64::from(self.sample_rate), 24)?;
            }
        }
        w.bits(u64::from(self.channels), 4)?;
        w.align_to_byte()?;
        Ok(w.written().to_vec())
    }
}

/// 解析出的 ADTS 头
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdtsHeader {
    pub config: AudioSpecificConfig,
    /// 头部长度 (7 或 9)
    pub header_len: usize,
    /// 整个 ADTS 帧长度 (含头部)
    pub frame_len: usize,
}

/// 为一个裸 AAC 帧构建 ADTS 头
pub fn build_adts_header(
    config: &AudioSpecificConfig,
    payload_len: usize,
) -> LiuResult<[u8; ADTS_HEADER_LEN]> {
    let frame_len = ADTS_HEADER_LEN + payload_len;
    if frame_len > ADTS_MAX_FRAME_LEN {
        return Err(LiuError::InvalidArgument(format!(
            "AAC 帧长度超出 ADTS 限制: {frame_len}"
        )));
    }
    let index = config.sample_rate_index().ok_or_else(|| {
        LiuError::Unsupported(format!("ADTS 不支持采样率 {} Hz", config.sample_rate))
    })?;
    if !(1..=4).contains(&config.object_type) || config.channels > 7 {
        return Err(LiuError::Unsupported(format!(
            "ADTS 无法表示 objectType={} channels={}",
            config.object_type, config.channels
        )));
    }

    let mut header = [0u8; ADTS_HEADER_LEN];
    let mut w = ByteWriter::new(&mut header);
    w.bits(0xFFF, 12)?; // syncword
    w.bits(0, 1)?; // ID = MPEG-4
    w.bits(0, 2)?; // layer
    w.bits(1, 1)?; // protection_absent
    w.bits(u64::from(config.object_type - 1), 2)?;
    w.bits(u64::from(index), 4)?;
    w.bits(0, 1)?; // private_bit
    w.bits(u64::from(config.channels), 3)?;
    w.bits(0, 4)?; // 版权与 home 标志位
    w.bits(frame_len as u64, 13)?;
    w.bits(0x7FF, 11)?; // buffer fullness (VBR)
    w.bits(0, 2)?; // number_of_raw_data_blocks - 1
    Ok(header)
}

/// 解析 ADTS 头
pub fn parse_adts_header(data: &[u8]) -> LiuResult<AdtsHeader> {
    let mut r = ByteReader::new(data);
    if r.bits(12)? != 0xFFF {
        return Err(LiuError::CorruptStream("AAC: ADTS 同步字错误".into()));
    }
    r.bits(3)?; // ID + layer
    let protection_absent = r.bit()?;
    let object_type = r.bits(2)? as u8 + 1;
    let index = r.bits(4)? as usize;
    r.bits(1)?;
    let channels = r.bits(3)? as u8;
    r.bits(4)?;
    let frame_len = r.bits(13)? as usize;
    let header_len = if protection_absent { 7 } else { 9 };
    if frame_len < header_len {
        return Err(LiuError::CorruptStream(format!(
            "AAC: ADTS 帧长度非法: {frame_len}"
        )));
    }
    let sample_rate = *SAMPLE_RATES
        .get(index)
        .ok_or_else(|| LiuError::CorruptStream(format!("AAC: 采样率索引非法: {index}")))?;
    Ok(AdtsHeader {
        config: AudioSpecificConfig::new(object_type, sample_rate, channels),
        header_len,
        frame_len,
    })
}
