//! MPEG 音频 (MP3) 帧头.
//!
//! 只解析封装需要的采样率与声道数, 供没有声道信息的容器 (MPEG-TS) 恢复 [`SoundParams`].

use liu_core::{ByteReader, LiuError, LiuResult};

use crate::SoundParams;

/// MPEG-1 采样率表, MPEG-2 为其一半, MPEG-2.5 为其四分之一
const MPEG1_SAMPLE_RATES: [u32; 3] = [44_100, 48_000, 32_000];

/// 解析 MPEG 音频帧头, 返回采样参数
pub fn parse_sound_params(data: &[u8]) -> LiuResult<SoundParams> {
    let mut r = ByteReader::new(data);
    if r.bits(11)? != 0x7FF {
        return Err(LiuError::CorruptStream("MP3: 帧同步字错误".into()));
    }
    let version = r.bits(2)?;
    let divisor = match version {
        0b11 => 1,
        0b10 => 2,
        0b00 => 4,
        _ => return Err(LiuError::CorruptStream("MP3: 版本字段保留值".into())),
    };
    r.bits(2)?; // layer
    r.bits(1)?; // protection
    r.bits(4)?; // bitrate index
    let rate_index = r.bits(2)? as usize;
    let base = *MPEG1_SAMPLE_RATES
        .get(rate_index)
        .ok_or_else(|| LiuError::CorruptStream("MP3: 采样率索引保留值".into()))?;
    r.bits(2)?; // padding + private
    let channels = if r.bits(2)? == 0b11 { 1 } else { 2 };
    Ok(SoundParams::new(base / divisor, channels, 16))
}
