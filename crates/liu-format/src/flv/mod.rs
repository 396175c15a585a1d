//! FLV (Flash Video).
//!
//! 文件结构:
//! - FLV Header (9 bytes)
//! - PreviousTagSize0 (4 bytes = 0)
//! - [FLV Tag + PreviousTagSize] ...
//!
//! Tag 头:
//! ```text
//! TagType(1) | DataSize(3) | Timestamp(3) | TimestampExtended(1) | StreamID(3) = 0
//! ```

use bitflags::bitflags;

use liu_codec::{CodecId, SoundParams};
use liu_core::{LiuError, LiuResult};

use crate::format_id::FormatId;
use crate::probe::{FormatProbe, ProbeScore, SCORE_MAX, probe_extension};

pub mod reader;
pub mod writer;

pub use reader::{FlvDemux, FlvReader};
pub use writer::{FlvMux, FlvWriter};

/// FLV Tag 类型
pub const TAG_AUDIO: u8 = 8;
pub const TAG_VIDEO: u8 = 9;
pub const TAG_SCRIPT: u8 = 18;

/// FLV 文件头长度
pub const FLV_HEADER_LEN: usize = 9;
/// Tag 头长度 (不含 PreviousTagSize)
pub const TAG_HEADER_LEN: usize = 11;
/// DataSize 字段上限 (24 bit)
pub const MAX_TAG_DATA_SIZE: usize = 0xFF_FFFF;

/// 读取器中音频/视频帧的轨道标识 (取 Tag 类型)
pub const AUDIO_TRACK_ID: u32 = TAG_AUDIO as u32;
pub const VIDEO_TRACK_ID: u32 = TAG_VIDEO as u32;

bitflags! {
    /// FLV 文件头 TypeFlags
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FlvFlags: u8 {
        const AUDIO = 0x04;
        const VIDEO = 0x01;
    }
}

/// SoundFormat 编号
pub mod sound_format {
    pub const PCM_LE: u8 = 3;
    pub const MP3: u8 = 2;
    pub const NELLYMOSER_16K_MONO: u8 = 4;
    pub const NELLYMOSER_8K_MONO: u8 = 5;
    pub const NELLYMOSER: u8 = 6;
    pub const PCM_ALAW: u8 = 7;
    pub const PCM_MULAW: u8 = 8;
    pub const AAC: u8 = 10;
    pub const SPEEX: u8 = 11;
}

/// 视频 CodecID 编号
pub mod video_codec {
    pub const VP6: u8 = 4;
    pub const AVC: u8 = 7;
}

/// AVCPacketType / AACPacketType
pub const PACKET_SEQUENCE_HEADER: u8 = 0;
pub const PACKET_RAW: u8 = 1;
pub const PACKET_END_OF_SEQUENCE: u8 = 2;

/// SoundRate 编号对应的采样率
const SOUND_RATES: [u32; 4] = [5_512, 11_025, 22_050, 44_100];

/// 编解码器 -> FLV SoundFormat
pub(crate) fn codec_to_sound_format(codec: CodecId, sound: &SoundParams) -> LiuResult<u8> {
    match codec {
        CodecId::Aac => Ok(sound_format::AAC),
        CodecId::Mp3 => Ok(sound_format::MP3),
        CodecId::PcmS16le => Ok(sound_format::PCM_LE),
        CodecId::Nellymoser => Ok(match (sound.sample_rate, sound.channels) {
            (16_000, 1) => sound_format::NELLYMOSER_16K_MONO,
            (8_000, 1) => sound_format::NELLYMOSER_8K_MONO,
            _ => sound_format::NELLYMOSER,
        }),
        CodecId::PcmAlaw => Ok(sound_format::PCM_ALAW),
        CodecId::PcmMulaw => Ok(sound_format::PCM_MULAW),
        CodecId::Speex => Ok(sound_format::SPEEX),
        _ => Err(LiuError::Unsupported(format!(
            "FLV 不支持音频编解码器: {codec}"
        ))),
    }
}

/// 编解码器 -> FLV CodecID (video)
pub(crate) fn codec_to_video_id(codec: CodecId) -> LiuResult<u8> {
    match codec {
        CodecId::H264 => Ok(video_codec::AVC),
        CodecId::Vp6 => Ok(video_codec::VP6),
        _ => Err(LiuError::Unsupported(format!(
            "FLV 不支持视频编解码器: {codec}"
        ))),
    }
}

/// 音频头字节: SoundFormat(4) | SoundRate(2) | SoundSize(1) | SoundType(1)
///
/// AAC 总是写 44kHz/16bit/立体声, 真实参数在 AudioSpecificConfig 中.
/// Speex 固定 16kHz 单声道, rate 字段写 0.
pub(crate) fn audio_flags(format: u8, sound: &SoundParams) -> u8 {
    let (rate, size, stereo) = match format {
        sound_format::AAC => (3, 1, 1),
        sound_format::SPEEX => (0, 1, 0),
        _ => {
            let rate = match sound.sample_rate {
                0..=8_000 => 0,
                8_001..=11_025 => 1,
                11_026..=22_050 => 2,
                _ => 3,
            };
            (rate, u8::from(sound.bits >= 16), u8::from(sound.channels >= 2))
        }
    };
    (format << 4) | (rate << 2) | (size << 1) | stereo
}

/// 从音频头字节恢复编解码器与采样参数
pub(crate) fn parse_audio_flags(flags: u8) -> LiuResult<(CodecId, SoundParams)> {
    let format = flags >> 4;
    let rate = SOUND_RATES[usize::from((flags >> 2) & 0x03)];
    let bits = if flags & 0x02 != 0 { 16 } else { 8 };
    let channels = if flags & 0x01 != 0 { 2 } else { 1 };
    let params = |sample_rate| SoundParams::new(sample_rate, channels, bits);
    match format {
        sound_format::AAC => Ok((CodecId::Aac, params(rate))),
        sound_format::MP3 => Ok((CodecId::Mp3, params(rate))),
        sound_format::PCM_LE => Ok((CodecId::PcmS16le, params(rate))),
        sound_format::NELLYMOSER_16K_MONO => Ok((CodecId::Nellymoser, params(16_000))),
        sound_format::NELLYMOSER_8K_MONO => Ok((CodecId::Nellymoser, params(8_000))),
        sound_format::NELLYMOSER => Ok((CodecId::Nellymoser, params(rate))),
        sound_format::PCM_ALAW => Ok((CodecId::PcmAlaw, params(8_000))),
        sound_format::PCM_MULAW => Ok((CodecId::PcmMulaw, params(8_000))),
        sound_format::SPEEX => Ok((CodecId::Speex, SoundParams::SPEEX)),
        other => Err(LiuError::Unsupported(format!(
            "FLV: 不支持的 SoundFormat {other}"
        ))),
    }
}

/// FLV 格式探测器
pub struct FlvProbe;

impl FormatProbe for FlvProbe {
    fn probe(&self, data: &[u8], filename: Option<&str>) -> Option<ProbeScore> {
        // 检查 "FLV" 签名 + version
        if data.len() >= 4 && &data[..3] == b"FLV" && data[3] == 1 {
            return Some(SCORE_MAX);
        }
        probe_extension(FormatId::Flv, filename)
    }

    fn format_id(&self) -> FormatId {
        FormatId::Flv
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flv_音频头字节() {
        let sound = SoundParams::new(44_100, 2, 16);
        assert_eq!(audio_flags(sound_format::AAC, &sound), 0xAF);
        assert_eq!(audio_flags(sound_format::MP3, &sound), 0x2F);
        assert_eq!(audio_flags(sound_format::SPEEX, &SoundParams::SPEEX), 0xB2);

        let (codec, parsed) = parse_audio_flags(0x2F).unwrap();
        assert_eq!(codec, CodecId::Mp3);
        assert_eq!(parsed, sound);
    }

    #[test]
    fn test_flv_nellymoser_采样率() {
        let mono_8k = SoundParams::new(8_000, 1, 16);
        let format = codec_to_sound_format(CodecId::Nellymoser, &mono_8k).unwrap();
        assert_eq!(format, sound_format::NELLYMOSER_8K_MONO);
        let (codec, parsed) = parse_audio_flags(audio_flags(format, &mono_8k)).unwrap();
        assert_eq!(codec, CodecId::Nellymoser);
        assert_eq!(parsed, mono_8k);
    }

    #[test]
    fn test_flv_g711_采样率() {
        let sound = SoundParams::new(8_000, 1, 8);
        let flags = audio_flags(sound_format::PCM_ALAW, &sound);
        assert_eq!(parse_audio_flags(flags).unwrap(), (CodecId::PcmAlaw, sound));
    }

    #[test]
    fn test_flv_探测() {
        let probe = FlvProbe;
        assert_eq!(probe.probe(b"FLV\x01\x05", None), Some(SCORE_MAX));
        assert_eq!(probe.probe(b"", Some("a.FLV")), Some(50));
        assert_eq!(probe.probe(b"RIFF", Some("a.wav")), None);
    }

    #[test]
    fn test_flv_不支持的编解码器() {
        assert!(codec_to_video_id(CodecId::Aac).is_err());
        assert!(parse_audio_flags(0xF0).is_err());
    }
}
