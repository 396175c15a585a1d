//! Matroska (MKV).
//!
//! 基于 EBML 的容器. 写入器输出 unknown-size 的 Segment 与已知大小的 Cluster,
//! 读取器按元素增量解析, 可进入 unknown-size 的 Segment/Cluster.

use liu_codec::CodecId;
use liu_core::{LiuError, LiuResult};

use crate::format_id::FormatId;
use crate::probe::{FormatProbe, ProbeScore, SCORE_MAX, probe_extension};

pub mod ebml;
pub mod reader;
pub mod writer;

pub use reader::{MkvDemux, MkvReader};
pub use writer::{MkvMux, MkvWriter};

/// CodecID 字符串
pub mod codec_ids {
    pub const H264: &str = "V_MPEG4/ISO/AVC";
    pub const AAC: &str = "A_AAC";
    pub const MP3: &str = "A_MPEG/L3";
    pub const PCM_LE: &str = "A_PCM/INT/LIT";
}

/// 编解码器 -> Matroska CodecID
pub(crate) fn codec_to_mkv(codec: CodecId) -> LiuResult<&'static str> {
    match codec {
        CodecId::H264 => Ok(codec_ids::H264),
        CodecId::Aac => Ok(codec_ids::AAC),
        CodecId::Mp3 => Ok(codec_ids::MP3),
        CodecId::PcmS16le => Ok(codec_ids::PCM_LE),
        _ => Err(LiuError::Unsupported(format!(
            "MKV: 不支持编解码器 {codec}"
        ))),
    }
}

/// Matroska CodecID -> 编解码器
///
/// `A_AAC/MPEG4/LC` 这类旧写法按前缀识别.
pub(crate) fn mkv_to_codec(codec_id: &str) -> Option<CodecId> {
    match codec_id {
        codec_ids::H264 => Some(CodecId::H264),
        codec_ids::MP3 => Some(CodecId::Mp3),
        codec_ids::PCM_LE => Some(CodecId::PcmS16le),
        s if s.starts_with(codec_ids::AAC) => Some(CodecId::Aac),
        _ => None,
    }
}

/// Matroska 格式探测器
pub struct MkvProbe;

impl FormatProbe for MkvProbe {
    fn probe(&self, data: &[u8], filename: Option<&str>) -> Option<ProbeScore> {
        // EBML 魔数
        if data.len() >= 4 && data[..4] == [0x1A, 0x45, 0xDF, 0xA3] {
            return Some(SCORE_MAX);
        }
        probe_extension(FormatId::Matroska, filename)
    }

    fn format_id(&self) -> FormatId {
        FormatId::Matroska
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mkv_codec_id_映射() {
        assert_eq!(codec_to_mkv(CodecId::H264).unwrap(), "V_MPEG4/ISO/AVC");
        assert!(codec_to_mkv(CodecId::Vp6).is_err());
        assert_eq!(mkv_to_codec("A_AAC/MPEG4/LC"), Some(CodecId::Aac));
        assert_eq!(mkv_to_codec("A_PCM/INT/LIT"), Some(CodecId::PcmS16le));
        assert_eq!(mkv_to_codec("V_VP9"), None);
    }

    #[test]
    fn test_mkv_探测() {
        let probe = MkvProbe;
        assert_eq!(probe.probe(&[0x1A, 0x45, 0xDF, 0xA3, 0x01], None), Some(SCORE_MAX));
        assert_eq!(probe.probe(b"", Some("x.mka")), Some(50));
        assert_eq!(probe.probe(b"FLV", None), None);
    }
}
