//! 编解码器标识符.
//!
//! 每个标识对应一种帧变体 ([`crate::FrameBody`]), 与容器格式无关.

use std::fmt;

use liu_core::MediaType;

/// 编解码器标识符 (codecType)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum CodecId {
    // ========================
    // 视频
    // ========================
    /// H.264 / AVC
    H264,
    /// On2 VP6 (FLV)
    Vp6,

    // ========================
    // 音频
    // ========================
    /// AAC (Advanced Audio Coding)
    Aac,
    /// MP3 (MPEG Audio Layer III)
    Mp3,
    /// Nellymoser Asao
    Nellymoser,
    /// G.711 A-law
    PcmAlaw,
    /// G.711 mu-law
    PcmMulaw,
    /// Speex
    Speex,
    /// PCM 有符号 16 位小端
    PcmS16le,
}

impl CodecId {
    /// 获取编解码器对应的媒体类型
    pub const fn media_type(&self) -> MediaType {
        match self {
            Self::H264 | Self::Vp6 => MediaType::Video,
            Self::Aac
            | Self::Mp3
            | Self::Nellymoser
            | Self::PcmAlaw
            | Self::PcmMulaw
            | Self::Speex
            | Self::PcmS16le => MediaType::Audio,
        }
    }

    /// 获取编解码器名称
    pub const fn name(&self) -> &'static str {
        match self {
            Self::H264 => "h264",
            Self::Vp6 => "vp6",
            Self::Aac => "aac",
            Self::Mp3 => "mp3",
            Self::Nellymoser => "nellymoser",
            Self::PcmAlaw => "pcm_alaw",
            Self::PcmMulaw => "pcm_mulaw",
            Self::Speex => "speex",
            Self::PcmS16le => "pcm_s16le",
        }
    }

    /// 按名称查找
    pub fn from_name(name: &str) -> Option<Self> {
        let id = match name {
            "h264" | "avc" => Self::H264,
            "vp6" => Self::Vp6,
            "aac" => Self::Aac,
            "mp3" => Self::Mp3,
            "nellymoser" => Self::Nellymoser,
            "pcm_alaw" | "alaw" => Self::PcmAlaw,
            "pcm_mulaw" | "mulaw" => Self::PcmMulaw,
            "speex" => Self::Speex,
            "pcm_s16le" => Self::PcmS16le,
            _ => return None,
        };
        Some(id)
    }

    /// 该编解码器是否必须先有配置记录 (SPS/PPS, AudioSpecificConfig) 才能解码
    pub const fn requires_config(&self) -> bool {
        matches!(self, Self::H264 | Self::Aac)
    }
}

impl fmt::Display for CodecId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codec_id_媒体类型() {
        assert_eq!(CodecId::H264.media_type(), MediaType::Video);
        assert_eq!(CodecId::Speex.media_type(), MediaType::Audio);
    }

    #[test]
    fn test_codec_id_名称往返() {
        for id in [CodecId::H264, CodecId::Aac, CodecId::PcmMulaw, CodecId::Vp6] {
            assert_eq!(CodecId::from_name(id.name()), Some(id));
        }
        assert_eq!(CodecId::from_name("opus"), None);
    }

    #[test]
    fn test_codec_id_配置需求() {
        assert!(CodecId::H264.requires_config());
        assert!(CodecId::Aac.requires_config());
        assert!(!CodecId::Mp3.requires_config());
    }
}
