//! 媒体帧 (Frame).
//!
//! 一个 Frame 是一次 write/read 调用中流经核心的最小媒体单元.
//! 公共属性放在 [`FrameHeader`] 中, 每种编解码器只携带自己需要的字段 ([`FrameBody`]).
//!
//! 负载约定:
//! - H.264: Annex-B (起始码分隔). 配置记录为 SPS + PPS (也接受 avcC 记录)
//! - AAC: 配置记录为 AudioSpecificConfig, 媒体帧为裸 AAC 帧 (无 ADTS 头)
//! - 其余音频: 编码后的原始帧

use bytes::Bytes;
use liu_core::timestamp::rescale;
use liu_core::{LiuError, LiuResult, MediaType, Rational};

use crate::codec_id::CodecId;

/// H.264 NAL 单元类别
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum H264Unit {
    /// 参数集 (SPS/PPS), 即配置记录
    Config,
    /// 含 IDR 切片的访问单元
    Keyframe,
    /// 非 IDR 访问单元
    Interframe,
    /// 无法归类
    Unknown,
}

/// AAC 数据类别
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AacUnit {
    /// AudioSpecificConfig
    Config,
    /// 裸 AAC 帧
    Raw,
}

/// 音频格式参数 (FLV 音频标志字节、Matroska Audio 元素使用)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SoundParams {
    /// 采样率 (Hz)
    pub sample_rate: u32,
    /// 声道数
    pub channels: u8,
    /// 采样位深
    pub bits: u8,
}

impl SoundParams {
    pub const fn new(sample_rate: u32, channels: u8, bits: u8) -> Self {
        Self {
            sample_rate,
            channels,
            bits,
        }
    }

    /// Speex 在 FLV 中固定为 16kHz 单声道
    pub const SPEEX: Self = Self::new(16_000, 1, 16);
}

impl Default for SoundParams {
    fn default() -> Self {
        Self::new(44_100, 2, 16)
    }
}

/// 帧公共头
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// 轨道类型
    pub kind: MediaType,
    /// 显示时间戳
    pub pts: i64,
    /// 解码时间戳
    pub dts: i64,
    /// 时间基
    pub time_base: Rational,
    /// 轨道标识
    pub track_id: u32,
}

/// 按编解码器区分的帧内容
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameBody {
    H264 { unit: H264Unit, data: Bytes },
    Vp6 { keyframe: bool, data: Bytes },
    Aac { unit: AacUnit, data: Bytes },
    Mp3 { sound: SoundParams, data: Bytes },
    Nellymoser { sound: SoundParams, data: Bytes },
    PcmAlaw { sound: SoundParams, data: Bytes },
    PcmMulaw { sound: SoundParams, data: Bytes },
    Speex { data: Bytes },
    PcmS16le { sound: SoundParams, data: Bytes },
}

/// 媒体帧
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub header: FrameHeader,
    pub body: FrameBody,
}

impl Frame {
    fn with_body(pts: i64, dts: i64, time_base: Rational, body: FrameBody) -> Self {
        let kind = match body {
            FrameBody::H264 { .. } | FrameBody::Vp6 { .. } => MediaType::Video,
            _ => MediaType::Audio,
        };
        Self {
            header: FrameHeader {
                kind,
                pts,
                dts,
                time_base,
                track_id: 0,
            },
            body,
        }
    }

    /// 创建 H.264 帧
    pub fn h264(
        unit: H264Unit,
        pts: i64,
        dts: i64,
        time_base: Rational,
        data: impl Into<Bytes>,
    ) -> Self {
        let data = data.into();
        Self::with_body(pts, dts, time_base, FrameBody::H264 { unit, data })
    }

    /// 创建 VP6 帧
    pub fn vp6(keyframe: bool, pts: i64, time_base: Rational, data: impl Into<Bytes>) -> Self {
        let data = data.into();
        Self::with_body(pts, pts, time_base, FrameBody::Vp6 { keyframe, data })
    }

    /// 创建 AAC 帧 (配置记录或裸帧)
    pub fn aac(unit: AacUnit, pts: i64, time_base: Rational, data: impl Into<Bytes>) -> Self {
        let data = data.into();
        Self::with_body(pts, pts, time_base, FrameBody::Aac { unit, data })
    }

    /// 创建无配置记录的音频帧 (MP3, Nellymoser, G.711, Speex, PCM)
    pub fn audio(
        codec: CodecId,
        sound: SoundParams,
        pts: i64,
        time_base: Rational,
        data: impl Into<Bytes>,
    ) -> LiuResult<Self> {
        let data = data.into();
        let body = match codec {
            CodecId::Mp3 => FrameBody::Mp3 { sound, data },
            CodecId::Nellymoser => FrameBody::Nellymoser { sound, data },
            CodecId::PcmAlaw => FrameBody::PcmAlaw { sound, data },
            CodecId::PcmMulaw => FrameBody::PcmMulaw { sound, data },
            CodecId::Speex => FrameBody::Speex { data },
            CodecId::PcmS16le => FrameBody::PcmS16le { sound, data },
            other => {
                return Err(LiuError::InvalidArgument(format!(
                    "{other} 不是无配置记录的音频编解码器"
                )));
            }
        };
        Ok(Self::with_body(pts, pts, time_base, body))
    }

    /// 设置轨道标识
    pub fn with_track_id(mut self, track_id: u32) -> Self {
        self.header.track_id = track_id;
        self
    }

    pub fn codec_id(&self) -> CodecId {
        match self.body {
            FrameBody::H264 { .. } => CodecId::H264,
            FrameBody::Vp6 { .. } => CodecId::Vp6,
            FrameBody::Aac { .. } => CodecId::Aac,
            FrameBody::Mp3 { .. } => CodecId::Mp3,
            FrameBody::Nellymoser { .. } => CodecId::Nellymoser,
            FrameBody::PcmAlaw { .. } => CodecId::PcmAlaw,
            FrameBody::PcmMulaw { .. } => CodecId::PcmMulaw,
            FrameBody::Speex { .. } => CodecId::Speex,
            FrameBody::PcmS16le { .. } => CodecId::PcmS16le,
        }
    }

    pub fn kind(&self) -> MediaType {
        self.header.kind
    }

    pub fn pts(&self) -> i64 {
        self.header.pts
    }

    pub fn dts(&self) -> i64 {
        self.header.dts
    }

    pub fn time_base(&self) -> Rational {
        self.header.time_base
    }

    pub fn track_id(&self) -> u32 {
        self.header.track_id
    }

    /// 帧负载
    pub fn data(&self) -> &Bytes {
        match &self.body {
            FrameBody::H264 { data, .. }
            | FrameBody::Vp6 { data, .. }
            | FrameBody::Aac { data, .. }
            | FrameBody::Mp3 { data, .. }
            | FrameBody::Nellymoser { data, .. }
            | FrameBody::PcmAlaw { data, .. }
            | FrameBody::PcmMulaw { data, .. }
            | FrameBody::Speex { data }
            | FrameBody::PcmS16le { data, .. } => data,
        }
    }

    /// H.264 NAL 类别
    pub fn h264_unit(&self) -> Option<H264Unit> {
        match self.body {
            FrameBody::H264 { unit, .. } => Some(unit),
            _ => None,
        }
    }

    /// AAC 数据类别
    pub fn aac_unit(&self) -> Option<AacUnit> {
        match self.body {
            FrameBody::Aac { unit, .. } => Some(unit),
            _ => None,
        }
    }

    /// 编解码器内的子类别名称, 用于日志
    pub fn codec_subtype(&self) -> &'static str {
        match self.body {
            FrameBody::H264 { unit, .. } => match unit {
                H264Unit::Config => "config",
                H264Unit::Keyframe => "keyframe",
                H264Unit::Interframe => "interframe",
                H264Unit::Unknown => "unknown",
            },
            FrameBody::Vp6 { keyframe: true, .. } => "keyframe",
            FrameBody::Vp6 { keyframe: false, .. } => "interframe",
            FrameBody::Aac {
                unit: AacUnit::Config,
                ..
            } => "config",
            _ => "raw",
        }
    }

    /// 是否为配置记录 (序列头 / extradata)
    pub fn is_config_record(&self) -> bool {
        matches!(
            self.body,
            FrameBody::H264 {
                unit: H264Unit::Config,
                ..
            } | FrameBody::Aac {
                unit: AacUnit::Config,
                ..
            }
        )
    }

    /// 是否可独立解码 (音频帧总是关键帧)
    pub fn is_keyframe(&self) -> bool {
        match self.body {
            FrameBody::H264 { unit, .. } => unit == H264Unit::Keyframe,
            FrameBody::Vp6 { keyframe, .. } => keyframe,
            _ => true,
        }
    }

    /// 音频格式参数 (AAC 的参数在 AudioSpecificConfig 中)
    pub fn sound(&self) -> Option<SoundParams> {
        match self.body {
            FrameBody::Mp3 { sound, .. }
            | FrameBody::Nellymoser { sound, .. }
            | FrameBody::PcmAlaw { sound, .. }
            | FrameBody::PcmMulaw { sound, .. }
            | FrameBody::PcmS16le { sound, .. } => Some(sound),
            FrameBody::Speex { .. } => Some(SoundParams::SPEEX),
            _ => None,
        }
    }

    /// 替换负载, 保留其余字段
    pub fn with_data(&self, data: impl Into<Bytes>) -> Self {
        let data = data.into();
        let body = match &self.body {
            FrameBody::H264 { unit, .. } => FrameBody::H264 { unit: *unit, data },
            FrameBody::Vp6 { keyframe, .. } => FrameBody::Vp6 {
                keyframe: *keyframe,
                data,
            },
            FrameBody::Aac { unit, .. } => FrameBody::Aac { unit: *unit, data },
            FrameBody::Mp3 { sound, .. } => FrameBody::Mp3 {
                sound: *sound,
                data,
            },
            FrameBody::Nellymoser { sound, .. } => FrameBody::Nellymoser {
                sound: *sound,
                data,
            },
            FrameBody::PcmAlaw { sound, .. } => FrameBody::PcmAlaw {
                sound: *sound,
                data,
            },
            FrameBody::PcmMulaw { sound, .. } => FrameBody::PcmMulaw {
                sound: *sound,
                data,
            },
            FrameBody::Speex { .. } => FrameBody::Speex { data },
            FrameBody::PcmS16le { sound, .. } => FrameBody::PcmS16le {
                sound: *sound,
                data,
            },
        };
        Self {
            header: self.header,
            body,
        }
    }

    /// 换算到新的时间基 (pts/dts 截断)
    pub fn rescaled(&self, time_base: Rational) -> LiuResult<Self> {
        let mut frame = self.clone();
        frame.header.pts = rescale(self.header.pts, self.header.time_base, time_base)?;
        frame.header.dts = rescale(self.header.dts, self.header.time_base, time_base)?;
        frame.header.time_base = time_base;
        Ok(frame)
    }
}
