//! 写入器配置: 轨道声明与格式参数.

use liu_codec::CodecId;
use liu_core::{LiuError, LiuResult, MediaType};

use crate::reorder::{DEFAULT_AUDIO_WINDOW, DEFAULT_VIDEO_WINDOW};

/// 不同轨道的下一帧 DTS 相同时的选择规则
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum TieBreak {
    /// 按轨道声明顺序
    #[default]
    DeclarationOrder,
    /// 视频轨优先, 其余按声明顺序
    VideoFirst,
}

/// 轨道声明
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackSpec {
    pub codec: CodecId,
    /// 同一编解码器声明多条轨道时, 帧按此标识路由
    pub track_id: u32,
    /// 重排窗口大小
    pub reorder_window: usize,
    pub reorder_disabled: bool,
    /// 视频宽度 (仅用于写入元数据)
    pub width: Option<u32>,
    pub height: Option<u32>,
}

impl TrackSpec {
    /// 以默认窗口声明一条轨道
    pub fn new(codec: CodecId) -> Self {
        let reorder_window = match codec.media_type() {
            MediaType::Video => DEFAULT_VIDEO_WINDOW,
            MediaType::Audio => DEFAULT_AUDIO_WINDOW,
        };
        Self {
            codec,
            track_id: 0,
            reorder_window,
            reorder_disabled: false,
            width: None,
            height: None,
        }
    }

    /// 声明视频轨道 (编解码器必须是视频)
    pub fn video(codec: CodecId) -> LiuResult<Self> {
        Self::checked(codec, MediaType::Video)
    }

    /// 声明音频轨道 (编解码器必须是音频)
    pub fn audio(codec: CodecId) -> LiuResult<Self> {
        Self::checked(codec, MediaType::Audio)
    }

    fn checked(codec: CodecId, kind: MediaType) -> LiuResult<Self> {
        if codec.media_type() != kind {
            return Err(LiuError::InvalidArgument(format!(
                "{codec} 不是{}编解码器",
                match kind {
                    MediaType::Video => "视频",
                    MediaType::Audio => "音频",
                }
            )));
        }
        Ok(Self::new(codec))
    }

    pub fn with_track_id(mut self, track_id: u32) -> Self {
        self.track_id = track_id;
        self
    }

    pub fn with_reorder_window(mut self, window: usize) -> Self {
        self.reorder_window = window;
        self
    }

    /// 关闭重排 (帧已按 DTS 有序)
    pub fn without_reorder(mut self) -> Self {
        self.reorder_disabled = true;
        self
    }

    pub fn with_dimensions(mut self, width: u32, height: u32) -> Self {
        self.width = Some(width);
        self.height = Some(height);
        self
    }

    pub fn kind(&self) -> MediaType {
        self.codec.media_type()
    }
}

/// 写入器选项
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriterOptions {
    /// 轨道声明, 顺序即声明顺序
    pub tracks: Vec<TrackSpec>,
    pub tie_break: TieBreak,
    /// Matroska TimecodeScale (纳秒)
    pub timecode_scale_ns: u64,
    /// Matroska 单个 Cluster 的最长时长 (毫秒)
    pub cluster_duration_ms: u64,
    /// fMP4 分片目标时长 (毫秒)
    pub fragment_duration_ms: u64,
    /// MPEG-TS 每隔多少个包重发 PAT/PMT
    pub psi_interval: u32,
}

impl WriterOptions {
    pub fn new(tracks: Vec<TrackSpec>) -> Self {
        Self {
            tracks,
            ..Self::default()
        }
    }

    pub fn with_tie_break(mut self, tie_break: TieBreak) -> Self {
        self.tie_break = tie_break;
        self
    }
}

impl Default for WriterOptions {
    fn default() -> Self {
        Self {
            tracks: Vec::new(),
            tie_break: TieBreak::default(),
            timecode_scale_ns: 1_000_000,
            cluster_duration_ms: 5_000,
            fragment_duration_ms: 1_000,
            psi_interval: 40,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_options_默认窗口() {
        assert_eq!(TrackSpec::new(CodecId::H264).reorder_window, 9);
        assert_eq!(TrackSpec::new(CodecId::Aac).reorder_window, 8);
        let opts = WriterOptions::new(vec![TrackSpec::new(CodecId::Mp3).without_reorder()]);
        assert!(opts.tracks[0].reorder_disabled);
        assert_eq!(opts.tie_break, TieBreak::DeclarationOrder);
        assert_eq!(opts.timecode_scale_ns, 1_000_000);
    }

    #[test]
    fn test_options_按类型声明轨道() {
        assert_eq!(TrackSpec::video(CodecId::H264).unwrap().reorder_window, 9);
        assert_eq!(TrackSpec::audio(CodecId::Speex).unwrap().reorder_window, 8);
        assert!(TrackSpec::video(CodecId::Aac).is_err());
    }
}
