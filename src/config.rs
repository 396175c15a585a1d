//! 会话配置.
//!
//! 以 JSON 描述一次封装会话: 目标格式、轨道声明与各格式参数, 可选附带日志配置.
//!
//! ```json
//! {
//!   "format": "mpegts",
//!   "tracks": [{ "codec": "h264" }, { "codec": "aac", "reorder_window": 4 }],
//!   "tie_break": "video_first"
//! }
//! ```

use std::path::Path;

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};

use liu_codec::CodecId;
use liu_format::{
    ContainerReader, ContainerWriter, FormatId, TieBreak, TrackSpec, WriterOptions,
};

use crate::logging::LoggingConfig;

/// 单条轨道的配置
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct TrackConfig {
    /// 编解码器名称, 如 `h264` / `aac`
    pub codec: String,
    pub track_id: u32,
    /// 为空时按媒体类型取默认窗口
    pub reorder_window: Option<usize>,
    pub reorder_disabled: bool,
    pub width: Option<u32>,
    pub height: Option<u32>,
}

impl TrackConfig {
    fn to_spec(&self) -> Result<TrackSpec> {
        let codec = CodecId::from_name(&self.codec)
            .with_context(|| format!("未知编解码器: {}", self.codec))?;
        let mut spec = TrackSpec::new(codec).with_track_id(self.track_id);
        if let Some(window) = self.reorder_window {
            spec = spec.with_reorder_window(window);
        }
        if self.reorder_disabled {
            spec = spec.without_reorder();
        }
        if let (Some(width), Some(height)) = (self.width, self.height) {
            spec = spec.with_dimensions(width, height);
        }
        Ok(spec)
    }
}

/// 交织规则
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TieBreakConfig {
    #[default]
    DeclarationOrder,
    VideoFirst,
}

impl From<TieBreakConfig> for TieBreak {
    fn from(value: TieBreakConfig) -> Self {
        match value {
            TieBreakConfig::DeclarationOrder => TieBreak::DeclarationOrder,
            TieBreakConfig::VideoFirst => TieBreak::VideoFirst,
        }
    }
}

/// 会话配置
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct SessionConfig {
    /// 格式名, 如 `flv` / `matroska` / `mpegts` / `mp4`
    pub format: String,
    pub tracks: Vec<TrackConfig>,
    pub tie_break: TieBreakConfig,
    pub timecode_scale_ns: u64,
    pub cluster_duration_ms: u64,
    pub fragment_duration_ms: u64,
    pub psi_interval: u32,
    pub logging: Option<LoggingConfig>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        let defaults = WriterOptions::default();
        Self {
            format: FormatId::Flv.name().into(),
            tracks: Vec::new(),
            tie_break: TieBreakConfig::default(),
            timecode_scale_ns: defaults.timecode_scale_ns,
            cluster_duration_ms: defaults.cluster_duration_ms,
            fragment_duration_ms: defaults.fragment_duration_ms,
            psi_interval: defaults.psi_interval,
            logging: None,
        }
    }
}

impl SessionConfig {
    /// 从 JSON 字符串解析并校验
    pub fn from_json_str(text: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(text).context("解析会话配置失败")?;
        config.validate()?;
        Ok(config)
    }

    /// 从 JSON 文件读取
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("读取会话配置失败, path={}", path.display()))?;
        Self::from_json_str(&text).with_context(|| format!("会话配置无效, path={}", path.display()))
    }

    pub fn validate(&self) -> Result<()> {
        self.format_id()?;
        if self.tracks.is_empty() {
            bail!("至少需要声明一条轨道");
        }
        if self.timecode_scale_ns == 0 {
            bail!("timecode_scale_ns 必须大于 0");
        }
        if self.fragment_duration_ms == 0 {
            bail!("fragment_duration_ms 必须大于 0");
        }
        for track in &self.tracks {
            track.to_spec()?;
        }
        Ok(())
    }

    pub fn format_id(&self) -> Result<FormatId> {
        FormatId::from_name(&self.format).with_context(|| format!("未知容器格式: {}", self.format))
    }

    /// 转换为写入器选项
    pub fn writer_options(&self) -> Result<WriterOptions> {
        let tracks = self
            .tracks
            .iter()
            .map(TrackConfig::to_spec)
            .collect::<Result<Vec<_>>>()?;
        Ok(WriterOptions {
            tracks,
            tie_break: self.tie_break.into(),
            timecode_scale_ns: self.timecode_scale_ns,
            cluster_duration_ms: self.cluster_duration_ms,
            fragment_duration_ms: self.fragment_duration_ms,
            psi_interval: self.psi_interval,
        })
    }

    /// 按配置创建写入器
    pub fn create_writer(&self) -> Result<Box<dyn ContainerWriter>> {
        let format_id = self.format_id()?;
        let options = self.writer_options()?;
        crate::default_format_registry()
            .create_writer(format_id, &options)
            .with_context(|| format!("创建 {format_id} 写入器失败"))
    }

    /// 按配置的格式创建读取器
    pub fn create_reader(&self) -> Result<Box<dyn ContainerReader>> {
        let format_id = self.format_id()?;
        crate::default_format_registry()
            .create_reader(format_id)
            .with_context(|| format!("创建 {format_id} 读取器失败"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_config_默认值() {
        let config = SessionConfig::from_json_str(r#"{"tracks": [{"codec": "aac"}]}"#).unwrap();
        assert_eq!(config.format_id().unwrap(), FormatId::Flv);
        assert_eq!(config.tie_break, TieBreakConfig::DeclarationOrder);
        assert_eq!(config.timecode_scale_ns, 1_000_000);
        assert!(config.logging.is_none());
    }

    #[test]
    fn test_config_转换写入器选项() {
        let config = SessionConfig::from_json_str(
            r#"{
                "format": "mpegts",
                "tracks": [
                    {"codec": "h264", "width": 1280, "height": 720},
                    {"codec": "aac", "reorder_window": 4, "track_id": 2}
                ],
                "tie_break": "video_first",
                "psi_interval": 0
            }"#,
        )
        .unwrap();
        let options = config.writer_options().unwrap();
        assert_eq!(options.tie_break, TieBreak::VideoFirst);
        assert_eq!(options.psi_interval, 0);
        assert_eq!(options.tracks[0].codec, CodecId::H264);
        assert_eq!(options.tracks[0].width, Some(1280));
        assert_eq!(options.tracks[1].reorder_window, 4);
        assert_eq!(options.tracks[1].track_id, 2);

        let writer = config.create_writer().unwrap();
        assert_eq!(writer.format_id(), FormatId::MpegTs);
        let reader = config.create_reader().unwrap();
        assert_eq!(reader.format_id(), FormatId::MpegTs);
    }

    #[test]
    fn test_config_校验失败() {
        assert!(SessionConfig::from_json_str(r#"{"tracks": []}"#).is_err());
        assert!(SessionConfig::from_json_str(r#"{"tracks": [{"codec": "opus"}]}"#).is_err());
        assert!(
            SessionConfig::from_json_str(r#"{"format": "avi", "tracks": [{"codec": "aac"}]}"#)
                .is_err()
        );
        assert!(SessionConfig::from_json_str("{").is_err());
    }

    #[test]
    fn test_config_从文件读取() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"format": "matroska", "tracks": [{{"codec": "mp3"}}], "logging": {{"level": "debug"}}}}"#
        )
        .unwrap();
        let config = SessionConfig::from_file(file.path()).unwrap();
        assert_eq!(config.format_id().unwrap(), FormatId::Matroska);
        assert_eq!(config.logging.unwrap().level, "debug");
        assert!(SessionConfig::from_file("/nonexistent/liu.json").is_err());
    }
}
