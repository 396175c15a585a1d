//! 容器格式标识符.

use std::fmt;

/// 容器格式标识符
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum FormatId {
    /// Flash Video (FLV)
    Flv,
    /// Matroska (MKV)
    Matroska,
    /// MPEG Transport Stream (TS)
    MpegTs,
    /// 分片 MP4 (fMP4)
    Mp4,
}

impl FormatId {
    /// 所有已知格式标识的列表
    pub const ALL: &[FormatId] = &[Self::Flv, Self::Matroska, Self::MpegTs, Self::Mp4];

    /// 获取格式名称 (与 FFmpeg 的 `-f` 名称一致)
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Flv => "flv",
            Self::Matroska => "matroska",
            Self::MpegTs => "mpegts",
            Self::Mp4 => "mp4",
        }
    }

    /// 获取格式常用的文件扩展名
    pub const fn extensions(&self) -> &'static [&'static str] {
        match self {
            Self::Flv => &["flv"],
            Self::Matroska => &["mkv", "mka"],
            Self::MpegTs => &["ts", "m2ts", "mts"],
            Self::Mp4 => &["mp4", "m4s", "m4a", "m4v"],
        }
    }

    /// 根据名称查找格式 (大小写不敏感, 接受 "mkv" 这样的别名)
    pub fn from_name(name: &str) -> Option<FormatId> {
        let lower = name.to_ascii_lowercase();
        Self::ALL
            .iter()
            .find(|id| id.name() == lower || id.extensions().contains(&lower.as_str()))
            .copied()
    }

    /// 根据文件扩展名猜测格式
    pub fn from_extension(ext: &str) -> Option<FormatId> {
        let ext_lower = ext.to_lowercase();
        Self::ALL
            .iter()
            .find(|id| id.extensions().contains(&ext_lower.as_str()))
            .copied()
    }

    /// 从文件路径猜测格式
    pub fn from_filename(filename: &str) -> Option<FormatId> {
        let ext = filename.rsplit('.').next()?;
        Self::from_extension(ext)
    }
}

impl fmt::Display for FormatId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_id_名称查找() {
        assert_eq!(FormatId::from_name("MKV"), Some(FormatId::Matroska));
        assert_eq!(FormatId::from_name("mpegts"), Some(FormatId::MpegTs));
        assert_eq!(FormatId::from_name("avi"), None);
        assert_eq!(FormatId::from_filename("live/seg-001.m4s"), Some(FormatId::Mp4));
        assert_eq!(FormatId::Flv.to_string(), "flv");
    }
}
