//! 分片 MP4 (ISO BMFF, fMP4).
//!
//! # 输出结构
//! ```text
//! ftyp
//! moov (所有轨道就绪后写出, 采样表为空)
//! ├── mvhd
//! ├── trak...
//! └── mvex → trex...
//! moof + mdat   (分片, 每个有数据的轨道一个 traf)
//! moof + mdat
//! ...
//! ```

use bitflags::bitflags;

use liu_codec::CodecId;
use liu_core::{LiuError, LiuResult};

use crate::format_id::FormatId;
use crate::probe::{FormatProbe, ProbeScore, SCORE_MAX, probe_extension};

pub mod boxes;
pub mod reader;
pub mod writer;

pub use reader::{Fmp4Demux, Mp4Reader};
pub use writer::{Fmp4Mux, Mp4Writer};

/// 视频轨道的 timescale
pub const VIDEO_TIMESCALE: u32 = 90_000;

/// 同步采样的 sample_flags (sample_depends_on = 2)
pub const SAMPLE_FLAGS_SYNC: u32 = 0x0200_0000;
/// 非同步采样的 sample_flags (sample_depends_on = 1, is_non_sync_sample = 1)
pub const SAMPLE_FLAGS_NON_SYNC: u32 = 0x0101_0000;
/// sample_is_non_sync_sample 位
pub const SAMPLE_IS_NON_SYNC: u32 = 0x0001_0000;

bitflags! {
    /// tfhd flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct TfhdFlags: u32 {
        const BASE_DATA_OFFSET = 0x00_0001;
        const SAMPLE_DESCRIPTION_INDEX = 0x00_0002;
        const DEFAULT_SAMPLE_DURATION = 0x00_0008;
        const DEFAULT_SAMPLE_SIZE = 0x00_0010;
        const DEFAULT_SAMPLE_FLAGS = 0x00_0020;
        const DURATION_IS_EMPTY = 0x01_0000;
        const DEFAULT_BASE_IS_MOOF = 0x02_0000;
    }
}

bitflags! {
    /// trun flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct TrunFlags: u32 {
        const DATA_OFFSET = 0x001;
        const FIRST_SAMPLE_FLAGS = 0x004;
        const SAMPLE_DURATION = 0x100;
        const SAMPLE_SIZE = 0x200;
        const SAMPLE_FLAGS = 0x400;
        const SAMPLE_COMPOSITION_OFFSET = 0x800;
    }
}

/// 检查编解码器能否写入 fMP4
pub(crate) fn check_codec(codec: CodecId) -> LiuResult<()> {
    match codec {
        CodecId::H264 | CodecId::Aac => Ok(()),
        _ => Err(LiuError::Unsupported(format!(
            "MP4: 不支持编解码器 {codec}"
        ))),
    }
}

/// MP4 格式探测器
pub struct Mp4Probe;

impl FormatProbe for Mp4Probe {
    fn probe(&self, data: &[u8], filename: Option<&str>) -> Option<ProbeScore> {
        if data.len() >= 8 && &data[4..8] == b"ftyp" {
            return Some(SCORE_MAX);
        }
        probe_extension(FormatId::Mp4, filename)
    }

    fn format_id(&self) -> FormatId {
        FormatId::Mp4
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mp4_探测() {
        let data = [0, 0, 0, 0x18, b'f', b't', b'y', b'p', b'i', b's', b'o', b'm'];
        assert_eq!(Mp4Probe.probe(&data, None), Some(SCORE_MAX));
        assert_eq!(Mp4Probe.probe(b"", Some("a.mkv")), None);
        assert_eq!(Mp4Probe.probe(b"", Some("seg-001.m4s")), Some(50));
    }

    #[test]
    fn test_mp4_trun_标志() {
        let flags = TrunFlags::DATA_OFFSET
            | TrunFlags::SAMPLE_DURATION
            | TrunFlags::SAMPLE_SIZE
            | TrunFlags::SAMPLE_FLAGS
            | TrunFlags::SAMPLE_COMPOSITION_OFFSET;
        assert_eq!(flags.bits(), 0xF01);
        assert!(check_codec(CodecId::Mp3).is_err());
    }
}
