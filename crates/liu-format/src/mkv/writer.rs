//! Matroska 写入器.
//!
//! # 输出结构
//! ```text
//! EBML Header (DocType: "matroska")
//! Segment (unknown size)
//! ├── Info (TimecodeScale, MuxingApp, WritingApp)
//! ├── Tracks (每条轨道一个 TrackEntry, 所有轨道就绪后写出)
//! └── Cluster... (已知大小, SimpleBlock 数据)
//! ```
//!
//! Cluster 在内存中攒满后整体输出. 满足以下任一条件时开启新 Cluster:
//! - 时长达到 `cluster_duration_ms`
//! - 块时间戳相对 Cluster 时间戳超出 i16
//! - 视频关键帧且当前 Cluster 已有数据

use bitflags::bitflags;
use log::{debug, warn};

use liu_codec::{CodecId, Frame, h264};
use liu_core::{LiuError, LiuResult, MediaType, Rational};

use super::codec_to_mkv;
use super::ebml::{self, put_element, put_float, put_id, put_string, put_uint};
use crate::format_id::FormatId;
use crate::options::WriterOptions;
use crate::writer::{ContainerWriter, FormatWriter, Writer, WriterTrack};

/// Matroska 写入器
pub type MkvWriter = Writer<MkvMux>;

bitflags! {
    /// SimpleBlock 标志字节
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct BlockFlags: u8 {
        const KEYFRAME = 0x80;
        const INVISIBLE = 0x08;
        const DISCARDABLE = 0x01;
    }
}

/// Matroska 字节布局
pub struct MkvMux {
    /// TimecodeScale (纳秒)
    timecode_scale_ns: u64,
    /// Cluster 最长时长 (TimecodeScale 单位)
    cluster_duration: i64,
    /// 当前 Cluster 的数据 (不含 Cluster 头)
    cluster_buf: Vec<u8>,
    /// 当前 Cluster 的时间戳
    cluster_timecode: Option<i64>,
    /// 当前 Cluster 中的块数
    cluster_blocks: usize,
}

impl MkvMux {
    pub fn new(options: &WriterOptions) -> LiuResult<Self> {
        for spec in &options.tracks {
            codec_to_mkv(spec.codec)?;
        }
        let scale = options.timecode_scale_ns;
        if scale == 0 || !Rational::from_nanos(scale).is_valid() {
            return Err(LiuError::InvalidArgument(format!(
                "MKV: TimecodeScale 非法: {scale}ns"
            )));
        }
        let cluster_duration =
            (options.cluster_duration_ms.saturating_mul(1_000_000) / scale).max(1) as i64;
        Ok(Self {
            timecode_scale_ns: scale,
            cluster_duration,
            cluster_buf: Vec::new(),
            cluster_timecode: None,
            cluster_blocks: 0,
        })
    }

    /// 创建 Matroska 写入器
    pub fn writer(options: &WriterOptions) -> LiuResult<MkvWriter> {
        Writer::new(Self::new(options)?, options)
    }

    /// 创建 Matroska 写入器 (工厂函数)
    pub fn create(options: &WriterOptions) -> LiuResult<Box<dyn ContainerWriter>> {
        Ok(Box::new(Self::writer(options)?))
    }

    /// 刷新当前 Cluster 到输出
    fn flush_cluster(&mut self, out: &mut Vec<u8>) -> LiuResult<()> {
        let Some(timecode) = self.cluster_timecode.take() else {
            return Ok(());
        };
        put_element(out, ebml::CLUSTER, &self.cluster_buf)?;
        debug!(
            "MKV: 输出 Cluster, timecode={timecode}, {} 个块, {} 字节",
            self.cluster_blocks,
            self.cluster_buf.len()
        );
        self.cluster_buf.clear();
        self.cluster_blocks = 0;
        Ok(())
    }

    /// 开始新 Cluster
    fn start_cluster(&mut self, timecode: i64) -> LiuResult<()> {
        self.cluster_buf.clear();
        self.cluster_blocks = 0;
        let timecode = timecode.max(0);
        put_uint(&mut self.cluster_buf, ebml::CLUSTER_TIMESTAMP, timecode as u64)?;
        self.cluster_timecode = Some(timecode);
        Ok(())
    }

    fn needs_new_cluster(&self, timecode: i64, video_keyframe: bool) -> bool {
        let Some(cluster_tc) = self.cluster_timecode else {
            return true;
        };
        let delta = timecode - cluster_tc;
        i16::try_from(delta).is_err()
            || delta >= self.cluster_duration
            || (video_keyframe && self.cluster_blocks > 0)
    }

    /// 构建一个 TrackEntry
    fn track_entry(track: &WriterTrack) -> LiuResult<Vec<u8>> {
        let number = track.index as u64 + 1;
        let mut content = Vec::new();
        put_uint(&mut content, ebml::TRACK_NUMBER, number)?;
        put_uint(&mut content, ebml::TRACK_UID, number)?;
        let track_type = match track.kind() {
            MediaType::Video => ebml::TRACK_TYPE_VIDEO,
            MediaType::Audio => ebml::TRACK_TYPE_AUDIO,
        };
        put_uint(&mut content, ebml::TRACK_TYPE, track_type)?;
        put_string(&mut content, ebml::TRACK_CODEC_ID, codec_to_mkv(track.codec())?)?;

        // CodecPrivate
        if let Some(config) = track.config_data() {
            let private = match track.codec() {
                CodecId::H264 => h264::config_to_avcc(config)?,
                _ => config.to_vec(),
            };
            put_element(&mut content, ebml::TRACK_CODEC_PRIVATE, &private)?;
        }

        match track.kind() {
            MediaType::Video => {
                if let (Some(width), Some(height)) = (track.spec.width, track.spec.height) {
                    let mut video = Vec::new();
                    put_uint(&mut video, ebml::VIDEO_PIXEL_WIDTH, u64::from(width))?;
                    put_uint(&mut video, ebml::VIDEO_PIXEL_HEIGHT, u64::from(height))?;
                    put_element(&mut content, ebml::VIDEO_SETTINGS, &video)?;
                }
            }
            MediaType::Audio => {
                let sound = track.sound_params();
                let mut audio = Vec::new();
                put_float(&mut audio, ebml::AUDIO_SAMPLING_FREQ, f64::from(sound.sample_rate))?;
                put_uint(&mut audio, ebml::AUDIO_CHANNELS, u64::from(sound.channels))?;
                if track.codec() == CodecId::PcmS16le {
                    put_uint(&mut audio, ebml::AUDIO_BIT_DEPTH, u64::from(sound.bits))?;
                }
                put_element(&mut content, ebml::AUDIO_SETTINGS, &audio)?;
            }
        }

        let mut buf = Vec::new();
        put_element(&mut buf, ebml::TRACK_ENTRY, &content)?;
        Ok(buf)
    }
}

impl FormatWriter for MkvMux {
    fn format_id(&self) -> FormatId {
        FormatId::Matroska
    }

    fn time_base(&self, _track: &WriterTrack) -> LiuResult<Rational> {
        Ok(Rational::from_nanos(self.timecode_scale_ns))
    }

    fn write_file_header(&mut self, _tracks: &[WriterTrack], out: &mut Vec<u8>) -> LiuResult<()> {
        // EBML Header
        let mut header = Vec::new();
        put_uint(&mut header, ebml::EBML_VERSION, 1)?;
        put_uint(&mut header, ebml::EBML_READ_VERSION, 1)?;
        put_uint(&mut header, ebml::EBML_MAX_ID_LENGTH, 4)?;
        put_uint(&mut header, ebml::EBML_MAX_SIZE_LENGTH, 8)?;
        put_string(&mut header, ebml::EBML_DOC_TYPE, "matroska")?;
        put_uint(&mut header, ebml::EBML_DOC_TYPE_VERSION, 4)?;
        put_uint(&mut header, ebml::EBML_DOC_TYPE_READ_VERSION, 2)?;
        put_element(out, ebml::EBML_HEADER, &header)?;

        // Segment (unknown size)
        put_id(out, ebml::SEGMENT)?;
        ebml::put_unknown_size(out, 8)?;

        // Info
        let mut info = Vec::new();
        put_uint(&mut info, ebml::INFO_TIMESCALE, self.timecode_scale_ns)?;
        put_string(&mut info, ebml::INFO_MUXING_APP, "liu")?;
        put_string(&mut info, ebml::INFO_WRITING_APP, "liu")?;
        put_element(out, ebml::SEGMENT_INFO, &info)
    }

    fn write_track_headers(
        &mut self,
        tracks: &[WriterTrack],
        out: &mut Vec<u8>,
    ) -> LiuResult<()> {
        let mut content = Vec::new();
        for track in tracks {
            content.extend_from_slice(&Self::track_entry(track)?);
        }
        put_element(out, ebml::TRACKS, &content)?;
        debug!("MKV: 写入 Tracks, {} 个轨道", tracks.len());
        Ok(())
    }

    fn write_config(&mut self, track: &WriterTrack, _out: &mut Vec<u8>) -> LiuResult<()> {
        // Tracks 只写一次, 之后的配置变化无法表达
        warn!(
            "MKV: 轨道 #{} 的配置记录在 Tracks 写出后变化, 忽略",
            track.index
        );
        Ok(())
    }

    fn write_frame(
        &mut self,
        track: &WriterTrack,
        frame: &Frame,
        out: &mut Vec<u8>,
    ) -> LiuResult<()> {
        let timecode = frame.pts();
        let video_keyframe = track.kind() == MediaType::Video && frame.is_keyframe();
        if self.needs_new_cluster(timecode, video_keyframe) {
            self.flush_cluster(out)?;
            self.start_cluster(timecode)?;
        }
        let cluster_tc = self.cluster_timecode.unwrap_or(0);
        let delta = i16::try_from(timecode - cluster_tc).map_err(|_| {
            LiuError::InvalidArgument(format!(
                "MKV: 块时间戳 {timecode} 无法相对 Cluster {cluster_tc} 表示"
            ))
        })?;

        let mut flags = BlockFlags::empty();
        if frame.is_keyframe() {
            flags |= BlockFlags::KEYFRAME;
        }

        // SimpleBlock: track_number (VINT) + timecode delta (2 bytes BE) + flags + frame_data
        let mut block = Vec::new();
        ebml::put_size(&mut block, track.index as u64 + 1)?;
        block.extend_from_slice(&delta.to_be_bytes());
        block.push(flags.bits());
        match track.codec() {
            CodecId::H264 => block.extend_from_slice(&h264::annex_b_to_length_prefixed(frame.data())),
            _ => block.extend_from_slice(frame.data()),
        }
        put_element(&mut self.cluster_buf, ebml::SIMPLE_BLOCK, &block)?;
        self.cluster_blocks += 1;
        Ok(())
    }

    fn write_trailer(&mut self, _tracks: &[WriterTrack], out: &mut Vec<u8>) -> LiuResult<()> {
        self.flush_cluster(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::TrackSpec;
    use liu_codec::{AacUnit, SoundParams};

    #[test]
    fn test_mkv_写入头部() {
        let options = WriterOptions::new(vec![TrackSpec::new(CodecId::Aac)]);
        let mut writer = MkvMux::writer(&options).unwrap();
        let mut out = Vec::new();
        let config = Frame::aac(AacUnit::Config, 0, Rational::MILLI, vec![0x11, 0x90]);
        writer.write(&config, &mut out).unwrap();
        assert_eq!(&out[..4], &[0x1A, 0x45, 0xDF, 0xA3]);
        assert!(out.windows(8).any(|w| w == b"matroska"));
        // Tracks 已写出, CodecPrivate 为 ASC
        assert!(out.windows(4).any(|w| w == [0x16, 0x54, 0xAE, 0x6B]));
        assert!(out.windows(5).any(|w| w == [0x63, 0xA2, 0x82, 0x11, 0x90]));
        // 48kHz 写入 SamplingFrequency
        assert!(out.windows(10).any(|w| w == [0xB5, 0x88, 0x40, 0xE7, 0x70, 0, 0, 0, 0, 0]));
    }

    #[test]
    fn test_mkv_拒绝不支持的编解码器() {
        let options = WriterOptions::new(vec![TrackSpec::new(CodecId::Speex)]);
        assert!(matches!(
            MkvMux::writer(&options),
            Err(LiuError::Unsupported(_))
        ));
    }

    #[test]
    fn test_mkv_cluster_按时长切分() {
        let mut options =
            WriterOptions::new(vec![TrackSpec::new(CodecId::PcmS16le).without_reorder()]);
        options.cluster_duration_ms = 100;
        let mut writer = MkvMux::writer(&options).unwrap();
        let mut out = Vec::new();
        let sound = SoundParams::new(8_000, 1, 16);
        for i in 0..5 {
            let frame =
                Frame::audio(CodecId::PcmS16le, sound, i * 50, Rational::MILLI, vec![0; 4]).unwrap();
            writer.write(&frame, &mut out).unwrap();
        }
        writer.finish(&mut out).unwrap();
        let clusters = out
            .windows(4)
            .filter(|w| *w == [0x1F, 0x43, 0xB6, 0x75])
            .count();
        // 0/50 | 100/150 | 200
        assert_eq!(clusters, 3);
    }

    #[test]
    fn test_mkv_块时间戳溢出开启新_cluster() {
        let options = WriterOptions::new(vec![TrackSpec::new(CodecId::Mp3)]);
        let mut mux = MkvMux::new(&options).unwrap();
        mux.start_cluster(0).unwrap();
        assert!(!mux.needs_new_cluster(100, false));
        assert!(mux.needs_new_cluster(40_000, false));
        assert!(mux.needs_new_cluster(-40_000, false));
    }
}
