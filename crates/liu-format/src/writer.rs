//! 容器写入器框架.
//!
//! [`Writer`] 承担与格式无关的部分: 帧路由、时间基换算、配置记录跟踪、
//! 重排队列与多轨交织. 具体的字节布局由各格式实现 [`FormatWriter`].
//!
//! 状态机:
//! ```text
//! Uninitialized --首次 write--> HeaderWritten --所有轨道就绪--> Streaming --finish--> Finished
//! ```
//!
//! 每次 write 组装出的字节先写入内部暂存区, 再整体推给 [`ByteSink`].
//!
//! 多轨交织分两级: 重排队列释放的帧先进入轨道的 `pending`, 只有当其他非空轨道
//! 不可能再给出更早的帧时才真正输出. 这样各轨窗口覆盖的时长不同也不会乱序.

use std::cmp::Ordering;
use std::collections::VecDeque;

use bytes::Bytes;
use log::{debug, info, warn};

use liu_codec::aac::AudioSpecificConfig;
use liu_codec::{CodecId, Frame, SoundParams, h264};
use liu_core::crc::crc32_mpeg2;
use liu_core::{LiuError, LiuResult, MediaType, Rational, timestamp};

use crate::format_id::FormatId;
use crate::options::{TieBreak, TrackSpec, WriterOptions};
use crate::reorder::FrameReorderQueue;
use crate::sink::ByteSink;

/// 等待交织的帧总数上限, 超过后不再等待其他轨道
const MAX_INTERLEAVE_PENDING: usize = 512;

/// 写入器状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriterState {
    /// 尚未输出任何字节
    Uninitialized,
    /// 已输出文件头, 等待所有轨道的配置记录
    HeaderWritten,
    /// 已输出轨道描述, 媒体帧正常输出
    Streaming,
    /// 已调用 finish
    Finished,
}

/// 容器写入器 trait
///
/// 使用流程:
/// 1. 通过 [`WriterOptions`] 声明轨道并创建写入器
/// 2. 循环调用 `write()` 写入配置记录与媒体帧
/// 3. 调用 `finish()` 冲刷队列并写入容器尾部
pub trait ContainerWriter: Send {
    /// 获取格式标识
    fn format_id(&self) -> FormatId;

    /// 当前状态
    fn state(&self) -> WriterState;

    /// 写入一帧, 产生的字节推给 `sink`
    fn write(&mut self, frame: &Frame, sink: &mut dyn ByteSink) -> LiuResult<()>;

    /// 冲刷所有队列并写入容器尾部
    fn finish(&mut self, sink: &mut dyn ByteSink) -> LiuResult<()>;
}

/// 写入器内部的轨道状态
#[derive(Debug)]
pub struct WriterTrack {
    /// 声明顺序中的索引
    pub index: usize,
    pub spec: TrackSpec,
    pub queue: FrameReorderQueue,
    /// 已按轨内 DTS 顺序释放, 等待跨轨交织
    pub pending: VecDeque<Frame>,
    /// 最近一次的配置记录
    pub last_config: Option<Frame>,
    pub config_hash: Option<u32>,
    /// 配置记录在轨道描述输出后发生变化, 下一帧前需要重发
    pub config_dirty: bool,
    /// 轨道描述已输出
    pub is_initialized: bool,
    /// 首个媒体帧携带的音频参数
    pub sound: Option<SoundParams>,
    /// 容器内时间基, 首个媒体帧到达时确定
    pub time_base: Option<Rational>,
}

impl WriterTrack {
    fn new(index: usize, spec: TrackSpec) -> LiuResult<Self> {
        let queue =
            FrameReorderQueue::new(spec.reorder_window)?.with_reorder_disabled(spec.reorder_disabled);
        Ok(Self {
            index,
            spec,
            queue,
            pending: VecDeque::new(),
            last_config: None,
            config_hash: None,
            config_dirty: false,
            is_initialized: false,
            sound: None,
            time_base: None,
        })
    }

    pub fn codec(&self) -> CodecId {
        self.spec.codec
    }

    pub fn kind(&self) -> MediaType {
        self.spec.kind()
    }

    /// 配置记录负载
    pub fn config_data(&self) -> Option<&Bytes> {
        self.last_config.as_ref().map(Frame::data)
    }

    /// 轨道内尚未输出的最早 DTS
    fn earliest_dts(&self) -> Option<(i64, Rational)> {
        let dts = match self.pending.front() {
            Some(frame) => frame.dts(),
            None => self.queue.lowest_dts()?,
        };
        Some((dts, self.time_base?))
    }

    fn has_frames(&self) -> bool {
        !self.pending.is_empty() || !self.queue.is_empty()
    }

    /// 轨道描述所需信息是否齐全
    ///
    /// 需要配置记录的编解码器以收到配置为准; 无配置的音频以收到首帧 (得到采样参数) 为准.
    pub fn is_configured(&self) -> bool {
        if self.codec().requires_config() {
            self.last_config.is_some()
        } else {
            self.kind() == MediaType::Video || self.sound.is_some()
        }
    }

    /// AAC 轨道的 AudioSpecificConfig
    pub fn audio_config(&self) -> Option<AudioSpecificConfig> {
        if self.codec() != CodecId::Aac {
            return None;
        }
        AudioSpecificConfig::parse(self.config_data()?).ok()
    }

    /// 音频参数: AAC 取自配置记录, 其余取自首帧, 都没有时用默认值
    pub fn sound_params(&self) -> SoundParams {
        if let Some(asc) = self.audio_config() {
            return SoundParams::new(asc.sample_rate, asc.channels, 16);
        }
        self.sound.unwrap_or_default()
    }

    /// 容器内时间基; 首个媒体帧之前未确定
    pub fn container_time_base(&self) -> LiuResult<Rational> {
        self.time_base.ok_or_else(|| {
            LiuError::InvalidState(format!("轨道 #{} 尚未确定时间基", self.index))
        })
    }
}

/// 各格式的字节布局
///
/// 所有方法把输出追加到 `out`, 由 [`Writer`] 统一推给输出目标.
/// 允许暂存 (如 Cluster/分片) 并在之后的调用或 `write_trailer` 中输出.
pub trait FormatWriter: Send {
    fn format_id(&self) -> FormatId;

    /// 轨道在容器内使用的时间基
    fn time_base(&self, track: &WriterTrack) -> LiuResult<Rational>;

    /// 文件头 (首次 write 时输出)
    fn write_file_header(&mut self, tracks: &[WriterTrack], out: &mut Vec<u8>) -> LiuResult<()>;

    /// 轨道描述 (所有轨道就绪后输出一次)
    fn write_track_headers(&mut self, tracks: &[WriterTrack], out: &mut Vec<u8>)
    -> LiuResult<()>;

    /// 配置记录变化后, 在该轨道下一帧之前调用
    fn write_config(&mut self, track: &WriterTrack, out: &mut Vec<u8>) -> LiuResult<()>;

    /// 输出一个媒体帧 (时间戳已换算到 [`FormatWriter::time_base`])
    fn write_frame(&mut self, track: &WriterTrack, frame: &Frame, out: &mut Vec<u8>)
    -> LiuResult<()>;

    /// 容器尾部
    fn write_trailer(&mut self, tracks: &[WriterTrack], out: &mut Vec<u8>) -> LiuResult<()>;
}

/// 通用写入器
pub struct Writer<F: FormatWriter> {
    format: F,
    tracks: Vec<WriterTrack>,
    tie_break: TieBreak,
    state: WriterState,
    /// 待推送的输出
    scratch: Vec<u8>,
}

impl<F: FormatWriter> Writer<F> {
    /// 按声明的轨道创建写入器
    pub fn new(format: F, options: &WriterOptions) -> LiuResult<Self> {
        if options.tracks.is_empty() {
            return Err(LiuError::InvalidArgument("至少需要声明一条轨道".into()));
        }
        for (i, a) in options.tracks.iter().enumerate() {
            let duplicated = options.tracks[i + 1..]
                .iter()
                .any(|b| b.codec == a.codec && b.track_id == a.track_id);
            if duplicated {
                return Err(LiuError::InvalidArgument(format!(
                    "{} 轨道重复声明, track_id={}",
                    a.codec, a.track_id
                )));
            }
        }
        let tracks = options
            .tracks
            .iter()
            .cloned()
            .enumerate()
            .map(|(index, spec)| WriterTrack::new(index, spec))
            .collect::<LiuResult<Vec<_>>>()?;
        debug!(
            "{}: 创建写入器, {} 条轨道, 交织规则 {:?}",
            format.format_id(),
            tracks.len(),
            options.tie_break
        );
        for track in &tracks {
            debug!(
                "{}: 轨道 #{} {} 重排窗口 {}",
                format.format_id(),
                track.index,
                track.codec(),
                track.queue.window()
            );
        }
        Ok(Self {
            format,
            tracks,
            tie_break: options.tie_break,
            state: WriterState::Uninitialized,
            scratch: Vec::new(),
        })
    }

    pub fn tracks(&self) -> &[WriterTrack] {
        &self.tracks
    }

    pub fn format(&self) -> &F {
        &self.format
    }

    /// 按编解码器路由, 同编解码器多轨时再按 track_id 区分
    fn route(&self, frame: &Frame) -> LiuResult<usize> {
        let codec = frame.codec_id();
        let mut candidates = self.tracks.iter().filter(|t| t.codec() == codec);
        let first = candidates
            .next()
            .ok_or_else(|| LiuError::UnknownTrack(format!("未声明 {codec} 轨道")))?;
        if candidates.next().is_none() {
            return Ok(first.index);
        }
        self.tracks
            .iter()
            .find(|t| t.codec() == codec && t.spec.track_id == frame.track_id())
            .map(|t| t.index)
            .ok_or_else(|| {
                LiuError::UnknownTrack(format!("{codec} 轨道 track_id={} 未声明", frame.track_id()))
            })
    }

    fn store_config(&mut self, index: usize, frame: &Frame) -> LiuResult<()> {
        let data = frame.data();
        match frame.codec_id() {
            CodecId::H264 => {
                h264::config_to_avcc(data)?;
            }
            CodecId::Aac => {
                AudioSpecificConfig::parse(data)?;
            }
            _ => {}
        }

        let hash = crc32_mpeg2(data);
        let track = &mut self.tracks[index];
        let unchanged = track.config_hash == Some(hash)
            && track.config_data().is_some_and(|old| old == data);
        if unchanged {
            return Ok(());
        }
        track.last_config = Some(frame.clone());
        track.config_hash = Some(hash);
        if track.is_initialized {
            track.config_dirty = true;
            info!(
                "{}: 轨道 #{} 配置记录变化, crc=0x{hash:08X}",
                self.format.format_id(),
                index
            );
        }
        Ok(())
    }

    fn queue_media(&mut self, index: usize, frame: &Frame) -> LiuResult<()> {
        let track = &self.tracks[index];
        if track.codec().requires_config() && track.last_config.is_none() {
            if track.kind() == MediaType::Audio {
                return Err(LiuError::MissingConfig("missing AudioSpecificConfig".into()));
            }
            debug!(
                "{}: 轨道 #{} 尚无 SPS/PPS, 帧暂存等待配置",
                self.format.format_id(),
                index
            );
        }

        let time_base = match track.time_base {
            Some(tb) => tb,
            None => self.format.time_base(track)?,
        };
        if !frame.time_base().is_valid() {
            return Err(LiuError::InvalidArgument(format!(
                "帧时间基非法: {}",
                frame.time_base()
            )));
        }
        let normalized = frame.rescaled(time_base)?;

        let track = &mut self.tracks[index];
        track.queue.queue(normalized)?;
        track.time_base = Some(time_base);
        if track.sound.is_none() {
            track.sound = frame.sound();
        }
        Ok(())
    }

    /// 将暂存区推给输出目标
    fn flush_scratch(&mut self, sink: &mut dyn ByteSink) -> LiuResult<()> {
        if self.scratch.is_empty() {
            return Ok(());
        }
        let accepted = sink.push(&self.scratch);
        self.scratch.clear();
        if accepted {
            Ok(())
        } else {
            Err(LiuError::SinkFailure)
        }
    }

    fn ensure_headers(&mut self, sink: &mut dyn ByteSink, force: bool) -> LiuResult<()> {
        if self.state == WriterState::Uninitialized {
            self.format
                .write_file_header(&self.tracks, &mut self.scratch)?;
            self.state = WriterState::HeaderWritten;
            self.flush_scratch(sink)?;
        }
        if self.state != WriterState::HeaderWritten {
            return Ok(());
        }
        if !force && !self.tracks.iter().all(WriterTrack::is_configured) {
            return Ok(());
        }

        self.format
            .write_track_headers(&self.tracks, &mut self.scratch)?;
        for track in &mut self.tracks {
            track.is_initialized = true;
            track.config_dirty = false;
        }
        self.state = WriterState::Streaming;
        info!(
            "{}: 轨道描述已输出, 进入 Streaming",
            self.format.format_id()
        );
        self.flush_scratch(sink)
    }

    /// `a` 处的帧是否应排在 `b` 处的帧之前
    fn precedes(
        &self,
        a: &WriterTrack,
        a_at: (i64, Rational),
        b: &WriterTrack,
        b_at: (i64, Rational),
    ) -> bool {
        match timestamp::compare(a_at.0, a_at.1, b_at.0, b_at.1) {
            Ordering::Less => true,
            Ordering::Greater => false,
            Ordering::Equal => match self.tie_break {
                TieBreak::VideoFirst if a.kind() != b.kind() => a.kind() == MediaType::Video,
                _ => a.index < b.index,
            },
        }
    }

    /// 选出下一帧所在的轨道
    ///
    /// 候选只来自 `pending`; 若某条轨道的重排队列里还压着更早的帧, 先等待.
    fn next_track(&self) -> Option<usize> {
        let mut best: Option<(&WriterTrack, (i64, Rational))> = None;
        for track in &self.tracks {
            if track.pending.is_empty() {
                continue;
            }
            let Some(at) = track.earliest_dts() else {
                continue;
            };
            let take = match best {
                None => true,
                Some((best_track, best_at)) => self.precedes(track, at, best_track, best_at),
            };
            if take {
                best = Some((track, at));
            }
        }
        let (chosen, at) = best?;

        let blocker = self.tracks.iter().find(|track| {
            track.index != chosen.index
                && track.pending.is_empty()
                && track.has_frames()
                && track
                    .earliest_dts()
                    .is_some_and(|other| self.precedes(track, other, chosen, at))
        });
        let Some(blocker) = blocker else {
            return Some(chosen.index);
        };
        let held: usize = self.tracks.iter().map(|t| t.pending.len()).sum();
        if held > MAX_INTERLEAVE_PENDING {
            warn!(
                "{}: 轨道 #{} 长时间未释放帧, 等待交织的帧已达 {held}, 不再等待",
                self.format.format_id(),
                blocker.index
            );
            return Some(chosen.index);
        }
        None
    }

    fn drain(&mut self, sink: &mut dyn ByteSink) -> LiuResult<()> {
        if self.state != WriterState::Streaming {
            return Ok(());
        }
        for track in &mut self.tracks {
            while let Some(frame) = track.queue.dequeue_first() {
                track.pending.push_back(frame);
            }
        }
        while let Some(index) = self.next_track() {
            let Some(frame) = self.tracks[index].pending.pop_front() else {
                break;
            };
            if self.tracks[index].config_dirty {
                self.format
                    .write_config(&self.tracks[index], &mut self.scratch)?;
                self.tracks[index].config_dirty = false;
            }
            self.format
                .write_frame(&self.tracks[index], &frame, &mut self.scratch)?;
            self.flush_scratch(sink)?;
        }
        Ok(())
    }
}

impl<F: FormatWriter> ContainerWriter for Writer<F> {
    fn format_id(&self) -> FormatId {
        self.format.format_id()
    }

    fn state(&self) -> WriterState {
        self.state
    }

    fn write(&mut self, frame: &Frame, sink: &mut dyn ByteSink) -> LiuResult<()> {
        if self.state == WriterState::Finished {
            return Err(LiuError::InvalidState("写入器已结束".into()));
        }
        let index = self.route(frame)?;
        if frame.is_config_record() {
            self.store_config(index, frame)?;
        } else {
            self.queue_media(index, frame)?;
        }
        self.ensure_headers(sink, false)?;
        self.drain(sink)
    }

    fn finish(&mut self, sink: &mut dyn ByteSink) -> LiuResult<()> {
        if self.state == WriterState::Finished {
            return Err(LiuError::InvalidState("写入器已结束".into()));
        }
        for track in &self.tracks {
            if track.codec().requires_config()
                && track.last_config.is_none()
                && !track.queue.is_empty()
            {
                let what = match track.kind() {
                    MediaType::Video => "missing SPS/PPS",
                    MediaType::Audio => "missing AudioSpecificConfig",
                };
                return Err(LiuError::MissingConfig(what.into()));
            }
        }
        for track in &mut self.tracks {
            track.queue.set_flushing();
        }
        self.ensure_headers(sink, true)?;
        self.drain(sink)?;
        self.format.write_trailer(&self.tracks, &mut self.scratch)?;
        self.state = WriterState::Finished;
        self.flush_scratch(sink)?;
        debug!("{}: 写入完成", self.format.format_id());
        Ok(())
    }
}
