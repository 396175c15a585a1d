//! 分片 MP4 写入器.
//!
//! 初始化段 (ftyp + moov) 在所有轨道就绪后写出, 媒体数据按分片输出:
//! ```text
//! moof
//! ├── mfhd (sequence_number)
//! └── traf (每个有待写采样的轨道)
//!     ├── tfhd (default-base-is-moof)
//!     ├── tfdt (version 1)
//!     └── trun (version 1: data_offset + duration/size/flags/cts)
//! mdat
//! ```
//!
//! 出现以下情况时输出当前分片:
//! - 视频关键帧到达且已有待写采样
//! - 分片时长达到 `fragment_duration_ms`
//! - finish

use byteorder::{BigEndian, ByteOrder};
use log::{debug, warn};

use liu_codec::aac::{AudioSpecificConfig, SAMPLES_PER_FRAME};
use liu_codec::{CodecId, Frame, h264};
use liu_core::timestamp::rescale;
use liu_core::{LiuError, LiuResult, MediaType, Rational};

use super::boxes::{begin_box, begin_full_box, end_box};
use super::{
    SAMPLE_FLAGS_NON_SYNC, SAMPLE_FLAGS_SYNC, TfhdFlags, TrunFlags, VIDEO_TIMESCALE, check_codec,
};
use crate::format_id::FormatId;
use crate::options::WriterOptions;
use crate::writer::{ContainerWriter, FormatWriter, Writer, WriterTrack};

/// 分片 MP4 写入器
pub type Mp4Writer = Writer<Fmp4Mux>;

/// 单位变换矩阵
const UNITY_MATRIX: [u32; 9] = [0x0001_0000, 0, 0, 0, 0x0001_0000, 0, 0, 0, 0x4000_0000];

/// 视频最后一个采样的默认时长 (90kHz 下 30fps)
const DEFAULT_VIDEO_DURATION: u32 = VIDEO_TIMESCALE / 30;

/// trun 中每个采样都写出的字段
const TRUN_FLAGS: TrunFlags = TrunFlags::DATA_OFFSET
    .union(TrunFlags::SAMPLE_DURATION)
    .union(TrunFlags::SAMPLE_SIZE)
    .union(TrunFlags::SAMPLE_FLAGS)
    .union(TrunFlags::SAMPLE_COMPOSITION_OFFSET);

/// 等待写入分片的采样
#[derive(Debug)]
struct PendingSample {
    data: Vec<u8>,
    dts: i64,
    /// 下一个采样到达前未知
    duration: Option<u32>,
    cts_offset: i32,
    sync: bool,
}

/// 分片中的轨道状态
#[derive(Debug)]
struct FragmentTrack {
    /// track_ID (声明顺序 + 1)
    track_id: u32,
    samples: Vec<PendingSample>,
    /// 最近一个已知的采样时长
    last_duration: u32,
}

/// 分片 MP4 字节布局
pub struct Fmp4Mux {
    tracks: Vec<FragmentTrack>,
    sequence_number: u32,
    fragment_duration_ms: i64,
    /// 当前分片首个采样的 dts (毫秒)
    fragment_start_ms: Option<i64>,
}

impl Fmp4Mux {
    pub fn new(options: &WriterOptions) -> LiuResult<Self> {
        let tracks = options
            .tracks
            .iter()
            .enumerate()
            .map(|(i, spec)| {
                check_codec(spec.codec)?;
                let last_duration = match spec.kind() {
                    MediaType::Video => DEFAULT_VIDEO_DURATION,
                    MediaType::Audio => SAMPLES_PER_FRAME,
                };
                Ok(FragmentTrack {
                    track_id: i as u32 + 1,
                    samples: Vec::new(),
                    last_duration,
                })
            })
            .collect::<LiuResult<Vec<_>>>()?;
        Ok(Self {
            tracks,
            sequence_number: 0,
            fragment_duration_ms: i64::try_from(options.fragment_duration_ms).unwrap_or(i64::MAX),
            fragment_start_ms: None,
        })
    }

    /// 创建分片 MP4 写入器
    pub fn writer(options: &WriterOptions) -> LiuResult<Mp4Writer> {
        Writer::new(Self::new(options)?, options)
    }

    /// 创建分片 MP4 写入器 (工厂函数)
    pub fn create(options: &WriterOptions) -> LiuResult<Box<dyn ContainerWriter>> {
        Ok(Box::new(Self::writer(options)?))
    }

    /// 已输出的分片数
    pub fn fragment_count(&self) -> u32 {
        self.sequence_number
    }

    /// 轨道 timescale: 视频 90kHz, AAC 取采样率
    fn timescale(track: &WriterTrack) -> LiuResult<u32> {
        match track.kind() {
            MediaType::Video => Ok(VIDEO_TIMESCALE),
            MediaType::Audio => track
                .audio_config()
                .map(|asc| asc.sample_rate)
                .ok_or_else(|| LiuError::MissingConfig("missing AudioSpecificConfig".into())),
        }
    }

    fn put_ftyp(out: &mut Vec<u8>) -> LiuResult<()> {
        let ftyp = begin_box(out, b"ftyp");
        out.extend_from_slice(b"isom"); // major_brand
        out.extend_from_slice(&0x200u32.to_be_bytes()); // minor_version
        for brand in [b"isom", b"iso6", b"mp41"] {
            out.extend_from_slice(brand);
        }
        end_box(out, ftyp)
    }

    fn put_mvhd(out: &mut Vec<u8>, next_track_id: u32) -> LiuResult<()> {
        let mvhd = begin_full_box(out, b"mvhd", 0, 0);
        out.extend_from_slice(&[0; 8]); // creation/modification_time
        out.extend_from_slice(&1000u32.to_be_bytes()); // timescale
        out.extend_from_slice(&0u32.to_be_bytes()); // duration 由分片决定
        out.extend_from_slice(&0x0001_0000u32.to_be_bytes()); // rate 1.0
        out.extend_from_slice(&0x0100u16.to_be_bytes()); // volume 1.0
        out.extend_from_slice(&[0; 10]);
        for v in UNITY_MATRIX {
            out.extend_from_slice(&v.to_be_bytes());
        }
        out.extend_from_slice(&[0; 24]); // pre_defined
        out.extend_from_slice(&next_track_id.to_be_bytes());
        end_box(out, mvhd)
    }

    fn put_trak(
        out: &mut Vec<u8>,
        track: &WriterTrack,
        track_id: u32,
        timescale: u32,
    ) -> LiuResult<()> {
        let trak = begin_box(out, b"trak");

        // tkhd: flags = track_enabled | track_in_movie
        let tkhd = begin_full_box(out, b"tkhd", 0, 0x03);
        out.extend_from_slice(&[0; 8]);
        out.extend_from_slice(&track_id.to_be_bytes());
        out.extend_from_slice(&[0; 4]);
        out.extend_from_slice(&0u32.to_be_bytes()); // duration
        out.extend_from_slice(&[0; 8]);
        out.extend_from_slice(&[0; 4]); // layer + alternate_group
        let volume: u16 = match track.kind() {
            MediaType::Audio => 0x0100,
            MediaType::Video => 0,
        };
        out.extend_from_slice(&volume.to_be_bytes());
        out.extend_from_slice(&[0; 2]);
        for v in UNITY_MATRIX {
            out.extend_from_slice(&v.to_be_bytes());
        }
        let width = track.spec.width.unwrap_or(0);
        let height = track.spec.height.unwrap_or(0);
        out.extend_from_slice(&(width << 16).to_be_bytes());
        out.extend_from_slice(&(height << 16).to_be_bytes());
        end_box(out, tkhd)?;

        let mdia = begin_box(out, b"mdia");
        let mdhd = begin_full_box(out, b"mdhd", 0, 0);
        out.extend_from_slice(&[0; 8]);
        out.extend_from_slice(&timescale.to_be_bytes());
        out.extend_from_slice(&0u32.to_be_bytes());
        out.extend_from_slice(&0x55C4u16.to_be_bytes()); // 'und'
        out.extend_from_slice(&[0; 2]);
        end_box(out, mdhd)?;

        let (handler_type, name): (&[u8; 4], &[u8]) = match track.kind() {
            MediaType::Video => (b"vide", b"VideoHandler\0"),
            MediaType::Audio => (b"soun", b"SoundHandler\0"),
        };
        let hdlr = begin_full_box(out, b"hdlr", 0, 0);
        out.extend_from_slice(&[0; 4]);
        out.extend_from_slice(handler_type);
        out.extend_from_slice(&[0; 12]);
        out.extend_from_slice(name);
        end_box(out, hdlr)?;

        let minf = begin_box(out, b"minf");
        match track.kind() {
            MediaType::Video => {
                let vmhd = begin_full_box(out, b"vmhd", 0, 1);
                out.extend_from_slice(&[0; 8]);
                end_box(out, vmhd)?;
            }
            MediaType::Audio => {
                let smhd = begin_full_box(out, b"smhd", 0, 0);
                out.extend_from_slice(&[0; 4]);
                end_box(out, smhd)?;
            }
        }
        let dinf = begin_box(out, b"dinf");
        let dref = begin_full_box(out, b"dref", 0, 0);
        out.extend_from_slice(&1u32.to_be_bytes());
        let url = begin_full_box(out, b"url ", 0, 1); // 数据在本文件中
        end_box(out, url)?;
        end_box(out, dref)?;
        end_box(out, dinf)?;
        Self::put_stbl(out, track)?;
        end_box(out, minf)?;
        end_box(out, mdia)?;

        end_box(out, trak)
    }

    /// stbl: 只有 stsd 有内容, 其余表为空
    fn put_stbl(out: &mut Vec<u8>, track: &WriterTrack) -> LiuResult<()> {
        let stbl = begin_box(out, b"stbl");
        let stsd = begin_full_box(out, b"stsd", 0, 0);
        out.extend_from_slice(&1u32.to_be_bytes());
        match track.codec() {
            CodecId::H264 => Self::put_avc1(out, track)?,
            CodecId::Aac => Self::put_mp4a(out, track)?,
            codec => {
                return Err(LiuError::Unsupported(format!(
                    "MP4: 不支持编解码器 {codec}"
                )));
            }
        }
        end_box(out, stsd)?;

        for table in [b"stts", b"stsc", b"stco"] {
            let b = begin_full_box(out, table, 0, 0);
            out.extend_from_slice(&0u32.to_be_bytes()); // entry_count
            end_box(out, b)?;
        }
        let stsz = begin_full_box(out, b"stsz", 0, 0);
        out.extend_from_slice(&0u32.to_be_bytes()); // sample_size
        out.extend_from_slice(&0u32.to_be_bytes()); // sample_count
        end_box(out, stsz)?;
        end_box(out, stbl)
    }

    fn put_avc1(out: &mut Vec<u8>, track: &WriterTrack) -> LiuResult<()> {
        let config = track
            .config_data()
            .ok_or_else(|| LiuError::MissingConfig("missing SPS/PPS".into()))?;
        let avcc = h264::config_to_avcc(config)?;
        let width = u16::try_from(track.spec.width.unwrap_or(0)).unwrap_or(u16::MAX);
        let height = u16::try_from(track.spec.height.unwrap_or(0)).unwrap_or(u16::MAX);

        let avc1 = begin_box(out, b"avc1");
        out.extend_from_slice(&[0; 6]);
        out.extend_from_slice(&1u16.to_be_bytes()); // data_reference_index
        out.extend_from_slice(&[0; 16]); // pre_defined + reserved
        out.extend_from_slice(&width.to_be_bytes());
        out.extend_from_slice(&height.to_be_bytes());
        out.extend_from_slice(&0x0048_0000u32.to_be_bytes()); // 72 dpi
        out.extend_from_slice(&0x0048_0000u32.to_be_bytes());
        out.extend_from_slice(&[0; 4]);
        out.extend_from_slice(&1u16.to_be_bytes()); // frame_count
        out.extend_from_slice(&[0; 32]); // compressorname
        out.extend_from_slice(&0x0018u16.to_be_bytes()); // depth
        out.extend_from_slice(&(-1i16).to_be_bytes());
        let avcc_box = begin_box(out, b"avcC");
        out.extend_from_slice(&avcc);
        end_box(out, avcc_box)?;
        end_box(out, avc1)
    }

    fn put_mp4a(out: &mut Vec<u8>, track: &WriterTrack) -> LiuResult<()> {
        let config = track
            .config_data()
            .ok_or_else(|| LiuError::MissingConfig("missing AudioSpecificConfig".into()))?;
        let asc = AudioSpecificConfig::parse(config)?;
        let sample_rate = u16::try_from(asc.sample_rate).unwrap_or(0);

        let mp4a = begin_box(out, b"mp4a");
        out.extend_from_slice(&[0; 6]);
        out.extend_from_slice(&1u16.to_be_bytes()); // data_reference_index
        out.extend_from_slice(&[0; 8]);
        out.extend_from_slice(&u16::from(asc.channels).to_be_bytes());
        out.extend_from_slice(&16u16.to_be_bytes()); // samplesize
        out.extend_from_slice(&[0; 4]);
        out.extend_from_slice(&(u32::from(sample_rate) << 16).to_be_bytes());

        // esds: ES_Descriptor → DecoderConfigDescriptor → DecoderSpecificInfo
        let mut decoder_config = vec![0x40, 0x15]; // MPEG-4 Audio, AudioStream
        decoder_config.extend_from_slice(&[0; 3]); // bufferSizeDB
        decoder_config.extend_from_slice(&[0; 8]); // max/avg bitrate
        put_descriptor(&mut decoder_config, 0x05, config);
        let mut es = vec![0x00, 0x00, 0x00]; // ES_ID + flags
        put_descriptor(&mut es, 0x04, &decoder_config);
        put_descriptor(&mut es, 0x06, &[0x02]); // SLConfigDescriptor
        let esds = begin_full_box(out, b"esds", 0, 0);
        put_descriptor(out, 0x03, &es);
        end_box(out, esds)?;
        end_box(out, mp4a)
    }

    /// 输出 moof + mdat
    fn flush_fragment(&mut self, out: &mut Vec<u8>) -> LiuResult<()> {
        if self.tracks.iter().all(|t| t.samples.is_empty()) {
            return Ok(());
        }
        self.sequence_number += 1;
        let moof_start = out.len();
        let moof = begin_box(out, b"moof");
        let mfhd = begin_full_box(out, b"mfhd", 0, 0);
        out.extend_from_slice(&self.sequence_number.to_be_bytes());
        end_box(out, mfhd)?;

        // (data_offset 字段位置, 采样在 mdat 内容中的偏移)
        let mut offset_fields = Vec::new();
        let mut mdat_len = 0usize;
        let mut sample_total = 0usize;
        for track in self.tracks.iter().filter(|t| !t.samples.is_empty()) {
            let traf = begin_box(out, b"traf");
            let tfhd = begin_full_box(out, b"tfhd", 0, TfhdFlags::DEFAULT_BASE_IS_MOOF.bits());
            out.extend_from_slice(&track.track_id.to_be_bytes());
            end_box(out, tfhd)?;

            let base_dts = u64::try_from(track.samples[0].dts).map_err(|_| {
                LiuError::InvalidArgument(format!(
                    "MP4: 轨道 {} 解码时间戳为负: {}",
                    track.track_id, track.samples[0].dts
                ))
            })?;
            let tfdt = begin_full_box(out, b"tfdt", 1, 0);
            out.extend_from_slice(&base_dts.to_be_bytes());
            end_box(out, tfdt)?;

            let trun = begin_full_box(out, b"trun", 1, TRUN_FLAGS.bits());
            out.extend_from_slice(&(track.samples.len() as u32).to_be_bytes());
            offset_fields.push((out.len(), mdat_len));
            out.extend_from_slice(&[0; 4]);
            for sample in &track.samples {
                let size = u32::try_from(sample.data.len())
                    .map_err(|_| LiuError::InvalidArgument("MP4: 采样过大".into()))?;
                let flags = if sample.sync {
                    SAMPLE_FLAGS_SYNC
                } else {
                    SAMPLE_FLAGS_NON_SYNC
                };
                out.extend_from_slice(&sample.duration.unwrap_or(track.last_duration).to_be_bytes());
                out.extend_from_slice(&size.to_be_bytes());
                out.extend_from_slice(&flags.to_be_bytes());
                out.extend_from_slice(&sample.cts_offset.to_be_bytes());
                mdat_len += sample.data.len();
            }
            end_box(out, trun)?;
            end_box(out, traf)?;
            sample_total += track.samples.len();
        }
        end_box(out, moof)?;

        // data_offset 相对 moof 起点, 跳过 8 字节 mdat 头
        let moof_size = out.len() - moof_start;
        for (pos, relative) in offset_fields {
            let offset = i32::try_from(moof_size + 8 + relative)
                .map_err(|_| LiuError::InvalidArgument("MP4: 分片过大".into()))?;
            BigEndian::write_i32(&mut out[pos..pos + 4], offset);
        }

        let mdat = begin_box(out, b"mdat");
        for track in &mut self.tracks {
            for sample in track.samples.drain(..) {
                out.extend_from_slice(&sample.data);
            }
        }
        end_box(out, mdat)?;
        self.fragment_start_ms = None;
        debug!(
            "MP4: 输出分片 #{}, {sample_total} 个采样, mdat {mdat_len} 字节",
            self.sequence_number
        );
        Ok(())
    }
}

/// 写入 MPEG-4 描述符 (tag + 可变长度 + 内容)
fn put_descriptor(out: &mut Vec<u8>, tag: u8, body: &[u8]) {
    out.push(tag);
    let len = body.len();
    if len < 0x80 {
        out.push(len as u8);
    } else {
        out.extend_from_slice(&[
            0x80 | ((len >> 21) & 0x7F) as u8,
            0x80 | ((len >> 14) & 0x7F) as u8,
            0x80 | ((len >> 7) & 0x7F) as u8,
            (len & 0x7F) as u8,
        ]);
    }
    out.extend_from_slice(body);
}

impl FormatWriter for Fmp4Mux {
    fn format_id(&self) -> FormatId {
        FormatId::Mp4
    }

    fn time_base(&self, track: &WriterTrack) -> LiuResult<Rational> {
        let timescale = Self::timescale(track)?;
        let den = i32::try_from(timescale)
            .map_err(|_| LiuError::InvalidArgument(format!("MP4: timescale 非法: {timescale}")))?;
        Ok(Rational::new(1, den))
    }

    fn write_file_header(&mut self, _tracks: &[WriterTrack], _out: &mut Vec<u8>) -> LiuResult<()> {
        // ftyp 与 moov 一起作为初始化段输出
        Ok(())
    }

    fn write_track_headers(
        &mut self,
        tracks: &[WriterTrack],
        out: &mut Vec<u8>,
    ) -> LiuResult<()> {
        Self::put_ftyp(out)?;
        let moov = begin_box(out, b"moov");
        Self::put_mvhd(out, tracks.len() as u32 + 1)?;
        let mut written = Vec::new();
        for (track, fragment) in tracks.iter().zip(&self.tracks) {
            if track.config_data().is_none() {
                warn!(
                    "MP4: 轨道 #{} 没有配置记录也没有数据, 不写入 moov",
                    track.index
                );
                continue;
            }
            Self::put_trak(out, track, fragment.track_id, Self::timescale(track)?)?;
            written.push(fragment.track_id);
        }
        let mvex = begin_box(out, b"mvex");
        for track_id in &written {
            let trex = begin_full_box(out, b"trex", 0, 0);
            out.extend_from_slice(&track_id.to_be_bytes());
            out.extend_from_slice(&1u32.to_be_bytes()); // default_sample_description_index
            out.extend_from_slice(&[0; 12]); // default duration/size/flags
            end_box(out, trex)?;
        }
        end_box(out, mvex)?;
        end_box(out, moov)?;
        debug!("MP4: 写入初始化段, {} 个轨道", written.len());
        Ok(())
    }

    fn write_config(&mut self, track: &WriterTrack, _out: &mut Vec<u8>) -> LiuResult<()> {
        // stsd 只在初始化段中出现
        warn!(
            "MP4: 轨道 #{} 的配置记录在初始化段写出后变化, 忽略",
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
        let dts = frame.dts();
        let cts_offset = i32::try_from(frame.pts() - dts).map_err(|_| {
            LiuError::InvalidArgument(format!(
                "MP4: pts 与 dts 相差过大: {} / {dts}",
                frame.pts()
            ))
        })?;
        let dts_ms = rescale(dts, frame.time_base(), Rational::MILLI)?;

        let fragment = self.tracks.get_mut(track.index).ok_or_else(|| {
            LiuError::InvalidState(format!("MP4: 轨道 #{} 未登记", track.index))
        })?;
        // 上一个采样的时长由本帧的 dts 确定
        if let Some(last) = fragment.samples.last_mut() {
            let duration = u32::try_from(dts - last.dts).unwrap_or(0);
            last.duration = Some(duration);
            fragment.last_duration = duration;
        }

        let video_keyframe = track.kind() == MediaType::Video && frame.is_keyframe();
        let elapsed = self.fragment_start_ms.map(|start| dts_ms - start);
        if video_keyframe || elapsed.is_some_and(|e| e >= self.fragment_duration_ms) {
            self.flush_fragment(out)?;
        }
        if self.fragment_start_ms.is_none() {
            self.fragment_start_ms = Some(dts_ms);
        }

        let data = match track.codec() {
            CodecId::H264 => h264::annex_b_to_length_prefixed(frame.data()),
            _ => frame.data().to_vec(),
        };
        let sample = PendingSample {
            data,
            dts,
            duration: None,
            cts_offset,
            sync: frame.is_keyframe(),
        };
        if let Some(fragment) = self.tracks.get_mut(track.index) {
            fragment.samples.push(sample);
        }
        Ok(())
    }

    fn write_trailer(&mut self, _tracks: &[WriterTrack], out: &mut Vec<u8>) -> LiuResult<()> {
        self.flush_fragment(out)
    }
}
