//! Matroska 读取器.
//!
//! 按元素逐个解析. Segment 与 Cluster 只消费元素头 (记录体长度为 0),
//! 其子元素作为后续记录继续解析, 因此 unknown-size 的 Segment/Cluster 不需要特殊处理.
//! EBML 头、Info、Tracks、Cluster 时间戳、SimpleBlock 与 BlockGroup 整体读入后解析,
//! 其余元素读入后跳过.

use log::{debug, info, warn};

use liu_codec::aac::AudioSpecificConfig;
use liu_codec::{AacUnit, CodecId, Frame, H264Unit, SoundParams, h264};
use liu_core::{ByteReader, LiuError, LiuResult, Rational};

use super::ebml::{
    self, ElementHeader, children, read_element_header, read_float, read_string, read_u8, read_uint,
};
use super::mkv_to_codec;
use super::writer::BlockFlags;
use crate::format_id::FormatId;
use crate::reader::{
    ContainerReader, ContainerRecord, FormatParser, ReadHandler, Reader, RecordHeader, emit_frame,
    emit_record,
};

/// 单个元素的大小上限, 超出视为数据损坏
const MAX_ELEMENT_SIZE: u64 = 64 * 1024 * 1024;

/// Matroska 读取器
pub type MkvReader = Reader<MkvDemux>;

/// Matroska 记录头
#[derive(Debug, Clone, Copy)]
pub enum MkvHeader {
    /// 进入主元素 (Segment/Cluster), 只消费头部
    Enter { id: u32, size: Option<u64> },
    /// 完整读入的元素
    Element { id: u32, size: u64 },
}

/// 从 Tracks 中发现的轨道
#[derive(Debug, Clone)]
struct MkvTrack {
    number: u64,
    /// None 表示不支持的 CodecID, 其数据块被跳过
    codec: Option<CodecId>,
    sound: SoundParams,
    nal_length_size: usize,
}

/// Matroska 记录解析
pub struct MkvDemux {
    seen_ebml_header: bool,
    time_base: Rational,
    tracks: Vec<MkvTrack>,
    cluster_timecode: i64,
}

impl MkvDemux {
    pub fn new() -> Self {
        Self {
            seen_ebml_header: false,
            time_base: Rational::MILLI,
            tracks: Vec::new(),
            cluster_timecode: 0,
        }
    }

    /// 创建 Matroska 读取器
    pub fn reader() -> MkvReader {
        Reader::new(Self::new())
    }

    /// 创建 Matroska 读取器 (工厂函数)
    pub fn create() -> LiuResult<Box<dyn ContainerReader>> {
        Ok(Box::new(Self::reader()))
    }

    /// 帧时间基 (由 TimecodeScale 决定)
    pub fn time_base(&self) -> Rational {
        self.time_base
    }

    /// 已发现的轨道号
    pub fn track_numbers(&self) -> Vec<u64> {
        self.tracks.iter().map(|t| t.number).collect()
    }

    fn parse_ebml_header(&mut self, body: &[u8]) -> LiuResult<()> {
        let mut doc_type = String::new();
        for (id, data) in children(body)? {
            if id == ebml::EBML_DOC_TYPE {
                doc_type = read_string(data);
            }
        }
        if doc_type != "matroska" && doc_type != "webm" {
            return Err(LiuError::CorruptStream(format!(
                "MKV: DocType 非法: {doc_type:?}"
            )));
        }
        self.seen_ebml_header = true;
        debug!("MKV: EBML 头, DocType={doc_type}");
        Ok(())
    }

    fn parse_info(&mut self, body: &[u8]) -> LiuResult<()> {
        for (id, data) in children(body)? {
            if id == ebml::INFO_TIMESCALE {
                let scale = read_uint(data)?;
                let tb = Rational::from_nanos(scale);
                if scale == 0 || !tb.is_valid() {
                    return Err(LiuError::CorruptStream(format!(
                        "MKV: TimecodeScale 非法: {scale}"
                    )));
                }
                self.time_base = tb;
            }
        }
        debug!("MKV: Info, 时间基 {}", self.time_base);
        Ok(())
    }

    fn parse_tracks(&mut self, body: &[u8], handler: &mut dyn ReadHandler) -> LiuResult<()> {
        for (id, entry) in children(body)? {
            if id != ebml::TRACK_ENTRY {
                continue;
            }
            let mut number = None;
            let mut codec_name = String::new();
            let mut private: Option<&[u8]> = None;
            let mut sound = SoundParams::new(8_000, 1, 16);
            for (child, data) in children(entry)? {
                match child {
                    ebml::TRACK_NUMBER => number = Some(read_uint(data)?),
                    ebml::TRACK_CODEC_ID => codec_name = read_string(data),
                    ebml::TRACK_CODEC_PRIVATE => private = Some(data),
                    ebml::AUDIO_SETTINGS => {
                        for (field, value) in children(data)? {
                            match field {
                                ebml::AUDIO_SAMPLING_FREQ => {
                                    sound.sample_rate = read_float(value)? as u32;
                                }
                                ebml::AUDIO_CHANNELS => sound.channels = read_u8(value)?,
                                ebml::AUDIO_BIT_DEPTH => sound.bits = read_u8(value)?,
                                _ => {}
                            }
                        }
                    }
                    _ => {}
                }
            }
            let number = number
                .ok_or_else(|| LiuError::CorruptStream("MKV: TrackEntry 缺少 TrackNumber".into()))?;
            let codec = mkv_to_codec(&codec_name);
            let mut track = MkvTrack {
                number,
                codec,
                sound,
                nal_length_size: 4,
            };
            info!("MKV: 发现轨道 #{number}, CodecID={codec_name}");
            if codec.is_none() {
                warn!("MKV: 轨道 #{number} 的 CodecID {codec_name} 不支持, 数据块将被跳过");
            }

            let config = match (codec, private) {
                (Some(CodecId::H264), Some(data)) => {
                    let avcc = h264::parse_avcc(data)?;
                    track.nal_length_size = avcc.length_size;
                    Some(Frame::h264(
                        H264Unit::Config,
                        0,
                        0,
                        self.time_base,
                        avcc.to_annex_b(),
                    ))
                }
                (Some(CodecId::Aac), Some(data)) => {
                    let asc = AudioSpecificConfig::parse(data)?;
                    track.sound = SoundParams::new(asc.sample_rate, asc.channels, 16);
                    Some(Frame::aac(AacUnit::Config, 0, self.time_base, data.to_vec()))
                }
                _ => None,
            };
            self.tracks.retain(|t| t.number != number);
            self.tracks.push(track);
            if let Some(frame) = config {
                emit_frame(handler, frame.with_track_id(number as u32))?;
            }
        }
        Ok(())
    }

    /// 解析 Block/SimpleBlock 数据
    fn parse_block(
        &self,
        data: &[u8],
        simple: bool,
        keyframe_hint: bool,
        handler: &mut dyn ReadHandler,
    ) -> LiuResult<()> {
        let truncated = || LiuError::CorruptStream("MKV: 数据块截断".into());
        let mut r = ByteReader::new(data);
        let track_number = r.ebml_varint(false).map_err(|_| truncated())?;
        let delta = r.i16().map_err(|_| truncated())?;
        let flags = r.u8().map_err(|_| truncated())?;
        if (flags >> 1) & 0x03 != 0 {
            return Err(LiuError::Unsupported(format!(
                "MKV: 轨道 #{track_number} 的数据块使用了 lacing"
            )));
        }
        let payload = r.rest()?;
        let keyframe = if simple {
            BlockFlags::from_bits_truncate(flags).contains(BlockFlags::KEYFRAME)
        } else {
            keyframe_hint
        };
        let timecode = self.cluster_timecode + i64::from(delta);

        emit_record(
            handler,
            &ContainerRecord::MkvBlock {
                track_number,
                timecode,
                keyframe,
                body: payload,
            },
        )?;

        let track = self
            .tracks
            .iter()
            .find(|t| t.number == track_number)
            .ok_or_else(|| {
                LiuError::CorruptStream(format!("MKV: 数据块引用未知轨道 #{track_number}"))
            })?;
        let Some(codec) = track.codec else {
            return Ok(());
        };
        let tb = self.time_base;
        let frame = match codec {
            CodecId::H264 => {
                let annex_b = h264::length_prefixed_to_annex_b(payload, track.nal_length_size)?;
                let unit = if keyframe {
                    H264Unit::Keyframe
                } else {
                    H264Unit::Interframe
                };
                Frame::h264(unit, timecode, timecode, tb, annex_b)
            }
            CodecId::Aac => Frame::aac(AacUnit::Raw, timecode, tb, payload.to_vec()),
            other => Frame::audio(other, track.sound, timecode, tb, payload.to_vec())?,
        };
        emit_frame(handler, frame.with_track_id(track_number as u32))
    }

    fn parse_block_group(&self, body: &[u8], handler: &mut dyn ReadHandler) -> LiuResult<()> {
        let kids = children(body)?;
        // 有 ReferenceBlock 即依赖其它帧
        let keyframe = !kids.iter().any(|(id, _)| *id == ebml::REFERENCE_BLOCK);
        let block = kids
            .iter()
            .find(|(id, _)| *id == ebml::BLOCK)
            .map(|(_, data)| *data)
            .ok_or_else(|| LiuError::CorruptStream("MKV: BlockGroup 缺少 Block".into()))?;
        self.parse_block(block, false, keyframe, handler)
    }
}

impl Default for MkvDemux {
    fn default() -> Self {
        Self::new()
    }
}

impl FormatParser for MkvDemux {
    type Header = MkvHeader;

    fn format_id(&self) -> FormatId {
        FormatId::Matroska
    }

    fn parse_header(&mut self, data: &[u8]) -> LiuResult<Option<RecordHeader<MkvHeader>>> {
        let Some(ElementHeader {
            id,
            size,
            header_len,
        }) = read_element_header(data)?
        else {
            return Ok(None);
        };
        if !self.seen_ebml_header && id != ebml::EBML_HEADER {
            return Err(LiuError::CorruptStream(format!(
                "MKV: 首个元素不是 EBML 头: {id:#X}"
            )));
        }
        if matches!(id, ebml::SEGMENT | ebml::CLUSTER) {
            return Ok(Some(RecordHeader {
                header: MkvHeader::Enter { id, size },
                header_len,
                body_len: 0,
            }));
        }
        let size = size.ok_or_else(|| {
            LiuError::CorruptStream(format!("MKV: 元素 {id:#X} 不能为未知大小"))
        })?;
        if size > MAX_ELEMENT_SIZE {
            return Err(LiuError::CorruptStream(format!(
                "MKV: 元素 {id:#X} 过大: {size} 字节"
            )));
        }
        Ok(Some(RecordHeader {
            header: MkvHeader::Element { id, size },
            header_len,
            body_len: size as usize,
        }))
    }

    fn parse_body(
        &mut self,
        header: MkvHeader,
        body: &[u8],
        handler: &mut dyn ReadHandler,
    ) -> LiuResult<()> {
        match header {
            MkvHeader::Enter { id, size } => {
                if id == ebml::CLUSTER {
                    self.cluster_timecode = 0;
                }
                emit_record(handler, &ContainerRecord::EbmlElement { id, size, body })
            }
            MkvHeader::Element { id, size } => {
                match id {
                    ebml::SIMPLE_BLOCK => return self.parse_block(body, true, true, handler),
                    ebml::BLOCK_GROUP => return self.parse_block_group(body, handler),
                    ebml::EBML_HEADER => self.parse_ebml_header(body)?,
                    ebml::SEGMENT_INFO => self.parse_info(body)?,
                    ebml::CLUSTER_TIMESTAMP => self.cluster_timecode = read_uint(body)? as i64,
                    _ => {}
                }
                emit_record(
                    handler,
                    &ContainerRecord::EbmlElement {
                        id,
                        size: Some(size),
                        body,
                    },
                )?;
                // 配置帧在 Tracks 记录之后交付
                if id == ebml::TRACKS {
                    self.parse_tracks(body, handler)?;
                }
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mkv::ebml::{put_element, put_float, put_id, put_string, put_uint, put_unknown_size};
    use crate::reader::FrameCollector;

    fn ebml_header(doc_type: &str) -> Vec<u8> {
        let mut header = Vec::new();
        put_string(&mut header, ebml::EBML_DOC_TYPE, doc_type).unwrap();
        let mut out = Vec::new();
        put_element(&mut out, ebml::EBML_HEADER, &header).unwrap();
        out
    }

    /// EBML 头 + Segment + 一条 MP3 轨道 + unknown-size Cluster (时间戳 1000)
    fn mp3_stream_prefix() -> Vec<u8> {
        mp3_stream_with_channels(2)
    }

    fn mp3_stream_with_channels(channels: u64) -> Vec<u8> {
        let mut out = ebml_header("matroska");
        put_id(&mut out, ebml::SEGMENT).unwrap();
        put_unknown_size(&mut out, 8).unwrap();

        let mut audio = Vec::new();
        put_float(&mut audio, ebml::AUDIO_SAMPLING_FREQ, 44_100.0).unwrap();
        put_uint(&mut audio, ebml::AUDIO_CHANNELS, channels).unwrap();
        let mut entry = Vec::new();
        put_uint(&mut entry, ebml::TRACK_NUMBER, 1).unwrap();
        put_uint(&mut entry, ebml::TRACK_TYPE, ebml::TRACK_TYPE_AUDIO).unwrap();
        put_string(&mut entry, ebml::TRACK_CODEC_ID, "A_MPEG/L3").unwrap();
        put_element(&mut entry, ebml::AUDIO_SETTINGS, &audio).unwrap();
        let mut tracks = Vec::new();
        put_element(&mut tracks, ebml::TRACK_ENTRY, &entry).unwrap();
        put_element(&mut out, ebml::TRACKS, &tracks).unwrap();

        put_id(&mut out, ebml::CLUSTER).unwrap();
        put_unknown_size(&mut out, 8).unwrap();
        put_uint(&mut out, ebml::CLUSTER_TIMESTAMP, 1_000).unwrap();
        out
    }

    fn simple_block(track: u8, delta: i16, flags: u8, payload: &[u8]) -> Vec<u8> {
        let mut block = vec![0x80 | track];
        block.extend_from_slice(&delta.to_be_bytes());
        block.push(flags);
        block.extend_from_slice(payload);
        let mut out = Vec::new();
        put_element(&mut out, ebml::SIMPLE_BLOCK, &block).unwrap();
        out
    }

    #[test]
    fn test_mkv_声道数超出范围() {
        let input = mp3_stream_with_channels(300);
        let mut reader = MkvDemux::reader();
        let err = reader.read(&input, &mut FrameCollector::new()).unwrap_err();
        assert!(matches!(err, LiuError::CorruptStream(_)));
    }

    #[test]
    fn test_mkv_读取_simple_block() {
        let mut input = mp3_stream_prefix();
        input.extend(simple_block(1, 26, 0x80, &[0xFF, 0xFB, 0x90]));

        let mut reader = MkvDemux::reader();
        let mut sink = FrameCollector::new();
        reader.read(&input, &mut sink).unwrap();
        assert_eq!(sink.frames.len(), 1);
        let frame = &sink.frames[0];
        assert_eq!(frame.codec_id(), CodecId::Mp3);
        assert_eq!(frame.pts(), 1_026);
        assert_eq!(frame.time_base(), Rational::MILLI);
        assert_eq!(frame.track_id(), 1);
        assert_eq!(frame.sound(), Some(SoundParams::new(44_100, 2, 16)));
        assert_eq!(frame.data().as_ref(), &[0xFF, 0xFB, 0x90]);
        assert_eq!(reader.parser().track_numbers(), vec![1]);
    }

    #[test]
    fn test_mkv_block_group_参考帧() {
        struct BlockFlagsSeen(Vec<bool>);
        impl ReadHandler for BlockFlagsSeen {
            fn on_record(&mut self, record: &ContainerRecord<'_>) -> bool {
                if let ContainerRecord::MkvBlock { keyframe, .. } = record {
                    self.0.push(*keyframe);
                }
                true
            }
            fn on_frame(&mut self, _frame: Frame) -> bool {
                true
            }
        }

        let mut block = vec![0x81, 0x00, 0x00, 0x00, 0xAA];
        let mut group = Vec::new();
        put_element(&mut group, ebml::BLOCK, &block).unwrap();
        let mut input = mp3_stream_prefix();
        put_element(&mut input, ebml::BLOCK_GROUP, &group).unwrap();
        block[4] = 0xBB;
        group.clear();
        put_element(&mut group, ebml::BLOCK, &block).unwrap();
        put_element(&mut group, ebml::REFERENCE_BLOCK, &[0xFF]).unwrap();
        put_element(&mut input, ebml::BLOCK_GROUP, &group).unwrap();

        let mut reader = MkvDemux::reader();
        let mut seen = BlockFlagsSeen(Vec::new());
        reader.read(&input, &mut seen).unwrap();
        assert_eq!(seen.0, vec![true, false]);
    }

    #[test]
    fn test_mkv_lacing_不支持() {
        let mut input = mp3_stream_prefix();
        input.extend(simple_block(1, 0, 0x82, &[0x00, 0x01]));
        let mut reader = MkvDemux::reader();
        let err = reader.read(&input, &mut FrameCollector::new()).unwrap_err();
        assert!(matches!(err, LiuError::Unsupported(_)));
    }

    #[test]
    fn test_mkv_未知轨道() {
        let mut input = mp3_stream_prefix();
        input.extend(simple_block(5, 0, 0x80, &[0x00]));
        let mut reader = MkvDemux::reader();
        let err = reader.read(&input, &mut FrameCollector::new()).unwrap_err();
        assert!(matches!(err, LiuError::CorruptStream(_)));
    }

    #[test]
    fn test_mkv_缺少_ebml_头() {
        let mut input = Vec::new();
        put_uint(&mut input, ebml::CLUSTER_TIMESTAMP, 0).unwrap();
        let mut reader = MkvDemux::reader();
        assert!(reader.read(&input, &mut FrameCollector::new()).is_err());

        let mut reader = MkvDemux::reader();
        let err = reader
            .read(&ebml_header("avi"), &mut FrameCollector::new())
            .unwrap_err();
        assert!(matches!(err, LiuError::CorruptStream(_)));
    }

    #[test]
    fn test_mkv_时间刻度() {
        let mut input = ebml_header("webm");
        put_id(&mut input, ebml::SEGMENT).unwrap();
        put_unknown_size(&mut input, 8).unwrap();
        let mut info = Vec::new();
        put_uint(&mut info, ebml::INFO_TIMESCALE, 100_000).unwrap();
        put_element(&mut input, ebml::SEGMENT_INFO, &info).unwrap();
        let mut reader = MkvDemux::reader();
        reader.read(&input, &mut FrameCollector::new()).unwrap();
        assert_eq!(reader.parser().time_base(), Rational::new(1, 10_000));
    }
}
