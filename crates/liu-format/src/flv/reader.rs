//! FLV 读取器.
//!
//! 记录头为 15 字节: PreviousTagSize(4) + Tag 头(11). 首条记录是 9 字节文件头.
//! PreviousTagSize 与上一个 tag 的实际大小不一致时视为数据损坏.

use log::{debug, warn};

use liu_codec::{AacUnit, CodecId, Frame, H264Unit, h264};
use liu_core::{ByteReader, LiuError, LiuResult, Rational};

use super::{
    AUDIO_TRACK_ID, FLV_HEADER_LEN, FlvFlags, PACKET_END_OF_SEQUENCE, PACKET_RAW,
    PACKET_SEQUENCE_HEADER, TAG_AUDIO, TAG_HEADER_LEN, TAG_SCRIPT, TAG_VIDEO, VIDEO_TRACK_ID,
    parse_audio_flags, video_codec,
};
use crate::amf0::{AmfValue, parse_script_data};
use crate::format_id::FormatId;
use crate::reader::{
    ContainerReader, ContainerRecord, FormatParser, ReadHandler, Reader, RecordHeader, emit_frame,
    emit_record,
};

/// 记录头长度: PreviousTagSize + Tag 头
const RECORD_HEADER_LEN: usize = 4 + TAG_HEADER_LEN;

/// FLV 读取器
pub type FlvReader = Reader<FlvDemux>;

/// FLV 记录头
#[derive(Debug, Clone, Copy)]
pub enum FlvHeader {
    File {
        version: u8,
        flags: FlvFlags,
    },
    Tag {
        tag_type: u8,
        timestamp: u32,
        size: u32,
    },
}

/// FLV 记录解析
pub struct FlvDemux {
    /// 是否还在等待文件头
    expect_file_header: bool,
    /// 下一个 PreviousTagSize 的期望值
    expected_prev_size: u32,
    /// avcC 中的 NAL 长度前缀大小
    nal_length_size: usize,
    /// onMetaData 内容
    metadata: Option<AmfValue>,
}

impl FlvDemux {
    pub fn new() -> Self {
        Self {
            expect_file_header: true,
            expected_prev_size: 0,
            nal_length_size: 4,
            metadata: None,
        }
    }

    /// 创建 FLV 读取器
    pub fn reader() -> FlvReader {
        Reader::new(Self::new())
    }

    /// 创建 FLV 读取器 (工厂函数)
    pub fn create() -> LiuResult<Box<dyn ContainerReader>> {
        Ok(Box::new(Self::reader()))
    }

    /// 最近一次解析到的 onMetaData
    pub fn metadata(&self) -> Option<&AmfValue> {
        self.metadata.as_ref()
    }

    fn parse_file_header(data: &[u8]) -> LiuResult<Option<RecordHeader<FlvHeader>>> {
        if data.len() < FLV_HEADER_LEN {
            return Ok(None);
        }
        let mut r = ByteReader::new(data);
        if r.raw_bytes(3)? != b"FLV" {
            return Err(LiuError::CorruptStream("FLV: 签名错误".into()));
        }
        let version = r.u8()?;
        let flags = FlvFlags::from_bits_truncate(r.u8()?);
        let data_offset = r.u32()? as usize;
        if data_offset < FLV_HEADER_LEN {
            return Err(LiuError::CorruptStream(format!(
                "FLV: DataOffset 非法: {data_offset}"
            )));
        }
        // 头部之后可能有扩展字节, 一并跳过
        if data.len() < data_offset {
            return Ok(None);
        }
        Ok(Some(RecordHeader {
            header: FlvHeader::File { version, flags },
            header_len: data_offset,
            body_len: 0,
        }))
    }

    fn parse_tag_header(&self, data: &[u8]) -> LiuResult<Option<RecordHeader<FlvHeader>>> {
        if data.len() < RECORD_HEADER_LEN {
            return Ok(None);
        }
        let mut r = ByteReader::new(data);
        let prev_size = r.u32()?;
        if prev_size != self.expected_prev_size {
            return Err(LiuError::CorruptStream(format!(
                "FLV: PreviousTagSize 不一致, 期望 {} 实际 {prev_size}",
                self.expected_prev_size
            )));
        }
        let type_byte = r.u8()?;
        if type_byte & 0x20 != 0 {
            return Err(LiuError::Unsupported("FLV: 不支持加密 tag".into()));
        }
        let tag_type = type_byte & 0x1F;
        if !matches!(tag_type, TAG_AUDIO | TAG_VIDEO | TAG_SCRIPT) {
            return Err(LiuError::CorruptStream(format!(
                "FLV: 未知 tag 类型 {tag_type}"
            )));
        }
        let size = r.u24()?;
        let ts_low = r.u24()?;
        let ts_ext = r.u8()?;
        let timestamp = (u32::from(ts_ext) << 24) | ts_low;
        r.u24()?; // StreamID
        Ok(Some(RecordHeader {
            header: FlvHeader::Tag {
                tag_type,
                timestamp,
                size,
            },
            header_len: RECORD_HEADER_LEN,
            body_len: size as usize,
        }))
    }

    fn audio_frame(&self, timestamp: i64, body: &[u8]) -> LiuResult<Option<Frame>> {
        let (&flags, rest) = body
            .split_first()
            .ok_or_else(|| LiuError::CorruptStream("FLV: 音频 tag 为空".into()))?;
        let (codec, sound) = parse_audio_flags(flags)?;
        let tb = Rational::MILLI;
        let frame = if codec == CodecId::Aac {
            let (&packet_type, data) = rest
                .split_first()
                .ok_or_else(|| LiuError::CorruptStream("FLV: AAC tag 缺少包类型".into()))?;
            let unit = match packet_type {
                PACKET_SEQUENCE_HEADER => AacUnit::Config,
                PACKET_RAW => AacUnit::Raw,
                other => {
                    warn!("FLV: 忽略未知 AACPacketType {other}");
                    return Ok(None);
                }
            };
            Frame::aac(unit, timestamp, tb, data.to_vec())
        } else {
            Frame::audio(codec, sound, timestamp, tb, rest.to_vec())?
        };
        Ok(Some(frame.with_track_id(AUDIO_TRACK_ID)))
    }

    fn video_frame(&mut self, timestamp: i64, body: &[u8]) -> LiuResult<Option<Frame>> {
        let (&flags, rest) = body
            .split_first()
            .ok_or_else(|| LiuError::CorruptStream("FLV: 视频 tag 为空".into()))?;
        let frame_type = flags >> 4;
        let codec_id = flags & 0x0F;
        let tb = Rational::MILLI;
        // FrameType 5: 视频信息/命令帧, 不含图像
        if frame_type == 5 {
            debug!("FLV: 跳过视频命令帧");
            return Ok(None);
        }
        let keyframe = frame_type == 1;

        let frame = match codec_id {
            video_codec::AVC => {
                let mut r = ByteReader::new(rest);
                let packet_type = r
                    .u8()
                    .map_err(|_| LiuError::CorruptStream("FLV: AVC tag 截断".into()))?;
                let cts = r
                    .i24()
                    .map_err(|_| LiuError::CorruptStream("FLV: AVC tag 截断".into()))?;
                let data = r.rest()?;
                match packet_type {
                    PACKET_SEQUENCE_HEADER => {
                        let config = h264::parse_avcc(data)?;
                        self.nal_length_size = config.length_size;
                        Frame::h264(
                            H264Unit::Config,
                            timestamp,
                            timestamp,
                            tb,
                            config.to_annex_b(),
                        )
                    }
                    PACKET_RAW => {
                        let annex_b = h264::length_prefixed_to_annex_b(data, self.nal_length_size)?;
                        let unit = if keyframe {
                            H264Unit::Keyframe
                        } else {
                            H264Unit::Interframe
                        };
                        Frame::h264(unit, timestamp + i64::from(cts), timestamp, tb, annex_b)
                    }
                    PACKET_END_OF_SEQUENCE => {
                        debug!("FLV: AVC 序列结束");
                        return Ok(None);
                    }
                    other => {
                        return Err(LiuError::CorruptStream(format!(
                            "FLV: 未知 AVCPacketType {other}"
                        )));
                    }
                }
            }
            video_codec::VP6 => {
                // 跳过尺寸调整字节
                let (_, data) = rest
                    .split_first()
                    .ok_or_else(|| LiuError::CorruptStream("FLV: VP6 tag 缺少调整字节".into()))?;
                Frame::vp6(keyframe, timestamp, tb, data.to_vec())
            }
            other => {
                return Err(LiuError::Unsupported(format!(
                    "FLV: 不支持的视频 CodecID {other}"
                )));
            }
        };
        Ok(Some(frame.with_track_id(VIDEO_TRACK_ID)))
    }

    fn script_tag(&mut self, body: &[u8]) {
        match parse_script_data(body) {
            Ok((name, value)) if name == "onMetaData" => {
                debug!("FLV: onMetaData {value:?}");
                self.metadata = Some(value);
            }
            Ok((name, _)) => debug!("FLV: 忽略脚本事件 {name}"),
            // 元数据损坏不影响音视频
            Err(e) => warn!("FLV: 脚本 tag 解析失败: {e}"),
        }
    }
}

impl Default for FlvDemux {
    fn default() -> Self {
        Self::new()
    }
}

impl FormatParser for FlvDemux {
    type Header = FlvHeader;

    fn format_id(&self) -> FormatId {
        FormatId::Flv
    }

    fn parse_header(&mut self, data: &[u8]) -> LiuResult<Option<RecordHeader<FlvHeader>>> {
        if self.expect_file_header {
            Self::parse_file_header(data)
        } else {
            self.parse_tag_header(data)
        }
    }

    fn parse_body(
        &mut self,
        header: FlvHeader,
        body: &[u8],
        handler: &mut dyn ReadHandler,
    ) -> LiuResult<()> {
        match header {
            FlvHeader::File { version, flags } => {
                self.expect_file_header = false;
                self.expected_prev_size = 0;
                emit_record(
                    handler,
                    &ContainerRecord::FlvHeader {
                        version,
                        has_audio: flags.contains(FlvFlags::AUDIO),
                        has_video: flags.contains(FlvFlags::VIDEO),
                    },
                )
            }
            FlvHeader::Tag {
                tag_type,
                timestamp,
                size,
            } => {
                self.expected_prev_size = TAG_HEADER_LEN as u32 + size;
                emit_record(
                    handler,
                    &ContainerRecord::FlvTag {
                        tag_type,
                        timestamp,
                        body,
                    },
                )?;
                let ts = i64::from(timestamp);
                let frame = match tag_type {
                    TAG_AUDIO => self.audio_frame(ts, body)?,
                    TAG_VIDEO => self.video_frame(ts, body)?,
                    _ => {
                        self.script_tag(body);
                        None
                    }
                };
                match frame {
                    Some(frame) => emit_frame(handler, frame),
                    None => Ok(()),
                }
            }
        }
    }

    fn finish(&mut self, leftover: &[u8], _handler: &mut dyn ReadHandler) -> LiuResult<()> {
        // 正常结束时只剩最后一个 PreviousTagSize
        if leftover.len() == 4 {
            let prev = u32::from_be_bytes([leftover[0], leftover[1], leftover[2], leftover[3]]);
            if prev != self.expected_prev_size {
                warn!(
                    "FLV: 末尾 PreviousTagSize 不一致, 期望 {} 实际 {prev}",
                    self.expected_prev_size
                );
            }
        } else if !leftover.is_empty() {
            warn!("FLV: 输入结束时剩余 {} 字节不完整 tag", leftover.len());
        }
        Ok(())
    }
}
