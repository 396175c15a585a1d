//! 分片 MP4 读取器.
//!
//! 顶层 box 是记录单位 (含 64 位大小的 box). 处理流程:
//! - moov: 登记轨道, 输出配置帧
//! - moof: 按 tfhd/tfdt/trun 计算本分片的采样位置与时间戳
//! - mdat: 按采样的绝对偏移切出数据, 输出帧

use log::{debug, info, warn};

use liu_codec::aac::AudioSpecificConfig;
use liu_codec::{AacUnit, CodecId, Frame, H264Unit, h264};
use liu_core::{ByteReader, LiuError, LiuResult, Rational};

use super::boxes::{
    children, find_child, find_path, fourcc_str, full_box_header, parse_box_header,
};
use super::{SAMPLE_IS_NON_SYNC, TfhdFlags, TrunFlags};
use crate::format_id::FormatId;
use crate::reader::{
    ContainerReader, ContainerRecord, FormatParser, ReadHandler, Reader, RecordHeader, emit_frame,
    emit_record,
};

/// 分片 MP4 读取器
pub type Mp4Reader = Reader<Fmp4Demux>;

/// 顶层 box 上限
const MAX_BOX_SIZE: u64 = 256 * 1024 * 1024;
/// 单个 trun 的采样数上限
const MAX_RUN_SAMPLES: u32 = 1 << 20;

/// 顶层 box 头
#[derive(Debug, Clone, Copy)]
pub struct Mp4Header {
    pub box_type: [u8; 4],
    /// box 在流中的起始偏移
    pub start: u64,
    pub header_len: usize,
}

/// trex / tfhd 提供的采样默认值
#[derive(Debug, Clone, Copy, Default)]
struct SampleDefaults {
    duration: u32,
    size: u32,
    flags: u32,
}

#[derive(Debug)]
struct Mp4Track {
    track_id: u32,
    time_base: Rational,
    /// 不支持的编解码器为 None, 其采样被跳过
    codec: Option<CodecId>,
    nal_length_size: usize,
    defaults: SampleDefaults,
    /// 没有 tfdt 时下一个分片的起始 dts
    next_dts: i64,
}

/// 已定位但尚未读到数据的采样
#[derive(Debug)]
struct SampleRef {
    track_id: u32,
    /// 在流中的绝对偏移
    offset: u64,
    size: usize,
    dts: i64,
    cts_offset: i64,
    sync: bool,
}

fn corrupt(what: &str) -> LiuError {
    LiuError::CorruptStream(format!("MP4: {what}"))
}

/// 解析描述符长度 (每字节 7 位, 最高位表示继续)
fn read_descriptor_len(r: &mut ByteReader<'_>) -> LiuResult<usize> {
    let mut len = 0usize;
    for _ in 0..4 {
        let b = r.u8()?;
        len = (len << 7) | usize::from(b & 0x7F);
        if b & 0x80 == 0 {
            return Ok(len);
        }
    }
    Ok(len)
}

/// 从 esds 中取出 DecoderSpecificInfo (AudioSpecificConfig)
fn parse_esds(esds: &[u8]) -> LiuResult<&[u8]> {
    let mut r = ByteReader::new(esds);
    full_box_header(&mut r)?;
    if r.u8()? != 0x03 {
        return Err(corrupt("esds 缺少 ES_Descriptor"));
    }
    read_descriptor_len(&mut r)?;
    r.u16()?; // ES_ID
    let flags = r.u8()?;
    if flags & 0x80 != 0 {
        r.u16()?; // dependsOn_ES_ID
    }
    if flags & 0x40 != 0 {
        let url_len = usize::from(r.u8()?);
        r.skip_bytes(url_len)?;
    }
    if flags & 0x20 != 0 {
        r.u16()?; // OCR_ES_ID
    }
    if r.u8()? != 0x04 {
        return Err(corrupt("esds 缺少 DecoderConfigDescriptor"));
    }
    read_descriptor_len(&mut r)?;
    r.skip_bytes(13)?;
    if r.u8()? != 0x05 {
        return Err(corrupt("esds 缺少 DecoderSpecificInfo"));
    }
    let len = read_descriptor_len(&mut r)?;
    r.raw_bytes(len)
}

/// 分片 MP4 记录解析
pub struct Fmp4Demux {
    /// 已消费的字节数 (下一个 box 的起始偏移)
    position: u64,
    tracks: Vec<Mp4Track>,
    samples: Vec<SampleRef>,
}

impl Fmp4Demux {
    pub fn new() -> Self {
        Self {
            position: 0,
            tracks: Vec::new(),
            samples: Vec::new(),
        }
    }

    /// 创建分片 MP4 读取器
    pub fn reader() -> Mp4Reader {
        Reader::new(Self::new())
    }

    /// 创建分片 MP4 读取器 (工厂函数)
    pub fn create() -> LiuResult<Box<dyn ContainerReader>> {
        Ok(Box::new(Self::reader()))
    }

    /// 已登记轨道的 track_ID
    pub fn track_ids(&self) -> Vec<u32> {
        self.tracks.iter().map(|t| t.track_id).collect()
    }

    fn parse_moov(&mut self, moov: &[u8], handler: &mut dyn ReadHandler) -> LiuResult<()> {
        let mut trex = Vec::new();
        if let Some(mvex) = find_child(moov, b"mvex")? {
            for child in children(mvex) {
                let (box_type, body) = child?;
                if &box_type != b"trex" {
                    continue;
                }
                let mut r = ByteReader::new(body);
                full_box_header(&mut r)?;
                let track_id = r.u32()?;
                r.u32()?; // default_sample_description_index
                let defaults = SampleDefaults {
                    duration: r.u32()?,
                    size: r.u32()?,
                    flags: r.u32()?,
                };
                trex.push((track_id, defaults));
            }
        }

        for child in children(moov) {
            let (box_type, trak) = child?;
            if &box_type == b"trak" {
                self.parse_trak(trak, &trex, handler)?;
            }
        }
        Ok(())
    }

    fn parse_trak(
        &mut self,
        trak: &[u8],
        trex: &[(u32, SampleDefaults)],
        handler: &mut dyn ReadHandler,
    ) -> LiuResult<()> {
        let tkhd = find_child(trak, b"tkhd")?.ok_or_else(|| corrupt("trak 缺少 tkhd"))?;
        let mut r = ByteReader::new(tkhd);
        let (version, _) = full_box_header(&mut r)?;
        r.skip_bytes(if version == 1 { 16 } else { 8 })?;
        let track_id = r.u32()?;

        let mdhd =
            find_path(trak, &[b"mdia", b"mdhd"])?.ok_or_else(|| corrupt("trak 缺少 mdhd"))?;
        let mut r = ByteReader::new(mdhd);
        let (version, _) = full_box_header(&mut r)?;
        r.skip_bytes(if version == 1 { 16 } else { 8 })?;
        let timescale = r.u32()?;
        let time_base = i32::try_from(timescale)
            .ok()
            .filter(|&den| den > 0)
            .map(|den| Rational::new(1, den))
            .ok_or_else(|| corrupt(&format!("轨道 {track_id} timescale 非法: {timescale}")))?;

        let stsd = find_path(trak, &[b"mdia", b"minf", b"stbl", b"stsd"])?
            .ok_or_else(|| corrupt("trak 缺少 stsd"))?;
        let mut r = ByteReader::new(stsd);
        full_box_header(&mut r)?;
        let entry_count = r.u32()?;
        let entry = if entry_count == 0 {
            None
        } else {
            children(r.rest()?).next().transpose()?
        };

        let mut codec = None;
        let mut nal_length_size = 4;
        let mut config = None;
        match entry {
            Some((box_type, body)) if &box_type == b"avc1" || &box_type == b"avc3" => {
                // VisualSampleEntry 固定字段 78 字节
                let extensions = body.get(78..).ok_or_else(|| corrupt("avc1 截断"))?;
                let avcc =
                    find_child(extensions, b"avcC")?.ok_or_else(|| corrupt("avc1 缺少 avcC"))?;
                let parsed = h264::parse_avcc(avcc)?;
                nal_length_size = parsed.length_size;
                codec = Some(CodecId::H264);
                config = Some(Frame::h264(
                    H264Unit::Config,
                    0,
                    0,
                    time_base,
                    parsed.to_annex_b(),
                ));
            }
            Some((box_type, body)) if &box_type == b"mp4a" => {
                // AudioSampleEntry 固定字段 28 字节
                let extensions = body.get(28..).ok_or_else(|| corrupt("mp4a 截断"))?;
                let esds =
                    find_child(extensions, b"esds")?.ok_or_else(|| corrupt("mp4a 缺少 esds"))?;
                let asc = parse_esds(esds)?;
                AudioSpecificConfig::parse(asc)?;
                codec = Some(CodecId::Aac);
                config = Some(Frame::aac(AacUnit::Config, 0, time_base, asc.to_vec()));
            }
            Some((box_type, _)) => {
                warn!(
                    "MP4: 轨道 {track_id} 的采样格式 '{}' 不支持, 跳过",
                    fourcc_str(&box_type)
                );
            }
            None => warn!("MP4: 轨道 {track_id} 没有采样描述"),
        }

        let defaults = trex
            .iter()
            .find(|(id, _)| *id == track_id)
            .map(|(_, d)| *d)
            .unwrap_or_default();
        if let Some(codec) = codec {
            info!("MP4: 发现轨道 {track_id}, {codec}, timescale={timescale}");
        }
        self.tracks.retain(|t| t.track_id != track_id);
        self.tracks.push(Mp4Track {
            track_id,
            time_base,
            codec,
            nal_length_size,
            defaults,
            next_dts: 0,
        });
        if let Some(frame) = config {
            emit_frame(handler, frame.with_track_id(track_id))?;
        }
        Ok(())
    }

    fn parse_moof(&mut self, moof_start: u64, moof: &[u8]) -> LiuResult<()> {
        if !self.samples.is_empty() {
            warn!(
                "MP4: 上一个 moof 的 {} 个采样没有对应的 mdat, 丢弃",
                self.samples.len()
            );
            self.samples.clear();
        }
        for child in children(moof) {
            let (box_type, body) = child?;
            match &box_type {
                b"mfhd" => {
                    let mut r = ByteReader::new(body);
                    full_box_header(&mut r)?;
                    debug!("MP4: 分片 #{}", r.u32()?);
                }
                b"traf" => self.parse_traf(moof_start, body)?,
                _ => {}
            }
        }
        Ok(())
    }

    fn parse_traf(&mut self, moof_start: u64, traf: &[u8]) -> LiuResult<()> {
        let tfhd = find_child(traf, b"tfhd")?.ok_or_else(|| corrupt("traf 缺少 tfhd"))?;
        let mut r = ByteReader::new(tfhd);
        let (_, flags) = full_box_header(&mut r)?;
        let flags = TfhdFlags::from_bits_truncate(flags);
        let track_id = r.u32()?;
        let index = self
            .tracks
            .iter()
            .position(|t| t.track_id == track_id)
            .ok_or_else(|| corrupt(&format!("traf 引用未知轨道 {track_id}")))?;

        let mut defaults = self.tracks[index].defaults;
        let base = if flags.contains(TfhdFlags::BASE_DATA_OFFSET) {
            r.u64()?
        } else {
            moof_start
        };
        if flags.contains(TfhdFlags::SAMPLE_DESCRIPTION_INDEX) {
            r.u32()?;
        }
        if flags.contains(TfhdFlags::DEFAULT_SAMPLE_DURATION) {
            defaults.duration = r.u32()?;
        }
        if flags.contains(TfhdFlags::DEFAULT_SAMPLE_SIZE) {
            defaults.size = r.u32()?;
        }
        if flags.contains(TfhdFlags::DEFAULT_SAMPLE_FLAGS) {
            defaults.flags = r.u32()?;
        }

        let mut dts = match find_child(traf, b"tfdt")? {
            Some(tfdt) => {
                let mut r = ByteReader::new(tfdt);
                let (version, _) = full_box_header(&mut r)?;
                let decode_time = if version == 1 {
                    r.u64()?
                } else {
                    u64::from(r.u32()?)
                };
                i64::try_from(decode_time).map_err(|_| corrupt("tfdt 超出范围"))?
            }
            None => self.tracks[index].next_dts,
        };

        let mut data_pos = base;
        for child in children(traf) {
            let (box_type, body) = child?;
            if &box_type != b"trun" {
                continue;
            }
            let mut r = ByteReader::new(body);
            let (version, flags) = full_box_header(&mut r)?;
            let flags = TrunFlags::from_bits_truncate(flags);
            let count = r.u32()?;
            if count > MAX_RUN_SAMPLES {
                return Err(corrupt(&format!("trun 采样数过多: {count}")));
            }
            if flags.contains(TrunFlags::DATA_OFFSET) {
                data_pos = base
                    .checked_add_signed(i64::from(r.i32()?))
                    .ok_or_else(|| corrupt("trun data_offset 越界"))?;
            }
            let first_flags = if flags.contains(TrunFlags::FIRST_SAMPLE_FLAGS) {
                Some(r.u32()?)
            } else {
                None
            };
            for i in 0..count {
                let duration = if flags.contains(TrunFlags::SAMPLE_DURATION) {
                    r.u32()?
                } else {
                    defaults.duration
                };
                let size = if flags.contains(TrunFlags::SAMPLE_SIZE) {
                    r.u32()?
                } else {
                    defaults.size
                };
                let sample_flags = if flags.contains(TrunFlags::SAMPLE_FLAGS) {
                    r.u32()?
                } else {
                    first_flags.filter(|_| i == 0).unwrap_or(defaults.flags)
                };
                let cts_offset = match (flags.contains(TrunFlags::SAMPLE_COMPOSITION_OFFSET), version) {
                    (false, _) => 0,
                    (true, 0) => i64::from(r.u32()?),
                    (true, _) => i64::from(r.i32()?),
                };
                self.samples.push(SampleRef {
                    track_id,
                    offset: data_pos,
                    size: size as usize,
                    dts,
                    cts_offset,
                    sync: sample_flags & SAMPLE_IS_NON_SYNC == 0,
                });
                data_pos += u64::from(size);
                dts += i64::from(duration);
            }
        }
        self.tracks[index].next_dts = dts;
        Ok(())
    }

    /// 用 mdat 内容兑现已定位的采样
    fn parse_mdat(
        &mut self,
        data_start: u64,
        mdat: &[u8],
        handler: &mut dyn ReadHandler,
    ) -> LiuResult<()> {
        if self.samples.is_empty() {
            debug!("MP4: mdat 之前没有 moof, 跳过 {} 字节", mdat.len());
            return Ok(());
        }
        let samples = std::mem::take(&mut self.samples);
        for sample in samples {
            let data = sample
                .offset
                .checked_sub(data_start)
                .and_then(|start| usize::try_from(start).ok())
                .and_then(|start| mdat.get(start..start.checked_add(sample.size)?))
                .ok_or_else(|| {
                    corrupt(&format!(
                        "轨道 {} 的采样超出 mdat 范围: 偏移 {}, {} 字节",
                        sample.track_id, sample.offset, sample.size
                    ))
                })?;
            let Some(track) = self.tracks.iter().find(|t| t.track_id == sample.track_id) else {
                continue;
            };
            let pts = sample.dts + sample.cts_offset;
            let frame = match track.codec {
                Some(CodecId::H264) => {
                    let unit = if sample.sync {
                        H264Unit::Keyframe
                    } else {
                        H264Unit::Interframe
                    };
                    let annex_b = h264::length_prefixed_to_annex_b(data, track.nal_length_size)?;
                    Frame::h264(unit, pts, sample.dts, track.time_base, annex_b)
                }
                Some(CodecId::Aac) => Frame::aac(AacUnit::Raw, pts, track.time_base, data.to_vec()),
                _ => continue,
            };
            emit_frame(handler, frame.with_track_id(sample.track_id))?;
        }
        Ok(())
    }
}

impl Default for Fmp4Demux {
    fn default() -> Self {
        Self::new()
    }
}

impl FormatParser for Fmp4Demux {
    type Header = Mp4Header;

    fn format_id(&self) -> FormatId {
        FormatId::Mp4
    }

    fn parse_header(&mut self, data: &[u8]) -> LiuResult<Option<RecordHeader<Mp4Header>>> {
        let Some(header) = parse_box_header(data)? else {
            return Ok(None);
        };
        if header.size > MAX_BOX_SIZE {
            return Err(corrupt(&format!(
                "box '{}' 过大: {} 字节",
                fourcc_str(&header.box_type),
                header.size
            )));
        }
        let start = self.position;
        self.position += header.size;
        Ok(Some(RecordHeader {
            header: Mp4Header {
                box_type: header.box_type,
                start,
                header_len: header.header_len,
            },
            header_len: header.header_len,
            body_len: header.body_len() as usize,
        }))
    }

    fn parse_body(
        &mut self,
        header: Mp4Header,
        body: &[u8],
        handler: &mut dyn ReadHandler,
    ) -> LiuResult<()> {
        emit_record(
            handler,
            &ContainerRecord::Mp4Box {
                box_type: header.box_type,
                body,
            },
        )?;
        match &header.box_type {
            b"ftyp" | b"styp" => {
                let brand = body.get(..4).map(|b| String::from_utf8_lossy(b).into_owned());
                debug!("MP4: major_brand={}", brand.unwrap_or_default());
                Ok(())
            }
            b"moov" => self.parse_moov(body, handler),
            b"moof" => self.parse_moof(header.start, body),
            b"mdat" => self.parse_mdat(header.start + header.header_len as u64, body, handler),
            other => {
                debug!("MP4: 跳过 box '{}'", fourcc_str(other));
                Ok(())
            }
        }
    }

    fn finish(&mut self, leftover: &[u8], _handler: &mut dyn ReadHandler) -> LiuResult<()> {
        if !leftover.is_empty() {
            warn!("MP4: 输入结束时剩余 {} 字节不完整 box", leftover.len());
        }
        if !self.samples.is_empty() {
            warn!("MP4: {} 个采样没有对应的 mdat", self.samples.len());
            self.samples.clear();
        }
        Ok(())
    }
}
