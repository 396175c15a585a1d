//! MPEG-TS 读取器.
//!
//! 每个 188 字节的 TS 包是一条记录 (4 字节包头 + 184 字节包体).
//! PAT/PMT 确定轨道, ES 包按 PID 重组为 PES, 在以下时机输出帧:
//! - 同一 PID 出现下一个 PUSI
//! - PES_packet_length 声明的长度已收齐
//! - finish

use log::{debug, info, warn};

use liu_codec::aac::{AudioSpecificConfig, SAMPLES_PER_FRAME, parse_adts_header};
use liu_codec::h264::{self, NalUnitType};
use liu_codec::{AacUnit, CodecId, Frame, H264Unit, mpa};
use liu_core::crc::crc32_mpeg2;
use liu_core::timestamp::rescale;
use liu_core::{ByteReader, LiuError, LiuResult, Rational};

use super::{
    PID_NULL, PID_PAT, TABLE_ID_PAT, TABLE_ID_PMT, TS_HEADER_LEN, TS_PACKET_SIZE, TS_SYNC,
    read_timestamp, stream_type_to_codec,
};
use crate::format_id::FormatId;
use crate::reader::{
    ContainerReader, ContainerRecord, FormatParser, ReadHandler, Reader, RecordHeader, emit_frame,
    emit_record,
};

/// MPEG-TS 读取器
pub type TsReader = Reader<TsDemux>;

/// TS 包头
#[derive(Debug, Clone, Copy)]
pub struct TsHeader {
    pub pid: u16,
    pub payload_unit_start: bool,
    /// adaptation_field_control
    pub adaptation_control: u8,
    pub continuity_counter: u8,
}

/// 正在重组的 PES
#[derive(Debug, Default)]
struct PesBuffer {
    data: Vec<u8>,
    pts: i64,
    dts: i64,
    /// 声明的 ES 数据长度, None 表示不定长
    expected_len: Option<usize>,
}

/// 从 PMT 中发现的轨道
#[derive(Debug)]
struct TsTrack {
    pid: u16,
    codec: CodecId,
    pes: Option<PesBuffer>,
    /// 最近一次输出的配置记录
    last_config: Option<Vec<u8>>,
    last_cc: Option<u8>,
}

/// MPEG-TS 记录解析
pub struct TsDemux {
    pmt_pid: Option<u16>,
    tracks: Vec<TsTrack>,
}

impl TsDemux {
    pub fn new() -> Self {
        Self {
            pmt_pid: None,
            tracks: Vec::new(),
        }
    }

    /// 创建 MPEG-TS 读取器
    pub fn reader() -> TsReader {
        Reader::new(Self::new())
    }

    /// 创建 MPEG-TS 读取器 (工厂函数)
    pub fn create() -> LiuResult<Box<dyn ContainerReader>> {
        Ok(Box::new(Self::reader()))
    }

    /// 已发现的 ES PID
    pub fn pids(&self) -> Vec<u16> {
        self.tracks.iter().map(|t| t.pid).collect()
    }

    /// 从 PSI 负载中取出完整段 (跳过 pointer_field, 校验 CRC)
    fn psi_section(payload: &[u8]) -> LiuResult<Option<&[u8]>> {
        let Some((&pointer, rest)) = payload.split_first() else {
            return Ok(None);
        };
        let section = rest.get(usize::from(pointer)..).unwrap_or_default();
        if section.len() < 3 {
            return Ok(None);
        }
        let section_length = (usize::from(section[1] & 0x0F) << 8) | usize::from(section[2]);
        let total = 3 + section_length;
        if section_length < 9 {
            return Err(LiuError::CorruptStream(format!(
                "MPEG-TS: PSI 段长度非法: {section_length}"
            )));
        }
        if section.len() < total {
            warn!("MPEG-TS: 忽略跨包的 PSI 段, 长度 {total}");
            return Ok(None);
        }
        let section = &section[..total];
        if crc32_mpeg2(section) != 0 {
            return Err(LiuError::CorruptStream("MPEG-TS: PSI 段 CRC 错误".into()));
        }
        // 段头 8 字节, 去掉结尾 CRC
        Ok(Some(&section[..total - 4]))
    }

    fn parse_pat(&mut self, payload: &[u8]) -> LiuResult<()> {
        let Some(section) = Self::psi_section(payload)? else {
            return Ok(());
        };
        if section[0] != TABLE_ID_PAT {
            return Err(LiuError::CorruptStream(format!(
                "MPEG-TS: PAT table_id 非法: {:#04X}",
                section[0]
            )));
        }
        for entry in section[8..].chunks_exact(4) {
            let program = u16::from_be_bytes([entry[0], entry[1]]);
            let pid = u16::from_be_bytes([entry[2], entry[3]]) & 0x1FFF;
            // program 0 指向网络信息表
            if program != 0 {
                if self.pmt_pid != Some(pid) {
                    debug!("MPEG-TS: PAT program={program} PMT_PID={pid:#06X}");
                }
                self.pmt_pid = Some(pid);
                break;
            }
        }
        Ok(())
    }

    fn parse_pmt(&mut self, payload: &[u8]) -> LiuResult<()> {
        let Some(section) = Self::psi_section(payload)? else {
            return Ok(());
        };
        let corrupt = || LiuError::CorruptStream("MPEG-TS: PMT 截断".into());
        if section[0] != TABLE_ID_PMT {
            return Err(LiuError::CorruptStream(format!(
                "MPEG-TS: PMT table_id 非法: {:#04X}",
                section[0]
            )));
        }
        let mut r = ByteReader::new(&section[8..]);
        r.u16().map_err(|_| corrupt())?; // PCR PID
        let program_info_len = usize::from(r.u16().map_err(|_| corrupt())? & 0x0FFF);
        r.skip_bytes(program_info_len).map_err(|_| corrupt())?;
        while r.remaining() >= 5 {
            let stream_type = r.u8()?;
            let pid = r.u16()? & 0x1FFF;
            let es_info_len = usize::from(r.u16()? & 0x0FFF);
            r.skip_bytes(es_info_len).map_err(|_| corrupt())?;
            if self.tracks.iter().any(|t| t.pid == pid) {
                continue;
            }
            let Some(codec) = stream_type_to_codec(stream_type) else {
                warn!("MPEG-TS: 忽略不支持的 stream_type {stream_type:#04X}, PID={pid:#06X}");
                continue;
            };
            info!("MPEG-TS: 发现轨道 PID={pid:#06X}, {codec}");
            self.tracks.push(TsTrack {
                pid,
                codec,
                pes: None,
                last_config: None,
                last_cc: None,
            });
        }
        Ok(())
    }

    /// 解析 PES 包头, 返回 (PES 缓冲区, 包头长度)
    fn parse_pes_header(payload: &[u8]) -> LiuResult<(PesBuffer, usize)> {
        let corrupt = |what: &str| LiuError::CorruptStream(format!("MPEG-TS: PES {what}"));
        let mut r = ByteReader::new(payload);
        if r.uint_be(3).map_err(|_| corrupt("头部截断"))? != 0x00_0001 {
            return Err(corrupt("起始码错误"));
        }
        r.u8().map_err(|_| corrupt("头部截断"))?; // stream_id
        let packet_len = usize::from(r.u16().map_err(|_| corrupt("头部截断"))?);
        if r.bits(2).map_err(|_| corrupt("头部截断"))? != 0b10 {
            return Err(corrupt("缺少可选头"));
        }
        r.bits(6)?;
        let pts_dts_flags = r.bits(2).map_err(|_| corrupt("头部截断"))?;
        r.bits(6)?;
        let header_data_len = usize::from(r.u8().map_err(|_| corrupt("头部截断"))?);
        let header_len = 9 + header_data_len;
        if payload.len() < header_len {
            return Err(corrupt("可选头截断"));
        }
        let mut pts = 0;
        let mut dts = None;
        if pts_dts_flags & 0b10 != 0 {
            pts = read_timestamp(&mut r).map_err(|_| corrupt("PTS 截断"))?;
            if pts_dts_flags == 0b11 {
                dts = Some(read_timestamp(&mut r).map_err(|_| corrupt("DTS 截断"))?);
            }
        }
        let expected_len = match packet_len {
            0 => None,
            n => Some(
                n.checked_sub(3 + header_data_len)
                    .ok_or_else(|| corrupt("PES_packet_length 小于可选头"))?,
            ),
        };
        let pes = PesBuffer {
            data: Vec::new(),
            pts,
            dts: dts.unwrap_or(pts),
            expected_len,
        };
        Ok((pes, header_len))
    }

    fn handle_es_payload(
        &mut self,
        index: usize,
        header: TsHeader,
        payload: &[u8],
        handler: &mut dyn ReadHandler,
    ) -> LiuResult<()> {
        let track = &mut self.tracks[index];
        if let Some(last) = track.last_cc
            && header.adaptation_control & 0x01 != 0
            && (last + 1) & 0x0F != header.continuity_counter
        {
            warn!(
                "MPEG-TS: PID={:#06X} 连续性计数不连续: {last} -> {}",
                track.pid, header.continuity_counter
            );
        }
        track.last_cc = Some(header.continuity_counter);

        if header.payload_unit_start {
            self.flush_pes(index, handler)?;
            let (mut pes, header_len) = Self::parse_pes_header(payload)?;
            pes.data.extend_from_slice(&payload[header_len..]);
            self.tracks[index].pes = Some(pes);
        } else if let Some(pes) = self.tracks[index].pes.as_mut() {
            pes.data.extend_from_slice(payload);
        } else {
            debug!("MPEG-TS: PID={:#06X} 丢弃 PES 起始前的数据", self.tracks[index].pid);
            return Ok(());
        }

        let complete = self.tracks[index]
            .pes
            .as_ref()
            .and_then(|pes| pes.expected_len.map(|len| pes.data.len() >= len))
            .unwrap_or(false);
        if complete {
            self.flush_pes(index, handler)?;
        }
        Ok(())
    }

    /// 把重组完成的 PES 转为帧
    fn flush_pes(&mut self, index: usize, handler: &mut dyn ReadHandler) -> LiuResult<()> {
        let Some(mut pes) = self.tracks[index].pes.take() else {
            return Ok(());
        };
        if let Some(len) = pes.expected_len {
            if pes.data.len() < len {
                warn!(
                    "MPEG-TS: PID={:#06X} PES 不完整, 声明 {len} 字节, 实有 {}",
                    self.tracks[index].pid,
                    pes.data.len()
                );
            }
            pes.data.truncate(len);
        }
        if pes.data.is_empty() {
            return Ok(());
        }
        match self.tracks[index].codec {
            CodecId::H264 => self.h264_frames(index, &pes, handler),
            CodecId::Aac => self.aac_frames(index, &pes, handler),
            _ => {
                let track = &self.tracks[index];
                let sound = mpa::parse_sound_params(&pes.data)?;
                let frame =
                    Frame::audio(track.codec, sound, pes.pts, Rational::MPEG_90K, pes.data)?;
                emit_frame(handler, frame.with_track_id(u32::from(track.pid)))
            }
        }
    }

    /// 去掉 AUD, 带内 SPS/PPS 变化时先输出配置帧
    fn h264_frames(
        &mut self,
        index: usize,
        pes: &PesBuffer,
        handler: &mut dyn ReadHandler,
    ) -> LiuResult<()> {
        let track_id = u32::from(self.tracks[index].pid);
        let tb = Rational::MPEG_90K;
        let nalus = h264::split_annex_b(&pes.data);
        let params: Vec<&[u8]> = nalus
            .iter()
            .filter(|n| matches!(n.nal_type, NalUnitType::Sps | NalUnitType::Pps))
            .map(|n| n.data)
            .collect();
        if !params.is_empty() {
            let config = h264::join_annex_b(params);
            let track = &mut self.tracks[index];
            if track.last_config.as_ref() != Some(&config) {
                debug!("MPEG-TS: PID={:#06X} 参数集更新", track.pid);
                track.last_config = Some(config.clone());
                let frame = Frame::h264(H264Unit::Config, pes.pts, pes.dts, tb, config);
                emit_frame(handler, frame.with_track_id(track_id))?;
            }
        }

        let access_unit = h264::join_annex_b(
            nalus
                .iter()
                .filter(|n| {
                    !matches!(
                        n.nal_type,
                        NalUnitType::Aud | NalUnitType::Sps | NalUnitType::Pps
                    )
                })
                .map(|n| n.data),
        );
        if access_unit.is_empty() {
            return Ok(());
        }
        let unit = h264::classify_access_unit(&access_unit);
        let frame = Frame::h264(unit, pes.pts, pes.dts, tb, access_unit);
        emit_frame(handler, frame.with_track_id(track_id))
    }

    /// 拆分 ADTS 帧, 第 i 帧的 pts 为 PES pts + i * 1024 个采样
    fn aac_frames(
        &mut self,
        index: usize,
        pes: &PesBuffer,
        handler: &mut dyn ReadHandler,
    ) -> LiuResult<()> {
        let track_id = u32::from(self.tracks[index].pid);
        let tb = Rational::MPEG_90K;
        let mut offset = 0;
        let mut count: i64 = 0;
        while offset < pes.data.len() {
            let adts = parse_adts_header(&pes.data[offset..])?;
            let end = offset + adts.frame_len;
            if end > pes.data.len() {
                return Err(LiuError::CorruptStream(format!(
                    "MPEG-TS: ADTS 帧截断, 声明 {} 字节, 剩余 {}",
                    adts.frame_len,
                    pes.data.len() - offset
                )));
            }

            let config = adts.config.to_bytes()?;
            let track = &mut self.tracks[index];
            if track.last_config.as_ref() != Some(&config) {
                debug!(
                    "MPEG-TS: PID={:#06X} AAC 配置 {} Hz, {} 声道",
                    track.pid, adts.config.sample_rate, adts.config.channels
                );
                track.last_config = Some(config.clone());
                let frame = Frame::aac(AacUnit::Config, pes.pts, tb, config);
                emit_frame(handler, frame.with_track_id(track_id))?;
            }

            let pts = pes.pts + Self::aac_offset(&adts.config, count)?;
            let raw = pes.data[offset + adts.header_len..end].to_vec();
            let frame = Frame::aac(AacUnit::Raw, pts, tb, raw);
            emit_frame(handler, frame.with_track_id(track_id))?;
            offset = end;
            count += 1;
        }
        Ok(())
    }

    /// 第 `count` 个 AAC 帧相对 PES 起点的偏移 (90kHz)
    fn aac_offset(config: &AudioSpecificConfig, count: i64) -> LiuResult<i64> {
        let rate = i32::try_from(config.sample_rate)
            .map_err(|_| LiuError::CorruptStream("MPEG-TS: AAC 采样率非法".into()))?;
        rescale(
            count * i64::from(SAMPLES_PER_FRAME),
            Rational::new(1, rate),
            Rational::MPEG_90K,
        )
    }
}

impl Default for TsDemux {
    fn default() -> Self {
        Self::new()
    }
}

impl FormatParser for TsDemux {
    type Header = TsHeader;

    fn format_id(&self) -> FormatId {
        FormatId::MpegTs
    }

    fn parse_header(&mut self, data: &[u8]) -> LiuResult<Option<RecordHeader<TsHeader>>> {
        if data.len() < TS_HEADER_LEN {
            return Ok(None);
        }
        let mut r = ByteReader::new(data);
        let sync = r.u8()?;
        if sync != TS_SYNC {
            return Err(LiuError::CorruptStream(format!(
                "MPEG-TS: 同步字节错误: {sync:#04X}"
            )));
        }
        let transport_error = r.bit()?;
        let payload_unit_start = r.bit()?;
        r.bit()?; // transport_priority
        let pid = r.bits(13)? as u16;
        if r.bits(2)? != 0 {
            return Err(LiuError::Unsupported(format!(
                "MPEG-TS: PID={pid:#06X} 已加扰"
            )));
        }
        let adaptation_control = r.bits(2)? as u8;
        let continuity_counter = r.bits(4)? as u8;
        if transport_error {
            warn!("MPEG-TS: PID={pid:#06X} 传输错误标志置位");
        }
        Ok(Some(RecordHeader {
            header: TsHeader {
                pid,
                payload_unit_start,
                adaptation_control,
                continuity_counter,
            },
            header_len: TS_HEADER_LEN,
            body_len: TS_PACKET_SIZE - TS_HEADER_LEN,
        }))
    }

    fn parse_body(
        &mut self,
        header: TsHeader,
        body: &[u8],
        handler: &mut dyn ReadHandler,
    ) -> LiuResult<()> {
        let mut payload_start = 0;
        if header.adaptation_control & 0x02 != 0 {
            let af_len = usize::from(body[0]);
            if af_len > body.len() - 1 {
                return Err(LiuError::CorruptStream(format!(
                    "MPEG-TS: 适配域长度非法: {af_len}"
                )));
            }
            payload_start = 1 + af_len;
        }
        let payload: &[u8] = if header.adaptation_control & 0x01 != 0 {
            &body[payload_start..]
        } else {
            &[]
        };

        emit_record(
            handler,
            &ContainerRecord::TsPacket {
                pid: header.pid,
                payload_unit_start: header.payload_unit_start,
                continuity_counter: header.continuity_counter,
                payload,
            },
        )?;

        if header.pid == PID_NULL || payload.is_empty() {
            return Ok(());
        }
        if header.pid == PID_PAT {
            if header.payload_unit_start {
                self.parse_pat(payload)?;
            }
            return Ok(());
        }
        if self.pmt_pid == Some(header.pid) {
            if header.payload_unit_start {
                self.parse_pmt(payload)?;
            }
            return Ok(());
        }
        match self.tracks.iter().position(|t| t.pid == header.pid) {
            Some(index) => self.handle_es_payload(index, header, payload, handler),
            None => Ok(()),
        }
    }

    fn finish(&mut self, leftover: &[u8], handler: &mut dyn ReadHandler) -> LiuResult<()> {
        if !leftover.is_empty() {
            warn!("MPEG-TS: 输入结束时剩余 {} 字节不完整包", leftover.len());
        }
        for index in 0..self.tracks.len() {
            self.flush_pes(index, handler)?;
        }
        Ok(())
    }
}
