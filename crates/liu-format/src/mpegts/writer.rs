//! MPEG-TS 写入器.
//!
//! - 文件头即首组 PAT + PMT, 之后每 `psi_interval` 个 ES 包重发一次
//! - 第一条轨道兼作 PCR 轨道, PCR 放在每个 PES 首包的适配域中
//! - H.264 的配置记录在带内传输: 每个访问单元前加 AUD, 关键帧再加 SPS/PPS
//! - AAC 帧加上由 AudioSpecificConfig 生成的 ADTS 头

use log::debug;

use liu_codec::aac::build_adts_header;
use liu_codec::h264::{self, NalUnitType};
use liu_codec::{CodecId, Frame};
use liu_core::crc::crc32_mpeg2;
use liu_core::{ByteWriter, LiuError, LiuResult, MediaType, Rational};

use super::{
    PID_ES_BASE, PID_PAT, PID_PMT, PROGRAM_NUMBER, STREAM_ID_AUDIO, STREAM_ID_VIDEO,
    TABLE_ID_PAT, TABLE_ID_PMT, TS_HEADER_LEN, TS_PACKET_SIZE, TS_SYNC, codec_to_stream_type,
    write_timestamp,
};
use crate::format_id::FormatId;
use crate::options::WriterOptions;
use crate::writer::{ContainerWriter, FormatWriter, Writer, WriterTrack};

/// TS 包负载最大长度
const TS_PAYLOAD_SIZE: usize = TS_PACKET_SIZE - TS_HEADER_LEN;

/// MPEG-TS 写入器
pub type TsWriter = Writer<TsMux>;

/// 单条轨道的 TS 参数
#[derive(Debug, Clone)]
pub(super) struct TsStream {
    pid: u16,
    stream_type: u8,
    stream_id: u8,
    continuity_counter: u8,
}

/// PES 首包适配域中的字段
#[derive(Debug, Clone, Copy, Default)]
pub(super) struct AdaptationField {
    random_access: bool,
    /// PCR base (90kHz)
    pcr: Option<i64>,
}

impl AdaptationField {
    /// 适配域长度字节之后的内容 (flags + 可选 PCR)
    fn encode(&self) -> LiuResult<Vec<u8>> {
        if !self.random_access && self.pcr.is_none() {
            return Ok(Vec::new());
        }
        let mut buf = [0u8; 7];
        let mut w = ByteWriter::new(&mut buf);
        w.bits(0, 1)?; // discontinuity_indicator
        w.bits(u64::from(self.random_access), 1)?;
        w.bits(0, 1)?; // elementary_stream_priority_indicator
        w.bits(u64::from(self.pcr.is_some()), 1)?;
        w.bits(0, 4)?; // OPCR/splicing/private/extension
        if let Some(pcr) = self.pcr {
            w.bits((pcr as u64) & 0x1_FFFF_FFFF, 33)?;
            w.bits(0x3F, 6)?; // reserved
            w.bits(0, 9)?; // PCR extension
        }
        Ok(w.written().to_vec())
    }
}

/// MPEG-TS 字节布局
pub struct TsMux {
    pub(super) streams: Vec<TsStream>,
    pat_cc: u8,
    pmt_cc: u8,
    /// PSI 重发间隔 (ES 包数), 0 表示只在文件头写一次
    psi_interval: u32,
    /// 上次写 PSI 之后的 ES 包数
    packets_since_psi: u32,
}

impl TsMux {
    pub fn new(options: &WriterOptions) -> LiuResult<Self> {
        let streams = options
            .tracks
            .iter()
            .enumerate()
            .map(|(i, spec)| {
                let pid = u16::try_from(i)
                    .ok()
                    .and_then(|i| PID_ES_BASE.checked_add(i))
                    .filter(|&pid| pid < PID_PMT)
                    .ok_or_else(|| LiuError::InvalidArgument("MPEG-TS: 轨道数过多".into()))?;
                Ok(TsStream {
                    pid,
                    stream_type: codec_to_stream_type(spec.codec)?,
                    stream_id: match spec.kind() {
                        MediaType::Video => STREAM_ID_VIDEO,
                        MediaType::Audio => STREAM_ID_AUDIO,
                    },
                    continuity_counter: 0,
                })
            })
            .collect::<LiuResult<Vec<_>>>()?;
        Ok(Self {
            streams,
            pat_cc: 0,
            pmt_cc: 0,
            psi_interval: options.psi_interval,
            packets_since_psi: 0,
        })
    }

    /// 创建 MPEG-TS 写入器
    pub fn writer(options: &WriterOptions) -> LiuResult<TsWriter> {
        Writer::new(Self::new(options)?, options)
    }

    /// 创建 MPEG-TS 写入器 (工厂函数)
    pub fn create(options: &WriterOptions) -> LiuResult<Box<dyn ContainerWriter>> {
        Ok(Box::new(Self::writer(options)?))
    }

    /// 写 4 字节 TS 包头
    fn put_packet_header(
        out: &mut Vec<u8>,
        pid: u16,
        pusi: bool,
        adaptation: bool,
        cc: u8,
    ) -> LiuResult<()> {
        let mut buf = [0u8; TS_HEADER_LEN];
        let mut w = ByteWriter::new(&mut buf);
        w.bits(u64::from(TS_SYNC), 8)?;
        w.bits(0, 1)?; // transport_error_indicator
        w.bits(u64::from(pusi), 1)?;
        w.bits(0, 1)?; // transport_priority
        w.bits(u64::from(pid), 13)?;
        w.bits(0, 2)?; // transport_scrambling_control
        w.bits(if adaptation { 0b11 } else { 0b01 }, 2)?;
        w.bits(u64::from(cc & 0x0F), 4)?;
        out.extend_from_slice(&buf);
        Ok(())
    }

    /// 组装 PSI 段: 段头 + body + CRC32
    fn psi_section(table_id: u8, id_extension: u16, body: &[u8]) -> Vec<u8> {
        // section_length 从 id_extension 算到 CRC 结束
        let section_length = 5 + body.len() + 4;
        let mut section = vec![
            table_id,
            0xB0 | ((section_length >> 8) as u8 & 0x0F),
            section_length as u8,
            (id_extension >> 8) as u8,
            id_extension as u8,
            0xC1, // reserved, version=0, current_next=1
            0x00, // section_number
            0x00, // last_section_number
        ];
        section.extend_from_slice(body);
        let crc = crc32_mpeg2(&section);
        section.extend_from_slice(&crc.to_be_bytes());
        section
    }

    /// 把一个 PSI 段写成单个 TS 包
    fn put_psi_packet(out: &mut Vec<u8>, pid: u16, cc: u8, section: &[u8]) -> LiuResult<()> {
        if section.len() + 1 > TS_PAYLOAD_SIZE {
            return Err(LiuError::InvalidArgument(format!(
                "MPEG-TS: PSI 段过长: {} 字节",
                section.len()
            )));
        }
        Self::put_packet_header(out, pid, true, false, cc)?;
        out.push(0x00); // pointer_field
        out.extend_from_slice(section);
        out.resize(out.len() + TS_PAYLOAD_SIZE - 1 - section.len(), 0xFF);
        Ok(())
    }

    /// 写 PAT + PMT
    pub(super) fn write_psi(&mut self, out: &mut Vec<u8>) -> LiuResult<()> {
        let mut pat = Vec::with_capacity(4);
        pat.extend_from_slice(&PROGRAM_NUMBER.to_be_bytes());
        pat.extend_from_slice(&(0xE000 | PID_PMT).to_be_bytes());
        let section = Self::psi_section(TABLE_ID_PAT, 1, &pat);
        Self::put_psi_packet(out, PID_PAT, self.pat_cc, &section)?;
        self.pat_cc = self.pat_cc.wrapping_add(1) & 0x0F;

        // PCR PID 使用第一条轨道
        let pcr_pid = self.streams.first().map_or(PID_ES_BASE, |s| s.pid);
        let mut pmt = Vec::new();
        pmt.extend_from_slice(&(0xE000 | pcr_pid).to_be_bytes());
        pmt.extend_from_slice(&0xF000u16.to_be_bytes()); // program_info_length = 0
        for stream in &self.streams {
            pmt.push(stream.stream_type);
            pmt.extend_from_slice(&(0xE000 | stream.pid).to_be_bytes());
            pmt.extend_from_slice(&0xF000u16.to_be_bytes()); // ES_info_length = 0
        }
        let section = Self::psi_section(TABLE_ID_PMT, PROGRAM_NUMBER, &pmt);
        Self::put_psi_packet(out, PID_PMT, self.pmt_cc, &section)?;
        self.pmt_cc = self.pmt_cc.wrapping_add(1) & 0x0F;

        self.packets_since_psi = 0;
        Ok(())
    }

    /// 组装 PES 包
    pub(super) fn build_pes(stream_id: u8, pts: i64, dts: i64, payload: &[u8]) -> LiuResult<Vec<u8>> {
        let has_dts = dts != pts;
        let header_data_len: usize = if has_dts { 10 } else { 5 };
        // PES_packet_length 从 flags 算起, 超出 u16 时写 0 (仅视频允许)
        let pes_length = u16::try_from(3 + header_data_len + payload.len()).unwrap_or(0);

        let mut header = [0u8; 19];
        let mut w = ByteWriter::new(&mut header);
        w.raw_bytes(&[0x00, 0x00, 0x01, stream_id])?;
        w.u16(pes_length)?;
        w.u8(0x80)?; // '10' + 标志位全 0
        w.u8(if has_dts { 0xC0 } else { 0x80 })?;
        w.u8(header_data_len as u8)?;
        if has_dts {
            write_timestamp(&mut w, 0x3, pts)?;
            write_timestamp(&mut w, 0x1, dts)?;
        } else {
            write_timestamp(&mut w, 0x2, pts)?;
        }
        let mut pes = Vec::with_capacity(w.bytes_written() + payload.len());
        pes.extend_from_slice(w.written());
        pes.extend_from_slice(payload);
        Ok(pes)
    }

    /// 把 PES 切分为 TS 包, 返回写出的包数
    ///
    /// 首包携带 `first` 适配域; 最后一个包不足时用适配域填充.
    pub(super) fn put_pes_packets(
        out: &mut Vec<u8>,
        stream: &mut TsStream,
        pes: &[u8],
        first: AdaptationField,
    ) -> LiuResult<u32> {
        let mut offset = 0;
        let mut count = 0;
        while offset < pes.len() {
            let is_first = offset == 0;
            let fields = if is_first {
                first.encode()?
            } else {
                Vec::new()
            };
            let remaining = pes.len() - offset;

            let (chunk, adaptation_len) = if fields.is_empty() && remaining >= TS_PAYLOAD_SIZE {
                (TS_PAYLOAD_SIZE, None)
            } else {
                // 适配域长度字节占 1 字节
                let chunk = remaining.min(TS_PAYLOAD_SIZE - 1 - fields.len());
                (chunk, Some(TS_PAYLOAD_SIZE - 1 - chunk))
            };

            Self::put_packet_header(
                out,
                stream.pid,
                is_first,
                adaptation_len.is_some(),
                stream.continuity_counter,
            )?;
            stream.continuity_counter = stream.continuity_counter.wrapping_add(1) & 0x0F;

            if let Some(len) = adaptation_len {
                out.push(len as u8);
                if len > 0 {
                    if fields.is_empty() {
                        out.push(0x00);
                    } else {
                        out.extend_from_slice(&fields);
                    }
                    let used = fields.len().max(1);
                    out.resize(out.len() + len - used, 0xFF);
                }
            }
            out.extend_from_slice(&pes[offset..offset + chunk]);
            offset += chunk;
            count += 1;
        }
        Ok(count)
    }

    /// H.264 ES 负载: AUD + (关键帧时) SPS/PPS + 访问单元
    fn h264_payload(track: &WriterTrack, frame: &Frame) -> LiuResult<Vec<u8>> {
        let mut payload = h264::START_CODE.to_vec();
        payload.extend_from_slice(&h264::AUD_NAL);
        if frame.is_keyframe()
            && let Some(config) = track.config_data()
        {
            payload.extend_from_slice(&h264::config_to_annex_b(config)?);
        }
        let nalus = h264::split_annex_b(frame.data());
        payload.extend(h264::join_annex_b(
            nalus
                .iter()
                .filter(|n| n.nal_type != NalUnitType::Aud)
                .map(|n| n.data),
        ));
        Ok(payload)
    }

    /// AAC ES 负载: ADTS 头 + 裸帧
    fn aac_payload(track: &WriterTrack, frame: &Frame) -> LiuResult<Vec<u8>> {
        let config = track
            .audio_config()
            .ok_or_else(|| LiuError::MissingConfig("missing AudioSpecificConfig".into()))?;
        let header = build_adts_header(&config, frame.data().len())?;
        let mut payload = header.to_vec();
        payload.extend_from_slice(frame.data());
        Ok(payload)
    }
}

impl FormatWriter for TsMux {
    fn format_id(&self) -> FormatId {
        FormatId::MpegTs
    }

    fn time_base(&self, _track: &WriterTrack) -> LiuResult<Rational> {
        Ok(Rational::MPEG_90K)
    }

    fn write_file_header(&mut self, _tracks: &[WriterTrack], out: &mut Vec<u8>) -> LiuResult<()> {
        self.write_psi(out)?;
        debug!("MPEG-TS: 写入 PAT/PMT, {} 条轨道", self.streams.len());
        Ok(())
    }

    fn write_track_headers(
        &mut self,
        _tracks: &[WriterTrack],
        _out: &mut Vec<u8>,
    ) -> LiuResult<()> {
        // 轨道描述已在 PMT 中
        Ok(())
    }

    fn write_config(&mut self, track: &WriterTrack, _out: &mut Vec<u8>) -> LiuResult<()> {
        debug!(
            "MPEG-TS: 轨道 #{} 配置变化, 随下一个关键帧带内发送",
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
        if self.psi_interval > 0 && self.packets_since_psi >= self.psi_interval {
            self.write_psi(out)?;
            debug!("MPEG-TS: 重发 PAT/PMT");
        }

        let payload = match track.codec() {
            CodecId::H264 => Self::h264_payload(track, frame)?,
            CodecId::Aac => Self::aac_payload(track, frame)?,
            _ => frame.data().to_vec(),
        };
        let stream = self.streams.get_mut(track.index).ok_or_else(|| {
            LiuError::InvalidState(format!("MPEG-TS: 轨道 #{} 未登记", track.index))
        })?;
        let pes = Self::build_pes(stream.stream_id, frame.pts(), frame.dts(), &payload)?;
        let first = AdaptationField {
            random_access: track.kind() == MediaType::Video && frame.is_keyframe(),
            pcr: (track.index == 0).then_some(frame.dts()),
        };
        let count = Self::put_pes_packets(out, stream, &pes, first)?;
        self.packets_since_psi = self.packets_since_psi.saturating_add(count);
        Ok(())
    }

    fn write_trailer(&mut self, _tracks: &[WriterTrack], _out: &mut Vec<u8>) -> LiuResult<()> {
        // TS 没有尾部
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::TrackSpec;
    use liu_codec::{AacUnit, H264Unit, SoundParams};

    fn packet_pid(packet: &[u8]) -> u16 {
        (u16::from(packet[1] & 0x1F) << 8) | u16::from(packet[2])
    }

    #[test]
    fn test_ts_写入头部() {
        let options = WriterOptions::new(vec![TrackSpec::new(CodecId::Mp3)]);
        let mut writer = TsMux::writer(&options).unwrap();
        let mut out = Vec::new();
        let sound = SoundParams::new(44_100, 2, 16);
        let frame = Frame::audio(CodecId::Mp3, sound, 0, Rational::MILLI, vec![0xFF; 10]).unwrap();
        writer.write(&frame, &mut out).unwrap();
        // PAT + PMT
        assert_eq!(out.len(), 2 * TS_PACKET_SIZE);
        assert_eq!(packet_pid(&out[..]), PID_PAT);
        assert_eq!(packet_pid(&out[TS_PACKET_SIZE..]), PID_PMT);
        // PAT CRC 可校验: 对整段 (含 CRC) 计算结果为 0
        let section_len = usize::from(out[6] & 0x0F) << 8 | usize::from(out[7]);
        assert_eq!(crc32_mpeg2(&out[5..8 + section_len]), 0);

        writer.finish(&mut out).unwrap();
        assert_eq!(out.len() % TS_PACKET_SIZE, 0);
        assert_eq!(packet_pid(&out[2 * TS_PACKET_SIZE..]), PID_ES_BASE);
    }

    #[test]
    fn test_ts_pes_填充与_pcr() {
        let mut stream = TsStream {
            pid: PID_ES_BASE,
            stream_type: 0x03,
            stream_id: STREAM_ID_AUDIO,
            continuity_counter: 15,
        };
        let pes = TsMux::build_pes(STREAM_ID_AUDIO, 900, 900, &[0xAB; 200]).unwrap();
        let mut out = Vec::new();
        let first = AdaptationField {
            random_access: false,
            pcr: Some(900),
        };
        let count = TsMux::put_pes_packets(&mut out, &mut stream, &pes, first).unwrap();
        assert_eq!(count, 2);
        assert_eq!(out.len(), 2 * TS_PACKET_SIZE);
        // 首包: 适配域 + PCR, CC 从 15 回绕到 0
        assert_eq!(out[3], 0x3F);
        assert_eq!(out[4], 7);
        assert_eq!(out[5], 0x10);
        assert_eq!(&out[12..16], &[0x00, 0x00, 0x01, STREAM_ID_AUDIO]);
        assert_eq!(out[TS_PACKET_SIZE + 3], 0x30);
        assert_eq!(stream.continuity_counter, 1);
        // 最后一个包以负载结尾
        assert_eq!(out[2 * TS_PACKET_SIZE - 1], 0xAB);
    }

    #[test]
    fn test_ts_h264_带内参数集() {
        let options = WriterOptions::new(vec![TrackSpec::new(CodecId::H264).without_reorder()]);
        let mut writer = TsMux::writer(&options).unwrap();
        let mut out = Vec::new();
        let config = [0, 0, 0, 1, 0x67, 0x42, 0x00, 0x1E, 0, 0, 0, 1, 0x68, 0xCE];
        writer
            .write(&Frame::h264(H264Unit::Config, 0, 0, Rational::MILLI, config.to_vec()), &mut out)
            .unwrap();
        let idr = [0, 0, 0, 1, 0x65, 0x88, 0x84];
        writer
            .write(&Frame::h264(H264Unit::Keyframe, 40, 0, Rational::MILLI, idr.to_vec()), &mut out)
            .unwrap();
        let es = &out[2 * TS_PACKET_SIZE..];
        // 首包带随机访问标志
        assert_eq!(es[5] & 0x40, 0x40);
        // AUD, SPS, IDR 依次出现
        let aud = es.windows(6).position(|w| w == [0, 0, 0, 1, 0x09, 0xF0]).unwrap();
        let sps = es.windows(5).position(|w| w == [0, 0, 0, 1, 0x67]).unwrap();
        let slice = es.windows(5).position(|w| w == [0, 0, 0, 1, 0x65]).unwrap();
        assert!(aud < sps && sps < slice);
        // pts != dts, PES 带 DTS
        let pes = es.windows(4).position(|w| w == [0, 0, 1, 0xE0]).unwrap();
        assert_eq!(es[pes + 7], 0xC0);
    }

    #[test]
    fn test_ts_aac_缺少配置() {
        let options = WriterOptions::new(vec![TrackSpec::new(CodecId::Aac)]);
        let mut writer = TsMux::writer(&options).unwrap();
        let raw = Frame::aac(AacUnit::Raw, 0, Rational::MILLI, vec![0x21]);
        assert!(matches!(
            writer.write(&raw, &mut Vec::new()),
            Err(LiuError::MissingConfig(_))
        ));
    }

    #[test]
    fn test_ts_psi_周期重发() {
        let mut options =
            WriterOptions::new(vec![TrackSpec::new(CodecId::Mp3).without_reorder()]);
        options.psi_interval = 2;
        let mut writer = TsMux::writer(&options).unwrap();
        let mut out = Vec::new();
        let sound = SoundParams::new(44_100, 2, 16);
        for i in 0..5 {
            let frame =
                Frame::audio(CodecId::Mp3, sound, i * 26, Rational::MILLI, vec![0xFF; 10]).unwrap();
            writer.write(&frame, &mut out).unwrap();
        }
        writer.finish(&mut out).unwrap();
        let pats = out
            .chunks(TS_PACKET_SIZE)
            .filter(|p| packet_pid(p) == PID_PAT)
            .count();
        // 头部 1 次 + 第 3, 5 帧前各 1 次
        assert_eq!(pats, 3);
    }

    #[test]
    fn test_ts_拒绝不支持的编解码器() {
        let options = WriterOptions::new(vec![TrackSpec::new(CodecId::Vp6)]);
        assert!(matches!(
            TsMux::writer(&options),
            Err(LiuError::Unsupported(_))
        ));
    }
}
