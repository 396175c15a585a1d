//! MPEG-TS (Transport Stream).
//!
//! # TS 包结构 (188 字节)
//! ```text
//! ┌──────────────────────────────────────────┐
//! │ 同步字节 (0x47)                    1 byte│
//! │ TEI(1) + PUSI(1) + Priority(1) +         │
//! │   PID(13)                         2 bytes│
//! │ TSC(2) + AFC(2) + CC(4)          1 byte │
//! │ [Adaptation Field]               可变     │
//! │ [Payload]                        可变     │
//! └──────────────────────────────────────────┘
//! ```
//!
//! 节目结构固定: PAT (PID 0) 指向 PMT (PID 0x1000), 第 i 条轨道使用 PID 0x100+i.

use liu_codec::CodecId;
use liu_core::{ByteReader, ByteWriter, LiuError, LiuResult};

use crate::format_id::FormatId;
use crate::probe::{FormatProbe, ProbeScore, SCORE_MAX, probe_extension};

pub mod reader;
pub mod writer;

pub use reader::{TsDemux, TsReader};
pub use writer::{TsMux, TsWriter};

/// TS 包大小
pub const TS_PACKET_SIZE: usize = 188;
/// TS 包头大小
pub const TS_HEADER_LEN: usize = 4;
/// TS 同步字节
pub const TS_SYNC: u8 = 0x47;

/// PAT PID
pub const PID_PAT: u16 = 0x0000;
/// PMT PID
pub const PID_PMT: u16 = 0x1000;
/// 第一个 ES PID
pub const PID_ES_BASE: u16 = 0x0100;
/// 空包 PID
pub const PID_NULL: u16 = 0x1FFF;

/// PSI table_id
pub const TABLE_ID_PAT: u8 = 0x00;
pub const TABLE_ID_PMT: u8 = 0x02;

/// 节目号 (只输出一个节目)
pub const PROGRAM_NUMBER: u16 = 1;

/// PES stream_id
pub const STREAM_ID_VIDEO: u8 = 0xE0;
pub const STREAM_ID_AUDIO: u8 = 0xC0;

/// PMT stream_type
pub mod stream_type {
    pub const MPEG1_AUDIO: u8 = 0x03;
    pub const MPEG2_AUDIO: u8 = 0x04;
    pub const AAC_ADTS: u8 = 0x0F;
    pub const H264: u8 = 0x1B;
}

/// 编解码器 -> stream_type
pub(crate) fn codec_to_stream_type(codec: CodecId) -> LiuResult<u8> {
    match codec {
        CodecId::H264 => Ok(stream_type::H264),
        CodecId::Aac => Ok(stream_type::AAC_ADTS),
        CodecId::Mp3 => Ok(stream_type::MPEG1_AUDIO),
        _ => Err(LiuError::Unsupported(format!(
            "MPEG-TS 不支持编解码器: {codec}"
        ))),
    }
}

/// stream_type -> 编解码器
pub(crate) fn stream_type_to_codec(stream_type: u8) -> Option<CodecId> {
    match stream_type {
        stream_type::H264 => Some(CodecId::H264),
        stream_type::AAC_ADTS => Some(CodecId::Aac),
        stream_type::MPEG1_AUDIO | stream_type::MPEG2_AUDIO => Some(CodecId::Mp3),
        _ => None,
    }
}

/// 写入 5 字节 PTS/DTS 字段: prefix(4) + ts[32..30] + marker + ts[29..15] + marker + ts[14..0] + marker
pub(crate) fn write_timestamp(w: &mut ByteWriter<'_>, prefix: u8, ts: i64) -> LiuResult<()> {
    let ts = (ts as u64) & 0x1_FFFF_FFFF;
    w.bits(u64::from(prefix), 4)?;
    w.bits(ts >> 30, 3)?;
    w.bits(1, 1)?;
    w.bits((ts >> 15) & 0x7FFF, 15)?;
    w.bits(1, 1)?;
    w.bits(ts & 0x7FFF, 15)?;
    w.bits(1, 1)
}

/// 解析 5 字节 PTS/DTS 字段
pub(crate) fn read_timestamp(r: &mut ByteReader<'_>) -> LiuResult<i64> {
    r.bits(4)?;
    let high = r.bits(3)?;
    r.bits(1)?;
    let mid = r.bits(15)?;
    r.bits(1)?;
    let low = r.bits(15)?;
    r.bits(1)?;
    Ok(((high << 30) | (mid << 15) | low) as i64)
}

/// MPEG-TS 格式探测器
pub struct TsProbe;

impl FormatProbe for TsProbe {
    fn probe(&self, data: &[u8], filename: Option<&str>) -> Option<ProbeScore> {
        // 连续两个包的同步字节
        if data.len() > TS_PACKET_SIZE && data[0] == TS_SYNC && data[TS_PACKET_SIZE] == TS_SYNC {
            return Some(SCORE_MAX);
        }
        probe_extension(FormatId::MpegTs, filename)
    }

    fn format_id(&self) -> FormatId {
        FormatId::MpegTs
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ts_时间戳字段() {
        let mut buf = [0u8; 5];
        let mut w = ByteWriter::new(&mut buf);
        write_timestamp(&mut w, 0x2, 90_000).unwrap();
        // 0x21 起始, 三个 marker 位
        assert_eq!(buf, [0x21, 0x00, 0x05, 0xBF, 0x21]);
        let mut r = ByteReader::new(&buf);
        assert_eq!(read_timestamp(&mut r).unwrap(), 90_000);

        // 33 位回绕
        let mut w = ByteWriter::new(&mut buf);
        write_timestamp(&mut w, 0x3, (1 << 33) + 5).unwrap();
        let mut r = ByteReader::new(&buf);
        assert_eq!(read_timestamp(&mut r).unwrap(), 5);
    }

    #[test]
    fn test_ts_stream_type_映射() {
        assert_eq!(codec_to_stream_type(CodecId::H264).unwrap(), 0x1B);
        assert_eq!(codec_to_stream_type(CodecId::Aac).unwrap(), 0x0F);
        assert!(codec_to_stream_type(CodecId::Speex).is_err());
        assert_eq!(stream_type_to_codec(0x04), Some(CodecId::Mp3));
        assert_eq!(stream_type_to_codec(0x24), None);
    }

    #[test]
    fn test_ts_探测() {
        let mut data = vec![0u8; TS_PACKET_SIZE * 2];
        data[0] = TS_SYNC;
        data[TS_PACKET_SIZE] = TS_SYNC;
        assert_eq!(TsProbe.probe(&data, None), Some(SCORE_MAX));
        data[TS_PACKET_SIZE] = 0;
        assert_eq!(TsProbe.probe(&data, None), None);
        assert_eq!(TsProbe.probe(&data, Some("a.m2ts")), Some(50));
    }
}
