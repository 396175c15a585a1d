//! FLV 写入器.
//!
//! 配置记录写成序列头 tag (AVCPacketType/AACPacketType = 0), 变化后在下一帧前重发.
//! 时间戳单位为毫秒, DTS 写入 tag 头, H.264 的 PTS-DTS 写入 CompositionTime.

use log::{debug, warn};

use liu_codec::{CodecId, Frame, FrameBody, H264Unit, SoundParams, h264};
use liu_core::{ByteWriter, LiuError, LiuResult, MediaType, Rational};

use super::{
    FlvFlags, PACKET_END_OF_SEQUENCE, PACKET_RAW, PACKET_SEQUENCE_HEADER, TAG_AUDIO,
    TAG_HEADER_LEN, TAG_SCRIPT, TAG_VIDEO, audio_flags, codec_to_sound_format, codec_to_video_id,
    sound_format,
};
use crate::amf0::{AmfValue, write_script_data};
use crate::format_id::FormatId;
use crate::options::WriterOptions;
use crate::writer::{ContainerWriter, FormatWriter, Writer, WriterTrack};

/// FLV 写入器
pub type FlvWriter = Writer<FlvMux>;

/// FLV 字节布局
pub struct FlvMux {
    /// 最近一个 tag 的时间戳 (毫秒)
    last_timestamp: u32,
}

impl FlvMux {
    /// 校验轨道声明: 至多一条音频与一条视频
    pub fn new(options: &WriterOptions) -> LiuResult<Self> {
        let mut audio = 0;
        let mut video = 0;
        for spec in &options.tracks {
            match spec.kind() {
                MediaType::Audio => {
                    codec_to_sound_format(spec.codec, &SoundParams::default())?;
                    audio += 1;
                }
                MediaType::Video => {
                    codec_to_video_id(spec.codec)?;
                    video += 1;
                }
            }
        }
        if audio > 1 || video > 1 {
            return Err(LiuError::InvalidArgument(format!(
                "FLV 至多一条音频和一条视频轨道, 实际 音频 {audio} 视频 {video}"
            )));
        }
        Ok(Self { last_timestamp: 0 })
    }

    /// 创建 FLV 写入器
    pub fn writer(options: &WriterOptions) -> LiuResult<FlvWriter> {
        Writer::new(Self::new(options)?, options)
    }

    /// 创建 FLV 写入器 (工厂函数)
    pub fn create(options: &WriterOptions) -> LiuResult<Box<dyn ContainerWriter>> {
        Ok(Box::new(Self::writer(options)?))
    }

    /// 写入一个 tag 及其后的 PreviousTagSize
    fn write_tag(out: &mut Vec<u8>, tag_type: u8, timestamp: u32, data: &[u8]) -> LiuResult<()> {
        let mut header = [0u8; TAG_HEADER_LEN];
        let mut w = ByteWriter::new(&mut header);
        w.u8(tag_type)?;
        w.u24(u32::try_from(data.len()).unwrap_or(u32::MAX))
            .map_err(|_| {
                LiuError::InvalidArgument(format!("FLV tag 数据过大: {} 字节", data.len()))
            })?;
        w.u24(timestamp & 0xFF_FFFF)?;
        w.u8((timestamp >> 24) as u8)?;
        w.u24(0)?; // StreamID
        out.extend_from_slice(&header);
        out.extend_from_slice(data);
        let tag_size = (TAG_HEADER_LEN + data.len()) as u32;
        out.extend_from_slice(&tag_size.to_be_bytes());
        Ok(())
    }

    /// onMetaData 脚本 tag
    fn metadata(tracks: &[WriterTrack]) -> LiuResult<Vec<u8>> {
        let mut props = vec![("duration".to_string(), AmfValue::Number(0.0))];
        for track in tracks {
            match track.kind() {
                MediaType::Video => {
                    props.push(("hasVideo".into(), AmfValue::Boolean(true)));
                    let id = codec_to_video_id(track.codec())?;
                    props.push(("videocodecid".into(), AmfValue::Number(f64::from(id))));
                    if let (Some(width), Some(height)) = (track.spec.width, track.spec.height) {
                        props.push(("width".into(), AmfValue::Number(f64::from(width))));
                        props.push(("height".into(), AmfValue::Number(f64::from(height))));
                    }
                }
                MediaType::Audio => {
                    props.push(("hasAudio".into(), AmfValue::Boolean(true)));
                    let id = codec_to_sound_format(track.codec(), &track.sound_params())?;
                    props.push(("audiocodecid".into(), AmfValue::Number(f64::from(id))));
                }
            }
        }
        props.push(("encoder".into(), AmfValue::String("liu".into())));
        write_script_data("onMetaData", &AmfValue::EcmaArray(props))
    }

    /// 序列头 tag 数据; 无需配置记录的编解码器返回 None
    fn sequence_header(track: &WriterTrack) -> LiuResult<Option<(u8, Vec<u8>)>> {
        let Some(config) = track.config_data() else {
            return Ok(None);
        };
        match track.codec() {
            CodecId::H264 => {
                let mut data = vec![(1 << 4) | super::video_codec::AVC, PACKET_SEQUENCE_HEADER];
                data.extend_from_slice(&[0, 0, 0]); // CompositionTime
                data.extend_from_slice(&h264::config_to_avcc(config)?);
                Ok(Some((TAG_VIDEO, data)))
            }
            CodecId::Aac => {
                let flags = audio_flags(sound_format::AAC, &track.sound_params());
                let mut data = vec![flags, PACKET_SEQUENCE_HEADER];
                data.extend_from_slice(config);
                Ok(Some((TAG_AUDIO, data)))
            }
            _ => Ok(None),
        }
    }

    fn tag_timestamp(dts: i64) -> u32 {
        if dts < 0 {
            warn!("FLV: 负时间戳 {dts}ms 截断为 0");
            return 0;
        }
        // 32 位毫秒时间戳回绕
        (dts as u64 & 0xFFFF_FFFF) as u32
    }
}

impl FormatWriter for FlvMux {
    fn format_id(&self) -> FormatId {
        FormatId::Flv
    }

    fn time_base(&self, _track: &WriterTrack) -> LiuResult<Rational> {
        Ok(Rational::MILLI)
    }

    fn write_file_header(&mut self, tracks: &[WriterTrack], out: &mut Vec<u8>) -> LiuResult<()> {
        let mut flags = FlvFlags::empty();
        for track in tracks {
            match track.kind() {
                MediaType::Audio => flags |= FlvFlags::AUDIO,
                MediaType::Video => flags |= FlvFlags::VIDEO,
            }
        }
        out.extend_from_slice(b"FLV"); // Signature
        out.push(1); // Version
        out.push(flags.bits());
        out.extend_from_slice(&9u32.to_be_bytes()); // DataOffset
        out.extend_from_slice(&0u32.to_be_bytes()); // PreviousTagSize0

        let meta = Self::metadata(tracks)?;
        Self::write_tag(out, TAG_SCRIPT, 0, &meta)
    }

    fn write_track_headers(
        &mut self,
        tracks: &[WriterTrack],
        out: &mut Vec<u8>,
    ) -> LiuResult<()> {
        for track in tracks {
            if let Some((tag_type, data)) = Self::sequence_header(track)? {
                Self::write_tag(out, tag_type, 0, &data)?;
            }
        }
        Ok(())
    }

    fn write_config(&mut self, track: &WriterTrack, out: &mut Vec<u8>) -> LiuResult<()> {
        if let Some((tag_type, data)) = Self::sequence_header(track)? {
            debug!("FLV: 重发序列头, 轨道 #{} ts={}", track.index, self.last_timestamp);
            Self::write_tag(out, tag_type, self.last_timestamp, &data)?;
        }
        Ok(())
    }

    fn write_frame(
        &mut self,
        track: &WriterTrack,
        frame: &Frame,
        out: &mut Vec<u8>,
    ) -> LiuResult<()> {
        let timestamp = Self::tag_timestamp(frame.dts());
        let payload = frame.data();

        let (tag_type, mut data) = match &frame.body {
            FrameBody::H264 { unit, .. } => {
                let frame_type = if *unit == H264Unit::Keyframe { 1u8 } else { 2u8 };
                // 负 DTS 截断为 0 后以截断值为基准, 读回的 PTS 不变
                let cts = i32::try_from(frame.pts() - frame.dts().max(0)).unwrap_or(i32::MAX);
                let mut cts_bytes = [0u8; 3];
                ByteWriter::new(&mut cts_bytes).i24(cts).map_err(|_| {
                    LiuError::InvalidArgument(format!("FLV: CompositionTime 超出 24 位: {cts}"))
                })?;
                let mut data = vec![(frame_type << 4) | super::video_codec::AVC, PACKET_RAW];
                data.extend_from_slice(&cts_bytes);
                data.extend_from_slice(&h264::annex_b_to_length_prefixed(payload));
                (TAG_VIDEO, data)
            }
            FrameBody::Vp6 { keyframe, .. } => {
                let frame_type = if *keyframe { 1u8 } else { 2u8 };
                // 第二字节为尺寸调整, 不裁剪
                let mut data = vec![(frame_type << 4) | super::video_codec::VP6, 0x00];
                data.extend_from_slice(payload);
                (TAG_VIDEO, data)
            }
            FrameBody::Aac { .. } => {
                let flags = audio_flags(sound_format::AAC, &track.sound_params());
                (TAG_AUDIO, vec![flags, PACKET_RAW])
            }
            _ => {
                let sound = frame.sound().unwrap_or_else(|| track.sound_params());
                let format = codec_to_sound_format(frame.codec_id(), &sound)?;
                (TAG_AUDIO, vec![audio_flags(format, &sound)])
            }
        };
        if tag_type == TAG_AUDIO {
            data.extend_from_slice(payload);
        }

        Self::write_tag(out, tag_type, timestamp, &data)?;
        self.last_timestamp = timestamp;
        Ok(())
    }

    fn write_trailer(&mut self, tracks: &[WriterTrack], out: &mut Vec<u8>) -> LiuResult<()> {
        let has_avc = tracks
            .iter()
            .any(|t| t.codec() == CodecId::H264 && t.last_config.is_some());
        if has_avc {
            let data = [
                (1 << 4) | super::video_codec::AVC,
                PACKET_END_OF_SEQUENCE,
                0,
                0,
                0,
            ];
            Self::write_tag(out, TAG_VIDEO, self.last_timestamp, &data)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::TrackSpec;
    use liu_codec::AacUnit;

    fn aac_options() -> WriterOptions {
        WriterOptions::new(vec![TrackSpec::new(CodecId::Aac)])
    }

    #[test]
    fn test_flv_写入头部() {
        let mut writer = FlvMux::writer(&aac_options()).unwrap();
        let mut out = Vec::new();
        let config = Frame::aac(AacUnit::Config, 0, Rational::MILLI, vec![0x12, 0x10]);
        writer.write(&config, &mut out).unwrap();
        assert_eq!(&out[..3], b"FLV");
        assert_eq!(out[4], FlvFlags::AUDIO.bits());
        assert_eq!(&out[9..13], &[0, 0, 0, 0]);
        // 脚本 tag 在前
        assert_eq!(out[13], TAG_SCRIPT);
        // 最后一个 tag 是 AAC 序列头
        let n = out.len();
        assert_eq!(&out[n - 4 - 4..n - 4], &[0xAF, 0x00, 0x12, 0x10]);
        assert_eq!(
            u32::from_be_bytes([out[n - 4], out[n - 3], out[n - 2], out[n - 1]]),
            (TAG_HEADER_LEN + 4) as u32
        );
    }

    #[test]
    fn test_flv_拒绝两条音频轨() {
        let options = WriterOptions::new(vec![
            TrackSpec::new(CodecId::Aac),
            TrackSpec::new(CodecId::Mp3),
        ]);
        assert!(FlvMux::writer(&options).is_err());
    }

    #[test]
    fn test_flv_vp6_与_speex() {
        let options = WriterOptions::new(vec![
            TrackSpec::new(CodecId::Vp6),
            TrackSpec::new(CodecId::Speex),
        ]);
        let mut writer = FlvMux::writer(&options).unwrap();
        let mut out = Vec::new();
        let speex = Frame::audio(CodecId::Speex, SoundParams::SPEEX, 0, Rational::MILLI, vec![1])
            .unwrap();
        writer.write(&speex, &mut out).unwrap();
        assert_eq!(out[4], (FlvFlags::AUDIO | FlvFlags::VIDEO).bits());
        writer.finish(&mut out).unwrap();
        // 最后一个 tag: Speex 头字节 + 负载
        let n = out.len();
        assert_eq!(&out[n - 6..n - 4], &[0xB2, 1]);
    }

    #[test]
    fn test_flv_时间戳扩展字节() {
        let mut out = Vec::new();
        FlvMux::write_tag(&mut out, TAG_AUDIO, 0x0123_4567, &[0xAA]).unwrap();
        assert_eq!(&out[4..8], &[0x23, 0x45, 0x67, 0x01]);
        assert_eq!(&out[out.len() - 4..], &12u32.to_be_bytes());
    }

    #[test]
    fn test_flv_负时间戳截断() {
        assert_eq!(FlvMux::tag_timestamp(-5), 0);
        assert_eq!(FlvMux::tag_timestamp(0x1_0000_0001), 1);
    }
}
