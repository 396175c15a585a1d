//! FLV 写入/读取端到端测试.

use liu::codec::{AacUnit, CodecId, Frame, H264Unit};
use liu::core::Rational;
use liu::format::flv::{FlvDemux, FlvMux};
use liu::format::{
    ContainerReader, ContainerRecord, ContainerWriter, FrameCollector, ReadHandler, TrackSpec,
    WriterOptions, WriterState,
};

const SPS_PPS: [u8; 14] = [0, 0, 0, 1, 0x67, 0x42, 0x00, 0x1E, 0, 0, 0, 1, 0x68, 0xCE];
const IDR: [u8; 7] = [0, 0, 0, 1, 0x65, 0x88, 0x84];
const SLICE: [u8; 7] = [0, 0, 0, 1, 0x41, 0x9A, 0x02];

fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn read_all(data: &[u8]) -> FrameCollector {
    let mut reader = FlvDemux::reader();
    let mut sink = FrameCollector::new();
    reader.read(data, &mut sink).unwrap();
    reader.finish(&mut sink).unwrap();
    sink
}

#[test]
fn test_flv_aac_时间戳换算为毫秒() {
    init_logger();
    let options = WriterOptions::new(vec![TrackSpec::new(CodecId::Aac)]);
    let mut writer = FlvMux::writer(&options).unwrap();
    let mut out = Vec::new();

    let tb = Rational::new(1, 44_100);
    writer
        .write(&Frame::aac(AacUnit::Config, 0, tb, vec![0x12, 0x10]), &mut out)
        .unwrap();
    for pts in [0, 1024, 2048] {
        writer
            .write(&Frame::aac(AacUnit::Raw, pts, tb, vec![0x21, 0x00]), &mut out)
            .unwrap();
    }
    writer.finish(&mut out).unwrap();
    assert_eq!(writer.state(), WriterState::Finished);

    let sink = read_all(&out);
    assert_eq!(sink.frames[0].aac_unit(), Some(AacUnit::Config));
    assert_eq!(sink.frames[0].data().as_ref(), &[0x12, 0x10]);
    let raw: Vec<i64> = sink
        .frames
        .iter()
        .filter(|f| f.aac_unit() == Some(AacUnit::Raw))
        .map(|f| f.pts())
        .collect();
    assert_eq!(raw, vec![0, 23, 46]);
    assert!(sink.frames.iter().all(|f| f.time_base() == Rational::MILLI));
}

#[test]
fn test_flv_h264_与_aac_往返() {
    init_logger();
    let options = WriterOptions::new(vec![
        TrackSpec::new(CodecId::H264).with_dimensions(640, 360),
        TrackSpec::new(CodecId::Aac),
    ]);
    let mut writer = FlvMux::writer(&options).unwrap();
    let mut out = Vec::new();
    let ms = Rational::MILLI;

    writer
        .write(&Frame::h264(H264Unit::Config, 0, 0, ms, SPS_PPS.to_vec()), &mut out)
        .unwrap();
    writer
        .write(&Frame::aac(AacUnit::Config, 0, ms, vec![0x12, 0x10]), &mut out)
        .unwrap();
    // 解码顺序: I P B
    writer
        .write(&Frame::h264(H264Unit::Keyframe, 40, 0, ms, IDR.to_vec()), &mut out)
        .unwrap();
    writer
        .write(&Frame::h264(H264Unit::Interframe, 120, 40, ms, SLICE.to_vec()), &mut out)
        .unwrap();
    writer
        .write(&Frame::h264(H264Unit::Interframe, 80, 80, ms, SLICE.to_vec()), &mut out)
        .unwrap();
    for pts in [0, 23, 46] {
        writer
            .write(&Frame::aac(AacUnit::Raw, pts, ms, vec![0x21, 0x00]), &mut out)
            .unwrap();
    }
    writer.finish(&mut out).unwrap();

    let mut reader = FlvDemux::reader();
    let mut sink = FrameCollector::new();
    reader.read(&out, &mut sink).unwrap();
    reader.finish(&mut sink).unwrap();

    let meta = reader.parser().metadata().unwrap();
    assert!(format!("{meta:?}").contains("width"));

    let video: Vec<&Frame> = sink
        .frames
        .iter()
        .filter(|f| f.codec_id() == CodecId::H264)
        .collect();
    assert_eq!(video[0].h264_unit(), Some(H264Unit::Config));
    assert_eq!(video[0].data().as_ref(), &SPS_PPS);
    assert_eq!(video[1].h264_unit(), Some(H264Unit::Keyframe));
    assert_eq!(video[1].data().as_ref(), &IDR);
    let times: Vec<(i64, i64)> = video[1..].iter().map(|f| (f.pts(), f.dts())).collect();
    assert_eq!(times, vec![(40, 0), (120, 40), (80, 80)]);

    // 全部媒体帧按 DTS 单调交织
    let dts: Vec<i64> = sink
        .frames
        .iter()
        .filter(|f| !f.is_config_record())
        .map(Frame::dts)
        .collect();
    assert!(dts.windows(2).all(|w| w[0] <= w[1]), "dts 乱序: {dts:?}");
}

#[test]
fn test_flv_逐字节喂入只在最后一字节产出帧() {
    init_logger();
    let mut input = b"FLV\x01\x04".to_vec();
    input.extend_from_slice(&9u32.to_be_bytes());
    input.extend_from_slice(&0u32.to_be_bytes());
    let header_len = input.len();

    // MP3 音频 tag, 数据区 50 字节
    let mut body = vec![0x2F];
    body.extend_from_slice(&[0xFF; 49]);
    input.push(8);
    input.extend_from_slice(&(body.len() as u32).to_be_bytes()[1..]);
    input.extend_from_slice(&[0, 0, 40, 0, 0, 0, 0]);
    input.extend_from_slice(&body);

    let mut reader = FlvDemux::reader();
    let mut sink = FrameCollector::new();
    for (i, byte) in input.iter().enumerate() {
        reader.read(std::slice::from_ref(byte), &mut sink).unwrap();
        if i + 1 < input.len() {
            assert!(sink.frames.is_empty(), "第 {i} 字节提前产出帧");
        }
        if i + 1 == header_len {
            assert_eq!(sink.records, 1);
        }
    }
    assert_eq!(sink.frames.len(), 1);
    assert_eq!(sink.frames[0].pts(), 40);
    assert_eq!(sink.frames[0].data().len(), 49);
}

#[test]
fn test_flv_分块读取与一次读取一致() {
    init_logger();
    let options = WriterOptions::new(vec![TrackSpec::new(CodecId::Mp3).without_reorder()]);
    let mut writer = FlvMux::writer(&options).unwrap();
    let mut out = Vec::new();
    let sound = liu::codec::SoundParams::new(44_100, 2, 16);
    for i in 0..20 {
        let frame =
            Frame::audio(CodecId::Mp3, sound, i * 26, Rational::MILLI, vec![i as u8; 30]).unwrap();
        writer.write(&frame, &mut out).unwrap();
    }
    writer.finish(&mut out).unwrap();

    let whole = read_all(&out);
    for chunk_size in [1, 7, 64, 1000] {
        let mut reader = FlvDemux::reader();
        let mut sink = FrameCollector::new();
        for chunk in out.chunks(chunk_size) {
            reader.read(chunk, &mut sink).unwrap();
        }
        reader.finish(&mut sink).unwrap();
        assert_eq!(sink.frames, whole.frames, "chunk_size={chunk_size}");
        assert_eq!(sink.records, whole.records);
    }
    assert_eq!(whole.frames.len(), 20);
}

#[test]
fn test_flv_负_dts_保持显示时间() {
    init_logger();
    let options = WriterOptions::new(vec![TrackSpec::new(CodecId::H264)]);
    let mut writer = FlvMux::writer(&options).unwrap();
    let mut out = Vec::new();
    let ms = Rational::MILLI;
    writer
        .write(&Frame::h264(H264Unit::Config, 0, 0, ms, SPS_PPS.to_vec()), &mut out)
        .unwrap();
    writer
        .write(&Frame::h264(H264Unit::Keyframe, 0, -40, ms, IDR.to_vec()), &mut out)
        .unwrap();
    writer
        .write(&Frame::h264(H264Unit::Interframe, 80, 0, ms, SLICE.to_vec()), &mut out)
        .unwrap();
    writer.finish(&mut out).unwrap();

    let sink = read_all(&out);
    let times: Vec<(i64, i64)> = sink
        .frames
        .iter()
        .filter(|f| !f.is_config_record())
        .map(|f| (f.pts(), f.dts()))
        .collect();
    // DTS 截断为 0, PTS 不受影响
    assert_eq!(times, vec![(0, 0), (80, 0)]);
}

#[test]
fn test_flv_vp6_调整字节往返() {
    init_logger();
    let options = WriterOptions::new(vec![TrackSpec::new(CodecId::Vp6)]);
    let mut writer = FlvMux::writer(&options).unwrap();
    let mut out = Vec::new();
    let ms = Rational::MILLI;
    writer
        .write(&Frame::vp6(true, 0, ms, vec![0xAB, 0xCD]), &mut out)
        .unwrap();
    writer
        .write(&Frame::vp6(false, 40, ms, vec![0xEF]), &mut out)
        .unwrap();
    writer.finish(&mut out).unwrap();

    let mut bodies = Vec::new();
    let mut frames = Vec::new();
    let mut handler = VideoTags {
        bodies: &mut bodies,
        frames: &mut frames,
    };
    let mut reader = FlvDemux::reader();
    reader.read(&out, &mut handler).unwrap();
    reader.finish(&mut handler).unwrap();

    assert_eq!(bodies, vec![vec![0x14, 0x00, 0xAB, 0xCD], vec![0x24, 0x00, 0xEF]]);
    assert_eq!(frames.len(), 2);
    assert_eq!(frames[0].data().as_ref(), &[0xAB, 0xCD]);
    assert!(frames[0].is_keyframe());
    assert_eq!(frames[1].data().as_ref(), &[0xEF]);
    assert_eq!(frames[1].pts(), 40);
}

/// 收集视频 tag 原始数据
struct VideoTags<'a> {
    bodies: &'a mut Vec<Vec<u8>>,
    frames: &'a mut Vec<Frame>,
}

impl ReadHandler for VideoTags<'_> {
    fn on_record(&mut self, record: &ContainerRecord<'_>) -> bool {
        if let ContainerRecord::FlvTag {
            tag_type: 9, body, ..
        } = record
        {
            self.bodies.push(body.to_vec());
        }
        true
    }

    fn on_frame(&mut self, frame: Frame) -> bool {
        self.frames.push(frame);
        true
    }
}
