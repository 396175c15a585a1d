//! MPEG-TS 写入/读取端到端测试.

use liu::codec::{AacUnit, CodecId, Frame, H264Unit, SoundParams};
use liu::core::{LiuError, Rational};
use liu::format::mpegts::{TS_PACKET_SIZE, TsDemux, TsMux};
use liu::format::{
    ContainerReader, ContainerRecord, ContainerWriter, FrameCollector, ReadHandler, TrackSpec,
    WriterOptions,
};

const SPS_PPS: [u8; 14] = [0, 0, 0, 1, 0x67, 0x42, 0x00, 0x1E, 0, 0, 0, 1, 0x68, 0xCE];
const IDR: [u8; 7] = [0, 0, 0, 1, 0x65, 0x88, 0x84];
const SLICE: [u8; 6] = [0, 0, 0, 1, 0x41, 0x9A];

fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn av_stream() -> Vec<u8> {
    let options = WriterOptions::new(vec![
        TrackSpec::new(CodecId::H264),
        TrackSpec::new(CodecId::Aac),
    ]);
    let mut writer = TsMux::writer(&options).unwrap();
    let mut out = Vec::new();
    let ms = Rational::MILLI;
    writer
        .write(&Frame::h264(H264Unit::Config, 0, 0, ms, SPS_PPS.to_vec()), &mut out)
        .unwrap();
    writer
        .write(&Frame::aac(AacUnit::Config, 0, ms, vec![0x12, 0x10]), &mut out)
        .unwrap();
    for i in 0..4 {
        let (unit, data) = if i == 0 {
            (H264Unit::Keyframe, IDR.to_vec())
        } else {
            (H264Unit::Interframe, SLICE.to_vec())
        };
        writer
            .write(&Frame::h264(unit, i * 40 + 40, i * 40, ms, data), &mut out)
            .unwrap();
    }
    for i in 0..3 {
        writer
            .write(&Frame::aac(AacUnit::Raw, i * 23, ms, vec![0x21, 0x10, i as u8]), &mut out)
            .unwrap();
    }
    writer.finish(&mut out).unwrap();
    out
}

#[test]
fn test_ts_h264_与_aac_往返() {
    init_logger();
    let out = av_stream();
    assert_eq!(out.len() % TS_PACKET_SIZE, 0);

    let mut reader = TsDemux::reader();
    let mut sink = FrameCollector::new();
    reader.read(&out, &mut sink).unwrap();
    reader.finish(&mut sink).unwrap();
    assert_eq!(reader.parser().pids(), vec![0x100, 0x101]);
    assert_eq!(sink.records, out.len() / TS_PACKET_SIZE);

    let video: Vec<&Frame> = sink.frames.iter().filter(|f| f.track_id() == 0x100).collect();
    assert_eq!(video[0].h264_unit(), Some(H264Unit::Config));
    assert_eq!(video[0].data().as_ref(), &SPS_PPS);
    assert_eq!(video[1].h264_unit(), Some(H264Unit::Keyframe));
    // 带内的 AUD 与参数集已剥离
    assert_eq!(video[1].data().as_ref(), &IDR);
    let times: Vec<(i64, i64)> = video[1..].iter().map(|f| (f.pts(), f.dts())).collect();
    assert_eq!(
        times,
        vec![(3600, 0), (7200, 3600), (10800, 7200), (14400, 10800)]
    );
    assert!(video.iter().all(|f| f.time_base() == Rational::MPEG_90K));

    let audio: Vec<&Frame> = sink.frames.iter().filter(|f| f.track_id() == 0x101).collect();
    assert_eq!(audio[0].aac_unit(), Some(AacUnit::Config));
    assert_eq!(audio[0].data().as_ref(), &[0x12, 0x10]);
    let pts: Vec<i64> = audio[1..].iter().map(|f| f.pts()).collect();
    assert_eq!(pts, vec![0, 2070, 4140]);
    assert_eq!(audio[3].data().as_ref(), &[0x21, 0x10, 2]);
}

#[test]
fn test_ts_任意分块读取结果一致() {
    init_logger();
    let out = av_stream();
    let mut whole = FrameCollector::new();
    let mut reader = TsDemux::reader();
    reader.read(&out, &mut whole).unwrap();
    reader.finish(&mut whole).unwrap();

    for chunk_size in [1, 100, 187, 189] {
        let mut reader = TsDemux::reader();
        let mut sink = FrameCollector::new();
        for chunk in out.chunks(chunk_size) {
            reader.read(chunk, &mut sink).unwrap();
        }
        reader.finish(&mut sink).unwrap();
        assert_eq!(sink.frames, whole.frames, "chunk_size={chunk_size}");
    }
}

#[test]
fn test_ts_连续计数器逐包递增() {
    init_logger();
    struct CcCheck {
        last: std::collections::HashMap<u16, u8>,
        gaps: usize,
    }
    impl ReadHandler for CcCheck {
        fn on_record(&mut self, record: &ContainerRecord<'_>) -> bool {
            if let ContainerRecord::TsPacket {
                pid,
                continuity_counter,
                ..
            } = record
            {
                if let Some(prev) = self.last.insert(*pid, *continuity_counter)
                    && (prev + 1) & 0x0F != *continuity_counter
                {
                    self.gaps += 1;
                }
            }
            true
        }
        fn on_frame(&mut self, _frame: Frame) -> bool {
            true
        }
    }

    let mut options = WriterOptions::new(vec![TrackSpec::new(CodecId::Mp3).without_reorder()]);
    options.psi_interval = 5;
    let mut writer = TsMux::writer(&options).unwrap();
    let mut out = Vec::new();
    let sound = SoundParams::new(44_100, 2, 16);
    for i in 0..40 {
        let frame =
            Frame::audio(CodecId::Mp3, sound, i * 26, Rational::MILLI, vec![0xFF; 400]).unwrap();
        writer.write(&frame, &mut out).unwrap();
    }
    writer.finish(&mut out).unwrap();

    let mut check = CcCheck {
        last: Default::default(),
        gaps: 0,
    };
    let mut reader = TsDemux::reader();
    reader.read(&out, &mut check).unwrap();
    assert_eq!(check.gaps, 0);
    // PAT/PMT/ES 三个 PID
    assert_eq!(check.last.len(), 3);
}

#[test]
fn test_ts_损坏后拒绝继续读取() {
    init_logger();
    let mut out = av_stream();
    out[TS_PACKET_SIZE * 2] = 0x48;
    let mut reader = TsDemux::reader();
    let mut sink = FrameCollector::new();
    let err = reader.read(&out, &mut sink).unwrap_err();
    assert!(matches!(err, LiuError::CorruptStream(_)));
    assert!(matches!(
        reader.read(&[0x47], &mut sink),
        Err(LiuError::CorruptStream(_))
    ));
}
