//! 会话配置 + 注册表 端到端测试.

use std::io::Write;

use liu::codec::{CodecId, Frame, SoundParams};
use liu::config::SessionConfig;
use liu::core::Rational;
use liu::format::{FormatId, FrameCollector};

fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

#[test]
fn test_config_按配置文件写出并探测读回() {
    init_logger();
    let dir = tempfile::tempdir().unwrap();
    let config_path = dir.path().join("session.json");
    let mut file = std::fs::File::create(&config_path).unwrap();
    write!(
        file,
        r#"{{
            "format": "mkv",
            "tracks": [{{"codec": "mp3", "reorder_disabled": true}}],
            "cluster_duration_ms": 100
        }}"#
    )
    .unwrap();
    drop(file);

    let config = SessionConfig::from_file(&config_path).unwrap();
    assert_eq!(config.format_id().unwrap(), FormatId::Matroska);
    let mut writer = config.create_writer().unwrap();
    let mut out = Vec::new();
    let sound = SoundParams::new(44_100, 2, 16);
    for i in 0..8 {
        let frame =
            Frame::audio(CodecId::Mp3, sound, i * 26, Rational::MILLI, vec![0xFF, 0xFB, i as u8])
                .unwrap();
        writer.write(&frame, &mut out).unwrap();
    }
    writer.finish(&mut out).unwrap();

    let media_path = dir.path().join("out.mka");
    std::fs::write(&media_path, &out).unwrap();
    let data = std::fs::read(&media_path).unwrap();

    let registry = liu::default_format_registry();
    let probe = registry.probe(&data, media_path.to_str()).unwrap();
    assert_eq!(probe.format_id, FormatId::Matroska);
    let mut reader = registry.open_reader(&data, None).unwrap();
    let mut sink = FrameCollector::new();
    reader.read(&data, &mut sink).unwrap();
    reader.finish(&mut sink).unwrap();
    assert_eq!(sink.frames.len(), 8);
    assert_eq!(sink.frames[7].pts(), 182);
    assert_eq!(sink.frames[7].data().as_ref(), &[0xFF, 0xFB, 7]);
}

#[test]
fn test_config_所有格式都可由配置创建() {
    init_logger();
    for &format_id in FormatId::ALL {
        let text = format!(r#"{{"format": "{}", "tracks": [{{"codec": "aac"}}]}}"#, format_id.name());
        let config = SessionConfig::from_json_str(&text).unwrap();
        assert_eq!(config.create_writer().unwrap().format_id(), format_id);
        assert_eq!(config.create_reader().unwrap().format_id(), format_id);
    }
    assert!(!liu::version().is_empty());
}
