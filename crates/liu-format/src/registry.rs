//! 容器格式注册表.
//!
//! 管理所有已注册的写入器/读取器工厂, 支持按格式标识查找和自动探测.

use std::collections::HashMap;

use liu_core::{LiuError, LiuResult};

use crate::flv::{FlvDemux, FlvMux, FlvProbe};
use crate::format_id::FormatId;
use crate::mkv::{MkvDemux, MkvMux, MkvProbe};
use crate::mp4::{Fmp4Demux, Fmp4Mux, Mp4Probe};
use crate::mpegts::{TsDemux, TsMux, TsProbe};
use crate::options::WriterOptions;
use crate::probe::{FormatProbe, ProbeResult};
use crate::reader::ContainerReader;
use crate::writer::ContainerWriter;

/// 写入器工厂函数类型
pub type WriterFactory = fn(&WriterOptions) -> LiuResult<Box<dyn ContainerWriter>>;

/// 读取器工厂函数类型
pub type ReaderFactory = fn() -> LiuResult<Box<dyn ContainerReader>>;

struct WriterEntry {
    name: String,
    factory: WriterFactory,
}

struct ReaderEntry {
    name: String,
    factory: ReaderFactory,
}

/// 容器格式注册表
pub struct FormatRegistry {
    writers: HashMap<FormatId, WriterEntry>,
    readers: HashMap<FormatId, ReaderEntry>,
    probes: Vec<Box<dyn FormatProbe + Send>>,
}

impl FormatRegistry {
    /// 创建空的注册表
    pub fn new() -> Self {
        Self {
            writers: HashMap::new(),
            readers: HashMap::new(),
            probes: Vec::new(),
        }
    }

    /// 注册一个写入器
    pub fn register_writer(
        &mut self,
        format_id: FormatId,
        name: impl Into<String>,
        factory: WriterFactory,
    ) {
        self.writers.insert(
            format_id,
            WriterEntry {
                name: name.into(),
                factory,
            },
        );
    }

    /// 注册一个读取器
    pub fn register_reader(
        &mut self,
        format_id: FormatId,
        name: impl Into<String>,
        factory: ReaderFactory,
    ) {
        self.readers.insert(
            format_id,
            ReaderEntry {
                name: name.into(),
                factory,
            },
        );
    }

    /// 注册一个格式探测器
    pub fn register_probe(&mut self, probe: Box<dyn FormatProbe + Send>) {
        self.probes.push(probe);
    }

    /// 创建指定格式的写入器
    pub fn create_writer(
        &self,
        format_id: FormatId,
        options: &WriterOptions,
    ) -> LiuResult<Box<dyn ContainerWriter>> {
        let entry = self.writers.get(&format_id).ok_or_else(|| {
            LiuError::Unsupported(format!("未找到 {format_id} 的写入器"))
        })?;
        (entry.factory)(options)
    }

    /// 创建指定格式的读取器
    pub fn create_reader(&self, format_id: FormatId) -> LiuResult<Box<dyn ContainerReader>> {
        let entry = self.readers.get(&format_id).ok_or_else(|| {
            LiuError::Unsupported(format!("未找到 {format_id} 的读取器"))
        })?;
        (entry.factory)()
    }

    /// 探测数据的容器格式
    ///
    /// 遍历所有已注册的探测器, 返回置信度最高的结果.
    pub fn probe(&self, data: &[u8], filename: Option<&str>) -> Option<ProbeResult> {
        let mut best: Option<ProbeResult> = None;
        for probe in &self.probes {
            if let Some(score) = probe.probe(data, filename) {
                let is_better = best.as_ref().is_none_or(|b| score > b.score);
                if is_better {
                    best = Some(ProbeResult {
                        format_id: probe.format_id(),
                        score,
                    });
                }
            }
        }
        best
    }

    /// 探测格式并创建对应的读取器
    pub fn open_reader(
        &self,
        data: &[u8],
        filename: Option<&str>,
    ) -> LiuResult<Box<dyn ContainerReader>> {
        let result = self
            .probe(data, filename)
            .ok_or_else(|| LiuError::Unsupported("无法识别输入格式".into()))?;
        self.create_reader(result.format_id)
    }

    /// 已注册的写入器, 按格式名排序
    pub fn list_writers(&self) -> Vec<(FormatId, &str)> {
        let mut list: Vec<_> = self
            .writers
            .iter()
            .map(|(id, entry)| (*id, entry.name.as_str()))
            .collect();
        list.sort_by_key(|(id, _)| id.name());
        list
    }

    /// 已注册的读取器, 按格式名排序
    pub fn list_readers(&self) -> Vec<(FormatId, &str)> {
        let mut list: Vec<_> = self
            .readers
            .iter()
            .map(|(id, entry)| (*id, entry.name.as_str()))
            .collect();
        list.sort_by_key(|(id, _)| id.name());
        list
    }
}

impl Default for FormatRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// 注册所有内置容器格式
pub fn register_all(registry: &mut FormatRegistry) {
    registry.register_writer(FormatId::Flv, "FLV (Flash Video)", FlvMux::create);
    registry.register_writer(FormatId::Matroska, "Matroska", MkvMux::create);
    registry.register_writer(FormatId::MpegTs, "MPEG-TS", TsMux::create);
    registry.register_writer(FormatId::Mp4, "Fragmented MP4", Fmp4Mux::create);

    registry.register_reader(FormatId::Flv, "FLV (Flash Video)", FlvDemux::create);
    registry.register_reader(FormatId::Matroska, "Matroska", MkvDemux::create);
    registry.register_reader(FormatId::MpegTs, "MPEG-TS", TsDemux::create);
    registry.register_reader(FormatId::Mp4, "Fragmented MP4", Fmp4Demux::create);

    registry.register_probe(Box::new(FlvProbe));
    registry.register_probe(Box::new(MkvProbe));
    registry.register_probe(Box::new(TsProbe));
    registry.register_probe(Box::new(Mp4Probe));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::TrackSpec;
    use crate::probe::SCORE_MAX;
    use crate::reader::ReaderState;
    use crate::writer::WriterState;
    use liu_codec::CodecId;

    fn registry() -> FormatRegistry {
        let mut registry = FormatRegistry::new();
        register_all(&mut registry);
        registry
    }

    #[test]
    fn test_registry_创建写入器与读取器() {
        let registry = registry();
        let options = WriterOptions::new(vec![TrackSpec::new(CodecId::Aac)]);
        for &format_id in FormatId::ALL {
            let writer = registry.create_writer(format_id, &options).unwrap();
            assert_eq!(writer.format_id(), format_id);
            assert_eq!(writer.state(), WriterState::Uninitialized);
            let reader = registry.create_reader(format_id).unwrap();
            assert_eq!(reader.format_id(), format_id);
            assert_eq!(reader.state(), ReaderState::ReadingRecordHeader);
        }
        assert_eq!(registry.list_writers().len(), 4);
        assert_eq!(registry.list_readers()[0].0, FormatId::Flv);
    }

    #[test]
    fn test_registry_空注册表() {
        let registry = FormatRegistry::default();
        assert!(matches!(
            registry.create_reader(FormatId::Flv),
            Err(LiuError::Unsupported(_))
        ));
        assert!(registry.probe(b"FLV\x01", None).is_none());
    }

    #[test]
    fn test_registry_探测取最高分() {
        let registry = registry();
        // 魔数优先于扩展名
        let result = registry.probe(b"FLV\x01\x05", Some("clip.mkv")).unwrap();
        assert_eq!(result.format_id, FormatId::Flv);
        assert_eq!(result.score, SCORE_MAX);

        let result = registry.probe(b"", Some("clip.ts")).unwrap();
        assert_eq!(result.format_id, FormatId::MpegTs);

        let reader = registry.open_reader(&[0x1A, 0x45, 0xDF, 0xA3], None).unwrap();
        assert_eq!(reader.format_id(), FormatId::Matroska);
        assert!(registry.open_reader(b"????", None).is_err());
    }
}
