//! # liu-format
//!
//! Liu 容器封装引擎: 把 [`liu_codec::Frame`] 写成 FLV / Matroska / MPEG-TS / 分片 MP4 字节流,
//! 以及从任意分块的字节流中增量解析出记录与帧.
//!
//! 写入侧由 [`writer::Writer`] 负责帧路由、时间基换算、重排与多轨交织,
//! 读取侧由 [`reader::Reader`] 负责缓冲与记录切分, 格式相关部分分别实现
//! [`writer::FormatWriter`] 与 [`reader::FormatParser`].

pub mod amf0;
pub mod flv;
pub mod format_id;
pub mod mkv;
pub mod mp4;
pub mod mpegts;
pub mod options;
pub mod probe;
pub mod reader;
pub mod registry;
pub mod reorder;
pub mod sink;
pub mod writer;

// 重导出常用类型
pub use format_id::FormatId;
pub use options::{TieBreak, TrackSpec, WriterOptions};
pub use probe::{FormatProbe, ProbeResult};
pub use reader::{
    CallbackHandler, ContainerReader, ContainerRecord, FrameCollector, ReadHandler, ReaderState,
};
pub use registry::{FormatRegistry, register_all};
pub use reorder::FrameReorderQueue;
pub use sink::{ByteSink, CallbackSink};
pub use writer::{ContainerWriter, WriterState};
