//! # Liu (流)
//!
//! 纯 Rust 实现的流媒体容器封装引擎.
//!
//! 把编码后的音视频帧写成 FLV / Matroska / MPEG-TS / 分片 MP4 字节流,
//! 或者从任意分块到达的字节流中增量解析出帧.
//!
//! # 快速开始
//!
//! ```rust,no_run
//! use liu::codec::{CodecId, Frame};
//! use liu::core::Rational;
//! use liu::format::{FormatId, TrackSpec, WriterOptions};
//!
//! let options = WriterOptions::new(vec![TrackSpec::new(CodecId::Aac)]);
//! let registry = liu::default_format_registry();
//! let mut writer = registry.create_writer(FormatId::Flv, &options).unwrap();
//! let mut out = Vec::new();
//! let config = Frame::aac(
//!     liu::codec::AacUnit::Config,
//!     0,
//!     Rational::MILLI,
//!     vec![0x12, 0x10],
//! );
//! writer.write(&config, &mut out).unwrap();
//! writer.finish(&mut out).unwrap();
//! ```
//!
//! # Crate 结构
//!
//! | Crate | 功能 |
//! |-------|------|
//! | `liu-core` | 错误类型、字节读写、缓冲区与时间基 |
//! | `liu-codec` | 帧模型与 H.264 / AAC / MP3 码流辅助 |
//! | `liu-format` | 容器写入器、读取器与格式注册表 |

/// 核心类型与工具
pub use liu_core as core;

/// 帧模型与码流辅助
pub use liu_codec as codec;

/// 容器格式框架
pub use liu_format as format;

pub mod config;
pub mod logging;

/// 获取 Liu 版本号
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

/// 创建已注册所有内置容器格式的注册表
pub fn default_format_registry() -> liu_format::FormatRegistry {
    let mut registry = liu_format::FormatRegistry::new();
    liu_format::register_all(&mut registry);
    registry
}
