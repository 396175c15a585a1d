//! # liu-codec
//!
//! 帧模型与码流辅助工具: 编解码器标识、[`Frame`] 标签联合、
//! H.264 NAL 格式转换、AAC 配置记录与 ADTS 头, 以及 MP3 帧头.
//!
//! 编解码本身不在本 crate 范围内, 帧由外部编码器产生、交给外部解码器消费.

pub mod aac;
pub mod codec_id;
pub mod frame;
pub mod h264;
pub mod mpa;

// 重导出常用类型
pub use codec_id::CodecId;
pub use frame::{AacUnit, Frame, FrameBody, FrameHeader, H264Unit, SoundParams};
