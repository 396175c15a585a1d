//! # liu-core
//!
//! Liu 容器封装引擎核心库: 错误类型、字节游标、可增长缓冲区、时间基与校验和.

pub mod buffer;
pub mod crc;
pub mod cursor;
pub mod error;
pub mod media_type;
pub mod rational;
pub mod timestamp;

// 重导出常用类型
pub use buffer::GrowableBuffer;
pub use cursor::{ByteReader, ByteWriter};
pub use error::{LiuError, LiuResult};
pub use media_type::MediaType;
pub use rational::Rational;
