//! 统一错误类型定义.
//!
//! 所有 Liu crate 共用的错误类型. 核心不做任何内部重试,
//! 每个错误都同步返回给直接调用者.

use thiserror::Error;

/// Liu 统一错误类型
#[derive(Debug, Error)]
pub enum LiuError {
    /// 游标读写超出缓冲区容量 (单位: bit)
    #[error("越界访问: 请求 {requested} bit, 剩余 {remaining} bit")]
    OutOfBounds { requested: u64, remaining: u64 },

    /// 重排队列窗口已满
    #[error("重排队列已满: 窗口大小 {window}")]
    QueueFull { window: usize },

    /// 帧的编解码器/轨道与声明的轨道不匹配
    #[error("未知轨道: {0}")]
    UnknownTrack(String),

    /// 输入码流损坏, 之后的数据不可恢复
    #[error("码流损坏: {0}")]
    CorruptStream(String),

    /// 输出回调拒绝继续
    #[error("输出回调返回失败")]
    SinkFailure,

    /// 记录/帧回调拒绝继续
    #[error("读取回调返回失败")]
    CallbackFailure,

    /// 缺少配置记录 (SPS/PPS, AudioSpecificConfig 等)
    #[error("缺少配置记录: {0}")]
    MissingConfig(String),

    /// 无效参数
    #[error("无效参数: {0}")]
    InvalidArgument(String),

    /// 不支持的操作
    #[error("不支持的操作: {0}")]
    Unsupported(String),

    /// 状态机处于不允许该操作的状态
    #[error("无效状态: {0}")]
    InvalidState(String),

    /// I/O 错误
    #[error("I/O 错误: {0}")]
    Io(#[from] std::io::Error),
}

/// Liu 统一 Result 类型
pub type LiuResult<T> = Result<T, LiuError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_越界信息() {
        let err = LiuError::OutOfBounds {
            requested: 16,
            remaining: 3,
        };
        assert_eq!(err.to_string(), "越界访问: 请求 16 bit, 剩余 3 bit");
    }

    #[test]
    fn test_error_io_转换() {
        fn open() -> LiuResult<()> {
            Err(std::io::Error::other("boom"))?;
            Ok(())
        }
        assert!(matches!(open(), Err(LiuError::Io(_))));
    }
}
