//! 写入器的输出目标.
//!
//! 写入器不做文件 I/O, 只把组装好的字节推给 [`ByteSink`].
//! 返回 `false` 表示目标拒绝继续接收, 写入器随即报 `SinkFailure`.

/// 字节输出目标
pub trait ByteSink {
    /// 推送一段输出字节
    fn push(&mut self, bytes: &[u8]) -> bool;
}

/// 追加到内存, 永不拒绝
impl ByteSink for Vec<u8> {
    fn push(&mut self, bytes: &[u8]) -> bool {
        self.extend_from_slice(bytes);
        true
    }
}

/// 把闭包包装为输出目标
///
/// ```
/// use liu_format::sink::{ByteSink, CallbackSink};
///
/// let mut total = 0usize;
/// let mut sink = CallbackSink(|bytes: &[u8]| {
///     total += bytes.len();
///     true
/// });
/// assert!(sink.push(&[1, 2, 3]));
/// ```
pub struct CallbackSink<F>(pub F);

impl<F> ByteSink for CallbackSink<F>
where
    F: FnMut(&[u8]) -> bool,
{
    fn push(&mut self, bytes: &[u8]) -> bool {
        (self.0)(bytes)
    }
}
