//! 容器读取器框架.
//!
//! 调用方以任意大小的块喂入字节, [`Reader`] 把它们累积在 [`GrowableBuffer`] 中,
//! 交替解析记录头与记录体:
//! ```text
//! ReadingRecordHeader --头部字节足够--> ReadingRecordBody --记录体字节足够--> (回调) --> ReadingRecordHeader
//! ```
//! 任一阶段字节不足时停下等待更多输入, 不会把不完整的记录交给回调.
//!
//! 解析出的记录先交给 [`ReadHandler::on_record`], 再由格式解析器派生出零个或多个帧,
//! 交给 [`ReadHandler::on_frame`]. 任一回调返回 `false` 时本次 read 立即返回 `CallbackFailure`.

use log::{debug, warn};

use liu_codec::Frame;
use liu_core::{GrowableBuffer, LiuError, LiuResult};

use crate::format_id::FormatId;

/// 已读前缀超过该值时压缩缓冲区
const COMPACT_THRESHOLD: usize = 64 * 1024;

/// 读取器状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReaderState {
    ReadingRecordHeader,
    ReadingRecordBody,
    /// 遇到损坏数据, 之后的 read 全部失败
    Failed,
    Finished,
}

/// 容器记录
///
/// 记录体借用自读取器内部缓冲区, 只在回调期间有效.
#[derive(Debug, Clone, PartialEq)]
pub enum ContainerRecord<'a> {
    /// FLV 文件头
    FlvHeader {
        version: u8,
        has_audio: bool,
        has_video: bool,
    },
    /// FLV tag (音频 8 / 视频 9 / 脚本 18)
    FlvTag {
        tag_type: u8,
        timestamp: u32,
        body: &'a [u8],
    },
    /// EBML 元素; 进入 Segment/Cluster 这类主元素时 body 为空
    EbmlElement {
        id: u32,
        size: Option<u64>,
        body: &'a [u8],
    },
    /// Matroska SimpleBlock / Block
    MkvBlock {
        track_number: u64,
        timecode: i64,
        keyframe: bool,
        body: &'a [u8],
    },
    /// MPEG-TS 包
    TsPacket {
        pid: u16,
        payload_unit_start: bool,
        continuity_counter: u8,
        payload: &'a [u8],
    },
    /// ISO BMFF 顶层 box
    Mp4Box { box_type: [u8; 4], body: &'a [u8] },
}

/// 读取回调
pub trait ReadHandler {
    /// 收到一条完整记录, 返回 `false` 中止读取
    fn on_record(&mut self, _record: &ContainerRecord<'_>) -> bool {
        true
    }

    /// 收到一帧, 返回 `false` 中止读取
    fn on_frame(&mut self, frame: Frame) -> bool;
}

/// 收集所有帧的回调
#[derive(Debug, Default)]
pub struct FrameCollector {
    pub frames: Vec<Frame>,
    /// 收到的记录条数
    pub records: usize,
}

impl FrameCollector {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ReadHandler for FrameCollector {
    fn on_record(&mut self, _record: &ContainerRecord<'_>) -> bool {
        self.records += 1;
        true
    }

    fn on_frame(&mut self, frame: Frame) -> bool {
        self.frames.push(frame);
        true
    }
}

/// 把闭包包装为帧回调
pub struct CallbackHandler<F>(pub F);

impl<F> ReadHandler for CallbackHandler<F>
where
    F: FnMut(Frame) -> bool,
{
    fn on_frame(&mut self, frame: Frame) -> bool {
        (self.0)(frame)
    }
}

/// 把记录交给回调
pub(crate) fn emit_record(
    handler: &mut dyn ReadHandler,
    record: &ContainerRecord<'_>,
) -> LiuResult<()> {
    if handler.on_record(record) {
        Ok(())
    } else {
        Err(LiuError::CallbackFailure)
    }
}

/// 把帧交给回调
pub(crate) fn emit_frame(handler: &mut dyn ReadHandler, frame: Frame) -> LiuResult<()> {
    if handler.on_frame(frame) {
        Ok(())
    } else {
        Err(LiuError::CallbackFailure)
    }
}

/// 容器读取器 trait
pub trait ContainerReader: Send {
    /// 获取格式标识
    fn format_id(&self) -> FormatId;

    /// 当前状态
    fn state(&self) -> ReaderState;

    /// 喂入一段字节, 对其中所有完整记录调用回调
    fn read(&mut self, bytes: &[u8], handler: &mut dyn ReadHandler) -> LiuResult<()>;

    /// 输入结束, 冲刷解析器内部暂存的帧
    fn finish(&mut self, handler: &mut dyn ReadHandler) -> LiuResult<()>;
}

/// 已解析的记录头
#[derive(Debug, Clone, Copy)]
pub struct RecordHeader<H> {
    /// 格式相关的头部信息
    pub header: H,
    /// 头部字节数
    pub header_len: usize,
    /// 记录体字节数
    pub body_len: usize,
}

/// 各格式的记录解析
pub trait FormatParser: Send {
    type Header: Copy + Send;

    fn format_id(&self) -> FormatId;

    /// 从未读数据开头解析记录头, 字节不足时返回 `Ok(None)`
    fn parse_header(&mut self, data: &[u8]) -> LiuResult<Option<RecordHeader<Self::Header>>>;

    /// 处理完整的记录体, 产出记录与帧
    fn parse_body(
        &mut self,
        header: Self::Header,
        body: &[u8],
        handler: &mut dyn ReadHandler,
    ) -> LiuResult<()>;

    /// 输入结束; `leftover` 为未能组成完整记录的剩余字节
    fn finish(&mut self, leftover: &[u8], handler: &mut dyn ReadHandler) -> LiuResult<()> {
        let _ = handler;
        if !leftover.is_empty() {
            warn!(
                "{}: 输入结束时剩余 {} 字节不完整数据",
                self.format_id(),
                leftover.len()
            );
        }
        Ok(())
    }
}

/// 通用增量读取器
pub struct Reader<P: FormatParser> {
    parser: P,
    buffer: GrowableBuffer,
    state: ReaderState,
    pending: Option<(P::Header, usize)>,
    /// 首次损坏的原因
    failure: Option<String>,
}

impl<P: FormatParser> Reader<P> {
    pub fn new(parser: P) -> Self {
        Self {
            parser,
            buffer: GrowableBuffer::new(),
            state: ReaderState::ReadingRecordHeader,
            pending: None,
            failure: None,
        }
    }

    /// 格式解析器 (用于读取格式相关的元数据)
    pub fn parser(&self) -> &P {
        &self.parser
    }

    /// 缓冲区中未读的字节数
    pub fn buffered(&self) -> usize {
        self.buffer.ref_size()
    }

    fn check_usable(&self) -> LiuResult<()> {
        match self.state {
            ReaderState::Failed => Err(LiuError::CorruptStream(
                self.failure.clone().unwrap_or_default(),
            )),
            ReaderState::Finished => Err(LiuError::InvalidState("读取器已结束".into())),
            _ => Ok(()),
        }
    }

    /// 回调失败不影响后续读取, 其余错误视为数据流不可恢复
    fn record_failure(&mut self, err: LiuError) -> LiuError {
        if !matches!(err, LiuError::CallbackFailure) {
            warn!("{}: 读取失败: {err}", self.parser.format_id());
            self.state = ReaderState::Failed;
            self.failure = Some(err.to_string());
        }
        err
    }

    fn step(&mut self, handler: &mut dyn ReadHandler) -> LiuResult<bool> {
        match self.state {
            ReaderState::ReadingRecordHeader => {
                let Some(header) = self.parser.parse_header(self.buffer.ref_data())? else {
                    return Ok(false);
                };
                self.buffer.mark_as_read(header.header_len);
                self.pending = Some((header.header, header.body_len));
                self.state = ReaderState::ReadingRecordBody;
                Ok(true)
            }
            ReaderState::ReadingRecordBody => {
                let Some((header, body_len)) = self.pending else {
                    self.state = ReaderState::ReadingRecordHeader;
                    return Ok(true);
                };
                if self.buffer.ref_size() < body_len {
                    return Ok(false);
                }
                let result = {
                    let body = &self.buffer.ref_data()[..body_len];
                    self.parser.parse_body(header, body, handler)
                };
                self.buffer.mark_as_read(body_len);
                self.pending = None;
                self.state = ReaderState::ReadingRecordHeader;
                result.map(|()| true)
            }
            ReaderState::Failed | ReaderState::Finished => Ok(false),
        }
    }
}

impl<P: FormatParser> ContainerReader for Reader<P> {
    fn format_id(&self) -> FormatId {
        self.parser.format_id()
    }

    fn state(&self) -> ReaderState {
        self.state
    }

    fn read(&mut self, bytes: &[u8], handler: &mut dyn ReadHandler) -> LiuResult<()> {
        self.check_usable()?;
        self.buffer.append(bytes);
        loop {
            match self.step(handler) {
                Ok(true) => {}
                Ok(false) => break,
                Err(err) => return Err(self.record_failure(err)),
            }
        }
        if self.buffer.read_mark() > COMPACT_THRESHOLD {
            self.buffer.reset();
        }
        Ok(())
    }

    fn finish(&mut self, handler: &mut dyn ReadHandler) -> LiuResult<()> {
        self.check_usable()?;
        let leftover = self.buffer.ref_data().to_vec();
        if let Some((_, body_len)) = self.pending.take() {
            debug!(
                "{}: 输入结束时记录体不完整, 需要 {body_len} 字节, 实有 {}",
                self.parser.format_id(),
                leftover.len()
            );
        }
        self.state = ReaderState::Finished;
        self.buffer.clear();
        self.parser.finish(&leftover, handler)
    }
}
