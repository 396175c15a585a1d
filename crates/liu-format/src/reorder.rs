//! 按 DTS 重排的帧队列.
//!
//! 编码器输出的帧可能在 DTS 上轻微乱序. 每条轨道持有一个容量为 W 的窗口,
//! 窗口填满前不释放任何帧; 填满后每次释放 DTS 最小的一帧.
//! 进入 flushing 状态后剩余帧全部可释放.
//!
//! 队列内始终按 (dts, 到达序号) 排序, 相同 DTS 保持到达顺序.

use std::collections::VecDeque;

use liu_codec::Frame;
use liu_core::{LiuError, LiuResult};

/// 视频轨默认重排窗口
pub const DEFAULT_VIDEO_WINDOW: usize = 9;

/// 音频轨默认重排窗口
pub const DEFAULT_AUDIO_WINDOW: usize = 8;

#[derive(Debug)]
struct Slot {
    frame: Frame,
    seq: u64,
}

/// 单轨道的 DTS 重排队列
#[derive(Debug)]
pub struct FrameReorderQueue {
    window: usize,
    slots: VecDeque<Slot>,
    next_seq: u64,
    reorder_disabled: bool,
    flushing: bool,
    /// 最近一次释放帧的 DTS
    last_dts: Option<i64>,
}

impl FrameReorderQueue {
    /// 创建队列, 窗口必须 >= 1
    pub fn new(window: usize) -> LiuResult<Self> {
        if window == 0 {
            return Err(LiuError::InvalidArgument("重排窗口不能为 0".into()));
        }
        Ok(Self {
            window,
            slots: VecDeque::with_capacity(window),
            next_seq: 0,
            reorder_disabled: false,
            flushing: false,
            last_dts: None,
        })
    }

    /// 关闭重排, 帧到达即可释放
    pub fn with_reorder_disabled(mut self, disabled: bool) -> Self {
        self.reorder_disabled = disabled;
        self
    }

    /// 入队一帧
    ///
    /// 窗口已满返回 `QueueFull`; DTS 早于已释放的帧返回 `InvalidArgument`.
    pub fn queue(&mut self, frame: Frame) -> LiuResult<()> {
        if self.slots.len() >= self.window {
            return Err(LiuError::QueueFull {
                window: self.window,
            });
        }
        let dts = frame.dts();
        if let Some(last) = self.last_dts
            && dts < last
        {
            return Err(LiuError::InvalidArgument(format!(
                "帧 DTS {dts} 早于已输出的 DTS {last}"
            )));
        }
        let pos = self.slots.partition_point(|slot| slot.frame.dts() <= dts);
        let seq = self.next_seq;
        self.next_seq += 1;
        self.slots.insert(pos, Slot { frame, seq });
        Ok(())
    }

    /// 当前可释放的帧数
    pub fn ready_count(&self) -> usize {
        if self.reorder_disabled || self.flushing {
            self.slots.len()
        } else {
            self.slots.len().saturating_sub(self.window - 1)
        }
    }

    /// 查看下一帧 (仅当有帧可释放)
    pub fn ref_first(&self) -> Option<&Frame> {
        if self.ready_count() == 0 {
            return None;
        }
        self.slots.front().map(|slot| &slot.frame)
    }

    /// 释放下一帧
    pub fn dequeue_first(&mut self) -> Option<Frame> {
        if self.ready_count() == 0 {
            return None;
        }
        let slot = self.slots.pop_front()?;
        self.last_dts = Some(slot.frame.dts());
        Some(slot.frame)
    }

    /// 进入 flushing 状态, 不可撤销
    pub fn set_flushing(&mut self) {
        self.flushing = true;
    }

    pub fn window(&self) -> usize {
        self.window
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn last_dts(&self) -> Option<i64> {
        self.last_dts
    }

    /// 队列中最小的 DTS, 不论是否可释放
    pub fn lowest_dts(&self) -> Option<i64> {
        self.slots.front().map(|slot| slot.frame.dts())
    }

    #[cfg(test)]
    fn is_sorted(&self) -> bool {
        self.slots.iter().zip(self.slots.iter().skip(1)).all(|(a, b)| {
            (a.frame.dts(), a.seq) < (b.frame.dts(), b.seq)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use liu_codec::{AacUnit, H264Unit};
    use liu_core::Rational;

    fn video(dts: i64) -> Frame {
        Frame::h264(H264Unit::Interframe, dts, dts, Rational::MILLI, vec![0x41])
    }

    fn audio(pts: i64, tag: u8) -> Frame {
        Frame::aac(AacUnit::Raw, pts, Rational::MILLI, vec![tag])
    }

    #[test]
    fn test_reorder_窗口满之前不释放() {
        let mut q = FrameReorderQueue::new(3).unwrap();
        q.queue(video(20)).unwrap();
        q.queue(video(10)).unwrap();
        assert_eq!(q.ready_count(), 0);
        // 未就绪的帧也计入最小 DTS
        assert_eq!(q.lowest_dts(), Some(10));
        assert!(q.dequeue_first().is_none());
        q.queue(video(30)).unwrap();
        assert_eq!(q.ready_count(), 1);
        assert_eq!(q.dequeue_first().unwrap().dts(), 10);
        assert_eq!(q.last_dts(), Some(10));
    }

    #[test]
    fn test_reorder_视频窗口第十帧溢出() {
        let mut q = FrameReorderQueue::new(DEFAULT_VIDEO_WINDOW).unwrap();
        for i in 0..9 {
            q.queue(video(i * 40)).unwrap();
        }
        let err = q.queue(video(360)).unwrap_err();
        assert!(matches!(err, LiuError::QueueFull { window: 9 }));
        assert_eq!(q.len(), 9);
    }

    #[test]
    fn test_reorder_相同时间戳保持到达顺序() {
        let mut q = FrameReorderQueue::new(4).unwrap();
        q.set_flushing();
        q.queue(audio(5, 1)).unwrap();
        q.queue(audio(5, 2)).unwrap();
        q.queue(audio(0, 3)).unwrap();
        assert!(q.is_sorted());
        let tags: Vec<u8> = std::iter::from_fn(|| q.dequeue_first())
            .map(|f| f.data()[0])
            .collect();
        assert_eq!(tags, vec![3, 1, 2]);
    }

    #[test]
    fn test_reorder_关闭重排立即释放() {
        let mut q = FrameReorderQueue::new(8)
            .unwrap()
            .with_reorder_disabled(true);
        q.queue(audio(0, 0)).unwrap();
        assert_eq!(q.ready_count(), 1);
        assert!(q.ref_first().is_some());
        q.dequeue_first().unwrap();
        // 早于已释放帧的 DTS 被拒绝
        assert!(matches!(
            q.queue(audio(-1, 0)),
            Err(LiuError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_reorder_flushing_释放全部() {
        let mut q = FrameReorderQueue::new(9).unwrap();
        for dts in [80, 0, 40] {
            q.queue(video(dts)).unwrap();
        }
        assert_eq!(q.ready_count(), 0);
        q.set_flushing();
        let order: Vec<i64> = std::iter::from_fn(|| q.dequeue_first())
            .map(|f| f.dts())
            .collect();
        assert_eq!(order, vec![0, 40, 80]);
        assert!(q.is_empty());
    }

    #[test]
    fn test_reorder_零窗口非法() {
        assert!(FrameReorderQueue::new(0).is_err());
    }
}
