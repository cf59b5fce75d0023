// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
/// FFmpeg解码过滤器模块
/// FFmpeg decode filter module
use crossbeam_channel::Sender;
use ez_ffmpeg::filter::frame_filter::FrameFilter;
use ez_ffmpeg::filter::frame_filter_context::FrameFilterContext;
use ez_ffmpeg::{AVMediaType, Frame};
use image::RgbImage;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

use super::DecodedFrame;

/// 帧序号从1开始, 只处理 frame_skip 的整数倍帧
pub fn should_process(frame_count: u64, frame_skip: u64) -> bool {
    frame_skip <= 1 || frame_count % frame_skip == 0
}

/// FFmpeg解码过滤器: 视频帧(RGB24) → DecodedFrame → 处理队列
pub struct DecodeFilter {
    tx: Sender<DecodedFrame>,
    frame_skip: u64,
    pub total_frames: u64,   // 总帧数
    pub dropped_frames: u64, // 丢弃的帧数
    pub sent_frames: u64,    // 送入队列的帧数
    started: Instant,
    receiver_closed: Arc<AtomicBool>,
}

impl DecodeFilter {
    pub fn new(tx: Sender<DecodedFrame>, frame_skip: usize) -> Self {
        Self {
            tx,
            frame_skip: frame_skip.max(1) as u64,
            total_frames: 0,
            dropped_frames: 0,
            sent_frames: 0,
            started: Instant::now(),
            receiver_closed: Arc::new(AtomicBool::new(false)),
        }
    }

    /// 接收端关闭后置位, 用于区分客户端断开和解码失败
    pub fn receiver_closed(&self) -> Arc<AtomicBool> {
        self.receiver_closed.clone()
    }

    /// 每个解码出的帧 (含损坏帧) 都计数, 返回本帧是否需要处理
    pub fn count_frame(&mut self) -> bool {
        self.total_frames += 1;
        should_process(self.total_frames, self.frame_skip)
    }
}

impl FrameFilter for DecodeFilter {
    fn media_type(&self) -> AVMediaType {
        AVMediaType::AVMEDIA_TYPE_VIDEO
    }

    fn init(&mut self, _ctx: &FrameFilterContext) -> Result<(), String> {
        debug!("✅ 解码线程启动");
        Ok(())
    }

    fn filter_frame(
        &mut self,
        frame: Frame,
        _ctx: &FrameFilterContext,
    ) -> Result<Option<Frame>, String> {
        let wanted = self.count_frame();
        unsafe {
            // 基本检查：空帧或损坏帧
            if frame.as_ptr().is_null() || frame.is_empty() || frame.is_corrupt() {
                self.dropped_frames += 1;
                return Ok(None);
            }

            if !wanted {
                return Ok(Some(frame));
            }

            let w = (*frame.as_ptr()).width;
            let h = (*frame.as_ptr()).height;
            let data = (*frame.as_ptr()).data[0];
            let stride = (*frame.as_ptr()).linesize[0];

            // 检查分辨率合法性
            if w <= 0 || h <= 0 || data.is_null() || stride < w * 3 {
                self.dropped_frames += 1;
                if self.dropped_frames <= 10 {
                    warn!(
                        "⚠️ 丢弃帧 #{}: 分辨率 {}x{} 步长 {}",
                        self.total_frames, w, h, stride
                    );
                }
                return Ok(None);
            }

            let image = copy_rgb24(data, stride as usize, w as usize, h as usize);
            let Some(image) = image else {
                self.dropped_frames += 1;
                return Ok(None);
            };

            let decoded = DecodedFrame {
                index: self.total_frames,
                image,
            };
            // 接收端已关闭 (客户端断开) → 停止解码
            if self.tx.send(decoded).is_err() {
                self.receiver_closed.store(true, Ordering::SeqCst);
                return Err("Frame receiver closed".to_string());
            }
            self.sent_frames += 1;

            Ok(Some(frame))
        }
    }

    fn uninit(&mut self, _ctx: &FrameFilterContext) {
        info!(
            "✅ 解码结束: 总帧{} | 处理{} | 丢弃{} | 耗时{:.1}s",
            self.total_frames,
            self.sent_frames,
            self.dropped_frames,
            self.started.elapsed().as_secs_f64()
        );
    }
}

/// 按行拷贝 packed RGB24 数据 (去掉行尾对齐填充)
///
/// # Safety
/// `data` 必须指向至少 `stride * height` 字节的有效内存, 且 `stride >= width * 3`
unsafe fn copy_rgb24(data: *const u8, stride: usize, width: usize, height: usize) -> Option<RgbImage> {
    let row_bytes = width * 3;
    let mut buffer = Vec::with_capacity(row_bytes * height);
    for y in 0..height {
        let row = std::slice::from_raw_parts(data.add(y * stride), row_bytes);
        buffer.extend_from_slice(row);
    }
    RgbImage::from_raw(width as u32, height as u32, buffer)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_should_process_every_third_frame() {
        let processed: Vec<u64> = (1..=10).filter(|&i| should_process(i, 3)).collect();
        assert_eq!(processed, vec![3, 6, 9]);
    }

    #[test]
    fn test_should_process_all_without_skip() {
        assert!((1..=5).all(|i| should_process(i, 1)));
    }

    #[test]
    fn test_dropped_frames_keep_cadence() {
        let (tx, _rx) = crossbeam_channel::bounded(1);
        let mut filter = DecodeFilter::new(tx, 3);
        // 第2帧损坏被丢弃, 第3帧仍然是被处理的那一帧
        let wanted: Vec<bool> = (0..6).map(|_| filter.count_frame()).collect();
        assert_eq!(wanted, vec![false, false, true, false, false, true]);
        assert_eq!(filter.total_frames, 6);
    }

    #[test]
    fn test_receiver_closed_starts_clear() {
        let (tx, _rx) = crossbeam_channel::bounded(1);
        let filter = DecodeFilter::new(tx, 3);
        assert!(!filter.receiver_closed().load(Ordering::SeqCst));
    }

    #[test]
    fn test_copy_rgb24_strips_padding() {
        // 2x2 图像, 行步长 8 (6字节像素 + 2字节填充)
        let raw: Vec<u8> = vec![
            1, 2, 3, 4, 5, 6, 0xEE, 0xEE, //
            7, 8, 9, 10, 11, 12, 0xEE, 0xEE,
        ];
        let image = unsafe { copy_rgb24(raw.as_ptr(), 8, 2, 2) }.unwrap();
        assert_eq!(image.as_raw(), &vec![1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12]);
    }
}
