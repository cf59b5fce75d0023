// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
/// 视频处理流水线 (Video Processing Pipeline)
///
/// 双线程架构, 通过有界队列通信:
/// - Decoder:   视频解码 (独立线程, 见 `input`)
/// - Processor: 检测 → 合规判定 → 滚动窗口 → 渲染 → JPEG (阻塞线程)
///
/// 处理结果以 multipart 分段写入 HTTP 响应体
use std::sync::{Arc, Mutex};
use std::time::Instant;

use anyhow::{anyhow, Result};
use bytes::{BufMut, Bytes, BytesMut};
use crossbeam_channel::Receiver;
use image::DynamicImage;
use tokio::sync::mpsc::Sender;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::compliance::{assess, ClassMap, RollingWindow};
use crate::input::DecodedFrame;
use crate::renderer::Renderer;
use crate::{MonitorConfig, Model};

/// multipart/x-mixed-replace 分隔符
pub const BOUNDARY: &str = "frame";

pub type SharedModel = Arc<Mutex<Box<dyn Model>>>;
pub type SharedWindow = Arc<Mutex<RollingWindow>>;

/// 单帧处理结果
#[derive(Debug, Clone)]
pub struct ProcessedFrame {
    pub index: u64,
    pub jpeg: Vec<u8>,
    pub persons: usize,
    pub unprotected: usize,
    /// 推入本帧之后的滚动平均
    pub rolling: usize,
}

/// 单帧处理器, 所有视频流共享同一个模型和滚动窗口
pub struct FrameProcessor {
    model: SharedModel,
    names: Vec<String>,
    classes: ClassMap,
    window: SharedWindow,
    renderer: Renderer,
    association_iou: f32,
}

impl FrameProcessor {
    pub fn new(model: Box<dyn Model>, window: SharedWindow, config: &MonitorConfig) -> Result<Self> {
        let names = model.names().to_vec();
        let classes = ClassMap::from_names(&names, config);
        if classes.person.is_none() {
            warn!("⚠️ 模型类别中没有 '{}', 未佩戴人数将恒为 0", config.person_label);
        }
        if classes.helmet.is_none() && classes.vest.is_none() {
            warn!(
                "⚠️ 模型类别中既没有 '{}' 也没有 '{}'",
                config.helmet_label, config.vest_label
            );
        }
        info!(
            "🧭 类别映射: person={:?} helmet={:?} vest={:?}",
            classes.person, classes.helmet, classes.vest
        );

        let renderer = Renderer::new(config)?;
        let capacity = window.lock().map_err(|_| anyhow!("Window lock poisoned"))?.capacity();
        info!(
            "🪟 滚动窗口: {} 帧 | 标签字体: {}",
            capacity,
            if renderer.has_font() { "已加载" } else { "无" }
        );

        Ok(Self {
            model: Arc::new(Mutex::new(model)),
            names,
            classes,
            window,
            renderer,
            association_iou: config.association_iou,
        })
    }

    pub fn window(&self) -> &SharedWindow {
        &self.window
    }

    /// 检测 → 判定 → 推入滚动窗口 → 渲染
    pub fn process(&self, frame: DecodedFrame) -> Result<ProcessedFrame> {
        let t0 = Instant::now();
        let images = [DynamicImage::ImageRgb8(frame.image)];

        let detections = {
            let mut model = self.model.lock().map_err(|_| anyhow!("Model lock poisoned"))?;
            model.forward(&images)?
        };
        let bboxes = detections
            .into_iter()
            .next()
            .map(|d| d.bboxes)
            .unwrap_or_default();

        let assessment = assess(&bboxes, &self.classes, self.association_iou);
        let rolling = {
            let mut window = self.window.lock().map_err(|_| anyhow!("Window lock poisoned"))?;
            window.push(assessment.unprotected);
            window.average()
        };

        let [image] = images;
        let jpeg = self.renderer.render(
            image.into_rgb8(),
            &bboxes,
            &self.names,
            &self.classes,
            &assessment,
            rolling,
        )?;

        debug!(
            "🖼️ 帧 #{} | 检测{} | 人{} | 未佩戴{} | 平均{} | {:.1}ms",
            frame.index,
            bboxes.len(),
            assessment.person_count(),
            assessment.unprotected,
            rolling,
            t0.elapsed().as_secs_f64() * 1000.0
        );

        Ok(ProcessedFrame {
            index: frame.index,
            jpeg,
            persons: assessment.person_count(),
            unprotected: assessment.unprotected,
            rolling,
        })
    }
}

/// 单个 multipart 分段: 分隔行 + 头 + JPEG + CRLF
pub fn multipart_chunk(jpeg: &[u8]) -> Bytes {
    let header = format!("--{}\r\nContent-Type: image/jpeg\r\n\r\n", BOUNDARY);
    let mut buf = BytesMut::with_capacity(header.len() + jpeg.len() + 2);
    buf.put_slice(header.as_bytes());
    buf.put_slice(jpeg);
    buf.put_slice(b"\r\n");
    buf.freeze()
}

/// 单个视频流的统计
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct StreamStats {
    pub processed: u64,
    pub failed: u64,
    pub disconnected: bool,
}

/// 启动处理线程: 解码帧 → multipart 分段 → HTTP 响应体
///
/// 客户端断开后 `tx` 发送失败, 线程退出并释放 `frames`, 解码线程随之停止
pub fn spawn_stream(
    processor: Arc<FrameProcessor>,
    frames: Receiver<DecodedFrame>,
    tx: Sender<Result<Bytes, std::io::Error>>,
) -> JoinHandle<StreamStats> {
    tokio::task::spawn_blocking(move || run_stream(&processor, frames, &tx))
}

fn run_stream(
    processor: &FrameProcessor,
    frames: Receiver<DecodedFrame>,
    tx: &Sender<Result<Bytes, std::io::Error>>,
) -> StreamStats {
    let started = Instant::now();
    let mut stats = StreamStats::default();

    for frame in frames.iter() {
        let index = frame.index;
        let processed = match processor.process(frame) {
            Ok(p) => p,
            Err(e) => {
                stats.failed += 1;
                warn!("⚠️ 帧 #{} 处理失败: {:#}", index, e);
                continue;
            }
        };
        stats.processed += 1;

        if tx.blocking_send(Ok(multipart_chunk(&processed.jpeg))).is_err() {
            stats.disconnected = true;
            info!("🔌 客户端已断开, 停止处理");
            break;
        }
    }

    let secs = started.elapsed().as_secs_f64();
    info!(
        "✅ 视频流结束: 处理{} | 失败{} | {:.1}s | {:.1} FPS",
        stats.processed,
        stats.failed,
        secs,
        if secs > 0.0 { stats.processed as f64 / secs } else { 0.0 }
    );
    stats
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Bbox, DetectionResult};
    use anyhow::bail;
    use image::RgbImage;
    use ndarray::{Array, IxDyn};

    /// 固定输出: 一个无装备的人 + 一个戴安全帽的人
    struct StubModel {
        names: Vec<String>,
        fail: bool,
    }

    impl StubModel {
        fn boxed(fail: bool) -> Box<dyn Model> {
            Box::new(Self {
                names: vec!["person".into(), "helmet".into(), "vest".into()],
                fail,
            })
        }
    }

    impl Model for StubModel {
        fn preprocess(&mut self, _images: &[DynamicImage]) -> Result<Vec<Array<f32, IxDyn>>> {
            Ok(vec![])
        }

        fn run(&mut self, xs: Vec<Array<f32, IxDyn>>, _profile: bool) -> Result<Vec<Array<f32, IxDyn>>> {
            if self.fail {
                bail!("inference failed");
            }
            Ok(xs)
        }

        fn postprocess(
            &self,
            _xs: Vec<Array<f32, IxDyn>>,
            _xs0: &[DynamicImage],
        ) -> Result<Vec<DetectionResult>> {
            Ok(vec![DetectionResult::new(vec![
                Bbox::from_xyxy(0., 0., 40., 80., 0, 0.9),
                Bbox::from_xyxy(50., 0., 90., 80., 0, 0.9),
                Bbox::from_xyxy(50., 0., 90., 40., 1, 0.8),
            ])])
        }

        fn names(&self) -> &[String] {
            &self.names
        }

        fn summary(&self) {}
    }

    fn frame(index: u64) -> DecodedFrame {
        DecodedFrame {
            index,
            image: RgbImage::new(160, 90),
        }
    }

    fn processor(fail: bool) -> FrameProcessor {
        let window = Arc::new(Mutex::new(RollingWindow::new(30)));
        FrameProcessor::new(StubModel::boxed(fail), window, &MonitorConfig::default()).unwrap()
    }

    #[test]
    fn test_multipart_chunk_layout() {
        let chunk = multipart_chunk(&[0xFF, 0xD8, 0xFF, 0xD9]);
        let mut expected = b"--frame\r\nContent-Type: image/jpeg\r\n\r\n".to_vec();
        expected.extend_from_slice(&[0xFF, 0xD8, 0xFF, 0xD9]);
        expected.extend_from_slice(b"\r\n");
        assert_eq!(chunk.as_ref(), expected.as_slice());
    }

    #[test]
    fn test_process_updates_window() {
        let processor = processor(false);
        let out = processor.process(frame(3)).unwrap();

        assert_eq!(out.index, 3);
        assert_eq!(out.persons, 2);
        assert_eq!(out.unprotected, 1);
        assert_eq!(out.rolling, 1);
        assert_eq!(&out.jpeg[..2], &[0xFF, 0xD8]);

        let window = processor.window().lock().unwrap();
        assert_eq!(window.len(), 1);
        assert_eq!(window.average(), 1);
    }

    #[test]
    fn test_process_error_leaves_window_untouched() {
        let processor = processor(true);
        assert!(processor.process(frame(3)).is_err());
        assert!(processor.window().lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_stream_emits_one_chunk_per_frame() {
        let processor = Arc::new(processor(false));
        let (frame_tx, frame_rx) = crossbeam_channel::bounded(4);
        for i in [3, 6, 9] {
            frame_tx.send(frame(i)).unwrap();
        }
        drop(frame_tx);

        let (tx, mut rx) = tokio::sync::mpsc::channel(8);
        let stats = spawn_stream(processor.clone(), frame_rx, tx).await.unwrap();
        assert_eq!(stats.processed, 3);
        assert!(!stats.disconnected);

        let mut chunks = 0;
        while let Some(chunk) = rx.recv().await {
            assert!(chunk.unwrap().starts_with(b"--frame\r\n"));
            chunks += 1;
        }
        assert_eq!(chunks, 3);
        assert_eq!(processor.window().lock().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_stream_stops_when_client_disconnects() {
        let processor = Arc::new(processor(false));
        let (frame_tx, frame_rx) = crossbeam_channel::bounded(4);
        frame_tx.send(frame(3)).unwrap();
        frame_tx.send(frame(6)).unwrap();

        let (tx, rx) = tokio::sync::mpsc::channel(1);
        drop(rx);
        let stats = spawn_stream(processor, frame_rx, tx).await.unwrap();
        assert!(stats.disconnected);
        assert_eq!(stats.processed, 1);
        // 处理线程退出后接收端释放, 解码端发送失败
        assert!(frame_tx.send(frame(9)).is_err());
    }
}
