// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
/// 视频文件解码器
/// Video file decoder (FFmpeg software decoding on a dedicated thread)
use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;
use std::thread::JoinHandle;

use anyhow::{bail, Context, Result};
use crossbeam_channel::Receiver;
use ez_ffmpeg::core::context::null_output::create_null_output;
use ez_ffmpeg::filter::frame_pipeline_builder::FramePipelineBuilder;
use ez_ffmpeg::{AVMediaType, FfmpegContext, Input};
use tracing::{error, info};

use super::decode_filter::DecodeFilter;
use super::DecodedFrame;

pub struct VideoDecoder {
    path: PathBuf,
    frame_skip: usize,
}

impl VideoDecoder {
    pub fn new(path: impl Into<PathBuf>, frame_skip: usize) -> Self {
        Self {
            path: path.into(),
            frame_skip: frame_skip.max(1),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// 启动解码线程, 返回有界帧队列
    ///
    /// 队列满时解码线程阻塞; 接收端释放后解码自动停止
    pub fn spawn(self, queue: usize) -> Result<(Receiver<DecodedFrame>, JoinHandle<()>)> {
        if !self.path.is_file() {
            bail!("Video file not found: {}", self.path.display());
        }

        let (tx, rx) = crossbeam_channel::bounded(queue.max(1));
        let filter = DecodeFilter::new(tx, self.frame_skip);
        let handle = std::thread::Builder::new()
            .name("video-decoder".into())
            .spawn(move || {
                info!("🎬 解码器启动: {}", self.path.display());
                match decode_file(&self.path, filter) {
                    Ok(_) => info!("✅ 解码线程正常退出"),
                    Err(e) => error!("❌ 视频解码失败: {:#}", e),
                }
            })
            .context("Failed to spawn decoder thread")?;

        Ok((rx, handle))
    }
}

/// CPU软件解码, 输出统一转为 RGB24
///
/// 客户端断开导致的提前结束返回 `Ok`, 其余失败返回错误
pub(crate) fn decode_file(path: &Path, filter: DecodeFilter) -> Result<()> {
    let url = path.to_string_lossy().to_string();
    let receiver_closed = filter.receiver_closed();

    let pipe: FramePipelineBuilder = AVMediaType::AVMEDIA_TYPE_VIDEO.into();
    let pipe = pipe.filter("decode", Box::new(filter));
    let out = create_null_output().add_frame_pipeline(pipe);

    let input = Input::new(url.as_str());

    // 构建FFmpeg上下文
    let ctx = FfmpegContext::builder()
        .input(input)
        .filter_descs(["format=rgb24"].into())
        .output(out)
        .build()
        .map_err(|e| anyhow::anyhow!("构建失败: {}", e))?;

    let sch = ctx.start().map_err(|e| anyhow::anyhow!("启动失败: {}", e))?;

    match sch.wait() {
        Ok(_) => Ok(()),
        // 客户端断开时过滤器主动返回错误
        Err(e) if receiver_closed.load(Ordering::SeqCst) => {
            info!("🛑 客户端断开, 解码提前结束: {}", e);
            Ok(())
        }
        Err(e) => Err(anyhow::anyhow!("解码失败: {}", e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ez_ffmpeg::Output;

    /// 用 lavfi testsrc 生成约 13 帧的短视频 (10fps, 1.3s)
    fn synth_clip(path: &Path) {
        let input = Input::new("testsrc=duration=1.3:size=160x120:rate=10").set_format("lavfi");
        let output = Output::from(path.to_string_lossy().as_ref()).set_video_codec("mpeg4");
        FfmpegContext::builder()
            .input(input)
            .output(output)
            .build()
            .unwrap()
            .start()
            .unwrap()
            .wait()
            .unwrap();
    }

    #[test]
    fn test_decodes_every_third_frame_as_rgb() {
        let dir = tempfile::tempdir().unwrap();
        let clip = dir.path().join("clip.mp4");
        synth_clip(&clip);

        let (rx, handle) = VideoDecoder::new(&clip, 3).spawn(4).unwrap();
        let frames: Vec<DecodedFrame> = rx.iter().collect();
        handle.join().unwrap();

        let indices: Vec<u64> = frames.iter().map(|f| f.index).collect();
        assert_eq!(indices, vec![3, 6, 9, 12]);
        for frame in &frames {
            assert_eq!(frame.image.dimensions(), (160, 120));
        }
    }

    #[test]
    fn test_disconnect_is_not_a_failure() {
        let dir = tempfile::tempdir().unwrap();
        let clip = dir.path().join("clip.mp4");
        synth_clip(&clip);

        let (tx, rx) = crossbeam_channel::bounded(1);
        drop(rx);
        assert!(decode_file(&clip, DecodeFilter::new(tx, 1)).is_ok());
    }

    #[test]
    fn test_non_video_file_fails() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("notes.mp4");
        std::fs::write(&path, b"this is not a video").unwrap();

        let (tx, _rx) = crossbeam_channel::bounded(1);
        assert!(decode_file(&path, DecodeFilter::new(tx, 1)).is_err());
    }

    #[test]
    fn test_spawn_missing_file_fails_fast() {
        let decoder = VideoDecoder::new("definitely/not/here.mp4", 3);
        assert!(decoder.spawn(4).is_err());
    }

    #[test]
    fn test_frame_skip_is_at_least_one() {
        let decoder = VideoDecoder::new("video.mp4", 0);
        assert_eq!(decoder.frame_skip, 1);
        assert_eq!(decoder.path(), Path::new("video.mp4"));
    }
}
