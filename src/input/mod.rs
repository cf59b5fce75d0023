// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
/// 视频输入系统 (Video Input System)
///
/// 独立工作线程,负责视频文件解码
/// - VideoDecoder: FFmpeg 文件解码器, 解码结果经有界队列交给处理线程
/// - DecodeFilter: 帧过滤 (跳帧) 与 RGB24 拷贝
pub mod decode_filter;
pub mod decoder;

pub use decode_filter::DecodeFilter;
pub use decoder::VideoDecoder;

use image::RgbImage;

/// 已解码帧 (解码线程 → 处理线程)
#[derive(Clone, Debug)]
pub struct DecodedFrame {
    /// 从1开始的解码帧序号 (含被跳过的帧)
    pub index: u64,
    pub image: RgbImage,
}
