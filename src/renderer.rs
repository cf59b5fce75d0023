// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
/// 渲染模块
/// Annotates detections, letterboxes to the output canvas and encodes JPEG
use ab_glyph::{FontVec, PxScale};
use anyhow::{anyhow, Context, Result};
use fast_image_resize as fr;
use image::codecs::jpeg::JpegEncoder;
use image::{Rgb, RgbImage};
use imageproc::drawing::{draw_filled_rect_mut, draw_hollow_rect_mut, draw_text_mut, text_size};
use imageproc::rect::Rect;
use tracing::{info, warn};

use crate::compliance::{Assessment, ClassMap};
use crate::config::MonitorConfig;
use crate::Bbox;

const PROTECTED: Rgb<u8> = Rgb([0, 200, 0]);
const UNPROTECTED: Rgb<u8> = Rgb([230, 0, 0]);
const TEXT: Rgb<u8> = Rgb([255, 255, 255]);
const BANNER: Rgb<u8> = Rgb([32, 32, 32]);

// 其它类别的颜色
const BRIGHT_COLORS: [(u8, u8, u8); 10] = [
    (0, 0, 255),     // 蓝色
    (255, 255, 0),   // 黄色
    (255, 0, 255),   // 品红
    (0, 255, 255),   // 青色
    (255, 128, 0),   // 橙色
    (255, 0, 128),   // 粉红
    (128, 255, 0),   // 黄绿
    (0, 128, 255),   // 天蓝
    (255, 255, 255), // 白色
    (128, 0, 255),   // 紫色
];

pub struct Renderer {
    font: Option<FontVec>,
    output_width: u32,
    output_height: u32,
    jpeg_quality: u8,
}

impl Renderer {
    pub fn new(config: &MonitorConfig) -> Result<Self> {
        let font = match &config.font_path {
            Some(path) => match std::fs::read(path) {
                Ok(data) => {
                    let font = FontVec::try_from_vec(data).map_err(|e| anyhow!("Invalid font {}: {}", path, e))?;
                    info!("✅ 字体加载成功: {}", path);
                    Some(font)
                }
                Err(e) => {
                    warn!("⚠️ 未找到字体文件 {} ({}), 仅绘制检测框", path, e);
                    None
                }
            },
            None => {
                warn!("⚠️ 未配置字体, 仅绘制检测框");
                None
            }
        };
        Ok(Self {
            font,
            output_width: config.output_width,
            output_height: config.output_height,
            jpeg_quality: config.jpeg_quality,
        })
    }

    pub fn has_font(&self) -> bool {
        self.font.is_some()
    }

    /// 标注 → Letterbox → JPEG
    pub fn render(
        &self,
        mut image: RgbImage,
        bboxes: &[Bbox],
        names: &[String],
        classes: &ClassMap,
        assessment: &Assessment,
        rolling: usize,
    ) -> Result<Vec<u8>> {
        self.annotate(&mut image, bboxes, names, classes, assessment, rolling);
        let canvas = letterbox(&image, self.output_width, self.output_height)?;
        encode_jpeg(&canvas, self.jpeg_quality)
    }

    /// 在原始分辨率上绘制检测框、标签和统计横幅
    pub fn annotate(
        &self,
        image: &mut RgbImage,
        bboxes: &[Bbox],
        names: &[String],
        classes: &ClassMap,
        assessment: &Assessment,
        rolling: usize,
    ) {
        let (width, height) = image.dimensions();
        if width == 0 || height == 0 {
            return;
        }
        // 线宽随分辨率变化, 与 960 宽输出时约 2px 一致
        let thickness = (width.max(height) / 640).clamp(1, 6) as i32 + 1;
        let scale = PxScale::from((height as f32 / 36.0).clamp(12.0, 48.0));

        for (index, bbox) in bboxes.iter().enumerate() {
            let color = match assessment.status_of(index) {
                Some(status) if status.is_unprotected() => UNPROTECTED,
                Some(_) => PROTECTED,
                None => class_color(bbox.id(), classes),
            };
            let x = bbox.xmin().round() as i32;
            let y = bbox.ymin().round() as i32;
            let w = bbox.width().round().max(1.0) as u32;
            let h = bbox.height().round().max(1.0) as u32;

            for t in 0..thickness {
                let (tw, th) = (w.saturating_sub(2 * t as u32), h.saturating_sub(2 * t as u32));
                if tw == 0 || th == 0 {
                    break;
                }
                draw_hollow_rect_mut(image, Rect::at(x + t, y + t).of_size(tw, th), color);
            }

            if let Some(font) = &self.font {
                let name = names
                    .get(bbox.id())
                    .map(String::as_str)
                    .unwrap_or("unknown");
                let label = format!("{} {:.2}", name, bbox.confidence());
                let (tw, th) = text_size(scale, font, &label);
                let ty = if y - th as i32 - 4 >= 0 { y - th as i32 - 4 } else { y };
                draw_filled_rect_mut(image, Rect::at(x, ty).of_size(tw + 4, th + 4), color);
                draw_text_mut(image, TEXT, x + 2, ty + 2, scale, font, &label);
            }
        }

        if let Some(font) = &self.font {
            let banner = format!(
                "Unprotected: {} / {} persons | avg {}",
                assessment.unprotected,
                assessment.person_count(),
                rolling
            );
            let (tw, th) = text_size(scale, font, &banner);
            draw_filled_rect_mut(image, Rect::at(0, 0).of_size(tw + 12, th + 12), BANNER);
            let color = if assessment.unprotected > 0 { UNPROTECTED } else { TEXT };
            draw_text_mut(image, color, 6, 6, scale, font, &banner);
        }
    }
}

fn class_color(id: usize, classes: &ClassMap) -> Rgb<u8> {
    if Some(id) == classes.person {
        return PROTECTED;
    }
    let (r, g, b) = BRIGHT_COLORS[id % BRIGHT_COLORS.len()];
    Rgb([r, g, b])
}

/// 等比缩放到 `width x height`, 居中放置, 其余填充黑色
pub fn letterbox(image: &RgbImage, width: u32, height: u32) -> Result<RgbImage> {
    let (iw, ih) = image.dimensions();
    if iw == 0 || ih == 0 {
        return Err(anyhow!("Cannot letterbox an empty image"));
    }

    let scale = (width as f64 / iw as f64).min(height as f64 / ih as f64);
    let nw = ((iw as f64 * scale) as u32).clamp(1, width);
    let nh = ((ih as f64 * scale) as u32).clamp(1, height);

    let top = (height - nh) / 2;
    let left = (width - nw) / 2;

    let resized = if (nw, nh) == (iw, ih) {
        image.clone()
    } else {
        let src = fr::images::ImageRef::new(iw, ih, image.as_raw(), fr::PixelType::U8x3)
            .context("Failed to create resize source")?;
        let mut dst = fr::images::Image::new(nw, nh, fr::PixelType::U8x3);
        let mut resizer = fr::Resizer::new();
        resizer
            .resize(
                &src,
                &mut dst,
                &fr::ResizeOptions::new().resize_alg(fr::ResizeAlg::Convolution(fr::FilterType::Bilinear)),
            )
            .context("Letterbox resize failed")?;
        RgbImage::from_raw(nw, nh, dst.into_vec()).ok_or_else(|| anyhow!("Resized buffer size mismatch"))?
    };

    let mut canvas = RgbImage::new(width, height);
    image::imageops::replace(&mut canvas, &resized, left as i64, top as i64);
    Ok(canvas)
}

pub fn encode_jpeg(image: &RgbImage, quality: u8) -> Result<Vec<u8>> {
    let mut buffer = Vec::new();
    JpegEncoder::new_with_quality(&mut buffer, quality.clamp(1, 100))
        .encode_image(image)
        .map_err(|err| anyhow!("JPEG encode failed: {err}"))?;
    Ok(buffer)
}
