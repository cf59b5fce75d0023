// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
//
// YOLOv8 检测模型实现
// 包含: 模型加载、预处理、推理、后处理

use anyhow::{bail, Result};
use image::{DynamicImage, GenericImageView};
use ndarray::{s, Array, ArrayView, Axis, IxDyn};
use tracing::info;

use crate::{non_max_suppression, Args, Bbox, DetectionResult, MonitorConfig, OrtBackend, OrtConfig, OrtEP};

const CXYWH_OFFSET: usize = 4;

/// YOLOv8 检测模型结构
pub struct YOLOv8 {
    engine: OrtBackend,
    height: u32,
    width: u32,
    conf: f32,
    iou: f32,
    names: Vec<String>,
    profile: bool,
}

impl YOLOv8 {
    /// 从配置创建 YOLOv8 模型
    pub fn new(args: &Args, monitor: &MonitorConfig) -> Result<Self> {
        let ort_args = OrtConfig {
            ep: args.execution_provider(),
            f: args.model.clone(),
            image_size: (args.height, args.width),
            intra_threads: args.threads,
            trt_fp16: args.fp16,
        };
        let engine = OrtBackend::build(ort_args)?;

        let (height, width) = (engine.height(), engine.width());

        // class names
        let names = engine.names().unwrap_or_else(|| {
            info!("⚠️ 模型未携带类别名称, 使用配置中的 fallback_names");
            monitor.fallback_names.clone()
        });

        Ok(Self {
            engine,
            height,
            width,
            conf: args.conf,
            iou: args.iou,
            names,
            profile: args.profile,
        })
    }

    pub fn preprocess(&mut self, xs: &[DynamicImage]) -> Result<Array<f32, IxDyn>> {
        letterbox_tensor(xs, self.width, self.height)
    }

    pub fn postprocess(
        &self,
        xs: Vec<Array<f32, IxDyn>>,
        xs0: &[DynamicImage],
    ) -> Result<Vec<DetectionResult>> {
        let Some(preds) = xs.first() else {
            bail!("Model returned no outputs");
        };
        decode_detections(preds.view(), xs0, (self.width, self.height), self.conf, self.iou)
    }

    pub fn summary(&self) {
        info!(
            "Summary: EP: {:?}{} | {} | Height: {}, Width: {} | nc: {}, conf: {}, iou: {}",
            self.engine.ep(),
            if let OrtEP::CPU = self.engine.ep() {
                ""
            } else {
                " (May still fall back to CPU)"
            },
            match self.engine.author().zip(self.engine.version()) {
                Some((author, ver)) => format!("{} {}", author, ver),
                None => String::from("unknown exporter"),
            },
            self.height,
            self.width,
            self.names.len(),
            self.conf,
            self.iou,
        );
    }
}

fn scale_wh(w0: f32, h0: f32, w1: f32, h1: f32) -> (f32, f32, f32) {
    let r = (w1 / w0).min(h1 / h0);
    (r, (w0 * r).round(), (h0 * r).round())
}

/// 等比缩放到输入尺寸 (左上角对齐, 其余填充灰色), 输出 NCHW RGB [0, 1]
pub fn letterbox_tensor(xs: &[DynamicImage], width: u32, height: u32) -> Result<Array<f32, IxDyn>> {
    let mut ys = Array::ones((xs.len(), 3, height as usize, width as usize)).into_dyn();
    ys.fill(144.0 / 255.0);
    for (idx, x) in xs.iter().enumerate() {
        let (w0, h0) = x.dimensions();
        if w0 == 0 || h0 == 0 {
            bail!("Empty input image #{}", idx);
        }
        let (_, w_new, h_new) = scale_wh(w0 as f32, h0 as f32, width as f32, height as f32);
        let img = x.resize_exact(
            (w_new as u32).clamp(1, width),
            (h_new as u32).clamp(1, height),
            image::imageops::FilterType::Triangle,
        );

        for (x, y, rgb) in img.pixels() {
            let x = x as usize;
            let y = y as usize;
            let [r, g, b, _] = rgb.0;
            ys[[idx, 0, y, x]] = (r as f32) / 255.0;
            ys[[idx, 1, y, x]] = (g as f32) / 255.0;
            ys[[idx, 2, y, x]] = (b as f32) / 255.0;
        }
    }

    Ok(ys)
}

/// 解码 YOLOv8 检测头输出 `[batch, 4 + nc, anchors]`
///
/// 每个 anchor 取最大类别分数, 低于 `conf` 丢弃, 坐标还原到原图并裁剪, 最后按类别做 NMS。
pub fn decode_detections(
    preds: ArrayView<f32, IxDyn>,
    xs0: &[DynamicImage],
    input_size: (u32, u32),
    conf: f32,
    iou: f32,
) -> Result<Vec<DetectionResult>> {
    if preds.ndim() != 3 {
        bail!("Unexpected output shape {:?}, expected [batch, 4 + nc, anchors]", preds.shape());
    }
    if preds.shape()[1] <= CXYWH_OFFSET {
        bail!("Output has no class scores: {:?}", preds.shape());
    }
    if preds.shape()[0] != xs0.len() {
        bail!(
            "Batch mismatch: {} outputs for {} images",
            preds.shape()[0],
            xs0.len()
        );
    }
    let (input_w, input_h) = input_size;

    let mut ys = Vec::new();
    for (idx, anchor) in preds.axis_iter(Axis(0)).enumerate() {
        let width_original = xs0[idx].width() as f32;
        let height_original = xs0[idx].height() as f32;
        let ratio = (input_w as f32 / width_original).min(input_h as f32 / height_original);

        let mut data: Vec<Bbox> = Vec::new();
        for pred in anchor.axis_iter(Axis(1)) {
            let bbox = pred.slice(s![0..CXYWH_OFFSET]);
            let clss = pred.slice(s![CXYWH_OFFSET..]);

            let Some((id, &confidence)) = clss
                .into_iter()
                .enumerate()
                .reduce(|max, x| if x.1 > max.1 { x } else { max })
            else {
                continue;
            };

            if confidence < conf {
                continue;
            }

            let cx = bbox[0] / ratio;
            let cy = bbox[1] / ratio;
            let w = bbox[2] / ratio;
            let h = bbox[3] / ratio;
            let x1 = (cx - w / 2.).clamp(0.0, width_original);
            let y1 = (cy - h / 2.).clamp(0.0, height_original);
            let x2 = (cx + w / 2.).clamp(0.0, width_original);
            let y2 = (cy + h / 2.).clamp(0.0, height_original);
            data.push(Bbox::from_xyxy(x1, y1, x2, y2, id, confidence));
        }

        non_max_suppression(&mut data, iou);
        ys.push(DetectionResult::new(data));
    }

    Ok(ys)
}

// 实现统一的 Model trait
impl super::Model for YOLOv8 {
    fn preprocess(&mut self, images: &[DynamicImage]) -> Result<Vec<Array<f32, IxDyn>>> {
        let batch = YOLOv8::preprocess(self, images)?;
        Ok(vec![batch])
    }

    fn run(&mut self, xs: Vec<Array<f32, IxDyn>>, profile: bool) -> Result<Vec<Array<f32, IxDyn>>> {
        let Some(x) = xs.into_iter().next() else {
            bail!("No input tensor");
        };
        self.engine.run(x, profile || self.profile)
    }

    fn postprocess(
        &self,
        xs: Vec<Array<f32, IxDyn>>,
        xs0: &[DynamicImage],
    ) -> Result<Vec<DetectionResult>> {
        YOLOv8::postprocess(self, xs, xs0)
    }

    fn names(&self) -> &[String] {
        &self.names
    }

    fn summary(&self) {
        YOLOv8::summary(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::RgbImage;

    /// 构造 [1, 4 + nc, anchors] 输出
    fn fake_output(anchors: &[([f32; 4], Vec<f32>)]) -> Array<f32, IxDyn> {
        let nc = anchors[0].1.len();
        let mut out = Array::zeros((1, 4 + nc, anchors.len())).into_dyn();
        for (i, (bbox, scores)) in anchors.iter().enumerate() {
            for (k, v) in bbox.iter().enumerate() {
                out[[0, k, i]] = *v;
            }
            for (c, v) in scores.iter().enumerate() {
                out[[0, 4 + c, i]] = *v;
            }
        }
        out
    }

    #[test]
    fn test_decode_scales_back_to_original() {
        // 1280x640 原图 → 640x640 输入, ratio = 0.5
        let image = DynamicImage::ImageRgb8(RgbImage::new(1280, 640));
        let out = fake_output(&[([100., 100., 40., 80.], vec![0.9, 0.1, 0.0])]);

        let ys = decode_detections(out.view(), &[image], (640, 640), 0.4, 0.3).unwrap();
        let bboxes = ys[0].bboxes();
        assert_eq!(bboxes.len(), 1);
        let b = &bboxes[0];
        assert_eq!(b.id(), 0);
        assert!((b.xmin() - 160.).abs() < 1e-3);
        assert!((b.ymin() - 120.).abs() < 1e-3);
        assert!((b.xmax() - 240.).abs() < 1e-3);
        assert!((b.ymax() - 280.).abs() < 1e-3);
    }

    #[test]
    fn test_decode_filters_low_confidence() {
        let image = DynamicImage::ImageRgb8(RgbImage::new(640, 640));
        let out = fake_output(&[
            ([100., 100., 40., 80.], vec![0.39, 0.2, 0.1]),
            ([300., 300., 40., 40.], vec![0.0, 0.0, 0.41]),
        ]);

        let ys = decode_detections(out.view(), &[image], (640, 640), 0.4, 0.3).unwrap();
        assert_eq!(ys[0].bboxes().len(), 1);
        assert_eq!(ys[0].bboxes()[0].id(), 2);
    }

    #[test]
    fn test_decode_clamps_to_image() {
        let image = DynamicImage::ImageRgb8(RgbImage::new(640, 640));
        let out = fake_output(&[([10., 630., 60., 60.], vec![0.8])]);

        let ys = decode_detections(out.view(), &[image], (640, 640), 0.4, 0.3).unwrap();
        let b = &ys[0].bboxes()[0];
        assert_eq!(b.xmin(), 0.0);
        assert_eq!(b.ymax(), 640.0);
    }

    #[test]
    fn test_decode_rejects_bad_shape() {
        let image = DynamicImage::ImageRgb8(RgbImage::new(64, 64));
        let out = Array::<f32, _>::zeros((1, 84)).into_dyn();
        assert!(decode_detections(out.view(), &[image], (640, 640), 0.4, 0.3).is_err());
    }

    #[test]
    fn test_letterbox_tensor_pads_gray() {
        let image = DynamicImage::ImageRgb8(RgbImage::from_pixel(64, 32, image::Rgb([255, 0, 0])));
        let ys = letterbox_tensor(&[image], 64, 64).unwrap();
        assert_eq!(ys.shape(), &[1, 3, 64, 64]);
        assert!((ys[[0, 0, 0, 0]] - 1.0).abs() < 1e-6);
        assert!((ys[[0, 0, 63, 0]] - 144.0 / 255.0).abs() < 1e-6);
    }
}
