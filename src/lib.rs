// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
pub mod compliance; // 防护装备关联判定 + 滚动窗口
pub mod config; // 命令行参数与监控配置
pub mod error; // HTTP 错误类型
pub mod input; // 视频文件解码
pub mod models; // 模型接口与具体实现
pub mod ort_backend;
pub mod pipeline; // 单帧处理流水线
pub mod renderer; // 标注 + Letterbox + JPEG
pub mod server; // HTTP 服务

pub use crate::config::{Args, MonitorConfig};
pub use crate::models::{Model, YOLOv8};
pub use crate::ort_backend::{OrtBackend, OrtConfig, OrtEP};

/// 按类别的非极大值抑制 (class-aware NMS)
///
/// 只有同类别的框才会互相抑制,安全帽框不会被重叠的人框吃掉。
pub fn non_max_suppression(xs: &mut Vec<Bbox>, iou_threshold: f32) {
    xs.sort_by(|b1, b2| b2.confidence().total_cmp(&b1.confidence()));

    let mut current_index = 0;
    for index in 0..xs.len() {
        let mut drop = false;
        for prev_index in 0..current_index {
            if xs[prev_index].id() != xs[index].id() {
                continue;
            }
            let iou = xs[prev_index].iou(&xs[index]);
            if iou > iou_threshold {
                drop = true;
                break;
            }
        }
        if !drop {
            xs.swap(current_index, index);
            current_index += 1;
        }
    }
    xs.truncate(current_index);
}

#[derive(Clone, PartialEq, Default, Debug)]
pub struct DetectionResult {
    // detection results of an image
    pub bboxes: Vec<Bbox>,
}

impl DetectionResult {
    pub fn new(bboxes: Vec<Bbox>) -> Self {
        Self { bboxes }
    }

    pub fn bboxes(&self) -> &[Bbox] {
        &self.bboxes
    }

    pub fn is_empty(&self) -> bool {
        self.bboxes.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct Bbox {
    // a bounding box around an object
    xmin: f32,
    ymin: f32,
    width: f32,
    height: f32,
    id: usize,
    confidence: f32,
}

impl Bbox {
    pub fn new(xmin: f32, ymin: f32, width: f32, height: f32, id: usize, confidence: f32) -> Self {
        Self {
            xmin,
            ymin,
            width,
            height,
            id,
            confidence,
        }
    }

    /// 由左上/右下角点构造
    pub fn from_xyxy(x1: f32, y1: f32, x2: f32, y2: f32, id: usize, confidence: f32) -> Self {
        Self::new(x1, y1, x2 - x1, y2 - y1, id, confidence)
    }

    pub fn width(&self) -> f32 {
        self.width
    }

    pub fn height(&self) -> f32 {
        self.height
    }

    pub fn xmin(&self) -> f32 {
        self.xmin
    }

    pub fn ymin(&self) -> f32 {
        self.ymin
    }

    pub fn xmax(&self) -> f32 {
        self.xmin + self.width
    }

    pub fn ymax(&self) -> f32 {
        self.ymin + self.height
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn confidence(&self) -> f32 {
        self.confidence
    }

    pub fn area(&self) -> f32 {
        self.width * self.height
    }

    pub fn intersection_area(&self, another: &Bbox) -> f32 {
        let l = self.xmin.max(another.xmin);
        let r = self.xmax().min(another.xmax());
        let t = self.ymin.max(another.ymin);
        let b = self.ymax().min(another.ymax());
        (r - l).max(0.) * (b - t).max(0.)
    }

    pub fn union(&self, another: &Bbox) -> f32 {
        self.area() + another.area() - self.intersection_area(another)
    }

    /// 交并比, 并集为0时返回0
    pub fn iou(&self, another: &Bbox) -> f32 {
        let union = self.union(another);
        if union <= 0. {
            return 0.;
        }
        self.intersection_area(another) / union
    }
}
