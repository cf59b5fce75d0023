// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
/// 防护装备合规判定 (PPE Compliance)
///
/// - ClassMap:      类别名称 → 类别ID (person / helmet / vest)
/// - assess:        人框与装备框按 IoU 关联, 统计未佩戴人数
/// - RollingWindow: 最近 N 帧未佩戴人数的滚动平均
pub mod window;

pub use window::RollingWindow;

use crate::config::MonitorConfig;
use crate::Bbox;

/// 装备关联的默认 IoU 阈值 (严格大于)
pub const ASSOCIATION_IOU: f32 = 0.3;

/// 关心的三个类别在模型中的ID, 模型不含该类别时为 None
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ClassMap {
    pub person: Option<usize>,
    pub helmet: Option<usize>,
    pub vest: Option<usize>,
}

impl ClassMap {
    pub fn from_names(names: &[String], config: &MonitorConfig) -> Self {
        let find = |label: &str| names.iter().position(|name| name == label);
        Self {
            person: find(&config.person_label),
            helmet: find(&config.helmet_label),
            vest: find(&config.vest_label),
        }
    }
}

/// 单个人的防护状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PersonStatus {
    /// 在检测框列表中的下标
    pub index: usize,
    pub has_helmet: bool,
    pub has_vest: bool,
}

impl PersonStatus {
    /// 安全帽和反光衣都没有才算未佩戴
    pub fn is_unprotected(&self) -> bool {
        !self.has_helmet && !self.has_vest
    }
}

/// 单帧判定结果
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Assessment {
    pub persons: Vec<PersonStatus>,
    pub unprotected: usize,
}

impl Assessment {
    pub fn person_count(&self) -> usize {
        self.persons.len()
    }

    pub fn status_of(&self, index: usize) -> Option<&PersonStatus> {
        self.persons.iter().find(|p| p.index == index)
    }
}

pub fn assess(bboxes: &[Bbox], classes: &ClassMap, iou_threshold: f32) -> Assessment {
    let of_class = |class: Option<usize>| -> Vec<&Bbox> {
        match class {
            Some(id) => bboxes.iter().filter(|b| b.id() == id).collect(),
            None => Vec::new(),
        }
    };
    let helmets = of_class(classes.helmet);
    let vests = of_class(classes.vest);

    let Some(person_id) = classes.person else {
        return Assessment::default();
    };

    let mut assessment = Assessment::default();
    for (index, person) in bboxes.iter().enumerate() {
        if person.id() != person_id {
            continue;
        }
        let has_helmet = helmets.iter().any(|h| person.iou(h) > iou_threshold);
        let has_vest = vests.iter().any(|v| person.iou(v) > iou_threshold);
        let status = PersonStatus {
            index,
            has_helmet,
            has_vest,
        };
        if status.is_unprotected() {
            assessment.unprotected += 1;
        }
        assessment.persons.push(status);
    }
    assessment
}
