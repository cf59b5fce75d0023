// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
use std::collections::VecDeque;

/// 最近 N 帧未佩戴人数 (滚动窗口)
///
/// 满了之后丢弃最旧的一帧; 平均值向下取整, 空窗口为 0
#[derive(Debug, Clone)]
pub struct RollingWindow {
    capacity: usize,
    values: VecDeque<usize>,
}

impl RollingWindow {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            values: VecDeque::with_capacity(capacity),
        }
    }

    pub fn push(&mut self, value: usize) {
        if self.values.len() == self.capacity {
            self.values.pop_front();
        }
        self.values.push_back(value);
    }

    pub fn average(&self) -> usize {
        if self.values.is_empty() {
            return 0;
        }
        self.values.iter().sum::<usize>() / self.values.len()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl Default for RollingWindow {
    fn default() -> Self {
        Self::new(30)
    }
}
