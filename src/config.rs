// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
//
// 配置: 命令行参数 (Args) + JSON 监控配置 (MonitorConfig)

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Result};
use clap::Parser;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::OrtEP;

/// 安全帽/反光衣监控服务参数
#[derive(Parser, Debug, Clone)]
#[command(author, version, about = "PPE 合规监控 - 上传视频并实时统计未佩戴防护装备人数", long_about = None)]
pub struct Args {
    /// ONNX model file
    #[arg(short, long, default_value = "model/best.onnx")]
    pub model: String,

    /// input image width
    #[arg(long)]
    pub width: Option<u32>,

    /// input image height
    #[arg(long)]
    pub height: Option<u32>,

    /// confidence threshold
    #[arg(long, default_value_t = 0.4)]
    pub conf: f32,

    /// iou threshold in NMS
    #[arg(long, default_value_t = 0.3)]
    pub iou: f32,

    /// device id
    #[arg(long, default_value_t = 0)]
    pub device_id: i32,

    /// using TensorRT EP
    #[arg(long)]
    pub trt: bool,

    /// using CUDA EP
    #[arg(long)]
    pub cuda: bool,

    /// using TensorRT EP FP16
    #[arg(long)]
    pub fp16: bool,

    /// intra-op threads of the ONNX session
    #[arg(long, default_value_t = 4)]
    pub threads: usize,

    /// log per-stage timings of every inference
    #[arg(long)]
    pub profile: bool,

    /// listen address
    #[arg(long, env = "PPE_HOST", default_value = "0.0.0.0")]
    pub host: String,

    /// listen port
    #[arg(short, long, env = "PPE_PORT", default_value_t = 8000)]
    pub port: u16,

    /// directory for uploaded videos
    #[arg(long, env = "PPE_UPLOAD_DIR", default_value = "uploads")]
    pub upload_dir: PathBuf,

    /// allowed CORS origins
    #[arg(long = "cors-origin", env = "PPE_CORS_ORIGINS", value_delimiter = ',', default_value = "http://localhost:5173")]
    pub cors_origins: Vec<String>,

    /// maximum upload size in MiB
    #[arg(long, env = "PPE_MAX_UPLOAD_MB", default_value_t = 1024)]
    pub max_upload_mb: usize,

    /// JSON monitor config (created with defaults when missing)
    #[arg(short, long, env = "PPE_CONFIG", default_value = "monitor.json")]
    pub config: PathBuf,
}

impl Args {
    pub fn execution_provider(&self) -> OrtEP {
        if self.trt {
            OrtEP::Trt(self.device_id)
        } else if self.cuda {
            OrtEP::CUDA(self.device_id)
        } else {
            OrtEP::CPU
        }
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// 标签字体, 缺失时只画框
pub const DEFAULT_FONT_PATH: &str = "assets/font/msyh.ttc";

/// 监控参数配置 - 通过JSON文件调整
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct MonitorConfig {
    // === 类别名称 ===
    pub person_label: String,
    pub helmet_label: String,
    pub vest_label: String,
    /// 模型元数据缺少 names 时使用
    pub fallback_names: Vec<String>,

    // === 关联判定 ===
    pub association_iou: f32, // 人框与装备框的IoU阈值 (严格大于)
    pub window_size: usize,   // 滚动平均窗口 (帧)

    // === 解码 ===
    pub frame_skip: usize,  // 每N帧处理一帧
    pub frame_queue: usize, // 解码 → 处理 队列长度

    // === 输出 ===
    pub output_width: u32,
    pub output_height: u32,
    pub jpeg_quality: u8,
    pub font_path: Option<String>,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            person_label: "person".to_string(),
            helmet_label: "helmet".to_string(),
            vest_label: "vest".to_string(),
            fallback_names: vec![
                "person".to_string(),
                "helmet".to_string(),
                "vest".to_string(),
            ],

            association_iou: 0.3,
            window_size: 30,

            frame_skip: 3,
            frame_queue: 8,

            output_width: 960,
            output_height: 540,
            jpeg_quality: 95,
            font_path: Some(DEFAULT_FONT_PATH.to_string()),
        }
    }
}

impl MonitorConfig {
    /// 从JSON文件加载配置, 文件不存在时写入默认配置
    pub fn load(path: &Path) -> Result<Self> {
        let config = match fs::read_to_string(path) {
            Ok(json) => match serde_json::from_str(&json) {
                Ok(config) => {
                    info!("✅ 配置已从 {} 加载", path.display());
                    config
                }
                Err(e) => {
                    warn!("⚠️  配置文件解析失败: {}, 使用默认值", e);
                    Self::default()
                }
            },
            Err(_) => {
                info!("📝 配置文件不存在,创建默认配置...");
                let config = Self::default();
                config.save(path);
                config
            }
        };
        config.validate()?;
        Ok(config)
    }

    /// 保存配置到JSON文件
    pub fn save(&self, path: &Path) {
        match serde_json::to_string_pretty(self) {
            Ok(json) => {
                if let Err(e) = fs::write(path, json) {
                    warn!("❌ 保存配置失败: {}", e);
                } else {
                    info!("💾 配置已保存到 {}", path.display());
                }
            }
            Err(e) => warn!("❌ 序列化配置失败: {}", e),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.window_size == 0 {
            bail!("window_size must be at least 1");
        }
        if self.frame_skip == 0 {
            bail!("frame_skip must be at least 1");
        }
        if self.frame_queue == 0 {
            bail!("frame_queue must be at least 1");
        }
        if self.output_width == 0 || self.output_height == 0 {
            bail!(
                "output size must be positive, got {}x{}",
                self.output_width,
                self.output_height
            );
        }
        if !(1..=100).contains(&self.jpeg_quality) {
            bail!("jpeg_quality must be within 1..=100, got {}", self.jpeg_quality);
        }
        if !(0.0..=1.0).contains(&self.association_iou) {
            bail!(
                "association_iou must be within 0..=1, got {}",
                self.association_iou
            );
        }
        Ok(())
    }

    /// 打印当前配置
    pub fn print_summary(&self) {
        info!("🎛️  当前监控配置:");
        info!(
            "  类别: person={} helmet={} vest={}",
            self.person_label, self.helmet_label, self.vest_label
        );
        info!("  关联IoU: > {:.2}", self.association_iou);
        info!("  滚动窗口: {} 帧", self.window_size);
        info!("  跳帧: 每 {} 帧处理 1 帧", self.frame_skip);
        info!(
            "  输出: {}x{} JPEG q={}",
            self.output_width, self.output_height, self.jpeg_quality
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_default() {
        let config = MonitorConfig::default();
        assert_eq!(config.window_size, 30);
        assert_eq!(config.frame_skip, 3);
        assert_eq!((config.output_width, config.output_height), (960, 540));
        assert!((config.association_iou - 0.3).abs() < 1e-6);
        assert_eq!(config.font_path.as_deref(), Some(DEFAULT_FONT_PATH));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_creates_default_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("monitor.json");

        let config = MonitorConfig::load(&path).unwrap();
        assert_eq!(config, MonitorConfig::default());
        assert!(path.exists());

        let reloaded = MonitorConfig::load(&path).unwrap();
        assert_eq!(reloaded, config);
    }

    #[test]
    fn test_load_partial_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("monitor.json");
        fs::write(&path, r#"{ "window_size": 10, "helmet_label": "hardhat" }"#).unwrap();

        let config = MonitorConfig::load(&path).unwrap();
        assert_eq!(config.window_size, 10);
        assert_eq!(config.helmet_label, "hardhat");
        assert_eq!(config.frame_skip, 3);
    }

    #[test]
    fn test_validate_rejects_zero_window() {
        let config = MonitorConfig {
            window_size: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_bad_quality() {
        let config = MonitorConfig {
            jpeg_quality: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_execution_provider_selection() {
        let args = Args::parse_from(["ppe-monitor", "--cuda", "--device-id", "1"]);
        assert!(matches!(args.execution_provider(), OrtEP::CUDA(1)));

        let args = Args::parse_from(["ppe-monitor", "--trt", "--cuda"]);
        assert!(matches!(args.execution_provider(), OrtEP::Trt(0)));

        let args = Args::parse_from(["ppe-monitor"]);
        assert!(matches!(args.execution_provider(), OrtEP::CPU));
        assert_eq!(args.bind_addr(), "0.0.0.0:8000");
        assert_eq!(args.cors_origins, vec!["http://localhost:5173".to_string()]);
    }
}
