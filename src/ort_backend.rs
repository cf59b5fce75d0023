// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
//
// ONNX Runtime 推理引擎封装

use std::time::Instant;

use anyhow::{anyhow, Context, Result};
use ndarray::{Array, IxDyn};
use ort::execution_providers::{CUDAExecutionProvider, TensorRTExecutionProvider};
use ort::session::{builder::GraphOptimizationLevel, Session};
use ort::value::Tensor;
use regex::Regex;
use tracing::{debug, info, warn};

/// 推理设备 (execution provider)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrtEP {
    CPU,
    CUDA(i32),
    Trt(i32),
}

#[derive(Debug, Clone)]
pub struct OrtConfig {
    pub f: String,
    pub ep: OrtEP,
    pub image_size: (Option<u32>, Option<u32>), // (height, width)
    pub intra_threads: usize,
    pub trt_fp16: bool,
}

pub struct OrtBackend {
    session: Session,
    ep: OrtEP,
    input_name: String,
    height: u32,
    width: u32,
    names: Option<Vec<String>>,
    author: Option<String>,
    version: Option<String>,
}

impl OrtBackend {
    pub fn build(config: OrtConfig) -> Result<Self> {
        let mut builder = Session::builder()?
            .with_optimization_level(GraphOptimizationLevel::Level3)?
            .with_intra_threads(config.intra_threads.max(1))?;

        builder = match config.ep {
            OrtEP::Trt(device_id) => builder.with_execution_providers([
                TensorRTExecutionProvider::default()
                    .with_device_id(device_id)
                    .with_fp16(config.trt_fp16)
                    .build(),
                CUDAExecutionProvider::default()
                    .with_device_id(device_id)
                    .build(),
            ])?,
            OrtEP::CUDA(device_id) => builder.with_execution_providers([
                CUDAExecutionProvider::default()
                    .with_device_id(device_id)
                    .build(),
            ])?,
            OrtEP::CPU => builder,
        };

        let session = builder
            .commit_from_file(&config.f)
            .with_context(|| format!("Failed to load ONNX model: {}", config.f))?;

        let input_name = session
            .inputs
            .first()
            .map(|input| input.name.clone())
            .ok_or_else(|| anyhow!("Model has no inputs: {}", config.f))?;

        let (names, author, version) = match session.metadata() {
            Ok(metadata) => (
                metadata
                    .custom("names")
                    .ok()
                    .flatten()
                    .map(|raw| parse_names(&raw))
                    .filter(|names| !names.is_empty()),
                metadata.custom("author").ok().flatten(),
                metadata.custom("version").ok().flatten(),
            ),
            Err(e) => {
                warn!("⚠️ 读取模型元数据失败: {}", e);
                (None, None, None)
            }
        };

        let (height, width) = config.image_size;
        let height = height.unwrap_or(640);
        let width = width.unwrap_or(640);

        info!(
            "✅ ONNX 模型加载成功: {} (EP: {:?}, 输入: {} {}x{})",
            config.f, config.ep, input_name, width, height
        );

        Ok(Self {
            session,
            ep: config.ep,
            input_name,
            height,
            width,
            names,
            author,
            version,
        })
    }

    pub fn run(&mut self, xs: Array<f32, IxDyn>, profile: bool) -> Result<Vec<Array<f32, IxDyn>>> {
        let t_run = Instant::now();
        let input = Tensor::from_array(xs)?;
        let outputs = self
            .session
            .run(ort::inputs![self.input_name.as_str() => input])
            .context("ONNX inference failed")?;

        let mut ys = Vec::new();
        for value in outputs.values() {
            let y = value
                .try_extract_array::<f32>()
                .context("Failed to extract output tensor")?;
            ys.push(y.to_owned().into_dyn());
        }
        if profile {
            debug!("[ORT Run]: {:?}", t_run.elapsed());
        }
        Ok(ys)
    }

    pub fn ep(&self) -> &OrtEP {
        &self.ep
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn names(&self) -> Option<Vec<String>> {
        self.names.clone()
    }

    pub fn author(&self) -> Option<&str> {
        self.author.as_deref()
    }

    pub fn version(&self) -> Option<&str> {
        self.version.as_deref()
    }
}

/// 解析 Ultralytics 导出的 names 元数据
///
/// 格式: `{0: 'person', 1: 'helmet', 2: 'vest'}`, 按类别序号排序后返回
pub fn parse_names(raw: &str) -> Vec<String> {
    let re = match Regex::new(r#"(\d+)\s*:\s*['"]([^'"]*)['"]"#) {
        Ok(re) => re,
        Err(_) => return Vec::new(),
    };
    let mut pairs: Vec<(usize, String)> = re
        .captures_iter(raw)
        .filter_map(|caps| {
            let id = caps.get(1)?.as_str().parse::<usize>().ok()?;
            let name = caps.get(2)?.as_str().to_string();
            Some((id, name))
        })
        .collect();
    pairs.sort_by_key(|(id, _)| *id);

    // 序号不连续时用占位名补齐,保证 names[id] 可直接索引
    let mut names = Vec::with_capacity(pairs.len());
    for (id, name) in pairs {
        while names.len() < id {
            names.push(format!("class{}", names.len()));
        }
        if names.len() == id {
            names.push(name);
        }
    }
    names
}
