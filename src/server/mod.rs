// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
/// HTTP 服务 (axum)
///
/// - `GET  /`            上传表单
/// - `POST /upload`      保存视频并跳转到 /stream
/// - `GET  /stream`      MJPEG 标注视频流
/// - `GET  /yolo/status` 滚动平均未佩戴人数
pub mod handlers;

use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use axum::extract::DefaultBodyLimit;
use axum::http::HeaderValue;
use axum::routing::{get, post};
use axum::Router;
use tokio::signal;
use tokio::sync::RwLock;
use tower_http::cors::{AllowHeaders, AllowMethods, AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::compliance::RollingWindow;
use crate::pipeline::{FrameProcessor, SharedWindow};
use crate::{Args, Model, MonitorConfig, YOLOv8};

pub use handlers::sanitize_file_name;

/// 全局共享状态: 一个模型, 一个滚动窗口, 一个当前视频
#[derive(Clone)]
pub struct AppState {
    pub processor: Arc<FrameProcessor>,
    pub window: SharedWindow,
    pub current_video: Arc<RwLock<Option<PathBuf>>>,
    pub upload_dir: PathBuf,
    pub frame_skip: usize,
    pub frame_queue: usize,
}

impl AppState {
    pub fn new(model: Box<dyn Model>, upload_dir: PathBuf, config: &MonitorConfig) -> Result<Self> {
        let window = Arc::new(Mutex::new(RollingWindow::new(config.window_size)));
        let processor = FrameProcessor::new(model, window.clone(), config)?;
        Ok(Self {
            processor: Arc::new(processor),
            window,
            current_video: Arc::new(RwLock::new(None)),
            upload_dir,
            frame_skip: config.frame_skip,
            frame_queue: config.frame_queue,
        })
    }
}

pub fn create_router(state: AppState, cors_origins: &[String], max_upload_bytes: usize) -> Result<Router> {
    let cors = cors_layer(cors_origins)?
        .allow_methods(AllowMethods::mirror_request())
        .allow_headers(AllowHeaders::mirror_request());

    Ok(Router::new()
        .route("/", get(handlers::index))
        .route("/upload", post(handlers::upload))
        .route("/stream", get(handlers::stream))
        .route("/yolo/status", get(handlers::status))
        .layer(DefaultBodyLimit::max(max_upload_bytes))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state))
}

/// `*` 表示任意来源, 此时不允许携带凭证; 其余按列表精确匹配并允许凭证
fn cors_layer(cors_origins: &[String]) -> Result<CorsLayer> {
    if cors_origins.iter().any(|o| o.trim() == "*") {
        if cors_origins.len() > 1 {
            warn!("⚠️ CORS 来源包含 '*', 忽略其它来源: {:?}", cors_origins);
        }
        warn!("⚠️ CORS 允许任意来源, 已关闭 allow_credentials");
        return Ok(CorsLayer::new().allow_origin(AllowOrigin::any()));
    }

    let origins = cors_origins
        .iter()
        .map(|o| {
            HeaderValue::from_str(o.trim()).with_context(|| format!("Invalid CORS origin: {}", o))
        })
        .collect::<Result<Vec<_>>>()?;

    Ok(CorsLayer::new()
        .allow_origin(origins)
        .allow_credentials(true))
}

/// 加载模型并启动服务, Ctrl-C / SIGTERM 时优雅退出
pub async fn run(args: Args, config: MonitorConfig) -> Result<()> {
    tokio::fs::create_dir_all(&args.upload_dir)
        .await
        .with_context(|| format!("Failed to create upload dir {}", args.upload_dir.display()))?;

    info!("📦 加载模型: {}", args.model);
    let model = YOLOv8::new(&args, &config)?;
    model.summary();

    let state = AppState::new(Box::new(model), args.upload_dir.clone(), &config)?;
    let max_upload_bytes = args.max_upload_mb.saturating_mul(1024 * 1024);
    let app = create_router(state, &args.cors_origins, max_upload_bytes)?;

    let addr = args.bind_addr();
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    info!("🌐 HTTP 服务监听 http://{}", addr);
    info!("📁 上传目录: {}", args.upload_dir.display());

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("HTTP server failed")?;

    info!("👋 服务已停止");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!("⚠️ 无法监听 Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                warn!("⚠️ 无法监听 SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("🛑 收到退出信号");
}
