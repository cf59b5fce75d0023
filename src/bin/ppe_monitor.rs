// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
/// PPE 合规监控服务 - 上传视频, 实时推送标注画面和未佩戴人数
///
/// 主程序入口 - 直接运行: cargo run --bin ppe-monitor --release
use clap::Parser;
use mimalloc::MiMalloc;
use ppe_monitor::{server, Args, MonitorConfig};
use tracing_subscriber::EnvFilter;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .init();

    let args = Args::parse();
    let config = MonitorConfig::load(&args.config)?;
    config.print_summary();

    server::run(args, config).await
}
