// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
use std::path::Path;

use anyhow::anyhow;
use axum::body::Body;
use axum::extract::multipart::Field;
use axum::extract::{Multipart, State};
use axum::http::{header, StatusCode};
use axum::response::{Html, IntoResponse, Redirect, Response};
use axum::Json;
use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{info, warn};

use super::AppState;
use crate::error::{ServerError, ServerResult};
use crate::input::VideoDecoder;
use crate::pipeline::{spawn_stream, BOUNDARY};

const INDEX_HTML: &str = r#"<!DOCTYPE html>
<html lang="en">
<head>
    <meta charset="UTF-8">
    <title>PPE Monitor - Upload</title>
</head>
<body style="margin: 20px; font-family: sans-serif;">
    <h2>YOLOv8 PPE Monitor</h2>
    <form action="/upload" enctype="multipart/form-data" method="post">
        <input name="file" type="file" accept="video/mp4"/>
        <input type="submit" value="Upload and analyze"/>
    </form>
</body>
</html>
"#;

const NO_VIDEO_HTML: &str = "<h3>❌ No video has been uploaded.</h3>";

// 解码 → HTTP 之间最多缓存的分段数
const CHUNK_BUFFER: usize = 2;

pub async fn index() -> Html<&'static str> {
    Html(INDEX_HTML)
}

/// 只保留最后一段路径, 拒绝空名和 `.`/`..`
pub fn sanitize_file_name(raw: &str) -> Option<String> {
    let name = raw.rsplit(|c: char| c == '/' || c == '\\').next()?.trim();
    if name.is_empty() || name == "." || name == ".." || name.contains('\0') {
        return None;
    }
    Some(name.to_string())
}

pub async fn upload(State(state): State<AppState>, mut multipart: Multipart) -> ServerResult<Redirect> {
    while let Some(mut field) = multipart.next_field().await? {
        if field.name() != Some("file") {
            continue;
        }

        let raw_name = field.file_name().unwrap_or_default().to_string();
        let file_name =
            sanitize_file_name(&raw_name).ok_or_else(|| ServerError::InvalidFileName(raw_name.clone()))?;

        tokio::fs::create_dir_all(&state.upload_dir).await?;
        let path = state.upload_dir.join(&file_name);

        let written = match save_field(&mut field, &path).await {
            Ok(n) => n,
            Err(e) => {
                // 不保留写了一半的文件
                if let Err(rm) = tokio::fs::remove_file(&path).await {
                    warn!("⚠️ 无法删除不完整的上传 {}: {}", path.display(), rm);
                }
                return Err(e);
            }
        };

        info!("📥 已上传 {} ({:.1} MiB)", path.display(), written as f64 / 1048576.0);
        *state.current_video.write().await = Some(path);

        return Ok(Redirect::to("/stream"));
    }

    Err(ServerError::MissingFile)
}

async fn save_field(field: &mut Field<'_>, path: &Path) -> ServerResult<usize> {
    let mut file = tokio::fs::File::create(path).await?;
    let mut written = 0usize;
    while let Some(chunk) = field.chunk().await? {
        file.write_all(&chunk).await?;
        written += chunk.len();
    }
    file.flush().await?;
    Ok(written)
}

pub async fn stream(State(state): State<AppState>) -> ServerResult<Response> {
    let current = state.current_video.read().await.clone();
    let Some(path) = current.filter(|p| Path::new(p).is_file()) else {
        return Ok(Html(NO_VIDEO_HTML).into_response());
    };

    let decoder = VideoDecoder::new(path.clone(), state.frame_skip);
    let (frames, _decoder) = decoder.spawn(state.frame_queue)?;

    let (tx, rx) = tokio::sync::mpsc::channel(CHUNK_BUFFER);
    let _worker = spawn_stream(state.processor.clone(), frames, tx);
    info!("▶️ 开始推流: {}", path.display());

    Response::builder()
        .status(StatusCode::OK)
        .header(
            header::CONTENT_TYPE,
            format!("multipart/x-mixed-replace; boundary={}", BOUNDARY),
        )
        .header(header::CACHE_CONTROL, "no-cache")
        .body(Body::from_stream(ReceiverStream::new(rx)))
        .map_err(|e| ServerError::Pipeline(anyhow!("Failed to build stream response: {}", e)))
}

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub unprotected_person: usize,
}

pub async fn status(State(state): State<AppState>) -> ServerResult<Json<StatusResponse>> {
    let average = match state.window.lock() {
        Ok(window) => window.average(),
        Err(_) => {
            warn!("⚠️ 滚动窗口锁已损坏");
            return Err(ServerError::Pipeline(anyhow!("Rolling window lock poisoned")));
        }
    };
    Ok(Json(StatusResponse {
        unprotected_person: average,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_keeps_plain_names() {
        assert_eq!(sanitize_file_name("site_a.mp4").as_deref(), Some("site_a.mp4"));
    }

    #[test]
    fn test_sanitize_strips_directories() {
        assert_eq!(sanitize_file_name("../../etc/passwd").as_deref(), Some("passwd"));
        assert_eq!(sanitize_file_name("C:\\videos\\clip.mp4").as_deref(), Some("clip.mp4"));
    }

    #[test]
    fn test_sanitize_rejects_unusable_names() {
        assert_eq!(sanitize_file_name(""), None);
        assert_eq!(sanitize_file_name("dir/"), None);
        assert_eq!(sanitize_file_name(".."), None);
        assert_eq!(sanitize_file_name("a/.."), None);
    }
}
