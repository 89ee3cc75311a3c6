//! Update server — serves versioned `baihu-agent` release bundles to
//! connecting agents.
//!
//! A release directory (`GatewayState::update_bundle_dir`) holds a
//! `version.txt` (first line is the canonical version string) and a set of
//! `baihu-agent-<os>-<arch>.tar.gz` bundles, each a gzip tarball containing
//! `baihu-agent[.exe]` and `config.example.ini`. This mirrors the teacher's
//! static-file-serving approach (`tower_http::services::ServeDir`) but reads
//! the directory dynamically since the set of platform bundles changes
//! across releases.

use axum::{
    extract::{Query, State},
    http::{header, StatusCode},
    response::IntoResponse,
    Json,
};
use serde::Deserialize;

use crate::gateway::GatewayState;

#[derive(Debug, Deserialize)]
pub struct PlatformQuery {
    pub os: String,
    pub arch: String,
}

fn bundle_filename(os: &str, arch: &str) -> String {
    format!("baihu-agent-{os}-{arch}.tar.gz")
}

/// `GET /api/agent/version` — returns the current version string plus the
/// set of platform bundles available in the update bundle directory.
pub async fn version_handler(State(state): State<GatewayState>) -> impl IntoResponse {
    let dir = state.update_bundle_dir.read().await.clone();

    let version = match tokio::fs::read_to_string(dir.join("version.txt")).await {
        Ok(contents) => contents.lines().next().unwrap_or("").trim().to_string(),
        Err(e) => {
            tracing::warn!(error = %e, dir = %dir.display(), "update-failure: version.txt unreadable");
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({"error": "update-failure"})),
            )
                .into_response();
        }
    };

    let mut platforms = Vec::new();
    let mut entries = match tokio::fs::read_dir(&dir).await {
        Ok(e) => e,
        Err(e) => {
            tracing::warn!(error = %e, dir = %dir.display(), "update-failure: bundle dir unreadable");
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({"error": "update-failure"})),
            )
                .into_response();
        }
    };
    while let Ok(Some(entry)) = entries.next_entry().await {
        let name = entry.file_name().to_string_lossy().to_string();
        if let Some(rest) = name
            .strip_prefix("baihu-agent-")
            .and_then(|s| s.strip_suffix(".tar.gz"))
        {
            if let Some((os, arch)) = rest.split_once('-') {
                platforms.push(serde_json::json!({
                    "os": os,
                    "arch": arch,
                    "filename": name,
                }));
            }
        }
    }

    Json(serde_json::json!({"version": version, "platforms": platforms})).into_response()
}

/// `GET /api/agent/download?os=&arch=` — streams the matching gzip tarball
/// with a `Content-Disposition: attachment` header.
fn is_safe_platform_component(s: &str) -> bool {
    !s.is_empty() && s.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}

pub async fn download_handler(
    State(state): State<GatewayState>,
    Query(query): Query<PlatformQuery>,
) -> impl IntoResponse {
    if !is_safe_platform_component(&query.os) || !is_safe_platform_component(&query.arch) {
        return (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({"error": "invalid os/arch"})),
        )
            .into_response();
    }

    let dir = state.update_bundle_dir.read().await.clone();
    let filename = bundle_filename(&query.os, &query.arch);
    let path = dir.join(&filename);

    match tokio::fs::read(&path).await {
        Ok(bytes) => (
            StatusCode::OK,
            [
                (header::CONTENT_TYPE, "application/gzip".to_string()),
                (
                    header::CONTENT_DISPOSITION,
                    format!("attachment; filename=\"{filename}\""),
                ),
            ],
            bytes,
        )
            .into_response(),
        Err(e) => {
            tracing::warn!(error = %e, %filename, "update-failure: bundle not found");
            (
                StatusCode::NOT_FOUND,
                Json(serde_json::json!({"error": "update-failure"})),
            )
                .into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{bundle_filename, is_safe_platform_component};

    #[test]
    fn bundle_filename_matches_documented_format() {
        assert_eq!(bundle_filename("linux", "x86_64"), "baihu-agent-linux-x86_64.tar.gz");
    }

    #[test]
    fn path_traversal_components_are_rejected() {
        assert!(is_safe_platform_component("linux"));
        assert!(is_safe_platform_component("x86_64"));
        assert!(!is_safe_platform_component("../../etc"));
        assert!(!is_safe_platform_component("a/b"));
        assert!(!is_safe_platform_component(""));
    }
}
