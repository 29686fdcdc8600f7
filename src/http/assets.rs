//! Embedded dashboard assets, with an on-disk override directory that, when
//! configured, takes precedence over the embedded copy — so a developer can
//! point the dashboard at a live `ui/dist` without rebuilding the binary.

use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::{header, StatusCode};
use axum::response::{Html, IntoResponse, Response};
use rust_embed::RustEmbed;
use std::sync::Arc;

#[derive(RustEmbed)]
#[folder = "static/"]
pub struct Assets;

pub async fn static_handler(
    State(state): State<Arc<super::AppState>>,
    req: Request<Body>,
) -> impl IntoResponse {
    let path = req.uri().path().trim_start_matches('/');

    if let Some(dir) = state.static_override.as_ref() {
        if !path.is_empty() {
            let candidate = dir.join(path);
            if let Ok(bytes) = tokio::fs::read(&candidate).await {
                let mime = mime_guess::from_path(path).first_or_octet_stream();
                return respond(mime.as_ref(), bytes);
            }
        }
        if let Ok(bytes) = tokio::fs::read(dir.join("index.html")).await {
            return Html(String::from_utf8_lossy(&bytes).to_string()).into_response();
        }
    }

    if !path.is_empty() {
        if let Some(content) = Assets::get(path) {
            let mime = mime_guess::from_path(path).first_or_octet_stream();
            return respond(mime.as_ref(), content.data.to_vec());
        }
    }

    match Assets::get("index.html") {
        Some(content) => Html(String::from_utf8_lossy(&content.data).to_string()).into_response(),
        None => (StatusCode::NOT_FOUND, "dashboard assets not embedded").into_response(),
    }
}

fn respond(mime: &str, data: Vec<u8>) -> Response {
    match Response::builder()
        .header(header::CONTENT_TYPE, mime)
        .body(Body::from(data))
    {
        Ok(resp) => resp,
        Err(_) => StatusCode::INTERNAL_SERVER_ERROR.into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn embedded_index_html_is_present() {
        assert!(Assets::get("index.html").is_some());
    }
}
