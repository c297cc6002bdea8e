//! # Context Pool REST API Handlers
//!
//! HTTP surface of the transcription service. The transcription output itself is
//! not returned here: it is written to the server's stdout by the worker, as a
//! `!START` ... `!DONE` block per job.
//!
//! ## Available Endpoints:
//! - `GET /contexts` - Pool snapshot and service counters
//! - `POST /contexts` - Load a model into a free slot
//! - `DELETE /contexts/{handle}` - Destroy a context
//! - `POST /contexts/{handle}/transcribe` - Start a job on raw audio
//!
//! Every call that touches the service runs on actix's blocking pool, since it
//! first waits for the job currently in flight.

use crate::audio::{AudioProcessor, SampleFormat};
use crate::error::{AppError, AppResult};
use crate::state::AppState;
use crate::transcription::engine::DEFAULT_LANGUAGE;
use crate::transcription::{ContextHandle, JobRequest};
use actix_web::{web, HttpResponse, ResponseError};
use futures_util::StreamExt;
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, info};

#[derive(Debug, Deserialize)]
pub struct AcquireRequest {
    /// Model directory, `.safetensors` file or `hf:<repo>`
    pub model_path: String,
}

/// Query parameters for a transcription upload. Every field is optional.
#[derive(Debug, Default, Deserialize)]
pub struct TranscribeQuery {
    pub language: Option<String>,
    pub threads: Option<i32>,
    pub translate: Option<bool>,
    pub format: Option<SampleFormat>,
}

/// Load a model into the first free slot.
///
/// ## Endpoint: `POST /api/v1/contexts`
///
/// ## Response:
/// - **201**: `{"handle": 1}`
/// - **503**: `{"handle": 0, "reason": "pool_full", ...}`
/// - **422**: `{"handle": 0, "reason": "load_failed", ...}`
pub async fn acquire_context(
    state: web::Data<AppState>,
    body: web::Json<AcquireRequest>,
) -> AppResult<HttpResponse> {
    let model_path = body.into_inner().model_path;
    info!(model = %model_path, "Context requested");

    let service_state = state.clone();
    let path = model_path.clone();
    let result = web::block(move || service_state.with_service(|service| service.acquire(&path))).await?;

    match result {
        Ok(handle) => Ok(HttpResponse::Created().json(json!({
            "handle": handle,
            "model_path": model_path,
            "timestamp": chrono::Utc::now().to_rfc3339()
        }))),
        Err(e) => {
            let reason = e.reason();
            let message = e.to_string();
            let status = AppError::from(e).status_code();
            Ok(HttpResponse::build(status).json(json!({
                "handle": ContextHandle::NONE,
                "reason": reason,
                "message": message,
                "timestamp": chrono::Utc::now().to_rfc3339()
            })))
        }
    }
}

/// Destroy the context behind a handle. Unknown and stale handles are ignored.
///
/// ## Endpoint: `DELETE /api/v1/contexts/{handle}`
pub async fn release_context(state: web::Data<AppState>, path: web::Path<u64>) -> AppResult<HttpResponse> {
    let handle = ContextHandle::from_raw(path.into_inner());

    let service_state = state.clone();
    web::block(move || service_state.with_service(|service| service.release(handle))).await?;

    Ok(HttpResponse::Ok().json(json!({
        "released": handle,
        "timestamp": chrono::Utc::now().to_rfc3339()
    })))
}

/// Start a transcription job and return as soon as it is running.
///
/// ## Endpoint: `POST /api/v1/contexts/{handle}/transcribe`
///
/// ## Request:
/// Raw little-endian samples, mono, 16 kHz. Query: `language` (default "en"),
/// `threads` (default from config), `translate` (default false),
/// `format` (`f32le` or `s16le`, default `f32le`).
///
/// ## Response:
/// - **202**: `{"status": 0, ...}`
/// - **404**: `{"status": -1}` (out of range) or `{"status": -2}` (no context)
pub async fn transcribe(
    state: web::Data<AppState>,
    path: web::Path<u64>,
    query: web::Query<TranscribeQuery>,
    mut payload: web::Payload,
) -> AppResult<HttpResponse> {
    let handle = ContextHandle::from_raw(path.into_inner());
    let query = query.into_inner();
    let config = state.get_config();

    let limit = config.max_body_bytes();
    let mut body = web::BytesMut::new();
    while let Some(chunk) = payload.next().await {
        let chunk = chunk.map_err(|e| AppError::BadRequest(format!("Failed to read request body: {}", e)))?;
        if body.len() + chunk.len() > limit {
            return Err(AppError::BadRequest(format!(
                "Audio body exceeds the {} MB limit",
                config.audio.max_body_mb
            )));
        }
        body.extend_from_slice(&chunk);
    }

    let format = query.format.unwrap_or_default();
    let audio = AudioProcessor::decode(&body, format).map_err(AppError::BadRequest)?;
    let n_samples = audio.len();
    debug!(handle = %handle, samples = n_samples, format = ?format, "Decoded audio body");

    let request = JobRequest {
        audio,
        language: query.language.unwrap_or_else(|| DEFAULT_LANGUAGE.to_string()),
        n_threads: query.threads.unwrap_or(config.pool.default_threads),
        translate: query.translate.unwrap_or(false),
    };

    let service_state = state.clone();
    let result = web::block(move || service_state.with_service(|service| service.dispatch(handle, request))).await?;

    match result {
        Ok(()) => Ok(HttpResponse::Accepted().json(json!({
            "status": 0,
            "handle": handle,
            "samples": n_samples,
            "timestamp": chrono::Utc::now().to_rfc3339()
        }))),
        Err(e) => {
            let code = e.status_code();
            let message = e.to_string();
            let status = AppError::from(e).status_code();
            Ok(HttpResponse::build(status).json(json!({
                "status": code,
                "handle": handle,
                "message": message,
                "timestamp": chrono::Utc::now().to_rfc3339()
            })))
        }
    }
}

/// Snapshot of the pool: capacity, live handles and worker state.
///
/// Never waits for a running job. While another call holds the service the
/// last published view is returned with `"busy": true`.
///
/// ## Endpoint: `GET /api/v1/contexts`
pub async fn list_contexts(state: web::Data<AppState>) -> AppResult<HttpResponse> {
    let status = state.service_status();

    Ok(HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "busy": status.busy,
        "pool": status.pool,
        "metrics": status.metrics
    })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handlers::api_app;
    use crate::state::tests::scripted_state;
    use crate::transcription::testing::{ScriptedEngine, MISSING_MODEL};
    use actix_web::{http::StatusCode, test};
    use serde_json::Value;

    fn f32_body(samples: &[f32]) -> Vec<u8> {
        samples.iter().flat_map(|s| s.to_le_bytes()).collect()
    }

    #[actix_web::test]
    async fn test_acquire_until_pool_full() {
        let (state, _) = scripted_state(ScriptedEngine::new(), 1);
        let app = api_app!(state).await;

        let req = test::TestRequest::post()
            .uri("/api/v1/contexts")
            .set_json(json!({"model_path": "ggml-base.en.bin"}))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::CREATED);
        let body: Value = test::read_body_json(resp).await;
        assert_eq!(body["handle"], 1);

        let req = test::TestRequest::post()
            .uri("/api/v1/contexts")
            .set_json(json!({"model_path": "ggml-base.en.bin"}))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
        let body: Value = test::read_body_json(resp).await;
        assert_eq!(body["handle"], 0);
        assert_eq!(body["reason"], "pool_full");
    }

    #[actix_web::test]
    async fn test_acquire_load_failure() {
        let (state, _) = scripted_state(ScriptedEngine::new(), 2);
        let app = api_app!(state).await;

        let req = test::TestRequest::post()
            .uri("/api/v1/contexts")
            .set_json(json!({"model_path": format!("/models/{}.bin", MISSING_MODEL)}))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::UNPROCESSABLE_ENTITY);
        let body: Value = test::read_body_json(resp).await;
        assert_eq!(body["handle"], 0);
        assert_eq!(body["reason"], "load_failed");
    }

    #[actix_web::test]
    async fn test_transcribe_then_release() {
        let (state, buffer) = scripted_state(ScriptedEngine::new(), 2);
        let app = api_app!(state).await;

        let req = test::TestRequest::post()
            .uri("/api/v1/contexts")
            .set_json(json!({"model_path": "model"}))
            .to_request();
        test::call_service(&app, req).await;

        let req = test::TestRequest::post()
            .uri("/api/v1/contexts/1/transcribe?language=de&threads=2")
            .insert_header(("content-type", "application/octet-stream"))
            .set_payload(f32_body(&[0.0; 1600]))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::ACCEPTED);
        let body: Value = test::read_body_json(resp).await;
        assert_eq!(body["status"], 0);
        assert_eq!(body["samples"], 1600);

        let req = test::TestRequest::delete().uri("/api/v1/contexts/1").to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(buffer.contents(), "!START\n!DONE\n");

        let req = test::TestRequest::get().uri("/api/v1/contexts").to_request();
        let body: Value = test::read_body_json(test::call_service(&app, req).await).await;
        assert_eq!(body["pool"]["occupied"], 0);
        assert_eq!(body["pool"]["worker"], "idle");
        assert_eq!(body["metrics"]["jobs_dispatched"], 1);
    }

    #[actix_web::test]
    async fn test_transcribe_invalid_handles() {
        let (state, _) = scripted_state(ScriptedEngine::new(), 2);
        let app = api_app!(state).await;

        for (uri, code) in [
            ("/api/v1/contexts/0/transcribe", -1),
            ("/api/v1/contexts/3/transcribe", -1),
            ("/api/v1/contexts/2/transcribe", -2),
        ] {
            let req = test::TestRequest::post().uri(uri).set_payload(f32_body(&[0.0; 16])).to_request();
            let resp = test::call_service(&app, req).await;
            assert_eq!(resp.status(), StatusCode::NOT_FOUND);
            let body: Value = test::read_body_json(resp).await;
            assert_eq!(body["status"], code);
        }
    }

    #[actix_web::test]
    async fn test_transcribe_rejects_malformed_body() {
        let (state, _) = scripted_state(ScriptedEngine::new(), 1);
        let app = api_app!(state).await;

        let req = test::TestRequest::post()
            .uri("/api/v1/contexts/1/transcribe?format=s16le")
            .set_payload(vec![0u8; 3])
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[actix_web::test]
    async fn test_release_unknown_handle_is_ok() {
        let (state, _) = scripted_state(ScriptedEngine::new(), 1);
        let app = api_app!(state).await;

        let req = test::TestRequest::delete().uri("/api/v1/contexts/42").to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::OK);
        let body: Value = test::read_body_json(resp).await;
        assert_eq!(body["released"], 42);
    }
}
