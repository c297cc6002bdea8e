use crate::{error::AppError, state::AppState};
use actix_web::{web, HttpResponse};
use serde_json::json;

pub async fn get_config(state: web::Data<AppState>) -> Result<HttpResponse, AppError> {
    let config = state.get_config();

    Ok(HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "config": config,
        "mutable_keys": ["pool.default_threads", "audio.max_body_mb"]
    })))
}

pub async fn update_config(
    state: web::Data<AppState>,
    body: web::Json<serde_json::Value>,
) -> Result<HttpResponse, AppError> {
    let json_str = serde_json::to_string(&body.into_inner())?;
    let updated_config = state.update_config(&json_str)?;

    tracing::info!(
        default_threads = updated_config.pool.default_threads,
        max_body_mb = updated_config.audio.max_body_mb,
        "Configuration updated"
    );

    Ok(HttpResponse::Ok().json(json!({
        "status": "success",
        "message": "Configuration updated successfully",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "updated_config": updated_config
    })))
}

#[cfg(test)]
mod tests {
    use crate::handlers::api_app;
    use crate::state::tests::scripted_state;
    use crate::transcription::testing::ScriptedEngine;
    use actix_web::{http::StatusCode, test};
    use serde_json::{json, Value};

    #[actix_web::test]
    async fn test_config_round_trip() {
        let (state, _) = scripted_state(ScriptedEngine::new(), 1);
        let app = api_app!(state).await;

        let req = test::TestRequest::put()
            .uri("/api/v1/config")
            .set_json(json!({"pool": {"default_threads": 2}}))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::OK);

        let req = test::TestRequest::get().uri("/api/v1/config").to_request();
        let body: Value = test::read_body_json(test::call_service(&app, req).await).await;
        assert_eq!(body["config"]["pool"]["default_threads"], 2);
        assert_eq!(body["config"]["pool"]["capacity"], 4);
    }

    #[actix_web::test]
    async fn test_fixed_keys_are_rejected() {
        let (state, _) = scripted_state(ScriptedEngine::new(), 1);
        let app = api_app!(state).await;

        let req = test::TestRequest::put()
            .uri("/api/v1/config")
            .set_json(json!({"pool": {"capacity": 16}}))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        let body: Value = test::read_body_json(resp).await;
        assert_eq!(body["error"]["type"], "validation_error");
    }
}
