//! # Health and Metrics Endpoints

//!
//! Both endpoints read the published pool status and answer while a
//! context call is still waiting for a transcription to finish.

use crate::state::AppState;
use crate::transcription::PoolSnapshot;
use actix_web::{web, HttpResponse};
use serde_json::json;
use std::process;

pub async fn health_check(state: web::Data<AppState>) -> HttpResponse {
    let metrics = state.get_metrics_snapshot();
    let config = state.get_config();
    let uptime_seconds = state.get_uptime_seconds();
    let status = state.service_status();

    HttpResponse::Ok().json(json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "uptime_seconds": uptime_seconds,
        "service": {
            "name": env!("CARGO_PKG_NAME"),
            "version": env!("CARGO_PKG_VERSION"),
            "host": config.server.host,
            "port": config.server.port
        },
        "metrics": {
            "total_requests": metrics.request_count,
            "total_errors": metrics.error_count,
            "error_rate": if metrics.request_count > 0 {
                metrics.error_count as f64 / metrics.request_count as f64
            } else {
                0.0
            }
        },
        "memory": get_memory_info(),
        "engine": {
            "device": state.device,
            "aheads_preset": config.engine.aheads_preset,
            "dtw_token_timestamps": config.engine.dtw_token_timestamps
        },
        "system": get_system_status(&status.pool),
        "service_busy": status.busy,
        "pool": status.pool
    }))
}

pub async fn detailed_metrics(state: web::Data<AppState>) -> HttpResponse {
    let metrics = state.get_metrics_snapshot();
    let uptime_seconds = state.get_uptime_seconds();
    let status = state.service_status();

    let mut endpoint_stats = Vec::new();
    for (endpoint, metric) in metrics.endpoint_metrics.iter() {
        endpoint_stats.push(json!({
            "endpoint": endpoint,
            "request_count": metric.request_count,
            "error_count": metric.error_count,
            "error_rate": metric.error_rate(),
            "average_duration_ms": metric.average_duration_ms(),
            "total_duration_ms": metric.total_duration_ms
        }));
    }

    HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "uptime_seconds": uptime_seconds,
        "overall": {
            "total_requests": metrics.request_count,
            "total_errors": metrics.error_count,
            "error_rate": if metrics.request_count > 0 {
                metrics.error_count as f64 / metrics.request_count as f64
            } else {
                0.0
            },
            "requests_per_second": if uptime_seconds > 0 {
                metrics.request_count as f64 / uptime_seconds as f64
            } else {
                0.0
            }
        },
        "endpoints": endpoint_stats,
        "memory": get_memory_info(),
        "transcription": status
    }))
}

/// Process memory from `/proc/self/status`, where available.
fn get_memory_info() -> serde_json::Value {
    let status = std::fs::read_to_string(format!("/proc/{}/status", process::id())).ok();

    let Some(status) = status else {
        return json!({
            "resident_memory_bytes": 0,
            "virtual_memory_bytes": 0,
            "available": false,
            "note": "Memory info not available on this platform"
        });
    };

    let read_kb = |prefix: &str| -> u64 {
        status
            .lines()
            .find(|line| line.starts_with(prefix))
            .and_then(|line| line.split_whitespace().nth(1))
            .and_then(|kb| kb.parse::<u64>().ok())
            .unwrap_or(0)
    };

    json!({
        "resident_memory_bytes": read_kb("VmRSS:") * 1024,
        "virtual_memory_bytes": read_kb("VmSize:") * 1024,
        "available": true
    })
}

fn get_system_status(snapshot: &PoolSnapshot) -> serde_json::Value {
    let slot_usage = if snapshot.capacity > 0 {
        snapshot.occupied as f64 / snapshot.capacity as f64
    } else {
        0.0
    };

    let status = if snapshot.occupied == snapshot.capacity {
        "pool_full"
    } else if slot_usage > 0.7 {
        "moderate_load"
    } else {
        "normal"
    };

    json!({
        "status": status,
        "slot_usage_percent": (slot_usage * 100.0).round(),
        "capacity": snapshot.capacity,
        "occupied": snapshot.occupied,
        "worker": snapshot.worker,
        "load_warnings": if snapshot.occupied == snapshot.capacity {
            vec!["All context slots are occupied - release a context before acquiring another"]
        } else {
            vec![]
        }
    })
}

#[cfg(test)]
mod tests {
    use crate::handlers::api_app;
    use crate::state::tests::scripted_state;
    use crate::transcription::testing::ScriptedEngine;
    use crate::transcription::JobRequest;
    use actix_web::test;
    use serde_json::Value;
    use std::time::{Duration, Instant};

    #[actix_web::test]
    async fn test_health_reports_pool() {
        let (state, _) = scripted_state(ScriptedEngine::new(), 1);
        state.with_service(|service| service.acquire("model")).unwrap();
        let app = api_app!(state).await;

        let req = test::TestRequest::get().uri("/api/v1/health").to_request();
        let body: Value = test::read_body_json(test::call_service(&app, req).await).await;

        assert_eq!(body["status"], "healthy");
        assert_eq!(body["service_busy"], false);
        assert_eq!(body["pool"]["capacity"], 1);
        assert_eq!(body["pool"]["handles"][0], 1);
        assert_eq!(body["system"]["status"], "pool_full");
    }

    #[actix_web::test]
    async fn test_health_answers_while_acquire_waits_for_job() {
        let engine = ScriptedEngine::new().with_delay(Duration::from_millis(1500));
        let (state, _) = scripted_state(engine, 2);
        let handle = state.with_service(|service| service.acquire("model")).unwrap();
        let request = JobRequest {
            audio: vec![0.0; 16_000],
            language: "en".to_string(),
            n_threads: 1,
            translate: false,
        };
        state.with_service(|service| service.dispatch(handle, request)).unwrap();

        // Holds the service lock until the delayed job has been joined
        let waiting_state = state.clone();
        let waiter = std::thread::spawn(move || waiting_state.with_service(|service| service.acquire("second")));
        std::thread::sleep(Duration::from_millis(200));

        let app = api_app!(state).await;
        let started = Instant::now();
        for uri in ["/api/v1/health", "/api/v1/metrics", "/api/v1/contexts"] {
            let req = test::TestRequest::get().uri(uri).to_request();
            let resp = test::call_service(&app, req).await;
            assert!(resp.status().is_success());
        }
        let req = test::TestRequest::get().uri("/api/v1/health").to_request();
        let body: Value = test::read_body_json(test::call_service(&app, req).await).await;
        assert!(started.elapsed() < Duration::from_millis(800));

        assert_eq!(body["service_busy"], true);
        assert_eq!(body["pool"]["worker"], "running");
        assert_eq!(body["pool"]["running_handle"], 1);

        assert!(waiter.join().unwrap().is_ok());
    }
}
