pub mod config;
pub mod contexts;

pub use self::config::*;
pub use self::contexts::*;

use crate::health;
use actix_web::web;

/// Routes mounted under `/api/v1`.
pub fn configure_api(cfg: &mut web::ServiceConfig) {
    cfg.route("/health", web::get().to(health::health_check))
        .route("/metrics", web::get().to(health::detailed_metrics))
        .route("/config", web::get().to(get_config))
        .route("/config", web::put().to(update_config))
        .route("/contexts", web::get().to(list_contexts))
        .route("/contexts", web::post().to(acquire_context))
        .route("/contexts/{handle}", web::delete().to(release_context))
        .route("/contexts/{handle}/transcribe", web::post().to(transcribe));
}

/// Test service with `state` and the `/api/v1` routes, no middleware.
#[cfg(test)]
macro_rules! api_app {
    ($state:expr) => {
        actix_web::test::init_service(
            actix_web::App::new()
                .app_data(actix_web::web::Data::new($state))
                .service(actix_web::web::scope("/api/v1").configure($crate::handlers::configure_api)),
        )
    };
}

#[cfg(test)]
pub(crate) use api_app;
