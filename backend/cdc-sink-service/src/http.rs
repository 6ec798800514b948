//! Health and metrics endpoints.

use actix_web::dev::Server;
use actix_web::{web, App, HttpResponse, HttpServer, Responder};
use serde::Serialize;

use crate::services::cdc::{render_metrics, HealthHandle};

#[derive(Serialize)]
struct HealthResponse {
    healthy: bool,
    consecutive_errors: u32,
    seconds_since_last_success: u64,
    current_backoff_secs: u64,
}

async fn health(handle: web::Data<HealthHandle>) -> impl Responder {
    let status = handle.status();
    let body = HealthResponse {
        healthy: status.healthy,
        consecutive_errors: status.consecutive_errors,
        seconds_since_last_success: status.time_since_last_success.as_secs(),
        current_backoff_secs: status.current_backoff.as_secs(),
    };

    if status.healthy {
        HttpResponse::Ok().json(body)
    } else {
        HttpResponse::ServiceUnavailable().json(body)
    }
}

async fn metrics() -> impl Responder {
    HttpResponse::Ok()
        .content_type("text/plain; version=0.0.4")
        .body(render_metrics())
}

pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.route("/health", web::get().to(health))
        .route("/ready", web::get().to(|| async { "READY" }))
        .route("/metrics", web::get().to(metrics));
}

/// Bind the probe server. The caller drives the returned future.
pub fn serve(handle: HealthHandle, port: u16) -> std::io::Result<Server> {
    let data = web::Data::new(handle);
    let server = HttpServer::new(move || App::new().app_data(data.clone()).configure(configure))
        .workers(1)
        .bind(("0.0.0.0", port))?
        .run();
    Ok(server)
}
