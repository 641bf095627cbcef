use actix_web::{web, App, HttpResponse, HttpServer, Responder};
use prometheus::{Encoder, Registry, TextEncoder};
use std::sync::Arc;

const SERVICE_NAME: &str = "event-forwarder";

/// Serve `/metrics` (Prometheus text format) and `/health` until the server stops.
///
/// Runs on its own actix system; the caller owns process signals.
pub async fn start_metrics_server(registry: Arc<Registry>, port: u16) -> std::io::Result<()> {
    tracing::info!(port = port, "📊 Starting metrics server on http://0.0.0.0:{}/metrics", port);

    HttpServer::new(move || App::new().configure(routes(registry.clone())))
        .bind(("0.0.0.0", port))?
        .disable_signals()
        .run()
        .await
}

fn routes(registry: Arc<Registry>) -> impl FnOnce(&mut web::ServiceConfig) {
    move |cfg| {
        cfg.app_data(web::Data::new(registry))
            .route("/metrics", web::get().to(metrics_handler))
            .route("/health", web::get().to(health_handler));
    }
}

async fn metrics_handler(registry: web::Data<Arc<Registry>>) -> impl Responder {
    let encoder = TextEncoder::new();
    let families = registry.gather();

    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&families, &mut buffer) {
        tracing::warn!(error = %e, "Failed to encode metrics");
        return HttpResponse::InternalServerError().body(e.to_string());
    }

    HttpResponse::Ok()
        .content_type(encoder.format_type())
        .body(buffer)
}

async fn health_handler(registry: web::Data<Arc<Registry>>) -> impl Responder {
    HttpResponse::Ok().json(serde_json::json!({
        "status": "healthy",
        "service": SERVICE_NAME,
        "metric_families": registry.gather().len(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::Metrics;
    use actix_web::test;

    #[actix_web::test]
    async fn test_metrics_endpoint_exposes_registry() {
        let metrics = Metrics::new().unwrap();
        metrics.record_append("InventoryItem", 2, 0.01);
        let registry = Arc::new(metrics.registry().clone());

        let app = test::init_service(App::new().configure(routes(registry))).await;
        let body = test::call_and_read_body(&app, test::TestRequest::get().uri("/metrics").to_request()).await;
        let text = String::from_utf8(body.to_vec()).unwrap();

        assert!(text.contains("events_appended_total{aggregate_type=\"InventoryItem\"} 2"));
    }

    #[actix_web::test]
    async fn test_health_endpoint() {
        let registry = Arc::new(Metrics::new().unwrap().registry().clone());
        let app = test::init_service(App::new().configure(routes(registry))).await;

        let body: serde_json::Value =
            test::call_and_read_body_json(&app, test::TestRequest::get().uri("/health").to_request()).await;
        assert_eq!(body["status"], "healthy");
        assert_eq!(body["service"], SERVICE_NAME);
    }
}
