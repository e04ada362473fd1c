//! # Comandos Básicos
//! src/commands/basic.rs
//!
//! Rutas síncronas del servidor:
//! - /status: Estado del servidor y ciclos async en curso
//! - /help: Ayuda sobre comandos disponibles
//! - /metrics: Snapshot de métricas en JSON
//! - /error: Página de error para ciclos que fallan

use crate::error::HandlerResult;
use crate::http::{attributes, StatusCode};
use crate::metrics::MetricsCollector;
use crate::server::Exchange;
use serde_json::json;
use std::sync::Arc;

/// Handler para /status
///
/// # Ejemplo de response
/// ```json
/// {
///   "status": "running",
///   "version": "0.1.0",
///   "server": "RedUnix-Async/1.0",
///   "active_connections": 3
/// }
/// ```
pub fn status_handler(exchange: &Arc<Exchange>, metrics: &MetricsCollector) -> HandlerResult {
    let body = json!({
        "status": "running",
        "version": env!("CARGO_PKG_VERSION"),
        "server": crate::server::exchange::SERVER_NAME,
        "active_connections": metrics.active_connections(),
    });
    exchange.send_json(StatusCode::Ok, &body);
    Ok(())
}

/// Handler para /help
pub fn help_handler(exchange: &Arc<Exchange>) -> HandlerResult {
    let body = json!({
        "commands": [
            {
                "path": "/status",
                "description": "Server status",
                "parameters": []
            },
            {
                "path": "/metrics",
                "description": "Request and async lifecycle metrics",
                "parameters": []
            },
            {
                "path": "/async/sleep",
                "description": "Suspend the request and complete it from a worker",
                "parameters": ["ms (optional): 0..=10000, default 100"]
            },
            {
                "path": "/async/dispatch",
                "description": "Chain async dispatches back into the pipeline",
                "parameters": ["hops (optional): 1..=10, default 1"]
            },
            {
                "path": "/async/timeout",
                "description": "Start an async cycle that is never completed",
                "parameters": ["ms (optional): timeout in ms, default 1000"]
            },
            {
                "path": "/async/inline",
                "description": "Start and complete in the same handler",
                "parameters": []
            }
        ]
    });
    exchange.send_json(StatusCode::Ok, &body);
    Ok(())
}

/// Handler para /metrics
pub fn metrics_handler(exchange: &Arc<Exchange>, metrics: &MetricsCollector) -> HandlerResult {
    exchange.send_json(StatusCode::Ok, &metrics.to_json());
    Ok(())
}

/// Página de error: la usa el contenedor cuando un ciclo async falla
///
/// Lee los atributos que deja el contenedor antes del forward.
pub fn error_page_handler(exchange: &Arc<Exchange>) -> HandlerResult {
    let status = exchange
        .attribute(attributes::ERROR_STATUS)
        .and_then(|s| s.parse::<u16>().ok())
        .and_then(StatusCode::from_u16)
        .unwrap_or(StatusCode::InternalServerError);

    let message = exchange
        .attribute(attributes::ERROR_MESSAGE)
        .unwrap_or_else(|| "unknown error".to_string());

    let body = json!({
        "error": message,
        "status": status.as_u16(),
        "request_id": exchange.id(),
        "original_uri": exchange.attribute(attributes::ASYNC_REQUEST_URI),
        "dispatcher": exchange.dispatcher_type().as_str(),
    });
    exchange.send_json(status, &body);
    Ok(())
}
