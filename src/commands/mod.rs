//! # Comandos del Servidor
//! src/commands/mod.rs
//!
//! Rutas que expone el binario.
//!
//! ## Categorías de comandos
//!
//! - **basic**: rutas síncronas (status, help, metrics, página de error)
//! - **asynchronous**: rutas que suspenden la request con `start_async`
//!
//! Cada comando es un handler que recibe el `Exchange` y retorna
//! `HandlerResult`.

pub mod asynchronous;
pub mod basic;

pub use asynchronous::LoggingListener;

use crate::metrics::MetricsCollector;
use crate::router::Router;

/// Ruta de la página de error incluida
pub const ERROR_PAGE_PATH: &str = "/error";

/// Registra todas las rutas del servidor
pub fn register_routes(router: &mut Router, metrics: &MetricsCollector) {
    // Comandos básicos
    let status_metrics = metrics.clone();
    router.register("/status", move |exchange| basic::status_handler(exchange, &status_metrics));
    router.register("/help", basic::help_handler);
    let metrics = metrics.clone();
    router.register("/metrics", move |exchange| basic::metrics_handler(exchange, &metrics));
    router.register(ERROR_PAGE_PATH, basic::error_page_handler);

    // Comandos async
    router.register_async(asynchronous::SLEEP_PATH, asynchronous::sleep_handler);
    router.register_async(asynchronous::DISPATCH_PATH, asynchronous::dispatch_handler);
    router.register_async(asynchronous::TIMEOUT_PATH, asynchronous::timeout_handler);
    router.register_async(asynchronous::INLINE_PATH, asynchronous::inline_handler);
}
