//! # Comandos Asíncronos
//! src/commands/asynchronous.rs
//!
//! Rutas que usan el ciclo async:
//! - /async/sleep: suspende la request y la completa desde un worker
//! - /async/dispatch: encadena dispatches de vuelta al pipeline
//! - /async/timeout: inicia un ciclo que nadie completa
//! - /async/inline: start + complete dentro del mismo handler

use crate::error::HandlerResult;
use crate::http::{DispatcherType, StatusCode};
use crate::lifecycle::{AsyncEvent, AsyncListener, ListenerResult};
use crate::server::Exchange;
use serde_json::json;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

pub const SLEEP_PATH: &str = "/async/sleep";
pub const DISPATCH_PATH: &str = "/async/dispatch";
pub const TIMEOUT_PATH: &str = "/async/timeout";
pub const INLINE_PATH: &str = "/async/inline";

const MAX_SLEEP_MS: u64 = 10_000;
const MAX_HOPS: u32 = 10;

/// Atributos que sobreviven entre dispatches
const HOPS_LEFT: &str = "dispatch.hops_left";
const HOPS_TOTAL: &str = "dispatch.hops_total";

/// Listener que sólo deja rastro en el log
pub struct LoggingListener;

impl AsyncListener for LoggingListener {
    fn on_start_async(&self, event: &AsyncEvent) -> ListenerResult {
        debug!(request_id = event.async_context().request_id(), "listener: start async");
        Ok(())
    }

    fn on_complete(&self, event: &AsyncEvent) -> ListenerResult {
        info!(
            request_id = event.async_context().request_id(),
            status = event.supplied_response().status().as_u16(),
            "listener: complete"
        );
        Ok(())
    }

    fn on_timeout(&self, event: &AsyncEvent) -> ListenerResult {
        warn!(request_id = event.async_context().request_id(), "listener: timeout");
        Ok(())
    }

    fn on_error(&self, event: &AsyncEvent) -> ListenerResult {
        warn!(
            request_id = event.async_context().request_id(),
            fault = ?event.fault(),
            "listener: error"
        );
        Ok(())
    }
}

/// Parsea un parámetro numérico opcional dentro de `[min, max]`
fn bounded_param<T>(value: Option<String>, name: &str, default: T, min: T, max: T) -> Result<T, String>
where
    T: std::str::FromStr + PartialOrd + std::fmt::Display + Copy,
{
    match value {
        None => Ok(default),
        Some(raw) => match raw.parse::<T>() {
            Ok(n) if n >= min && n <= max => Ok(n),
            _ => Err(format!("Parameter '{}' must be between {} and {}", name, min, max)),
        },
    }
}

/// Handler para /async/sleep?ms=N
///
/// El hilo del contenedor retorna enseguida; un worker duerme `ms` y
/// completa el ciclo.
///
/// # Ejemplo de response
/// ```json
/// {"slept_ms": 100, "elapsed_ms": 101}
/// ```
pub fn sleep_handler(exchange: &Arc<Exchange>) -> HandlerResult {
    let ms = match bounded_param(exchange.query_param("ms"), "ms", 100, 0, MAX_SLEEP_MS) {
        Ok(ms) => ms,
        Err(message) => {
            exchange.send_error(StatusCode::BadRequest, &message)?;
            return Ok(());
        }
    };

    let context = exchange.start_async()?;
    context.add_listener(Arc::new(LoggingListener))?;

    let worker = context.clone();
    let started = Instant::now();
    context.start(move || {
        thread::sleep(Duration::from_millis(ms));

        let response = match worker.get_response() {
            Ok(response) => response,
            Err(e) => {
                debug!(request_id = worker.request_id(), error = %e, "cycle ended before the worker");
                return;
            }
        };

        response.set_header("Content-Type", "application/json");
        response.write(
            &json!({
                "slept_ms": ms,
                "elapsed_ms": started.elapsed().as_millis() as u64,
            })
            .to_string(),
        );

        if let Err(e) = worker.complete() {
            debug!(request_id = worker.request_id(), error = %e, "complete rejected");
        }
    })?;

    Ok(())
}

/// Handler para /async/dispatch?hops=N
///
/// Cada paso inicia un ciclo y un worker hace `dispatch_to` de vuelta a esta
/// misma ruta. El último paso escribe la respuesta; el ciclo se completa
/// solo cuando el handler despachado retorna sin iniciar otro.
pub fn dispatch_handler(exchange: &Arc<Exchange>) -> HandlerResult {
    let hops_left = match exchange.dispatcher_type() {
        DispatcherType::Request => {
            match bounded_param(exchange.query_param("hops"), "hops", 1, 1, MAX_HOPS) {
                Ok(hops) => {
                    exchange.set_attribute(HOPS_TOTAL, &hops.to_string());
                    hops
                }
                Err(message) => {
                    exchange.send_error(StatusCode::BadRequest, &message)?;
                    return Ok(());
                }
            }
        }
        _ => exchange
            .attribute(HOPS_LEFT)
            .and_then(|s| s.parse::<u32>().ok())
            .unwrap_or(0),
    };

    if hops_left == 0 {
        let body = json!({
            "hops": exchange.attribute(HOPS_TOTAL).and_then(|s| s.parse::<u32>().ok()),
            "dispatcher": exchange.dispatcher_type().as_str(),
            "original_uri": exchange.attribute(crate::http::attributes::ASYNC_REQUEST_URI),
        });
        exchange.send_json(StatusCode::Ok, &body);
        return Ok(());
    }

    exchange.set_attribute(HOPS_LEFT, &(hops_left - 1).to_string());

    let context = exchange.start_async()?;
    let worker = context.clone();
    context.start(move || {
        if let Err(e) = worker.dispatch_to(DISPATCH_PATH) {
            warn!(request_id = worker.request_id(), error = %e, "dispatch rejected");
        }
    })?;

    Ok(())
}

/// Handler para /async/timeout?ms=N
///
/// Nadie llama `complete`: al vencer el timeout el contenedor responde con
/// error (o con la página de error configurada).
pub fn timeout_handler(exchange: &Arc<Exchange>) -> HandlerResult {
    let ms = match bounded_param(exchange.query_param("ms"), "ms", 1000, 1, 600_000) {
        Ok(ms) => ms,
        Err(message) => {
            exchange.send_error(StatusCode::BadRequest, &message)?;
            return Ok(());
        }
    };

    let context = exchange.start_async()?;
    context.set_timeout(ms)?;
    context.add_listener(Arc::new(LoggingListener))?;
    Ok(())
}

/// Handler para /async/inline
///
/// El `complete` se difiere hasta que el handler retorna.
pub fn inline_handler(exchange: &Arc<Exchange>) -> HandlerResult {
    let context = exchange.start_async()?;
    exchange.send_json(
        StatusCode::Ok,
        &json!({ "completed_inline": true, "request_id": exchange.id() }),
    );
    context.complete()?;
    Ok(())
}
