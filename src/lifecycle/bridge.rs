//! # Puente Dispatch/Resume
//! src/lifecycle/bridge.rs
//!
//! Conecta la máquina de estados con el pipeline del contenedor:
//!
//! - [`after_processing`]: el handler retornó; aplicar lo diferido
//!   (suspender, completar, re-despachar o manejar el error).
//! - [`schedule_dispatch`] / [`complete_cycle`]: dispatch y complete
//!   pedidos desde otro hilo.
//! - [`handle_error`] y [`fire_timeout`]: fallas y timeouts que nadie
//!   resolvió terminan en una respuesta de error y una completación forzada.
//!
//! El pipeline se abstrae con el trait [`Pipeline`] (routing, pool y
//! registro), lo que permite probar el ciclo sin sockets.

use crate::error::{AsyncError, Fault, HandlerResult};
use crate::http::StatusCode;
use crate::lifecycle::listener::{self, ListenerEvent};
use crate::lifecycle::scanner::AsyncRegistry;
use crate::lifecycle::state::PostAction;
use crate::lifecycle::{AsyncContext, AsyncState};
use crate::server::exchange::Exchange;
use crate::server::pool::Task;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};

/// Eventos del ciclo que el contenedor puede contabilizar
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LifecycleEvent {
    CycleStarted,
    Suspended,
    Dispatched,
    Completed,
    TimedOut,
    Errored,
    ListenerFault,
}

/// Lo que el ciclo async necesita del contenedor
pub trait Pipeline: Send + Sync {
    /// Ejecuta el handler de `path` sobre el exchange
    fn forward(&self, path: &str, exchange: &Arc<Exchange>) -> HandlerResult;

    /// ¿La ruta permite `start_async`?
    fn route_supports_async(&self, path: &str) -> bool;

    /// Ejecuta `task` en un hilo del contenedor
    fn execute(&self, task: Task) -> Result<(), AsyncError>;

    /// Registro de ciclos vivos que recorre el scanner
    fn registry(&self) -> &AsyncRegistry;

    /// Timeout con el que arranca cada ciclo
    fn default_async_timeout_ms(&self) -> i64;

    /// Página a la que se hace forward cuando un ciclo termina en error
    fn error_page(&self) -> Option<String> {
        None
    }

    fn record(&self, _event: LifecycleEvent) {}

    /// La respuesta es final: cerrar la conexión
    fn finish(&self, exchange: &Arc<Exchange>) {
        exchange.close();
    }
}

/// El handler original (o el de un dispatch) retornó
pub fn after_processing(exchange: &Arc<Exchange>, result: HandlerResult) {
    match exchange.async_context() {
        Some(context) => {
            if let Err(err) = result {
                context.raise_fault(Fault::Handler(err.to_string()));
            }
            resume(&context);
        }
        None => finish_sync(exchange, result),
    }
}

fn finish_sync(exchange: &Arc<Exchange>, result: HandlerResult) {
    if let Err(err) = result {
        error!(request_id = exchange.id(), error = %err, "handler failed");
        if !exchange.respond_with_error(StatusCode::InternalServerError, &err.to_string()) {
            debug!(request_id = exchange.id(), "response already committed, keeping status");
        }
    }

    if let Err(e) = exchange.finish_response() {
        debug!(request_id = exchange.id(), error = %e, "could not write response");
    }
    exchange.pipeline().finish(exchange);
}

/// Aplica la mitad diferida de las transiciones hasta que el ciclo quede
/// suspendido o termine
pub(crate) fn resume(context: &AsyncContext) {
    loop {
        let action = match context.machine().post_process() {
            Ok(action) => action,
            Err(e) => {
                warn!(request_id = context.request_id(), error = %e, "post-process failed");
                return;
            }
        };

        submit_pending_work(context);

        match action {
            PostAction::None => return,
            PostAction::Suspend => {
                debug!(
                    request_id = context.request_id(),
                    timeout_ms = context.timeout(),
                    "async cycle suspended"
                );
                context.pipeline().record(LifecycleEvent::Suspended);
                return;
            }
            PostAction::Complete => {
                complete_cycle(context);
                return;
            }
            PostAction::Error => {
                handle_error(context);
                return;
            }
            PostAction::Dispatch => {
                if let Err(err) = forward_dispatch(context) {
                    context.raise_fault(Fault::Handler(err.to_string()));
                }
            }
        }
    }
}

fn submit_pending_work(context: &AsyncContext) {
    for task in context.take_pending_work() {
        if let Err(e) = context.pipeline().execute(task) {
            context.raise_fault(Fault::Handler(e.to_string()));
        }
    }
}

/// DISPATCHING → DISPATCHED_ASYNC y re-entrada al pipeline
fn forward_dispatch(context: &AsyncContext) -> HandlerResult {
    let target = context.take_dispatch_target();
    let exchange = context.exchange();
    let path = exchange.prepare_async_dispatch(target.as_deref());

    context.machine().begin_dispatch()?;
    context.pipeline().record(LifecycleEvent::Dispatched);
    info!(request_id = exchange.id(), path = %path, "async dispatch");

    context.pipeline().forward(&path, exchange)
}

/// Dispatch pedido desde un hilo externo: corre en el pool
pub(crate) fn schedule_dispatch(context: &AsyncContext) {
    let task_context = context.clone();
    let task: Task = Box::new(move || run_dispatch(&task_context));

    if let Err(e) = context.pipeline().execute(task) {
        warn!(request_id = context.request_id(), error = %e, "dispatch rejected, running inline");
        run_dispatch(context);
    }
}

fn run_dispatch(context: &AsyncContext) {
    if let Err(err) = forward_dispatch(context) {
        context.raise_fault(Fault::Handler(err.to_string()));
    }
    resume(context);
}

/// COMPLETING → COMPLETE: commit, `on_complete` y cierre
pub(crate) fn complete_cycle(context: &AsyncContext) {
    context.mark_completing_thread();
    let exchange = context.exchange();
    let pipeline = context.pipeline();
    let request_id = exchange.id();

    if let Err(e) = exchange.finish_response() {
        debug!(request_id, error = %e, "could not flush response on completion");
    }

    let entries = context.listener_entries();
    listener::notify(&entries, ListenerEvent::Complete, context, None);

    if let Err(e) = context.machine().finish_completion() {
        warn!(request_id, error = %e, "completion out of order");
    }

    pipeline.registry().deregister(request_id);
    pipeline.record(LifecycleEvent::Completed);
    info!(request_id, status = exchange.status().as_u16(), "async cycle complete");

    context.recycle();
    pipeline.finish(exchange);
}

/// Ciclo en ERROR: `on_error` y, si nadie lo resolvió, respuesta de error
pub(crate) fn handle_error(context: &AsyncContext) {
    let (fault, during_async) = match context.take_error_state() {
        Some(state) => (state.fault, state.during_async),
        None => (Fault::Handler("unknown async error".to_string()), true),
    };

    // Un dispatch inline reemplazado por el error ya no se aplica
    if let Some(target) = context.take_dispatch_target() {
        debug!(request_id = context.request_id(), target = %target, "pending dispatch dropped");
    }

    warn!(request_id = context.request_id(), fault = %fault, during_async, "async cycle failed");
    context.pipeline().record(LifecycleEvent::Errored);

    let entries = context.listener_entries();
    let outcome = listener::notify(&entries, ListenerEvent::Error, context, Some(&fault));

    if context.state() == AsyncState::Error {
        error_dispatch(context, outcome.first_fault.unwrap_or(fault));
    }
}

/// Respuesta de error generada por el contenedor y completación forzada
fn error_dispatch(context: &AsyncContext, fault: Fault) {
    let exchange = context.exchange();
    let pipeline = context.pipeline();
    let request_id = exchange.id();

    match pipeline.error_page() {
        Some(page) if !exchange.is_committed() => {
            let path = exchange.prepare_error_dispatch(&page, &fault);
            info!(request_id, page = %path, "forwarding to error page");

            if let Err(err) = pipeline.forward(&path, exchange) {
                warn!(request_id, error = %err, "error page failed");
                exchange.respond_with_error(StatusCode::InternalServerError, &fault.to_string());
            }
        }
        _ => {
            if !exchange.respond_with_error(StatusCode::InternalServerError, &fault.to_string()) {
                debug!(request_id, "response already committed, keeping status");
            }
        }
    }

    // Si la página de error no completó ni hizo dispatch, completar aquí
    match context.machine().async_complete() {
        Ok(true) => complete_cycle(context),
        Ok(false) => {}
        Err(_) => debug!(request_id, state = %context.state(), "error resolved by the application"),
    }
}

/// Verifica el deadline de un ciclo suspendido; lo usa el scanner
///
/// Retorna `true` si el timeout disparó.
pub(crate) fn fire_timeout(context: &AsyncContext, now: Instant) -> bool {
    let timeout_ms = context.timeout();
    match context.machine().async_timeout(now, timeout_ms) {
        Ok(true) => {}
        _ => return false,
    }

    let request_id = context.request_id();
    info!(request_id, timeout_ms, "async timeout");
    context.pipeline().record(LifecycleEvent::TimedOut);

    let entries = context.listener_entries();
    let outcome = listener::notify(&entries, ListenerEvent::Timeout, context, None);

    if context.machine().resolve_timeout() {
        let fault = outcome.first_fault.unwrap_or(Fault::Timeout { timeout_ms });
        warn!(request_id, fault = %fault, "timeout not resolved by listeners");
        context.pipeline().record(LifecycleEvent::Errored);
        error_dispatch(context, fault);
    }
    true
}
