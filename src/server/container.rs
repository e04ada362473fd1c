//! # Contenedor de Requests
//! src/server/container.rs
//!
//! Junta todas las piezas del ciclo de vida: router, pool de workers,
//! registro de ciclos async y métricas. Implementa [`Pipeline`], que es lo
//! que el ciclo async usa para volver a entrar al pipeline (dispatch), para
//! correr trabajo en otro hilo (`start(work)`) y para cerrar la conexión.
//!
//! El contenedor no conoce el transporte: [`Container::service`] recibe una
//! request ya parseada y la [`Connection`] por la que responder. El servidor
//! TCP y los tests usan el mismo camino.

use crate::config::Config;
use crate::error::{AsyncError, Fault, HandlerResult};
use crate::http::{Request, StatusCode};
use crate::lifecycle::{after_processing, AsyncRegistry, LifecycleEvent, Pipeline, TimeoutScanner};
use crate::metrics::MetricsCollector;
use crate::router::Router;
use crate::server::connection::Connection;
use crate::server::exchange::{Exchange, RequestId};
use crate::server::pool::{Task, WorkerPool};
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Configuración del contenedor
#[derive(Debug, Clone)]
pub struct ContainerConfig {
    /// Timeout con el que arranca cada ciclo async (<= 0: sin timeout)
    pub default_async_timeout_ms: i64,

    /// Threads del pool de workers
    pub workers: usize,

    /// Capacidad de la cola del pool
    pub queue_capacity: usize,

    /// Periodo del scanner de timeouts (ms)
    pub scan_interval_ms: u64,

    /// Ruta de la página de error (si no hay, se genera un 500)
    pub error_page: Option<String>,
}

impl Default for ContainerConfig {
    fn default() -> Self {
        Self {
            default_async_timeout_ms: 30_000,
            workers: 4,
            queue_capacity: 1000,
            scan_interval_ms: 1000,
            error_page: None,
        }
    }
}

impl ContainerConfig {
    /// Crea una configuración desde el Config principal
    pub fn from_config(config: &Config) -> Self {
        Self {
            default_async_timeout_ms: config.async_timeout_ms,
            workers: config.workers,
            queue_capacity: config.queue_capacity,
            scan_interval_ms: config.scan_interval_ms,
            error_page: config.error_page.clone(),
        }
    }
}

/// Contenedor que ejecuta requests síncronas y asíncronas
pub struct Container {
    router: Router,
    registry: AsyncRegistry,
    pool: WorkerPool,
    metrics: MetricsCollector,
    config: ContainerConfig,
    next_id: AtomicU64,
}

impl Container {
    pub fn new(router: Router, config: ContainerConfig) -> Arc<Self> {
        Self::with_metrics(router, config, MetricsCollector::new())
    }

    /// Igual que [`Container::new`] pero compartiendo un collector existente
    /// (por ejemplo, el que ya usa el handler de `/metrics`)
    pub fn with_metrics(router: Router, config: ContainerConfig, metrics: MetricsCollector) -> Arc<Self> {
        let pool = WorkerPool::new("async-worker", config.workers, config.queue_capacity);

        info!(
            workers = config.workers,
            queue_capacity = config.queue_capacity,
            routes = router.len(),
            "container ready"
        );

        Arc::new(Self {
            router,
            registry: AsyncRegistry::new(),
            pool,
            metrics,
            config,
            next_id: AtomicU64::new(1),
        })
    }

    /// Procesa una request en el hilo actual
    ///
    /// Retorna el exchange: si el handler inició un ciclo async, la respuesta
    /// se termina más tarde desde otro hilo.
    pub fn service(self: &Arc<Self>, request: Request, connection: Arc<dyn Connection>) -> Arc<Exchange> {
        let id: RequestId = self.next_id.fetch_add(1, Ordering::SeqCst);
        let pipeline: Arc<dyn Pipeline> = Arc::clone(self) as Arc<dyn Pipeline>;
        let exchange = Exchange::new(id, request, connection, pipeline);
        self.metrics.increment_active_connections();

        let path = exchange.path();
        debug!(request_id = id, method = exchange.method().as_str(), path = %path, "request received");

        let result = self.forward(&path, &exchange);
        after_processing(&exchange, result);
        exchange
    }

    /// Arranca el thread que revisa timeouts y desconexiones
    pub fn spawn_scanner(&self) -> io::Result<TimeoutScanner> {
        let interval = Duration::from_millis(self.config.scan_interval_ms.max(1));
        TimeoutScanner::spawn(self.registry.clone(), interval)
    }

    pub fn registry(&self) -> &AsyncRegistry {
        &self.registry
    }

    pub fn metrics(&self) -> &MetricsCollector {
        &self.metrics
    }

    pub fn router(&self) -> &Router {
        &self.router
    }

    pub fn config(&self) -> &ContainerConfig {
        &self.config
    }

    /// Cierra el pool; los ciclos suspendidos quedan para el scanner
    pub fn shutdown(&self) {
        info!(active_cycles = self.registry.len(), "container shutting down");
        self.pool.shutdown();
    }
}

impl Pipeline for Container {
    fn forward(&self, path: &str, exchange: &Arc<Exchange>) -> HandlerResult {
        let route = match self.router.find(path) {
            Some(route) => route,
            None => {
                debug!(request_id = exchange.id(), path, "route not found");
                if exchange
                    .send_error(StatusCode::NotFound, &format!("Route not found: {}", path))
                    .is_err()
                {
                    debug!(request_id = exchange.id(), "response already committed");
                }
                return Ok(());
            }
        };

        let handler = Arc::clone(route.handler());
        match panic::catch_unwind(AssertUnwindSafe(|| handler(exchange))) {
            Ok(result) => result,
            Err(payload) => {
                let message = Fault::panic_message(payload.as_ref());
                warn!(request_id = exchange.id(), path, panic = %message, "handler panicked");
                Err(format!("handler panicked: {}", message).into())
            }
        }
    }

    fn route_supports_async(&self, path: &str) -> bool {
        self.router.supports_async(path)
    }

    fn execute(&self, task: Task) -> Result<(), AsyncError> {
        self.pool.submit(task)
    }

    fn registry(&self) -> &AsyncRegistry {
        &self.registry
    }

    fn default_async_timeout_ms(&self) -> i64 {
        self.config.default_async_timeout_ms
    }

    fn error_page(&self) -> Option<String> {
        self.config.error_page.clone()
    }

    fn record(&self, event: LifecycleEvent) {
        self.metrics.record_lifecycle(event);
    }

    fn finish(&self, exchange: &Arc<Exchange>) {
        exchange.close();
        self.metrics.decrement_active_connections();

        let status = exchange.status().as_u16();
        let latency = exchange.received_at().elapsed();
        self.metrics.record_request(&exchange.path(), status, latency);

        info!(
            request_id = exchange.id(),
            path = %exchange.path(),
            status,
            latency_ms = latency.as_secs_f64() * 1000.0,
            "request finished"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::connection::MemoryConnection;

    fn container(router: Router) -> Arc<Container> {
        Container::new(
            router,
            ContainerConfig {
                workers: 2,
                queue_capacity: 16,
                ..ContainerConfig::default()
            },
        )
    }

    fn get(path: &str) -> Request {
        Request::get(path)
    }

    #[test]
    fn test_from_config() {
        let mut config = Config::default();
        config.async_timeout_ms = 500;
        config.error_page = Some("/error".to_string());

        let container_config = ContainerConfig::from_config(&config);
        assert_eq!(container_config.default_async_timeout_ms, 500);
        assert_eq!(container_config.error_page.as_deref(), Some("/error"));
        assert_eq!(container_config.workers, config.workers);
    }

    #[test]
    fn test_sync_route() {
        let mut router = Router::new();
        router.register("/hello", |exchange| {
            exchange.write("hi");
            Ok(())
        });
        let container = container(router);
        let connection = Arc::new(MemoryConnection::new());

        let exchange = container.service(get("/hello"), connection.clone());

        assert!(exchange.is_finished());
        let output = connection.output();
        assert!(output.starts_with("HTTP/1.0 200 OK"));
        assert!(output.ends_with("hi"));
        let snapshot = container.metrics().get_snapshot();
        assert_eq!(snapshot.total_requests, 1);
        assert_eq!(snapshot.active_connections, 0);
    }

    #[test]
    fn test_unknown_route_is_404() {
        let container = container(Router::new());
        let connection = Arc::new(MemoryConnection::new());

        container.service(get("/missing"), connection.clone());

        let output = connection.output();
        assert!(output.starts_with("HTTP/1.0 404 Not Found"));
        assert!(output.contains("Route not found: /missing"));
    }

    #[test]
    fn test_handler_panic_becomes_500() {
        let mut router = Router::new();
        router.register("/panic", |_exchange| panic!("boom"));
        let container = container(router);
        let connection = Arc::new(MemoryConnection::new());

        container.service(get("/panic"), connection.clone());

        let output = connection.output();
        assert!(output.starts_with("HTTP/1.0 500 Internal Server Error"));
        assert!(output.contains("boom"));
    }

    #[test]
    fn test_async_route_completes_from_worker() {
        let mut router = Router::new();
        router.register_async("/later", |exchange| {
            let context = exchange.start_async()?;
            let worker = context.clone();
            context.start(move || {
                if let Ok(response) = worker.get_response() {
                    response.write("done");
                }
                let _ = worker.complete();
            })?;
            Ok(())
        });
        let container = container(router);
        let connection = Arc::new(MemoryConnection::new());

        container.service(get("/later"), connection.clone());

        let output = connection
            .wait_closed(Duration::from_secs(5))
            .expect("async cycle did not finish");
        assert!(output.starts_with("HTTP/1.0 200 OK"));
        assert!(output.ends_with("done"));
        assert!(container.registry().is_empty());

        let lifecycle = container.metrics().lifecycle();
        assert_eq!(lifecycle.cycles_started, 1);
        assert_eq!(lifecycle.completed, 1);
    }

    #[test]
    fn test_request_ids_increase() {
        let mut router = Router::new();
        router.register("/id", |_exchange| Ok(()));
        let container = container(router);

        let first = container.service(get("/id"), Arc::new(MemoryConnection::new()));
        let second = container.service(get("/id"), Arc::new(MemoryConnection::new()));
        assert!(second.id() > first.id());
    }
}
