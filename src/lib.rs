//! # Async HTTP Server
//! src/lib.rs
//!
//! Servidor HTTP/1.0 con ciclo de vida asíncrono de requests: un handler
//! puede suspender la request (`start_async`), soltar el hilo que la recibió
//! y terminarla después desde otro hilo con `complete()` o re-entrar al
//! pipeline con `dispatch()`.
//!
//! ## Arquitectura
//!
//! - `http`: parsing de requests y respuestas con buffer/commit
//! - `lifecycle`: máquina de estados, `AsyncContext`, listeners, timeouts
//! - `server`: conexiones, exchange, pool de workers, contenedor, TCP
//! - `router`: rutas síncronas y con soporte async
//! - `commands`: rutas que expone el binario
//! - `metrics`: métricas de requests y del ciclo async
//! - `config` / `logging`: CLI y tracing
//!
//! ## Ejemplo de uso
//!
//! ```no_run
//! use async_http_server::config::Config;
//! use async_http_server::router::Router;
//! use async_http_server::server::Server;
//!
//! let mut router = Router::new();
//! router.register_async("/later", |exchange| {
//!     let context = exchange.start_async()?;
//!     let worker = context.clone();
//!     context.start(move || {
//!         let _ = worker.complete();
//!     })?;
//!     Ok(())
//! });
//!
//! let mut server = Server::new(Config::default(), router);
//! server.run().expect("Error al iniciar servidor");
//! ```

pub mod commands;
pub mod config;
pub mod error;
pub mod http;
pub mod lifecycle;
pub mod logging;
pub mod metrics;
pub mod router;
pub mod server;

pub use error::{AsyncError, BoxError, Fault, HandlerResult};
pub use lifecycle::{AsyncContext, AsyncListener, AsyncState};
