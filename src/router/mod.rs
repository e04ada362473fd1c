//! # Sistema de Routing
//! src/router/mod.rs
//!
//! Mapea paths HTTP a handlers.
//!
//! ```text
//! Exchange → Router → Handler → (respuesta en el Exchange | start_async)
//! ```
//!
//! Cada ruta declara si admite procesamiento asíncrono: `start_async` sólo
//! funciona dentro de handlers registrados con [`Router::register_async`].
//! La validación se hace contra el destino actual, así que un `dispatch` a
//! una ruta síncrona está permitido pero esa ruta no puede volver a iniciar
//! un ciclo.

use crate::error::HandlerResult;
use crate::server::exchange::Exchange;
use std::sync::Arc;

/// Tipo de función handler
///
/// Escribe la respuesta en el exchange (o inicia un ciclo async) y retorna
/// `Err` si algo falló.
pub type Handler = Arc<dyn Fn(&Arc<Exchange>) -> HandlerResult + Send + Sync>;

/// Ruta registrada
#[derive(Clone)]
pub struct Route {
    path: String,
    handler: Handler,
    async_supported: bool,
}

impl Route {
    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn handler(&self) -> &Handler {
        &self.handler
    }

    pub fn async_supported(&self) -> bool {
        self.async_supported
    }
}

/// Router que mapea paths a handlers
#[derive(Clone, Default)]
pub struct Router {
    routes: Vec<Route>,
}

impl Router {
    pub fn new() -> Self {
        Self { routes: Vec::new() }
    }

    /// Registra una ruta síncrona
    ///
    /// # Ejemplo
    /// ```
    /// use async_http_server::router::Router;
    ///
    /// let mut router = Router::new();
    /// router.register("/hello", |exchange| {
    ///     exchange.write("hello");
    ///     Ok(())
    /// });
    /// assert!(!router.supports_async("/hello"));
    /// ```
    pub fn register<F>(&mut self, path: &str, handler: F)
    where
        F: Fn(&Arc<Exchange>) -> HandlerResult + Send + Sync + 'static,
    {
        self.add(path, Arc::new(handler), false);
    }

    /// Registra una ruta que puede llamar `start_async`
    pub fn register_async<F>(&mut self, path: &str, handler: F)
    where
        F: Fn(&Arc<Exchange>) -> HandlerResult + Send + Sync + 'static,
    {
        self.add(path, Arc::new(handler), true);
    }

    fn add(&mut self, path: &str, handler: Handler, async_supported: bool) {
        // Re-registrar un path reemplaza la ruta anterior
        self.routes.retain(|route| route.path != path);
        self.routes.push(Route {
            path: path.to_string(),
            handler,
            async_supported,
        });
    }

    /// Busca la ruta de un path (sin query string)
    pub fn find(&self, path: &str) -> Option<&Route> {
        self.routes.iter().find(|route| route.path == path)
    }

    pub fn supports_async(&self, path: &str) -> bool {
        self.find(path).map(|route| route.async_supported).unwrap_or(false)
    }

    pub fn paths(&self) -> Vec<&str> {
        self.routes.iter().map(|route| route.path.as_str()).collect()
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}
