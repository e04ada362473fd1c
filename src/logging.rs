//! # Logging
//! src/logging.rs
//!
//! Inicializa `tracing` con un filtro estilo `RUST_LOG`.

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Filtro cuando no se pasa ninguno
pub const DEFAULT_FILTER: &str = "info,async_http_server=info";

/// Instala el subscriber global
///
/// Un filtro inválido cae al default. Llamarlo dos veces no es error: el
/// segundo intento se ignora (útil en tests).
pub fn init(filter: Option<&str>) {
    let filter = filter
        .and_then(|f| EnvFilter::try_new(f).ok())
        .unwrap_or_else(|| EnvFilter::new(DEFAULT_FILTER));

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_thread_names(true))
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_twice_is_harmless() {
        init(Some("async_http_server=debug"));
        init(Some("not a valid [filter"));
        tracing::debug!("logging initialized");
    }
}
