//! # Configuración del Servidor
//! src/config.rs
//!
//! Configuración del servidor con soporte para argumentos CLI y variables
//! de entorno.
//!
//! ## Ejemplos de uso
//!
//! ### CLI
//! ```bash
//! ./async_http_server --port 8080 \
//!   --workers 8 \
//!   --async-timeout 10000 \
//!   --error-page /error
//! ```
//!
//! ### Variables de entorno
//! ```bash
//! HTTP_PORT=8080 ASYNC_TIMEOUT_MS=5000 RUST_LOG=async_http_server=debug ./async_http_server
//! ```

use clap::Parser;

/// Configuración del servidor HTTP/1.0 asíncrono
#[derive(Debug, Clone, Parser)]
#[command(name = "async_http_server")]
#[command(about = "Servidor HTTP/1.0 con ciclo de vida asíncrono de requests")]
#[command(version = "0.1.0")]
pub struct Config {
    /// Puerto en el que escucha el servidor
    #[arg(short, long, default_value = "8080", env = "HTTP_PORT")]
    pub port: u16,

    /// Host/IP en el que escucha
    #[arg(long, default_value = "127.0.0.1", env = "HTTP_HOST")]
    pub host: String,

    // === Workers ===

    /// Threads del pool que ejecuta `start(work)` y los dispatch
    #[arg(long = "workers", default_value = "4", env = "ASYNC_WORKERS")]
    pub workers: usize,

    /// Capacidad máxima de la cola del pool
    #[arg(long = "queue", default_value = "1000", env = "ASYNC_QUEUE")]
    pub queue_capacity: usize,

    // === Ciclo async ===

    /// Timeout por defecto de cada ciclo async en ms (<= 0 lo deshabilita)
    #[arg(
        long = "async-timeout",
        default_value = "30000",
        env = "ASYNC_TIMEOUT_MS",
        allow_negative_numbers = true
    )]
    pub async_timeout_ms: i64,

    /// Cada cuánto revisa timeouts el scanner, en ms
    #[arg(long = "scan-interval", default_value = "1000", env = "ASYNC_SCAN_INTERVAL_MS")]
    pub scan_interval_ms: u64,

    /// Ruta a la que se hace forward cuando un ciclo termina en error
    #[arg(long = "error-page", env = "ASYNC_ERROR_PAGE")]
    pub error_page: Option<String>,

    // === Logging ===

    /// Filtro de tracing (sintaxis de EnvFilter)
    #[arg(long = "log-filter", env = "RUST_LOG")]
    pub log_filter: Option<String>,
}

impl Config {
    /// Crea una nueva configuración parseando argumentos CLI
    pub fn new() -> Self {
        Config::parse()
    }

    /// Dirección completa para bind (host:port)
    ///
    /// # Ejemplo
    /// ```rust
    /// use async_http_server::config::Config;
    ///
    /// let config = Config::default();
    /// assert_eq!(config.address(), "127.0.0.1:8080");
    /// ```
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Valida la configuración
    pub fn validate(&self) -> Result<(), String> {
        if self.workers == 0 {
            return Err("Workers must be >= 1".to_string());
        }

        if self.queue_capacity == 0 {
            return Err("Queue capacity must be >= 1".to_string());
        }

        if self.scan_interval_ms == 0 {
            return Err("Scan interval must be > 0".to_string());
        }

        if let Some(page) = &self.error_page {
            if !page.starts_with('/') {
                return Err(format!("Error page must be a path starting with '/': {}", page));
            }
        }

        Ok(())
    }

    /// Imprime un resumen de la configuración
    pub fn print_summary(&self) {
        let timeout = if self.async_timeout_ms > 0 {
            format!("{} ms", self.async_timeout_ms)
        } else {
            "disabled".to_string()
        };

        println!("╔══════════════════════════════════════════════════════════════╗");
        println!("║        RedUnix Async HTTP/1.0 Server Configuration          ║");
        println!("╚══════════════════════════════════════════════════════════════╝");
        println!();
        println!("🌐 Network:");
        println!("   Address:       {}", self.address());
        println!();
        println!("👷 Worker Pool:");
        println!("   Workers:       {}", self.workers);
        println!("   Queue cap:     {}", self.queue_capacity);
        println!();
        println!("⏱️  Async Lifecycle:");
        println!("   Timeout:       {}", timeout);
        println!("   Scan interval: {} ms", self.scan_interval_ms);
        println!(
            "   Error page:    {}",
            self.error_page.as_deref().unwrap_or("(container 500)")
        );
        println!();
        println!("═══════════════════════════════════════════════════════════════");
        println!();
    }
}

impl Default for Config {
    /// Mismos valores que los defaults del CLI
    fn default() -> Self {
        Self {
            port: 8080,
            host: "127.0.0.1".to_string(),
            workers: 4,
            queue_capacity: 1000,
            async_timeout_ms: 30_000,
            scan_interval_ms: 1000,
            error_page: None,
            log_filter: None,
        }
    }
}
