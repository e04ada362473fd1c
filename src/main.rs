//! # Async HTTP Server - Entry Point
//! src/main.rs
//!
//! Punto de entrada del servidor HTTP/1.0 asíncrono.

use async_http_server::commands;
use async_http_server::config::Config;
use async_http_server::logging;
use async_http_server::metrics::MetricsCollector;
use async_http_server::router::Router;
use async_http_server::server::{Container, ContainerConfig, Server};

fn main() {
    println!("=================================");
    println!("  RedUnix Async HTTP/1.0 Server");
    println!("  Principios de Sistemas Operativos");
    println!("=================================\n");

    // Configuración desde CLI / variables de entorno
    let config = Config::new();

    if let Err(e) = config.validate() {
        eprintln!("❌ Configuración inválida: {}", e);
        std::process::exit(2);
    }

    logging::init(config.log_filter.as_deref());
    config.print_summary();

    let metrics = MetricsCollector::new();
    let mut router = Router::new();
    commands::register_routes(&mut router, &metrics);

    let container = Container::with_metrics(router, ContainerConfig::from_config(&config), metrics);
    let mut server = Server::with_container(config, container);

    // Iniciar el servidor (esto bloqueará el thread)
    if let Err(e) = server.run() {
        tracing::error!(error = %e, "fatal server error");
        eprintln!("💥 Error fatal: {}", e);
        std::process::exit(1);
    }
}
