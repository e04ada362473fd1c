//! # Servidor TCP Concurrente
//! src/server/tcp.rs
//!
//! Acepta conexiones y procesa cada una en su propio thread. El thread lee
//! la request, la pasa al [`Container`] y termina: si el handler inició un
//! ciclo async, la conexión sigue abierta y la cierra quien complete el
//! ciclo (un worker, el scanner de timeouts, ...).

use crate::config::Config;
use crate::http::{Request, Response, StatusCode};
use crate::router::Router;
use crate::server::connection::{Connection, TcpConnection};
use crate::server::container::{Container, ContainerConfig};
use std::net::{TcpListener, TcpStream};
use std::sync::Arc;
use std::thread;
use tracing::{debug, error, info, warn};

/// Servidor HTTP/1.0 con soporte de ciclos async
pub struct Server {
    config: Config,
    container: Arc<Container>,
    listener: Option<TcpListener>,
}

impl Server {
    pub fn new(config: Config, router: Router) -> Self {
        let container = Container::new(router, ContainerConfig::from_config(&config));
        Self::with_container(config, container)
    }

    pub fn with_container(config: Config, container: Arc<Container>) -> Self {
        Self {
            config,
            container,
            listener: None,
        }
    }

    pub fn container(&self) -> &Arc<Container> {
        &self.container
    }

    pub fn run(&mut self) -> std::io::Result<()> {
        let address = self.config.address();
        info!(%address, "starting server");

        let listener = TcpListener::bind(&address)?;
        self.serve(listener)
    }

    /// Loop de accept sobre un listener ya abierto
    pub fn serve(&mut self, listener: TcpListener) -> std::io::Result<()> {
        let scanner = self.container.spawn_scanner()?;
        info!(address = %listener.local_addr()?, "server listening (thread per connection)");

        let listener = self.listener.insert(listener);

        for stream in listener.incoming() {
            match stream {
                Ok(stream) => {
                    let container = Arc::clone(&self.container);

                    let peer_addr = stream
                        .peer_addr()
                        .map(|addr| addr.to_string())
                        .unwrap_or_else(|_| "unknown".to_string());
                    debug!(peer = %peer_addr, "connection accepted");

                    let spawned = thread::Builder::new()
                        .name("http-conn".to_string())
                        .spawn(move || {
                            if let Err(e) = Self::handle_connection(stream, container) {
                                warn!(peer = %peer_addr, error = %e, "connection failed");
                            }
                        });

                    if let Err(e) = spawned {
                        error!(error = %e, "could not spawn connection thread");
                    }
                }
                Err(e) => {
                    warn!(error = %e, "accept failed");
                }
            }
        }

        scanner.shutdown();
        self.container.shutdown();
        Ok(())
    }

    /// Lee una request de `stream` y la ejecuta en el contenedor
    pub fn handle_connection(stream: TcpStream, container: Arc<Container>) -> std::io::Result<()> {
        let connection = Arc::new(TcpConnection::new(stream));

        let mut buffer = [0u8; 8192];
        let bytes_read = connection.read_request(&mut buffer)?;

        if bytes_read == 0 {
            debug!("connection closed before sending a request");
            connection.close();
            return Ok(());
        }

        match Request::parse(&buffer[..bytes_read]) {
            Ok(request) => {
                let exchange = container.service(request, connection);
                debug!(
                    request_id = exchange.id(),
                    suspended = !exchange.is_finished(),
                    "request dispatched to container"
                );
            }
            Err(e) => {
                warn!(error = %e, "parse error");
                let response = Response::error(StatusCode::BadRequest, &format!("Invalid: {}", e));
                connection.write(&response.to_bytes())?;
                connection.close();
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod more_server_tests {
    use super::*;
    use std::io::{Read, Write};
    use std::time::Duration;

    fn ephemeral_listener() -> TcpListener {
        TcpListener::bind("127.0.0.1:0").expect("bind")
    }

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

    /// Acepta una conexión y la procesa en un thread aparte
    fn serve_one(listener: TcpListener, container: Arc<Container>) -> thread::JoinHandle<()> {
        thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            Server::handle_connection(stream, container).unwrap();
        })
    }

    fn read_all(mut client: TcpStream) -> String {
        client
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        let mut buf = Vec::new();
        client.read_to_end(&mut buf).unwrap();
        String::from_utf8_lossy(&buf).to_string()
    }

    #[test]
    fn test_handle_connection_sync_ok() {
        let listener = ephemeral_listener();
        let addr = listener.local_addr().unwrap();

        let mut router = Router::new();
        router.register("/help", |exchange| {
            exchange.write("help");
            Ok(())
        });
        let t = serve_one(listener, container(router));

        let mut client = TcpStream::connect(addr).unwrap();
        client.write_all(b"GET /help HTTP/1.0\r\n\r\n").unwrap();
        client.shutdown(std::net::Shutdown::Write).unwrap();

        let text = read_all(client);
        assert!(text.contains("200 OK"));
        assert!(text.contains("X-Request-Id:"));
        assert!(text.contains("Server: RedUnix-Async/1.0"));
        assert!(text.ends_with("help"));

        t.join().unwrap();
    }

    #[test]
    fn test_handle_connection_async_completes_later() {
        let listener = ephemeral_listener();
        let addr = listener.local_addr().unwrap();

        let mut router = Router::new();
        router.register_async("/later", |exchange| {
            let context = exchange.start_async()?;
            let worker = context.clone();
            context.start(move || {
                thread::sleep(Duration::from_millis(50));
                if let Ok(response) = worker.get_response() {
                    response.write("finished later");
                }
                let _ = worker.complete();
            })?;
            Ok(())
        });
        let t = serve_one(listener, container(router));

        // Sin shutdown(Write): un half-close cuenta como desconexión
        let mut client = TcpStream::connect(addr).unwrap();
        client.write_all(b"GET /later HTTP/1.0\r\n\r\n").unwrap();

        // El thread de la conexión termina antes que la respuesta
        t.join().unwrap();

        let text = read_all(client);
        assert!(text.contains("200 OK"));
        assert!(text.ends_with("finished later"));
    }

    #[test]
    fn test_handle_connection_unknown_route() {
        let listener = ephemeral_listener();
        let addr = listener.local_addr().unwrap();
        let t = serve_one(listener, container(Router::new()));

        let mut client = TcpStream::connect(addr).unwrap();
        client.write_all(b"GET /nothing HTTP/1.0\r\n\r\n").unwrap();
        client.shutdown(std::net::Shutdown::Write).unwrap();

        let text = read_all(client);
        assert!(text.contains("404 Not Found"));
        assert!(text.contains("Route not found: /nothing"));

        t.join().unwrap();
    }

    #[test]
    fn test_handle_connection_parse_error() {
        let listener = ephemeral_listener();
        let addr = listener.local_addr().unwrap();
        let t = serve_one(listener, container(Router::new()));

        // Enviar bytes no-HTTP para disparar error de parseo
        let mut client = TcpStream::connect(addr).unwrap();
        client.write_all(b"\x00\x01\x02\x03garbage").unwrap();
        client.shutdown(std::net::Shutdown::Write).unwrap();

        let text = read_all(client);
        assert!(text.contains("400 Bad Request"));
        assert!(text.contains("Invalid:"));

        t.join().unwrap();
    }

    #[test]
    fn test_handle_connection_peer_closed_immediately() {
        let listener = ephemeral_listener();
        let addr = listener.local_addr().unwrap();
        let container = container(Router::new());

        let t = serve_one(listener, Arc::clone(&container));

        // Cliente que conecta y cierra sin mandar datos
        drop(TcpStream::connect(addr).unwrap());

        t.join().unwrap();
        assert_eq!(container.metrics().get_snapshot().total_requests, 0);
    }
}
