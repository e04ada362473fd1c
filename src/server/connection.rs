//! # Conexiones
//! src/server/connection.rs
//!
//! El contenedor no escribe directo al `TcpStream`: pasa por el trait
//! [`Connection`], que además permite preguntar si el cliente se fue. Un
//! ciclo asíncrono puede quedar suspendido mucho tiempo sin leer ni escribir,
//! así que el scanner usa `is_closed` para detectar desconexiones.
//!
//! [`MemoryConnection`] guarda la salida en memoria; la usan los tests y
//! cualquiera que quiera manejar el contenedor sin sockets.

use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

/// Transporte de una request
pub trait Connection: Send + Sync {
    /// Escribe bytes al cliente
    fn write(&self, bytes: &[u8]) -> io::Result<()>;

    fn flush(&self) -> io::Result<()>;

    /// Cierra la conexión (fin de la respuesta)
    fn close(&self);

    /// `true` si la conexión ya se cerró o el cliente se desconectó
    fn is_closed(&self) -> bool;

    fn peer_addr(&self) -> String {
        "unknown".to_string()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Conexión TCP real
pub struct TcpConnection {
    stream: Mutex<TcpStream>,
    closed: AtomicBool,
    peer: String,
}

impl TcpConnection {
    pub fn new(stream: TcpStream) -> Self {
        let peer = stream
            .peer_addr()
            .map(|addr| addr.to_string())
            .unwrap_or_else(|_| "unknown".to_string());

        Self {
            stream: Mutex::new(stream),
            closed: AtomicBool::new(false),
            peer,
        }
    }

    /// Lee el request crudo (una sola lectura, como HTTP/1.0 simple)
    pub fn read_request(&self, buffer: &mut [u8]) -> io::Result<usize> {
        lock(&self.stream).read(buffer)
    }

    /// Mira el socket sin consumir datos: EOF o error significa que el
    /// cliente se fue
    fn probe_disconnected(stream: &TcpStream) -> bool {
        if stream.set_nonblocking(true).is_err() {
            return true;
        }
        let mut byte = [0u8; 1];
        let gone = match stream.peek(&mut byte) {
            Ok(0) => true,
            Ok(_) => false,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => false,
            Err(_) => true,
        };
        let _ = stream.set_nonblocking(false);
        gone
    }
}

impl Connection for TcpConnection {
    fn write(&self, bytes: &[u8]) -> io::Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "connection closed"));
        }
        lock(&self.stream).write_all(bytes)
    }

    fn flush(&self) -> io::Result<()> {
        lock(&self.stream).flush()
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let mut stream = lock(&self.stream);
        let _ = stream.flush();
        let _ = stream.shutdown(Shutdown::Both);
    }

    fn is_closed(&self) -> bool {
        if self.closed.load(Ordering::SeqCst) {
            return true;
        }
        let stream = lock(&self.stream);
        Self::probe_disconnected(&stream)
    }

    fn peer_addr(&self) -> String {
        self.peer.clone()
    }
}

#[derive(Default)]
struct MemoryState {
    output: Vec<u8>,
    closed: bool,
}

/// Conexión en memoria
///
/// `disconnect` simula que el cliente cortó: las escrituras siguientes
/// fallan con `BrokenPipe` y `is_closed` pasa a `true`.
#[derive(Default)]
pub struct MemoryConnection {
    state: Mutex<MemoryState>,
    condvar: Condvar,
    peer_gone: AtomicBool,
}

impl MemoryConnection {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simula una desconexión abrupta del cliente
    pub fn disconnect(&self) {
        self.peer_gone.store(true, Ordering::SeqCst);
    }

    /// Lo escrito hasta ahora
    pub fn output(&self) -> String {
        String::from_utf8_lossy(&lock(&self.state).output).into_owned()
    }

    /// `true` si el contenedor ya cerró la conexión
    pub fn is_finished(&self) -> bool {
        lock(&self.state).closed
    }

    /// Espera a que el contenedor cierre la conexión y retorna la respuesta
    ///
    /// Retorna `None` si pasa `timeout` sin cierre.
    pub fn wait_closed(&self, timeout: Duration) -> Option<String> {
        let deadline = Instant::now() + timeout;
        let mut state = lock(&self.state);

        while !state.closed {
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            state = self
                .condvar
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }

        Some(String::from_utf8_lossy(&state.output).into_owned())
    }
}

impl Connection for MemoryConnection {
    fn write(&self, bytes: &[u8]) -> io::Result<()> {
        if self.peer_gone.load(Ordering::SeqCst) {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "client disconnected"));
        }
        let mut state = lock(&self.state);
        if state.closed {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "connection closed"));
        }
        state.output.extend_from_slice(bytes);
        Ok(())
    }

    fn flush(&self) -> io::Result<()> {
        if self.peer_gone.load(Ordering::SeqCst) {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "client disconnected"));
        }
        Ok(())
    }

    fn close(&self) {
        let mut state = lock(&self.state);
        state.closed = true;
        self.condvar.notify_all();
    }

    fn is_closed(&self) -> bool {
        self.peer_gone.load(Ordering::SeqCst) || lock(&self.state).closed
    }

    fn peer_addr(&self) -> String {
        "memory".to_string()
    }
}
