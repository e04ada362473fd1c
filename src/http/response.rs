//! # Respuestas HTTP con buffer
//! src/http/response.rs
//!
//! A diferencia de una respuesta que se arma completa y se envía una vez,
//! en un ciclo asíncrono la respuesta vive mientras dure la request: varios
//! threads escriben en ella, se puede hacer flush parcial y recién al
//! `complete` se cierra. Por eso `Response` es un buffer mutable que sabe si
//! ya fue *committed* (status line y headers enviados al socket).
//!
//! ## Formato HTTP/1.0
//!
//! ```text
//! HTTP/1.0 200 OK\r\n
//! Content-Type: application/json\r\n
//! Content-Length: 13\r\n
//! \r\n
//! {"ok": true}
//! ```
//!
//! Si la respuesta se hace commit antes del final (flush parcial) no se
//! envía `Content-Length`: en HTTP/1.0 el cierre de la conexión delimita el
//! body.
//!
//! ## Ejemplo de uso
//!
//! ```
//! use async_http_server::http::{Response, StatusCode};
//!
//! let response = Response::new(StatusCode::Ok)
//!     .with_header("Content-Type", "application/json")
//!     .with_body(r#"{"message": "Hello"}"#);
//!
//! let bytes = response.to_bytes();
//! assert!(bytes.starts_with(b"HTTP/1.0 200 OK\r\n"));
//! ```

use super::StatusCode;
use std::collections::HashMap;
use std::fmt;

/// Se intentó modificar status/headers de una respuesta ya enviada
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AlreadyCommitted;

impl fmt::Display for AlreadyCommitted {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "response already committed")
    }
}

impl std::error::Error for AlreadyCommitted {}

/// Representa una respuesta HTTP/1.0 en construcción
#[derive(Debug, Clone)]
pub struct Response {
    status: StatusCode,

    /// Usamos HashMap para evitar duplicados
    headers: HashMap<String, String>,

    /// Bytes del body aún no enviados
    body: Vec<u8>,

    /// `true` una vez que status line y headers salieron al socket
    committed: bool,

    /// Total de bytes de body enviados
    bytes_sent: usize,

    /// `true` si alguien llamó `send_error`
    error_reported: bool,
}

impl Response {
    /// Crea una nueva respuesta sin headers ni body
    pub fn new(status: StatusCode) -> Self {
        Self {
            status,
            headers: HashMap::new(),
            body: Vec::new(),
            committed: false,
            bytes_sent: 0,
            error_reported: false,
        }
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.add_header(name, value);
        self
    }

    /// Agrega un header; si ya existe se sobrescribe
    pub fn add_header(&mut self, name: &str, value: &str) {
        self.headers.insert(name.to_string(), value.to_string());
    }

    pub fn with_body(mut self, body: &str) -> Self {
        self.body = body.as_bytes().to_vec();
        self
    }

    /// Crea una respuesta JSON exitosa (200 OK)
    pub fn json(body: &str) -> Self {
        Self::new(StatusCode::Ok)
            .with_header("Content-Type", "application/json")
            .with_body(body)
    }

    /// Crea una respuesta de error con formato `{"error": "mensaje"}`
    pub fn error(status: StatusCode, message: &str) -> Self {
        let mut response = Self::new(status);
        response.fill_error(status, message);
        response
    }

    fn fill_error(&mut self, status: StatusCode, message: &str) {
        let body = serde_json::json!({ "error": message, "status": status.as_u16() });
        self.status = status;
        self.headers.clear();
        self.add_header("Content-Type", "application/json");
        self.body = body.to_string().into_bytes();
    }

    // === API mutable usada por el contenedor ===

    pub fn set_status(&mut self, status: StatusCode) -> Result<(), AlreadyCommitted> {
        if self.committed {
            return Err(AlreadyCommitted);
        }
        self.status = status;
        Ok(())
    }

    pub fn set_header(&mut self, name: &str, value: &str) -> Result<(), AlreadyCommitted> {
        if self.committed {
            return Err(AlreadyCommitted);
        }
        self.add_header(name, value);
        Ok(())
    }

    /// Agrega texto al body pendiente
    pub fn write_str(&mut self, chunk: &str) {
        self.body.extend_from_slice(chunk.as_bytes());
    }

    /// Descarta status, headers y body pendientes
    pub fn reset(&mut self) -> Result<(), AlreadyCommitted> {
        if self.committed {
            return Err(AlreadyCommitted);
        }
        self.status = StatusCode::Ok;
        self.headers.clear();
        self.body.clear();
        self.error_reported = false;
        Ok(())
    }

    /// Reemplaza la respuesta por una página de error
    ///
    /// Falla si la respuesta ya fue committed: en ese caso el status que
    /// llegó al cliente no se puede cambiar.
    pub fn send_error(&mut self, status: StatusCode, message: &str) -> Result<(), AlreadyCommitted> {
        if self.committed {
            return Err(AlreadyCommitted);
        }
        self.fill_error(status, message);
        self.error_reported = true;
        Ok(())
    }

    /// Saca los bytes que hay que escribir al socket
    ///
    /// La primera llamada hace commit. Con `last = true` y sin commit previo
    /// se genera la respuesta completa con `Content-Length`.
    pub fn take_output(&mut self, last: bool) -> Vec<u8> {
        let body = std::mem::take(&mut self.body);
        self.bytes_sent += body.len();

        if self.committed {
            return body;
        }
        self.committed = true;

        if last {
            self.headers
                .insert("Content-Length".to_string(), body.len().to_string());
        }

        let mut output = self.head_bytes();
        output.extend_from_slice(&body);
        output
    }

    fn head_bytes(&self) -> Vec<u8> {
        let mut result = Vec::new();

        // Status line: HTTP/1.0 200 OK\r\n
        result.extend_from_slice(format!("HTTP/1.0 {}\r\n", self.status).as_bytes());

        let mut names: Vec<&String> = self.headers.keys().collect();
        names.sort();
        for name in names {
            let header_line = format!("{}: {}\r\n", name, self.headers[name]);
            result.extend_from_slice(header_line.as_bytes());
        }

        // Línea vacía que separa headers del body
        result.extend_from_slice(b"\r\n");
        result
    }

    /// Convierte una respuesta no enviada a bytes (formato completo)
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut copy = self.clone();
        copy.committed = false;
        copy.take_output(true)
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn headers(&self) -> &HashMap<String, String> {
        &self.headers
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(|s| s.as_str())
    }

    /// Body pendiente (lo que todavía no se envió)
    pub fn body(&self) -> &[u8] {
        &self.body
    }

    pub fn is_committed(&self) -> bool {
        self.committed
    }

    pub fn is_error_reported(&self) -> bool {
        self.error_reported
    }

    pub fn bytes_sent(&self) -> usize {
        self.bytes_sent
    }
}

impl Default for Response {
    fn default() -> Self {
        Self::new(StatusCode::Ok)
    }
}
