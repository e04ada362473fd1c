//! # Parsing de Requests HTTP/1.0
//! src/http/request.rs
//!
//! Parser HTTP/1.0 escrito a mano, más el estado que el contenedor le agrega
//! a una request mientras viaja por el pipeline: atributos, el tipo de
//! dispatch actual y el re-targeting que hace un `dispatch` asíncrono.
//!
//! ## Formato de un Request HTTP/1.0
//!
//! ```text
//! GET /path?param1=value1&param2=value2 HTTP/1.0\r\n
//! Host: localhost:8080\r\n
//! \r\n
//! ```

use std::collections::HashMap;
use std::fmt;

/// Métodos HTTP soportados
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    GET,
    HEAD,
    POST,
}

impl Method {
    fn from_str(s: &str) -> Result<Self, ParseError> {
        match s {
            "GET" => Ok(Method::GET),
            "HEAD" => Ok(Method::HEAD),
            "POST" => Ok(Method::POST),
            _ => Err(ParseError::UnsupportedMethod(s.to_string())),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Method::GET => "GET",
            Method::HEAD => "HEAD",
            Method::POST => "POST",
        }
    }
}

/// Cómo llegó la request al handler que la está procesando
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatcherType {
    /// Llamada inicial desde la conexión
    Request,
    /// Re-entrada por `AsyncContext::dispatch`
    Async,
    /// Forward a la página de error del contenedor
    Error,
}

impl DispatcherType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DispatcherType::Request => "REQUEST",
            DispatcherType::Async => "ASYNC",
            DispatcherType::Error => "ERROR",
        }
    }
}

impl fmt::Display for DispatcherType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Nombres de atributos que el contenedor fija en la request
pub mod attributes {
    /// URI original antes del primer dispatch asíncrono
    pub const ASYNC_REQUEST_URI: &str = "async.request_uri";
    /// Query string original antes del primer dispatch asíncrono
    pub const ASYNC_QUERY_STRING: &str = "async.query_string";
    /// Mensaje de la falla que llevó a la página de error
    pub const ERROR_MESSAGE: &str = "error.message";
    /// Código de estado con el que se invocó la página de error
    pub const ERROR_STATUS: &str = "error.status_code";
}

/// Representa un request HTTP/1.0 parseado
#[derive(Debug, Clone)]
pub struct Request {
    method: Method,

    /// Path de la petición, sin query (ej: "/async/sleep")
    path: String,

    /// Query string cruda, sin el '?'
    query_string: String,

    query_params: HashMap<String, String>,
    headers: HashMap<String, String>,
    version: String,
    body: Vec<u8>,

    /// Atributos que agregan el contenedor y los handlers
    attributes: HashMap<String, String>,

    dispatcher_type: DispatcherType,
}

/// Errores que pueden ocurrir durante el parsing
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    IncompleteRequest,
    InvalidRequestLine,
    UnsupportedMethod(String),
    InvalidHttpVersion(String),
    InvalidHeader(String),
    EmptyRequest,
}

impl std::fmt::Display for ParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ParseError::IncompleteRequest => write!(f, "Incomplete HTTP request"),
            ParseError::InvalidRequestLine => write!(f, "Invalid request line format"),
            ParseError::UnsupportedMethod(m) => write!(f, "Unsupported HTTP method: {}", m),
            ParseError::InvalidHttpVersion(v) => write!(f, "Invalid HTTP version: {}", v),
            ParseError::InvalidHeader(h) => write!(f, "Invalid header: {}", h),
            ParseError::EmptyRequest => write!(f, "Empty request"),
        }
    }
}

impl std::error::Error for ParseError {}

impl Request {
    /// Parsea un request HTTP/1.0 desde bytes
    ///
    /// # Ejemplo
    ///
    /// ```
    /// use async_http_server::http::Request;
    ///
    /// let raw = b"GET /async/sleep?ms=10 HTTP/1.0\r\n\r\n";
    /// let request = Request::parse(raw).unwrap();
    ///
    /// assert_eq!(request.path(), "/async/sleep");
    /// assert_eq!(request.query_param("ms"), Some("10"));
    /// ```
    pub fn parse(buffer: &[u8]) -> Result<Self, ParseError> {
        let request_str =
            std::str::from_utf8(buffer).map_err(|_| ParseError::InvalidRequestLine)?;

        if request_str.trim().is_empty() {
            return Err(ParseError::EmptyRequest);
        }

        let lines: Vec<&str> = request_str.split("\r\n").collect();
        if lines.is_empty() {
            return Err(ParseError::IncompleteRequest);
        }

        // 1. Request line
        let (method, target, version) = Self::parse_request_line(lines[0])?;

        // 2. Headers hasta la línea vacía
        let headers = Self::parse_headers(&lines[1..])?;

        // 3. Body (solo POST)
        let body = Self::parse_body(&lines, method);

        let mut request = Request {
            method,
            path: String::new(),
            query_string: String::new(),
            query_params: HashMap::new(),
            headers,
            version,
            body,
            attributes: HashMap::new(),
            dispatcher_type: DispatcherType::Request,
        };
        request.set_target(&target);
        Ok(request)
    }

    /// Construye una request GET sin pasar por el parser
    pub fn get(target: &str) -> Self {
        let mut request = Request {
            method: Method::GET,
            path: String::new(),
            query_string: String::new(),
            query_params: HashMap::new(),
            headers: HashMap::new(),
            version: "HTTP/1.0".to_string(),
            body: Vec::new(),
            attributes: HashMap::new(),
            dispatcher_type: DispatcherType::Request,
        };
        request.set_target(target);
        request
    }

    fn parse_request_line(line: &str) -> Result<(Method, String, String), ParseError> {
        let parts: Vec<&str> = line.split_whitespace().collect();

        // METHOD PATH VERSION
        if parts.len() != 3 {
            return Err(ParseError::InvalidRequestLine);
        }

        let method = Method::from_str(parts[0])?;

        let version = parts[2].to_string();
        if version != "HTTP/1.0" && version != "HTTP/1.1" {
            return Err(ParseError::InvalidHttpVersion(version));
        }

        Ok((method, parts[1].to_string(), version))
    }

    /// Parsea una query string en un HashMap
    ///
    /// Ejemplo: "ms=10&target=/done" → {"ms": "10", "target": "/done"}
    fn parse_query_string(query: &str) -> HashMap<String, String> {
        let mut params = HashMap::new();

        for param in query.split('&') {
            if param.is_empty() {
                continue;
            }

            if let Some(eq_pos) = param.find('=') {
                let key = &param[..eq_pos];
                let value = &param[eq_pos + 1..];
                params.insert(key.to_string(), Self::url_decode(value));
            } else {
                // Parámetro sin valor (ej: "?debug")
                params.insert(param.to_string(), String::new());
            }
        }

        params
    }

    /// URL decode básico: `%20` y `+` como espacio, `%2F` como '/'
    fn url_decode(s: &str) -> String {
        s.replace("%20", " ")
            .replace('+', " ")
            .replace("%2F", "/")
            .replace("%2f", "/")
    }

    fn parse_headers(lines: &[&str]) -> Result<HashMap<String, String>, ParseError> {
        let mut headers = HashMap::new();

        for line in lines {
            if line.trim().is_empty() {
                break;
            }

            if let Some(colon_pos) = line.find(':') {
                let name = line[..colon_pos].trim().to_string();
                let value = line[colon_pos + 1..].trim().to_string();
                headers.insert(name, value);
            } else {
                return Err(ParseError::InvalidHeader(line.to_string()));
            }
        }

        Ok(headers)
    }

    fn parse_body(lines: &[&str], method: Method) -> Vec<u8> {
        if method != Method::POST {
            return Vec::new();
        }

        let body_start = lines
            .iter()
            .position(|line| line.trim().is_empty())
            .map(|i| i + 1)
            .unwrap_or(lines.len());

        if body_start < lines.len() {
            lines[body_start..].join("\r\n").into_bytes()
        } else {
            Vec::new()
        }
    }

    // === Re-targeting (dispatch) ===

    /// Cambia el path y la query de la request
    ///
    /// `target` puede traer query: `"/stage?iter=2"`.
    pub fn set_target(&mut self, target: &str) {
        match target.find('?') {
            Some(query_start) => {
                self.path = target[..query_start].to_string();
                self.query_string = target[query_start + 1..].to_string();
            }
            None => {
                self.path = target.to_string();
                self.query_string.clear();
            }
        }
        self.query_params = Self::parse_query_string(&self.query_string);
    }

    /// URI completa (path + query) tal como la ve el handler actual
    pub fn uri(&self) -> String {
        if self.query_string.is_empty() {
            self.path.clone()
        } else {
            format!("{}?{}", self.path, self.query_string)
        }
    }

    // === Accesores ===

    pub fn method(&self) -> Method {
        self.method
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn query_string(&self) -> &str {
        &self.query_string
    }

    pub fn query_params(&self) -> &HashMap<String, String> {
        &self.query_params
    }

    pub fn query_param(&self, name: &str) -> Option<&str> {
        self.query_params.get(name).map(|s| s.as_str())
    }

    pub fn headers(&self) -> &HashMap<String, String> {
        &self.headers
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(|s| s.as_str())
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    pub fn attribute(&self, name: &str) -> Option<&str> {
        self.attributes.get(name).map(|s| s.as_str())
    }

    pub fn set_attribute(&mut self, name: &str, value: &str) {
        self.attributes.insert(name.to_string(), value.to_string());
    }

    pub fn remove_attribute(&mut self, name: &str) -> Option<String> {
        self.attributes.remove(name)
    }

    pub fn dispatcher_type(&self) -> DispatcherType {
        self.dispatcher_type
    }

    pub fn set_dispatcher_type(&mut self, dispatcher_type: DispatcherType) {
        self.dispatcher_type = dispatcher_type;
    }
}
