//! # Códigos de Estado HTTP
//!
//! src/http/status.rs
//!
//! Este módulo define los códigos de estado HTTP/1.0 que usará el servidor.
//! Según el RFC 1945, HTTP/1.0 define códigos en 5 categorías:
//!
//! - **1xx**: Informacional (no se usan en HTTP/1.0)
//! - **2xx**: Éxito (200 OK)
//! - **3xx**: Redirección (no implementadas por ahora)
//! - **4xx**: Error del cliente (400, 404)
//! - **5xx**: Error del servidor (500, 503)
//!
//! Un 500 es lo que genera el contenedor cuando un ciclo asíncrono termina
//! en error sin que nadie lo resuelva.

/// Representa los códigos de estado HTTP que soporta nuestro servidor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusCode {
    /// 200 OK - La petición fue exitosa
    Ok = 200,
    
    /// 204 No Content - Petición exitosa sin contenido en el body
    NoContent = 204,
    
    /// 400 Bad Request - Parámetros inválidos o malformados
    BadRequest = 400,
    
    /// 404 Not Found - Ruta o recurso no encontrado
    NotFound = 404,
    
    /// 500 Internal Server Error - Error interno del servidor
    InternalServerError = 500,
    
    /// 503 Service Unavailable - El pool de workers rechazó el trabajo
    ServiceUnavailable = 503,
}

impl StatusCode {
    /// Convierte el código a su valor numérico
    /// 
    /// # Ejemplo
    /// ```
    /// use async_http_server::http::StatusCode;
    /// assert_eq!(StatusCode::Ok.as_u16(), 200);
    /// ```
    pub fn as_u16(&self) -> u16 {
        *self as u16
    }

    /// Inverso de [`StatusCode::as_u16`]; `None` para códigos que el
    /// servidor no genera
    ///
    /// # Ejemplo
    /// ```
    /// use async_http_server::http::StatusCode;
    /// assert_eq!(StatusCode::from_u16(404), Some(StatusCode::NotFound));
    /// assert_eq!(StatusCode::from_u16(418), None);
    /// ```
    pub fn from_u16(code: u16) -> Option<Self> {
        match code {
            200 => Some(StatusCode::Ok),
            204 => Some(StatusCode::NoContent),
            400 => Some(StatusCode::BadRequest),
            404 => Some(StatusCode::NotFound),
            500 => Some(StatusCode::InternalServerError),
            503 => Some(StatusCode::ServiceUnavailable),
            _ => None,
        }
    }
    
    /// Retorna el texto de razón (reason phrase) asociado al código
    /// 
    /// Estos textos están definidos en el RFC 1945 y son estándares.
    /// 
    /// # Ejemplo
    /// ```
    /// use async_http_server::http::StatusCode;
    /// assert_eq!(StatusCode::Ok.reason_phrase(), "OK");
    /// assert_eq!(StatusCode::NotFound.reason_phrase(), "Not Found");
    /// ```
    pub fn reason_phrase(&self) -> &'static str {
        match self {
            StatusCode::Ok => "OK",
            StatusCode::NoContent => "No Content",
            StatusCode::BadRequest => "Bad Request",
            StatusCode::NotFound => "Not Found",
            StatusCode::InternalServerError => "Internal Server Error",
            StatusCode::ServiceUnavailable => "Service Unavailable",
        }
    }
    
    /// Verifica si el código indica éxito (2xx)
    /// 
    /// # Ejemplo
    /// ```
    /// use async_http_server::http::StatusCode;
    /// assert!(StatusCode::Ok.is_success());
    /// assert!(StatusCode::NoContent.is_success());
    /// assert!(!StatusCode::NotFound.is_success());
    /// ```
    pub fn is_success(&self) -> bool {
        matches!(self, StatusCode::Ok | StatusCode::NoContent)
    }
    
    /// Verifica si el código indica error del cliente (4xx)
    /// 
    /// # Ejemplo
    /// ```
    /// use async_http_server::http::StatusCode;
    /// assert!(StatusCode::BadRequest.is_client_error());
    /// assert!(!StatusCode::Ok.is_client_error());
    /// ```
    pub fn is_client_error(&self) -> bool {
        let code = self.as_u16();
        (400..500).contains(&code)
    }
    
    /// Verifica si el código indica error del servidor (5xx)
    /// 
    /// # Ejemplo
    /// ```
    /// use async_http_server::http::StatusCode;
    /// assert!(StatusCode::InternalServerError.is_server_error());
    /// assert!(!StatusCode::BadRequest.is_server_error());
    /// ```
    pub fn is_server_error(&self) -> bool {
        let code = self.as_u16();
        (500..600).contains(&code)
    }
}

impl std::fmt::Display for StatusCode {
    /// Formatea el código de estado para mostrarlo
    /// 
    /// Formato: "200 OK"
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.as_u16(), self.reason_phrase())
    }
}
