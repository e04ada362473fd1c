//! # Módulo HTTP
//! src/http/mod.rs
//!
//! Protocolo HTTP/1.0 escrito a mano:
//!
//! - Parsing de requests y re-targeting para dispatch
//! - Respuestas con buffer y estado de commit
//! - Códigos de estado
//!
//! HTTP/1.0 (RFC 1945) no tiene conexiones persistentes por defecto: cada
//! request usa su propia conexión y el cierre marca el final del body.

pub mod request;
pub mod response;
pub mod status;

pub use request::{attributes, DispatcherType, Method, ParseError, Request};
pub use response::{AlreadyCommitted, Response};
pub use status::StatusCode;
