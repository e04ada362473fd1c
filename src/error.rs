//! # Errores del Ciclo Asíncrono
//! src/error.rs
//!
//! Dos familias de errores:
//!
//! - [`AsyncError`]: mal uso de la API (doble `start`, `dispatch` después de
//!   `complete`, acceso a la request ya reciclada...). Siempre se retorna de
//!   forma síncrona al que llamó y nunca se reintenta.
//! - [`Fault`]: fallas capturadas durante un ciclo (handler, listener, I/O,
//!   timeout). Se guardan como el `ErrorState` del ciclo y terminan en una
//!   respuesta de error generada por el contenedor.

use crate::lifecycle::AsyncState;
use std::fmt;
use thiserror::Error;

/// Error genérico que retornan handlers y listeners de la aplicación
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Resultado de un handler de ruta
pub type HandlerResult = Result<(), BoxError>;

/// Operación del controlador que disparó una transición
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Start,
    StartWork,
    Complete,
    Dispatch,
    Timeout,
    ResolveTimeout,
    Error,
    PostProcess,
    BeginDispatch,
    FinishCompletion,
    SetTimeout,
    AddListener,
    GetRequest,
    GetResponse,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Start => "start",
            Operation::StartWork => "start(work)",
            Operation::Complete => "complete",
            Operation::Dispatch => "dispatch",
            Operation::Timeout => "timeout",
            Operation::ResolveTimeout => "resolve_timeout",
            Operation::Error => "error",
            Operation::PostProcess => "post_process",
            Operation::BeginDispatch => "begin_dispatch",
            Operation::FinishCompletion => "finish_completion",
            Operation::SetTimeout => "set_timeout",
            Operation::AddListener => "add_listener",
            Operation::GetRequest => "get_request",
            Operation::GetResponse => "get_response",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errores de uso de la API asíncrona
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AsyncError {
    /// La ruta actual no tiene soporte async habilitado
    #[error("async support is not enabled for route {path}")]
    AsyncNotSupported { path: String },

    /// Transición ilegal para el estado actual
    #[error("illegal call to {operation} in state {state}")]
    IllegalState { operation: Operation, state: AsyncState },

    /// El ciclo ya terminó y la request fue reciclada
    #[error("the request has been recycled: async cycle already complete")]
    Recycled,

    /// El pool de workers rechazó el trabajo
    #[error("work rejected by executor: {reason}")]
    Rejected { reason: String },
}

impl AsyncError {
    pub fn illegal(operation: Operation, state: AsyncState) -> Self {
        AsyncError::IllegalState { operation, state }
    }

    /// Verifica si es un error de estado ilegal (incluye request reciclada)
    pub fn is_illegal_state(&self) -> bool {
        matches!(self, AsyncError::IllegalState { .. } | AsyncError::Recycled)
    }
}

/// Falla capturada durante un ciclo asíncrono
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Fault {
    /// El handler retornó error (o hizo panic)
    #[error("handler failed: {0}")]
    Handler(String),

    /// Un listener falló durante una notificación
    #[error("listener #{index} failed during {event}: {message}")]
    Listener {
        index: usize,
        event: &'static str,
        message: String,
    },

    /// Error de I/O en la conexión (ej: el cliente se desconectó)
    #[error("I/O error ({kind:?}): {message}")]
    Io {
        kind: std::io::ErrorKind,
        message: String,
    },

    /// El ciclo excedió su timeout sin que nadie lo resolviera
    #[error("async cycle timed out after {timeout_ms} ms")]
    Timeout { timeout_ms: i64 },
}

impl Fault {
    pub fn io(err: &std::io::Error) -> Self {
        Fault::Io {
            kind: err.kind(),
            message: err.to_string(),
        }
    }

    /// Convierte el payload de un panic en mensaje legible
    pub fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
        if let Some(s) = payload.downcast_ref::<&str>() {
            s.to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "unknown panic".to_string()
        }
    }
}

/// Falla guardada en el contexto, consumida una sola vez por el motor de
/// notificación
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorState {
    pub fault: Fault,
    /// `true` si la falla ocurrió mientras había un ciclo async en curso
    pub during_async: bool,
}
