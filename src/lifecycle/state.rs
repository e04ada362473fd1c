//! # Máquina de Estados del Ciclo Asíncrono
//! src/lifecycle/state.rs
//!
//! Fuente única de verdad sobre la fase en que está el ciclo async de una
//! request. Toda operación pública del controlador pasa primero por aquí:
//! el mutex interno es el único punto de serialización, así que dos
//! `complete()` concurrentes compiten de forma segura (uno gana la
//! transición, el otro recibe `IllegalState`).
//!
//! ## Transiciones
//!
//! ```text
//! DISPATCHED ──start──> STARTING ──post_process──> STARTED
//!                          │                          │
//!              complete/dispatch (inline)     complete/dispatch/timeout
//!                          v                          v
//!              MUST_COMPLETE / MUST_DISPATCH   COMPLETING / DISPATCHING / TIMING_OUT
//!                          │ post_process             │
//!                          v                          v
//!                COMPLETING / DISPATCHING   COMPLETE / DISPATCHED_ASYNC
//! ```
//!
//! Las transiciones son una función total de (estado, operación): cualquier
//! par no listado en [`transition`] es un error de programación y se reporta
//! como `IllegalState`, nunca se ignora en silencio.

use crate::error::{AsyncError, Operation};
use serde::Serialize;
use std::fmt;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

/// Fases del ciclo de vida asíncrono de una request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AsyncState {
    /// Sin async en curso (inicial para requests síncronas)
    Dispatched,

    /// `start()` llamado, el hilo original todavía no retorna
    Starting,

    /// El hilo original ya devolvió el control al servidor
    Started,

    /// `complete()` llamado inline, se aplica cuando el hilo original retorna
    MustComplete,

    /// Completando: commit de la respuesta y `onComplete`
    Completing,

    /// Terminado, la request puede reciclarse
    Complete,

    /// `dispatch()` llamado inline, se aplica cuando el hilo original retorna
    MustDispatch,

    /// Dispatch aplicado, esperando reentrar al pipeline
    Dispatching,

    /// El pipeline está procesando el destino del dispatch
    DispatchedAsync,

    /// El scanner disparó el timeout y se notifica `onTimeout`
    TimingOut,

    /// Falla en el hilo de procesamiento, se aplica cuando retorna
    MustError,

    /// Falla aplicada, se notifica `onError`
    Error,
}

impl AsyncState {
    pub fn as_str(&self) -> &'static str {
        match self {
            AsyncState::Dispatched => "DISPATCHED",
            AsyncState::Starting => "STARTING",
            AsyncState::Started => "STARTED",
            AsyncState::MustComplete => "MUST_COMPLETE",
            AsyncState::Completing => "COMPLETING",
            AsyncState::Complete => "COMPLETE",
            AsyncState::MustDispatch => "MUST_DISPATCH",
            AsyncState::Dispatching => "DISPATCHING",
            AsyncState::DispatchedAsync => "DISPATCHED_ASYNC",
            AsyncState::TimingOut => "TIMING_OUT",
            AsyncState::MustError => "MUST_ERROR",
            AsyncState::Error => "ERROR",
        }
    }

    /// Hay un ciclo async en efecto
    pub fn is_async(&self) -> bool {
        !matches!(
            self,
            AsyncState::Dispatched | AsyncState::DispatchedAsync | AsyncState::Complete
        )
    }

    /// Equivalente a `isAsyncStarted()`: el ciclo sigue abierto y nadie lo
    /// resolvió todavía (o lo resolvió inline y aún no se aplica)
    pub fn is_started(&self) -> bool {
        matches!(
            self,
            AsyncState::Starting
                | AsyncState::Started
                | AsyncState::MustComplete
                | AsyncState::MustDispatch
                | AsyncState::TimingOut
                | AsyncState::MustError
                | AsyncState::Error
        )
    }

    pub fn is_completing(&self) -> bool {
        matches!(self, AsyncState::MustComplete | AsyncState::Completing)
    }

    pub fn is_dispatching(&self) -> bool {
        matches!(self, AsyncState::MustDispatch | AsyncState::Dispatching)
    }
}

impl fmt::Display for AsyncState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Tabla de transiciones: `None` significa par ilegal
pub fn transition(state: AsyncState, operation: Operation) -> Option<AsyncState> {
    use AsyncState::*;

    match (operation, state) {
        (Operation::Start, Dispatched | DispatchedAsync) => Some(Starting),

        (Operation::Complete, Starting) => Some(MustComplete),
        (Operation::Complete, Started | TimingOut | Error) => Some(Completing),

        (Operation::Dispatch, Starting) => Some(MustDispatch),
        (Operation::Dispatch, Started | TimingOut | Error) => Some(Dispatching),

        (Operation::Timeout, Started) => Some(TimingOut),
        (Operation::ResolveTimeout, TimingOut) => Some(Error),

        (Operation::Error, Starting | MustComplete | MustDispatch | DispatchedAsync) => Some(MustError),
        (Operation::Error, Started | TimingOut) => Some(Error),

        (Operation::PostProcess, Dispatched) => Some(Dispatched),
        (Operation::PostProcess, Starting) => Some(Started),
        (Operation::PostProcess, MustComplete | DispatchedAsync) => Some(Completing),
        (Operation::PostProcess, MustDispatch) => Some(Dispatching),
        (Operation::PostProcess, MustError) => Some(Error),

        (Operation::BeginDispatch, Dispatching) => Some(DispatchedAsync),
        (Operation::FinishCompletion, Completing) => Some(Complete),

        _ => None,
    }
}

/// Qué debe hacer el pipeline cuando el hilo de procesamiento retorna
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PostAction {
    /// Request síncrona, nada que diferir
    None,
    /// El ciclo queda suspendido esperando otro hilo (registrar timeout)
    Suspend,
    /// Completar la respuesta
    Complete,
    /// Reentrar al pipeline con el destino del dispatch
    Dispatch,
    /// Notificar `onError` y generar la respuesta de error
    Error,
}

/// Datos protegidos por el mutex de la máquina
#[derive(Debug)]
struct MachineData {
    state: AsyncState,
    /// Número de ciclo (se incrementa con cada `start()`)
    cycle: u64,
    /// Momento en que el ciclo entró a STARTED
    started_at: Option<Instant>,
}

/// Máquina de estados protegida por un mutex
#[derive(Debug)]
pub struct AsyncStateMachine {
    inner: Mutex<MachineData>,
}

impl AsyncStateMachine {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(MachineData {
                state: AsyncState::Dispatched,
                cycle: 0,
                started_at: None,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, MachineData> {
        // Cada sección crítica es una asignación simple: el estado sigue
        // siendo consistente aunque otro hilo haya hecho panic
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Aplica una operación bajo el lock
    fn apply(&self, operation: Operation) -> Result<(AsyncState, AsyncState), AsyncError> {
        let mut data = self.lock();
        let from = data.state;
        let to = transition(from, operation).ok_or_else(|| AsyncError::illegal(operation, from))?;
        data.state = to;
        Ok((from, to))
    }

    /// Estado actual
    pub fn state(&self) -> AsyncState {
        self.lock().state
    }

    /// Número del ciclo actual (0 si nunca se llamó `start()`)
    pub fn cycle(&self) -> u64 {
        self.lock().cycle
    }

    /// Momento en que el ciclo actual entró a STARTED
    pub fn started_at(&self) -> Option<Instant> {
        self.lock().started_at
    }

    pub fn is_async_started(&self) -> bool {
        self.state().is_started()
    }

    pub fn is_async_dispatching(&self) -> bool {
        self.state().is_dispatching()
    }

    pub fn is_async_completing(&self) -> bool {
        self.state().is_completing()
    }

    /// `start()`: DISPATCHED | DISPATCHED_ASYNC → STARTING
    ///
    /// Retorna el número del nuevo ciclo.
    pub fn async_start(&self) -> Result<u64, AsyncError> {
        let mut data = self.lock();
        let from = data.state;
        let to = transition(from, Operation::Start)
            .ok_or_else(|| AsyncError::illegal(Operation::Start, from))?;
        data.state = to;
        data.cycle += 1;
        data.started_at = None;
        Ok(data.cycle)
    }

    /// `complete()`: retorna `true` si la completación debe aplicarse ya
    /// (llamada desde otro hilo), `false` si queda diferida hasta que el
    /// hilo original retorne
    pub fn async_complete(&self) -> Result<bool, AsyncError> {
        let (_, to) = self.apply(Operation::Complete)?;
        Ok(to == AsyncState::Completing)
    }

    /// `dispatch()`: igual que [`async_complete`](Self::async_complete)
    pub fn async_dispatch(&self) -> Result<bool, AsyncError> {
        let (_, to) = self.apply(Operation::Dispatch)?;
        Ok(to == AsyncState::Dispatching)
    }

    /// Falla durante el ciclo: retorna el estado previo y `true` si el
    /// manejo del error debe hacerse ya (hilo externo), `false` si lo
    /// aplicará el post-proceso
    ///
    /// Un `complete()`/`dispatch()` inline todavía no aplicado queda
    /// reemplazado por el error.
    pub fn async_error(&self) -> Result<(AsyncState, bool), AsyncError> {
        let (from, to) = self.apply(Operation::Error)?;
        Ok((from, to == AsyncState::Error))
    }

    /// Verifica el deadline y dispara STARTED → TIMING_OUT si expiró.
    ///
    /// Retorna `Ok(false)` si el timeout está deshabilitado (`<= 0`) o no
    /// ha expirado; `Err` si el ciclo ya no está en STARTED.
    pub fn async_timeout(&self, now: Instant, timeout_ms: i64) -> Result<bool, AsyncError> {
        let mut data = self.lock();
        if data.state != AsyncState::Started {
            return Err(AsyncError::illegal(Operation::Timeout, data.state));
        }
        if timeout_ms <= 0 {
            return Ok(false);
        }
        let Some(started_at) = data.started_at else {
            return Ok(false);
        };
        let elapsed = now.saturating_duration_since(started_at);
        if elapsed <= Duration::from_millis(timeout_ms as u64) {
            return Ok(false);
        }
        data.state = AsyncState::TimingOut;
        Ok(true)
    }

    /// Nadie resolvió el timeout: TIMING_OUT → ERROR.
    ///
    /// Retorna `false` si un listener ya llamó `complete()`/`dispatch()`.
    pub fn resolve_timeout(&self) -> bool {
        self.apply(Operation::ResolveTimeout).is_ok()
    }

    /// Evento "el hilo de procesamiento está retornando": aplica la mitad
    /// diferida de la transición
    pub fn post_process(&self) -> Result<PostAction, AsyncError> {
        let mut data = self.lock();
        let from = data.state;
        let to = transition(from, Operation::PostProcess)
            .ok_or_else(|| AsyncError::illegal(Operation::PostProcess, from))?;
        data.state = to;

        let action = match (from, to) {
            (AsyncState::Starting, AsyncState::Started) => {
                // El deadline cuenta desde que el control vuelve al servidor
                data.started_at = Some(Instant::now());
                PostAction::Suspend
            }
            (_, AsyncState::Completing) => PostAction::Complete,
            (_, AsyncState::Dispatching) => PostAction::Dispatch,
            (_, AsyncState::Error) => PostAction::Error,
            _ => PostAction::None,
        };
        Ok(action)
    }

    /// DISPATCHING → DISPATCHED_ASYNC, justo antes de reentrar al pipeline
    pub fn begin_dispatch(&self) -> Result<(), AsyncError> {
        self.apply(Operation::BeginDispatch).map(|_| ())
    }

    /// COMPLETING → COMPLETE
    pub fn finish_completion(&self) -> Result<(), AsyncError> {
        self.apply(Operation::FinishCompletion).map(|_| ())
    }

    /// `setTimeout` sólo es legal antes de que el deadline haya disparado
    pub fn check_set_timeout(&self) -> Result<(), AsyncError> {
        let state = self.state();
        match state {
            AsyncState::TimingOut
            | AsyncState::Completing
            | AsyncState::Complete
            | AsyncState::Error
            | AsyncState::MustError
            | AsyncState::Dispatching => Err(AsyncError::illegal(Operation::SetTimeout, state)),
            _ => Ok(()),
        }
    }
}

impl Default for AsyncStateMachine {
    fn default() -> Self {
        Self::new()
    }
}
