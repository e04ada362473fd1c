//! # AsyncContext
//! src/lifecycle/context.rs
//!
//! Controlador del ciclo async de una request: es el handle que recibe la
//! aplicación al llamar `Exchange::start_async`. Es barato de clonar y se
//! puede mover a cualquier thread (incluso guardarse para que otra request
//! lo complete).
//!
//! Todas las operaciones pasan primero por la [`AsyncStateMachine`]; sólo
//! si la transición es legal se hace el resto del trabajo.

use crate::error::{AsyncError, ErrorState, Fault, Operation};
use crate::lifecycle::bridge::{self, LifecycleEvent, Pipeline};
use crate::lifecycle::listener::{self, AsyncListener, ListenerEntry, ListenerEvent};
use crate::lifecycle::{AsyncState, AsyncStateMachine};
use crate::server::exchange::{Exchange, RequestId, SuppliedRequest, SuppliedResponse};
use crate::server::pool::Task;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, ThreadId};
use tracing::{debug, warn};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Handle del ciclo async de una request
#[derive(Clone)]
pub struct AsyncContext {
    inner: Arc<ContextInner>,
}

struct ContextInner {
    exchange: Arc<Exchange>,
    pipeline: Arc<dyn Pipeline>,
    machine: AsyncStateMachine,

    /// Timeout del ciclo actual en ms (`<= 0` = deshabilitado)
    timeout_ms: AtomicI64,

    listeners: Mutex<Vec<ListenerEntry>>,

    /// Request/response vigentes en el último `start`
    supplied: Mutex<Option<(SuppliedRequest, SuppliedResponse)>>,
    has_original: AtomicBool,

    dispatch_target: Mutex<Option<String>>,
    error_state: Mutex<Option<ErrorState>>,

    /// `start(work)` pedidos antes de que el hilo original retornara
    pending_work: Mutex<Vec<Task>>,

    /// Hilo que está ejecutando la completación
    completing_thread: Mutex<Option<ThreadId>>,
}

impl AsyncContext {
    pub(crate) fn new(exchange: Arc<Exchange>, pipeline: Arc<dyn Pipeline>) -> Self {
        let timeout_ms = pipeline.default_async_timeout_ms();
        Self {
            inner: Arc::new(ContextInner {
                exchange,
                pipeline,
                machine: AsyncStateMachine::new(),
                timeout_ms: AtomicI64::new(timeout_ms),
                listeners: Mutex::new(Vec::new()),
                supplied: Mutex::new(None),
                has_original: AtomicBool::new(true),
                dispatch_target: Mutex::new(None),
                error_state: Mutex::new(None),
                pending_work: Mutex::new(Vec::new()),
                completing_thread: Mutex::new(None),
            }),
        }
    }

    pub fn request_id(&self) -> RequestId {
        self.inner.exchange.id()
    }

    pub fn state(&self) -> AsyncState {
        self.inner.machine.state()
    }

    /// Número del ciclo actual (1 para el primer `start`)
    pub fn cycle(&self) -> u64 {
        self.inner.machine.cycle()
    }

    pub fn is_async_started(&self) -> bool {
        self.inner.machine.is_async_started()
    }

    pub fn is_async_dispatching(&self) -> bool {
        self.inner.machine.is_async_dispatching()
    }

    pub fn is_async_completing(&self) -> bool {
        self.inner.machine.is_async_completing()
    }

    pub(crate) fn machine(&self) -> &AsyncStateMachine {
        &self.inner.machine
    }

    pub(crate) fn exchange(&self) -> &Arc<Exchange> {
        &self.inner.exchange
    }

    pub(crate) fn pipeline(&self) -> &Arc<dyn Pipeline> {
        &self.inner.pipeline
    }

    /// Comienza un ciclo nuevo (lo llama `Exchange::start_async_with`)
    pub(crate) fn begin_cycle(
        &self,
        request: SuppliedRequest,
        response: SuppliedResponse,
    ) -> Result<(), AsyncError> {
        let cycle = self.inner.machine.async_start()?;

        let has_original = !request.is_wrapper() && !response.is_wrapper();
        *lock(&self.inner.supplied) = Some((request, response));
        self.inner.has_original.store(has_original, Ordering::SeqCst);
        self.inner
            .timeout_ms
            .store(self.inner.pipeline.default_async_timeout_ms(), Ordering::SeqCst);
        lock(&self.inner.error_state).take();
        lock(&self.inner.completing_thread).take();

        // Los listeners del ciclo anterior reciben on_start_async y salen
        // de la lista
        let previous = std::mem::take(&mut *lock(&self.inner.listeners));

        self.inner.pipeline.registry().register(self.clone());
        self.inner.pipeline.record(LifecycleEvent::CycleStarted);
        debug!(request_id = self.request_id(), cycle, "async cycle started");

        if !previous.is_empty() {
            listener::notify(&previous, ListenerEvent::StartAsync, self, None);
        }
        Ok(())
    }

    /// Ejecuta `work` en un worker del contenedor
    ///
    /// Si el hilo que llamó `start_async` todavía no retornó, el trabajo
    /// queda en espera y se envía al pool cuando retorne: `work` nunca
    /// corre en paralelo con el handler original.
    ///
    /// Un panic dentro de `work` se convierte en una falla del ciclo.
    pub fn start<F>(&self, work: F) -> Result<(), AsyncError>
    where
        F: FnOnce() + Send + 'static,
    {
        let task = self.guarded(work);

        // El lock de pending_work se toma antes de leer el estado: el
        // post-proceso cambia de estado y luego vacía esta lista
        let mut pending = lock(&self.inner.pending_work);
        let state = self.inner.machine.state();

        match state {
            AsyncState::Starting
            | AsyncState::MustComplete
            | AsyncState::MustDispatch
            | AsyncState::MustError => {
                pending.push(task);
                debug!(request_id = self.request_id(), "work deferred until processing returns");
                Ok(())
            }
            AsyncState::Started | AsyncState::TimingOut | AsyncState::Error => {
                drop(pending);
                self.inner.pipeline.execute(task)
            }
            _ => Err(AsyncError::illegal(Operation::StartWork, state)),
        }
    }

    /// Envuelve `work` para que un panic termine el ciclo en error en vez de
    /// dejar la conexión colgada
    fn guarded<F>(&self, work: F) -> Task
    where
        F: FnOnce() + Send + 'static,
    {
        let context = self.clone();
        let cycle = self.cycle();

        Box::new(move || {
            if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(work)) {
                let message = Fault::panic_message(payload.as_ref());
                warn!(request_id = context.request_id(), cycle, panic = %message, "async work panicked");

                // Un ciclo posterior no hereda la falla
                if context.cycle() == cycle {
                    context.raise_fault(Fault::Handler(format!("async work panicked: {}", message)));
                }
            }
        })
    }

    pub(crate) fn take_pending_work(&self) -> Vec<Task> {
        std::mem::take(&mut *lock(&self.inner.pending_work))
    }

    /// Re-despacha la request a su URI original
    pub fn dispatch(&self) -> Result<(), AsyncError> {
        self.request_dispatch(None)
    }

    /// Re-despacha la request a `path` (puede incluir query string)
    pub fn dispatch_to(&self, path: &str) -> Result<(), AsyncError> {
        self.request_dispatch(Some(path.to_string()))
    }

    fn request_dispatch(&self, target: Option<String>) -> Result<(), AsyncError> {
        let apply_now = {
            // El destino se escribe con el lock tomado para que el hilo que
            // aplica el dispatch nunca lea un destino viejo
            let mut slot = lock(&self.inner.dispatch_target);
            let apply_now = self.inner.machine.async_dispatch()?;
            debug!(request_id = self.request_id(), target = ?target, apply_now, "dispatch requested");
            *slot = target;
            apply_now
        };

        if apply_now {
            bridge::schedule_dispatch(self);
        }
        Ok(())
    }

    pub(crate) fn take_dispatch_target(&self) -> Option<String> {
        lock(&self.inner.dispatch_target).take()
    }

    /// Termina el ciclo: commit de la respuesta y `on_complete`
    pub fn complete(&self) -> Result<(), AsyncError> {
        let apply_now = self.inner.machine.async_complete()?;
        debug!(request_id = self.request_id(), apply_now, "complete requested");

        if apply_now {
            bridge::complete_cycle(self);
        }
        Ok(())
    }

    /// Cambia el timeout del ciclo actual (`<= 0` lo deshabilita)
    pub fn set_timeout(&self, timeout_ms: i64) -> Result<(), AsyncError> {
        self.inner.machine.check_set_timeout()?;
        self.inner.timeout_ms.store(timeout_ms, Ordering::SeqCst);
        Ok(())
    }

    pub fn timeout(&self) -> i64 {
        self.inner.timeout_ms.load(Ordering::SeqCst)
    }

    /// Registra un listener con la request/response vigentes
    pub fn add_listener(&self, listener: Arc<dyn AsyncListener>) -> Result<(), AsyncError> {
        let (request, response) = lock(&self.inner.supplied)
            .clone()
            .ok_or(AsyncError::Recycled)?;
        self.add_listener_with(listener, request, response)
    }

    /// Registra un listener con request/response explícitas
    pub fn add_listener_with(
        &self,
        listener: Arc<dyn AsyncListener>,
        request: SuppliedRequest,
        response: SuppliedResponse,
    ) -> Result<(), AsyncError> {
        let state = self.state();
        if state == AsyncState::Complete {
            return Err(AsyncError::illegal(Operation::AddListener, state));
        }

        lock(&self.inner.listeners).push(ListenerEntry {
            listener,
            request,
            response,
        });
        Ok(())
    }

    pub fn listener_count(&self) -> usize {
        lock(&self.inner.listeners).len()
    }

    pub(crate) fn listener_entries(&self) -> Vec<ListenerEntry> {
        lock(&self.inner.listeners).clone()
    }

    /// `true` si en el último `start` no se suministraron wrappers
    pub fn has_original_request_and_response(&self) -> bool {
        self.inner.has_original.load(Ordering::SeqCst)
    }

    pub fn get_request(&self) -> Result<SuppliedRequest, AsyncError> {
        self.check_access(Operation::GetRequest)?;
        lock(&self.inner.supplied)
            .as_ref()
            .map(|(request, _)| Arc::clone(request))
            .ok_or(AsyncError::Recycled)
    }

    pub fn get_response(&self) -> Result<SuppliedResponse, AsyncError> {
        self.check_access(Operation::GetResponse)?;
        lock(&self.inner.supplied)
            .as_ref()
            .map(|(_, response)| Arc::clone(response))
            .ok_or(AsyncError::Recycled)
    }

    /// Después de `complete` la request sólo es accesible desde el hilo que
    /// está completando (p. ej. dentro de `on_complete`)
    fn check_access(&self, operation: Operation) -> Result<(), AsyncError> {
        match self.state() {
            AsyncState::Complete => Err(AsyncError::Recycled),
            AsyncState::Completing => {
                let completing = *lock(&self.inner.completing_thread);
                if completing == Some(thread::current().id()) {
                    Ok(())
                } else {
                    Err(AsyncError::illegal(operation, AsyncState::Completing))
                }
            }
            _ => Ok(()),
        }
    }

    pub(crate) fn mark_completing_thread(&self) {
        *lock(&self.inner.completing_thread) = Some(thread::current().id());
    }

    /// Inyecta una falla en el ciclo (handler, I/O, desconexión)
    ///
    /// Si el ciclo no admite la transición a error (ya completando, por
    /// ejemplo) la falla sólo se loguea.
    pub(crate) fn raise_fault(&self, fault: Fault) {
        let (during_async, apply_now) = {
            let mut slot = lock(&self.inner.error_state);
            match self.inner.machine.async_error() {
                Ok((from, apply_now)) => {
                    // Fuera del hilo original: worker, dispatch o scanner
                    let during_async = !matches!(
                        from,
                        AsyncState::Starting | AsyncState::MustComplete | AsyncState::MustDispatch
                    );
                    *slot = Some(ErrorState {
                        fault: fault.clone(),
                        during_async,
                    });
                    (during_async, apply_now)
                }
                Err(err) => {
                    warn!(request_id = self.request_id(), fault = %fault, error = %err, "fault dropped, cycle already resolved");
                    return;
                }
            }
        };

        warn!(
            request_id = self.request_id(),
            fault = %fault,
            during_async,
            apply_now,
            "fault raised in async cycle"
        );
        if apply_now {
            bridge::handle_error(self);
        }
    }

    /// Consume la falla capturada; la segunda llamada retorna `None`
    pub(crate) fn take_error_state(&self) -> Option<ErrorState> {
        lock(&self.inner.error_state).take()
    }

    /// Suelta listeners y request/response suministradas al terminar
    pub(crate) fn recycle(&self) {
        lock(&self.inner.listeners).clear();
        lock(&self.inner.supplied).take();
        lock(&self.inner.pending_work).clear();
    }
}

impl fmt::Debug for AsyncContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AsyncContext")
            .field("request_id", &self.request_id())
            .field("state", &self.state())
            .field("timeout_ms", &self.timeout())
            .finish()
    }
}
