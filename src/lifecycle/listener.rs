//! # Notificación de Listeners
//! src/lifecycle/listener.rs
//!
//! Los listeners se guardan como (listener, request, response): la
//! request/response que estaban vigentes al registrarlo, que es lo que el
//! listener ve en su [`AsyncEvent`].
//!
//! Cada llamada corre aislada: un error retornado o un panic se loguea y se
//! sigue con el resto. La primera falla queda en el [`NotifyOutcome`].

use crate::error::{BoxError, Fault};
use crate::lifecycle::bridge::LifecycleEvent;
use crate::lifecycle::AsyncContext;
use crate::server::exchange::{SuppliedRequest, SuppliedResponse};
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use tracing::warn;

/// Resultado de un callback de listener
pub type ListenerResult = Result<(), BoxError>;

/// Observador del ciclo async
///
/// Todos los métodos tienen implementación vacía; se sobrescriben los que
/// interesan.
pub trait AsyncListener: Send + Sync {
    /// Empezó un ciclo nuevo. El listener ya fue removido de la lista: si
    /// quiere seguir recibiendo eventos debe volver a registrarse aquí.
    fn on_start_async(&self, _event: &AsyncEvent) -> ListenerResult {
        Ok(())
    }

    fn on_complete(&self, _event: &AsyncEvent) -> ListenerResult {
        Ok(())
    }

    fn on_timeout(&self, _event: &AsyncEvent) -> ListenerResult {
        Ok(())
    }

    fn on_error(&self, _event: &AsyncEvent) -> ListenerResult {
        Ok(())
    }
}

/// Evento entregado a un listener
#[derive(Clone)]
pub struct AsyncEvent {
    context: AsyncContext,
    request: SuppliedRequest,
    response: SuppliedResponse,
    fault: Option<Fault>,
}

impl AsyncEvent {
    pub fn async_context(&self) -> &AsyncContext {
        &self.context
    }

    pub fn supplied_request(&self) -> &SuppliedRequest {
        &self.request
    }

    pub fn supplied_response(&self) -> &SuppliedResponse {
        &self.response
    }

    /// Falla que causó `on_error` (None en los demás eventos)
    pub fn fault(&self) -> Option<&Fault> {
        self.fault.as_ref()
    }
}

impl fmt::Debug for AsyncEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AsyncEvent")
            .field("request_id", &self.context.request_id())
            .field("fault", &self.fault)
            .finish()
    }
}

/// Tipo de notificación
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerEvent {
    StartAsync,
    Complete,
    Timeout,
    Error,
}

impl ListenerEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            ListenerEvent::StartAsync => "on_start_async",
            ListenerEvent::Complete => "on_complete",
            ListenerEvent::Timeout => "on_timeout",
            ListenerEvent::Error => "on_error",
        }
    }
}

/// Listener registrado junto con la request/response que observa
#[derive(Clone)]
pub(crate) struct ListenerEntry {
    pub(crate) listener: Arc<dyn AsyncListener>,
    pub(crate) request: SuppliedRequest,
    pub(crate) response: SuppliedResponse,
}

/// Resultado de una pasada de notificación
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct NotifyOutcome {
    pub notified: usize,
    pub faults: usize,
    pub first_fault: Option<Fault>,
}

/// Notifica `event` a cada entrada, en orden de registro
///
/// Se llama sin locks tomados: los listeners pueden llamar `complete()`,
/// `dispatch()` o `add_listener()` sobre el mismo contexto.
pub(crate) fn notify(
    entries: &[ListenerEntry],
    event: ListenerEvent,
    context: &AsyncContext,
    fault: Option<&Fault>,
) -> NotifyOutcome {
    let mut outcome = NotifyOutcome::default();

    for (index, entry) in entries.iter().enumerate() {
        let async_event = AsyncEvent {
            context: context.clone(),
            request: Arc::clone(&entry.request),
            response: Arc::clone(&entry.response),
            fault: fault.cloned(),
        };
        let listener = &entry.listener;

        let result = panic::catch_unwind(AssertUnwindSafe(|| match event {
            ListenerEvent::StartAsync => listener.on_start_async(&async_event),
            ListenerEvent::Complete => listener.on_complete(&async_event),
            ListenerEvent::Timeout => listener.on_timeout(&async_event),
            ListenerEvent::Error => listener.on_error(&async_event),
        }));
        outcome.notified += 1;

        let message = match result {
            Ok(Ok(())) => continue,
            Ok(Err(err)) => err.to_string(),
            Err(payload) => format!("panic: {}", Fault::panic_message(payload.as_ref())),
        };

        warn!(
            request_id = context.request_id(),
            listener = index,
            event = event.as_str(),
            error = %message,
            "listener failed"
        );
        context.pipeline().record(LifecycleEvent::ListenerFault);

        outcome.faults += 1;
        if outcome.first_fault.is_none() {
            outcome.first_fault = Some(Fault::Listener {
                index,
                event: event.as_str(),
                message,
            });
        }
    }

    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lifecycle::test_support::{fixture, Fixture};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counting {
        calls: AtomicUsize,
    }

    impl AsyncListener for Counting {
        fn on_complete(&self, _event: &AsyncEvent) -> ListenerResult {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct Failing;

    impl AsyncListener for Failing {
        fn on_complete(&self, _event: &AsyncEvent) -> ListenerResult {
            Err("listener exploded".into())
        }
    }

    struct Panicking;

    impl AsyncListener for Panicking {
        fn on_complete(&self, _event: &AsyncEvent) -> ListenerResult {
            panic!("listener panicked");
        }
    }

    fn entry(fixture: &Fixture, listener: Arc<dyn AsyncListener>) -> ListenerEntry {
        ListenerEntry {
            listener,
            request: fixture.exchange.supplied_request(),
            response: fixture.exchange.supplied_response(),
        }
    }

    #[test]
    fn test_faults_do_not_stop_notification() {
        let fixture = fixture(true);
        let context = fixture.exchange.start_async().unwrap();
        let counter = Arc::new(Counting { calls: AtomicUsize::new(0) });

        let entries = vec![
            entry(&fixture, Arc::new(Failing)),
            entry(&fixture, counter.clone()),
            entry(&fixture, Arc::new(Panicking)),
            entry(&fixture, counter.clone()),
        ];

        let outcome = notify(&entries, ListenerEvent::Complete, &context, None);

        assert_eq!(outcome.notified, 4);
        assert_eq!(outcome.faults, 2);
        assert_eq!(counter.calls.load(Ordering::SeqCst), 2);
        assert_eq!(
            outcome.first_fault,
            Some(Fault::Listener {
                index: 0,
                event: "on_complete",
                message: "listener exploded".to_string(),
            })
        );
        assert_eq!(fixture.pipeline.listener_faults(), 2);
    }

    #[test]
    fn test_default_methods_are_noops() {
        struct Silent;
        impl AsyncListener for Silent {}

        let fixture = fixture(true);
        let context = fixture.exchange.start_async().unwrap();
        let entries = vec![entry(&fixture, Arc::new(Silent))];

        for event in [
            ListenerEvent::StartAsync,
            ListenerEvent::Complete,
            ListenerEvent::Timeout,
            ListenerEvent::Error,
        ] {
            let outcome = notify(&entries, event, &context, None);
            assert_eq!(outcome.faults, 0);
            assert_eq!(outcome.first_fault, None);
        }
    }

    #[test]
    fn test_event_carries_fault() {
        struct Inspect {
            seen: std::sync::Mutex<Option<Fault>>,
        }
        impl AsyncListener for Inspect {
            fn on_error(&self, event: &AsyncEvent) -> ListenerResult {
                *self.seen.lock().unwrap() = event.fault().cloned();
                Ok(())
            }
        }

        let fixture = fixture(true);
        let context = fixture.exchange.start_async().unwrap();
        let inspect = Arc::new(Inspect { seen: std::sync::Mutex::new(None) });
        let entries = vec![entry(&fixture, inspect.clone())];
        let fault = Fault::Timeout { timeout_ms: 10 };

        notify(&entries, ListenerEvent::Error, &context, Some(&fault));

        assert_eq!(*inspect.seen.lock().unwrap(), Some(fault));
    }
}
