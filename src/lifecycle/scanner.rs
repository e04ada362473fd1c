//! # Scanner de Timeouts
//! src/lifecycle/scanner.rs
//!
//! Un solo thread para todo el proceso recorre periódicamente el registro
//! de ciclos vivos. Para cada ciclo suspendido (STARTED):
//!
//! 1. Si el cliente se desconectó, inyecta una falla de I/O.
//! 2. Si el deadline expiró, dispara el timeout (ver `bridge::fire_timeout`).
//!
//! Los ciclos ya completos que quedaron en el registro se eliminan.

use crate::error::Fault;
use crate::lifecycle::{bridge, AsyncContext, AsyncState};
use crate::server::exchange::RequestId;
use serde::Serialize;
use std::collections::HashMap;
use std::io;
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Ciclos async vivos, indexados por request
#[derive(Clone, Default)]
pub struct AsyncRegistry {
    inner: Arc<Mutex<HashMap<RequestId, AsyncContext>>>,
}

impl AsyncRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<RequestId, AsyncContext>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn register(&self, context: AsyncContext) {
        self.lock().insert(context.request_id(), context);
    }

    pub fn deregister(&self, request_id: RequestId) -> bool {
        self.lock().remove(&request_id).is_some()
    }

    pub fn contains(&self, request_id: RequestId) -> bool {
        self.lock().contains_key(&request_id)
    }

    /// Copia de los contextos (el scanner no itera con el lock tomado)
    pub fn snapshot(&self) -> Vec<AsyncContext> {
        self.lock().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Resultado de una pasada del scanner
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct ScanReport {
    pub inspected: usize,
    pub timed_out: usize,
    pub disconnected: usize,
    pub pruned: usize,
}

/// Thread de fondo que revisa timeouts
pub struct TimeoutScanner {
    stop: Option<Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl TimeoutScanner {
    /// Inicia el thread del scanner con el intervalo dado
    pub fn spawn(registry: AsyncRegistry, interval: Duration) -> io::Result<Self> {
        let (stop_tx, stop_rx) = mpsc::channel::<()>();

        let handle = thread::Builder::new()
            .name("async-timeout-scanner".to_string())
            .spawn(move || {
                info!(interval_ms = interval.as_millis() as u64, "timeout scanner started");
                loop {
                    match stop_rx.recv_timeout(interval) {
                        Err(RecvTimeoutError::Timeout) => {
                            let report = Self::scan_once(&registry, Instant::now());
                            if report.timed_out > 0 || report.disconnected > 0 {
                                debug!(?report, "scan pass");
                            }
                        }
                        // Señal de parada o el dueño se fue
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
                info!("timeout scanner stopped");
            })?;

        Ok(Self {
            stop: Some(stop_tx),
            handle: Some(handle),
        })
    }

    /// Una pasada sobre el registro, con `now` como hora actual
    pub fn scan_once(registry: &AsyncRegistry, now: Instant) -> ScanReport {
        let mut report = ScanReport::default();

        for context in registry.snapshot() {
            report.inspected += 1;

            match context.state() {
                AsyncState::Complete => {
                    registry.deregister(context.request_id());
                    report.pruned += 1;
                }
                AsyncState::Started => {
                    if context.exchange().connection().is_closed() {
                        report.disconnected += 1;
                        context.raise_fault(Fault::Io {
                            kind: io::ErrorKind::ConnectionAborted,
                            message: "client disconnected".to_string(),
                        });
                        continue;
                    }
                    if bridge::fire_timeout(&context, now) {
                        report.timed_out += 1;
                    }
                }
                _ => {}
            }
        }

        report
    }

    /// Detiene el thread y espera a que termine
    pub fn shutdown(mut self) {
        self.stop_and_join();
    }

    fn stop_and_join(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for TimeoutScanner {
    fn drop(&mut self) {
        self.stop_and_join();
    }
}
