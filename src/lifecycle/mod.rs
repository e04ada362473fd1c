//! # Ciclo de Vida Asíncrono
//! src/lifecycle/mod.rs
//!
//! Una request puede salir del hilo que la recibió (`start_async`) y
//! terminar más tarde desde otro hilo con `complete()` o volver a entrar al
//! pipeline con `dispatch()`.
//!
//! - [`state`]: máquina de estados (único punto de serialización)
//! - [`context`]: el handle [`AsyncContext`] que usa la aplicación
//! - [`listener`]: notificación aislada de listeners
//! - [`bridge`]: aplica las transiciones diferidas sobre el pipeline
//! - [`scanner`]: registro de ciclos vivos y thread de timeouts

pub mod bridge;
pub mod context;
pub mod listener;
pub mod scanner;
pub mod state;

pub use bridge::{after_processing, LifecycleEvent, Pipeline};
pub use context::AsyncContext;
pub use listener::{AsyncEvent, AsyncListener, ListenerEvent, ListenerResult, NotifyOutcome};
pub use scanner::{AsyncRegistry, ScanReport, TimeoutScanner};
pub use state::{AsyncState, AsyncStateMachine, PostAction};
