//! # Servidor
//! src/server/mod.rs
//!
//! - [`connection`]: transporte (TCP o en memoria)
//! - [`exchange`]: request + response en vuelo
//! - [`pool`]: workers para `start(work)` y dispatch
//! - [`container`]: pipeline (routing, ciclos async, métricas)
//! - [`tcp`]: loop de accept, un thread por conexión

pub mod connection;
pub mod container;
pub mod exchange;
pub mod pool;
pub mod tcp;

pub use connection::{Connection, MemoryConnection, TcpConnection};
pub use container::{Container, ContainerConfig};
pub use exchange::{
    Exchange, RequestId, RequestWrapper, ResponseWrapper, ServletRequest, ServletResponse,
    SuppliedRequest, SuppliedResponse,
};
pub use tcp::Server;
