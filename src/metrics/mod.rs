//! # Sistema de Métricas
//! src/metrics/mod.rs
//!
//! Recolección y agregación de métricas del servidor:
//! - Contadores de requests y códigos de estado
//! - Latencias (p50, p95, p99)
//! - Conexiones activas
//! - Eventos del ciclo async

pub mod collector;

pub use collector::{LifecycleCounters, MetricsCollector, MetricsSnapshot};
