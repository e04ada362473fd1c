//! # Pool de Workers
//! src/server/pool.rs
//!
//! Threads fijos que consumen una cola FIFO acotada. Aquí corren los
//! `start(work)` de la aplicación y los dispatch pedidos desde threads que
//! no son del contenedor.

use crate::error::{AsyncError, Fault};
use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use tracing::{debug, error, warn};

/// Unidad de trabajo que ejecuta un worker
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// Cola FIFO thread-safe con capacidad máxima
#[derive(Clone)]
pub struct TaskQueue {
    tasks: Arc<Mutex<VecDeque<Task>>>,

    /// Condvar para despertar workers cuando llega trabajo o se cierra
    condvar: Arc<Condvar>,

    max_capacity: usize,
    closed: Arc<AtomicBool>,
}

impl TaskQueue {
    pub fn new(max_capacity: usize) -> Self {
        Self {
            tasks: Arc::new(Mutex::new(VecDeque::new())),
            condvar: Arc::new(Condvar::new()),
            max_capacity,
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<Task>> {
        self.tasks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Encola una tarea
    ///
    /// Falla si la cola está llena o cerrada.
    pub fn enqueue(&self, task: Task) -> Result<(), AsyncError> {
        let mut tasks = self.lock();

        if self.closed.load(Ordering::SeqCst) {
            return Err(AsyncError::Rejected {
                reason: "worker pool is shut down".to_string(),
            });
        }

        if tasks.len() >= self.max_capacity {
            return Err(AsyncError::Rejected {
                reason: format!("queue is full (max capacity: {})", self.max_capacity),
            });
        }

        tasks.push_back(task);
        self.condvar.notify_one();
        Ok(())
    }

    /// Bloquea hasta que haya una tarea
    ///
    /// Retorna `None` cuando la cola está cerrada y vacía.
    pub fn dequeue(&self) -> Option<Task> {
        let mut tasks = self.lock();

        loop {
            if let Some(task) = tasks.pop_front() {
                return Some(task);
            }
            if self.closed.load(Ordering::SeqCst) {
                return None;
            }
            tasks = self
                .condvar
                .wait(tasks)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    pub fn close(&self) {
        let _tasks = self.lock();
        self.closed.store(true, Ordering::SeqCst);
        self.condvar.notify_all();
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_full(&self) -> bool {
        self.len() >= self.max_capacity
    }

    pub fn max_capacity(&self) -> usize {
        self.max_capacity
    }
}

/// Pool de threads que ejecuta [`Task`]s
pub struct WorkerPool {
    name: String,
    queue: TaskQueue,
    workers: Mutex<Vec<JoinHandle<()>>>,
    busy: Arc<AtomicUsize>,
}

impl WorkerPool {
    /// Crea el pool e inicia `workers` threads
    pub fn new(name: &str, workers: usize, capacity: usize) -> Self {
        let pool = Self {
            name: name.to_string(),
            queue: TaskQueue::new(capacity.max(1)),
            workers: Mutex::new(Vec::new()),
            busy: Arc::new(AtomicUsize::new(0)),
        };
        pool.spawn_workers(workers.max(1));
        pool
    }

    fn spawn_workers(&self, count: usize) {
        let mut workers = self.workers.lock().unwrap_or_else(PoisonError::into_inner);

        for i in 0..count {
            let worker_name = format!("{}-{}", self.name, i);
            let queue = self.queue.clone();
            let busy = Arc::clone(&self.busy);
            let thread_name = worker_name.clone();

            match thread::Builder::new()
                .name(thread_name)
                .spawn(move || Self::worker_loop(worker_name, queue, busy))
            {
                Ok(handle) => workers.push(handle),
                Err(e) => error!(pool = %self.name, error = %e, "failed to spawn worker"),
            }
        }
    }

    /// Loop principal del worker
    fn worker_loop(name: String, queue: TaskQueue, busy: Arc<AtomicUsize>) {
        debug!(worker = %name, "worker started");

        while let Some(task) = queue.dequeue() {
            busy.fetch_add(1, Ordering::SeqCst);
            if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(task)) {
                error!(
                    worker = %name,
                    panic = %Fault::panic_message(payload.as_ref()),
                    "task panicked"
                );
            }
            busy.fetch_sub(1, Ordering::SeqCst);
        }

        debug!(worker = %name, "worker stopped");
    }

    /// Envía una tarea al pool
    pub fn submit(&self, task: Task) -> Result<(), AsyncError> {
        self.queue.enqueue(task).map_err(|e| {
            warn!(pool = %self.name, error = %e, "task rejected");
            e
        })
    }

    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    pub fn busy(&self) -> usize {
        self.busy.load(Ordering::SeqCst)
    }

    pub fn size(&self) -> usize {
        self.workers.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Cierra la cola y espera a que los workers terminen lo pendiente
    pub fn shutdown(&self) {
        self.queue.close();

        let handles: Vec<JoinHandle<()>> = self
            .workers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();

        let current = thread::current().id();
        for handle in handles {
            // Un worker no puede esperarse a sí mismo
            if handle.thread().id() != current {
                let _ = handle.join();
            }
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::time::Duration;

    #[test]
    fn test_queue_fifo_and_capacity() {
        let queue = TaskQueue::new(2);
        queue.enqueue(Box::new(|| {})).unwrap();
        queue.enqueue(Box::new(|| {})).unwrap();

        assert!(queue.is_full());
        let err = queue.enqueue(Box::new(|| {})).unwrap_err();
        assert!(matches!(err, AsyncError::Rejected { .. }));
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn test_closed_queue_drains_then_stops() {
        let queue = TaskQueue::new(4);
        queue.enqueue(Box::new(|| {})).unwrap();
        queue.close();

        assert!(queue.enqueue(Box::new(|| {})).is_err());
        assert!(queue.dequeue().is_some());
        assert!(queue.dequeue().is_none());
    }

    #[test]
    fn test_pool_runs_tasks_on_worker_threads() {
        let pool = WorkerPool::new("test-worker", 2, 16);
        let (tx, rx) = mpsc::channel();

        for i in 0..4 {
            let tx = tx.clone();
            pool.submit(Box::new(move || {
                let name = thread::current().name().map(|s| s.to_string());
                tx.send((i, name)).unwrap();
            }))
            .unwrap();
        }

        let mut seen = Vec::new();
        for _ in 0..4 {
            let (i, name) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
            assert!(name.unwrap().starts_with("test-worker-"));
            seen.push(i);
        }
        seen.sort();
        assert_eq!(seen, vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_panicking_task_does_not_kill_worker() {
        let pool = WorkerPool::new("panicky", 1, 4);
        let (tx, rx) = mpsc::channel();

        pool.submit(Box::new(|| panic!("boom"))).unwrap();
        pool.submit(Box::new(move || tx.send(()).unwrap())).unwrap();

        assert!(rx.recv_timeout(Duration::from_secs(5)).is_ok());
        assert_eq!(pool.size(), 1);
    }

    #[test]
    fn test_submit_after_shutdown_is_rejected() {
        let pool = WorkerPool::new("closed", 1, 4);
        pool.shutdown();
        assert!(pool.submit(Box::new(|| {})).is_err());
    }
}
