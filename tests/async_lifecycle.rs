//! Tests de integración del ciclo async sobre el contenedor completo
//!
//! Todo corre sobre `MemoryConnection`; los timeouts se disparan llamando
//! `TimeoutScanner::scan_once` con una hora futura, salvo el test que usa el
//! thread real del scanner.

use async_http_server::commands::basic::error_page_handler;
use async_http_server::error::AsyncError;
use async_http_server::http::{attributes, Request, StatusCode};
use async_http_server::lifecycle::{
    AsyncContext, AsyncEvent, AsyncListener, AsyncState, ListenerResult, TimeoutScanner,
};
use async_http_server::router::Router;
use async_http_server::server::{
    Container, ContainerConfig, Exchange, MemoryConnection, RequestWrapper, ResponseWrapper,
};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Barrier, Mutex};
use std::thread;
use std::time::{Duration, Instant};

const WAIT: Duration = Duration::from_secs(5);

fn container(router: Router, error_page: Option<&str>) -> Arc<Container> {
    Container::new(
        router,
        ContainerConfig {
            workers: 2,
            queue_capacity: 64,
            scan_interval_ms: 10,
            error_page: error_page.map(str::to_string),
            ..ContainerConfig::default()
        },
    )
}

fn run(container: &Arc<Container>, target: &str) -> (Arc<Exchange>, Arc<MemoryConnection>) {
    let connection = Arc::new(MemoryConnection::new());
    let exchange = container.service(Request::get(target), connection.clone());
    (exchange, connection)
}

fn body(output: &str) -> &str {
    output.split_once("\r\n\r\n").map(|(_, body)| body).unwrap_or("")
}

type Stash = Arc<Mutex<Option<AsyncContext>>>;

#[derive(Default)]
struct Counts {
    starts: AtomicUsize,
    completes: AtomicUsize,
    timeouts: AtomicUsize,
    errors: AtomicUsize,
    saw_wrapper: AtomicBool,
}

impl Counts {
    fn get(counter: &AtomicUsize) -> usize {
        counter.load(Ordering::SeqCst)
    }
}

impl AsyncListener for Counts {
    fn on_start_async(&self, _event: &AsyncEvent) -> ListenerResult {
        self.starts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn on_complete(&self, event: &AsyncEvent) -> ListenerResult {
        self.completes.fetch_add(1, Ordering::SeqCst);
        if event.supplied_request().is_wrapper() && event.supplied_response().is_wrapper() {
            self.saw_wrapper.store(true, Ordering::SeqCst);
        }
        Ok(())
    }

    fn on_timeout(&self, _event: &AsyncEvent) -> ListenerResult {
        self.timeouts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn on_error(&self, _event: &AsyncEvent) -> ListenerResult {
        self.errors.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Ruta que inicia un ciclo, registra `counts` y no lo termina
fn hanging_route(router: &mut Router, path: &str, timeout_ms: i64, counts: &Arc<Counts>, stash: &Stash) {
    let counts = Arc::clone(counts);
    let stash = Arc::clone(stash);
    router.register_async(path, move |exchange| {
        let context = exchange.start_async()?;
        context.set_timeout(timeout_ms)?;
        context.add_listener(counts.clone())?;
        *stash.lock().unwrap() = Some(context);
        Ok(())
    });
}

#[test]
fn test_worker_sleeps_then_completes() {
    let trace: Arc<Mutex<Vec<(&'static str, bool)>>> = Arc::new(Mutex::new(Vec::new()));
    let stash: Stash = Arc::new(Mutex::new(None));

    let mut router = Router::new();
    {
        let trace = Arc::clone(&trace);
        let stash = Arc::clone(&stash);
        router.register_async("/sleep", move |exchange| {
            let context = exchange.start_async()?;
            trace.lock().unwrap().push(("in handler", exchange.is_async_started()));
            *stash.lock().unwrap() = Some(context.clone());

            let worker = context.clone();
            let trace = Arc::clone(&trace);
            context.start(move || {
                thread::sleep(Duration::from_millis(200));
                trace.lock().unwrap().push(("after sleep", worker.is_async_started()));
                worker.complete().unwrap();
            })?;
            Ok(())
        });
    }
    let container = container(router, None);

    let (exchange, connection) = run(&container, "/sleep");
    trace
        .lock()
        .unwrap()
        .push(("after return", exchange.is_async_started()));
    assert!(!connection.is_finished());

    let output = connection.wait_closed(WAIT).expect("cycle never completed");
    assert!(output.starts_with("HTTP/1.0 200 OK"));

    let trace = trace.lock().unwrap().clone();
    assert_eq!(
        trace,
        vec![("in handler", true), ("after return", true), ("after sleep", true)]
    );

    let context = stash.lock().unwrap().take().unwrap();
    assert_eq!(context.state(), AsyncState::Complete);
    assert_eq!(context.get_request().err(), Some(AsyncError::Recycled));
    assert!(container.registry().is_empty());
}

#[test]
fn test_unresolved_timeout_generates_error_and_completes_once() {
    let counts = Arc::new(Counts::default());
    let stash: Stash = Arc::new(Mutex::new(None));
    let mut router = Router::new();
    hanging_route(&mut router, "/hang", 100, &counts, &stash);
    let container = container(router, None);

    let (exchange, connection) = run(&container, "/hang");
    assert!(exchange.is_async_started());
    assert_eq!(container.registry().len(), 1);

    // Todavía no vence
    let report = TimeoutScanner::scan_once(container.registry(), Instant::now());
    assert_eq!(report.timed_out, 0);
    assert!(!connection.is_finished());

    let report =
        TimeoutScanner::scan_once(container.registry(), Instant::now() + Duration::from_millis(150));
    assert_eq!(report.timed_out, 1);

    let output = connection.output();
    assert!(output.starts_with("HTTP/1.0 500 Internal Server Error"));
    assert!(body(&output).contains("timed out after 100 ms"));

    assert_eq!(Counts::get(&counts.timeouts), 1);
    assert_eq!(Counts::get(&counts.completes), 1);
    assert_eq!(Counts::get(&counts.errors), 0);
    assert!(connection.is_finished());
    assert!(container.registry().is_empty());

    let lifecycle = container.metrics().lifecycle();
    assert_eq!(lifecycle.timed_out, 1);
    assert_eq!(lifecycle.completed, 1);

    // Un scan posterior no vuelve a disparar
    let report =
        TimeoutScanner::scan_once(container.registry(), Instant::now() + Duration::from_secs(10));
    assert_eq!(report.timed_out, 0);
    assert_eq!(Counts::get(&counts.completes), 1);
}

#[test]
fn test_scanner_thread_fires_timeout() {
    let counts = Arc::new(Counts::default());
    let stash: Stash = Arc::new(Mutex::new(None));
    let mut router = Router::new();
    hanging_route(&mut router, "/hang", 100, &counts, &stash);
    let container = container(router, None);
    let scanner = container.spawn_scanner().unwrap();

    let started = Instant::now();
    let (_exchange, connection) = run(&container, "/hang");

    let output = connection.wait_closed(WAIT).expect("timeout never fired");
    assert!(started.elapsed() >= Duration::from_millis(100));
    assert!(output.starts_with("HTTP/1.0 500"));
    assert_eq!(Counts::get(&counts.timeouts), 1);
    assert_eq!(Counts::get(&counts.completes), 1);

    scanner.shutdown();
}

#[test]
fn test_disabled_timeout_never_fires() {
    let counts = Arc::new(Counts::default());
    let stash: Stash = Arc::new(Mutex::new(None));
    let mut router = Router::new();
    hanging_route(&mut router, "/forever", 0, &counts, &stash);
    let container = container(router, None);

    let (_exchange, connection) = run(&container, "/forever");
    let report =
        TimeoutScanner::scan_once(container.registry(), Instant::now() + Duration::from_secs(3600));
    assert_eq!(report.timed_out, 0);
    assert!(!connection.is_finished());

    let context = stash.lock().unwrap().take().unwrap();
    context.complete().unwrap();
    assert!(connection.is_finished());
    assert_eq!(Counts::get(&counts.timeouts), 0);
    assert_eq!(Counts::get(&counts.completes), 1);
}

#[test]
fn test_timeout_forwards_to_error_page() {
    let counts = Arc::new(Counts::default());
    let stash: Stash = Arc::new(Mutex::new(None));
    let mut router = Router::new();
    hanging_route(&mut router, "/hang", 100, &counts, &stash);
    router.register("/error", error_page_handler);
    let container = container(router, Some("/error"));

    let (_exchange, connection) = run(&container, "/hang");
    TimeoutScanner::scan_once(container.registry(), Instant::now() + Duration::from_millis(150));

    let output = connection.output();
    assert!(output.starts_with("HTTP/1.0 500 Internal Server Error"));
    assert!(output.contains("Content-Type: application/json"));

    let json: serde_json::Value = serde_json::from_str(body(&output)).unwrap();
    assert_eq!(json["status"], 500);
    assert_eq!(json["dispatcher"], "ERROR");
    assert!(json["error"].as_str().unwrap().contains("timed out"));
    assert_eq!(Counts::get(&counts.completes), 1);
}

#[test]
fn test_second_dispatch_in_cycle_is_illegal() {
    let second: Arc<Mutex<Option<Result<(), AsyncError>>>> = Arc::new(Mutex::new(None));

    let mut router = Router::new();
    {
        let second = Arc::clone(&second);
        router.register_async("/twice", move |exchange| {
            let context = exchange.start_async()?;
            context.dispatch_to("/first")?;
            *second.lock().unwrap() = Some(context.dispatch_to("/second"));
            Ok(())
        });
    }
    router.register("/first", |exchange| {
        exchange.write("first");
        Ok(())
    });
    router.register("/second", |exchange| {
        exchange.write("second");
        Ok(())
    });
    let container = container(router, None);

    let (exchange, connection) = run(&container, "/twice");

    let result = second.lock().unwrap().take().unwrap();
    assert!(result.unwrap_err().is_illegal_state());

    // El dispatch inline se aplica al retornar el handler, en el mismo hilo
    assert!(connection.is_finished());
    let output = connection.output();
    assert!(output.ends_with("first"));
    assert!(!output.contains("second"));
    assert_eq!(exchange.attribute(attributes::ASYNC_REQUEST_URI).as_deref(), Some("/twice"));
    assert_eq!(container.metrics().lifecycle().dispatched, 1);
}

#[test]
fn test_concurrent_complete_has_single_winner() {
    let counts = Arc::new(Counts::default());
    let stash: Stash = Arc::new(Mutex::new(None));
    let mut router = Router::new();
    hanging_route(&mut router, "/race", 0, &counts, &stash);
    let container = container(router, None);

    let (_exchange, connection) = run(&container, "/race");
    let context = stash.lock().unwrap().take().unwrap();

    let barrier = Arc::new(Barrier::new(2));
    let handles: Vec<_> = (0..2)
        .map(|_| {
            let context = context.clone();
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                context.complete()
            })
        })
        .collect();

    let results: Vec<Result<(), AsyncError>> =
        handles.into_iter().map(|h| h.join().unwrap()).collect();

    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
    let loser = results.into_iter().find(|r| r.is_err()).unwrap();
    assert!(loser.unwrap_err().is_illegal_state());

    assert_eq!(Counts::get(&counts.completes), 1);
    assert!(connection.is_finished());
}

/// Se vuelve a registrar en cada `on_start_async`
struct StickyListener {
    starts: Arc<AtomicUsize>,
}

impl AsyncListener for StickyListener {
    fn on_start_async(&self, event: &AsyncEvent) -> ListenerResult {
        self.starts.fetch_add(1, Ordering::SeqCst);
        event.async_context().add_listener(Arc::new(StickyListener {
            starts: Arc::clone(&self.starts),
        }))?;
        Ok(())
    }
}

#[test]
fn test_sticky_listener_survives_dispatch_chain() {
    const DISPATCHES: usize = 3;

    let sticky_starts = Arc::new(AtomicUsize::new(0));
    let plain = Arc::new(Counts::default());

    let mut router = Router::new();
    {
        let sticky_starts = Arc::clone(&sticky_starts);
        let plain = Arc::clone(&plain);
        router.register_async("/chain", move |exchange| {
            let context = exchange.start_async()?;
            let hop = exchange
                .attribute("chain.hop")
                .and_then(|s| s.parse::<usize>().ok())
                .unwrap_or(0);

            if hop == 0 {
                context.add_listener(Arc::new(StickyListener {
                    starts: Arc::clone(&sticky_starts),
                }))?;
                context.add_listener(plain.clone())?;
            }

            if hop < DISPATCHES {
                exchange.set_attribute("chain.hop", &(hop + 1).to_string());
                context.dispatch()?;
            } else {
                context.complete()?;
            }
            Ok(())
        });
    }
    let container = container(router, None);

    let (exchange, connection) = run(&container, "/chain?x=1");

    assert!(connection.is_finished());
    assert_eq!(sticky_starts.load(Ordering::SeqCst), DISPATCHES);
    assert_eq!(Counts::get(&plain.starts), 1);
    assert_eq!(Counts::get(&plain.completes), 0);

    // Sin destino, cada dispatch vuelve a la URI original
    assert_eq!(exchange.uri(), "/chain?x=1");
    assert_eq!(container.metrics().lifecycle().dispatched, DISPATCHES as u64);
    assert_eq!(container.metrics().lifecycle().cycles_started, DISPATCHES as u64 + 1);
}

#[test]
fn test_work_runs_after_handler_returns() {
    let handler_done = Arc::new(AtomicBool::new(false));
    let seen: Arc<Mutex<Vec<(bool, AsyncState, bool)>>> = Arc::new(Mutex::new(Vec::new()));

    let mut router = Router::new();
    {
        let handler_done = Arc::clone(&handler_done);
        let seen = Arc::clone(&seen);
        router.register_async("/work", move |exchange| {
            let context = exchange.start_async()?;

            let worker = context.clone();
            let done = Arc::clone(&handler_done);
            let seen = Arc::clone(&seen);
            context.start(move || {
                seen.lock().unwrap().push((
                    done.load(Ordering::SeqCst),
                    worker.state(),
                    worker.is_async_started(),
                ));
                worker.complete().unwrap();
            })?;

            // Si el trabajo corriera ya, vería `handler_done == false`
            thread::sleep(Duration::from_millis(50));
            handler_done.store(true, Ordering::SeqCst);
            Ok(())
        });
    }
    let container = container(router, None);

    let (_exchange, connection) = run(&container, "/work");
    connection.wait_closed(WAIT).expect("work never completed");

    let seen = seen.lock().unwrap().clone();
    assert_eq!(seen, vec![(true, AsyncState::Started, true)]);
}

#[test]
fn test_wrappers_reach_listeners_and_workers() {
    let counts = Arc::new(Counts::default());
    let wrapper_slot: Arc<Mutex<Option<Arc<ResponseWrapper>>>> = Arc::new(Mutex::new(None));
    let has_original = Arc::new(AtomicBool::new(true));

    let mut router = Router::new();
    {
        let counts = Arc::clone(&counts);
        let wrapper_slot = Arc::clone(&wrapper_slot);
        let has_original = Arc::clone(&has_original);
        router.register_async("/wrapped", move |exchange| {
            let request = Arc::new(RequestWrapper::new(exchange.supplied_request()));
            let response = Arc::new(ResponseWrapper::new(exchange.supplied_response()));
            *wrapper_slot.lock().unwrap() = Some(Arc::clone(&response));

            let context = exchange.start_async_with(request, response)?;
            has_original.store(context.has_original_request_and_response(), Ordering::SeqCst);
            context.add_listener(counts.clone())?;

            let worker = context.clone();
            context.start(move || {
                let response = worker.get_response().unwrap();
                assert!(response.is_wrapper());
                response.write("abc");
                worker.complete().unwrap();
            })?;
            Ok(())
        });
    }
    let container = container(router, None);

    let (_exchange, connection) = run(&container, "/wrapped");
    let output = connection.wait_closed(WAIT).unwrap();

    assert!(output.ends_with("abc"));
    assert!(!has_original.load(Ordering::SeqCst));
    assert!(counts.saw_wrapper.load(Ordering::SeqCst));

    let wrapper = wrapper_slot.lock().unwrap().take().unwrap();
    assert_eq!(wrapper.bytes_written(), 3);
}

#[test]
fn test_client_disconnect_becomes_error() {
    let counts = Arc::new(Counts::default());
    let stash: Stash = Arc::new(Mutex::new(None));
    let mut router = Router::new();
    hanging_route(&mut router, "/gone", 0, &counts, &stash);
    let container = container(router, None);

    let (exchange, connection) = run(&container, "/gone");
    connection.disconnect();

    let report = TimeoutScanner::scan_once(container.registry(), Instant::now());
    assert_eq!(report.disconnected, 1);

    assert_eq!(Counts::get(&counts.errors), 1);
    assert_eq!(Counts::get(&counts.completes), 1);
    assert!(exchange.is_finished());
    assert!(container.registry().is_empty());
}

#[test]
fn test_io_error_while_worker_writes() {
    let counts = Arc::new(Counts::default());
    let late_complete: Arc<Mutex<Option<Result<(), AsyncError>>>> = Arc::new(Mutex::new(None));
    let gate = Arc::new(Barrier::new(2));

    let mut router = Router::new();
    {
        let counts = Arc::clone(&counts);
        let late_complete = Arc::clone(&late_complete);
        let gate = Arc::clone(&gate);
        router.register_async("/stream", move |exchange| {
            let context = exchange.start_async()?;
            context.add_listener(counts.clone())?;

            let worker = context.clone();
            let late_complete = Arc::clone(&late_complete);
            let gate = Arc::clone(&gate);
            context.start(move || {
                // Esperar a que el test corte la conexión
                gate.wait();
                let response = worker.get_response().unwrap();
                response.write("partial");
                assert!(response.flush().is_err());
                *late_complete.lock().unwrap() = Some(worker.complete());
            })?;
            Ok(())
        });
    }
    let container = container(router, None);

    let (_exchange, connection) = run(&container, "/stream");
    connection.disconnect();
    gate.wait();

    connection.wait_closed(WAIT).expect("error path never closed the connection");
    let deadline = Instant::now() + WAIT;
    while late_complete.lock().unwrap().is_none() && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(5));
    }

    let late = late_complete.lock().unwrap().take().unwrap();
    assert!(late.is_err());
    assert_eq!(Counts::get(&counts.errors), 1);
    assert_eq!(Counts::get(&counts.completes), 1);
}

#[test]
fn test_handler_error_after_start_async() {
    let counts = Arc::new(Counts::default());

    let mut router = Router::new();
    {
        let counts = Arc::clone(&counts);
        router.register_async("/fail", move |exchange| {
            let context = exchange.start_async()?;
            context.add_listener(counts.clone())?;
            Err("database unavailable".into())
        });
    }
    let container = container(router, None);

    let (_exchange, connection) = run(&container, "/fail");

    assert!(connection.is_finished());
    let output = connection.output();
    assert!(output.starts_with("HTTP/1.0 500 Internal Server Error"));
    assert!(output.contains("database unavailable"));
    assert_eq!(Counts::get(&counts.errors), 1);
    assert_eq!(Counts::get(&counts.completes), 1);
    assert_eq!(container.metrics().lifecycle().errored, 1);
}

#[test]
fn test_handler_error_after_inline_complete() {
    let counts = Arc::new(Counts::default());

    let mut router = Router::new();
    {
        let counts = Arc::clone(&counts);
        router.register_async("/fail-after-complete", move |exchange| {
            let context = exchange.start_async()?;
            context.add_listener(counts.clone())?;
            exchange.write("looks fine");
            context.complete()?;
            Err("handler blew up after complete".into())
        });
    }
    router.register_async("/panic-after-complete", |exchange| {
        let context = exchange.start_async()?;
        context.complete()?;
        panic!("handler panicked after complete");
    });
    let container = container(router, None);

    let (exchange, connection) = run(&container, "/fail-after-complete");

    assert!(exchange.is_finished());
    let output = connection.output();
    assert!(output.starts_with("HTTP/1.0 500 Internal Server Error"));
    assert!(output.contains("handler blew up after complete"));
    assert_eq!(Counts::get(&counts.errors), 1);
    assert_eq!(Counts::get(&counts.completes), 1);

    let (exchange, connection) = run(&container, "/panic-after-complete");

    assert!(exchange.is_finished());
    let output = connection.output();
    assert!(output.starts_with("HTTP/1.0 500 Internal Server Error"));
    assert!(output.contains("handler panicked after complete"));
    assert_eq!(container.metrics().lifecycle().errored, 2);
    assert!(container.registry().is_empty());
}

#[test]
fn test_panic_in_async_work_ends_cycle_with_error() {
    let counts = Arc::new(Counts::default());

    let mut router = Router::new();
    {
        let counts = Arc::clone(&counts);
        router.register_async("/worker-dies", move |exchange| {
            let context = exchange.start_async()?;
            context.set_timeout(0)?;
            context.add_listener(counts.clone())?;
            context.start(|| panic!("worker died"))?;
            Ok(())
        });
    }
    let container = container(router, None);

    let (exchange, connection) = run(&container, "/worker-dies");

    // Sin timeout: sólo la falla del worker puede cerrar la conexión
    let output = connection.wait_closed(WAIT).expect("cycle hung after worker panic");
    assert!(output.starts_with("HTTP/1.0 500 Internal Server Error"));
    assert!(output.contains("worker died"));
    assert!(exchange.is_finished());
    assert_eq!(Counts::get(&counts.errors), 1);
    assert_eq!(Counts::get(&counts.completes), 1);
    assert!(container.registry().is_empty());
}

#[test]
fn test_start_async_on_sync_route_is_rejected() {
    let mut router = Router::new();
    router.register("/plain", |exchange| match exchange.start_async() {
        Err(AsyncError::AsyncNotSupported { path }) => {
            exchange.write(&format!("no async for {}", path));
            Ok(())
        }
        other => Err(format!("unexpected: {:?}", other.map(|_| ())).into()),
    });
    // Dispatch a una ruta síncrona: permitido, pero ahí no se puede iniciar otro ciclo
    router.register_async("/to-plain", |exchange| {
        let context = exchange.start_async()?;
        context.dispatch_to("/plain")?;
        Ok(())
    });
    let container = container(router, None);

    let (_exchange, connection) = run(&container, "/plain");
    assert!(connection.output().ends_with("no async for /plain"));

    let (_exchange, connection) = run(&container, "/to-plain");
    assert!(connection.is_finished());
    assert!(connection.output().ends_with("no async for /plain"));
}

#[test]
fn test_send_error_from_worker_keeps_status() {
    let mut router = Router::new();
    router.register_async("/lookup", |exchange| {
        let context = exchange.start_async()?;
        let worker = context.clone();
        context.start(move || {
            let response = worker.get_response().unwrap();
            response
                .send_error(StatusCode::NotFound, "no such item")
                .unwrap();
            worker.complete().unwrap();
        })?;
        Ok(())
    });
    let container = container(router, None);

    let (exchange, connection) = run(&container, "/lookup");
    let output = connection.wait_closed(WAIT).unwrap();

    assert!(output.starts_with("HTTP/1.0 404 Not Found"));
    assert!(output.contains("no such item"));
    assert!(exchange.is_error_reported());
}

#[test]
fn test_start_async_after_finish_is_recycled() {
    let mut router = Router::new();
    router.register("/done", |_exchange| Ok(()));
    let container = container(router, None);

    let (exchange, connection) = run(&container, "/done");
    assert!(connection.is_finished());
    assert_eq!(exchange.start_async().err(), Some(AsyncError::Recycled));
}
