//! # Exchange: request + response de una conexión
//! src/server/exchange.rs
//!
//! Un [`Exchange`] es lo que recorre el pipeline: la request parseada, la
//! respuesta con buffer, la conexión y el slot del [`AsyncContext`] (que se
//! crea recién en el primer `start_async`).
//!
//! Los handlers reciben `&Arc<Exchange>`. Listeners y workers reciben la
//! request/response "suministrada" ([`SuppliedRequest`] /
//! [`SuppliedResponse`]): la fachada del exchange o un wrapper de la
//! aplicación.

use crate::error::{AsyncError, Fault};
use crate::http::{attributes, AlreadyCommitted, DispatcherType, Method, Request, Response, StatusCode};
use crate::lifecycle::{AsyncContext, Pipeline};
use crate::server::connection::Connection;
use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;
use tracing::debug;

/// Identificador estable de una request dentro del proceso
pub type RequestId = u64;

/// Valor del header `Server`
pub const SERVER_NAME: &str = "RedUnix-Async/1.0";

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Request y respuesta en vuelo
pub struct Exchange {
    id: RequestId,
    request: Mutex<Request>,
    response: Mutex<Response>,
    connection: Arc<dyn Connection>,
    pipeline: Arc<dyn Pipeline>,
    async_context: Mutex<Option<AsyncContext>>,

    /// `true` una vez cerrada la conexión; ya no se aceptan ciclos nuevos
    finished: AtomicBool,

    received_at: Instant,
}

impl Exchange {
    pub fn new(
        id: RequestId,
        request: Request,
        connection: Arc<dyn Connection>,
        pipeline: Arc<dyn Pipeline>,
    ) -> Arc<Self> {
        Arc::new(Self {
            id,
            request: Mutex::new(request),
            response: Mutex::new(Response::default()),
            connection,
            pipeline,
            async_context: Mutex::new(None),
            finished: AtomicBool::new(false),
            received_at: Instant::now(),
        })
    }

    pub fn id(&self) -> RequestId {
        self.id
    }

    pub fn connection(&self) -> &Arc<dyn Connection> {
        &self.connection
    }

    pub(crate) fn pipeline(&self) -> &Arc<dyn Pipeline> {
        &self.pipeline
    }

    pub fn received_at(&self) -> Instant {
        self.received_at
    }

    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::SeqCst)
    }

    // === Request ===

    pub fn path(&self) -> String {
        lock(&self.request).path().to_string()
    }

    pub fn uri(&self) -> String {
        lock(&self.request).uri()
    }

    pub fn method(&self) -> Method {
        lock(&self.request).method()
    }

    pub fn header(&self, name: &str) -> Option<String> {
        lock(&self.request).header(name).map(|s| s.to_string())
    }

    pub fn query_param(&self, name: &str) -> Option<String> {
        lock(&self.request).query_param(name).map(|s| s.to_string())
    }

    pub fn attribute(&self, name: &str) -> Option<String> {
        lock(&self.request).attribute(name).map(|s| s.to_string())
    }

    pub fn set_attribute(&self, name: &str, value: &str) {
        lock(&self.request).set_attribute(name, value);
    }

    pub fn dispatcher_type(&self) -> DispatcherType {
        lock(&self.request).dispatcher_type()
    }

    // === Response ===

    pub fn status(&self) -> StatusCode {
        lock(&self.response).status()
    }

    /// Cambia el status; se ignora si la respuesta ya fue committed
    pub fn set_status(&self, status: StatusCode) {
        if lock(&self.response).set_status(status).is_err() {
            debug!(request_id = self.id, "set_status ignored: response committed");
        }
    }

    pub fn set_header(&self, name: &str, value: &str) {
        if lock(&self.response).set_header(name, value).is_err() {
            debug!(request_id = self.id, header = name, "set_header ignored: response committed");
        }
    }

    /// Agrega texto al body (queda en buffer hasta `flush` o `complete`)
    pub fn write(&self, chunk: &str) {
        lock(&self.response).write_str(chunk);
    }

    /// Atajo: status + `Content-Type: application/json` + body
    pub fn send_json(&self, status: StatusCode, body: &serde_json::Value) {
        let mut response = lock(&self.response);
        if response.set_status(status).is_ok() {
            let _ = response.set_header("Content-Type", "application/json");
        }
        response.write_str(&body.to_string());
    }

    pub fn send_error(&self, status: StatusCode, message: &str) -> Result<(), AlreadyCommitted> {
        lock(&self.response).send_error(status, message)
    }

    pub fn is_committed(&self) -> bool {
        lock(&self.response).is_committed()
    }

    pub fn is_error_reported(&self) -> bool {
        lock(&self.response).is_error_reported()
    }

    /// Envía lo que haya en buffer (hace commit si no se había hecho)
    ///
    /// Un error de I/O durante un ciclo async se inyecta como falla del
    /// ciclo, además de retornarse.
    pub fn flush(&self) -> io::Result<()> {
        self.write_output(false).map_err(|e| {
            self.report_io_error(&e);
            e
        })
    }

    /// Escritura final de la respuesta
    pub(crate) fn finish_response(&self) -> io::Result<()> {
        self.write_output(true)
    }

    fn write_output(&self, last: bool) -> io::Result<()> {
        {
            let mut response = lock(&self.response);
            if !response.is_committed() {
                response.add_header("Server", SERVER_NAME);
                response.add_header("Connection", "close");
                response.add_header("X-Request-Id", &self.id.to_string());
            }
            let bytes = response.take_output(last);
            if !bytes.is_empty() {
                self.connection.write(&bytes)?;
            }
        }
        self.connection.flush()
    }

    /// Reemplaza la respuesta por una de error generada por el contenedor
    ///
    /// Retorna `false` si la respuesta ya estaba committed.
    pub(crate) fn respond_with_error(&self, status: StatusCode, message: &str) -> bool {
        lock(&self.response).send_error(status, message).is_ok()
    }

    pub(crate) fn report_io_error(&self, err: &io::Error) {
        match self.async_context() {
            Some(context) => context.raise_fault(Fault::io(err)),
            None => debug!(request_id = self.id, error = %err, "I/O error outside async cycle"),
        }
    }

    /// Cierra la conexión y suelta el contexto
    pub(crate) fn close(&self) {
        self.finished.store(true, Ordering::SeqCst);
        self.connection.close();
        lock(&self.async_context).take();
    }

    // === Async ===

    /// Inicia un ciclo async con la request/response originales
    pub fn start_async(self: &Arc<Self>) -> Result<AsyncContext, AsyncError> {
        let request = self.supplied_request();
        let response = self.supplied_response();
        self.start_async_with(request, response)
    }

    /// Inicia un ciclo async suministrando request/response (posiblemente
    /// wrappers)
    pub fn start_async_with(
        self: &Arc<Self>,
        request: SuppliedRequest,
        response: SuppliedResponse,
    ) -> Result<AsyncContext, AsyncError> {
        if self.is_finished() {
            return Err(AsyncError::Recycled);
        }

        let path = self.path();
        if !self.pipeline.route_supports_async(&path) {
            return Err(AsyncError::AsyncNotSupported { path });
        }

        let context = lock(&self.async_context)
            .get_or_insert_with(|| AsyncContext::new(Arc::clone(self), Arc::clone(&self.pipeline)))
            .clone();

        context.begin_cycle(request, response)?;
        Ok(context)
    }

    pub fn async_context(&self) -> Option<AsyncContext> {
        lock(&self.async_context).clone()
    }

    pub fn is_async_started(&self) -> bool {
        self.async_context()
            .map(|context| context.is_async_started())
            .unwrap_or(false)
    }

    pub fn is_async_dispatching(&self) -> bool {
        self.async_context()
            .map(|context| context.is_async_dispatching())
            .unwrap_or(false)
    }

    pub fn is_async_completing(&self) -> bool {
        self.async_context()
            .map(|context| context.is_async_completing())
            .unwrap_or(false)
    }

    /// Fachada de la request original
    pub fn supplied_request(self: &Arc<Self>) -> SuppliedRequest {
        Arc::new(RequestFacade {
            exchange: Arc::clone(self),
        })
    }

    /// Fachada de la respuesta original
    pub fn supplied_response(self: &Arc<Self>) -> SuppliedResponse {
        Arc::new(ResponseFacade {
            exchange: Arc::clone(self),
        })
    }

    /// Re-apunta la request para un dispatch async y retorna el path destino
    ///
    /// Sin `target` se vuelve a la URI original.
    pub(crate) fn prepare_async_dispatch(&self, target: Option<&str>) -> String {
        let mut request = lock(&self.request);

        if request.attribute(attributes::ASYNC_REQUEST_URI).is_none() {
            let path = request.path().to_string();
            let query = request.query_string().to_string();
            request.set_attribute(attributes::ASYNC_REQUEST_URI, &path);
            request.set_attribute(attributes::ASYNC_QUERY_STRING, &query);
        }

        let target = match target {
            Some(target) if !target.is_empty() => target.to_string(),
            _ => {
                let path = request.attribute(attributes::ASYNC_REQUEST_URI).unwrap_or("/");
                match request.attribute(attributes::ASYNC_QUERY_STRING) {
                    Some(query) if !query.is_empty() => format!("{}?{}", path, query),
                    _ => path.to_string(),
                }
            }
        };

        request.set_target(&target);
        request.set_dispatcher_type(DispatcherType::Async);
        request.path().to_string()
    }

    /// Prepara el forward a la página de error: status 500 y atributos
    pub(crate) fn prepare_error_dispatch(&self, page: &str, fault: &Fault) -> String {
        let path = {
            let mut request = lock(&self.request);
            request.set_attribute(attributes::ERROR_MESSAGE, &fault.to_string());
            request.set_attribute(
                attributes::ERROR_STATUS,
                &StatusCode::InternalServerError.as_u16().to_string(),
            );
            request.set_target(page);
            request.set_dispatcher_type(DispatcherType::Error);
            request.path().to_string()
        };

        let mut response = lock(&self.response);
        if response.reset().is_ok() {
            let _ = response.set_status(StatusCode::InternalServerError);
        }
        path
    }
}

/// Request que ven listeners y workers
pub trait ServletRequest: Send + Sync {
    /// Exchange subyacente
    fn exchange(&self) -> &Arc<Exchange>;

    fn is_wrapper(&self) -> bool {
        false
    }

    fn path(&self) -> String {
        self.exchange().path()
    }

    fn query_param(&self, name: &str) -> Option<String> {
        self.exchange().query_param(name)
    }

    fn attribute(&self, name: &str) -> Option<String> {
        self.exchange().attribute(name)
    }

    fn set_attribute(&self, name: &str, value: &str) {
        self.exchange().set_attribute(name, value)
    }

    fn dispatcher_type(&self) -> DispatcherType {
        self.exchange().dispatcher_type()
    }

    fn is_async_started(&self) -> bool {
        self.exchange().is_async_started()
    }
}

/// Respuesta que ven listeners y workers
pub trait ServletResponse: Send + Sync {
    fn exchange(&self) -> &Arc<Exchange>;

    fn is_wrapper(&self) -> bool {
        false
    }

    fn status(&self) -> StatusCode {
        self.exchange().status()
    }

    fn set_status(&self, status: StatusCode) {
        self.exchange().set_status(status)
    }

    fn set_header(&self, name: &str, value: &str) {
        self.exchange().set_header(name, value)
    }

    fn write(&self, chunk: &str) {
        self.exchange().write(chunk)
    }

    fn flush(&self) -> io::Result<()> {
        self.exchange().flush()
    }

    fn send_error(&self, status: StatusCode, message: &str) -> Result<(), AlreadyCommitted> {
        self.exchange().send_error(status, message)
    }

    fn is_committed(&self) -> bool {
        self.exchange().is_committed()
    }
}

pub type SuppliedRequest = Arc<dyn ServletRequest>;
pub type SuppliedResponse = Arc<dyn ServletResponse>;

struct RequestFacade {
    exchange: Arc<Exchange>,
}

impl ServletRequest for RequestFacade {
    fn exchange(&self) -> &Arc<Exchange> {
        &self.exchange
    }
}

struct ResponseFacade {
    exchange: Arc<Exchange>,
}

impl ServletResponse for ResponseFacade {
    fn exchange(&self) -> &Arc<Exchange> {
        &self.exchange
    }
}

/// Wrapper de request con atributos locales
///
/// Los atributos que se fijan en el wrapper tapan a los de la request
/// envuelta; el resto se delega.
pub struct RequestWrapper {
    inner: SuppliedRequest,
    attributes: Mutex<HashMap<String, String>>,
}

impl RequestWrapper {
    pub fn new(inner: SuppliedRequest) -> Self {
        Self {
            inner,
            attributes: Mutex::new(HashMap::new()),
        }
    }

    pub fn inner(&self) -> &SuppliedRequest {
        &self.inner
    }
}

impl ServletRequest for RequestWrapper {
    fn exchange(&self) -> &Arc<Exchange> {
        self.inner.exchange()
    }

    fn is_wrapper(&self) -> bool {
        true
    }

    fn path(&self) -> String {
        self.inner.path()
    }

    fn query_param(&self, name: &str) -> Option<String> {
        self.inner.query_param(name)
    }

    fn attribute(&self, name: &str) -> Option<String> {
        lock(&self.attributes)
            .get(name)
            .cloned()
            .or_else(|| self.inner.attribute(name))
    }

    fn set_attribute(&self, name: &str, value: &str) {
        lock(&self.attributes).insert(name.to_string(), value.to_string());
    }

    fn dispatcher_type(&self) -> DispatcherType {
        self.inner.dispatcher_type()
    }
}

/// Wrapper de respuesta que cuenta los bytes escritos a través de él
pub struct ResponseWrapper {
    inner: SuppliedResponse,
    written: AtomicUsize,
}

impl ResponseWrapper {
    pub fn new(inner: SuppliedResponse) -> Self {
        Self {
            inner,
            written: AtomicUsize::new(0),
        }
    }

    pub fn inner(&self) -> &SuppliedResponse {
        &self.inner
    }

    pub fn bytes_written(&self) -> usize {
        self.written.load(Ordering::SeqCst)
    }
}

impl ServletResponse for ResponseWrapper {
    fn exchange(&self) -> &Arc<Exchange> {
        self.inner.exchange()
    }

    fn is_wrapper(&self) -> bool {
        true
    }

    fn status(&self) -> StatusCode {
        self.inner.status()
    }

    fn set_status(&self, status: StatusCode) {
        self.inner.set_status(status)
    }

    fn set_header(&self, name: &str, value: &str) {
        self.inner.set_header(name, value)
    }

    fn write(&self, chunk: &str) {
        self.written.fetch_add(chunk.len(), Ordering::SeqCst);
        self.inner.write(chunk)
    }

    fn flush(&self) -> io::Result<()> {
        self.inner.flush()
    }

    fn send_error(&self, status: StatusCode, message: &str) -> Result<(), AlreadyCommitted> {
        self.inner.send_error(status, message)
    }

    fn is_committed(&self) -> bool {
        self.inner.is_committed()
    }
}
