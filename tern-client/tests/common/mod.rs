// Shared fixtures for the client integration tests.
// - a Hello servant
// - communicator builders over a shared memory network
// - a scripted connector whose connections fail, reply or hang on demand

#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tern_client::{Communicator, CommunicatorOptions};
use tern_core::version::ENCODING_1_1;
use tern_core::{
    CommunicatorObserver, Endpoint, Identity, InputStream, OutputStream, Properties, RpcError,
    TraceLevels, Transport, UserException,
};
use tern_server::servant::OBJECT_TYPE_ID;
use tern_server::{init_test_logging, IncomingRequest, Object, ObjectAdapter};
use tern_transport::{
    same_request, AsyncRequest, AsyncStatus, CancellationHandler, CloseMode, Connection,
    Connector, MemoryNetwork,
};

pub const HELLO_TYPE_ID: &str = "::Demo::Hello";
pub const GREETING_ERROR: &str = "::Demo::GreetingError";

#[derive(Default)]
pub struct Hello {
    calls: AtomicUsize,
}

impl Hello {
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Object for Hello {
    fn type_ids(&self) -> Vec<String> {
        vec![HELLO_TYPE_ID.to_string(), OBJECT_TYPE_ID.to_string()]
    }

    async fn dispatch(&self, request: &IncomingRequest) -> Result<Bytes, RpcError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let mut params = request.params();
        let mut out = OutputStream::new();
        match request.current.operation.as_str() {
            "sayHello" => {
                let name = params.read_string()?;
                out.write_string(&format!("Hello, {}!", name));
            }
            "add" => {
                let a = params.read_int()?;
                let b = params.read_int()?;
                out.write_int(a + b);
            }
            "fail" => {
                let mut payload = OutputStream::new();
                payload.write_string("no greeting today");
                return Err(RpcError::User(UserException::new(
                    GREETING_ERROR,
                    payload.freeze(),
                )));
            }
            "slow" => {
                let ms = params.read_int()?;
                tokio::time::sleep(Duration::from_millis(ms as u64)).await;
            }
            "count" => out.write_int(self.calls() as i32),
            "panic" => panic!("hello servant gave up"),
            _ => return Err(tern_server::operation_not_exist(&request.current)),
        }
        Ok(out.freeze())
    }
}

pub fn string_param(s: &str) -> Vec<u8> {
    let mut out = OutputStream::new();
    out.write_string(s);
    out.as_slice().to_vec()
}

pub fn int_params(values: &[i32]) -> Vec<u8> {
    let mut out = OutputStream::new();
    for v in values {
        out.write_int(*v);
    }
    out.as_slice().to_vec()
}

pub fn properties(pairs: &[(&str, &str)]) -> Properties {
    let mut props = Properties::new();
    for (key, value) in pairs {
        props.set(*key, *value);
    }
    props
}

pub fn communicator(network: &Arc<MemoryNetwork>, pairs: &[(&str, &str)]) -> Communicator {
    init_test_logging();
    Communicator::with_options(CommunicatorOptions {
        properties: properties(pairs),
        network: Some(network.clone()),
        ..Default::default()
    })
    .unwrap()
}

pub fn observed_communicator(
    network: &Arc<MemoryNetwork>,
    pairs: &[(&str, &str)],
    observer: Arc<dyn CommunicatorObserver>,
) -> Communicator {
    init_test_logging();
    Communicator::with_options(CommunicatorOptions {
        properties: properties(pairs),
        network: Some(network.clone()),
        observer: Some(observer),
        ..Default::default()
    })
    .unwrap()
}

/// Host a Hello servant as `hello` on an active adapter of `server`.
pub fn serve_hello(server: &Communicator, name: &str, endpoints: &str) -> (Arc<ObjectAdapter>, Arc<Hello>) {
    let adapter = server
        .create_object_adapter_with_endpoints(name, endpoints)
        .unwrap();
    let hello = Arc::new(Hello::default());
    adapter.add(hello.clone(), Identity::named("hello")).unwrap();
    adapter.activate(server.network()).unwrap();
    (adapter, hello)
}

/// Poll `condition` until it holds or two seconds pass.
pub async fn eventually(mut condition: impl FnMut() -> bool) -> bool {
    for _ in 0..400 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    condition()
}

pub fn read_string(reply: Bytes) -> String {
    InputStream::new(reply).read_string().unwrap()
}

/// What a scripted connection does with the next request it is given.
#[derive(Debug, Clone)]
pub enum Action {
    /// Refuse the request before it leaves the process.
    FailBeforeSend(RpcError),
    /// Send the request, then lose the connection before the reply.
    FailAfterSend(RpcError),
    /// Answer with a successful reply carrying `payload`.
    Reply(Bytes),
    /// Send the request and never answer.
    Hang,
}

#[derive(Default)]
pub struct Script {
    actions: Mutex<VecDeque<Action>>,
    connect_failures: Mutex<VecDeque<RpcError>>,
    pending: Mutex<Vec<Arc<dyn AsyncRequest>>>,
    sends: AtomicUsize,
    connects: AtomicUsize,
}

impl Script {
    pub fn new(actions: impl IntoIterator<Item = Action>) -> Arc<Self> {
        let script = Self::default();
        script.actions.lock().unwrap().extend(actions);
        Arc::new(script)
    }

    pub fn push(&self, action: Action) {
        self.actions.lock().unwrap().push_back(action);
    }

    pub fn fail_next_connect(&self, err: RpcError) {
        self.connect_failures.lock().unwrap().push_back(err);
    }

    pub fn sends(&self) -> usize {
        self.sends.load(Ordering::SeqCst)
    }

    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn pending(&self) -> usize {
        self.pending.lock().unwrap().len()
    }

    fn next(&self) -> Action {
        self.actions
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Action::Reply(Bytes::new()))
    }
}

/// Collects warnings logged on the current thread while installed.
#[derive(Clone, Default)]
pub struct CapturedLogs(Arc<Mutex<Vec<u8>>>);

impl CapturedLogs {
    pub fn install(&self) -> tracing::subscriber::DefaultGuard {
        let logs = self.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::WARN)
            .with_ansi(false)
            .with_writer(move || logs.clone())
            .finish();
        tracing::subscriber::set_default(subscriber)
    }

    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
    }
}

impl std::io::Write for CapturedLogs {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

/// Handles tcp endpoints with scripted connections.
pub struct ScriptedConnector {
    script: Arc<Script>,
    next_id: AtomicU64,
}

impl ScriptedConnector {
    pub fn new(script: Arc<Script>) -> Arc<Self> {
        Arc::new(Self {
            script,
            next_id: AtomicU64::new(1),
        })
    }
}

#[async_trait]
impl Connector for ScriptedConnector {
    fn handles(&self, transport: Transport) -> bool {
        transport == Transport::Tcp
    }

    async fn connect(
        &self,
        endpoint: &Endpoint,
        _traces: TraceLevels,
    ) -> Result<Arc<dyn Connection>, RpcError> {
        self.script.connects.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = self.script.connect_failures.lock().unwrap().pop_front() {
            return Err(err);
        }
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let connection = Arc::new_cyclic(|this: &Weak<ScriptedConnection>| ScriptedConnection {
            id,
            endpoint: endpoint.clone(),
            script: self.script.clone(),
            closed: Mutex::new(false),
            this: this.clone(),
        });
        Ok(connection as Arc<dyn Connection>)
    }
}

pub struct ScriptedConnection {
    id: u64,
    endpoint: Endpoint,
    script: Arc<Script>,
    closed: Mutex<bool>,
    this: Weak<ScriptedConnection>,
}

fn ok_reply(payload: &[u8]) -> InputStream {
    let mut out = OutputStream::new();
    out.write_byte(0);
    out.write_encapsulation_payload(ENCODING_1_1, payload);
    InputStream::new(out.freeze())
}

impl CancellationHandler for ScriptedConnection {
    fn request_canceled(&self, request: &Arc<dyn AsyncRequest>, err: RpcError) {
        let removed = {
            let mut pending = self.script.pending.lock().unwrap();
            let index = pending.iter().position(|r| same_request(r, request));
            index.map(|i| pending.remove(i))
        };
        if let Some(request) = removed {
            request.completed_with_error(err);
        }
    }
}

impl Connection for ScriptedConnection {
    fn id(&self) -> u64 {
        self.id
    }

    fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    fn send_async_request(&self, request: Arc<dyn AsyncRequest>) -> Result<AsyncStatus, RpcError> {
        if *self.closed.lock().unwrap() {
            return Err(CloseMode::Forcefully.error());
        }
        self.script.sends.fetch_add(1, Ordering::SeqCst);
        let action = self.script.next();
        if let Action::FailBeforeSend(err) = action {
            return Err(err);
        }

        let Some(this) = self.this.upgrade() else {
            return Err(RpcError::ConnectionLost("connection dropped".into()));
        };
        request.cancelable(this)?;
        if request.is_twoway() && matches!(action, Action::Hang) {
            self.script.pending.lock().unwrap().push(request.clone());
        }
        request.sent();
        if !request.is_twoway() {
            return Ok(AsyncStatus::Sent);
        }

        match action {
            Action::FailAfterSend(err) => {
                tokio::spawn(async move { request.completed_with_error(err) });
            }
            Action::Reply(payload) => {
                tokio::spawn(async move { request.completed(ok_reply(&payload)) });
            }
            Action::Hang | Action::FailBeforeSend(_) => {}
        }
        Ok(AsyncStatus::Sent)
    }

    fn close(&self, _mode: CloseMode) {
        *self.closed.lock().unwrap() = true;
    }

    fn is_closed(&self) -> bool {
        *self.closed.lock().unwrap()
    }
}

/// A communicator whose tcp endpoints reach scripted connections.
pub fn scripted_communicator(script: &Arc<Script>, pairs: &[(&str, &str)]) -> Communicator {
    init_test_logging();
    let connector: Arc<dyn Connector> = ScriptedConnector::new(script.clone());
    Communicator::with_options(CommunicatorOptions {
        properties: properties(pairs),
        connectors: vec![connector],
        ..Default::default()
    })
    .unwrap()
}
