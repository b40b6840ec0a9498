//! The state machine of one invocation.
//!
//! An invocation is created with its complete request frame, handed to the
//! proxy's request handler and then driven by callbacks: `sent` once the
//! frame left the process, `completed` with the reply, or
//! `completed_with_error`. Local failures are offered to the retry policy
//! before they become the invocation's result. Cancellation and invocation
//! timeouts share one path: the error is recorded and delivered to whichever
//! cancellation handler currently holds the request.

use bytes::{Bytes, BytesMut};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tern_core::observer::{InvocationObserver, ObserverHandle};
use tern_core::{
    lock, InputStream, OperationMode, ReplyStatus, RequestFailed, RpcError, UserException,
};
use tern_transport::{AsyncRequest, CancellationHandler};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::warn;

use crate::proxy::ObjectPrx;
use crate::request_handler::RequestHandler;
use crate::retry::{RetryContext, Retryable};

const SENT: u8 = 1;
const DONE: u8 = 2;
const OK: u8 = 4;
const CACHED_BUFFERS: u8 = 8;

pub(crate) enum InvocationKind {
    Request {
        operation: String,
        mode: OperationMode,
        user_exceptions: Vec<String>,
    },
    FlushBatch {
        count: usize,
    },
}

impl InvocationKind {
    fn operation(&self) -> &str {
        match self {
            InvocationKind::Request { operation, .. } => operation,
            InvocationKind::FlushBatch { .. } => "ice_flushBatchRequests",
        }
    }

    fn mode(&self) -> OperationMode {
        match self {
            InvocationKind::Request { mode, .. } => *mode,
            InvocationKind::FlushBatch { .. } => OperationMode::Normal,
        }
    }
}

type SentCallback = Box<dyn FnOnce() + Send>;
type CompletedCallback = Box<dyn FnOnce(&Result<Bytes, RpcError>) + Send>;

#[derive(Default)]
struct State {
    flags: u8,
    cancellation_handler: Option<Arc<dyn CancellationHandler>>,
    /// Once set, every later `cancelable` fails with it.
    cancellation_error: Option<RpcError>,
    handler: Option<Arc<dyn RequestHandler>>,
    collocated: bool,
    retry_count: usize,
    retried: bool,
    timer: Option<JoinHandle<()>>,
    on_sent: Option<SentCallback>,
    on_completed: Option<CompletedCallback>,
}

pub struct OutgoingAsync {
    proxy: ObjectPrx,
    kind: InvocationKind,
    frame: Mutex<Bytes>,
    twoway: bool,
    state: Mutex<State>,
    result: watch::Sender<Option<Result<Bytes, RpcError>>>,
    observer: ObserverHandle<dyn InvocationObserver>,
    this: Weak<OutgoingAsync>,
}

impl OutgoingAsync {
    pub(crate) fn new(
        proxy: ObjectPrx,
        kind: InvocationKind,
        frame: Bytes,
        observer: ObserverHandle<dyn InvocationObserver>,
    ) -> Arc<Self> {
        let twoway = matches!(kind, InvocationKind::Request { .. }) && proxy.reference().mode().is_twoway();
        let (result, _) = watch::channel(None);
        Arc::new_cyclic(|this| Self {
            proxy,
            kind,
            frame: Mutex::new(frame),
            twoway,
            state: Mutex::new(State::default()),
            result,
            observer,
            this: this.clone(),
        })
    }

    /// An invocation that completed without a round trip, such as a request
    /// added to a batch.
    pub(crate) fn completed_locally(proxy: ObjectPrx, kind: InvocationKind) -> Arc<Self> {
        let outgoing = Self::new(proxy, kind, Bytes::new(), ObserverHandle::none());
        lock(&outgoing.state).flags |= SENT;
        outgoing.finish(Ok(Bytes::new()));
        outgoing
    }

    pub fn operation(&self) -> &str {
        self.kind.operation()
    }

    pub fn proxy(&self) -> &ObjectPrx {
        &self.proxy
    }

    pub fn is_sent(&self) -> bool {
        lock(&self.state).flags & SENT != 0
    }

    pub fn is_done(&self) -> bool {
        lock(&self.state).flags & DONE != 0
    }

    /// Number of times the request was sent again.
    pub fn retry_count(&self) -> usize {
        lock(&self.state).retry_count
    }

    /// Start the invocation, arming the invocation timeout first.
    pub(crate) fn invoke(self: &Arc<Self>) {
        let timeout = self.proxy.reference().invocation_timeout();
        if timeout > 0 {
            let outgoing = Arc::downgrade(self);
            let timer = tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(timeout as u64)).await;
                if let Some(outgoing) = outgoing.upgrade() {
                    outgoing.cancel_with(RpcError::InvocationTimeout);
                }
            });
            lock(&self.state).timer = Some(timer);
        }
        self.invoke_impl();
    }

    fn invoke_impl(self: &Arc<Self>) {
        loop {
            if self.is_done() {
                return;
            }
            let request: Arc<dyn AsyncRequest> = self.clone();
            let sent = self.proxy.request_handler().and_then(|handler| {
                {
                    let mut state = lock(&self.state);
                    state.handler = Some(handler.clone());
                    state.collocated = handler.is_collocated();
                }
                handler.send_async_request(request)
            });
            let Err(err) = sent else {
                return;
            };

            let handler = lock(&self.state).handler.take();
            match self.retry_interval(&err) {
                Some(delay) => {
                    if let Some(handler) = handler {
                        self.proxy.clear_request_handler(&handler);
                    }
                    if !delay.is_zero() {
                        self.schedule_retry(delay);
                        return;
                    }
                }
                None => {
                    self.finish(Err(err));
                    return;
                }
            }
        }
    }

    fn retry_interval(&self, err: &RpcError) -> Option<Duration> {
        let (sent, mut count) = {
            let state = lock(&self.state);
            (state.flags & SENT != 0, state.retry_count)
        };
        let call = RetryContext {
            reference: self.proxy.reference(),
            operation: self.kind.operation(),
            mode: self.kind.mode(),
            sent,
            batch: matches!(self.kind, InvocationKind::FlushBatch { .. }),
        };
        let interval = self
            .proxy
            .instance()
            .retry_policy()
            .next_interval(&call, err, &mut count);
        if interval.is_some() {
            {
                let mut state = lock(&self.state);
                state.retry_count = count;
                state.retried = true;
            }
            if let Some(observer) = self.observer.get() {
                observer.retried();
            }
        }
        interval
    }

    fn schedule_retry(self: &Arc<Self>, delay: Duration) {
        let retryable: Arc<dyn Retryable> = self.clone();
        if let Err(err) = self.proxy.instance().retry_queue().add(retryable, delay) {
            self.finish(Err(err));
        }
    }

    /// Offer a failure to the retry policy; retries always go through the
    /// retry queue so they never run inside a connection callback.
    fn handle_exception(self: &Arc<Self>, err: RpcError) {
        let handler = lock(&self.state).handler.take();
        match self.retry_interval(&err) {
            Some(delay) => {
                if let Some(handler) = handler {
                    self.proxy.clear_request_handler(&handler);
                }
                self.schedule_retry(delay);
            }
            None => self.finish(Err(err)),
        }
    }

    pub fn cancel(&self) {
        self.cancel_with(RpcError::InvocationCanceled);
    }

    pub(crate) fn cancel_with(&self, err: RpcError) {
        let handler = {
            let mut state = lock(&self.state);
            if state.flags & DONE != 0 {
                return;
            }
            state.cancellation_error = Some(err.clone());
            state.cancellation_handler.clone()
        };
        if let (Some(handler), Some(this)) = (handler, self.this.upgrade()) {
            let request: Arc<dyn AsyncRequest> = this;
            handler.request_canceled(&request, err);
        }
    }

    /// Run `callback` once the request has been sent, immediately if it
    /// already was.
    pub fn on_sent(&self, callback: impl FnOnce() + Send + 'static) {
        {
            let mut state = lock(&self.state);
            if state.flags & SENT == 0 {
                state.on_sent = Some(Box::new(callback));
                return;
            }
        }
        self.run_callback(callback);
    }

    /// Run `callback` with the result once the invocation completes,
    /// immediately if it already did.
    pub fn on_completed(&self, callback: impl FnOnce(&Result<Bytes, RpcError>) + Send + 'static) {
        {
            let mut state = lock(&self.state);
            if state.flags & DONE == 0 {
                state.on_completed = Some(Box::new(callback));
                return;
            }
        }
        let result = self.result.borrow().clone();
        if let Some(result) = result {
            self.run_callback(move || callback(&result));
        }
    }

    /// Wait for the invocation to complete. `Ok` carries the encoded return
    /// values of a twoway call.
    pub async fn response(&self) -> Result<Bytes, RpcError> {
        let mut result = self.result.subscribe();
        let done = result
            .wait_for(Option::is_some)
            .await
            .map_err(|_| RpcError::CommunicatorDestroyed)?;
        match &*done {
            Some(result) => result.clone(),
            None => Err(RpcError::CommunicatorDestroyed),
        }
    }

    /// User callbacks must not take the runtime down with them.
    fn run_callback(&self, callback: impl FnOnce()) {
        if catch_unwind(AssertUnwindSafe(callback)).is_err()
            && self.proxy.instance().settings().warn_ami_callback
        {
            warn!(
                operation = self.kind.operation(),
                proxy = %self.proxy,
                "exception raised by invocation callback"
            );
        }
    }

    fn finish(&self, result: Result<Bytes, RpcError>) {
        let (timer, callback, recycle) = {
            let mut state = lock(&self.state);
            if state.flags & DONE != 0 {
                return;
            }
            state.flags |= DONE;
            if result.is_ok() {
                state.flags |= OK;
            }
            state.cancellation_handler = None;
            state.handler = None;

            let timeout = self.proxy.reference().invocation_timeout() > 0;
            let recycle = self.proxy.shared().caches_buffers()
                && !state.retried
                && !(state.collocated && timeout)
                && state.flags & CACHED_BUFFERS == 0;
            if recycle {
                state.flags |= CACHED_BUFFERS;
            }
            (state.timer.take(), state.on_completed.take(), recycle)
        };

        if let Some(timer) = timer {
            timer.abort();
        }
        match &result {
            Ok(_) => {}
            Err(RpcError::User(_)) => {
                if let Some(observer) = self.observer.get() {
                    observer.user_exception();
                }
            }
            Err(err) => self.observer.failed(err.kind()),
        }
        self.observer.detach();

        if recycle {
            let frame = std::mem::take(&mut *lock(&self.frame));
            if !frame.is_empty() {
                self.proxy.shared().recycle(BytesMut::from(frame));
            }
        }

        self.result.send_replace(Some(result.clone()));
        if let Some(callback) = callback {
            self.run_callback(move || callback(&result));
        }
    }

    fn read_reply(&self, input: &mut InputStream) -> Result<Bytes, RpcError> {
        let status = input.read_byte()?;
        match ReplyStatus::from_u8(status) {
            Some(ReplyStatus::Ok) => {
                let (_, payload) = input.read_encapsulation_payload()?;
                Ok(payload)
            }
            Some(ReplyStatus::UserException) => {
                let (_, payload) = input.read_encapsulation_payload()?;
                let mut exception = InputStream::new(payload);
                let type_id = exception.read_string()?;
                let declared = match &self.kind {
                    InvocationKind::Request { user_exceptions, .. } => {
                        user_exceptions.iter().any(|id| *id == type_id)
                    }
                    InvocationKind::FlushBatch { .. } => false,
                };
                if declared {
                    Err(RpcError::User(UserException::new(type_id, exception.rest())))
                } else {
                    Err(RpcError::UnknownUser(type_id))
                }
            }
            Some(
                status @ (ReplyStatus::ObjectNotExist
                | ReplyStatus::FacetNotExist
                | ReplyStatus::OperationNotExist),
            ) => {
                let identity = input.read_identity()?;
                let facet = input.read_facet()?;
                let operation = input.read_string()?;
                let reference = self.proxy.reference();
                // Older peers leave the target fields empty.
                let failed = RequestFailed {
                    identity: if identity.name.is_empty() {
                        reference.identity().clone()
                    } else {
                        identity
                    },
                    facet: if facet.is_empty() {
                        reference.facet().to_string()
                    } else {
                        facet
                    },
                    operation: if operation.is_empty() {
                        self.kind.operation().to_string()
                    } else {
                        operation
                    },
                };
                Err(match status {
                    ReplyStatus::ObjectNotExist => RpcError::ObjectNotExist(failed),
                    ReplyStatus::FacetNotExist => RpcError::FacetNotExist(failed),
                    _ => RpcError::OperationNotExist(failed),
                })
            }
            Some(ReplyStatus::UnknownException) => Err(RpcError::Unknown(input.read_string()?)),
            Some(ReplyStatus::UnknownLocalException) => {
                Err(RpcError::UnknownLocal(input.read_string()?))
            }
            Some(ReplyStatus::UnknownUserException) => {
                Err(RpcError::UnknownUser(input.read_string()?))
            }
            None => Err(RpcError::UnknownReplyStatus(status)),
        }
    }
}

impl AsyncRequest for OutgoingAsync {
    fn message(&self) -> Bytes {
        lock(&self.frame).clone()
    }

    fn is_twoway(&self) -> bool {
        self.twoway
    }

    fn cancelable(&self, handler: Arc<dyn CancellationHandler>) -> Result<(), RpcError> {
        let mut state = lock(&self.state);
        if let Some(err) = &state.cancellation_error {
            return Err(err.clone());
        }
        state.cancellation_handler = Some(handler);
        Ok(())
    }

    fn sent(&self) {
        let callback = {
            let mut state = lock(&self.state);
            state.flags |= SENT;
            if !self.twoway {
                state.cancellation_handler = None;
            }
            state.on_sent.take()
        };
        if let Some(callback) = callback {
            self.run_callback(callback);
        }
        if !self.twoway {
            self.finish(Ok(Bytes::new()));
        }
    }

    fn completed(&self, mut reply: InputStream) {
        match self.read_reply(&mut reply) {
            Ok(payload) => self.finish(Ok(payload)),
            Err(err) if err.is_request_failed() => {
                if let Some(this) = self.this.upgrade() {
                    this.handle_exception(err);
                }
            }
            Err(err) => self.finish(Err(err)),
        }
    }

    fn completed_with_error(&self, err: RpcError) {
        if let Some(this) = self.this.upgrade() {
            this.handle_exception(err);
        }
    }
}

impl Retryable for OutgoingAsync {
    fn cancelable(&self, handler: Arc<dyn CancellationHandler>) -> Result<(), RpcError> {
        AsyncRequest::cancelable(self, handler)
    }

    fn retry(self: Arc<Self>) {
        self.invoke_impl();
    }

    fn retry_failed(&self, err: RpcError) {
        self.finish(Err(err));
    }
}

impl std::fmt::Debug for OutgoingAsync {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut s = f.debug_struct("OutgoingAsync");
        s.field("operation", &self.kind.operation());
        if let InvocationKind::FlushBatch { count } = &self.kind {
            s.field("batched", count);
        }
        s
            .field("proxy", &self.proxy.to_string())
            .field("sent", &self.is_sent())
            .field("done", &self.is_done())
            .finish()
    }
}
