//! Retry decisions and the timer queue delaying retried invocations.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tern_core::{lock, OperationMode, RpcError, TraceLevels};
use tern_transport::{AsyncRequest, CancellationHandler};
use tokio::task::JoinHandle;
use tracing::info;

use crate::reference::Reference;

/// The operation being retried, as far as the policy cares.
pub struct RetryContext<'a> {
    pub reference: &'a Reference,
    pub operation: &'a str,
    pub mode: OperationMode,
    /// The request left the process at least once.
    pub sent: bool,
    /// Batch flushes are never retried.
    pub batch: bool,
}

pub struct RetryPolicy {
    intervals: Vec<i32>,
    traces: TraceLevels,
}

impl RetryPolicy {
    pub fn new(intervals: Vec<i32>, traces: TraceLevels) -> Self {
        Self { intervals, traces }
    }

    pub fn intervals(&self) -> &[i32] {
        &self.intervals
    }

    /// Whether a request failing with `err` may be sent again, and after
    /// which delay. `count` is the number of counted retries so far and is
    /// advanced when a counted retry is granted.
    pub fn next_interval(&self, call: &RetryContext<'_>, err: &RpcError, count: &mut usize) -> Option<Duration> {
        if !(err.is_local() || err.is_request_failed()) {
            return None;
        }

        // A request that may have been executed is only replayed when doing
        // so twice is harmless.
        let replayable = !call.sent
            || call.mode.is_idempotent()
            || matches!(err, RpcError::CloseConnection | RpcError::ObjectNotExist(_));
        if !replayable {
            self.trace_no_retry(call, err, "operation may have been executed");
            return None;
        }

        if call.batch || call.reference.is_fixed() {
            return None;
        }

        if let RpcError::ObjectNotExist(failed) = err {
            if let Some(router) = call.reference.router_info() {
                if failed.operation == "ice_add_proxy" {
                    router.clear_cache(call.reference);
                    if self.traces.retry >= 1 {
                        info!(
                            target: "tern::retry",
                            proxy = %call.reference,
                            "retrying operation call to add proxy to router"
                        );
                    }
                    return Some(Duration::ZERO);
                }
            }
            if !call.reference.is_indirect() {
                return None;
            }
            if call.reference.is_well_known() {
                if let Some(locator) = call.reference.locator_info() {
                    locator.clear_cache(call.reference);
                }
            }
        } else if err.is_request_failed()
            || err.is_marshal()
            || matches!(
                err,
                RpcError::CommunicatorDestroyed
                    | RpcError::ObjectAdapterDeactivated(_)
                    | RpcError::ObjectAdapterDestroyed(_)
                    | RpcError::ConnectionManuallyClosed { .. }
                    | RpcError::InvocationTimeout
                    | RpcError::InvocationCanceled
            )
        {
            return None;
        }

        *count += 1;
        let interval = if *count == self.intervals.len() + 1 && *err == RpcError::CloseConnection {
            // A graceful close is always worth one more attempt.
            0
        } else if *count > self.intervals.len() {
            self.trace_no_retry(call, err, "retry limit has been exceeded");
            return None;
        } else {
            self.intervals[*count - 1]
        };

        if self.traces.retry >= 1 {
            info!(
                target: "tern::retry",
                operation = call.operation,
                proxy = %call.reference,
                attempt = *count,
                interval_ms = interval,
                error = %err,
                "retrying operation call"
            );
        }
        Some(Duration::from_millis(interval.max(0) as u64))
    }

    fn trace_no_retry(&self, call: &RetryContext<'_>, err: &RpcError, reason: &str) {
        if self.traces.retry >= 1 {
            info!(
                target: "tern::retry",
                operation = call.operation,
                proxy = %call.reference,
                error = %err,
                reason,
                "cannot retry operation call"
            );
        }
    }
}

/// An invocation waiting in the retry queue.
pub trait Retryable: Send + Sync {
    /// Register the queue as the invocation's cancellation handler.
    fn cancelable(&self, handler: Arc<dyn CancellationHandler>) -> Result<(), RpcError>;

    /// The delay elapsed: send again.
    fn retry(self: Arc<Self>);

    /// The retry was abandoned.
    fn retry_failed(&self, err: RpcError);
}

#[derive(Default)]
struct QueueState {
    next_id: u64,
    tasks: HashMap<u64, (Arc<dyn Retryable>, JoinHandle<()>)>,
    destroyed: bool,
}

pub struct RetryQueue {
    state: Arc<Mutex<QueueState>>,
}

impl RetryQueue {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(QueueState::default())),
        }
    }

    /// Schedule `request` to be retried after `delay`.
    pub fn add(&self, request: Arc<dyn Retryable>, delay: Duration) -> Result<(), RpcError> {
        let mut state = lock(&self.state);
        if state.destroyed {
            return Err(RpcError::CommunicatorDestroyed);
        }
        state.next_id += 1;
        let id = state.next_id;

        request.cancelable(Arc::new(RetryTask {
            queue: Arc::downgrade(&self.state),
            id,
        }))?;

        let queue = Arc::downgrade(&self.state);
        let timer = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let entry = queue.upgrade().and_then(|q| lock(&q).tasks.remove(&id));
            if let Some((request, _)) = entry {
                request.retry();
            }
        });
        state.tasks.insert(id, (request, timer));
        Ok(())
    }

    pub fn len(&self) -> usize {
        lock(&self.state).tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Fail every queued retry with `CommunicatorDestroyed` and refuse new
    /// ones.
    pub fn destroy(&self) {
        let tasks: Vec<_> = {
            let mut state = lock(&self.state);
            state.destroyed = true;
            state.tasks.drain().map(|(_, task)| task).collect()
        };
        for (request, timer) in tasks {
            timer.abort();
            request.retry_failed(RpcError::CommunicatorDestroyed);
        }
    }
}

impl Default for RetryQueue {
    fn default() -> Self {
        Self::new()
    }
}

/// Cancellation handler of one queued retry.
struct RetryTask {
    queue: Weak<Mutex<QueueState>>,
    id: u64,
}

impl CancellationHandler for RetryTask {
    fn request_canceled(&self, _request: &Arc<dyn AsyncRequest>, err: RpcError) {
        let entry = self
            .queue
            .upgrade()
            .and_then(|q| lock(&q).tasks.remove(&self.id));
        if let Some((request, timer)) = entry {
            timer.abort();
            request.retry_failed(err);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tern_core::version::ENCODING_1_1;
    use tern_core::{Endpoint, Identity, InvocationMode, RequestFailed};

    use crate::reference::{Routable, Target};

    fn direct() -> Reference {
        Reference::new(
            Identity::named("obj"),
            InvocationMode::Twoway,
            ENCODING_1_1,
            Target::Routable(Routable::new(vec![Endpoint::tcp("h", 1)], String::new())),
        )
    }

    fn call(reference: &Reference, mode: OperationMode, sent: bool) -> RetryContext<'_> {
        RetryContext {
            reference,
            operation: "op",
            mode,
            sent,
            batch: false,
        }
    }

    fn policy(intervals: Vec<i32>) -> RetryPolicy {
        RetryPolicy::new(intervals, TraceLevels::default())
    }

    #[test]
    fn test_retry_bound() {
        let r = direct();
        let policy = policy(vec![0, 100]);
        let err = RpcError::ConnectionLost("reset".into());
        let mut count = 0;
        let call = call(&r, OperationMode::Normal, false);
        assert_eq!(policy.next_interval(&call, &err, &mut count), Some(Duration::ZERO));
        assert_eq!(policy.next_interval(&call, &err, &mut count), Some(Duration::from_millis(100)));
        assert_eq!(policy.next_interval(&call, &err, &mut count), None);
    }

    #[test]
    fn test_sent_mutating_call_not_replayed() {
        let r = direct();
        let policy = policy(vec![0, 0, 0]);
        let mut count = 0;
        let err = RpcError::ConnectionLost("reset".into());
        assert_eq!(policy.next_interval(&call(&r, OperationMode::Normal, true), &err, &mut count), None);
        assert!(policy
            .next_interval(&call(&r, OperationMode::Idempotent, true), &err, &mut count)
            .is_some());
        assert!(policy
            .next_interval(&call(&r, OperationMode::Normal, true), &RpcError::CloseConnection, &mut count)
            .is_some());
    }

    #[test]
    fn test_close_connection_gets_one_extra_attempt() {
        let r = direct();
        let policy = policy(vec![0]);
        let mut count = 0;
        let call = call(&r, OperationMode::Normal, true);
        assert!(policy.next_interval(&call, &RpcError::CloseConnection, &mut count).is_some());
        assert_eq!(policy.next_interval(&call, &RpcError::CloseConnection, &mut count), Some(Duration::ZERO));
        assert_eq!(policy.next_interval(&call, &RpcError::CloseConnection, &mut count), None);
    }

    #[test]
    fn test_terminal_errors_not_retried() {
        let r = direct();
        let policy = policy(vec![0, 0]);
        let call = call(&r, OperationMode::Idempotent, false);
        for err in [
            RpcError::InvocationTimeout,
            RpcError::InvocationCanceled,
            RpcError::CommunicatorDestroyed,
            RpcError::marshal("bad"),
            RpcError::ConnectionManuallyClosed { graceful: true },
            RpcError::FacetNotExist(RequestFailed::default()),
            RpcError::UnknownLocal("x".into()),
        ] {
            let mut count = 0;
            assert_eq!(policy.next_interval(&call, &err, &mut count), None, "{err}");
            assert_eq!(count, 0);
        }
    }

    #[test]
    fn test_object_not_exist_on_direct_reference_fails() {
        let r = direct();
        let mut count = 0;
        let err = RpcError::ObjectNotExist(RequestFailed::default());
        assert_eq!(
            policy(vec![0]).next_interval(&call(&r, OperationMode::Normal, true), &err, &mut count),
            None
        );
    }

    #[test]
    fn test_object_not_exist_on_indirect_reference_retries() {
        let r = Reference::new(
            Identity::named("obj"),
            InvocationMode::Twoway,
            ENCODING_1_1,
            Target::Routable(Routable::new(Vec::new(), "Svc".into())),
        );
        let mut count = 0;
        let err = RpcError::ObjectNotExist(RequestFailed::default());
        assert!(policy(vec![0])
            .next_interval(&call(&r, OperationMode::Normal, true), &err, &mut count)
            .is_some());
    }

    #[test]
    fn test_batch_never_retried() {
        let r = direct();
        let mut count = 0;
        let mut call = call(&r, OperationMode::Idempotent, false);
        call.batch = true;
        assert_eq!(
            policy(vec![0]).next_interval(&call, &RpcError::ConnectionLost("x".into()), &mut count),
            None
        );
    }

    struct AcceptingRouter;

    #[async_trait::async_trait]
    impl crate::router_info::Router for AcceptingRouter {
        async fn get_client_endpoints(&self) -> Result<Vec<Endpoint>, RpcError> {
            Ok(vec![Endpoint::mem("router", 1)])
        }

        async fn add_proxies(&self, _: Vec<tern_core::ProxyData>) -> Result<Vec<tern_core::ProxyData>, RpcError> {
            Ok(Vec::new())
        }
    }

    #[tokio::test]
    async fn test_router_add_proxy_failure_clears_router_cache() {
        let router = crate::router_info::RouterInfo::new(Arc::new(AcceptingRouter), TraceLevels::default());
        let mut routable = Routable::new(vec![Endpoint::tcp("h", 1)], String::new());
        routable.router_info = Some(router.clone());
        let r = Reference::new(
            Identity::named("obj"),
            InvocationMode::Twoway,
            ENCODING_1_1,
            Target::Routable(routable),
        );
        router.add_proxy(&r).await.unwrap();
        assert!(router.is_added(&Identity::named("obj")));

        let policy = policy(vec![100]);
        let mut count = 0;
        let err = RpcError::ObjectNotExist(RequestFailed::new(Identity::named("obj"), "", "ice_add_proxy"));
        assert_eq!(
            policy.next_interval(&call(&r, OperationMode::Normal, true), &err, &mut count),
            Some(Duration::ZERO)
        );
        assert!(!router.is_added(&Identity::named("obj")));
        assert_eq!(count, 0);

        // Any other operation on a direct routed reference fails as usual.
        router.add_proxy(&r).await.unwrap();
        let err = RpcError::ObjectNotExist(RequestFailed::new(Identity::named("obj"), "", "op"));
        assert_eq!(
            policy.next_interval(&call(&r, OperationMode::Normal, true), &err, &mut count),
            None
        );
        assert!(router.is_added(&Identity::named("obj")));
    }

    struct Probe {
        retries: AtomicUsize,
        failures: Mutex<Vec<RpcError>>,
        handler: Mutex<Option<Arc<dyn CancellationHandler>>>,
    }

    impl Probe {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                retries: AtomicUsize::new(0),
                failures: Mutex::new(Vec::new()),
                handler: Mutex::new(None),
            })
        }
    }

    impl Retryable for Probe {
        fn cancelable(&self, handler: Arc<dyn CancellationHandler>) -> Result<(), RpcError> {
            *lock(&self.handler) = Some(handler);
            Ok(())
        }

        fn retry(self: Arc<Self>) {
            self.retries.fetch_add(1, Ordering::SeqCst);
        }

        fn retry_failed(&self, err: RpcError) {
            lock(&self.failures).push(err);
        }
    }

    struct NopRequest;

    impl AsyncRequest for NopRequest {
        fn message(&self) -> bytes::Bytes {
            bytes::Bytes::new()
        }
        fn is_twoway(&self) -> bool {
            true
        }
        fn cancelable(&self, _: Arc<dyn CancellationHandler>) -> Result<(), RpcError> {
            Ok(())
        }
        fn sent(&self) {}
        fn completed(&self, _: tern_core::InputStream) {}
        fn completed_with_error(&self, _: RpcError) {}
    }

    #[tokio::test(start_paused = true)]
    async fn test_queue_retries_after_delay() {
        let queue = RetryQueue::new();
        let probe = Probe::new();
        queue.add(probe.clone(), Duration::from_millis(100)).unwrap();
        assert_eq!(queue.len(), 1);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(probe.retries.load(Ordering::SeqCst), 0);
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(probe.retries.load(Ordering::SeqCst), 1);
        assert!(queue.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_removes_queued_retry() {
        let queue = RetryQueue::new();
        let probe = Probe::new();
        queue.add(probe.clone(), Duration::from_secs(10)).unwrap();

        let handler = lock(&probe.handler).clone().unwrap();
        let request: Arc<dyn AsyncRequest> = Arc::new(NopRequest);
        handler.request_canceled(&request, RpcError::InvocationCanceled);

        assert!(queue.is_empty());
        assert_eq!(*lock(&probe.failures), vec![RpcError::InvocationCanceled]);
        tokio::time::sleep(Duration::from_secs(11)).await;
        assert_eq!(probe.retries.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_destroy_fails_queued_retries() {
        let queue = RetryQueue::new();
        let probe = Probe::new();
        queue.add(probe.clone(), Duration::from_secs(1)).unwrap();
        queue.destroy();

        assert_eq!(*lock(&probe.failures), vec![RpcError::CommunicatorDestroyed]);
        assert_eq!(
            queue.add(Probe::new(), Duration::ZERO).unwrap_err(),
            RpcError::CommunicatorDestroyed
        );
    }
}
