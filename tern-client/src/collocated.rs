//! Dispatch into an object adapter hosted by this process, without a
//! connection.
//!
//! Requests are decoded from the same frames a connection would send, so
//! marshaling behaves identically. Every accepted request holds the
//! adapter's direct count until its dispatch finishes, which keeps adapter
//! deactivation waiting for collocated work.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use tern_core::protocol::{read_header, MessageType, HEADER_SIZE};
use tern_core::{lock, InputStream, RpcError, TraceLevels};
use tern_server::{IncomingRequest, ObjectAdapter, OutgoingResponse};
use tern_transport::{same_request, AsyncRequest, AsyncStatus, CancellationHandler, Connection};
use tracing::debug;

use crate::request_handler::RequestHandler;

/// One unit of the adapter's direct count, released on drop.
struct DirectCount(Arc<ObjectAdapter>);

impl DirectCount {
    fn acquire(adapter: &Arc<ObjectAdapter>) -> Result<Self, RpcError> {
        adapter.inc_direct_count()?;
        Ok(Self(adapter.clone()))
    }
}

impl Drop for DirectCount {
    fn drop(&mut self) {
        self.0.dec_direct_count();
    }
}

#[derive(Default)]
struct Pending {
    next_id: i32,
    requests: HashMap<i32, Arc<dyn AsyncRequest>>,
}

impl Pending {
    /// Ids are positive; 0 marks oneway and batched requests.
    fn allocate(&mut self) -> i32 {
        self.next_id = if self.next_id == i32::MAX { 1 } else { self.next_id + 1 };
        self.next_id
    }
}

pub struct CollocatedRequestHandler {
    adapter: Arc<ObjectAdapter>,
    traces: TraceLevels,
    pending: Mutex<Pending>,
    this: Weak<CollocatedRequestHandler>,
}

impl CollocatedRequestHandler {
    pub fn new(adapter: Arc<ObjectAdapter>, traces: TraceLevels) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            adapter,
            traces,
            pending: Mutex::new(Pending::default()),
            this: this.clone(),
        })
    }

    pub fn adapter(&self) -> &Arc<ObjectAdapter> {
        &self.adapter
    }

    fn decode(&self, frame: InputStream, request_id: i32) -> Result<Vec<IncomingRequest>, RpcError> {
        let mut input = frame;
        let header = read_header(&mut input)?;
        let name = self.adapter.name();
        match header.message_type {
            MessageType::Request => {
                input.read_int()?;
                Ok(vec![IncomingRequest::read(&mut input, request_id, name)?])
            }
            MessageType::RequestBatch => {
                let count = input.read_int()?;
                if count < 0 || count as usize > input.remaining() {
                    return Err(RpcError::marshal(format!("invalid batch request count {}", count)));
                }
                (0..count)
                    .map(|_| IncomingRequest::read(&mut input, 0, name))
                    .collect()
            }
            other => Err(RpcError::protocol(format!(
                "unexpected {:?} message for collocated dispatch",
                other
            ))),
        }
    }

    fn remove(&self, request_id: i32) -> Option<Arc<dyn AsyncRequest>> {
        lock(&self.pending).requests.remove(&request_id)
    }

    fn complete(&self, request_id: i32, response: OutgoingResponse) {
        let Some(request) = self.remove(request_id) else {
            return;
        };
        if self.traces.protocol >= 1 {
            debug!(
                target: "tern::protocol",
                adapter = %self.adapter.name(),
                request_id,
                status = ?response.status,
                "received collocated reply"
            );
        }
        let mut reply = InputStream::new(response.to_message(request_id));
        match reply.skip(HEADER_SIZE + 4) {
            Ok(()) => request.completed(reply),
            Err(err) => request.completed_with_error(err),
        }
    }
}

#[async_trait]
impl RequestHandler for CollocatedRequestHandler {
    fn send_async_request(&self, request: Arc<dyn AsyncRequest>) -> Result<AsyncStatus, RpcError> {
        let direct_count = DirectCount::acquire(&self.adapter)?;
        let handler: Arc<dyn CancellationHandler> = self
            .this
            .upgrade()
            .ok_or_else(|| RpcError::ObjectAdapterDestroyed(self.adapter.name().to_string()))?;

        let frame = request.message();
        let twoway = request.is_twoway();
        let request_id = {
            let mut pending = lock(&self.pending);
            request.cancelable(handler)?;
            if twoway {
                let id = pending.allocate();
                pending.requests.insert(id, request.clone());
                id
            } else {
                0
            }
        };

        let requests = match self.decode(InputStream::new(frame), request_id) {
            Ok(requests) => requests,
            Err(err) => {
                self.remove(request_id);
                return Err(err);
            }
        };

        if self.traces.protocol >= 1 {
            debug!(
                target: "tern::protocol",
                adapter = %self.adapter.name(),
                request_id,
                count = requests.len(),
                "dispatching collocated request"
            );
        }

        let handler = self.this.clone();
        let adapter = self.adapter.clone();
        tokio::spawn(async move {
            request.sent();
            let mut responses = Vec::with_capacity(requests.len());
            for incoming in requests {
                responses.push(adapter.dispatch(incoming).await);
            }
            drop(direct_count);

            if request_id != 0 {
                if let (Some(handler), Some(response)) = (handler.upgrade(), responses.pop()) {
                    handler.complete(request_id, response);
                }
            }
        });
        Ok(AsyncStatus::Queued)
    }

    async fn get_connection(&self) -> Result<Option<Arc<dyn Connection>>, RpcError> {
        Ok(None)
    }

    fn is_collocated(&self) -> bool {
        true
    }
}

impl CancellationHandler for CollocatedRequestHandler {
    fn request_canceled(&self, request: &Arc<dyn AsyncRequest>, err: RpcError) {
        let removed = {
            let mut pending = lock(&self.pending);
            let id = pending
                .requests
                .iter()
                .find(|(_, r)| same_request(r, request))
                .map(|(id, _)| *id);
            id.and_then(|id| pending.requests.remove(&id))
        };
        if let Some(request) = removed {
            request.completed_with_error(err);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use std::time::Duration;
    use tern_core::protocol::{finish_message, start_request, ReplyStatus};
    use tern_core::version::ENCODING_1_1;
    use tern_core::{Identity, OutputStream, RequestHeader};
    use tern_server::AdapterConfig;

    struct Recorded {
        frame: Bytes,
        refuse_handler: Option<RpcError>,
        sent: Mutex<bool>,
        outcome: Mutex<Option<Result<u8, RpcError>>>,
    }

    impl Recorded {
        fn new(frame: Bytes) -> Arc<Self> {
            Self::refusing(frame, None)
        }

        fn refusing(frame: Bytes, refuse_handler: Option<RpcError>) -> Arc<Self> {
            Arc::new(Self {
                frame,
                refuse_handler,
                sent: Mutex::new(false),
                outcome: Mutex::new(None),
            })
        }

        async fn outcome(&self) -> Result<u8, RpcError> {
            for _ in 0..200 {
                if let Some(outcome) = lock(&self.outcome).clone() {
                    return outcome;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            panic!("request never completed");
        }
    }

    impl AsyncRequest for Recorded {
        fn message(&self) -> Bytes {
            self.frame.clone()
        }
        fn is_twoway(&self) -> bool {
            true
        }
        fn cancelable(&self, _: Arc<dyn CancellationHandler>) -> Result<(), RpcError> {
            match &self.refuse_handler {
                Some(err) => Err(err.clone()),
                None => Ok(()),
            }
        }
        fn sent(&self) {
            *lock(&self.sent) = true;
        }
        fn completed(&self, mut reply: InputStream) {
            *lock(&self.outcome) = Some(reply.read_byte());
        }
        fn completed_with_error(&self, err: RpcError) {
            *lock(&self.outcome) = Some(Err(err));
        }
    }

    fn request(identity: &str) -> Bytes {
        let mut out = OutputStream::new();
        start_request(&mut out);
        RequestHeader {
            identity: Identity::named(identity),
            operation: "op".into(),
            ..Default::default()
        }
        .write(&mut out);
        out.write_empty_encapsulation(ENCODING_1_1);
        finish_message(&mut out);
        out.freeze()
    }

    fn handler() -> (Arc<ObjectAdapter>, Arc<CollocatedRequestHandler>) {
        let adapter = ObjectAdapter::new("A", AdapterConfig::default());
        let handler = CollocatedRequestHandler::new(adapter.clone(), TraceLevels::default());
        (adapter, handler)
    }

    #[tokio::test]
    async fn test_reply_delivered_after_direct_count_released() {
        let (adapter, handler) = handler();
        let request = Recorded::new(request("ghost"));
        let status = handler.send_async_request(request.clone()).unwrap();
        assert_eq!(status, AsyncStatus::Queued);

        let outcome = request.outcome().await.unwrap();
        assert_eq!(ReplyStatus::from_u8(outcome), Some(ReplyStatus::ObjectNotExist));
        assert!(*lock(&request.sent));
        assert_eq!(adapter.direct_count(), 0);
        assert!(lock(&handler.pending).requests.is_empty());
    }

    #[tokio::test]
    async fn test_undecodable_request_releases_direct_count() {
        let (adapter, handler) = handler();
        let mut truncated = request("obj").to_vec();
        truncated.truncate(truncated.len() - 8);
        let request = Recorded::new(Bytes::from(truncated));

        assert!(handler.send_async_request(request.clone()).is_err());
        assert_eq!(adapter.direct_count(), 0);
        assert!(lock(&handler.pending).requests.is_empty());
        assert!(!*lock(&request.sent));
    }

    #[tokio::test]
    async fn test_canceled_request_releases_direct_count() {
        let (adapter, handler) = handler();
        let request = Recorded::refusing(request("obj"), Some(RpcError::InvocationCanceled));

        assert_eq!(
            handler.send_async_request(request.clone()).unwrap_err(),
            RpcError::InvocationCanceled
        );
        assert_eq!(adapter.direct_count(), 0);
        assert!(lock(&handler.pending).requests.is_empty());
    }

    #[tokio::test]
    async fn test_deactivated_adapter_refuses_requests() {
        let (adapter, handler) = handler();
        adapter.deactivate().await;
        let err = handler
            .send_async_request(Recorded::new(request("obj")))
            .unwrap_err();
        assert_eq!(err, RpcError::ObjectAdapterDeactivated("A".into()));
        assert_eq!(adapter.direct_count(), 0);
    }
}
