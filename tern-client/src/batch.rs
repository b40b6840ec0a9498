//! Per-proxy accumulation of batch oneway requests.

use bytes::Bytes;
use std::sync::Mutex;
use tern_core::protocol::{finish_message, start_batch, REQUEST_ID_OFFSET};
use tern_core::{lock, OutputStream};

struct Batch {
    stream: OutputStream,
    count: usize,
}

impl Batch {
    fn new() -> Self {
        let mut stream = OutputStream::new();
        start_batch(&mut stream);
        Self { stream, count: 0 }
    }

    fn take(&mut self) -> (Bytes, usize) {
        let mut full = std::mem::replace(self, Batch::new());
        full.stream.rewrite_int(REQUEST_ID_OFFSET, full.count as i32);
        finish_message(&mut full.stream);
        (full.stream.freeze(), full.count)
    }
}

pub struct BatchRequestQueue {
    batch: Mutex<Batch>,
    /// Bytes; zero disables automatic flushing.
    auto_flush_size: usize,
}

impl BatchRequestQueue {
    pub fn new(auto_flush_size: usize) -> Self {
        Self {
            batch: Mutex::new(Batch::new()),
            auto_flush_size,
        }
    }

    /// Append one request (header and parameter encapsulation). When the
    /// request would push the batch over the auto-flush size, the batch
    /// accumulated so far is returned for flushing and the request starts a
    /// new one.
    pub fn enqueue(&self, request: &[u8]) -> Option<(Bytes, usize)> {
        let mut batch = lock(&self.batch);
        let flushed = (self.auto_flush_size > 0
            && batch.count > 0
            && batch.stream.len() + request.len() > self.auto_flush_size)
            .then(|| batch.take());
        batch.stream.write_raw(request);
        batch.count += 1;
        flushed
    }

    /// The complete batch frame and its request count, or `None` when
    /// nothing is queued.
    pub fn swap(&self) -> Option<(Bytes, usize)> {
        let mut batch = lock(&self.batch);
        (batch.count > 0).then(|| batch.take())
    }

    pub fn len(&self) -> usize {
        lock(&self.batch).count
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tern_core::protocol::{read_header, MessageType};
    use tern_core::version::ENCODING_1_1;
    use tern_core::{Identity, InputStream, OperationMode, RequestHeader};

    fn request(operation: &str) -> Bytes {
        let mut out = OutputStream::new();
        RequestHeader {
            identity: Identity::named("obj"),
            facet: String::new(),
            operation: operation.into(),
            mode: OperationMode::Normal,
            context: Default::default(),
        }
        .write(&mut out);
        out.write_empty_encapsulation(ENCODING_1_1);
        out.freeze()
    }

    #[test]
    fn test_swap_produces_counted_frame() {
        let queue = BatchRequestQueue::new(0);
        assert!(queue.swap().is_none());
        queue.enqueue(&request("a"));
        queue.enqueue(&request("b"));

        let (frame, count) = queue.swap().unwrap();
        assert_eq!(count, 2);
        assert!(queue.is_empty());

        let mut input = InputStream::new(frame.clone());
        let header = read_header(&mut input).unwrap();
        assert_eq!(header.message_type, MessageType::RequestBatch);
        assert_eq!(header.size, frame.len());
        assert_eq!(input.read_int().unwrap(), 2);
        assert_eq!(RequestHeader::read(&mut input).unwrap().operation, "a");
        input.read_encapsulation_payload().unwrap();
        assert_eq!(RequestHeader::read(&mut input).unwrap().operation, "b");
    }

    #[test]
    fn test_auto_flush_returns_previous_batch() {
        let one = request("op");
        let queue = BatchRequestQueue::new(14 + 4 + one.len() * 2);
        assert!(queue.enqueue(&one).is_none());
        assert!(queue.enqueue(&one).is_none());
        let (_, count) = queue.enqueue(&one).unwrap();
        assert_eq!(count, 2);
        assert_eq!(queue.len(), 1);
    }
}
