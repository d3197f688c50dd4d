//! Capture record and request ring
//!
//! One [`CaptureRecord`] tracks a single intercepted request from the
//! moment its headers are parsed until both bodies are finalized (or an
//! error ends it). Forwarding tasks drive the record through `report_*`
//! calls; observers stream the accumulated state without ever gating the
//! forwarding path.
//!
//! Records live in a fixed ring indexed by `id % capacity`; a slot lookup
//! only succeeds while the slot still holds the requested id, so stale ids
//! resolve to nothing instead of another request's data.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use chrono::Utc;
use http::{HeaderMap, Method, StatusCode};
use parking_lot::{Mutex, RwLock};
use tokio::sync::{mpsc, Notify};
use tracing::{debug, error, info};

use super::bus::EventBus;
use super::model::{
    headers_to_json, DataChunk, DataType, HeaderMapJson, RequestStatus, RequestSummary,
};

/// In-flight tracking slots; older records become unreachable to observers.
pub const RING_CAPACITY: usize = 1000;

/// Decoded bodies beyond this size are replaced by [`BODY_TOO_LARGE`].
pub const MAX_BODY_SIZE: usize = 100 * 1024 * 1024;

/// Sentinel stored in place of an oversized captured body.
pub const BODY_TOO_LARGE: &[u8] = b"Body too large!";

/// Chunks buffered per observer before its own stream backpressures.
const OBSERVER_CHANNEL_CAPACITY: usize = 64;

/// Progress marker over the observable phases of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Init,
    RequestHeader,
    RequestBody,
    ResponseHeader,
    ResponseBody,
    Error,
}

impl Phase {
    fn ordinal(self) -> Option<i16> {
        match self {
            Phase::Init => Some(-1),
            Phase::RequestHeader => Some(0),
            Phase::RequestBody => Some(1),
            Phase::ResponseHeader => Some(2),
            Phase::ResponseBody => Some(3),
            Phase::Error => None,
        }
    }

    /// Whether this phase is at or past the given chunk type. `Error` is a
    /// sink, not part of the ordering; callers check it explicitly first.
    fn reached(self, data_type: DataType) -> bool {
        matches!(self.ordinal(), Some(ordinal) if ordinal >= data_type.code() as i16)
    }

    /// Moves the cursor forward, never backward. An origin that responds
    /// before draining the request body must not regress the cursor when
    /// the request side finally finishes.
    fn advance(&mut self, to: Phase) {
        match (self.ordinal(), to.ordinal()) {
            (Some(current), Some(next)) if next > current => *self = to,
            _ => {}
        }
    }
}

#[derive(Debug)]
struct RecordInner {
    summary: RequestSummary,
    request_headers: HeaderMapJson,
    response_headers: HeaderMapJson,
    request_body: Vec<u8>,
    response_body: Vec<u8>,
    req_chunks: Vec<Vec<u8>>,
    resp_chunks: Vec<Vec<u8>>,
    req_overflowed: bool,
    resp_overflowed: bool,
    body_size: usize,
    phase: Phase,
    finished: bool,
    error: Option<String>,
}

/// Per-request capture state shared between the forwarding tasks and any
/// number of observers.
#[derive(Debug)]
pub struct CaptureRecord {
    id: i64,
    inner: Mutex<RecordInner>,
    notify: Notify,
    bus: EventBus,
}

impl CaptureRecord {
    fn new(id: i64, bus: EventBus) -> Self {
        Self {
            id,
            inner: Mutex::new(RecordInner {
                summary: RequestSummary::new(id),
                request_headers: HeaderMapJson::new(),
                response_headers: HeaderMapJson::new(),
                request_body: Vec::new(),
                response_body: Vec::new(),
                req_chunks: Vec::new(),
                resp_chunks: Vec::new(),
                req_overflowed: false,
                resp_overflowed: false,
                body_size: 0,
                phase: Phase::Init,
                finished: false,
                error: None,
            }),
            notify: Notify::new(),
            bus,
        }
    }

    pub fn id(&self) -> i64 {
        self.id
    }

    /// Snapshot of the current summary.
    pub fn summary(&self) -> RequestSummary {
        self.inner.lock().summary.clone()
    }

    pub fn is_finished(&self) -> bool {
        self.inner.lock().finished
    }

    /// Finalized request body (empty until that phase completes).
    pub fn request_body(&self) -> Vec<u8> {
        self.inner.lock().request_body.clone()
    }

    /// Finalized response body (empty until the record completes).
    pub fn response_body(&self) -> Vec<u8> {
        self.inner.lock().response_body.clone()
    }

    /// Milliseconds from interception start to completion (or to now while
    /// still in flight).
    pub fn duration_ms(&self) -> i64 {
        let inner = self.inner.lock();
        let end = inner.summary.end_time.unwrap_or_else(Utc::now);
        (end - inner.summary.start_time).num_milliseconds()
    }

    /// Records the parsed request line and headers and enters the
    /// `RequestHeader` phase.
    pub fn report_request(&self, method: &Method, host: &str, url: &str, headers: &HeaderMap) {
        {
            let mut inner = self.inner.lock();
            if inner.phase == Phase::Error {
                return;
            }
            inner.summary.status = RequestStatus::Started;
            inner.summary.method = method.as_str().to_string();
            inner.summary.host = host.to_string();
            inner.summary.url = url.to_string();
            inner.request_headers = headers_to_json(headers);
            inner.phase.advance(Phase::RequestHeader);
        }
        info!(id = self.id, method = %method, url, "intercepted request");
        self.publish_and_wake();
    }

    /// Records the upstream response status and headers and enters the
    /// `ResponseHeader` phase.
    pub fn report_response(&self, status: StatusCode, headers: &HeaderMap) {
        {
            let mut inner = self.inner.lock();
            if inner.phase == Phase::Error {
                return;
            }
            inner.summary.status = RequestStatus::Receiving;
            inner.summary.status_code = status.as_u16();
            inner.summary.content_type = headers
                .get(http::header::CONTENT_TYPE)
                .map(|v| String::from_utf8_lossy(v.as_bytes()).into_owned())
                .unwrap_or_default();
            inner.response_headers = headers_to_json(headers);
            inner.phase.advance(Phase::ResponseHeader);
        }
        self.publish_and_wake();
    }

    /// Appends a decoded body chunk for the given direction.
    ///
    /// The chunk is copied; callers keep ownership of the buffer they are
    /// forwarding. Once the running size crosses [`MAX_BODY_SIZE`] the
    /// buffered chunks are replaced by the sentinel and later chunks for
    /// that direction are discarded.
    pub fn report_chunk(&self, direction: DataType, chunk: &[u8]) {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        if inner.phase == Phase::Error {
            return;
        }

        inner.body_size += chunk.len();
        let oversize = inner.body_size > MAX_BODY_SIZE;

        let (buffer, overflowed) = match direction {
            DataType::RequestBody => (&mut inner.req_chunks, &mut inner.req_overflowed),
            DataType::ResponseBody => (&mut inner.resp_chunks, &mut inner.resp_overflowed),
            _ => return,
        };

        if oversize {
            if !*overflowed {
                debug!(id = self.id, ?direction, "captured body exceeds limit, truncating");
                *buffer = vec![BODY_TOO_LARGE.to_vec()];
                *overflowed = true;
            }
            return;
        }

        buffer.push(chunk.to_vec());
        drop(guard);
        self.notify.notify_waiters();
    }

    /// Finalizes one body direction: buffered chunks are merged into the
    /// body field and the phase advances. `ResponseBody` completes the
    /// record.
    pub fn report_end(&self, direction: DataType) {
        {
            let mut inner = self.inner.lock();
            if inner.phase == Phase::Error {
                return;
            }
            match direction {
                DataType::RequestBody => {
                    inner.request_body = inner.req_chunks.concat();
                    inner.req_chunks.clear();
                    inner.phase.advance(Phase::RequestBody);
                    inner.body_size = 0;
                }
                DataType::ResponseBody => {
                    inner.summary.status = RequestStatus::Completed;
                    inner.summary.end_time = Some(Utc::now());
                    inner.response_body = inner.resp_chunks.concat();
                    inner.resp_chunks.clear();
                    inner.finished = true;
                    inner.phase.advance(Phase::ResponseBody);
                    inner.body_size = 0;
                }
                _ => return,
            }
        }
        if direction == DataType::ResponseBody {
            info!(
                id = self.id,
                duration_ms = self.duration_ms(),
                "request completed"
            );
        }
        self.publish_and_wake();
    }

    /// Terminates the record with an error. Any phase may transition here.
    pub fn report_error(&self, err: &dyn std::fmt::Display) {
        let message = err.to_string();
        {
            let mut inner = self.inner.lock();
            // First error wins; Error is a terminal sink.
            if inner.phase == Phase::Error {
                return;
            }
            error!(id = self.id, url = %inner.summary.url, error = %message, "proxy request failed");
            inner.summary.status = RequestStatus::Error;
            inner.summary.end_time = Some(Utc::now());
            inner.error = Some(message);
            inner.phase = Phase::Error;
        }
        self.publish_and_wake();
    }

    fn publish_and_wake(&self) {
        self.bus.publish(self.summary());
        self.notify.notify_waiters();
    }

    /// Streams the record to one observer as a sequence of detail chunks.
    ///
    /// Emission order is request headers, request body, response headers,
    /// response body, metadata; each data type carries exactly one
    /// `finished: true` chunk. An error state at any wait point yields a
    /// single error chunk and ends the stream. Dropping the receiver
    /// cancels the stream without affecting the record.
    pub fn subscribe_details(self: &Arc<Self>) -> mpsc::Receiver<DataChunk> {
        let (tx, rx) = mpsc::channel(OBSERVER_CHANNEL_CAPACITY);
        let record = Arc::clone(self);
        tokio::spawn(async move {
            // A closed channel just means the observer went away.
            let _ = record.stream_to(tx).await;
        });
        rx
    }

    async fn stream_to(&self, tx: mpsc::Sender<DataChunk>) -> Result<(), StreamClosed> {
        if let Err(message) = self.wait_phase(DataType::RequestHeader).await {
            return self.send_error(&tx, message).await;
        }
        let headers = serde_json::to_vec(&self.inner.lock().request_headers).unwrap_or_default();
        send(&tx, DataChunk::new(DataType::RequestHeader, headers, true)).await?;

        if let Err(message) = self.stream_body(&tx, DataType::RequestBody).await? {
            return self.send_error(&tx, message).await;
        }

        if let Err(message) = self.wait_phase(DataType::ResponseHeader).await {
            return self.send_error(&tx, message).await;
        }
        let headers = serde_json::to_vec(&self.inner.lock().response_headers).unwrap_or_default();
        send(&tx, DataChunk::new(DataType::ResponseHeader, headers, true)).await?;

        if let Err(message) = self.stream_body(&tx, DataType::ResponseBody).await? {
            return self.send_error(&tx, message).await;
        }

        let metadata = serde_json::to_vec(&self.summary()).unwrap_or_default();
        send(&tx, DataChunk::new(DataType::Metadata, metadata, true)).await
    }

    async fn send_error(
        &self,
        tx: &mpsc::Sender<DataChunk>,
        message: String,
    ) -> Result<(), StreamClosed> {
        send(
            tx,
            DataChunk::new(DataType::Error, message.into_bytes(), true),
        )
        .await
    }

    /// Waits until the phase cursor reaches `data_type`, or returns the
    /// error message if the record errored first.
    async fn wait_phase(&self, data_type: DataType) -> Result<(), String> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let inner = self.inner.lock();
                if inner.phase == Phase::Error {
                    return Err(inner.error.clone().unwrap_or_default());
                }
                if inner.phase.reached(data_type) {
                    return Ok(());
                }
            }
            notified.await;
        }
    }

    /// Streams one body direction.
    ///
    /// If the phase already passed the direction, the finalized body goes
    /// out as a single terminal chunk. Otherwise buffered chunks stream as
    /// they arrive and the phase advance produces an empty terminal chunk,
    /// so each direction sees exactly one `finished: true`.
    async fn stream_body(
        &self,
        tx: &mpsc::Sender<DataChunk>,
        direction: DataType,
    ) -> Result<Result<(), String>, StreamClosed> {
        let mut emitted = 0usize;
        let mut streamed = false;
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            enum Step {
                Finish(Vec<u8>),
                Emit(Vec<Vec<u8>>),
                Wait,
            }

            let step = {
                let inner = self.inner.lock();
                if inner.phase == Phase::Error {
                    return Ok(Err(inner.error.clone().unwrap_or_default()));
                }
                if inner.phase.reached(direction) {
                    let data = if streamed {
                        Vec::new()
                    } else {
                        match direction {
                            DataType::RequestBody => inner.request_body.clone(),
                            _ => inner.response_body.clone(),
                        }
                    };
                    Step::Finish(data)
                } else {
                    let buffer = match direction {
                        DataType::RequestBody => &inner.req_chunks,
                        _ => &inner.resp_chunks,
                    };
                    if emitted < buffer.len() {
                        Step::Emit(buffer[emitted..].to_vec())
                    } else {
                        Step::Wait
                    }
                }
            };

            match step {
                Step::Finish(data) => {
                    send(tx, DataChunk::new(direction, data, true)).await?;
                    return Ok(Ok(()));
                }
                Step::Emit(batch) => {
                    emitted += batch.len();
                    streamed = true;
                    for chunk in batch {
                        send(tx, DataChunk::new(direction, chunk, false)).await?;
                    }
                }
                Step::Wait => notified.await,
            }
        }
    }
}

/// Marker error: the observer dropped its receiver.
struct StreamClosed;

async fn send(tx: &mpsc::Sender<DataChunk>, chunk: DataChunk) -> Result<(), StreamClosed> {
    tx.send(chunk).await.map_err(|_| StreamClosed)
}

/// Fixed-size ring of in-flight (and recently finished) records.
#[derive(Debug)]
pub struct RecordRegistry {
    slots: RwLock<Vec<Option<Arc<CaptureRecord>>>>,
    next_id: AtomicI64,
    bus: EventBus,
}

impl RecordRegistry {
    pub fn new(bus: EventBus) -> Self {
        Self::with_capacity(bus, RING_CAPACITY)
    }

    pub fn with_capacity(bus: EventBus, capacity: usize) -> Self {
        Self {
            slots: RwLock::new(vec![None; capacity]),
            next_id: AtomicI64::new(0),
            bus,
        }
    }

    /// Creates a fresh record, evicting whatever previously occupied its
    /// ring slot.
    pub fn create(&self) -> Arc<CaptureRecord> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let record = Arc::new(CaptureRecord::new(id, self.bus.clone()));
        let mut slots = self.slots.write();
        let capacity = slots.len();
        slots[id as usize % capacity] = Some(Arc::clone(&record));
        record
    }

    /// Looks up a record by id; stale ids whose slot was reused return
    /// `None`.
    pub fn get(&self, id: i64) -> Option<Arc<CaptureRecord>> {
        let slots = self.slots.read();
        let capacity = slots.len();
        slots[id.rem_euclid(capacity as i64) as usize]
            .as_ref()
            .filter(|record| record.id() == id)
            .cloned()
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_registry() -> RecordRegistry {
        RecordRegistry::with_capacity(EventBus::new(), 4)
    }

    #[test]
    fn ids_are_monotonic_from_one() {
        let registry = test_registry();
        assert_eq!(registry.create().id(), 1);
        assert_eq!(registry.create().id(), 2);
    }

    #[test]
    fn ring_lookup_rejects_stale_ids() {
        let registry = test_registry();
        let first = registry.create();
        assert_eq!(first.id(), 1);
        for _ in 0..4 {
            registry.create();
        }
        // Slot 1 now holds id 5; the old id must not resolve.
        assert!(registry.get(1).is_none());
        assert_eq!(registry.get(5).unwrap().id(), 5);
    }

    #[test]
    fn phase_ordering() {
        assert!(!Phase::Init.reached(DataType::RequestHeader));
        assert!(Phase::RequestHeader.reached(DataType::RequestHeader));
        assert!(!Phase::RequestHeader.reached(DataType::RequestBody));
        assert!(Phase::ResponseBody.reached(DataType::RequestBody));
        assert!(!Phase::Error.reached(DataType::RequestHeader));
    }

    #[test]
    fn report_request_publishes_summary() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        let registry = RecordRegistry::with_capacity(bus, 4);
        let record = registry.create();

        record.report_request(
            &Method::GET,
            "example.test",
            "http://example.test/",
            &HeaderMap::new(),
        );

        let summary = rx.try_recv().unwrap();
        assert_eq!(summary.status, RequestStatus::Started);
        assert_eq!(summary.method, "GET");
        assert_eq!(summary.url, "http://example.test/");
    }

    #[test]
    fn bodies_finalize_on_end() {
        let record = test_registry().create();
        record.report_chunk(DataType::RequestBody, b"hel");
        record.report_chunk(DataType::RequestBody, b"lo");
        record.report_end(DataType::RequestBody);

        let inner = record.inner.lock();
        assert_eq!(inner.request_body, b"hello");
        assert!(inner.req_chunks.is_empty());
        assert_eq!(inner.body_size, 0);
    }

    #[test]
    fn response_end_completes_record() {
        let record = test_registry().create();
        record.report_response(StatusCode::OK, &HeaderMap::new());
        record.report_chunk(DataType::ResponseBody, b"done");
        record.report_end(DataType::ResponseBody);

        assert!(record.is_finished());
        let summary = record.summary();
        assert_eq!(summary.status, RequestStatus::Completed);
        assert!(summary.end_time.is_some());
    }

    #[test]
    fn oversized_body_is_replaced_by_sentinel() {
        let record = test_registry().create();
        let chunk = vec![0u8; MAX_BODY_SIZE / 2 + 1];
        record.report_chunk(DataType::ResponseBody, &chunk);
        record.report_chunk(DataType::ResponseBody, &chunk);
        // Discarded: the direction already overflowed.
        record.report_chunk(DataType::ResponseBody, b"more");
        record.report_end(DataType::ResponseBody);

        assert_eq!(record.inner.lock().response_body, BODY_TOO_LARGE);
    }

    #[test]
    fn overflow_only_affects_its_direction() {
        let record = test_registry().create();
        record.report_chunk(DataType::RequestBody, b"small");
        record.report_end(DataType::RequestBody);

        let chunk = vec![0u8; MAX_BODY_SIZE + 1];
        record.report_chunk(DataType::ResponseBody, &chunk);
        record.report_end(DataType::ResponseBody);

        let inner = record.inner.lock();
        assert_eq!(inner.request_body, b"small");
        assert_eq!(inner.response_body, BODY_TOO_LARGE);
    }

    #[test]
    fn late_request_end_does_not_regress_the_cursor() {
        let record = test_registry().create();
        // Origin answered before draining the request body.
        record.report_response(StatusCode::OK, &HeaderMap::new());
        record.report_end(DataType::RequestBody);
        assert_eq!(record.inner.lock().phase, Phase::ResponseHeader);

        record.report_end(DataType::ResponseBody);
        assert!(record.is_finished());
    }

    #[test]
    fn error_sets_terminal_state() {
        let record = test_registry().create();
        record.report_error(&"connection refused");

        let summary = record.summary();
        assert_eq!(summary.status, RequestStatus::Error);
        assert!(summary.end_time.is_some());
        assert_eq!(
            record.inner.lock().error.as_deref(),
            Some("connection refused")
        );
    }
}
