//! Capture pipeline
//!
//! Everything between the forwarding path and the observers: per-request
//! capture records, the fixed ring that addresses them, and the broadcast
//! bus carrying summary updates.

pub mod bus;
pub mod model;
pub mod record;

pub use bus::EventBus;
pub use model::{DataChunk, DataType, RequestStatus, RequestSummary};
pub use record::{CaptureRecord, RecordRegistry, BODY_TOO_LARGE, MAX_BODY_SIZE, RING_CAPACITY};
