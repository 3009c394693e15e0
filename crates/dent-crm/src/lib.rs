//! dent-crm
//!
//! Typed facade over the CRM's webhook HTTP/JSON API. Three concerns live
//! here and nowhere else:
//!
//! 1. **Per-call retry** — applied exactly once, inside [`CrmClient::call`].
//!    Call sites must never wrap client methods in their own retry; stacked
//!    retry multiplies worst-case latency and duplicates side effects.
//! 2. **Rate limiting** — a token-bucket that caps outbound calls per
//!    second across every caller, batch and point operations alike.
//! 3. **Batch coalescing** — up to 50 sub-requests per HTTP call, with the
//!    hard contract that empty input produces an empty map and zero calls.

mod batch;
mod client;
mod error;
pub mod fields;
mod limiter;
mod ops;
mod types;

pub use batch::{BatchCommand, BATCH_LIMIT};
pub use client::{CrmClient, CrmClientConfig};
pub use error::CrmError;
pub use limiter::RateLimiter;
pub use types::{ConvertedLead, Deal, Fields, Lead};
