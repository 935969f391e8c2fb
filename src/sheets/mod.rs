//! Upstream API client shell: typed method groups over the Sheets and Drive
//! HTTP APIs, wrapped in circuit breaking, retry, and token-bucket pacing.

pub mod client;
pub mod mock;
pub mod transport;
pub mod types;

pub use client::{EndpointGroup, SheetsClient};
pub use transport::{HttpTransport, SheetsTransport, UpstreamRequest};
pub use types::{
    Spreadsheet, UpdateValuesResponse, UpstreamError, UpstreamErrorKind, ValueRange,
};
