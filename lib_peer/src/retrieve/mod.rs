//! # Retrieval
//!
//! HTTP collaborators of the realtime transport.
//!
//! - **`ky_http`**: the shared retrying JSON client.
//! - **`candidates`**: rendezvous-server batches from the public list.
//! - **`signaling`**: the discovery/signaling long-poll client.

pub mod candidates;
pub mod ky_http;
pub mod signaling;

pub use candidates::HttpCandidateSource;
pub use ky_http::{ApiClient, ApiResponse};
pub use signaling::HttpSignaling;
