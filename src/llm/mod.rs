//! Text-generation capability boundary.
//!
//! The scheduler depends on exactly one external capability: generating text
//! from a prompt using a given credential. Everything behind that call
//! (which model, which backend, streaming or not) is opaque to the queue.
//!
//! [`TextGenerator`] is that boundary. [`client::BackendClient`] is the
//! production implementation that posts to the generation backend over HTTP;
//! tests substitute scripted implementations.

pub mod client;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::error::GenerationError;

pub use client::{BackendClient, BackendClientConfig};

/// The single external capability the scheduler needs.
///
/// Implementations must observe `cancel` and return
/// [`GenerationError::Cancelled`] promptly once it fires; the scheduler also
/// wraps every call in its own hard timeout, so a hung implementation cannot
/// block a worker indefinitely.
#[async_trait]
pub trait TextGenerator: Send + Sync {
    /// Generates text for `prompt` using `credential`.
    ///
    /// A successful result is non-empty; implementations should map an empty
    /// body to [`GenerationError::EmptyResponse`] rather than returning `""`.
    async fn generate(
        &self,
        credential: &str,
        prompt: &str,
        cancel: CancellationToken,
    ) -> Result<String, GenerationError>;
}
