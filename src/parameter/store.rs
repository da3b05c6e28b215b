//! Contracts between parameters and their backing stores.
//!
//! Two storage planes exist: a key/value *parameter store* holding serialized
//! parameter URIs, and a *blob storage* holding the payload of `file`
//! parameters. Both are pluggable; concrete drivers live behind these traits.

use async_trait::async_trait;
use tokio::sync::mpsc;
use url::Url;

use crate::errors::Result;

use super::model::{Parameter, ParameterOptions};

/// Metadata key under which stores record the path prefix a parameter was
/// pulled from, so a later `put` can write it back to the same scope.
pub const PATH_PREFIX_METADATA: &str = "path_prefix";

/// A streaming pull of every parameter under a URL's path scope.
///
/// The store emits parameters into `result` and closes the channel by
/// dropping the sender; the terminal error travels through the `pull` return
/// value.
pub struct PullRequest {
    pub url: Url,
    pub options: ParameterOptions,
    pub result: mpsc::Sender<Parameter>,
}

impl PullRequest {
    /// Construct a parameter owned by this pull, from a stored URI string.
    pub fn parameter_from_url_str(&self, key: impl Into<String>, url_str: &str) -> Result<Parameter> {
        self.options.parameter_from_url_str(key, url_str)
    }
}

/// Streaming read side of a parameter store.
#[async_trait]
pub trait ParameterReader: Send + Sync {
    /// Stream every parameter in the request's path scope into the request
    /// channel. Close the channel when complete; return the terminal error.
    async fn pull(&self, request: PullRequest) -> Result<()>;
}

/// Write side of a parameter store.
#[async_trait]
pub trait ParameterWriter: Send + Sync {
    /// Record the parameter's serialized URL under a backend-specific key
    /// derived from its metadata.
    async fn put(&self, parameter: &Parameter) -> Result<()>;
}

/// A parameter store supports both the streaming pull and the write.
pub trait ParameterStore: ParameterReader + ParameterWriter {}

impl<T: ParameterReader + ParameterWriter> ParameterStore for T {}

/// Download side of blob storage.
#[async_trait]
pub trait BlobDownloader: Send + Sync {
    /// Fill the parameter's byte buffer from the blob named by its URI
    /// host + path. Fails with `FileNotFound` when the blob is absent.
    async fn download(&self, parameter: &mut Parameter) -> Result<()>;
}

/// Upload side of blob storage.
#[async_trait]
pub trait BlobUploader: Send + Sync {
    /// Write the parameter's byte buffer to the blob named by its URI
    /// host + path.
    async fn upload(&self, parameter: &Parameter) -> Result<()>;
}

/// Blob storage supports both directions.
pub trait BlobStorage: BlobDownloader + BlobUploader {}

impl<T: BlobDownloader + BlobUploader> BlobStorage for T {}
