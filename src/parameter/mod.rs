//! # Parameter Resolution
//!
//! URI-addressed configuration units. A parameter is identified by a string
//! key and carries a URI whose scheme determines its kind:
//!
//! - `var`: the value lives in the URI fragment (environment-style variable)
//! - `file`: the URI names a blob in external storage; the payload is a
//!   byte buffer loaded on demand
//!
//! Parameters are restored in bulk from a key/value store ([`ParameterSource`])
//! and pushed back through the store plus, for files, a blob uploader.

pub mod memory;
pub mod model;
pub mod source;
pub mod store;

pub use model::{Parameter, ParameterKind, ParameterOptions};
pub use source::{ParameterSource, SourceOptions, WellKnown};
pub use store::{
    BlobDownloader, BlobStorage, BlobUploader, ParameterReader, ParameterStore, ParameterWriter,
    PullRequest, PATH_PREFIX_METADATA,
};
