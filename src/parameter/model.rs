//! Parameter model: a URI-keyed value with a scheme-derived kind.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

use percent_encoding::percent_decode_str;
use url::Url;

use crate::errors::{MeshplaneError, Result};

use super::store::{BlobDownloader, BlobUploader, ParameterWriter};

/// URI scheme for environment-style variables.
pub const VAR_SCHEME: &str = "var";
/// URI scheme for blob-backed files.
pub const FILE_SCHEME: &str = "file";

/// Kind of a parameter, derived purely from its URI scheme.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParameterKind {
    Var,
    File,
    Unknown,
}

/// Shared dependency bundle for parameters.
///
/// The bundle is shared immutably between every parameter a source restores;
/// parameters hold a back-pointer to it, never to the source itself.
#[derive(Clone)]
pub struct ParameterOptions {
    pub downloader: Arc<dyn BlobDownloader>,
    pub uploader: Arc<dyn BlobUploader>,
    pub writer: Arc<dyn ParameterWriter>,
}

impl ParameterOptions {
    pub fn new(
        downloader: Arc<dyn BlobDownloader>,
        uploader: Arc<dyn BlobUploader>,
        writer: Arc<dyn ParameterWriter>,
    ) -> Self {
        Self { downloader, uploader, writer }
    }

    /// Construct a parameter from a pre-parsed URI.
    pub fn new_parameter(&self, key: impl Into<String>, uri: Url) -> Parameter {
        Parameter {
            options: self.clone(),
            key: key.into(),
            uri,
            file: Vec::new(),
            metadata: HashMap::new(),
        }
    }

    /// Construct a parameter from a URI string.
    pub fn parameter_from_url_str(&self, key: impl Into<String>, url_str: &str) -> Result<Parameter> {
        let uri = Url::parse(url_str)?;
        Ok(self.new_parameter(key, uri))
    }

    /// Construct a `var` parameter carrying `value` in the URI fragment.
    pub fn var_parameter(&self, key: impl Into<String>, value: &str) -> Result<Parameter> {
        let mut uri = Url::parse(&format!("{}:", VAR_SCHEME))?;
        uri.set_fragment(Some(value));
        Ok(self.new_parameter(key, uri))
    }
}

impl fmt::Debug for ParameterOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ParameterOptions").finish_non_exhaustive()
    }
}

/// A URI-addressed configuration unit.
///
/// The byte buffer of a `file` parameter stays empty until the first
/// successful [`Parameter::load`].
#[derive(Clone)]
pub struct Parameter {
    options: ParameterOptions,
    key: String,
    uri: Url,
    file: Vec<u8>,
    metadata: HashMap<String, String>,
}

impl Parameter {
    pub fn key(&self) -> &str {
        &self.key
    }

    /// The serialized form of the parameter URI.
    pub fn url_string(&self) -> String {
        self.uri.to_string()
    }

    /// Kind of this parameter, derived from the URI scheme alone.
    pub fn kind(&self) -> ParameterKind {
        match self.uri.scheme() {
            VAR_SCHEME => ParameterKind::Var,
            FILE_SCHEME => ParameterKind::File,
            _ => ParameterKind::Unknown,
        }
    }

    /// URI fragment, percent-decoded. Carries the `var` payload and the
    /// `file` destination hint.
    pub fn fragment(&self) -> String {
        self.uri
            .fragment()
            .map(|f| percent_decode_str(f).decode_utf8_lossy().into_owned())
            .unwrap_or_default()
    }

    pub fn host(&self) -> &str {
        self.uri.host_str().unwrap_or_default()
    }

    pub fn path(&self) -> &str {
        self.uri.path()
    }

    /// Query parameters as a map view.
    pub fn query(&self) -> BTreeMap<String, String> {
        self.uri
            .query_pairs()
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect()
    }

    /// Replace the whole query string atomically.
    pub fn set_query(&mut self, values: &BTreeMap<String, String>) {
        if values.is_empty() {
            self.uri.set_query(None);
            return;
        }
        let mut serializer = url::form_urlencoded::Serializer::new(String::new());
        for (key, value) in values {
            serializer.append_pair(key, value);
        }
        let query = serializer.finish();
        self.uri.set_query(Some(&query));
    }

    /// Byte payload of a `file` parameter.
    pub fn file(&self) -> &[u8] {
        &self.file
    }

    /// Mutable access to the byte payload, used by blob downloaders and by
    /// callers staging content before a push.
    pub fn file_mut(&mut self) -> &mut Vec<u8> {
        &mut self.file
    }

    /// Opaque store hints (e.g. path prefixes) propagated by providers.
    pub fn metadata(&self) -> &HashMap<String, String> {
        &self.metadata
    }

    pub fn metadata_mut(&mut self) -> &mut HashMap<String, String> {
        &mut self.metadata
    }

    /// Fill the byte buffer from blob storage. Valid only for `file`
    /// parameters; the buffer is reset before the download.
    pub async fn load(&mut self) -> Result<()> {
        if self.kind() != ParameterKind::File {
            return Err(MeshplaneError::LoadOnlyFileType);
        }

        self.file.clear();

        let downloader = self.options.downloader.clone();
        downloader.download(self).await
    }

    /// Persist the parameter: the writer records the parameter first, then,
    /// for `file` parameters, the uploader stores the byte buffer.
    pub async fn push(&self) -> Result<()> {
        if self.kind() == ParameterKind::Unknown {
            return Err(MeshplaneError::UnknownScheme {
                scheme: self.uri.scheme().to_string(),
            });
        }

        self.options.writer.put(self).await?;

        if self.kind() == ParameterKind::File {
            self.options.uploader.upload(self).await?;
        }

        Ok(())
    }
}

impl fmt::Debug for Parameter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Parameter")
            .field("key", &self.key)
            .field("uri", &self.uri.as_str())
            .field("kind", &self.kind())
            .field("file_len", &self.file.len())
            .finish()
    }
}
