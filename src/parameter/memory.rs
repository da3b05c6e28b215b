//! In-memory parameter store and blob storage.
//!
//! These drivers back the dev mode of the control plane and the test suites.
//! They implement the same contracts a cloud-backed driver would: the store
//! keeps serialized parameter URIs under slash-separated names, the blob
//! storage keeps byte payloads under `(host, path)`.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::errors::{MeshplaneError, Result};

use super::model::Parameter;
use super::store::{
    BlobDownloader, BlobUploader, ParameterReader, ParameterWriter, PullRequest,
    PATH_PREFIX_METADATA,
};

const PATH_SEPARATOR: char = '/';

/// In-memory key/value parameter store.
///
/// Names are slash-separated paths; the final segment is the parameter key,
/// everything before it the path prefix. A pull streams every entry under the
/// request URL's path scope.
#[derive(Debug, Default)]
pub struct MemoryParameterStore {
    entries: Mutex<BTreeMap<String, String>>,
}

impl MemoryParameterStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed an entry directly, bypassing the writer contract.
    pub fn insert(&self, name: &str, url_str: &str) {
        self.entries
            .lock()
            .expect("parameter store lock poisoned")
            .insert(name.to_string(), url_str.to_string());
    }

    pub fn len(&self) -> usize {
        self.entries.lock().expect("parameter store lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl ParameterReader for MemoryParameterStore {
    async fn pull(&self, request: PullRequest) -> Result<()> {
        let scope = request.url.path().trim_end_matches(PATH_SEPARATOR).to_string();

        let matching: Vec<(String, String)> = {
            let entries = self.entries.lock().expect("parameter store lock poisoned");
            entries
                .iter()
                .filter(|(name, _)| name.starts_with(&format!("{}{}", scope, PATH_SEPARATOR)))
                .map(|(name, value)| (name.clone(), value.clone()))
                .collect()
        };

        for (name, value) in matching {
            let Some((path_prefix, key)) = name.rsplit_once(PATH_SEPARATOR) else {
                warn!(name = %name, "Skipping parameter entry without separator");
                continue;
            };

            let mut parameter = match request.parameter_from_url_str(key, &value) {
                Ok(parameter) => parameter,
                Err(err) => {
                    // Malformed entries are reported per entry and do not
                    // fail the surrounding pull.
                    let err = MeshplaneError::InvalidParameterType {
                        key: key.to_string(),
                        source: Some(Box::new(err)),
                    };
                    warn!(key = %key, error = %err, "Skipping malformed parameter entry");
                    continue;
                }
            };

            parameter
                .metadata_mut()
                .insert(PATH_PREFIX_METADATA.to_string(), path_prefix.to_string());

            debug!(key = %key, path_prefix = %path_prefix, "Pull operation");

            if request.result.send(parameter).await.is_err() {
                break;
            }
        }

        Ok(())
    }
}

#[async_trait]
impl ParameterWriter for MemoryParameterStore {
    async fn put(&self, parameter: &Parameter) -> Result<()> {
        let path_prefix = parameter
            .metadata()
            .get(PATH_PREFIX_METADATA)
            .cloned()
            .unwrap_or_default();

        let name = format!("{}{}{}", path_prefix, PATH_SEPARATOR, parameter.key());

        debug!(key = parameter.key(), path_prefix = %path_prefix, "Put operation");

        self.entries
            .lock()
            .expect("parameter store lock poisoned")
            .insert(name, parameter.url_string());

        Ok(())
    }
}

/// In-memory blob storage keyed by `(host, path)`.
#[derive(Debug, Default)]
pub struct MemoryBlobStorage {
    objects: Mutex<HashMap<(String, String), Vec<u8>>>,
}

impl MemoryBlobStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed an object directly.
    pub fn put_object(&self, host: &str, path: &str, body: &[u8]) {
        self.objects
            .lock()
            .expect("blob storage lock poisoned")
            .insert((host.to_string(), path.to_string()), body.to_vec());
    }

    pub fn object(&self, host: &str, path: &str) -> Option<Vec<u8>> {
        self.objects
            .lock()
            .expect("blob storage lock poisoned")
            .get(&(host.to_string(), path.to_string()))
            .cloned()
    }
}

#[async_trait]
impl BlobDownloader for MemoryBlobStorage {
    async fn download(&self, parameter: &mut Parameter) -> Result<()> {
        let key = (parameter.host().to_string(), parameter.path().to_string());

        let body = {
            let objects = self.objects.lock().expect("blob storage lock poisoned");
            objects.get(&key).cloned()
        };

        match body {
            Some(body) => {
                debug!(
                    parameter_key = parameter.key(),
                    bucket = %key.0,
                    object_key = %key.1,
                    size = body.len(),
                    "Downloaded parameter file"
                );
                parameter.file_mut().extend_from_slice(&body);
                Ok(())
            }
            None => Err(MeshplaneError::file_not_found(parameter.key())),
        }
    }
}

#[async_trait]
impl BlobUploader for MemoryBlobStorage {
    async fn upload(&self, parameter: &Parameter) -> Result<()> {
        let key = (parameter.host().to_string(), parameter.path().to_string());

        debug!(
            parameter_key = parameter.key(),
            bucket = %key.0,
            object_key = %key.1,
            size = parameter.file().len(),
            "Uploaded parameter file"
        );

        self.objects
            .lock()
            .expect("blob storage lock poisoned")
            .insert(key, parameter.file().to_vec());

        Ok(())
    }
}
