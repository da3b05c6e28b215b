//! Parameter model and source behavior across the store and storage
//! contracts.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use meshplane::parameter::memory::{MemoryBlobStorage, MemoryParameterStore};
use meshplane::parameter::{
    BlobUploader, Parameter, ParameterKind, ParameterOptions, ParameterWriter, SourceOptions,
    PATH_PREFIX_METADATA,
};
use meshplane::Result;

#[tokio::test]
async fn file_parameter_round_trips_through_store_and_storage() {
    let storage = Arc::new(MemoryBlobStorage::new());
    let store = Arc::new(MemoryParameterStore::new());
    let options = ParameterOptions::new(storage.clone(), storage.clone(), store.clone());

    let mut parameter = options
        .parameter_from_url_str("TLS_CERTIFICATE", "file://bucket/path#dest")
        .unwrap();
    parameter
        .metadata_mut()
        .insert(PATH_PREFIX_METADATA.to_string(), "/services/api".to_string());
    parameter.file_mut().extend_from_slice(b"hello");

    parameter.push().await.unwrap();

    // Reinstantiate from scratch and load: kind and payload survive.
    let mut restored = options
        .parameter_from_url_str("TLS_CERTIFICATE", "file://bucket/path#dest")
        .unwrap();
    assert_eq!(restored.kind(), ParameterKind::File);
    assert!(restored.file().is_empty());

    restored.load().await.unwrap();
    assert_eq!(restored.file(), b"hello");
    assert_eq!(restored.fragment(), "dest");
}

#[tokio::test]
async fn process_env_restores_as_var_parameter() {
    let storage = Arc::new(MemoryBlobStorage::new());
    let store = Arc::new(MemoryParameterStore::new());
    let parameter_options = ParameterOptions::new(storage.clone(), storage, store.clone());
    let source_options = SourceOptions::new(parameter_options, store);

    std::env::set_var("MESHPLANE_ROUNDTRIP_FOO", "bar");

    let mut source = source_options.source_from_url_str("param:///scope").unwrap();
    source.restore_from_process_envs().unwrap();

    std::env::remove_var("MESHPLANE_ROUNDTRIP_FOO");

    let parameter = source.get("MESHPLANE_ROUNDTRIP_FOO").expect("env parameter installed");
    assert_eq!(parameter.kind(), ParameterKind::Var);
    assert_eq!(parameter.fragment(), "bar");
}

/// Records the order in which the writer and uploader observe a push.
#[derive(Debug, Default)]
struct PushRecorder {
    log: Mutex<Vec<&'static str>>,
}

struct RecordingWriter {
    recorder: Arc<PushRecorder>,
    inner: Arc<MemoryParameterStore>,
}

#[async_trait]
impl ParameterWriter for RecordingWriter {
    async fn put(&self, parameter: &Parameter) -> Result<()> {
        self.recorder.log.lock().unwrap().push("writer");
        self.inner.put(parameter).await
    }
}

struct RecordingUploader {
    recorder: Arc<PushRecorder>,
    inner: Arc<MemoryBlobStorage>,
}

#[async_trait]
impl BlobUploader for RecordingUploader {
    async fn upload(&self, parameter: &Parameter) -> Result<()> {
        self.recorder.log.lock().unwrap().push("uploader");
        self.inner.upload(parameter).await
    }
}

#[tokio::test]
async fn push_writes_the_record_before_uploading_the_file() {
    let recorder = Arc::new(PushRecorder::default());
    let storage = Arc::new(MemoryBlobStorage::new());
    let store = Arc::new(MemoryParameterStore::new());

    let options = ParameterOptions::new(
        storage.clone(),
        Arc::new(RecordingUploader { recorder: recorder.clone(), inner: storage }),
        Arc::new(RecordingWriter { recorder: recorder.clone(), inner: store }),
    );

    let mut parameter =
        options.parameter_from_url_str("CERT", "file://bucket/cert.pem").unwrap();
    parameter.file_mut().extend_from_slice(b"pem");
    parameter.push().await.unwrap();

    assert_eq!(*recorder.log.lock().unwrap(), vec!["writer", "uploader"]);
}

#[tokio::test]
async fn var_push_never_touches_the_uploader() {
    let recorder = Arc::new(PushRecorder::default());
    let storage = Arc::new(MemoryBlobStorage::new());
    let store = Arc::new(MemoryParameterStore::new());

    let options = ParameterOptions::new(
        storage.clone(),
        Arc::new(RecordingUploader { recorder: recorder.clone(), inner: storage }),
        Arc::new(RecordingWriter { recorder: recorder.clone(), inner: store }),
    );

    let parameter = options.var_parameter("LOG_LEVEL", "debug").unwrap();
    parameter.push().await.unwrap();

    assert_eq!(*recorder.log.lock().unwrap(), vec!["writer"]);
}

#[test]
fn kind_depends_only_on_the_scheme() {
    let storage = Arc::new(MemoryBlobStorage::new());
    let store = Arc::new(MemoryParameterStore::new());
    let options = ParameterOptions::new(storage.clone(), storage, store);

    for (url, kind) in [
        ("var:#x", ParameterKind::Var),
        ("var://host/path?q=1#x", ParameterKind::Var),
        ("file://bucket/a", ParameterKind::File),
        ("file://other-bucket/deep/path?x=2#dest", ParameterKind::File),
        ("ssm://bucket/a", ParameterKind::Unknown),
        ("https://example.com", ParameterKind::Unknown),
    ] {
        let parameter = options.parameter_from_url_str("K", url).unwrap();
        assert_eq!(parameter.kind(), kind, "scheme of {}", url);
    }
}
