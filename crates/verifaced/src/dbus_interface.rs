use crate::engine::{EngineError, EngineHandle};
use std::sync::Arc;
use uuid::Uuid;
use veriface_core::{DescriptorStore, StoreError, VerifyRequest, VideoRequest};
use veriface_store::FsDescriptorStore;
use zbus::interface;

pub const BUS_NAME: &str = "org.veriface.Verifier1";
pub const OBJECT_PATH: &str = "/org/veriface/Verifier1";

/// D-Bus interface for the veriface verification daemon.
///
/// Bus name: org.veriface.Verifier1
/// Object path: /org/veriface/Verifier1
///
/// String arguments use "" for "not given". Results are JSON strings.
pub struct VerifierService {
    engine: EngineHandle,
    store: Arc<FsDescriptorStore>,
}

impl VerifierService {
    pub fn new(engine: EngineHandle, store: Arc<FsDescriptorStore>) -> Self {
        Self { engine, store }
    }

    /// Run a store operation off the async runtime.
    async fn with_store<T, F>(&self, op: F) -> zbus::fdo::Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&FsDescriptorStore) -> Result<T, StoreError> + Send + 'static,
    {
        let store = self.store.clone();
        tokio::task::spawn_blocking(move || op(&*store))
            .await
            .map_err(|e| zbus::fdo::Error::Failed(format!("store task failed: {e}")))?
            .map_err(store_error)
    }
}

fn absent(value: &str) -> Option<String> {
    (!value.is_empty()).then(|| value.to_string())
}

fn engine_error(e: EngineError) -> zbus::fdo::Error {
    tracing::error!(error = %e, "engine unavailable");
    zbus::fdo::Error::Failed(e.to_string())
}

fn store_error(e: StoreError) -> zbus::fdo::Error {
    match e {
        StoreError::InvalidIdentity(_) => zbus::fdo::Error::InvalidArgs(e.to_string()),
        other => {
            tracing::error!(error = %other, "store operation failed");
            zbus::fdo::Error::Failed(other.to_string())
        }
    }
}

fn to_json<T: serde::Serialize>(value: &T) -> zbus::fdo::Result<String> {
    serde_json::to_string(value).map_err(|e| zbus::fdo::Error::Failed(e.to_string()))
}

#[interface(name = "org.veriface.Verifier1")]
impl VerifierService {
    /// Verify one encoded image, optionally scoped to an identity.
    async fn verify(
        &self,
        image: Vec<u8>,
        identity: &str,
        save: bool,
        basic: bool,
        request_id: &str,
    ) -> zbus::fdo::Result<String> {
        tracing::info!(identity, save, basic, request_id, bytes = image.len(), "verify requested");
        let mut request = VerifyRequest::new(image).save_on_success(save).basic_only(basic);
        request.options.identity = absent(identity);
        request.options.request_id = absent(request_id);

        let result = self.engine.verify(request).await.map_err(engine_error)?;
        to_json(&result)
    }

    /// Verify a sequence of encoded frames.
    async fn verify_frames(
        &self,
        frames: Vec<Vec<u8>>,
        identity: &str,
        save: bool,
        request_id: &str,
    ) -> zbus::fdo::Result<String> {
        tracing::info!(
            identity,
            save,
            request_id,
            frames = frames.len(),
            "frame sequence requested"
        );
        let request = VideoRequest {
            identity: absent(identity),
            save_on_success: save,
            request_id: absent(request_id),
            ..VideoRequest::default()
        };

        let result = self.engine.verify_frames(frames, request).await.map_err(engine_error)?;
        to_json(&result)
    }

    /// Detect a face and store it for the identity.
    async fn enroll(&self, identity: &str, image: Vec<u8>) -> zbus::fdo::Result<String> {
        tracing::info!(identity, bytes = image.len(), "enroll requested");
        if identity.is_empty() {
            return Err(zbus::fdo::Error::InvalidArgs("identity is required".into()));
        }

        let result = self
            .engine
            .enroll(identity.to_string(), image.into(), None)
            .await
            .map_err(engine_error)?;
        to_json(&result)
    }

    /// Records of one identity, or of every identity when empty.
    async fn list_records(&self, identity: &str) -> zbus::fdo::Result<String> {
        tracing::info!(identity, "list_records requested");
        let identity = absent(identity);
        let records = self
            .with_store(move |store| match identity {
                Some(identity) => store.list(&identity),
                None => store.list_all(),
            })
            .await?;
        to_json(&records)
    }

    /// Remove one record. Returns false if it did not exist.
    async fn remove_record(&self, identity: &str, record_id: &str) -> zbus::fdo::Result<bool> {
        tracing::info!(identity, record_id, "remove_record requested");
        let record_id = Uuid::parse_str(record_id)
            .map_err(|e| zbus::fdo::Error::InvalidArgs(format!("invalid record id: {e}")))?;
        let identity = identity.to_string();
        self.with_store(move |store| store.delete(&identity, record_id)).await
    }

    /// Remove every record of an identity. Returns how many were removed.
    async fn remove_identity(&self, identity: &str) -> zbus::fdo::Result<u32> {
        tracing::info!(identity, "remove_identity requested");
        let identity = identity.to_string();
        let removed = self.with_store(move |store| store.delete_identity(&identity)).await?;
        Ok(u32::try_from(removed).unwrap_or(u32::MAX))
    }

    /// Return daemon status information.
    async fn status(&self) -> zbus::fdo::Result<String> {
        Ok(serde_json::json!({
            "version": env!("CARGO_PKG_VERSION"),
            "store": self.store.root().display().to_string(),
            "backends": self.engine.statuses(),
        })
        .to_string())
    }
}
