use crux_core::capability::{Capability, CapabilityContext, Operation};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::image_processing::EncodeConfig;
use crate::media::MediaKind;

/// Shell-side media services for a gallery.
///
/// Two concerns live behind this boundary:
/// - preview handles: cheap, revocable display resources (an object URL on
///   web, a thumbnail file elsewhere). The core owns their lifecycle and
///   must release each handle exactly once.
/// - encoding: turning raw file bytes into the durable embeddable
///   representation stored with a listing. Shells are expected to delegate
///   to [`crate::image_processing::prepare_media`], which this crate ships
///   as the reference encoder.
pub struct MediaStore<Ev> {
    context: CapabilityContext<MediaStoreOperation, Ev>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PreviewHandle(pub String);

impl PreviewHandle {
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// The durable, size-bounded representation of one processed media item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncodedMedia {
    pub mime_type: String,
    pub data_url: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum MediaStoreOperation {
    CreatePreview {
        mime_type: String,
        #[serde(with = "serde_bytes")]
        data: Vec<u8>,
    },
    ReleasePreview {
        handle: PreviewHandle,
    },
    Encode {
        kind: MediaKind,
        mime_type: String,
        #[serde(with = "serde_bytes")]
        data: Vec<u8>,
        config: EncodeConfig,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum MediaStoreError {
    #[error("preview allocation failed: {message}")]
    Preview { message: String },
    #[error("media processing failed: {message}")]
    Processing { message: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum MediaStoreOutput {
    PreviewCreated { handle: PreviewHandle },
    PreviewReleased,
    Encoded { media: EncodedMedia },
}

pub type MediaStoreResult = Result<MediaStoreOutput, MediaStoreError>;

impl Operation for MediaStoreOperation {
    type Output = MediaStoreResult;
}

impl<Ev> Capability<Ev> for MediaStore<Ev> {
    type Operation = MediaStoreOperation;
    type MappedSelf<MappedEv> = MediaStore<MappedEv>;

    fn map_event<F, NewEv>(&self, f: F) -> Self::MappedSelf<NewEv>
    where
        F: Fn(NewEv) -> Ev + Send + Sync + 'static,
        Ev: 'static,
        NewEv: 'static + Send,
    {
        MediaStore::new(self.context.map_event(f))
    }
}

impl<Ev> MediaStore<Ev>
where
    Ev: Send + 'static,
{
    pub fn new(context: CapabilityContext<MediaStoreOperation, Ev>) -> Self {
        Self { context }
    }

    pub fn create_preview<F>(&self, mime_type: String, data: Vec<u8>, make_event: F)
    where
        F: FnOnce(MediaStoreResult) -> Ev + Send + 'static,
    {
        let context = self.context.clone();
        self.context.spawn(async move {
            let result = context
                .request_from_shell(MediaStoreOperation::CreatePreview { mime_type, data })
                .await;
            context.update_app(make_event(result));
        });
    }

    pub fn encode<F>(
        &self,
        kind: MediaKind,
        mime_type: String,
        data: Vec<u8>,
        config: EncodeConfig,
        make_event: F,
    ) where
        F: FnOnce(MediaStoreResult) -> Ev + Send + 'static,
    {
        let context = self.context.clone();
        self.context.spawn(async move {
            let result = context
                .request_from_shell(MediaStoreOperation::Encode {
                    kind,
                    mime_type,
                    data,
                    config,
                })
                .await;
            context.update_app(make_event(result));
        });
    }

    /// Fire-and-forget: the handle is gone as far as the core is concerned
    /// the moment this is requested.
    pub fn release_preview(&self, handle: PreviewHandle) {
        let context = self.context.clone();
        self.context.spawn(async move {
            context
                .notify_shell(MediaStoreOperation::ReleasePreview { handle })
                .await;
        });
    }
}
