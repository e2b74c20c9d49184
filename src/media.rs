//! Gallery state for the media ingestion pipeline.
//!
//! One `GalleryState` backs one media gallery in a form: a bounded,
//! reorderable set of items, each moving independently through
//! `Uploading -> Complete | Error`. Validation happens here; previews,
//! encoding and the progress interval are effects wired up in
//! `app::update`.

use serde::{Deserialize, Serialize};

use crate::capabilities::{EncodedMedia, PreviewHandle};
use crate::MediaItemId;

pub const DEFAULT_MAX_FILES: usize = 8;
pub const DEFAULT_MAX_FILE_BYTES: usize = 10 * 1024 * 1024;

pub const UPLOAD_TICK_MS: u64 = 200;
pub const UPLOAD_PROGRESS_STEP: u8 = 10;
/// Simulated progress parks here until the encoder reports back.
pub const UPLOAD_PROGRESS_CEILING: u8 = 90;

pub const UNSUPPORTED_TYPE_MESSAGE: &str = "Unsupported file type";
pub const UPLOAD_FAILED_MESSAGE: &str = "Upload failed";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaKind {
    Image,
    Video,
}

impl MediaKind {
    /// Classification goes by the declared media type; the decoder performs
    /// its own sniffing later.
    #[must_use]
    pub fn from_mime(mime_type: &str) -> Option<Self> {
        let mime = mime_type.trim().to_ascii_lowercase();
        if mime.starts_with("image/") {
            Some(Self::Image)
        } else if mime.starts_with("video/") {
            Some(Self::Video)
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaAccept {
    pub images: bool,
    pub videos: bool,
}

impl MediaAccept {
    #[must_use]
    pub const fn allows(self, kind: MediaKind) -> bool {
        match kind {
            MediaKind::Image => self.images,
            MediaKind::Video => self.videos,
        }
    }
}

impl Default for MediaAccept {
    fn default() -> Self {
        Self {
            images: true,
            videos: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub max_files: usize,
    pub max_file_size_bytes: usize,
    pub accept: MediaAccept,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_files: DEFAULT_MAX_FILES,
            max_file_size_bytes: DEFAULT_MAX_FILE_BYTES,
            accept: MediaAccept::default(),
        }
    }
}

/// A raw file as handed over by the shell when the user picks it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IncomingFile {
    pub file_name: String,
    pub mime_type: String,
    #[serde(with = "serde_bytes")]
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PreviewState {
    /// Handle requested from the shell, not delivered yet.
    Pending,
    Ready(PreviewHandle),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ItemPhase {
    Uploading,
    Complete { encoded: EncodedMedia },
    Error { message: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MediaItem {
    pub id: MediaItemId,
    pub kind: MediaKind,
    pub file_name: String,
    pub mime_type: String,
    /// Exclusively owned raw bytes; dropped once processing settles or the
    /// item is removed.
    pub source: Option<Vec<u8>>,
    pub preview: PreviewState,
    pub progress: u8,
    pub phase: ItemPhase,
}

impl MediaItem {
    fn uploading(kind: MediaKind, file_name: String, mime_type: String, data: Vec<u8>) -> Self {
        Self {
            id: MediaItemId::generate(),
            kind,
            file_name,
            mime_type,
            source: Some(data),
            preview: PreviewState::Pending,
            progress: 0,
            phase: ItemPhase::Uploading,
        }
    }

    fn rejected(
        kind: MediaKind,
        file_name: String,
        mime_type: String,
        message: impl Into<String>,
    ) -> Self {
        Self {
            id: MediaItemId::generate(),
            kind,
            file_name,
            mime_type,
            source: None,
            preview: PreviewState::Pending,
            progress: 0,
            phase: ItemPhase::Error {
                message: message.into(),
            },
        }
    }

    #[must_use]
    pub const fn is_uploading(&self) -> bool {
        matches!(self.phase, ItemPhase::Uploading)
    }

    #[must_use]
    pub fn final_ref(&self) -> Option<&str> {
        match &self.phase {
            ItemPhase::Complete { encoded } => Some(&encoded.data_url),
            _ => None,
        }
    }

    #[must_use]
    pub fn error_message(&self) -> Option<&str> {
        match &self.phase {
            ItemPhase::Error { message } => Some(message),
            _ => None,
        }
    }

    /// One simulated-progress step. Returns whether the interval should
    /// keep running.
    pub fn advance_progress(&mut self) -> bool {
        if !self.is_uploading() {
            return false;
        }
        self.progress = self
            .progress
            .saturating_add(UPLOAD_PROGRESS_STEP)
            .min(UPLOAD_PROGRESS_CEILING);
        true
    }

    pub fn complete(&mut self, encoded: EncodedMedia) {
        self.source = None;
        self.progress = 100;
        self.phase = ItemPhase::Complete { encoded };
    }

    pub fn fail(&mut self, message: impl Into<String>) {
        self.source = None;
        self.phase = ItemPhase::Error {
            message: message.into(),
        };
    }

    pub fn attach_preview(&mut self, handle: PreviewHandle) {
        self.preview = PreviewState::Ready(handle);
    }
}

/// Work `accept_files` hands back to the caller so effects can be issued
/// after the borrow on the gallery ends.
#[derive(Debug)]
pub struct ScheduledItem {
    pub item_id: MediaItemId,
    pub kind: MediaKind,
    pub mime_type: String,
    pub preview_data: Vec<u8>,
    /// Present only for items that passed validation and need encoding.
    pub encode_data: Option<Vec<u8>>,
}

#[derive(Debug, Default)]
pub struct FileAcceptance {
    pub accepted: Vec<ScheduledItem>,
    pub overflowed: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GalleryState {
    config: PipelineConfig,
    items: Vec<MediaItem>,
}

impl GalleryState {
    #[must_use]
    pub fn new(config: PipelineConfig) -> Self {
        Self {
            config,
            items: Vec::new(),
        }
    }

    #[must_use]
    pub const fn config(&self) -> &PipelineConfig {
        &self.config
    }

    #[must_use]
    pub fn items(&self) -> &[MediaItem] {
        &self.items
    }

    #[must_use]
    pub fn item_mut(&mut self, id: &MediaItemId) -> Option<&mut MediaItem> {
        self.items.iter_mut().find(|item| &item.id == id)
    }

    #[must_use]
    pub fn remaining_capacity(&self) -> usize {
        self.config.max_files.saturating_sub(self.items.len())
    }

    /// Ingest a batch. Files beyond the remaining capacity are dropped (and
    /// counted); files with an unacceptable declared type or an oversize
    /// payload become `Error` items on the spot; the rest enter `Uploading`
    /// and are returned for scheduling. Every allocated item, valid or not,
    /// gets a preview handle requested for it.
    pub fn accept_files(&mut self, files: Vec<IncomingFile>) -> FileAcceptance {
        let mut acceptance = FileAcceptance::default();
        for file in files {
            if self.items.len() >= self.config.max_files {
                acceptance.overflowed += 1;
                continue;
            }

            let IncomingFile {
                file_name,
                mime_type,
                data,
            } = file;

            let declared = MediaKind::from_mime(&mime_type);
            let (item, encode_data) = match declared {
                Some(kind) if self.config.accept.allows(kind) => {
                    if data.len() > self.config.max_file_size_bytes {
                        (
                            MediaItem::rejected(
                                kind,
                                file_name,
                                mime_type.clone(),
                                oversize_message(self.config.max_file_size_bytes),
                            ),
                            None,
                        )
                    } else {
                        (
                            MediaItem::uploading(kind, file_name, mime_type.clone(), data.clone()),
                            Some(data.clone()),
                        )
                    }
                }
                _ => (
                    // kind falls back to Image purely for display purposes
                    MediaItem::rejected(
                        declared.unwrap_or(MediaKind::Image),
                        file_name,
                        mime_type.clone(),
                        UNSUPPORTED_TYPE_MESSAGE,
                    ),
                    None,
                ),
            };

            acceptance.accepted.push(ScheduledItem {
                item_id: item.id.clone(),
                kind: item.kind,
                mime_type,
                preview_data: data,
                encode_data,
            });
            self.items.push(item);
        }
        acceptance
    }

    /// Drop an item, handing its preview handle (if any) back for release.
    pub fn remove(&mut self, id: &MediaItemId) -> Option<MediaItem> {
        let index = self.items.iter().position(|item| &item.id == id)?;
        Some(self.items.remove(index))
    }

    /// Move the item at `from` to `to`, shifting the ones in between.
    pub fn reorder(&mut self, from: usize, to: usize) -> bool {
        if from == to || from >= self.items.len() || to >= self.items.len() {
            return false;
        }
        let item = self.items.remove(from);
        self.items.insert(to, item);
        true
    }

    /// Teardown: consume the gallery, yielding every live preview handle
    /// exactly once.
    #[must_use]
    pub fn into_preview_handles(self) -> Vec<PreviewHandle> {
        self.items
            .into_iter()
            .filter_map(|item| match item.preview {
                PreviewState::Ready(handle) => Some(handle),
                PreviewState::Pending => None,
            })
            .collect()
    }
}

#[must_use]
pub fn oversize_message(max_file_size_bytes: usize) -> String {
    format!(
        "File too large. The maximum size is {} MB.",
        max_file_size_bytes / 1_000_000
    )
}

#[must_use]
pub fn capacity_message(max_files: usize) -> String {
    format!("You can attach up to {max_files} files.")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn file(name: &str, mime: &str, len: usize) -> IncomingFile {
        IncomingFile {
            file_name: name.into(),
            mime_type: mime.into(),
            data: vec![0u8; len],
        }
    }

    fn gallery(max_files: usize) -> GalleryState {
        GalleryState::new(PipelineConfig {
            max_files,
            ..PipelineConfig::default()
        })
    }

    #[test]
    fn classifies_by_declared_type() {
        assert_eq!(MediaKind::from_mime("image/jpeg"), Some(MediaKind::Image));
        assert_eq!(MediaKind::from_mime("IMAGE/PNG"), Some(MediaKind::Image));
        assert_eq!(MediaKind::from_mime("video/mp4"), Some(MediaKind::Video));
        assert_eq!(MediaKind::from_mime("application/pdf"), None);
    }

    #[test]
    fn valid_files_enter_uploading_with_encode_work() {
        let mut gallery = gallery(4);
        let acceptance = gallery.accept_files(vec![file("a.jpg", "image/jpeg", 100)]);
        assert_eq!(acceptance.accepted.len(), 1);
        assert!(acceptance.accepted[0].encode_data.is_some());
        assert_eq!(acceptance.overflowed, 0);

        let item = &gallery.items()[0];
        assert!(item.is_uploading());
        assert_eq!(item.progress, 0);
        assert!(item.source.is_some());
    }

    #[test]
    fn unsupported_type_is_rejected_in_place() {
        let mut gallery = gallery(4);
        let acceptance = gallery.accept_files(vec![file("doc.pdf", "application/pdf", 10)]);
        assert!(acceptance.accepted[0].encode_data.is_none());

        let item = &gallery.items()[0];
        assert_eq!(item.error_message(), Some(UNSUPPORTED_TYPE_MESSAGE));
        assert!(item.source.is_none());
    }

    #[test]
    fn declared_type_outside_accept_set_is_unsupported() {
        let mut gallery = GalleryState::new(PipelineConfig {
            accept: MediaAccept {
                images: true,
                videos: false,
            },
            ..PipelineConfig::default()
        });
        gallery.accept_files(vec![file("clip.mp4", "video/mp4", 10)]);
        assert_eq!(
            gallery.items()[0].error_message(),
            Some(UNSUPPORTED_TYPE_MESSAGE)
        );
    }

    #[test]
    fn oversize_file_errors_with_the_cap_in_mb() {
        let mut gallery = GalleryState::new(PipelineConfig {
            max_file_size_bytes: 2_000_000,
            ..PipelineConfig::default()
        });
        let acceptance = gallery.accept_files(vec![file("big.jpg", "image/jpeg", 2_000_001)]);
        assert!(acceptance.accepted[0].encode_data.is_none());

        let message = gallery.items()[0].error_message().unwrap();
        assert!(message.contains("2 MB"), "unexpected message: {message}");
        assert!(gallery.items()[0].source.is_none());
    }

    #[test]
    fn batch_beyond_capacity_is_clamped_and_counted() {
        let mut gallery = gallery(2);
        let acceptance = gallery.accept_files(vec![
            file("a.jpg", "image/jpeg", 10),
            file("b.jpg", "image/jpeg", 10),
            file("c.jpg", "image/jpeg", 10),
            file("d.jpg", "image/jpeg", 10),
        ]);
        assert_eq!(gallery.items().len(), 2);
        assert_eq!(acceptance.accepted.len(), 2);
        assert_eq!(acceptance.overflowed, 2);
        assert_eq!(gallery.remaining_capacity(), 0);
    }

    #[test]
    fn error_items_count_toward_capacity() {
        let mut gallery = gallery(2);
        let acceptance = gallery.accept_files(vec![
            file("doc.pdf", "application/pdf", 10),
            file("a.jpg", "image/jpeg", 10),
            file("b.jpg", "image/jpeg", 10),
        ]);
        assert_eq!(gallery.items().len(), 2);
        assert_eq!(acceptance.overflowed, 1);
    }

    #[test]
    fn progress_advances_in_bounded_steps_to_the_ceiling() {
        let mut gallery = gallery(1);
        gallery.accept_files(vec![file("a.jpg", "image/jpeg", 10)]);
        let id = gallery.items()[0].id.clone();
        let item = gallery.item_mut(&id).unwrap();

        for _ in 0..50 {
            assert!(item.advance_progress());
        }
        assert_eq!(item.progress, UPLOAD_PROGRESS_CEILING);

        item.complete(EncodedMedia {
            mime_type: "image/webp".into(),
            data_url: "data:image/webp;base64,AA==".into(),
        });
        assert_eq!(item.progress, 100);
        assert!(!item.advance_progress());
    }

    #[test]
    fn completion_releases_the_source_bytes() {
        let mut gallery = gallery(1);
        gallery.accept_files(vec![file("a.jpg", "image/jpeg", 10)]);
        let id = gallery.items()[0].id.clone();
        let item = gallery.item_mut(&id).unwrap();
        assert!(item.source.is_some());

        item.complete(EncodedMedia {
            mime_type: "image/webp".into(),
            data_url: "data:image/webp;base64,AA==".into(),
        });
        assert!(item.source.is_none());
        assert!(item.final_ref().is_some());
    }

    #[test]
    fn failure_releases_the_source_bytes_too() {
        let mut gallery = gallery(1);
        gallery.accept_files(vec![file("a.jpg", "image/jpeg", 10)]);
        let id = gallery.items()[0].id.clone();
        let item = gallery.item_mut(&id).unwrap();
        item.fail(UPLOAD_FAILED_MESSAGE);
        assert!(item.source.is_none());
        assert_eq!(item.error_message(), Some(UPLOAD_FAILED_MESSAGE));
        assert!(item.final_ref().is_none());
    }

    #[test]
    fn reorder_shifts_the_items_between() {
        let mut gallery = gallery(3);
        gallery.accept_files(vec![
            file("a.jpg", "image/jpeg", 10),
            file("b.jpg", "image/jpeg", 10),
            file("c.jpg", "image/jpeg", 10),
        ]);
        let names = |g: &GalleryState| {
            g.items()
                .iter()
                .map(|i| i.file_name.clone())
                .collect::<Vec<_>>()
        };

        assert!(gallery.reorder(0, 2));
        assert_eq!(names(&gallery), ["b.jpg", "c.jpg", "a.jpg"]);
    }

    #[test]
    fn reorder_same_index_or_out_of_bounds_is_a_noop() {
        let mut gallery = gallery(3);
        gallery.accept_files(vec![
            file("a.jpg", "image/jpeg", 10),
            file("b.jpg", "image/jpeg", 10),
        ]);
        assert!(!gallery.reorder(1, 1));
        assert!(!gallery.reorder(0, 5));
        assert!(!gallery.reorder(5, 0));
        assert_eq!(gallery.items()[0].file_name, "a.jpg");
    }

    #[test]
    fn remove_keeps_the_rest_in_order() {
        let mut gallery = gallery(3);
        gallery.accept_files(vec![
            file("a.jpg", "image/jpeg", 10),
            file("b.jpg", "image/jpeg", 10),
            file("c.jpg", "image/jpeg", 10),
        ]);
        let id = gallery.items()[1].id.clone();
        let removed = gallery.remove(&id).unwrap();
        assert_eq!(removed.file_name, "b.jpg");
        assert_eq!(gallery.items().len(), 2);
        assert_eq!(gallery.items()[0].file_name, "a.jpg");
        assert_eq!(gallery.items()[1].file_name, "c.jpg");
        assert!(gallery.remove(&id).is_none());
    }

    #[test]
    fn teardown_yields_each_ready_handle_once() {
        let mut gallery = gallery(3);
        gallery.accept_files(vec![
            file("a.jpg", "image/jpeg", 10),
            file("b.jpg", "image/jpeg", 10),
        ]);
        let id = gallery.items()[0].id.clone();
        gallery
            .item_mut(&id)
            .unwrap()
            .attach_preview(PreviewHandle("blob:1".into()));

        let handles = gallery.into_preview_handles();
        assert_eq!(handles, vec![PreviewHandle("blob:1".into())]);
    }
}
