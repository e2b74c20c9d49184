//! Shared core of the Mercato local-marketplace app.
//!
//! UI shells drive this crate through [`Event`]s and render the
//! [`ViewModel`]; all side effects (HTTP, durable storage, timers, the
//! platform location service, media previews and encoding) are Crux
//! capabilities the shells fulfil. The core owns two stateful subsystems:
//! location resolution ([`resolver`] + [`geocoding`]) and media ingestion
//! ([`media`] + [`image_processing`]).

#![forbid(unsafe_code)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::too_many_lines)]

pub mod capabilities;
pub mod geocoding;
pub mod image_processing;
pub mod media;
pub mod resolver;

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::capabilities::{GeolocationError, GeolocationResult, MediaStoreResult};
use crate::geocoding::{GeocodeCache, GeocoderConfig, RetryPolicy};
use crate::media::{GalleryState, IncomingFile, MediaItem, MediaKind, PipelineConfig};
use crate::resolver::{ResolverPhase, ResolverState};

pub use app::App;
pub use capabilities::{Capabilities, Effect};

/// Outcome of a geocoding HTTP request, as delivered by the Http
/// capability.
pub type HttpTextResult = crux_http::Result<crux_http::Response<String>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorSeverity {
    Transient,
    Permanent,
    Fatal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    Network,
    RateLimited,
    ServiceUnavailable,
    MalformedRequest,
    Geocoding,
    LocationNotFound,
    GeolocationDenied,
    GeolocationUnavailable,
    GeolocationTimeout,
    GeolocationUnsupported,
    MediaTooLarge,
    MediaUnsupported,
    MediaCapacity,
    MediaProcessing,
    Storage,
    Serialization,
    InvalidState,
    Unknown,
}

impl ErrorKind {
    #[must_use]
    pub const fn code(self) -> &'static str {
        match self {
            Self::Network => "NETWORK_ERROR",
            Self::RateLimited => "RATE_LIMITED",
            Self::ServiceUnavailable => "SERVICE_UNAVAILABLE",
            Self::MalformedRequest => "MALFORMED_REQUEST",
            Self::Geocoding => "GEOCODING_ERROR",
            Self::LocationNotFound => "LOCATION_NOT_FOUND",
            Self::GeolocationDenied => "GEOLOCATION_DENIED",
            Self::GeolocationUnavailable => "GEOLOCATION_UNAVAILABLE",
            Self::GeolocationTimeout => "GEOLOCATION_TIMEOUT",
            Self::GeolocationUnsupported => "GEOLOCATION_UNSUPPORTED",
            Self::MediaTooLarge => "MEDIA_TOO_LARGE",
            Self::MediaUnsupported => "MEDIA_UNSUPPORTED",
            Self::MediaCapacity => "MEDIA_CAPACITY",
            Self::MediaProcessing => "MEDIA_PROCESSING_ERROR",
            Self::Storage => "STORAGE_ERROR",
            Self::Serialization => "SERIALIZATION_ERROR",
            Self::InvalidState => "INVALID_STATE",
            Self::Unknown => "UNKNOWN_ERROR",
        }
    }

    #[must_use]
    pub const fn default_severity(self) -> ErrorSeverity {
        match self {
            Self::Network
            | Self::RateLimited
            | Self::ServiceUnavailable
            | Self::GeolocationTimeout
            | Self::Storage => ErrorSeverity::Transient,

            Self::Serialization | Self::InvalidState => ErrorSeverity::Fatal,

            Self::MalformedRequest
            | Self::Geocoding
            | Self::LocationNotFound
            | Self::GeolocationDenied
            | Self::GeolocationUnavailable
            | Self::GeolocationUnsupported
            | Self::MediaTooLarge
            | Self::MediaUnsupported
            | Self::MediaCapacity
            | Self::MediaProcessing
            | Self::Unknown => ErrorSeverity::Permanent,
        }
    }

    /// Whether the core retries this automatically. Geolocation failures
    /// are deliberately absent: a denied permission or a dead GPS does not
    /// get better on its own.
    #[must_use]
    pub const fn is_retryable(self) -> bool {
        matches!(
            self,
            Self::Network | Self::RateLimited | Self::ServiceUnavailable | Self::Storage
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppError {
    pub kind: ErrorKind,
    pub severity: ErrorSeverity,
    pub message: String,
}

impl AppError {
    #[must_use]
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            severity: kind.default_severity(),
            message: message.into(),
        }
    }

    #[must_use]
    pub const fn code(&self) -> &'static str {
        self.kind.code()
    }

    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        self.kind.is_retryable() && !matches!(self.severity, ErrorSeverity::Fatal)
    }

    #[must_use]
    pub fn user_facing_message(&self) -> String {
        match self.kind {
            ErrorKind::Network => {
                "Unable to reach the location service. Please check your connection and try again."
                    .into()
            }
            ErrorKind::RateLimited => {
                "The location service is busy right now. Please wait a moment and try again."
                    .into()
            }
            ErrorKind::ServiceUnavailable => {
                "The location service is temporarily unavailable. Please try again later.".into()
            }
            ErrorKind::MalformedRequest => {
                "The location lookup was rejected. Please try a different search.".into()
            }
            ErrorKind::Geocoding => {
                "Something went wrong while looking up this location. Please try again.".into()
            }
            ErrorKind::LocationNotFound => {
                "Could not find this location. Check the spelling or pick the spot on the map."
                    .into()
            }
            ErrorKind::GeolocationDenied => {
                "Location access was denied. Please enable location permissions in Settings."
                    .into()
            }
            ErrorKind::GeolocationUnavailable => {
                "Your current position could not be determined. Please try again or pick the spot on the map."
                    .into()
            }
            ErrorKind::GeolocationTimeout => {
                "Finding your location took too long. Please try again.".into()
            }
            ErrorKind::GeolocationUnsupported => {
                "Location services are not available on this device.".into()
            }
            ErrorKind::MediaTooLarge
            | ErrorKind::MediaUnsupported
            | ErrorKind::MediaCapacity
            | ErrorKind::MediaProcessing => self.message.clone(),
            ErrorKind::Storage => {
                "Unable to save data locally. Please free up some storage space.".into()
            }
            ErrorKind::Serialization => {
                "A data error occurred. Please contact support if this persists.".into()
            }
            ErrorKind::InvalidState => {
                "The app is in an invalid state. Please restart the app.".into()
            }
            ErrorKind::Unknown => "An unexpected error occurred. Please try again.".into(),
        }
    }
}

impl std::fmt::Display for AppError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}", self.code(), self.message)
    }
}

impl std::error::Error for AppError {}

pub type AppResult<T> = Result<T, AppError>;

impl From<GeolocationError> for AppError {
    fn from(error: GeolocationError) -> Self {
        let kind = match error {
            GeolocationError::PermissionDenied => ErrorKind::GeolocationDenied,
            GeolocationError::PositionUnavailable => ErrorKind::GeolocationUnavailable,
            GeolocationError::Timeout => ErrorKind::GeolocationTimeout,
            GeolocationError::Unsupported => ErrorKind::GeolocationUnsupported,
        };
        Self::new(kind, error.to_string())
    }
}

#[derive(Debug, Clone, Error)]
pub enum CoordinateError {
    #[error("Latitude {0} is out of valid range [-90, 90]")]
    LatitudeOutOfRange(f64),
    #[error("Longitude {0} is out of valid range [-180, 180]")]
    LongitudeOutOfRange(f64),
    #[error("Coordinate value is not finite (NaN or Infinity)")]
    NonFinite,
}

impl From<CoordinateError> for AppError {
    fn from(e: CoordinateError) -> Self {
        AppError::new(ErrorKind::Geocoding, e.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ValidatedCoordinate {
    lat: f64,
    lon: f64,
}

impl ValidatedCoordinate {
    pub fn new(lat: f64, lon: f64) -> Result<Self, CoordinateError> {
        if !lat.is_finite() || !lon.is_finite() {
            return Err(CoordinateError::NonFinite);
        }
        if !(-90.0..=90.0).contains(&lat) {
            return Err(CoordinateError::LatitudeOutOfRange(lat));
        }
        if !(-180.0..=180.0).contains(&lon) {
            return Err(CoordinateError::LongitudeOutOfRange(lon));
        }
        Ok(Self { lat, lon })
    }

    #[must_use]
    pub const fn lat(self) -> f64 {
        self.lat
    }

    #[must_use]
    pub const fn lon(self) -> f64 {
        self.lon
    }

    #[must_use]
    pub const fn as_tuple(self) -> (f64, f64) {
        (self.lat, self.lon)
    }
}

impl TryFrom<(f64, f64)> for ValidatedCoordinate {
    type Error = CoordinateError;

    fn try_from((lat, lon): (f64, f64)) -> Result<Self, Self::Error> {
        Self::new(lat, lon)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResolverId(pub String);

impl ResolverId {
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ResolverId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GalleryId(pub String);

impl GalleryId {
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for GalleryId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MediaItemId(pub String);

impl MediaItemId {
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

impl std::fmt::Display for MediaItemId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Known-good text/point pair used to restore a field, e.g. when editing an
/// existing listing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocationSeed {
    pub text: String,
    pub lat: f64,
    pub lng: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ToastKind {
    #[default]
    Info,
    Success,
    Warning,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToastMessage {
    pub message: String,
    pub kind: ToastKind,
}

impl ToastMessage {
    #[must_use]
    pub fn new(message: impl Into<String>, kind: ToastKind) -> Self {
        Self {
            message: message.into(),
            kind,
        }
    }
}

/// Which flow asked for the reverse lookup; failure handling differs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReversePurpose {
    Verification,
    Geolocation,
}

#[derive(Default)]
pub struct Model {
    pub resolvers: HashMap<ResolverId, ResolverState>,
    pub galleries: HashMap<GalleryId, GalleryState>,
    pub geocode_cache: GeocodeCache,
    pub geocoder: GeocoderConfig,
    pub retry: RetryPolicy,
    pub cache_hydrated: bool,
    pub active_toast: Option<ToastMessage>,
}

impl Model {
    pub fn show_toast(&mut self, message: impl Into<String>, kind: ToastKind) {
        self.active_toast = Some(ToastMessage::new(message, kind));
    }

    pub fn clear_toast(&mut self) {
        self.active_toast = None;
    }
}

#[derive(Debug)]
pub enum Event {
    Noop,

    AppStarted,
    GeocodeCacheLoaded {
        payload: Option<Vec<u8>>,
    },
    GeocodeCacheLoadFailed {
        reason: String,
    },
    GeocodeCachePersisted {
        ok: bool,
    },

    ResolverMounted {
        id: ResolverId,
        seed: Option<LocationSeed>,
    },
    ResolverUnmounted {
        id: ResolverId,
    },
    LocationTextChanged {
        id: ResolverId,
        text: String,
    },
    SuggestDebounceElapsed {
        id: ResolverId,
        generation: u64,
    },
    SuggestionsFetched {
        id: ResolverId,
        generation: u64,
        query: String,
        attempt: u32,
        result: Box<HttpTextResult>,
    },
    SuggestRetryDue {
        id: ResolverId,
        generation: u64,
        query: String,
        attempt: u32,
    },
    SuggestionSelected {
        id: ResolverId,
        text: String,
    },
    VerifyRequested {
        id: ResolverId,
    },
    ForwardGeocoded {
        id: ResolverId,
        generation: u64,
        query: String,
        attempt: u32,
        result: Box<HttpTextResult>,
    },
    ForwardRetryDue {
        id: ResolverId,
        generation: u64,
        query: String,
        attempt: u32,
    },
    ReverseGeocoded {
        id: ResolverId,
        generation: u64,
        purpose: ReversePurpose,
        point: ValidatedCoordinate,
        attempt: u32,
        result: Box<HttpTextResult>,
    },
    ReverseRetryDue {
        id: ResolverId,
        generation: u64,
        purpose: ReversePurpose,
        point: ValidatedCoordinate,
        attempt: u32,
    },
    MapLocationPicked {
        id: ResolverId,
        lat: f64,
        lng: f64,
        name: String,
    },
    UseMyLocationRequested {
        id: ResolverId,
    },
    PositionFixed {
        id: ResolverId,
        generation: u64,
        result: GeolocationResult,
    },
    ResolverReset {
        id: ResolverId,
    },

    GalleryMounted {
        id: GalleryId,
        config: PipelineConfig,
    },
    GalleryUnmounted {
        id: GalleryId,
    },
    FilesOffered {
        id: GalleryId,
        files: Vec<IncomingFile>,
    },
    PreviewCreated {
        gallery_id: GalleryId,
        item_id: MediaItemId,
        result: MediaStoreResult,
    },
    UploadTick {
        gallery_id: GalleryId,
        item_id: MediaItemId,
    },
    MediaEncoded {
        gallery_id: GalleryId,
        item_id: MediaItemId,
        result: MediaStoreResult,
    },
    MediaItemRemoved {
        gallery_id: GalleryId,
        item_id: MediaItemId,
    },
    MediaReordered {
        gallery_id: GalleryId,
        from: usize,
        to: usize,
    },

    ToastDismissed,
}

impl Event {
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Noop => "noop",
            Self::AppStarted => "app_started",
            Self::GeocodeCacheLoaded { .. } => "geocode_cache_loaded",
            Self::GeocodeCacheLoadFailed { .. } => "geocode_cache_load_failed",
            Self::GeocodeCachePersisted { .. } => "geocode_cache_persisted",
            Self::ResolverMounted { .. } => "resolver_mounted",
            Self::ResolverUnmounted { .. } => "resolver_unmounted",
            Self::LocationTextChanged { .. } => "location_text_changed",
            Self::SuggestDebounceElapsed { .. } => "suggest_debounce_elapsed",
            Self::SuggestionsFetched { .. } => "suggestions_fetched",
            Self::SuggestRetryDue { .. } => "suggest_retry_due",
            Self::SuggestionSelected { .. } => "suggestion_selected",
            Self::VerifyRequested { .. } => "verify_requested",
            Self::ForwardGeocoded { .. } => "forward_geocoded",
            Self::ForwardRetryDue { .. } => "forward_retry_due",
            Self::ReverseGeocoded { .. } => "reverse_geocoded",
            Self::ReverseRetryDue { .. } => "reverse_retry_due",
            Self::MapLocationPicked { .. } => "map_location_picked",
            Self::UseMyLocationRequested { .. } => "use_my_location_requested",
            Self::PositionFixed { .. } => "position_fixed",
            Self::ResolverReset { .. } => "resolver_reset",
            Self::GalleryMounted { .. } => "gallery_mounted",
            Self::GalleryUnmounted { .. } => "gallery_unmounted",
            Self::FilesOffered { .. } => "files_offered",
            Self::PreviewCreated { .. } => "preview_created",
            Self::UploadTick { .. } => "upload_tick",
            Self::MediaEncoded { .. } => "media_encoded",
            Self::MediaItemRemoved { .. } => "media_item_removed",
            Self::MediaReordered { .. } => "media_reordered",
            Self::ToastDismissed => "toast_dismissed",
        }
    }
}

impl Default for Event {
    fn default() -> Self {
        Self::Noop
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LocationStatus {
    Idle,
    Typing,
    Verifying,
    Geolocating,
    Verified,
    Error,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct LocationFieldView {
    pub text: String,
    pub status: LocationStatus,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub error: Option<String>,
    pub suggestions: Vec<String>,
    pub is_busy: bool,
}

impl From<&ResolverState> for LocationFieldView {
    fn from(resolver: &ResolverState) -> Self {
        let (status, latitude, longitude, error) = match &resolver.phase {
            ResolverPhase::Idle => (LocationStatus::Idle, None, None, None),
            ResolverPhase::Typing { .. } => (LocationStatus::Typing, None, None, None),
            ResolverPhase::Verifying { .. } => (LocationStatus::Verifying, None, None, None),
            ResolverPhase::Geolocating => (LocationStatus::Geolocating, None, None, None),
            ResolverPhase::Verified { coordinates } => (
                LocationStatus::Verified,
                Some(coordinates.lat()),
                Some(coordinates.lon()),
                None,
            ),
            ResolverPhase::Failed { error } => (
                LocationStatus::Error,
                None,
                None,
                Some(error.user_facing_message()),
            ),
        };

        Self {
            text: resolver.text.clone(),
            status,
            latitude,
            longitude,
            error,
            suggestions: resolver.suggestions().to_vec(),
            is_busy: resolver.is_busy(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MediaItemStatus {
    Uploading,
    Complete,
    Error,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct MediaItemView {
    pub id: String,
    pub kind: MediaKind,
    pub file_name: String,
    pub preview: Option<String>,
    pub progress: u8,
    pub status: MediaItemStatus,
    pub final_ref: Option<String>,
    pub error: Option<String>,
}

impl From<&MediaItem> for MediaItemView {
    fn from(item: &MediaItem) -> Self {
        let status = match &item.phase {
            media::ItemPhase::Uploading => MediaItemStatus::Uploading,
            media::ItemPhase::Complete { .. } => MediaItemStatus::Complete,
            media::ItemPhase::Error { .. } => MediaItemStatus::Error,
        };

        Self {
            id: item.id.0.clone(),
            kind: item.kind,
            file_name: item.file_name.clone(),
            preview: match &item.preview {
                media::PreviewState::Ready(handle) => Some(handle.0.clone()),
                media::PreviewState::Pending => None,
            },
            progress: item.progress,
            status,
            final_ref: item.final_ref().map(ToOwned::to_owned),
            error: item.error_message().map(ToOwned::to_owned),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct GalleryView {
    pub items: Vec<MediaItemView>,
    pub remaining_capacity: usize,
    pub is_processing: bool,
}

impl From<&GalleryState> for GalleryView {
    fn from(gallery: &GalleryState) -> Self {
        Self {
            items: gallery.items().iter().map(MediaItemView::from).collect(),
            remaining_capacity: gallery.remaining_capacity(),
            is_processing: gallery.items().iter().any(MediaItem::is_uploading),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ToastView {
    pub message: String,
    pub kind: ToastKind,
}

impl From<&ToastMessage> for ToastView {
    fn from(toast: &ToastMessage) -> Self {
        Self {
            message: toast.message.clone(),
            kind: toast.kind,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ViewModel {
    pub locations: HashMap<String, LocationFieldView>,
    pub galleries: HashMap<String, GalleryView>,
    pub toast: Option<ToastView>,
}

pub mod app {
    use tracing::{debug, warn};

    use super::{
        AppError, Capabilities, ErrorKind, Event, GalleryView, LocationFieldView, Model,
        ReversePurpose, ToastKind, ToastView, ValidatedCoordinate, ViewModel,
    };
    use crate::capabilities::{MediaStoreOutput, PositionOptions};
    use crate::geocoding::{
        self, GeocodeCache, GeocodeFailure, GEOCODE_CACHE_CAPACITY, GEOCODE_CACHE_KEY,
    };
    use crate::image_processing::EncodeConfig;
    use crate::media::{
        capacity_message, GalleryState, PreviewState, UPLOAD_FAILED_MESSAGE, UPLOAD_TICK_MS,
    };
    use crate::resolver::{ResolverState, SUGGESTION_DEBOUNCE_MS};
    use crate::{HttpTextResult, ResolverId};

    #[derive(Default)]
    pub struct App;

    impl App {
        fn persist_geocode_cache(model: &Model, caps: &Capabilities) {
            match model.geocode_cache.to_blob() {
                Ok(blob) => {
                    caps.kv.set(GEOCODE_CACHE_KEY.to_string(), blob, |result| {
                        Event::GeocodeCachePersisted {
                            ok: result.is_ok(),
                        }
                    });
                }
                Err(error) => warn!(%error, "could not serialize geocode cache"),
            }
        }

        /// Success body, or the classified failure used for retry decisions
        /// and user-facing messages.
        fn response_body(result: HttpTextResult) -> Result<String, GeocodeFailure> {
            match result {
                Ok(mut response) => {
                    let status: u16 = response.status().into();
                    if (200..300).contains(&status) {
                        Ok(response.take_body().unwrap_or_default())
                    } else {
                        Err(GeocodeFailure::from_status(status))
                    }
                }
                Err(error) => Err(GeocodeFailure::Network {
                    message: error.to_string(),
                }),
            }
        }

        fn fail_resolver(model: &mut Model, caps: &Capabilities, id: &ResolverId, error: AppError) {
            if let Some(resolver) = model.resolvers.get_mut(id) {
                resolver.fail(error);
            }
            caps.render.render();
        }

        fn begin_verification(model: &mut Model, caps: &Capabilities, id: &ResolverId) {
            let Some(resolver) = model.resolvers.get_mut(id) else {
                return;
            };
            resolver.begin_verify();
            let generation = resolver.generation;
            let query = resolver.text.clone();
            caps.render.render();

            match model.geocode_cache.lookup(&query) {
                Some(Some(point)) => Self::send_reverse(
                    model,
                    caps,
                    id,
                    generation,
                    ReversePurpose::Verification,
                    point,
                    1,
                ),
                // negative cache: the provider already told us there is no
                // match for this text
                Some(None) => Self::fail_resolver(
                    model,
                    caps,
                    id,
                    AppError::new(ErrorKind::LocationNotFound, format!("no match for {query:?}")),
                ),
                None => Self::send_forward(model, caps, id, generation, &query, 1),
            }
        }

        fn send_forward(
            model: &mut Model,
            caps: &Capabilities,
            id: &ResolverId,
            generation: u64,
            query: &str,
            attempt: u32,
        ) {
            let url = match model.geocoder.forward_url(query) {
                Ok(url) => url,
                Err(failure) => {
                    Self::fail_resolver(model, caps, id, failure.into());
                    return;
                }
            };
            let make_event = {
                let id = id.clone();
                let query = query.to_string();
                move |result| Event::ForwardGeocoded {
                    id: id.clone(),
                    generation,
                    query: query.clone(),
                    attempt,
                    result: Box::new(result),
                }
            };
            caps.http
                .get(url)
                .header("User-Agent", model.geocoder.client_ident.as_str())
                .expect_string()
                .send(make_event);
        }

        fn send_reverse(
            model: &mut Model,
            caps: &Capabilities,
            id: &ResolverId,
            generation: u64,
            purpose: ReversePurpose,
            point: ValidatedCoordinate,
            attempt: u32,
        ) {
            let url = match model.geocoder.reverse_url(point) {
                Ok(url) => url,
                Err(failure) => {
                    Self::reverse_failed(model, caps, id, purpose, point, &failure);
                    return;
                }
            };
            let make_event = {
                let id = id.clone();
                move |result| Event::ReverseGeocoded {
                    id: id.clone(),
                    generation,
                    purpose,
                    point,
                    attempt,
                    result: Box::new(result),
                }
            };
            caps.http
                .get(url)
                .header("User-Agent", model.geocoder.client_ident.as_str())
                .expect_string()
                .send(make_event);
        }

        fn send_suggest(
            model: &Model,
            caps: &Capabilities,
            id: &ResolverId,
            generation: u64,
            query: &str,
            attempt: u32,
        ) {
            let url = match model.geocoder.suggest_url(query) {
                Ok(url) => url,
                Err(failure) => {
                    warn!(%failure, "could not build suggestion URL");
                    return;
                }
            };
            let make_event = {
                let id = id.clone();
                let query = query.to_string();
                move |result| Event::SuggestionsFetched {
                    id: id.clone(),
                    generation,
                    query: query.clone(),
                    attempt,
                    result: Box::new(result),
                }
            };
            caps.http
                .get(url)
                .header("User-Agent", model.geocoder.client_ident.as_str())
                .expect_string()
                .send(make_event);
        }

        /// A reverse lookup that cannot be satisfied ends the two flows
        /// differently: verification fails, while a device fix keeps its
        /// authoritative coordinates under a synthesized label.
        fn reverse_failed(
            model: &mut Model,
            caps: &Capabilities,
            id: &ResolverId,
            purpose: ReversePurpose,
            point: ValidatedCoordinate,
            failure: &GeocodeFailure,
        ) {
            let Some(resolver) = model.resolvers.get_mut(id) else {
                return;
            };
            match purpose {
                ReversePurpose::Verification => resolver.fail(failure.clone().into()),
                ReversePurpose::Geolocation => {
                    debug!(%failure, "no address for device fix, keeping coordinates");
                    resolver.verified(geocoding::coordinate_label(point), point);
                }
            }
            caps.render.render();
        }

        fn on_forward_geocoded(
            model: &mut Model,
            caps: &Capabilities,
            id: &ResolverId,
            generation: u64,
            query: &str,
            attempt: u32,
            result: HttpTextResult,
        ) {
            let current = model
                .resolvers
                .get(id)
                .is_some_and(|r| r.is_current(generation) && r.is_verifying());
            if !current {
                return;
            }

            match Self::response_body(result) {
                Ok(body) => match geocoding::parse_forward(&body) {
                    Ok(Some(point)) => {
                        model.geocode_cache.store(query, Some(point));
                        Self::persist_geocode_cache(model, caps);
                        Self::send_reverse(
                            model,
                            caps,
                            id,
                            generation,
                            ReversePurpose::Verification,
                            point,
                            1,
                        );
                    }
                    Ok(None) => {
                        model.geocode_cache.store(query, None);
                        Self::persist_geocode_cache(model, caps);
                        Self::fail_resolver(
                            model,
                            caps,
                            id,
                            AppError::new(
                                ErrorKind::LocationNotFound,
                                format!("no match for {query:?}"),
                            ),
                        );
                    }
                    Err(failure) => Self::fail_resolver(model, caps, id, failure.into()),
                },
                Err(failure) if model.retry.should_retry(&failure, attempt) => {
                    let delay = model.retry.backoff_ms(attempt);
                    let id = id.clone();
                    let query = query.to_string();
                    caps.timer.notify_after(delay, move || Event::ForwardRetryDue {
                        id,
                        generation,
                        query,
                        attempt: attempt + 1,
                    });
                }
                Err(failure) => Self::fail_resolver(model, caps, id, failure.into()),
            }
        }

        fn on_reverse_geocoded(
            model: &mut Model,
            caps: &Capabilities,
            id: &ResolverId,
            generation: u64,
            purpose: ReversePurpose,
            point: ValidatedCoordinate,
            attempt: u32,
            result: HttpTextResult,
        ) {
            let current = model.resolvers.get(id).is_some_and(|r| {
                r.is_current(generation)
                    && match purpose {
                        ReversePurpose::Verification => r.is_verifying(),
                        ReversePurpose::Geolocation => r.is_geolocating(),
                    }
            });
            if !current {
                return;
            }

            match Self::response_body(result) {
                Ok(body) => match geocoding::parse_reverse(&body, point) {
                    Ok(name) => {
                        if let Some(resolver) = model.resolvers.get_mut(id) {
                            resolver.verified(name, point);
                        }
                        caps.render.render();
                    }
                    Err(failure) => Self::reverse_failed(model, caps, id, purpose, point, &failure),
                },
                Err(failure) if model.retry.should_retry(&failure, attempt) => {
                    let delay = model.retry.backoff_ms(attempt);
                    let id = id.clone();
                    caps.timer.notify_after(delay, move || Event::ReverseRetryDue {
                        id,
                        generation,
                        purpose,
                        point,
                        attempt: attempt + 1,
                    });
                }
                Err(failure) => Self::reverse_failed(model, caps, id, purpose, point, &failure),
            }
        }

        fn on_suggestions_fetched(
            model: &mut Model,
            caps: &Capabilities,
            id: &ResolverId,
            generation: u64,
            query: String,
            attempt: u32,
            result: HttpTextResult,
        ) {
            let Some(resolver) = model.resolvers.get_mut(id) else {
                return;
            };
            if !resolver.is_current(generation) || !resolver.is_typing() {
                return;
            }

            match Self::response_body(result) {
                Ok(body) => {
                    let items = geocoding::parse_suggestions(&body).unwrap_or_else(|failure| {
                        warn!(%failure, "unusable suggestion payload");
                        Vec::new()
                    });
                    resolver.apply_suggestions(generation, items);
                    caps.render.render();
                }
                Err(failure) if model.retry.should_retry(&failure, attempt) => {
                    let delay = model.retry.backoff_ms(attempt);
                    let id = id.clone();
                    caps.timer.notify_after(delay, move || Event::SuggestRetryDue {
                        id,
                        generation,
                        query,
                        attempt: attempt + 1,
                    });
                }
                // suggestions are best-effort: an exhausted retry budget
                // just means an empty list
                Err(failure) => {
                    warn!(%failure, "suggestions unavailable");
                    resolver.apply_suggestions(generation, Vec::new());
                    caps.render.render();
                }
            }
        }
    }

    impl crux_core::App for App {
        type Event = Event;
        type Model = Model;
        type ViewModel = ViewModel;
        type Capabilities = Capabilities;

        fn update(&self, event: Event, model: &mut Model, caps: &Capabilities) {
            debug!(event = event.name(), "update");

            match event {
                Event::Noop => {}

                Event::AppStarted => {
                    caps.kv
                        .get(GEOCODE_CACHE_KEY.to_string(), |result| match result {
                            Ok(payload) => Event::GeocodeCacheLoaded { payload },
                            Err(error) => Event::GeocodeCacheLoadFailed {
                                reason: error.to_string(),
                            },
                        });
                    caps.render.render();
                }

                Event::GeocodeCacheLoaded { payload } => {
                    model.cache_hydrated = true;
                    if let Some(blob) = payload {
                        match GeocodeCache::from_blob(GEOCODE_CACHE_CAPACITY, &blob) {
                            Ok(cache) => {
                                debug!(entries = cache.len(), "geocode cache hydrated");
                                model.geocode_cache = cache;
                            }
                            Err(error) => warn!(%error, "discarding corrupt geocode cache"),
                        }
                    }
                }

                Event::GeocodeCacheLoadFailed { reason } => {
                    // degrade to an empty cache rather than surfacing a fault
                    warn!(%reason, "geocode cache unavailable");
                    model.cache_hydrated = true;
                }

                Event::GeocodeCachePersisted { ok } => {
                    if !ok {
                        warn!("geocode cache write failed");
                    }
                }

                Event::ResolverMounted { id, seed } => {
                    let resolver = match seed {
                        Some(seed) => match ValidatedCoordinate::new(seed.lat, seed.lng) {
                            Ok(point) => ResolverState::seeded(seed.text, point),
                            Err(error) => {
                                warn!(%error, "ignoring seed with invalid coordinates");
                                ResolverState::new()
                            }
                        },
                        None => ResolverState::new(),
                    };
                    model.resolvers.insert(id, resolver);
                    caps.render.render();
                }

                Event::ResolverUnmounted { id } => {
                    model.resolvers.remove(&id);
                }

                Event::LocationTextChanged { id, text } => {
                    let Some(resolver) = model.resolvers.get_mut(&id) else {
                        return;
                    };
                    if resolver.set_text(text) {
                        let generation = resolver.generation;
                        caps.timer.notify_after(SUGGESTION_DEBOUNCE_MS, move || {
                            Event::SuggestDebounceElapsed { id, generation }
                        });
                    }
                    caps.render.render();
                }

                Event::SuggestDebounceElapsed { id, generation } => {
                    let Some(resolver) = model.resolvers.get(&id) else {
                        return;
                    };
                    if !resolver.is_current(generation) || !resolver.is_typing() {
                        return;
                    }
                    let query = resolver.text.clone();
                    Self::send_suggest(model, caps, &id, generation, &query, 1);
                }

                Event::SuggestionsFetched {
                    id,
                    generation,
                    query,
                    attempt,
                    result,
                } => {
                    Self::on_suggestions_fetched(
                        model, caps, &id, generation, query, attempt, *result,
                    );
                }

                Event::SuggestRetryDue {
                    id,
                    generation,
                    query,
                    attempt,
                } => {
                    let relevant = model
                        .resolvers
                        .get(&id)
                        .is_some_and(|r| r.is_current(generation) && r.is_typing());
                    if relevant {
                        Self::send_suggest(model, caps, &id, generation, &query, attempt);
                    }
                }

                Event::SuggestionSelected { id, text } => {
                    let Some(resolver) = model.resolvers.get_mut(&id) else {
                        return;
                    };
                    resolver.choose_suggestion(text);
                    Self::begin_verification(model, caps, &id);
                }

                Event::VerifyRequested { id } => {
                    let Some(resolver) = model.resolvers.get(&id) else {
                        return;
                    };
                    // already verified: idempotent, zero network. Busy or
                    // empty text: nothing to do.
                    if resolver.coordinates().is_some()
                        || resolver.is_busy()
                        || resolver.text.trim().is_empty()
                    {
                        return;
                    }
                    Self::begin_verification(model, caps, &id);
                }

                Event::ForwardGeocoded {
                    id,
                    generation,
                    query,
                    attempt,
                    result,
                } => {
                    Self::on_forward_geocoded(
                        model, caps, &id, generation, &query, attempt, *result,
                    );
                }

                Event::ForwardRetryDue {
                    id,
                    generation,
                    query,
                    attempt,
                } => {
                    let relevant = model
                        .resolvers
                        .get(&id)
                        .is_some_and(|r| r.is_current(generation) && r.is_verifying());
                    if relevant {
                        Self::send_forward(model, caps, &id, generation, &query, attempt);
                    }
                }

                Event::ReverseGeocoded {
                    id,
                    generation,
                    purpose,
                    point,
                    attempt,
                    result,
                } => {
                    Self::on_reverse_geocoded(
                        model, caps, &id, generation, purpose, point, attempt, *result,
                    );
                }

                Event::ReverseRetryDue {
                    id,
                    generation,
                    purpose,
                    point,
                    attempt,
                } => {
                    let relevant = model.resolvers.get(&id).is_some_and(|r| {
                        r.is_current(generation)
                            && match purpose {
                                ReversePurpose::Verification => r.is_verifying(),
                                ReversePurpose::Geolocation => r.is_geolocating(),
                            }
                    });
                    if relevant {
                        Self::send_reverse(model, caps, &id, generation, purpose, point, attempt);
                    }
                }

                Event::MapLocationPicked { id, lat, lng, name } => {
                    match ValidatedCoordinate::new(lat, lng) {
                        Ok(point) => {
                            if let Some(resolver) = model.resolvers.get_mut(&id) {
                                resolver.select_point(name, point);
                                caps.render.render();
                            }
                        }
                        Err(error) => Self::fail_resolver(model, caps, &id, error.into()),
                    }
                }

                Event::UseMyLocationRequested { id } => {
                    let Some(resolver) = model.resolvers.get_mut(&id) else {
                        return;
                    };
                    if resolver.is_busy() {
                        return;
                    }
                    resolver.begin_geolocate();
                    let generation = resolver.generation;
                    caps.geolocation
                        .get_current_position(PositionOptions::default(), {
                            let id = id.clone();
                            move |result| Event::PositionFixed {
                                id: id.clone(),
                                generation,
                                result,
                            }
                        });
                    caps.render.render();
                }

                Event::PositionFixed {
                    id,
                    generation,
                    result,
                } => {
                    let relevant = model
                        .resolvers
                        .get(&id)
                        .is_some_and(|r| r.is_current(generation) && r.is_geolocating());
                    if !relevant {
                        return;
                    }
                    match result {
                        Ok(position) => {
                            match ValidatedCoordinate::new(position.latitude, position.longitude) {
                                Ok(point) => Self::send_reverse(
                                    model,
                                    caps,
                                    &id,
                                    generation,
                                    ReversePurpose::Geolocation,
                                    point,
                                    1,
                                ),
                                Err(error) => {
                                    Self::fail_resolver(model, caps, &id, error.into());
                                }
                            }
                        }
                        Err(error) => {
                            Self::fail_resolver(model, caps, &id, AppError::from(error));
                        }
                    }
                }

                Event::ResolverReset { id } => {
                    if let Some(resolver) = model.resolvers.get_mut(&id) {
                        resolver.reset();
                        caps.render.render();
                    }
                }

                Event::GalleryMounted { id, config } => {
                    model.galleries.insert(id, GalleryState::new(config));
                    caps.render.render();
                }

                Event::GalleryUnmounted { id } => {
                    if let Some(gallery) = model.galleries.remove(&id) {
                        for handle in gallery.into_preview_handles() {
                            caps.media_store.release_preview(handle);
                        }
                    }
                }

                Event::FilesOffered { id, files } => {
                    let Some(gallery) = model.galleries.get_mut(&id) else {
                        return;
                    };
                    let max_files = gallery.config().max_files;
                    let acceptance = gallery.accept_files(files);
                    if acceptance.overflowed > 0 {
                        warn!(
                            dropped = acceptance.overflowed,
                            "media batch exceeded capacity"
                        );
                        model.show_toast(capacity_message(max_files), ToastKind::Warning);
                    }

                    for work in acceptance.accepted {
                        let gallery_id = id.clone();
                        let item_id = work.item_id.clone();

                        caps.media_store.create_preview(
                            work.mime_type.clone(),
                            work.preview_data,
                            {
                                let gallery_id = gallery_id.clone();
                                let item_id = item_id.clone();
                                move |result| Event::PreviewCreated {
                                    gallery_id: gallery_id.clone(),
                                    item_id: item_id.clone(),
                                    result,
                                }
                            },
                        );

                        if let Some(data) = work.encode_data {
                            caps.media_store.encode(
                                work.kind,
                                work.mime_type,
                                data,
                                EncodeConfig::default(),
                                {
                                    let gallery_id = gallery_id.clone();
                                    let item_id = item_id.clone();
                                    move |result| Event::MediaEncoded {
                                        gallery_id: gallery_id.clone(),
                                        item_id: item_id.clone(),
                                        result,
                                    }
                                },
                            );
                            caps.timer.notify_after(UPLOAD_TICK_MS, move || {
                                Event::UploadTick {
                                    gallery_id,
                                    item_id,
                                }
                            });
                        }
                    }
                    caps.render.render();
                }

                Event::PreviewCreated {
                    gallery_id,
                    item_id,
                    result,
                } => match result {
                    Ok(MediaStoreOutput::PreviewCreated { handle }) => {
                        let target = model
                            .galleries
                            .get_mut(&gallery_id)
                            .and_then(|gallery| gallery.item_mut(&item_id));
                        match target {
                            Some(item) => {
                                item.attach_preview(handle);
                                caps.render.render();
                            }
                            // the item vanished while the handle was in
                            // flight; release it so nothing leaks
                            None => caps.media_store.release_preview(handle),
                        }
                    }
                    Ok(output) => {
                        warn!(?output, "unexpected media store output for preview request");
                    }
                    Err(error) => warn!(%error, "preview allocation failed"),
                },

                Event::UploadTick {
                    gallery_id,
                    item_id,
                } => {
                    let Some(item) = model
                        .galleries
                        .get_mut(&gallery_id)
                        .and_then(|gallery| gallery.item_mut(&item_id))
                    else {
                        return;
                    };
                    if item.advance_progress() {
                        caps.timer.notify_after(UPLOAD_TICK_MS, move || {
                            Event::UploadTick {
                                gallery_id,
                                item_id,
                            }
                        });
                        caps.render.render();
                    }
                }

                Event::MediaEncoded {
                    gallery_id,
                    item_id,
                    result,
                } => {
                    let Some(item) = model
                        .galleries
                        .get_mut(&gallery_id)
                        .and_then(|gallery| gallery.item_mut(&item_id))
                    else {
                        return;
                    };
                    if !item.is_uploading() {
                        return;
                    }
                    match result {
                        Ok(MediaStoreOutput::Encoded { media }) => item.complete(media),
                        Ok(output) => {
                            warn!(?output, "unexpected media store output for encode request");
                            item.fail(UPLOAD_FAILED_MESSAGE);
                        }
                        Err(error) => {
                            warn!(%error, "media encoding failed");
                            item.fail(UPLOAD_FAILED_MESSAGE);
                        }
                    }
                    caps.render.render();
                }

                Event::MediaItemRemoved {
                    gallery_id,
                    item_id,
                } => {
                    if let Some(gallery) = model.galleries.get_mut(&gallery_id) {
                        if let Some(item) = gallery.remove(&item_id) {
                            if let PreviewState::Ready(handle) = item.preview {
                                caps.media_store.release_preview(handle);
                            }
                            caps.render.render();
                        }
                    }
                }

                Event::MediaReordered {
                    gallery_id,
                    from,
                    to,
                } => {
                    if let Some(gallery) = model.galleries.get_mut(&gallery_id) {
                        if gallery.reorder(from, to) {
                            caps.render.render();
                        }
                    }
                }

                Event::ToastDismissed => {
                    model.clear_toast();
                    caps.render.render();
                }
            }
        }

        fn view(&self, model: &Model) -> ViewModel {
            ViewModel {
                locations: model
                    .resolvers
                    .iter()
                    .map(|(id, resolver)| (id.0.clone(), LocationFieldView::from(resolver)))
                    .collect(),
                galleries: model
                    .galleries
                    .iter()
                    .map(|(id, gallery)| (id.0.clone(), GalleryView::from(gallery)))
                    .collect(),
                toast: model.active_toast.as_ref().map(ToastView::from),
            }
        }
    }
}
