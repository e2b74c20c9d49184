mod geolocation;
mod media_store;
mod timer;

pub use self::geolocation::{
    GeoPosition, Geolocation, GeolocationError, GeolocationOperation, GeolocationResult,
    PositionOptions, DEFAULT_POSITION_TIMEOUT_MS,
};
pub use self::media_store::{
    EncodedMedia, MediaStore, MediaStoreError, MediaStoreOperation, MediaStoreOutput,
    MediaStoreResult, PreviewHandle,
};
pub use self::timer::{Timer, TimerOperation};

pub use crux_core::render::Render;
pub use crux_http::Http;
pub use crux_kv::KeyValue as Kv;

use crate::{App, Event};

#[derive(crux_core::macros::Effect)]
#[effect(app = "App")]
pub struct Capabilities {
    pub render: Render<Event>,
    pub http: Http<Event>,
    pub kv: Kv<Event>,
    pub timer: Timer<Event>,
    pub geolocation: Geolocation<Event>,
    pub media_store: MediaStore<Event>,
}
