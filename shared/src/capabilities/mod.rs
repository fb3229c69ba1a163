pub mod http;
mod map;
#[cfg(feature = "native-http")]
pub mod native;
mod store;

pub use self::http::{HttpError, HttpRequest, HttpResponse, HttpResult, HttpTransport};
pub use self::map::{LayerHandle, LayerStyle, Map, MapOperation, MarkerSpec};
pub use self::store::{Store, StoreOperation, StoreOutput};

pub use crux_core::render::Render;

use crate::event::Event;
use crate::App;

#[derive(crux_core::macros::Effect)]
pub struct Capabilities {
    pub render: Render<Event>,
    pub map: Map<Event>,
    pub store: Store<Event>,
}
