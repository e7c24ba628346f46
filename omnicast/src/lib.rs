mod media_server;
mod payload_store;

pub mod adapter;
pub mod adapters;
pub mod config;
pub mod device_table;
pub mod errors;
pub mod events;
pub mod model;
pub mod registry;
pub mod ssdp;
pub mod supervisor;

pub use adapter::{AdapterState, MediaAdapter, MediaController, RegistryHandle, SessionGuard};
pub use adapters::{
    ChromecastAdapter, ChromecastConfig, DialAdapter, DialConfig, DlnaAdapter, DlnaConfig,
};
pub use config::{EventBusConfig, MediaServerConfig, OverflowPolicy, RegistryConfig};
pub use device_table::DeviceTable;
pub use errors::CastError;
pub use events::{EventBus, EventStream, Subscription};
pub use model::{
    Device, DeviceEvent, DeviceId, MediaImage, MediaMetadata, MediaPayload, MediaPayloadBuilder,
    MediaStatus, PayloadSource, PlaybackState, SendOptions, SendRequest, SendResult,
};
pub use registry::{Registry, RegistryState};
