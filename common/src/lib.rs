pub mod actuation;
pub mod assets;
pub mod backoff;
pub mod config;
pub mod connections;
pub mod connectivity;
pub mod control;
pub mod leds;
pub mod routing;
pub mod types;

pub use actuation::{ActuationStats, ActuationTask, FrameClock, PixelSink};
pub use assets::{
    content_type_for, AssetResolver, AssetService, AssetStore, ChunkSink, MountedFs, OpenedAsset,
    ResolveError, ResolvedAsset, ServeError, StreamError,
};
pub use backoff::{ReconnectGate, ReconnectPolicy};
pub use config::{AssetConfig, LedConfig, ReconnectConfig, RuntimeConfig, ServerConfig};
pub use connections::{Admission, ConnectionId, ConnectionRegistry, ConnectionTable, Eviction};
pub use connectivity::{
    ConnectionState, ConnectivityManager, NetEvent, ServerLauncher, ServerSlot, Station,
};
pub use control::{handle_control_request, ControlResponse, MAX_CONTROL_BODY};
pub use leds::{DeviceState, LedFrame, LedSnapshot, LedUpdate, UpdateError};
pub use routing::{
    device_routes, Endpoint, Method, MethodFilter, Registration, Resolution, RouteTable,
};
pub use types::{ControlAck, ErrorBody, Rgb};
