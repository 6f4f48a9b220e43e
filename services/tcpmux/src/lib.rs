pub mod config;
pub mod error;
pub mod logging;
pub mod mux;

pub use config::{Cli, MuxConfig};
pub use error::MuxError;
pub use mux::{
    BroadcastRelay, ClientId, ClientRegistry, ClientSession, MuxStats, RelayContext, RelayEnd,
    SessionEnd, StatsSnapshot, Supervisor, UpstreamLink,
};
