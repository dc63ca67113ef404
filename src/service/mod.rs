pub use app_error::{AppError, AppResult};
pub use client::{Client, ClientOptions, ClientState};
pub use config::{
    ClientConfig, FramelinkConfig, HeartbeatConfig, LogConfig, NetworkConfig, ServerConfig,
    DEFAULT_PORT,
};
pub use heartbeat::HeartbeatPolicy;
pub use registry::ConnectionRegistry;
pub use server::{Server, ServerOptions};
pub use shutdown::{shutdown_channel, Shutdown};
pub use tracing_config::{setup_local_tracing, setup_tracing, TracingGuard};

mod app_error;
mod client;
mod config;
mod heartbeat;
mod registry;
mod server;
mod shutdown;
mod tracing_config;
