pub mod network;
pub mod service;

pub use network::{ClientTrust, Connection, ConnectionState, FrameCodec, Message, ServerCredential};
pub use service::{
    setup_local_tracing, setup_tracing, AppError, AppResult, Client, ClientOptions, ClientState,
    ConnectionRegistry, FramelinkConfig, HeartbeatPolicy, Server, ServerOptions, Shutdown,
};
