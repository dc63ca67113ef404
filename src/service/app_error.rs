// Copyright 2025 jonefeewang@gmail.com
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::time::Duration;

pub type AppResult<T> = Result<T, AppError>;

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    /// general errors
    #[error("illegal state: {0}")]
    IllegalStateError(String),

    #[error("invalid value: {0}")]
    InvalidValue(String),

    #[error("I/O error: {0}")]
    DetailedIoError(String),

    #[error("io error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Accept error = {0}")]
    Accept(String),

    #[error("config file error: {0}")]
    ConfigFileError(#[from] config::ConfigError),

    #[error("tls error: {0}")]
    TlsError(#[from] rustls::Error),

    /// connection level errors, each of them ends the affected connection only
    #[error("not connected: {0}")]
    NotConnected(String),

    #[error("connection reset by peer: {0}")]
    ConnectionReset(String),

    #[error("connection {0} closed locally")]
    ConnectionClosed(String),

    #[error("secure session handshake failed: {0}")]
    HandshakeFailure(String),

    #[error("no inbound frame within {0:?}")]
    LivenessTimeout(Duration),

    #[error("connection idle for more than {0:?}")]
    IdleTimeout(Duration),

    /// framing errors
    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    #[error("frame of length {size} exceeds limit {limit}")]
    FrameTooLarge { size: usize, limit: usize },
}

impl AppError {
    /// Whether the error ends the connection because the peer went away,
    /// as opposed to a protocol or local fault.
    pub fn is_disconnect(&self) -> bool {
        match self {
            AppError::ConnectionReset(_) | AppError::ConnectionClosed(_) => true,
            AppError::IoError(err) => matches!(
                err.kind(),
                std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::BrokenPipe
                    | std::io::ErrorKind::UnexpectedEof
            ),
            _ => false,
        }
    }
}
