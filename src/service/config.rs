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

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::heartbeat::{
    HeartbeatPolicy, DEFAULT_HEARTBEAT_INTERVAL, DEFAULT_IDLE_THRESHOLD, DEFAULT_LIVENESS_TIMEOUT,
    DEFAULT_SWEEP_INTERVAL,
};
use super::{AppError, AppResult};
use crate::network::DEFAULT_MAX_FRAME_SIZE;

pub const DEFAULT_PORT: u16 = 5050;

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub max_connections: usize,
    pub enable_heartbeat: bool,
    pub enable_encryption: bool,
    /// PEM certificate chain presented during the handshake
    pub cert_path: Option<String>,
    /// PEM private key matching `cert_path`
    pub key_path: Option<String>,
    pub handshake_timeout_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            host: "0.0.0.0".to_string(),
            port: DEFAULT_PORT,
            max_connections: 100,
            enable_heartbeat: false,
            enable_encryption: false,
            cert_path: None,
            key_path: None,
            handshake_timeout_ms: 10_000,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct ClientConfig {
    pub host: String,
    pub port: u16,
    pub enable_heartbeat: bool,
    pub enable_encryption: bool,
    /// PEM certificate the server certificate must chain to
    pub ca_cert_path: Option<String>,
    pub server_name: String,
    /// pause between the disconnect notice and closing the socket
    pub close_grace_ms: u64,
    pub handshake_timeout_ms: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            host: "127.0.0.1".to_string(),
            port: DEFAULT_PORT,
            enable_heartbeat: false,
            enable_encryption: false,
            ca_cert_path: None,
            server_name: "localhost".to_string(),
            close_grace_ms: 1000,
            handshake_timeout_ms: 10_000,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct HeartbeatConfig {
    pub interval_ms: u64,
    pub liveness_timeout_ms: u64,
    pub idle_threshold_ms: u64,
    pub sweep_interval_ms: u64,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        HeartbeatConfig {
            interval_ms: DEFAULT_HEARTBEAT_INTERVAL.as_millis() as u64,
            liveness_timeout_ms: DEFAULT_LIVENESS_TIMEOUT.as_millis() as u64,
            idle_threshold_ms: DEFAULT_IDLE_THRESHOLD.as_millis() as u64,
            sweep_interval_ms: DEFAULT_SWEEP_INTERVAL.as_millis() as u64,
        }
    }
}

impl HeartbeatConfig {
    pub fn policy(&self) -> AppResult<HeartbeatPolicy> {
        let policy = HeartbeatPolicy {
            interval: Duration::from_millis(self.interval_ms),
            liveness_timeout: Duration::from_millis(self.liveness_timeout_ms),
            idle_threshold: Duration::from_millis(self.idle_threshold_ms),
            sweep_interval: Duration::from_millis(self.sweep_interval_ms),
        };
        policy.validate()?;
        Ok(policy)
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct NetworkConfig {
    pub max_frame_size: usize,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        NetworkConfig {
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct LogConfig {
    pub dir: String,
    pub file_prefix: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        LogConfig {
            dir: "logs".to_string(),
            file_prefix: "framelink.log".to_string(),
        }
    }
}

#[derive(Debug, Default, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct FramelinkConfig {
    pub server: ServerConfig,
    pub client: ClientConfig,
    pub heartbeat: HeartbeatConfig,
    pub network: NetworkConfig,
    pub log: LogConfig,
}

impl FramelinkConfig {
    pub fn set_up_config<P: AsRef<Path>>(path: P) -> AppResult<FramelinkConfig> {
        let path_str = path
            .as_ref()
            .to_str()
            .ok_or(AppError::InvalidValue(format!(
                "config file path: {}",
                path.as_ref().to_string_lossy()
            )))?;
        let config = config::Config::builder()
            .add_source(config::File::with_name(path_str))
            .build()?;

        let framelink_config: FramelinkConfig = config.try_deserialize()?;
        // fail at load time rather than when the first connection arrives
        framelink_config.heartbeat.policy()?;

        Ok(framelink_config)
    }
}
