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

//! Heartbeat and timeout policy shared by the server and client engines.
//!
//! Three clocks are involved:
//! - the client sends a heartbeat every `interval`
//! - a server handler gives up on a connection when no frame arrives within
//!   `liveness_timeout`
//! - the server reaper wakes every `sweep_interval` and evicts connections
//!   whose last activity is older than `idle_threshold`

use std::time::Duration;

use tokio::time::Instant;

use super::{AppError, AppResult};

pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(10);
pub const DEFAULT_LIVENESS_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_IDLE_THRESHOLD: Duration = Duration::from_secs(120);
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(600);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeartbeatPolicy {
    pub interval: Duration,
    pub liveness_timeout: Duration,
    pub idle_threshold: Duration,
    pub sweep_interval: Duration,
}

impl Default for HeartbeatPolicy {
    fn default() -> Self {
        HeartbeatPolicy {
            interval: DEFAULT_HEARTBEAT_INTERVAL,
            liveness_timeout: DEFAULT_LIVENESS_TIMEOUT,
            idle_threshold: DEFAULT_IDLE_THRESHOLD,
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
        }
    }
}

impl HeartbeatPolicy {
    pub fn validate(&self) -> AppResult<()> {
        for (name, value) in [
            ("heartbeat interval", self.interval),
            ("liveness timeout", self.liveness_timeout),
            ("idle threshold", self.idle_threshold),
            ("sweep interval", self.sweep_interval),
        ] {
            if value.is_zero() {
                return Err(AppError::InvalidValue(format!("{} must be positive", name)));
            }
        }
        // one missed heartbeat cycle must not race against the reaper
        if self.idle_threshold <= self.liveness_timeout {
            return Err(AppError::InvalidValue(format!(
                "idle threshold {:?} must be larger than liveness timeout {:?}",
                self.idle_threshold, self.liveness_timeout
            )));
        }
        if self.interval >= self.liveness_timeout {
            return Err(AppError::InvalidValue(format!(
                "heartbeat interval {:?} must be shorter than liveness timeout {:?}",
                self.interval, self.liveness_timeout
            )));
        }
        Ok(())
    }

    pub fn is_idle(&self, last_active: Instant, now: Instant) -> bool {
        now.saturating_duration_since(last_active) > self.idle_threshold
    }
}
