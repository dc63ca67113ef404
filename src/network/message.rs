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

use std::fmt;

pub const HEARTBEAT_TOKEN: &str = "[HEARTBEAT]";
pub const DISCONNECT_TOKEN: &str = "[CLIENT_DISCONNECT]";
pub const ECHO_PREFIX: &str = "Echo: ";

/// Application view of one frame payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Data(String),
    /// liveness ping, never echoed
    Heartbeat,
    /// best-effort notice sent right before a graceful close
    DisconnectNotice,
}

impl Message {
    pub fn from_payload(payload: String) -> Message {
        match payload.as_str() {
            HEARTBEAT_TOKEN => Message::Heartbeat,
            DISCONNECT_TOKEN => Message::DisconnectNotice,
            _ => Message::Data(payload),
        }
    }

    pub fn as_payload(&self) -> &str {
        match self {
            Message::Data(text) => text,
            Message::Heartbeat => HEARTBEAT_TOKEN,
            Message::DisconnectNotice => DISCONNECT_TOKEN,
        }
    }

    pub fn is_control(&self) -> bool {
        !matches!(self, Message::Data(_))
    }

    /// The reply a server sends for an application message.
    pub fn echo(text: &str) -> Message {
        Message::Data(format!("{}{}", ECHO_PREFIX, text))
    }
}

impl From<&str> for Message {
    fn from(value: &str) -> Self {
        Message::from_payload(value.to_string())
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_payload())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_control_tokens() {
        assert_eq!(Message::from("[HEARTBEAT]"), Message::Heartbeat);
        assert_eq!(Message::from("[CLIENT_DISCONNECT]"), Message::DisconnectNotice);
        // only an exact match is a control token
        assert_eq!(
            Message::from("[HEARTBEAT] "),
            Message::Data("[HEARTBEAT] ".to_string())
        );
        assert!(Message::Heartbeat.is_control());
        assert!(!Message::from("hello").is_control());
    }

    #[test]
    fn test_payload_and_echo() {
        assert_eq!(Message::Heartbeat.as_payload(), HEARTBEAT_TOKEN);
        assert_eq!(Message::echo("hello"), Message::Data("Echo: hello".to_string()));
        assert_eq!(Message::DisconnectNotice.to_string(), DISCONNECT_TOKEN);
    }
}
