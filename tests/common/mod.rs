#![allow(dead_code)]

use std::time::Duration;

use framelink::{
    setup_local_tracing, ClientOptions, ClientTrust, HeartbeatPolicy, Server, ServerCredential,
    ServerOptions,
};
use rstest::fixture;
use tokio::time::{self, Instant};

#[fixture]
#[once]
pub fn setup() {
    setup_local_tracing().expect("failed to setup tracing");
}

/// Self-signed certificate for "localhost", returned as PEM (cert, key).
pub fn self_signed_pem() -> (String, String) {
    let rcgen::CertifiedKey { cert, key_pair } =
        rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
    (cert.pem(), key_pair.serialize_pem())
}

pub fn credentials() -> (ServerCredential, ClientTrust) {
    let (cert, key) = self_signed_pem();
    let credential = ServerCredential::from_pem(cert.as_bytes(), key.as_bytes()).unwrap();
    let trust = ClientTrust::from_pem(cert.as_bytes(), "localhost").unwrap();
    (credential, trust)
}

/// Short durations so liveness behaviour shows up within a test run.
pub fn fast_policy() -> HeartbeatPolicy {
    HeartbeatPolicy {
        interval: Duration::from_millis(100),
        liveness_timeout: Duration::from_millis(400),
        idle_threshold: Duration::from_secs(2),
        sweep_interval: Duration::from_secs(5),
    }
}

pub fn server_options() -> ServerOptions {
    ServerOptions::new("127.0.0.1:0")
}

pub fn client_options(server: &Server) -> ClientOptions {
    let mut options = ClientOptions::new(server.local_addr().to_string());
    options.close_grace = Duration::from_millis(50);
    options
}

/// Polls `condition` until it holds or `timeout` passes.
pub async fn wait_until<F>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        time::sleep(Duration::from_millis(20)).await;
    }
}
