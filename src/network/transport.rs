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
use std::io;
use std::net::Shutdown;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::TcpStream;
use tokio::time;
use tokio_rustls::{client, server};
use tracing::debug;

/// Upper bound for each graceful step of a close, so a stalled peer cannot
/// hold up teardown.
const CLOSE_STEP_TIMEOUT: Duration = Duration::from_secs(2);

/// The active I/O path of a connection. Once a TLS session is established
/// the raw socket is only reachable through it.
pub enum Transport {
    Plain(TcpStream),
    ServerTls(Box<server::TlsStream<TcpStream>>),
    ClientTls(Box<client::TlsStream<TcpStream>>),
}

impl fmt::Debug for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self {
            Transport::Plain(_) => "plain",
            Transport::ServerTls(_) => "server-tls",
            Transport::ClientTls(_) => "client-tls",
        };
        f.debug_tuple("Transport").field(&kind).finish()
    }
}

impl Transport {
    pub fn is_encrypted(&self) -> bool {
        !matches!(self, Transport::Plain(_))
    }

    /// Tears the transport down in order: TLS close_notify, write side
    /// shutdown, socket shutdown for both directions, release.
    ///
    /// Every step runs even if an earlier one failed; failures are only logged.
    pub async fn close(self, id: &str) {
        let tcp = match self {
            Transport::Plain(tcp) => tcp,
            Transport::ServerTls(mut tls) => {
                close_step(id, "close secure session", tls.shutdown()).await;
                let (tcp, _) = (*tls).into_inner();
                tcp
            }
            Transport::ClientTls(mut tls) => {
                close_step(id, "close secure session", tls.shutdown()).await;
                let (tcp, _) = (*tls).into_inner();
                tcp
            }
        };
        close_socket(id, tcp).await;
    }
}

/// Shuts a raw socket down for both directions and releases it.
pub async fn close_socket(id: &str, mut tcp: TcpStream) {
    close_step(id, "close stream", tcp.shutdown()).await;
    match tcp.into_std() {
        Ok(std_tcp) => {
            if let Err(e) = std_tcp.shutdown(Shutdown::Both) {
                // already shut down by the peer is the common case here
                debug!("connection {} socket shutdown: {}", id, e);
            }
            drop(std_tcp);
        }
        Err(e) => debug!("connection {} failed to detach socket: {}", id, e),
    }
}

pub(crate) async fn close_step<F>(id: &str, step: &str, fut: F)
where
    F: std::future::Future<Output = io::Result<()>>,
{
    match time::timeout(CLOSE_STEP_TIMEOUT, fut).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => debug!("connection {} {} failed: {}", id, step, e),
        Err(_) => debug!("connection {} {} timed out", id, step),
    }
}

impl AsyncRead for Transport {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Transport::Plain(tcp) => Pin::new(tcp).poll_read(cx, buf),
            Transport::ServerTls(tls) => Pin::new(tls.as_mut()).poll_read(cx, buf),
            Transport::ClientTls(tls) => Pin::new(tls.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for Transport {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            Transport::Plain(tcp) => Pin::new(tcp).poll_write(cx, buf),
            Transport::ServerTls(tls) => Pin::new(tls.as_mut()).poll_write(cx, buf),
            Transport::ClientTls(tls) => Pin::new(tls.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Transport::Plain(tcp) => Pin::new(tcp).poll_flush(cx),
            Transport::ServerTls(tls) => Pin::new(tls.as_mut()).poll_flush(cx),
            Transport::ClientTls(tls) => Pin::new(tls.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Transport::Plain(tcp) => Pin::new(tcp).poll_shutdown(cx),
            Transport::ServerTls(tls) => Pin::new(tls.as_mut()).poll_shutdown(cx),
            Transport::ClientTls(tls) => Pin::new(tls.as_mut()).poll_shutdown(cx),
        }
    }
}
