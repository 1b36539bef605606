use std::{
    io,
    pin::Pin,
    task::{Context, Poll},
};

use async_trait::async_trait;
use tokio::{
    io::{AsyncRead, AsyncWrite, ReadBuf},
    net::{TcpStream, UdpSocket},
};

use crate::meshport::config;

/// A bidirectional async byte stream.
///
/// Rust trait objects can only have a single non-auto "principal" trait, so we
/// wrap `AsyncRead + AsyncWrite` into a single trait.
pub trait AsyncStream: AsyncRead + AsyncWrite {}
impl<T> AsyncStream for T where T: AsyncRead + AsyncWrite + ?Sized {}

pub type BoxedStream = Box<dyn AsyncStream + Unpin + Send>;

/// The in-process endpoint on the overlay network.
///
/// Routes dial upstreams through this seam; HTTP routes reuse its HTTP client.
/// The client carries redirect-following disabled so proxied 3xx responses
/// reach the caller unchanged.
#[async_trait]
pub trait OverlayClient: Send + Sync {
    async fn user_dial(&self, protocol: &str, host: &str, port: u16) -> anyhow::Result<BoxedStream>;

    fn http_client(&self) -> &reqwest::Client;
}

/// Overlay client that dials through the host's mesh interface.
///
/// Overlay membership (auth key, node hostname) is handled by the host's mesh
/// daemon; the settings identify this node and persist with the config.
pub struct DirectOverlay {
    hostname: String,
    http: reqwest::Client,
}

impl DirectOverlay {
    pub fn new(settings: &config::TailscaleConfig) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .build()?;
        Ok(Self {
            hostname: settings.hostname.clone(),
            http,
        })
    }

    #[allow(dead_code)]
    pub fn hostname(&self) -> &str {
        &self.hostname
    }
}

#[async_trait]
impl OverlayClient for DirectOverlay {
    async fn user_dial(&self, protocol: &str, host: &str, port: u16) -> anyhow::Result<BoxedStream> {
        match protocol {
            "tcp" => {
                let stream = TcpStream::connect((host, port)).await?;
                Ok(Box::new(stream))
            }
            "udp" => {
                let sock = UdpSocket::bind("0.0.0.0:0").await?;
                sock.connect((host, port)).await?;
                Ok(Box::new(UdpStream { sock }))
            }
            other => anyhow::bail!("overlay: unsupported dial protocol {other:?}"),
        }
    }

    fn http_client(&self) -> &reqwest::Client {
        &self.http
    }
}

/// Adapts a connected datagram socket to the stream contract:
/// one write sends one datagram, one read receives one datagram.
struct UdpStream {
    sock: UdpSocket,
}

impl AsyncRead for UdpStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        self.sock.poll_recv(cx, buf)
    }
}

impl AsyncWrite for UdpStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        self.sock.poll_send(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}
