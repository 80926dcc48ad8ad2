//! Broker socket: plain TCP or TLS on either side of the connection.

use pin_project_lite::pin_project;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream as ClientTlsStream;
use tokio_rustls::server::TlsStream as ServerTlsStream;

pin_project! {
    #[project = BrokerStreamProj]
    pub enum BrokerStream {
        Plain { #[pin] stream: TcpStream },
        /// Accepted by the embedded broker.
        ServerTls { #[pin] stream: ServerTlsStream<TcpStream> },
        /// Opened by the external broker client.
        ClientTls { #[pin] stream: ClientTlsStream<TcpStream> },
    }
}

impl BrokerStream {
    pub fn is_tls(&self) -> bool {
        !matches!(self, BrokerStream::Plain { .. })
    }
}

impl AsyncRead for BrokerStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.project() {
            BrokerStreamProj::Plain { stream } => stream.poll_read(cx, buf),
            BrokerStreamProj::ServerTls { stream } => stream.poll_read(cx, buf),
            BrokerStreamProj::ClientTls { stream } => stream.poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for BrokerStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.project() {
            BrokerStreamProj::Plain { stream } => stream.poll_write(cx, buf),
            BrokerStreamProj::ServerTls { stream } => stream.poll_write(cx, buf),
            BrokerStreamProj::ClientTls { stream } => stream.poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.project() {
            BrokerStreamProj::Plain { stream } => stream.poll_flush(cx),
            BrokerStreamProj::ServerTls { stream } => stream.poll_flush(cx),
            BrokerStreamProj::ClientTls { stream } => stream.poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.project() {
            BrokerStreamProj::Plain { stream } => stream.poll_shutdown(cx),
            BrokerStreamProj::ServerTls { stream } => stream.poll_shutdown(cx),
            BrokerStreamProj::ClientTls { stream } => stream.poll_shutdown(cx),
        }
    }
}
