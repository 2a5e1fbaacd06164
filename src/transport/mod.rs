// MIT License - Copyright (c) 2021 TJForc

pub mod link;

use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, error, info};

use crate::config::Endpoint;
use crate::error::{LinkError, Result};

pub use link::{Link, LinkStats};

/// Byte channel a driver talks over: a TCP socket, a serial port, or an
/// in-memory pipe in tests.
pub trait Transport: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T> Transport for T where T: AsyncRead + AsyncWrite + Unpin + Send {}

/// Open the endpoint, bounded by `connect_timeout`.
pub async fn open(endpoint: &Endpoint, connect_timeout: Duration) -> Result<Box<dyn Transport>> {
    info!("Opening transport {}", endpoint.describe());

    match endpoint {
        Endpoint::Tcp { host, port } => {
            let stream = timeout(connect_timeout, TcpStream::connect((host.as_str(), *port)))
                .await
                .map_err(|_| LinkError::ConnectTimeout {
                    endpoint: endpoint.describe(),
                })?
                .map_err(|e| {
                    error!("TCP connect failed: {}", e);
                    LinkError::Io(e)
                })?;
            stream.set_nodelay(true)?;
            debug!("TCP socket connected");
            Ok(Box::new(stream))
        }
        Endpoint::Serial { path, baud } => {
            let builder = tokio_serial::new(path, *baud).timeout(connect_timeout);
            let port = tokio_serial::SerialStream::open(&builder).map_err(|e| {
                error!("Failed to open serial port {}: {}", path, e);
                LinkError::Serial(e)
            })?;
            debug!("Serial port open");
            Ok(Box::new(port))
        }
    }
}

/// Source of fresh transports for a driver worker. Each connect attempt
/// asks for a new one; a broken transport is never reused.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn open(&self) -> Result<Box<dyn Transport>>;
}

/// Connector for a configured TCP or serial endpoint.
#[derive(Debug, Clone)]
pub struct EndpointConnector {
    endpoint: Endpoint,
    connect_timeout: Duration,
}

impl EndpointConnector {
    pub fn new(endpoint: Endpoint, connect_timeout: Duration) -> Self {
        Self {
            endpoint,
            connect_timeout,
        }
    }
}

#[async_trait]
impl Connector for EndpointConnector {
    async fn open(&self) -> Result<Box<dyn Transport>> {
        open(&self.endpoint, self.connect_timeout).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_open_tcp_refused() {
        // Bind then drop to get a port nobody listens on
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let endpoint = Endpoint::Tcp {
            host: "127.0.0.1".into(),
            port,
        };
        let err = open(&endpoint, Duration::from_secs(1)).await.err().unwrap();
        assert!(err.is_transport_fatal());
    }

    #[tokio::test]
    async fn test_open_tcp() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let endpoint = Endpoint::Tcp {
            host: "127.0.0.1".into(),
            port,
        };
        let (opened, accepted) = tokio::join!(
            open(&endpoint, Duration::from_secs(1)),
            listener.accept()
        );
        assert!(opened.is_ok());
        assert!(accepted.is_ok());
    }
}
