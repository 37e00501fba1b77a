//! TCP server helper.
//!
//! A [`DicomServer`] listens on a socket address
//! and serves every incoming connection with its own acceptor engine.
use std::net::SocketAddr;

use snafu::{Backtrace, ResultExt, Snafu};
use tokio::net::{TcpListener, ToSocketAddrs};
use tracing::{debug, error, info};

use crate::provider::ServiceProvider;
use crate::service::{DicomService, DicomServiceBuilder};

#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum Error {
    /// could not bind listener
    Bind {
        source: std::io::Error,
        backtrace: Backtrace,
    },
    /// could not accept connection
    Accept {
        source: std::io::Error,
        backtrace: Backtrace,
    },
    /// could not obtain local address
    LocalAddr {
        source: std::io::Error,
        backtrace: Backtrace,
    },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Accepts TCP connections and runs the DIMSE engine on each of them.
///
/// ```no_run
/// # use dicom_dimse::association::AcceptorPolicy;
/// # use dicom_dimse::provider::Capabilities;
/// # use dicom_dimse::server::DicomServer;
/// # use dicom_dimse::service::DicomServiceBuilder;
/// # async fn run() -> Result<(), Box<dyn std::error::Error>> {
/// let builder = DicomServiceBuilder::new().capabilities(Capabilities::verification());
/// let server = DicomServer::bind("0.0.0.0:11112", builder).await?;
/// server
///     .run(|_addr| {
///         AcceptorPolicy::new()
///             .ae_title("ECHO-SCP")
///             .with_abstract_syntax("1.2.840.10008.1.1")
///     })
///     .await?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct DicomServer {
    listener: TcpListener,
    builder: DicomServiceBuilder,
}

impl DicomServer {
    pub async fn bind(addr: impl ToSocketAddrs, builder: DicomServiceBuilder) -> Result<Self> {
        let listener = TcpListener::bind(addr).await.context(BindSnafu)?;
        Ok(DicomServer { listener, builder })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.listener.local_addr().context(LocalAddrSnafu)
    }

    /// Accept a single connection
    /// and start serving it with the given provider.
    pub async fn accept<P>(&self, provider: P) -> Result<(DicomService, SocketAddr)>
    where
        P: ServiceProvider + 'static,
    {
        let (socket, addr) = self.listener.accept().await.context(AcceptSnafu)?;
        if let Err(e) = socket.set_nodelay(true) {
            debug!("Could not set TCP_NODELAY: {}", e);
        }
        info!("New connection from {}", addr);
        Ok((self.builder.accept(socket, provider), addr))
    }

    /// Serve connections until accepting one fails.
    ///
    /// `factory` creates the association provider of each connection.
    pub async fn run<F, P>(self, mut factory: F) -> Result<()>
    where
        F: FnMut(SocketAddr) -> P,
        P: ServiceProvider + 'static,
    {
        if let Ok(addr) = self.listener.local_addr() {
            info!("Listening on tcp://{}", addr);
        }
        loop {
            let (socket, addr) = match self.listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    error!("Could not accept connection: {}", e);
                    return Err(e).context(AcceptSnafu);
                }
            };
            if let Err(e) = socket.set_nodelay(true) {
                debug!("Could not set TCP_NODELAY: {}", e);
            }
            info!("New connection from {}", addr);
            self.builder.accept(socket, factory(addr));
        }
    }
}
