use std::io;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use futures::future::BoxFuture;
use log::trace;
use thiserror::Error;
use tokio::net::TcpStream;

/// Result of a single reachability check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeOutcome {
    /// The host answered, either by accepting or by refusing the connection.
    Reachable,
    /// Nothing came back before the timeout.
    Unreachable,
    Error(ProbeErrorKind),
}

impl ProbeOutcome {
    pub fn is_reachable(&self) -> bool {
        matches!(self, ProbeOutcome::Reachable)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProbeErrorKind {
    #[error("host unreachable")]
    HostUnreachable,
    #[error("network unreachable")]
    NetworkUnreachable,
    #[error("unknown io error: {0}")]
    Io(String),
}

pub trait Prober: Send + Sync {
    /// Attempts one connection to `host:port`, giving up after `timeout`.
    fn attempt_connect(
        &self,
        host: IpAddr,
        port: u16,
        timeout: Duration,
    ) -> BoxFuture<'static, ProbeOutcome>;
}

/// Probes with a plain TCP connect.
///
/// The stream (or the pending connect) is dropped on every path, which closes
/// the socket exactly once. When the timeout fires first the connect future is
/// dropped with it.
#[derive(Debug, Default, Clone, Copy)]
pub struct TcpProber;

impl Prober for TcpProber {
    fn attempt_connect(
        &self,
        host: IpAddr,
        port: u16,
        timeout: Duration,
    ) -> BoxFuture<'static, ProbeOutcome> {
        let addr = SocketAddr::new(host, port);
        Box::pin(async move {
            match tokio::time::timeout(timeout, TcpStream::connect(addr)).await {
                Ok(Ok(stream)) => {
                    drop(stream);
                    ProbeOutcome::Reachable
                }
                Ok(Err(err)) => classify(&err),
                Err(_) => {
                    trace!("{addr}: no answer within {timeout:?}");
                    ProbeOutcome::Unreachable
                }
            }
        })
    }
}

pub(crate) fn classify(err: &io::Error) -> ProbeOutcome {
    match err.kind() {
        io::ErrorKind::ConnectionRefused => ProbeOutcome::Reachable,
        io::ErrorKind::HostUnreachable => ProbeOutcome::Error(ProbeErrorKind::HostUnreachable),
        io::ErrorKind::NetworkUnreachable => {
            ProbeOutcome::Error(ProbeErrorKind::NetworkUnreachable)
        }
        _ => ProbeOutcome::Error(ProbeErrorKind::Io(err.to_string())),
    }
}
