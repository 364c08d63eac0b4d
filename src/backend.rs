//! Local service contracts: the node backend, the DNS resolver, and the
//! host-stack dialer the proxies use to reach real destinations.

use std::io;
use std::net::{IpAddr, SocketAddr};

use async_trait::async_trait;
use tokio::net::TcpStream;

use crate::stack::NetConn;

/// The node's local backend: answers classification queries and takes over
/// connections destined for in-process services.
///
/// Handoff methods own the connection from the moment they are called; the
/// backend is responsible for servicing and closing it.
pub trait LocalBackend: Send + Sync {
    /// Whether the in-mesh SSH server is enabled on this node.
    fn should_run_ssh(&self) -> bool;

    /// The peerAPI port currently bound on `ip`, if any.
    fn peer_api_port(&self, ip: IpAddr) -> Option<u16>;

    /// Whether this node is responsible for the given 4-in-6 address.
    fn should_handle_via_ip(&self, ip: IpAddr) -> bool;

    fn handle_ssh_conn(&self, conn: NetConn);

    fn serve_peer_api_conn(&self, src: SocketAddr, dst: SocketAddr, conn: NetConn);

    /// An HTTP connection on port 80 of a service IP.
    fn handle_service_http_conn(&self, conn: NetConn);
}

/// The in-process DNS resolver behind the service IP.
#[async_trait]
pub trait DnsResolver: Send + Sync {
    /// Resolve one DNS request packet on behalf of `src`.
    async fn query(&self, packet: Vec<u8>, src: SocketAddr) -> io::Result<Vec<u8>>;

    /// Take over a DNS-over-TCP connection.
    fn handle_tcp_conn(&self, conn: NetConn, src: SocketAddr);
}

/// Opens backend connections through the host's ordinary network stack.
#[async_trait]
pub trait Dialer: Send + Sync {
    /// Dial `addr`, returning the stream and its local (host-side) address.
    async fn dial_tcp(&self, addr: SocketAddr) -> io::Result<(NetConn, SocketAddr)>;
}

/// The default dialer: plain host-stack TCP.
#[derive(Debug, Default)]
pub struct SystemDialer;

#[async_trait]
impl Dialer for SystemDialer {
    async fn dial_tcp(&self, addr: SocketAddr) -> io::Result<(NetConn, SocketAddr)> {
        let stream = TcpStream::connect(addr).await?;
        let local = stream.local_addr()?;
        Ok((Box::new(stream), local))
    }
}
