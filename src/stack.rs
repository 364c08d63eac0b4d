//! Embedded TCP/IP stack contract.
//!
//! The dispatcher drives a user-space TCP/IP engine it does not implement:
//! the engine owns endpoints, reassembly, congestion control, and checksums.
//! This module defines the slice of the engine the dispatcher needs: NIC
//! and address management, forwarder registration with deferred endpoint
//! creation, and the L2 packet channel in both directions.

use std::io;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use async_trait::async_trait;
use ipnet::IpNet;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::packet::IpFamily;

/// The one virtual NIC the dispatcher operates.
pub const NIC_ID: u32 = 1;

/// Capacity of the engine's L2 packet channel; a full channel stalls the
/// engine, which is the only back-pressure mechanism on this path.
pub const LINK_CHANNEL_CAPACITY: usize = 512;

/// Maximum TCP connection attempts the engine keeps in flight before the
/// forwarder has accepted or rejected them.
pub const TCP_MAX_IN_FLIGHT: usize = 16;

/// TCP receive buffer size handed to the engine; zero means engine default.
pub const TCP_RECEIVE_BUFFER_DEFAULT: usize = 0;

/// An error reported by the embedded stack.
#[derive(Debug, Error)]
#[error("{0}")]
pub struct StackError(pub String);

/// An engine packet buffer. Ownership of a `PacketBuf` is the reference the
/// engine's refcounting tracks: handing it to an injection method transfers
/// that reference, dropping it releases it.
#[derive(Debug)]
pub struct PacketBuf {
    bytes: Vec<u8>,
}

impl PacketBuf {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self { bytes }
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }
}

/// The 4-tuple of a forwarded flow. `src` is the mesh peer, `dst` the
/// address the peer was talking to.
#[derive(Debug, Clone, Copy)]
pub struct FlowAddrs {
    pub src: SocketAddr,
    pub dst: SocketAddr,
}

/// Socket options applied when accepting a TCP flow.
///
/// Keepalive is always on: in user space we cannot see an application's own
/// keepalive settings, so conservative timing on every accepted endpoint is
/// the only way idle flows to vanished peers ever die.
#[derive(Debug, Clone, Copy)]
pub struct TcpSocketConfig {
    pub keepalive: bool,
    pub keepalive_idle: Option<Duration>,
}

impl Default for TcpSocketConfig {
    fn default() -> Self {
        Self { keepalive: true, keepalive_idle: None }
    }
}

/// Object-safe alias for a byte stream over an engine endpoint.
pub trait AsyncConn: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> AsyncConn for T {}

/// A blocking-style byte stream over an accepted engine endpoint.
pub type NetConn = Box<dyn AsyncConn>;

/// A new TCP flow offered by the engine's forwarder.
///
/// The client's handshake has *not* completed yet: `accept` creates the
/// endpoint and sends the SYN-ACK, `reject` answers with RST. Exactly one of
/// the two must be called.
pub trait TcpFlowRequest: Send {
    fn addrs(&self) -> FlowAddrs;

    /// A token fired if the engine signals HUP on the pending endpoint
    /// (e.g. the client gave up while we were dialing a backend).
    fn hup(&self) -> CancellationToken;

    /// Complete the handshake and return the connection. On error the
    /// engine has already answered the client with RST.
    fn accept(self: Box<Self>, cfg: TcpSocketConfig) -> Result<NetConn, StackError>;

    /// Abandon the flow, answering the client with RST.
    fn reject(self: Box<Self>);
}

/// A datagram endpoint for an accepted UDP flow.
#[async_trait]
pub trait UdpConn: Send + Sync {
    async fn recv(&self, buf: &mut [u8]) -> io::Result<usize>;
    async fn send(&self, buf: &[u8]) -> io::Result<usize>;
    fn close(&self);
}

/// A new UDP flow offered by the engine's forwarder.
pub trait UdpFlowRequest: Send {
    fn addrs(&self) -> FlowAddrs;
    fn create_endpoint(self: Box<Self>) -> Result<std::sync::Arc<dyn UdpConn>, StackError>;
}

pub type TcpForwarderFn = Box<dyn Fn(Box<dyn TcpFlowRequest>) + Send + Sync>;
pub type UdpForwarderFn = Box<dyn Fn(Box<dyn UdpFlowRequest>) + Send + Sync>;

/// Hook run with the destination address of every transport-layer packet
/// that reaches the engine without a matching endpoint, before the engine
/// handles it. This is where per-flow NIC addresses get installed early
/// enough for the engine to accept the handshake.
pub type TransportAdmissionFn = Box<dyn Fn(IpAddr) + Send + Sync>;

/// The embedded user-space TCP/IP stack.
pub trait IpStack: Send + Sync {
    /// Enable TCP selective acknowledgments stack-wide.
    fn enable_sack(&self) -> Result<(), StackError>;

    fn create_nic(&self, nic: u32) -> Result<(), StackError>;

    /// The NIC must accept packets for addresses it never registered; the
    /// tunnel only delivers packets that are meant for us anyway.
    fn set_promiscuous_mode(&self, nic: u32, enable: bool);

    /// Install the default v4 and v6 routes pointing at `nic`, so every
    /// injected packet is handled by the one virtual NIC.
    fn install_default_routes(&self, nic: u32);

    /// Configure the stack's buffer leak checker ("disabled" to turn off).
    fn set_leak_check_mode(&self, mode: &str);

    fn add_protocol_address(&self, nic: u32, addr: IpNet) -> Result<(), StackError>;

    fn remove_address(&self, nic: u32, addr: IpAddr) -> Result<(), StackError>;

    /// All addresses currently registered on `nic`, with their prefixes.
    fn nic_addresses(&self, nic: u32) -> Vec<IpNet>;

    fn register_tcp_forwarder(
        &self,
        rcv_buffer_size: usize,
        max_in_flight: usize,
        handler: TcpForwarderFn,
    );

    fn register_udp_forwarder(&self, handler: UdpForwarderFn);

    fn set_transport_admission(&self, hook: TransportAdmissionFn);

    /// Enqueue a packet on the engine's inbound L2 channel. The engine holds
    /// its own reference; the passed buffer is consumed.
    fn inject_inbound(&self, family: IpFamily, pkt: PacketBuf);

    /// Claim the engine's outbound L2 channel. Yields `Some` exactly once;
    /// the receiver closes when the stack shuts down.
    fn take_outbound_channel(&self) -> Option<mpsc::Receiver<PacketBuf>>;

    fn close(&self);
}
