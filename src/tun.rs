//! Tunnel device contract.
//!
//! The tunnel wrapper owns the actual TUN file descriptor and the WireGuard
//! data plane; the dispatcher only ever sees it through this trait. Two
//! settable filter hooks let the dispatcher observe packets on both paths:
//! inbound from a peer (after decryption) and outbound from the host (before
//! encryption).

use std::io;
use std::sync::Arc;

use crate::packet::ParsedPacket;
use crate::stack::PacketBuf;

/// Default tunnel MTU, used to size single-datagram read buffers.
pub const DEFAULT_MTU: usize = 1280;

/// What a filter hook tells the tunnel to do with a packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterVerdict {
    /// Resume normal processing (deliver to the host / the tunnel).
    Accept,
    /// Drop and account the packet as rejected traffic.
    Drop,
    /// Stop processing without logging: the hook consumed the packet.
    DropSilently,
}

/// A packet filter installed on one of the tunnel's two paths.
pub type FilterHook = Arc<dyn Fn(&ParsedPacket) -> FilterVerdict + Send + Sync>;

/// The tunnel device as seen by the dispatcher.
pub trait TunDevice: Send + Sync {
    /// Deliver an engine-emitted packet to the host, as if it had arrived
    /// from the network. Takes ownership of the buffer.
    fn inject_inbound_packet(&self, pkt: PacketBuf) -> io::Result<()>;

    /// Send an engine-emitted packet out through the tunnel to a mesh peer.
    /// Takes ownership of the buffer.
    fn inject_outbound_packet(&self, pkt: PacketBuf) -> io::Result<()>;

    /// Send a raw packet out through the tunnel, copying `bytes`.
    fn inject_outbound(&self, bytes: &[u8]) -> io::Result<()>;

    /// Install (or clear) the hook run on packets arriving from a peer,
    /// after decryption and before delivery to the host.
    fn set_post_filter_in(&self, hook: Option<FilterHook>);

    /// Install (or clear) the hook run on packets leaving the host, before
    /// encryption.
    fn set_pre_filter_from_tun(&self, hook: Option<FilterHook>);
}
