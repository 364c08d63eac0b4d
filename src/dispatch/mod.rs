//! The packet dispatcher.
//!
//! One long-lived [`Dispatcher`] per process bridges three worlds: the mesh
//! tunnel (raw IP packets to/from peers), the host's own network stack, and
//! an embedded user-space TCP/IP engine that terminates flows the host
//! should never see.
//!
//! ```text
//!   tunnel (peer) ──► post-filter hook ──► classifier ──┬─► host (Accept)
//!                                                       ├─► engine inject
//!                                                       └─► ping shim
//!   host ──► pre-filter hook ── service-IP traffic ─────► engine inject
//!
//!   engine ──► outbound pump ──┬─► tunnel outbound (to a peer)
//!                              └─► tunnel inbound  (service-IP replies)
//! ```
//!
//! The engine hands accepted flows back through its forwarders; those are
//! proxied in `tcp.rs` / `udp.rs`, with `ping.rs` covering ICMP echo on
//! behalf of routed subnets.

mod ping;
mod tcp;
mod udp;

use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwap;
use ipnet::IpNet;
use once_cell::sync::{Lazy, OnceCell};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::addrs::{self, LocalIpFilter, BROADCAST_V4};
use crate::backend::{Dialer, DnsResolver, LocalBackend};
use crate::error::Error;
use crate::netmap::{MeshEngine, NetworkMap};
use crate::packet::{self, IpProto, ParsedPacket, TCP_ACK, TCP_SYN};
use crate::runtime;
use crate::stack::{
    IpStack, NetConn, PacketBuf, NIC_ID, TCP_MAX_IN_FLIGHT, TCP_RECEIVE_BUFFER_DEFAULT,
};
use crate::tun::{FilterVerdict, TunDevice};

/// Verbose per-packet logging, opt-in via environment.
static DEBUG: Lazy<bool> = Lazy::new(|| {
    std::env::var("MESHSTACK_DEBUG")
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(false)
});

pub(crate) fn debug_enabled() -> bool {
    *DEBUG
}

/// Hook for embedding applications that want to receive every TCP flow the
/// dispatch table would otherwise forward externally.
pub type ForwardTcpIn = Box<dyn Fn(NetConn, u16) + Send + Sync>;

/// The user-space network dispatcher. See the module docs for the data flow.
pub struct Dispatcher {
    tun: Arc<dyn TunDevice>,
    stack: Arc<dyn IpStack>,
    engine: Arc<dyn MeshEngine>,
    dialer: Arc<dyn Dialer>,
    dns: Arc<dyn DnsResolver>,

    backend: OnceCell<Arc<dyn LocalBackend>>,
    forward_tcp_in: OnceCell<ForwardTcpIn>,

    /// Whether traffic to this node's own mesh addresses is terminated in
    /// the embedded engine. Set before `start`.
    process_local_ips: AtomicBool,
    /// Whether traffic to non-local addresses (advertised subnet routes) is
    /// terminated in the embedded engine. Set before `start`.
    process_subnets: AtomicBool,

    // Per-family peerAPI port caches, written on the first SYN of a flow and
    // read for every subsequent inbound TCP packet.
    peerapi_port4: AtomicU32,
    peerapi_port6: AtomicU32,

    /// Predicate for "is this address assigned to this node (not a routed
    /// subnet)". Replaced wholesale on every network-map update.
    local_ip_filter: ArcSwap<LocalIpFilter>,

    /// Open-connection counts per dynamically registered NIC address.
    /// An address is present on the NIC because of us iff its count here is
    /// positive; the reconciler treats these entries as untouchable.
    subnet_refcounts: Mutex<HashMap<IpAddr, usize>>,

    /// Alive from construction until `close`; cancelling it stops the
    /// outbound pump.
    ctx: CancellationToken,
}

impl Dispatcher {
    /// Create a dispatcher and configure the embedded stack: SACK, the one
    /// virtual NIC in promiscuous mode, and default routes for both
    /// families. Stack configuration failures are fatal.
    pub fn new(
        tun: Arc<dyn TunDevice>,
        stack: Arc<dyn IpStack>,
        engine: Arc<dyn MeshEngine>,
        dialer: Arc<dyn Dialer>,
        dns: Arc<dyn DnsResolver>,
    ) -> Result<Arc<Self>, Error> {
        let mut leak_mode = std::env::var("MESHSTACK_LEAK_MODE").unwrap_or_default();
        if leak_mode.is_empty() {
            // The stack's zero-value leak mode enables half-useful checks;
            // anything real must be asked for explicitly.
            leak_mode = "disabled".to_string();
        }
        stack.set_leak_check_mode(&leak_mode);

        stack.enable_sack()?;
        stack.create_nic(NIC_ID)?;
        // The NIC accepts packets for addresses registered after the packet
        // arrived; route acceptance is what the address table controls.
        stack.set_promiscuous_mode(NIC_ID, true);
        stack.install_default_routes(NIC_ID);

        Ok(Arc::new(Self {
            tun,
            stack,
            engine,
            dialer,
            dns,
            backend: OnceCell::new(),
            forward_tcp_in: OnceCell::new(),
            process_local_ips: AtomicBool::new(false),
            process_subnets: AtomicBool::new(false),
            peerapi_port4: AtomicU32::new(0),
            peerapi_port6: AtomicU32::new(0),
            local_ip_filter: ArcSwap::from_pointee(LocalIpFilter::empty()),
            subnet_refcounts: Mutex::new(HashMap::new()),
            ctx: CancellationToken::new(),
        }))
    }

    /// Bind the local backend. Call before `start`.
    pub fn set_local_backend(&self, lb: Arc<dyn LocalBackend>) {
        if self.backend.set(lb).is_err() {
            log::warn!("local backend already set; ignoring replacement");
        }
    }

    /// Install a hook receiving every otherwise-unclaimed inbound TCP flow.
    /// Call before `start`.
    pub fn set_forward_tcp_in(&self, hook: ForwardTcpIn) {
        if self.forward_tcp_in.set(hook).is_err() {
            log::warn!("forward-tcp-in hook already set; ignoring replacement");
        }
    }

    /// Terminate traffic to this node's own addresses in the engine.
    pub fn set_process_local_ips(&self, enable: bool) {
        self.process_local_ips.store(enable, Ordering::Relaxed);
    }

    /// Act as a subnet router: terminate traffic to non-local addresses.
    pub fn set_process_subnets(&self, enable: bool) {
        self.process_subnets.store(enable, Ordering::Relaxed);
    }

    /// Wire up all the handlers and start the outbound pump. The dispatcher
    /// is live from here until [`close`](Self::close). Takes (a clone of)
    /// the owning `Arc` because every installed hook keeps the dispatcher
    /// alive.
    pub fn start(self: Arc<Self>) -> Result<(), Error> {
        let outbound = self
            .stack
            .take_outbound_channel()
            .ok_or(Error::AlreadyStarted)?;

        let this = Arc::clone(&self);
        self.engine
            .add_network_map_callback(Box::new(move |nm| this.reconcile_netmap(nm)));

        // Every transport packet reaching the engine without an endpoint
        // passes through here first, so a subnet destination is on the NIC
        // before the engine decides whether to answer the handshake.
        let this = Arc::clone(&self);
        self.stack.set_transport_admission(Box::new(move |dst| {
            let dst = dst.to_canonical();
            if !this.is_local_ip(dst) {
                this.acquire_subnet_addr(dst);
            }
        }));

        let this = Arc::clone(&self);
        self.stack.register_tcp_forwarder(
            TCP_RECEIVE_BUFFER_DEFAULT,
            TCP_MAX_IN_FLIGHT,
            Box::new(move |req| {
                let this = Arc::clone(&this);
                runtime::spawn(async move { this.accept_tcp(req).await });
            }),
        );

        let this = Arc::clone(&self);
        self.stack.register_udp_forwarder(Box::new(move |req| {
            let this = Arc::clone(&this);
            runtime::spawn(async move { this.accept_udp(req).await });
        }));

        let this = Arc::clone(&self);
        runtime::spawn(async move { this.outbound_pump(outbound).await });

        let this = Arc::clone(&self);
        self.tun
            .set_post_filter_in(Some(Arc::new(move |p| {
                Arc::clone(&this).inject_inbound(p)
            })));
        let this = Arc::clone(&self);
        self.tun
            .set_pre_filter_from_tun(Some(Arc::new(move |p| this.handle_local_packets(p))));

        Ok(())
    }

    /// Stop the outbound pump and shut the embedded stack down. Per-flow
    /// tasks unwind as their endpoints close underneath them.
    pub fn close(&self) {
        self.ctx.cancel();
        self.stack.close();
    }

    // ── Address registry ────────────────────────────────────────────────

    /// Count a flow against `ip`, installing it on the virtual NIC as a
    /// host address when this is the first one. The engine will not accept
    /// a handshake for an address it does not own, and enumerating a whole
    /// advertised subnet up front is not an option.
    pub(crate) fn acquire_subnet_addr(&self, ip: IpAddr) {
        let need_add = {
            let mut counts = self.subnet_refcounts.lock();
            let count = counts.entry(ip).or_insert(0);
            *count += 1;
            *count == 1
        };
        if need_add {
            match self.stack.add_protocol_address(NIC_ID, IpNet::from(ip)) {
                Ok(()) => log::debug!("registered address {ip} for an incoming flow"),
                Err(e) => log::warn!("could not register address {ip}: {e}"),
            }
        }
    }

    /// Drop a flow's count against `ip`, removing the address from the NIC
    /// once no flow references it.
    pub(crate) fn release_subnet_addr(&self, ip: IpAddr) {
        let mut counts = self.subnet_refcounts.lock();
        match counts.get_mut(&ip) {
            Some(count) => {
                *count -= 1;
                if *count == 0 {
                    counts.remove(&ip);
                    match self.stack.remove_address(NIC_ID, ip) {
                        Ok(()) => log::debug!("deregistered flow address {ip}"),
                        Err(e) => log::warn!("could not deregister address {ip}: {e}"),
                    }
                }
            }
            None => log::debug!("release of untracked address {ip}"),
        }
    }

    // ── Network-map reconciliation ──────────────────────────────────────

    /// Apply a network-map update: swap the local-IP predicate, then diff
    /// the NIC's address set against the map and apply the delta. Addresses
    /// held by the registry stay; 255.255.255.255/32 is never ours to touch.
    pub(crate) fn reconcile_netmap(&self, nm: &NetworkMap) {
        let self_addrs = nm
            .self_node
            .as_ref()
            .map(|n| n.addresses.clone())
            .unwrap_or_default();
        self.local_ip_filter
            .store(Arc::new(LocalIpFilter::new(self_addrs)));

        let mut old_addrs: HashSet<IpNet> = HashSet::new();
        for ap in self.stack.nic_addresses(NIC_ID) {
            if ap.addr() == IpAddr::V4(BROADCAST_V4) && ap.prefix_len() == 32 {
                // The stack exposes the broadcast address on its own; we
                // didn't install it, so it is not ours to delete.
                continue;
            }
            old_addrs.insert(ap);
        }

        let mut new_addrs: HashSet<IpNet> = HashSet::new();
        if let Some(node) = &nm.self_node {
            let assigned: HashSet<IpNet> = node.addresses.iter().copied().collect();
            new_addrs.extend(assigned.iter().copied());
            if self.process_subnets.load(Ordering::Relaxed) {
                for route in &node.allowed_ips {
                    if !assigned.contains(route) {
                        new_addrs.insert(*route);
                    }
                }
            }
        }

        let mut to_remove: HashSet<IpNet> = old_addrs.difference(&new_addrs).copied().collect();
        let to_add: HashSet<IpNet> = new_addrs.difference(&old_addrs).copied().collect();

        {
            let counts = self.subnet_refcounts.lock();
            for ip in counts.keys() {
                to_remove.remove(&IpNet::from(*ip));
            }
        }

        for ap in to_remove {
            match self.stack.remove_address(NIC_ID, ap.addr()) {
                Ok(()) => log::debug!("deregistered address {ap}"),
                Err(e) => log::warn!("could not deregister address {ap}: {e}"),
            }
        }
        for ap in to_add {
            match self.stack.add_protocol_address(NIC_ID, ap) {
                Ok(()) => log::debug!("registered address {ap}"),
                Err(e) => log::warn!("could not register address {ap}: {e}"),
            }
        }
    }

    // ── Classification ──────────────────────────────────────────────────

    /// Whether `ip` is assigned to this node directly (not a routed subnet).
    pub(crate) fn is_local_ip(&self, ip: IpAddr) -> bool {
        self.local_ip_filter.load().contains(ip)
    }

    pub(crate) fn backend(&self) -> Option<&Arc<dyn LocalBackend>> {
        self.backend.get()
    }

    pub(crate) fn forward_tcp_in(&self) -> Option<&ForwardTcpIn> {
        self.forward_tcp_in.get()
    }

    pub(crate) fn process_ssh(&self) -> bool {
        self.backend
            .get()
            .map(|lb| lb.should_run_ssh())
            .unwrap_or(false)
    }

    pub(crate) fn process_subnets(&self) -> bool {
        self.process_subnets.load(Ordering::Relaxed)
    }

    fn peerapi_port_cell(&self, ip: IpAddr) -> &AtomicU32 {
        if ip.is_ipv4() {
            &self.peerapi_port4
        } else {
            &self.peerapi_port6
        }
    }

    /// Whether an inbound packet (from a mesh peer) should be terminated in
    /// the embedded engine rather than delivered to the host.
    pub(crate) fn should_process_inbound(&self, p: &ParsedPacket) -> bool {
        if let Some(lb) = self.backend.get() {
            if p.proto == IpProto::Tcp {
                let dst_ip = p.dst.ip();
                let is_local = self.is_local_ip(dst_ip);
                let mut peer_api_port = 0u16;
                if p.tcp_flags & (TCP_SYN | TCP_ACK) == TCP_SYN && is_local {
                    // First SYN of a flow: ask the backend and refresh the
                    // per-family cache for the packets that follow.
                    if let Some(port) = lb.peer_api_port(dst_ip) {
                        peer_api_port = port;
                        self.peerapi_port_cell(dst_ip)
                            .store(u32::from(port), Ordering::Relaxed);
                    }
                } else {
                    peer_api_port =
                        self.peerapi_port_cell(dst_ip).load(Ordering::Relaxed) as u16;
                }
                if is_local && p.dst.port() == peer_api_port && peer_api_port != 0 {
                    return true;
                }
            }
        }
        if self.is_inbound_ssh(p) && self.process_ssh() {
            return true;
        }
        if let IpAddr::V6(dst6) = p.dst.ip() {
            if addrs::in_via_range(dst6) {
                return self
                    .backend
                    .get()
                    .map(|lb| lb.should_handle_via_ip(p.dst.ip()))
                    .unwrap_or(false);
            }
        }
        if !self.process_local_ips.load(Ordering::Relaxed) && !self.process_subnets() {
            // Fast path: nothing is terminated here, skip the filter lookup.
            return false;
        }
        let is_local = self.is_local_ip(p.dst.ip());
        if self.process_local_ips.load(Ordering::Relaxed) && is_local {
            return true;
        }
        if self.process_subnets() && !is_local {
            return true;
        }
        false
    }

    fn is_inbound_ssh(&self, p: &ParsedPacket) -> bool {
        p.proto == IpProto::Tcp && p.dst.port() == 22 && self.is_local_ip(p.dst.ip())
    }

    /// Whether to answer an ICMP echo request out-of-process, and which
    /// address the child `ping` should target. 4-in-6 destinations are
    /// always ours to answer (the host stack has no idea what to do with
    /// them) and get translated to their embedded IPv4 address first.
    pub(crate) fn should_handle_ping(&self, p: &ParsedPacket) -> Option<IpAddr> {
        if !p.is_echo_request() {
            return None;
        }
        let dst = p.dst.ip();
        if let IpAddr::V6(dst6) = dst {
            if addrs::in_via_range(dst6) {
                return Some(IpAddr::V4(addrs::unmap_via(dst6)));
            }
        }
        if !self.process_subnets() {
            return None;
        }
        // Pings between mesh addresses are the engine's business, not ours.
        if addrs::is_mesh_ip(dst) {
            return None;
        }
        Some(dst)
    }

    // ── Tunnel hooks and engine injection ───────────────────────────────

    /// Hook on the inbound path (packets from a mesh peer). Accept lets the
    /// host have the packet; DropSilently means we consumed it.
    pub(crate) fn inject_inbound(self: Arc<Self>, p: &ParsedPacket) -> FilterVerdict {
        if !self.should_process_inbound(p) {
            return FilterVerdict::Accept;
        }

        if let Some(ping_ip) = self.should_handle_ping(p) {
            if let Some(pong) = p.echo_reply() {
                let this = Arc::clone(&self);
                runtime::spawn(async move { this.user_ping(ping_ip, pong).await });
            }
            return FilterVerdict::DropSilently;
        }

        self.inject_into_stack(p);
        FilterVerdict::DropSilently
    }

    /// Hook on the outbound-from-host path. Service-IP traffic on the
    /// well-known ports is redirected into the engine so local processes
    /// can reach the in-process DNS; everything else resumes normally.
    pub(crate) fn handle_local_packets(&self, p: &ParsedPacket) -> FilterVerdict {
        if !addrs::is_service_ip(p.dst.ip()) {
            return FilterVerdict::Accept;
        }
        match p.proto {
            IpProto::Tcp => {
                let port = p.dst.port();
                if port != 53 && port != 80 {
                    return FilterVerdict::Accept;
                }
            }
            IpProto::Udp => {
                if p.dst.port() != 53 {
                    return FilterVerdict::Accept;
                }
            }
            _ => return FilterVerdict::Accept,
        }
        self.inject_into_stack(p);
        FilterVerdict::DropSilently
    }

    /// Copy a classified packet into a fresh engine buffer and enqueue it.
    /// The parsed packet's buffer belongs to the tunnel and is reused.
    pub(crate) fn inject_into_stack(&self, p: &ParsedPacket) {
        if debug_enabled() {
            log::debug!("packet in (from {}): {:02x?}", p.src, p.bytes());
        }
        self.stack
            .inject_inbound(p.family, PacketBuf::new(p.bytes().to_vec()));
    }

    // ── Outbound pump ───────────────────────────────────────────────────

    /// Drain engine-synthesized packets for the dispatcher's whole life.
    ///
    /// The engine tags buffers with neither direction nor source, so the
    /// pump peeks the source address itself: replies from a service IP go
    /// back *into* the host as if they arrived from the network, everything
    /// else goes out through the tunnel to a peer. Each buffer is delivered
    /// exactly once; delivery transfers its reference.
    pub(crate) async fn outbound_pump(self: Arc<Self>, mut outbound: mpsc::Receiver<PacketBuf>) {
        loop {
            let pkt = tokio::select! {
                _ = self.ctx.cancelled() => return,
                pkt = outbound.recv() => match pkt {
                    Some(pkt) => pkt,
                    None => {
                        if !self.ctx.is_cancelled() {
                            log::debug!("outbound packet channel closed");
                        }
                        return;
                    }
                },
            };

            if debug_enabled() {
                log::debug!("packet out: {:02x?}", pkt.bytes());
            }

            let send_to_host = matches!(
                packet::source_ip(pkt.bytes()),
                Some(src) if addrs::is_service_ip(src)
            );
            let (direction, result) = if send_to_host {
                ("inbound", self.tun.inject_inbound_packet(pkt))
            } else {
                ("outbound", self.tun.inject_outbound_packet(pkt))
            };
            if let Err(e) = result {
                // Unrecoverable: the caller has to restart the dispatcher.
                log::error!("tunnel inject {direction}: {e}");
                return;
            }
        }
    }
}

/// Releases a flow's dynamically installed NIC address on every exit path.
///
/// Pairs with the transport admission hook: the hook acquires for non-local
/// destinations, so the guard releases exactly when the destination is not
/// local. Created at the top of each flow handler.
pub(crate) struct SubnetAddrGuard<'a> {
    ns: &'a Dispatcher,
    ip: Option<IpAddr>,
}

impl<'a> SubnetAddrGuard<'a> {
    pub(crate) fn new(ns: &'a Dispatcher, dst: IpAddr) -> Self {
        let ip = (!ns.is_local_ip(dst)).then_some(dst);
        Self { ns, ip }
    }
}

impl Drop for SubnetAddrGuard<'_> {
    fn drop(&mut self) {
        if let Some(ip) = self.ip {
            self.ns.release_subnet_addr(ip);
        }
    }
}
