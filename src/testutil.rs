//! Shared test doubles: collaborator fakes and raw-packet builders.

use std::collections::{HashMap, HashSet};
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use ipnet::IpNet;
use parking_lot::Mutex;
use tokio::io::DuplexStream;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::backend::{Dialer, DnsResolver, LocalBackend};
use crate::dispatch::Dispatcher;
use crate::netmap::{MeshEngine, NetmapCallback, NetworkMap};
use crate::packet::{IpFamily, ParsedPacket};
use crate::stack::{
    FlowAddrs, IpStack, NetConn, PacketBuf, StackError, TcpFlowRequest, TcpForwarderFn,
    TcpSocketConfig, TransportAdmissionFn, UdpConn, UdpFlowRequest, UdpForwarderFn,
    LINK_CHANNEL_CAPACITY,
};
use crate::tun::{FilterHook, TunDevice};

/// Poll `cond` until it holds, failing the test after a generous bound.
pub(crate) async fn wait_for(cond: impl Fn() -> bool) {
    for _ in 0..1000 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached in time");
}

pub(crate) fn parse(raw: Vec<u8>) -> ParsedPacket {
    ParsedPacket::parse(raw).expect("test packet must parse")
}

// ── Packet builders ─────────────────────────────────────────────────────────

fn fold(mut acc: u32) -> u16 {
    while acc >> 16 != 0 {
        acc = (acc & 0xffff) + (acc >> 16);
    }
    !(acc as u16)
}

fn sum_bytes(data: &[u8], skip_checksum_at: Option<usize>) -> u32 {
    let mut acc = 0u32;
    let mut i = 0;
    while i < data.len() {
        if Some(i) == skip_checksum_at {
            i += 2;
            continue;
        }
        let hi = u32::from(data[i]) << 8;
        let lo = if i + 1 < data.len() {
            u32::from(data[i + 1])
        } else {
            0
        };
        acc += hi | lo;
        i += 2;
    }
    acc
}

/// The correct ICMPv4 checksum for `icmp` (its checksum field is ignored).
pub(crate) fn icmp4_checksum(icmp: &[u8]) -> u16 {
    fold(sum_bytes(icmp, Some(2)))
}

/// The correct ICMPv6 checksum for `icmp`, including the pseudo-header.
pub(crate) fn icmp6_checksum(src: Ipv6Addr, dst: Ipv6Addr, icmp: &[u8]) -> u16 {
    let mut acc = sum_bytes(&src.octets(), None) + sum_bytes(&dst.octets(), None);
    acc += icmp.len() as u32;
    acc += 58;
    acc += sum_bytes(icmp, Some(2));
    fold(acc)
}

fn v4(addr: SocketAddr) -> Ipv4Addr {
    match addr.ip() {
        IpAddr::V4(ip) => ip,
        IpAddr::V6(_) => panic!("expected an IPv4 address"),
    }
}

fn v6(addr: SocketAddr) -> Ipv6Addr {
    match addr.ip() {
        IpAddr::V6(ip) => ip,
        IpAddr::V4(_) => panic!("expected an IPv6 address"),
    }
}

fn ip4_packet(proto: u8, src: SocketAddr, dst: SocketAddr, transport: &[u8]) -> Vec<u8> {
    let total_len = (20 + transport.len()) as u16;
    let mut hdr = [0u8; 20];
    hdr[0] = 0x45;
    hdr[2..4].copy_from_slice(&total_len.to_be_bytes());
    hdr[8] = 64; // ttl
    hdr[9] = proto;
    hdr[12..16].copy_from_slice(&v4(src).octets());
    hdr[16..20].copy_from_slice(&v4(dst).octets());
    let cksum = fold(sum_bytes(&hdr, Some(10)));
    hdr[10..12].copy_from_slice(&cksum.to_be_bytes());

    let mut pkt = hdr.to_vec();
    pkt.extend_from_slice(transport);
    pkt
}

fn ip6_packet(next_header: u8, src: SocketAddr, dst: SocketAddr, transport: &[u8]) -> Vec<u8> {
    let mut hdr = [0u8; 40];
    hdr[0] = 0x60;
    hdr[4..6].copy_from_slice(&(transport.len() as u16).to_be_bytes());
    hdr[6] = next_header;
    hdr[7] = 64; // hop limit
    hdr[8..24].copy_from_slice(&v6(src).octets());
    hdr[24..40].copy_from_slice(&v6(dst).octets());

    let mut pkt = hdr.to_vec();
    pkt.extend_from_slice(transport);
    pkt
}

fn udp_header(src_port: u16, dst_port: u16, payload_len: usize) -> [u8; 8] {
    let mut hdr = [0u8; 8];
    hdr[0..2].copy_from_slice(&src_port.to_be_bytes());
    hdr[2..4].copy_from_slice(&dst_port.to_be_bytes());
    hdr[4..6].copy_from_slice(&((8 + payload_len) as u16).to_be_bytes());
    hdr
}

fn tcp_header(src_port: u16, dst_port: u16, flags: u8) -> [u8; 20] {
    let mut hdr = [0u8; 20];
    hdr[0..2].copy_from_slice(&src_port.to_be_bytes());
    hdr[2..4].copy_from_slice(&dst_port.to_be_bytes());
    hdr[4..8].copy_from_slice(&0x1000u32.to_be_bytes()); // seq
    hdr[12] = 5 << 4; // data offset
    hdr[13] = flags;
    hdr[14..16].copy_from_slice(&0xffffu16.to_be_bytes()); // window
    hdr
}

pub(crate) fn udp4_packet(src: SocketAddr, dst: SocketAddr, payload: &[u8]) -> Vec<u8> {
    let mut transport = udp_header(src.port(), dst.port(), payload.len()).to_vec();
    transport.extend_from_slice(payload);
    ip4_packet(17, src, dst, &transport)
}

pub(crate) fn udp6_packet(src: SocketAddr, dst: SocketAddr, payload: &[u8]) -> Vec<u8> {
    let mut transport = udp_header(src.port(), dst.port(), payload.len()).to_vec();
    transport.extend_from_slice(payload);
    ip6_packet(17, src, dst, &transport)
}

pub(crate) fn tcp4_packet(src: SocketAddr, dst: SocketAddr, flags: u8) -> Vec<u8> {
    ip4_packet(6, src, dst, &tcp_header(src.port(), dst.port(), flags))
}

pub(crate) fn tcp6_packet(src: SocketAddr, dst: SocketAddr, flags: u8) -> Vec<u8> {
    ip6_packet(6, src, dst, &tcp_header(src.port(), dst.port(), flags))
}

pub(crate) fn icmp4_echo_request(src: SocketAddr, dst: SocketAddr, payload: &[u8]) -> Vec<u8> {
    let mut icmp = vec![8, 0, 0, 0, 0x12, 0x34, 0, 1];
    icmp.extend_from_slice(payload);
    let cksum = icmp4_checksum(&icmp);
    icmp[2..4].copy_from_slice(&cksum.to_be_bytes());
    ip4_packet(1, src, dst, &icmp)
}

pub(crate) fn icmp6_echo_request(src: SocketAddr, dst: SocketAddr, payload: &[u8]) -> Vec<u8> {
    let mut icmp = vec![128, 0, 0, 0, 0x12, 0x34, 0, 1];
    icmp.extend_from_slice(payload);
    let cksum = icmp6_checksum(v6(src), v6(dst), &icmp);
    icmp[2..4].copy_from_slice(&cksum.to_be_bytes());
    ip6_packet(58, src, dst, &icmp)
}

// ── Tunnel device fake ──────────────────────────────────────────────────────

#[derive(Default)]
pub(crate) struct FakeTun {
    inbound: Mutex<Vec<Vec<u8>>>,
    outbound: Mutex<Vec<Vec<u8>>>,
    raw_outbound: Mutex<Vec<Vec<u8>>>,
    post_filter: Mutex<Option<FilterHook>>,
    pre_filter: Mutex<Option<FilterHook>>,
    fail: AtomicBool,
}

impl FakeTun {
    pub(crate) fn fail_injects(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub(crate) fn inbound_count(&self) -> usize {
        self.inbound.lock().len()
    }

    pub(crate) fn outbound_count(&self) -> usize {
        self.outbound.lock().len()
    }

    pub(crate) fn take_inbound(&self) -> Vec<Vec<u8>> {
        std::mem::take(&mut *self.inbound.lock())
    }

    pub(crate) fn take_outbound(&self) -> Vec<Vec<u8>> {
        std::mem::take(&mut *self.outbound.lock())
    }

    pub(crate) fn raw_outbound(&self) -> Vec<Vec<u8>> {
        self.raw_outbound.lock().clone()
    }

    pub(crate) fn clear_raw_outbound(&self) {
        self.raw_outbound.lock().clear();
    }

    pub(crate) fn has_post_filter(&self) -> bool {
        self.post_filter.lock().is_some()
    }

    pub(crate) fn has_pre_filter(&self) -> bool {
        self.pre_filter.lock().is_some()
    }
}

impl TunDevice for FakeTun {
    fn inject_inbound_packet(&self, pkt: PacketBuf) -> io::Result<()> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "tun gone"));
        }
        self.inbound.lock().push(pkt.into_bytes());
        Ok(())
    }

    fn inject_outbound_packet(&self, pkt: PacketBuf) -> io::Result<()> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "tun gone"));
        }
        self.outbound.lock().push(pkt.into_bytes());
        Ok(())
    }

    fn inject_outbound(&self, bytes: &[u8]) -> io::Result<()> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "tun gone"));
        }
        self.raw_outbound.lock().push(bytes.to_vec());
        Ok(())
    }

    fn set_post_filter_in(&self, hook: Option<FilterHook>) {
        *self.post_filter.lock() = hook;
    }

    fn set_pre_filter_from_tun(&self, hook: Option<FilterHook>) {
        *self.pre_filter.lock() = hook;
    }
}

// ── Embedded stack fake ─────────────────────────────────────────────────────

pub(crate) struct FakeStack {
    addresses: Mutex<HashSet<IpNet>>,
    fail_addr: AtomicBool,
    sack: AtomicBool,
    promiscuous: AtomicBool,
    leak_mode: Mutex<String>,
    injected: Mutex<Vec<(IpFamily, Vec<u8>)>>,
    outbound_tx: Mutex<Option<mpsc::Sender<PacketBuf>>>,
    outbound_rx: Mutex<Option<mpsc::Receiver<PacketBuf>>>,
    tcp_fwd: Mutex<Option<TcpForwarderFn>>,
    udp_fwd: Mutex<Option<UdpForwarderFn>>,
    admission: Mutex<Option<TransportAdmissionFn>>,
    closed: AtomicBool,
}

impl FakeStack {
    pub(crate) fn new() -> Self {
        let (tx, rx) = mpsc::channel(LINK_CHANNEL_CAPACITY);
        Self {
            addresses: Mutex::new(HashSet::new()),
            fail_addr: AtomicBool::new(false),
            sack: AtomicBool::new(false),
            promiscuous: AtomicBool::new(false),
            leak_mode: Mutex::new(String::new()),
            injected: Mutex::new(Vec::new()),
            outbound_tx: Mutex::new(Some(tx)),
            outbound_rx: Mutex::new(Some(rx)),
            tcp_fwd: Mutex::new(None),
            udp_fwd: Mutex::new(None),
            admission: Mutex::new(None),
            closed: AtomicBool::new(false),
        }
    }

    pub(crate) fn seed_address(&self, net: &str) {
        self.addresses.lock().insert(net.parse().unwrap());
    }

    pub(crate) fn has_address(&self, net: &str) -> bool {
        self.addresses.lock().contains(&net.parse::<IpNet>().unwrap())
    }

    pub(crate) fn address_count(&self) -> usize {
        self.addresses.lock().len()
    }

    pub(crate) fn fail_address_changes(&self, fail: bool) {
        self.fail_addr.store(fail, Ordering::SeqCst);
    }

    pub(crate) fn injected_count(&self) -> usize {
        self.injected.lock().len()
    }

    pub(crate) fn injected(&self) -> Vec<(IpFamily, Vec<u8>)> {
        self.injected.lock().clone()
    }

    pub(crate) fn outbound_sender(&self) -> mpsc::Sender<PacketBuf> {
        self.outbound_tx.lock().as_ref().expect("stack closed").clone()
    }

    pub(crate) fn drop_outbound_sender(&self) {
        self.outbound_tx.lock().take();
    }

    pub(crate) fn has_tcp_forwarder(&self) -> bool {
        self.tcp_fwd.lock().is_some()
    }

    pub(crate) fn has_udp_forwarder(&self) -> bool {
        self.udp_fwd.lock().is_some()
    }

    /// Run the registered transport admission hook, as the engine would for
    /// a new flow toward `dst`.
    pub(crate) fn admit(&self, dst: IpAddr) {
        let guard = self.admission.lock();
        let hook = guard.as_ref().expect("no admission hook registered");
        hook(dst);
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub(crate) fn sack_enabled(&self) -> bool {
        self.sack.load(Ordering::SeqCst)
    }

    pub(crate) fn promiscuous(&self) -> bool {
        self.promiscuous.load(Ordering::SeqCst)
    }

    pub(crate) fn leak_mode(&self) -> String {
        self.leak_mode.lock().clone()
    }
}

impl IpStack for FakeStack {
    fn enable_sack(&self) -> Result<(), StackError> {
        self.sack.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn create_nic(&self, _nic: u32) -> Result<(), StackError> {
        Ok(())
    }

    fn set_promiscuous_mode(&self, _nic: u32, enable: bool) {
        self.promiscuous.store(enable, Ordering::SeqCst);
    }

    fn install_default_routes(&self, _nic: u32) {}

    fn set_leak_check_mode(&self, mode: &str) {
        *self.leak_mode.lock() = mode.to_string();
    }

    fn add_protocol_address(&self, _nic: u32, addr: IpNet) -> Result<(), StackError> {
        if self.fail_addr.load(Ordering::SeqCst) {
            return Err(StackError("address table full".into()));
        }
        self.addresses.lock().insert(addr);
        Ok(())
    }

    fn remove_address(&self, _nic: u32, addr: IpAddr) -> Result<(), StackError> {
        if self.fail_addr.load(Ordering::SeqCst) {
            return Err(StackError("address table busy".into()));
        }
        self.addresses.lock().retain(|n| n.addr() != addr);
        Ok(())
    }

    fn nic_addresses(&self, _nic: u32) -> Vec<IpNet> {
        self.addresses.lock().iter().copied().collect()
    }

    fn register_tcp_forwarder(
        &self,
        _rcv_buffer_size: usize,
        _max_in_flight: usize,
        handler: TcpForwarderFn,
    ) {
        *self.tcp_fwd.lock() = Some(handler);
    }

    fn register_udp_forwarder(&self, handler: UdpForwarderFn) {
        *self.udp_fwd.lock() = Some(handler);
    }

    fn set_transport_admission(&self, hook: TransportAdmissionFn) {
        *self.admission.lock() = Some(hook);
    }

    fn inject_inbound(&self, family: IpFamily, pkt: PacketBuf) {
        self.injected.lock().push((family, pkt.into_bytes()));
    }

    fn take_outbound_channel(&self) -> Option<mpsc::Receiver<PacketBuf>> {
        self.outbound_rx.lock().take()
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.outbound_tx.lock().take();
    }
}

// ── Overlay engine fake ─────────────────────────────────────────────────────

#[derive(Default)]
pub(crate) struct FakeEngine {
    callbacks: Mutex<Vec<NetmapCallback>>,
    identities: Mutex<HashMap<SocketAddr, IpAddr>>,
}

impl FakeEngine {
    pub(crate) fn fire_netmap(&self, nm: &NetworkMap) {
        for cb in self.callbacks.lock().iter() {
            cb(nm);
        }
    }

    pub(crate) fn identity_count(&self) -> usize {
        self.identities.lock().len()
    }

    pub(crate) fn identity_for(&self, backend_local: SocketAddr) -> Option<IpAddr> {
        self.identities.lock().get(&backend_local).copied()
    }
}

impl MeshEngine for FakeEngine {
    fn add_network_map_callback(&self, cb: NetmapCallback) {
        self.callbacks.lock().push(cb);
    }

    fn register_ip_port_identity(&self, backend_local: SocketAddr, peer: IpAddr) {
        self.identities.lock().insert(backend_local, peer);
    }

    fn unregister_ip_port_identity(&self, backend_local: SocketAddr) {
        self.identities.lock().remove(&backend_local);
    }
}

// ── Local backend fake ──────────────────────────────────────────────────────

#[derive(Default)]
pub(crate) struct FakeBackend {
    ssh: AtomicBool,
    via_ok: AtomicBool,
    ports: Mutex<HashMap<IpAddr, u16>>,
    port_queries: AtomicUsize,
    ssh_conns: Mutex<Vec<NetConn>>,
    peerapi_conns: Mutex<Vec<(SocketAddr, SocketAddr, NetConn)>>,
    http_conns: Mutex<Vec<NetConn>>,
}

impl FakeBackend {
    pub(crate) fn set_ssh_enabled(&self, enabled: bool) {
        self.ssh.store(enabled, Ordering::SeqCst);
    }

    pub(crate) fn set_handle_via(&self, ok: bool) {
        self.via_ok.store(ok, Ordering::SeqCst);
    }

    pub(crate) fn set_peer_api_port(&self, ip: &str, port: u16) {
        self.ports.lock().insert(ip.parse().unwrap(), port);
    }

    pub(crate) fn peer_api_queries(&self) -> usize {
        self.port_queries.load(Ordering::SeqCst)
    }

    pub(crate) fn ssh_conn_count(&self) -> usize {
        self.ssh_conns.lock().len()
    }

    pub(crate) fn peerapi_conns(&self) -> Vec<(SocketAddr, SocketAddr)> {
        self.peerapi_conns
            .lock()
            .iter()
            .map(|(s, d, _)| (*s, *d))
            .collect()
    }

    pub(crate) fn http_conn_count(&self) -> usize {
        self.http_conns.lock().len()
    }
}

impl LocalBackend for FakeBackend {
    fn should_run_ssh(&self) -> bool {
        self.ssh.load(Ordering::SeqCst)
    }

    fn peer_api_port(&self, ip: IpAddr) -> Option<u16> {
        self.port_queries.fetch_add(1, Ordering::SeqCst);
        self.ports.lock().get(&ip).copied()
    }

    fn should_handle_via_ip(&self, _ip: IpAddr) -> bool {
        self.via_ok.load(Ordering::SeqCst)
    }

    fn handle_ssh_conn(&self, conn: NetConn) {
        self.ssh_conns.lock().push(conn);
    }

    fn serve_peer_api_conn(&self, src: SocketAddr, dst: SocketAddr, conn: NetConn) {
        self.peerapi_conns.lock().push((src, dst, conn));
    }

    fn handle_service_http_conn(&self, conn: NetConn) {
        self.http_conns.lock().push(conn);
    }
}

// ── Resolver fake ───────────────────────────────────────────────────────────

#[derive(Default)]
pub(crate) struct FakeResolver {
    reply: Mutex<Vec<u8>>,
    fail_flag: AtomicBool,
    queries: Mutex<Vec<(Vec<u8>, SocketAddr)>>,
    tcp_conns: Mutex<Vec<(SocketAddr, NetConn)>>,
}

impl FakeResolver {
    pub(crate) fn set_reply(&self, reply: Vec<u8>) {
        *self.reply.lock() = reply;
    }

    pub(crate) fn fail(&self, fail: bool) {
        self.fail_flag.store(fail, Ordering::SeqCst);
    }

    pub(crate) fn queries(&self) -> Vec<(Vec<u8>, SocketAddr)> {
        self.queries.lock().clone()
    }

    pub(crate) fn query_count(&self) -> usize {
        self.queries.lock().len()
    }

    pub(crate) fn tcp_conn_srcs(&self) -> Vec<SocketAddr> {
        self.tcp_conns.lock().iter().map(|(s, _)| *s).collect()
    }
}

#[async_trait]
impl DnsResolver for FakeResolver {
    async fn query(&self, packet: Vec<u8>, src: SocketAddr) -> io::Result<Vec<u8>> {
        self.queries.lock().push((packet, src));
        if self.fail_flag.load(Ordering::SeqCst) {
            return Err(io::Error::new(io::ErrorKind::Other, "resolver down"));
        }
        Ok(self.reply.lock().clone())
    }

    fn handle_tcp_conn(&self, conn: NetConn, src: SocketAddr) {
        self.tcp_conns.lock().push((src, conn));
    }
}

// ── Dialer fake ─────────────────────────────────────────────────────────────

type OnDial = Box<dyn Fn() + Send + Sync>;

pub(crate) struct FakeDialer {
    pub(crate) local_addr: SocketAddr,
    fail_flag: AtomicBool,
    block_flag: AtomicBool,
    dialed: Mutex<Vec<SocketAddr>>,
    peers: Mutex<Vec<DuplexStream>>,
    on_dial: Mutex<Option<OnDial>>,
}

impl FakeDialer {
    pub(crate) fn new() -> Self {
        Self {
            local_addr: "127.0.0.1:39993".parse().unwrap(),
            fail_flag: AtomicBool::new(false),
            block_flag: AtomicBool::new(false),
            dialed: Mutex::new(Vec::new()),
            peers: Mutex::new(Vec::new()),
            on_dial: Mutex::new(None),
        }
    }

    pub(crate) fn fail(&self, fail: bool) {
        self.fail_flag.store(fail, Ordering::SeqCst);
    }

    pub(crate) fn block(&self, block: bool) {
        self.block_flag.store(block, Ordering::SeqCst);
    }

    pub(crate) fn set_on_dial(&self, f: impl Fn() + Send + Sync + 'static) {
        *self.on_dial.lock() = Some(Box::new(f));
    }

    pub(crate) fn dialed(&self) -> Vec<SocketAddr> {
        self.dialed.lock().clone()
    }

    pub(crate) fn peer_count(&self) -> usize {
        self.peers.lock().len()
    }

    /// The backend-side end of the most recent dial.
    pub(crate) fn take_peer(&self) -> DuplexStream {
        self.peers.lock().pop().expect("no dialed peer")
    }
}

#[async_trait]
impl Dialer for FakeDialer {
    async fn dial_tcp(&self, addr: SocketAddr) -> io::Result<(NetConn, SocketAddr)> {
        if let Some(f) = self.on_dial.lock().as_ref() {
            f();
        }
        self.dialed.lock().push(addr);
        if self.block_flag.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        if self.fail_flag.load(Ordering::SeqCst) {
            return Err(io::Error::new(
                io::ErrorKind::ConnectionRefused,
                "dial refused",
            ));
        }
        let (ours, theirs) = tokio::io::duplex(64 * 1024);
        self.peers.lock().push(theirs);
        Ok((Box::new(ours), self.local_addr))
    }
}

// ── Flow request fakes ──────────────────────────────────────────────────────

pub(crate) struct TcpReqState {
    accepted: Mutex<Option<TcpSocketConfig>>,
    rejected: AtomicBool,
    pub(crate) hup: CancellationToken,
}

impl TcpReqState {
    pub(crate) fn accepted_cfg(&self) -> Option<TcpSocketConfig> {
        *self.accepted.lock()
    }

    pub(crate) fn rejected(&self) -> bool {
        self.rejected.load(Ordering::SeqCst)
    }
}

pub(crate) struct FakeTcpRequest {
    fa: FlowAddrs,
    state: Arc<TcpReqState>,
    conn: Option<NetConn>,
}

impl FakeTcpRequest {
    /// Returns the request, the mesh-client end of the stream, and a handle
    /// for observing what the dispatcher did with the request.
    pub(crate) fn new(
        src: SocketAddr,
        dst: SocketAddr,
    ) -> (Self, DuplexStream, Arc<TcpReqState>) {
        let (engine_side, client_side) = tokio::io::duplex(64 * 1024);
        let state = Arc::new(TcpReqState {
            accepted: Mutex::new(None),
            rejected: AtomicBool::new(false),
            hup: CancellationToken::new(),
        });
        let req = Self {
            fa: FlowAddrs { src, dst },
            state: Arc::clone(&state),
            conn: Some(Box::new(engine_side)),
        };
        (req, client_side, state)
    }
}

impl TcpFlowRequest for FakeTcpRequest {
    fn addrs(&self) -> FlowAddrs {
        self.fa
    }

    fn hup(&self) -> CancellationToken {
        self.state.hup.clone()
    }

    fn accept(mut self: Box<Self>, cfg: TcpSocketConfig) -> Result<NetConn, StackError> {
        *self.state.accepted.lock() = Some(cfg);
        Ok(self.conn.take().expect("conn already taken"))
    }

    fn reject(self: Box<Self>) {
        self.state.rejected.store(true, Ordering::SeqCst);
    }
}

pub(crate) struct FakeUdpConn {
    incoming: tokio::sync::Mutex<mpsc::Receiver<Vec<u8>>>,
    outgoing: mpsc::Sender<Vec<u8>>,
    closed: CancellationToken,
}

#[async_trait]
impl UdpConn for FakeUdpConn {
    async fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        let mut rx = self.incoming.lock().await;
        tokio::select! {
            _ = self.closed.cancelled() => {
                Err(io::Error::new(io::ErrorKind::BrokenPipe, "endpoint closed"))
            }
            datagram = rx.recv() => match datagram {
                Some(d) => {
                    let n = d.len().min(buf.len());
                    buf[..n].copy_from_slice(&d[..n]);
                    Ok(n)
                }
                None => Err(io::Error::new(io::ErrorKind::UnexpectedEof, "peer gone")),
            },
        }
    }

    async fn send(&self, buf: &[u8]) -> io::Result<usize> {
        if self.closed.is_cancelled() {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "endpoint closed"));
        }
        self.outgoing
            .send(buf.to_vec())
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "peer gone"))?;
        Ok(buf.len())
    }

    fn close(&self) {
        self.closed.cancel();
    }
}

/// The test's end of a fake UDP flow.
pub(crate) struct FakeUdpPeer {
    pub(crate) tx: mpsc::Sender<Vec<u8>>,
    pub(crate) rx: mpsc::Receiver<Vec<u8>>,
    pub(crate) closed: CancellationToken,
}

pub(crate) struct FakeUdpRequest {
    fa: FlowAddrs,
    conn: Arc<FakeUdpConn>,
    pub(crate) fail_endpoint: bool,
}

impl FakeUdpRequest {
    pub(crate) fn new(src: SocketAddr, dst: SocketAddr) -> (Self, FakeUdpPeer) {
        let (in_tx, in_rx) = mpsc::channel(64);
        let (out_tx, out_rx) = mpsc::channel(64);
        let closed = CancellationToken::new();
        let conn = Arc::new(FakeUdpConn {
            incoming: tokio::sync::Mutex::new(in_rx),
            outgoing: out_tx,
            closed: closed.clone(),
        });
        let req = Self {
            fa: FlowAddrs { src, dst },
            conn,
            fail_endpoint: false,
        };
        let peer = FakeUdpPeer { tx: in_tx, rx: out_rx, closed };
        (req, peer)
    }
}

impl UdpFlowRequest for FakeUdpRequest {
    fn addrs(&self) -> FlowAddrs {
        self.fa
    }

    fn create_endpoint(self: Box<Self>) -> Result<Arc<dyn UdpConn>, StackError> {
        if self.fail_endpoint {
            return Err(StackError("no endpoint for you".into()));
        }
        Ok(self.conn)
    }
}

// ── Harness ─────────────────────────────────────────────────────────────────

/// All the fakes plus a dispatcher wired to them.
pub(crate) struct Harness {
    pub(crate) tun: Arc<FakeTun>,
    pub(crate) stack: Arc<FakeStack>,
    pub(crate) engine: Arc<FakeEngine>,
    pub(crate) dialer: Arc<FakeDialer>,
    pub(crate) dns: Arc<FakeResolver>,
    pub(crate) backend: Arc<FakeBackend>,
    pub(crate) ns: Arc<Dispatcher>,
}

impl Harness {
    pub(crate) fn new() -> Self {
        let _ = env_logger::builder().is_test(true).try_init();
        let tun = Arc::new(FakeTun::default());
        let stack = Arc::new(FakeStack::new());
        let engine = Arc::new(FakeEngine::default());
        let dialer = Arc::new(FakeDialer::new());
        let dns = Arc::new(FakeResolver::default());
        let backend = Arc::new(FakeBackend::default());
        let ns = Dispatcher::new(
            Arc::clone(&tun) as Arc<dyn TunDevice>,
            Arc::clone(&stack) as Arc<dyn IpStack>,
            Arc::clone(&engine) as Arc<dyn MeshEngine>,
            Arc::clone(&dialer) as Arc<dyn Dialer>,
            Arc::clone(&dns) as Arc<dyn DnsResolver>,
        )
        .expect("dispatcher construction");
        ns.set_local_backend(Arc::clone(&backend) as Arc<dyn LocalBackend>);
        Self { tun, stack, engine, dialer, dns, backend, ns }
    }

    /// A harness whose dispatcher has already been started.
    pub(crate) fn started() -> Self {
        let h = Self::new();
        Arc::clone(&h.ns).start().expect("start");
        h
    }
}
