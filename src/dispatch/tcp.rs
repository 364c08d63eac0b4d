//! TCP acceptor and proxy.
//!
//! The engine's forwarder offers each new inbound TCP flow before the
//! client's handshake completes. The dispatch table picks a handler (an
//! in-process service, or an external forward through the host stack) and
//! only then commits the handshake, so a client never sees a SYN-ACK for a
//! backend that turned out not to exist.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use crate::addrs;
use crate::stack::{TcpFlowRequest, TcpSocketConfig};

use super::{debug_enabled, Dispatcher, SubnetAddrGuard};

/// Keepalive idle time for in-mesh SSH sessions. SSH connections stay idle
/// for days on purpose; 72 hours spans a long weekend.
pub(crate) const SSH_KEEPALIVE_IDLE: Duration = Duration::from_secs(72 * 60 * 60);

impl Dispatcher {
    /// Handle one flow offered by the engine's TCP forwarder.
    pub(crate) async fn accept_tcp(self: Arc<Self>, req: Box<dyn TcpFlowRequest>) {
        let fa = req.addrs();
        let src = SocketAddr::new(fa.src.ip().to_canonical(), fa.src.port());
        let dst = SocketAddr::new(fa.dst.ip().to_canonical(), fa.dst.port());
        if debug_enabled() {
            log::debug!("tcp forwarder request: {src} -> {dst}");
        }

        // The admission hook registered a non-local destination on the NIC
        // before the engine would look at the handshake; give that back on
        // every exit path, RST included.
        let _addr_guard = SubnetAddrGuard::new(&self, dst.ip());

        let mut dial_ip = dst.ip();
        let mut is_mesh = addrs::is_mesh_ip(dial_ip);
        if let IpAddr::V6(v6) = dial_ip {
            if addrs::in_via_range(v6) {
                is_mesh = false;
                dial_ip = IpAddr::V4(addrs::unmap_via(v6));
            }
        }
        let port = dst.port();

        if port == 53 && addrs::is_service_ip(dst.ip()) {
            match req.accept(TcpSocketConfig::default()) {
                Ok(conn) => self.dns.handle_tcp_conn(conn, src),
                Err(e) => log::warn!("dns-over-tcp endpoint for {src}: {e}"),
            }
            return;
        }

        if let Some(lb) = self.backend() {
            if port == 22 && self.process_ssh() && self.is_local_ip(dial_ip) {
                let cfg = TcpSocketConfig {
                    keepalive: true,
                    keepalive_idle: Some(SSH_KEEPALIVE_IDLE),
                };
                match req.accept(cfg) {
                    Ok(conn) => lb.handle_ssh_conn(conn),
                    Err(e) => log::warn!("ssh endpoint for {src}: {e}"),
                }
                return;
            }
            if let Some(peer_api_port) = lb.peer_api_port(dial_ip) {
                if port == peer_api_port && self.is_local_ip(dial_ip) {
                    match req.accept(TcpSocketConfig::default()) {
                        Ok(conn) => lb.serve_peer_api_conn(
                            src,
                            SocketAddr::new(dial_ip, peer_api_port),
                            conn,
                        ),
                        Err(e) => log::warn!("peerapi endpoint for {src}: {e}"),
                    }
                    return;
                }
            }
            if port == 80 && addrs::is_service_ip(dst.ip()) {
                match req.accept(TcpSocketConfig::default()) {
                    Ok(conn) => lb.handle_service_http_conn(conn),
                    Err(e) => log::warn!("service http endpoint for {src}: {e}"),
                }
                return;
            }
        }

        if let Some(hook) = self.forward_tcp_in() {
            match req.accept(TcpSocketConfig::default()) {
                Ok(conn) => hook(conn, port),
                Err(e) => log::warn!("forward-tcp-in endpoint for {src}: {e}"),
            }
            return;
        }

        if is_mesh {
            // A mesh address nothing in-process claimed: whatever should
            // answer is listening on the host's loopback.
            dial_ip = IpAddr::V4(Ipv4Addr::LOCALHOST);
        }
        self.forward_tcp(req, src.ip(), SocketAddr::new(dial_ip, port))
            .await;
    }

    /// Proxy a flow to `dial_addr` through the host's network stack.
    ///
    /// The backend dial happens first; only a successful dial completes the
    /// client's handshake. An engine HUP while the dial is in flight means
    /// the client gave up, so the dial is abandoned.
    async fn forward_tcp(
        &self,
        req: Box<dyn TcpFlowRequest>,
        client_ip: IpAddr,
        dial_addr: SocketAddr,
    ) {
        if debug_enabled() {
            log::debug!("forwarding incoming connection to {dial_addr}");
        }

        let hup = req.hup();
        let dialed = tokio::select! {
            _ = hup.cancelled() => {
                log::debug!("endpoint hup while dialing {dial_addr}");
                req.reject();
                return;
            }
            res = self.dialer.dial_tcp(dial_addr) => res,
        };
        let (server, backend_local) = match dialed {
            Ok(v) => v,
            Err(e) => {
                log::warn!("could not connect to local server at {dial_addr}: {e}");
                req.reject();
                return;
            }
        };

        let client = match req.accept(TcpSocketConfig::default()) {
            Ok(c) => c,
            Err(e) => {
                log::warn!("endpoint for {dial_addr}: {e}");
                return;
            }
        };

        // Let the rest of the system look up which mesh peer is behind the
        // backend's local socket for as long as the flow lives.
        self.engine.register_ip_port_identity(backend_local, client_ip);

        let (mut client_r, mut client_w) = tokio::io::split(client);
        let (mut server_r, mut server_w) = tokio::io::split(server);
        let result = tokio::select! {
            r = tokio::io::copy(&mut client_r, &mut server_w) => r,
            r = tokio::io::copy(&mut server_r, &mut client_w) => r,
        };

        self.engine.unregister_ip_port_identity(backend_local);
        if let Err(e) = result {
            log::debug!("proxy connection closed with error: {e}");
        }
        if debug_enabled() {
            log::debug!("forwarder connection to {dial_addr} closed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::netmap::{NetworkMap, SelfNode};
    use crate::testutil::{wait_for, FakeTcpRequest, Harness};
    use std::sync::atomic::{AtomicBool, Ordering};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn sa(s: &str) -> SocketAddr {
        s.parse().unwrap()
    }

    fn local_netmap(addr: &str) -> NetworkMap {
        NetworkMap {
            self_node: Some(SelfNode {
                addresses: vec![addr.parse().unwrap()],
                allowed_ips: vec![addr.parse().unwrap()],
            }),
        }
    }

    #[tokio::test]
    async fn dns_over_tcp_goes_to_the_resolver() {
        let h = Harness::new();
        let (req, _peer, state) =
            FakeTcpRequest::new(sa("100.64.0.9:4000"), sa("100.100.100.100:53"));
        Arc::clone(&h.ns).accept_tcp(Box::new(req)).await;

        assert_eq!(h.dns.tcp_conn_srcs(), vec![sa("100.64.0.9:4000")]);
        let cfg = state.accepted_cfg().unwrap();
        assert!(cfg.keepalive);
        assert_eq!(cfg.keepalive_idle, None);
    }

    #[tokio::test]
    async fn ssh_uses_long_keepalive_idle() {
        let h = Harness::new();
        h.ns.reconcile_netmap(&local_netmap("100.64.0.1/32"));
        h.backend.set_ssh_enabled(true);

        let (req, _peer, state) = FakeTcpRequest::new(sa("100.64.0.9:4000"), sa("100.64.0.1:22"));
        Arc::clone(&h.ns).accept_tcp(Box::new(req)).await;

        assert_eq!(h.backend.ssh_conn_count(), 1);
        let cfg = state.accepted_cfg().unwrap();
        assert_eq!(cfg.keepalive_idle, Some(SSH_KEEPALIVE_IDLE));
    }

    #[tokio::test]
    async fn peerapi_flow_is_served_with_both_addresses() {
        let h = Harness::new();
        h.ns.reconcile_netmap(&local_netmap("100.64.0.1/32"));
        h.backend.set_peer_api_port("100.64.0.1", 52345);

        let (req, _peer, _state) =
            FakeTcpRequest::new(sa("100.64.0.9:4000"), sa("100.64.0.1:52345"));
        Arc::clone(&h.ns).accept_tcp(Box::new(req)).await;

        assert_eq!(
            h.backend.peerapi_conns(),
            vec![(sa("100.64.0.9:4000"), sa("100.64.0.1:52345"))]
        );
    }

    #[tokio::test]
    async fn port_80_on_service_ip_is_served_in_process() {
        let h = Harness::new();
        let (req, _peer, _state) =
            FakeTcpRequest::new(sa("100.64.0.9:4000"), sa("100.100.100.100:80"));
        Arc::clone(&h.ns).accept_tcp(Box::new(req)).await;
        assert_eq!(h.backend.http_conn_count(), 1);
    }

    #[tokio::test]
    async fn forward_hook_claims_leftover_flows() {
        let h = Harness::new();
        let got: Arc<parking_lot::Mutex<Vec<u16>>> = Arc::default();
        let got2 = Arc::clone(&got);
        h.ns.set_forward_tcp_in(Box::new(move |_conn, port| got2.lock().push(port)));

        let (req, _peer, _state) =
            FakeTcpRequest::new(sa("100.64.0.9:4000"), sa("192.168.1.5:8080"));
        Arc::clone(&h.ns).accept_tcp(Box::new(req)).await;

        assert_eq!(*got.lock(), vec![8080]);
        assert!(h.dialer.dialed().is_empty());
    }

    #[tokio::test]
    async fn external_forward_dials_before_completing_the_handshake() {
        let h = Harness::new();
        let accepted_early = Arc::new(AtomicBool::new(false));

        let (req, _peer, state) =
            FakeTcpRequest::new(sa("100.64.0.9:4000"), sa("192.168.1.5:8080"));
        {
            let accepted_early = Arc::clone(&accepted_early);
            let state = Arc::clone(&state);
            h.dialer.set_on_dial(move || {
                accepted_early.store(state.accepted_cfg().is_some(), Ordering::SeqCst);
            });
        }
        Arc::clone(&h.ns).accept_tcp(Box::new(req)).await;

        assert!(!accepted_early.load(Ordering::SeqCst));
        assert!(state.accepted_cfg().is_some());
        assert_eq!(h.dialer.dialed(), vec![sa("192.168.1.5:8080")]);
    }

    #[tokio::test]
    async fn dial_failure_answers_with_rst() {
        let h = Harness::new();
        h.dialer.fail(true);

        let (req, _peer, state) =
            FakeTcpRequest::new(sa("100.64.0.9:4000"), sa("192.168.1.5:8080"));
        Arc::clone(&h.ns).accept_tcp(Box::new(req)).await;

        assert!(state.rejected());
        assert!(state.accepted_cfg().is_none());
    }

    #[tokio::test]
    async fn endpoint_hup_cancels_the_dial() {
        let h = Harness::new();
        h.dialer.block(true);

        let (req, _peer, state) =
            FakeTcpRequest::new(sa("100.64.0.9:4000"), sa("192.168.1.5:8080"));
        let hup = state.hup.clone();
        let task = tokio::spawn(Arc::clone(&h.ns).accept_tcp(Box::new(req)));

        wait_for(|| !h.dialer.dialed().is_empty()).await;
        hup.cancel();
        task.await.unwrap();
        assert!(state.rejected());
    }

    #[tokio::test]
    async fn local_mesh_destination_is_rewritten_to_loopback() {
        let h = Harness::new();
        h.ns.reconcile_netmap(&local_netmap("100.64.0.1/32"));

        let (req, _peer, _state) =
            FakeTcpRequest::new(sa("100.64.0.9:4000"), sa("100.64.0.1:9999"));
        Arc::clone(&h.ns).accept_tcp(Box::new(req)).await;

        assert_eq!(h.dialer.dialed(), vec![sa("127.0.0.1:9999")]);
    }

    #[tokio::test]
    async fn via_destination_dials_the_embedded_ipv4() {
        let h = Harness::new();
        let (req, _peer, _state) = FakeTcpRequest::new(
            sa("[fd7a:115c:a1e0::9]:4000"),
            sa("[fd7a:115c:a1e0:b1a::5:a00:5]:8080"),
        );
        Arc::clone(&h.ns).accept_tcp(Box::new(req)).await;
        assert_eq!(h.dialer.dialed(), vec![sa("10.0.0.5:8080")]);
    }

    #[tokio::test]
    async fn forwarded_flow_pipes_data_and_tracks_identity() {
        let h = Harness::new();

        let (req, peer, _state) =
            FakeTcpRequest::new(sa("100.64.0.9:4000"), sa("192.168.1.5:8080"));
        let task = tokio::spawn(Arc::clone(&h.ns).accept_tcp(Box::new(req)));

        wait_for(|| h.dialer.peer_count() == 1).await;
        let mut backend = h.dialer.take_peer();
        let mut peer = peer;

        wait_for(|| h.engine.identity_count() == 1).await;
        assert_eq!(
            h.engine.identity_for(h.dialer.local_addr),
            Some("100.64.0.9".parse().unwrap())
        );

        peer.write_all(b"hello").await.unwrap();
        let mut buf = [0u8; 5];
        backend.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");

        backend.write_all(b"world").await.unwrap();
        peer.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"world");

        // First closed direction tears the whole flow down.
        drop(peer);
        task.await.unwrap();
        assert_eq!(h.engine.identity_count(), 0);
    }

    #[tokio::test]
    async fn subnet_destination_releases_nic_address_on_exit() {
        let h = Harness::started();
        h.ns.set_process_subnets(true);
        h.ns.reconcile_netmap(&local_netmap("100.64.0.1/32"));

        // The admission hook runs before the engine sees the handshake.
        h.stack.admit("10.0.0.5".parse().unwrap());
        assert!(h.stack.has_address("10.0.0.5/32"));

        let (req, peer, _state) = FakeTcpRequest::new(sa("100.64.0.9:4000"), sa("10.0.0.5:8080"));
        let task = tokio::spawn(Arc::clone(&h.ns).accept_tcp(Box::new(req)));

        wait_for(|| h.dialer.peer_count() == 1).await;
        assert_eq!(h.dialer.dialed(), vec![sa("10.0.0.5:8080")]);
        assert!(h.stack.has_address("10.0.0.5/32"));

        drop(peer);
        task.await.unwrap();
        assert!(!h.stack.has_address("10.0.0.5/32"));
    }

    #[tokio::test]
    async fn rst_path_still_releases_nic_address() {
        let h = Harness::started();
        h.ns.set_process_subnets(true);
        h.dialer.fail(true);

        h.stack.admit("10.0.0.6".parse().unwrap());
        assert!(h.stack.has_address("10.0.0.6/32"));

        let (req, _peer, state) = FakeTcpRequest::new(sa("100.64.0.9:4000"), sa("10.0.0.6:8080"));
        Arc::clone(&h.ns).accept_tcp(Box::new(req)).await;

        assert!(state.rejected());
        assert!(!h.stack.has_address("10.0.0.6/32"));
    }
}
