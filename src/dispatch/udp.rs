//! UDP acceptor and session proxy.
//!
//! UDP has no handshake to defer, so each offered flow gets its endpoint
//! immediately and is either short-circuited to the in-process DNS resolver
//! (service-IP port 53), dropped (anything else on a service IP), or proxied
//! to a backend socket with an idle-timer-bounded lifetime.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::net::UdpSocket;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::addrs;
use crate::stack::{UdpConn, UdpFlowRequest};
use crate::tun::DEFAULT_MTU;

use super::{debug_enabled, Dispatcher, SubnetAddrGuard};

/// Per-direction copy buffer size, one full datagram.
pub(crate) const MAX_UDP_PACKET_SIZE: usize = 1500;

/// Idle time after which a proxied UDP session is torn down.
pub(crate) const UDP_IDLE_TIMEOUT: Duration = Duration::from_secs(2 * 60);

/// DNS sessions are a request/response exchange; expire them much sooner.
pub(crate) const DNS_IDLE_TIMEOUT: Duration = Duration::from_secs(30);

/// Read deadline inside the service-IP DNS loop. The queries come from the
/// local host, so a quiet socket this long is finished, not slow.
pub(crate) const DNS_READ_DEADLINE: Duration = Duration::from_millis(150);

impl Dispatcher {
    /// Handle one flow offered by the engine's UDP forwarder.
    pub(crate) async fn accept_udp(self: Arc<Self>, req: Box<dyn UdpFlowRequest>) {
        let fa = req.addrs();
        let src = SocketAddr::new(fa.src.ip().to_canonical(), fa.src.port());
        let dst = SocketAddr::new(fa.dst.ip().to_canonical(), fa.dst.port());
        if debug_enabled() {
            log::debug!("udp forwarder request: {src} -> {dst}");
        }

        // Pairs with the admission hook's acquire; runs on every exit path.
        let _addr_guard = SubnetAddrGuard::new(&self, dst.ip());

        let conn = match req.create_endpoint() {
            Ok(c) => c,
            Err(e) => {
                log::warn!("udp endpoint for {src} -> {dst}: {e}");
                return;
            }
        };

        if addrs::is_service_ip(dst.ip()) {
            if dst.port() != 53 {
                // Only the mesh DNS runs on the service IPs.
                conn.close();
                return;
            }
            self.handle_service_dns_udp(src, conn).await;
            return;
        }

        self.forward_udp(conn, src, dst).await;
    }

    /// Serve DNS-over-UDP on the service IP.
    ///
    /// glibc's resolver sends multiple queries down one socket, so this
    /// reads in a loop under a tight deadline instead of assuming a single
    /// request; the deadline expiring is the normal way out.
    async fn handle_service_dns_udp(&self, src: SocketAddr, conn: Arc<dyn UdpConn>) {
        let mut query = vec![0u8; DEFAULT_MTU];
        loop {
            let n = match tokio::time::timeout(DNS_READ_DEADLINE, conn.recv(&mut query)).await {
                Err(_) => break,
                Ok(Err(e)) => {
                    log::warn!("dns udp read: {e}");
                    break;
                }
                Ok(Ok(n)) => n,
            };
            let resp = match self.dns.query(query[..n].to_vec(), src).await {
                Ok(r) => r,
                Err(e) => {
                    log::warn!("dns udp query: {e}");
                    break;
                }
            };
            if let Err(e) = conn.send(&resp).await {
                log::warn!("dns udp write: {e}");
                break;
            }
        }
        conn.close();
    }

    /// Proxy a UDP session between a mesh client and a backend socket on
    /// the host stack.
    ///
    /// A local destination is served from loopback; anything else (subnet
    /// routes, via destinations rewritten to their IPv4 form) is reached
    /// directly. The backend binds the client's source port so the far end
    /// sees the expected 4-tuple, falling back to an ephemeral port when
    /// that's taken. Every successful copy in either direction pushes the
    /// idle deadline out; when it passes, the session and both sockets go.
    async fn forward_udp(
        &self,
        client: Arc<dyn UdpConn>,
        client_addr: SocketAddr,
        dst_addr: SocketAddr,
    ) {
        let mut dst_addr = dst_addr;
        let port = dst_addr.port();
        let src_port = client_addr.port();
        if debug_enabled() {
            log::debug!("forwarding incoming udp session on port {port}");
        }

        let is_local = self.is_local_ip(dst_addr.ip());
        let (backend_listen, backend_remote) = if is_local {
            (
                SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), src_port),
                SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port),
            )
        } else {
            if let IpAddr::V6(v6) = dst_addr.ip() {
                if addrs::in_via_range(v6) {
                    dst_addr = SocketAddr::new(IpAddr::V4(addrs::unmap_via(v6)), port);
                }
            }
            let listen_ip = if dst_addr.is_ipv4() {
                IpAddr::V4(Ipv4Addr::UNSPECIFIED)
            } else {
                IpAddr::V6(Ipv6Addr::UNSPECIFIED)
            };
            (SocketAddr::new(listen_ip, src_port), dst_addr)
        };

        let backend = match UdpSocket::bind(backend_listen).await {
            Ok(s) => s,
            Err(e) => {
                log::warn!(
                    "could not bind local port {}: {e}, retrying with an ephemeral port",
                    backend_listen.port()
                );
                let mut fallback = backend_listen;
                fallback.set_port(0);
                match UdpSocket::bind(fallback).await {
                    Ok(s) => s,
                    Err(e) => {
                        log::warn!(
                            "could not create udp socket, preventing forwarding to {dst_addr}: {e}"
                        );
                        client.close();
                        return;
                    }
                }
            }
        };
        let backend = Arc::new(backend);
        let backend_local = backend.local_addr().unwrap_or(backend_listen);

        if is_local {
            self.engine
                .register_ip_port_identity(backend_local, dst_addr.ip());
        }

        let session = CancellationToken::new();
        let idle_timeout = if port == 53 {
            DNS_IDLE_TIMEOUT
        } else {
            UDP_IDLE_TIMEOUT
        };
        let deadline = Arc::new(Mutex::new(Instant::now() + idle_timeout));

        // Idle watchdog: fires once the deadline stops moving.
        {
            let session = session.clone();
            let deadline = Arc::clone(&deadline);
            let label = format!("{backend_local} and {backend_remote}");
            tokio::spawn(async move {
                loop {
                    let at = *deadline.lock();
                    if Instant::now() >= at {
                        log::debug!("udp session between {label} timed out");
                        session.cancel();
                        return;
                    }
                    tokio::select! {
                        _ = session.cancelled() => return,
                        _ = tokio::time::sleep_until(at) => {}
                    }
                }
            });
        }

        // client -> backend
        {
            let client = Arc::clone(&client);
            let backend = Arc::clone(&backend);
            let session = session.clone();
            let deadline = Arc::clone(&deadline);
            tokio::spawn(async move {
                let mut buf = [0u8; MAX_UDP_PACKET_SIZE];
                loop {
                    let n = tokio::select! {
                        _ = session.cancelled() => break,
                        r = client.recv(&mut buf) => match r {
                            Ok(n) => n,
                            Err(e) => {
                                if !session.is_cancelled() {
                                    log::debug!("read packet from {client_addr} failed: {e}");
                                }
                                break;
                            }
                        },
                    };
                    if let Err(e) = backend.send_to(&buf[..n], backend_remote).await {
                        if !session.is_cancelled() {
                            log::debug!("write packet to {backend_remote} failed: {e}");
                        }
                        break;
                    }
                    *deadline.lock() = Instant::now() + idle_timeout;
                }
                session.cancel();
            });
        }

        // backend -> client
        {
            let client = Arc::clone(&client);
            let backend = Arc::clone(&backend);
            let session = session.clone();
            let deadline = Arc::clone(&deadline);
            tokio::spawn(async move {
                let mut buf = [0u8; MAX_UDP_PACKET_SIZE];
                loop {
                    let n = tokio::select! {
                        _ = session.cancelled() => break,
                        r = backend.recv_from(&mut buf) => match r {
                            Ok((n, _)) => n,
                            Err(e) => {
                                if !session.is_cancelled() {
                                    log::debug!("read packet from {backend_remote} failed: {e}");
                                }
                                break;
                            }
                        },
                    };
                    if let Err(e) = client.send(&buf[..n]).await {
                        if !session.is_cancelled() {
                            log::debug!("write packet to {client_addr} failed: {e}");
                        }
                        break;
                    }
                    *deadline.lock() = Instant::now() + idle_timeout;
                }
                session.cancel();
            });
        }

        session.cancelled().await;
        client.close();
        if is_local {
            self.engine.unregister_ip_port_identity(backend_local);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::netmap::{NetworkMap, SelfNode};
    use crate::testutil::{wait_for, FakeUdpRequest, Harness};

    fn sa(s: &str) -> SocketAddr {
        s.parse().unwrap()
    }

    #[tokio::test]
    async fn service_ip_rejects_everything_but_dns() {
        let h = Harness::new();
        let (req, peer) = FakeUdpRequest::new(sa("100.64.0.2:4242"), sa("100.100.100.100:5353"));
        Arc::clone(&h.ns).accept_udp(Box::new(req)).await;

        assert!(peer.closed.is_cancelled());
        assert_eq!(h.dns.query_count(), 0);
    }

    #[tokio::test]
    async fn service_dns_answers_multiple_queries_then_times_out() {
        let h = Harness::new();
        h.dns.set_reply(b"the-answer".to_vec());

        let (req, mut peer) = FakeUdpRequest::new(sa("100.64.0.2:4242"), sa("100.100.100.100:53"));
        // Queue both queries up front; the loop must drain consecutive
        // datagrams off one socket before its read deadline ends it.
        peer.tx.send(b"query-1".to_vec()).await.unwrap();
        peer.tx.send(b"query-2".to_vec()).await.unwrap();
        let task = tokio::spawn(Arc::clone(&h.ns).accept_udp(Box::new(req)));

        assert_eq!(peer.rx.recv().await.unwrap(), b"the-answer");
        assert_eq!(peer.rx.recv().await.unwrap(), b"the-answer");

        // No more queries: the 150ms read deadline ends the loop.
        task.await.unwrap();
        assert!(peer.closed.is_cancelled());
        assert_eq!(
            h.dns.queries(),
            vec![
                (b"query-1".to_vec(), sa("100.64.0.2:4242")),
                (b"query-2".to_vec(), sa("100.64.0.2:4242")),
            ]
        );
    }

    #[tokio::test]
    async fn resolver_error_ends_the_dns_loop() {
        let h = Harness::new();
        h.dns.fail(true);

        let (req, peer) = FakeUdpRequest::new(sa("100.64.0.2:4242"), sa("100.100.100.100:53"));
        peer.tx.send(b"query".to_vec()).await.unwrap();
        Arc::clone(&h.ns).accept_udp(Box::new(req)).await;
        assert!(peer.closed.is_cancelled());
    }

    #[tokio::test]
    async fn generic_proxy_relays_both_directions() {
        let h = Harness::new();
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let server_addr = server.local_addr().unwrap();

        let (req, mut peer) = FakeUdpRequest::new(
            sa("100.64.0.9:41000"),
            SocketAddr::new(server_addr.ip(), server_addr.port()),
        );
        let task = tokio::spawn(Arc::clone(&h.ns).accept_udp(Box::new(req)));

        peer.tx.send(b"ping?".to_vec()).await.unwrap();
        let mut buf = [0u8; 64];
        let (n, from) = server.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"ping?");
        assert_eq!(from.port(), 41000); // the client's source port, preserved

        server.send_to(b"pong!", from).await.unwrap();
        assert_eq!(peer.rx.recv().await.unwrap(), b"pong!");

        peer.closed.cancel();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn busy_source_port_falls_back_to_ephemeral() {
        let h = Harness::new();
        let taken = UdpSocket::bind("0.0.0.0:41707").await.unwrap();
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let server_addr = server.local_addr().unwrap();

        let (req, mut peer) = FakeUdpRequest::new(sa("100.64.0.9:41707"), server_addr);
        let task = tokio::spawn(Arc::clone(&h.ns).accept_udp(Box::new(req)));

        peer.tx.send(b"data".to_vec()).await.unwrap();
        let mut buf = [0u8; 64];
        let (n, from) = server.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"data");
        assert_ne!(from.port(), 41707);

        drop(taken);
        peer.closed.cancel();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn via_destination_is_rewritten_before_binding() {
        let h = Harness::new();
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let server_addr = server.local_addr().unwrap();

        // A via address whose low 32 bits encode 127.0.0.1.
        let via = format!("[fd7a:115c:a1e0:b1a::7f00:1]:{}", server_addr.port());
        let (req, mut peer) = FakeUdpRequest::new(sa("[fd7a:115c:a1e0::9]:41001"), sa(&via));
        let task = tokio::spawn(Arc::clone(&h.ns).accept_udp(Box::new(req)));

        peer.tx.send(b"via-data".to_vec()).await.unwrap();
        let mut buf = [0u8; 64];
        let (n, _) = server.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"via-data");

        peer.closed.cancel();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn idle_timer_tears_down_local_sessions() {
        let h = Harness::new();
        h.ns.reconcile_netmap(&NetworkMap {
            self_node: Some(SelfNode {
                addresses: vec!["100.64.0.1/32".parse().unwrap()],
                allowed_ips: vec!["100.64.0.1/32".parse().unwrap()],
            }),
        });

        let (req, peer) = FakeUdpRequest::new(sa("100.64.0.9:41002"), sa("100.64.0.1:1234"));
        let task = tokio::spawn(Arc::clone(&h.ns).accept_udp(Box::new(req)));

        wait_for(|| h.engine.identity_count() == 1).await;

        // No traffic: the paused clock runs straight to the idle deadline.
        task.await.unwrap();
        assert!(peer.closed.is_cancelled());
        assert_eq!(h.engine.identity_count(), 0);
    }

    #[tokio::test]
    async fn endpoint_failure_is_dropped_quietly() {
        let h = Harness::new();
        let (mut req, _peer) = FakeUdpRequest::new(sa("100.64.0.9:1"), sa("192.168.1.5:9"));
        req.fail_endpoint = true;
        Arc::clone(&h.ns).accept_udp(Box::new(req)).await;
        assert_eq!(h.dns.query_count(), 0);
    }

    #[tokio::test]
    async fn magic_dns_flow_releases_admitted_service_address() {
        let h = Harness::started();
        h.dns.set_reply(b"resp".to_vec());

        h.stack.admit("100.100.100.100".parse().unwrap());
        assert!(h.stack.has_address("100.100.100.100/32"));

        let (req, mut peer) = FakeUdpRequest::new(sa("100.64.0.2:4242"), sa("100.100.100.100:53"));
        peer.tx.send(b"q".to_vec()).await.unwrap();
        let task = tokio::spawn(Arc::clone(&h.ns).accept_udp(Box::new(req)));
        assert_eq!(peer.rx.recv().await.unwrap(), b"resp");
        task.await.unwrap();

        assert!(!h.stack.has_address("100.100.100.100/32"));
    }
}
