//! Out-of-process ping relay.
//!
//! In user-space mode there is no raw-socket access, so echo requests for
//! routed subnets are answered by running the host `ping` command and, on
//! success, injecting a pre-built echo reply back toward the peer. People
//! ping to check whether their network works, not for throughput, so the
//! dumbest thing that works is fine as long as the child-process count is
//! bounded.

use std::net::IpAddr;
use std::process::Stdio;
use std::time::{Duration, Instant};

use once_cell::sync::Lazy;
use tokio::process::Command;
use tokio::sync::Semaphore;

use super::{debug_enabled, Dispatcher};

/// Upper bound on concurrent child ping processes.
pub(crate) const MAX_CONCURRENT_PINGS: usize = 20;

pub(crate) static PING_SEM: Lazy<Semaphore> = Lazy::new(|| Semaphore::new(MAX_CONCURRENT_PINGS));

/// A failure faster than this means the ping binary itself misbehaved
/// (missing, unrunnable); slower failures are just unreachable hosts and
/// not worth logging.
const FAST_FAILURE: Duration = Duration::from_millis(500);

impl Dispatcher {
    /// Ping `dst` via the host `ping` command; on success, inject `pong`
    /// (the pre-built echo reply) outbound so the peer sees it come from
    /// us. Drops the request silently when all permits are taken.
    pub(crate) async fn user_ping(&self, dst: IpAddr, pong: Vec<u8>) {
        let _permit = match PING_SEM.try_acquire() {
            Ok(p) => p,
            Err(_) => return,
        };

        let started = Instant::now();
        let outcome = run_ping(dst).await;
        let elapsed = started.elapsed();

        let failed = match &outcome {
            Ok(status) => !status.success(),
            Err(_) => true,
        };
        if failed {
            if elapsed < FAST_FAILURE {
                match outcome {
                    Ok(status) => log::warn!("exec ping of {dst} failed in {elapsed:?}: {status}"),
                    Err(e) => log::warn!("exec ping of {dst} failed in {elapsed:?}: {e}"),
                }
            }
            return;
        }

        if debug_enabled() {
            log::debug!("exec pinged {dst} in {elapsed:?}");
        }
        if let Err(e) = self.tun.inject_outbound(&pong) {
            log::warn!("inject outbound ping response: {e}");
        }
    }
}

pub(crate) async fn run_ping(dst: IpAddr) -> std::io::Result<std::process::ExitStatus> {
    let mut cmd = ping_command(dst);
    cmd.stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null());
    cmd.status().await
}

#[cfg(windows)]
fn ping_command(dst: IpAddr) -> Command {
    let mut cmd = Command::new("ping");
    cmd.args(["-n", "1", "-w", "3000"]).arg(dst.to_string());
    cmd
}

#[cfg(target_os = "macos")]
fn ping_command(dst: IpAddr) -> Command {
    // -W here is milliseconds on top of the implicit one-second wait.
    let mut cmd = Command::new("ping");
    cmd.args(["-c", "1", "-W", "2000"]).arg(dst.to_string());
    cmd
}

#[cfg(target_os = "android")]
fn ping_command(dst: IpAddr) -> Command {
    let program = if dst.is_ipv6() {
        "/system/bin/ping6"
    } else {
        "/system/bin/ping"
    };
    let mut cmd = Command::new(program);
    cmd.args(["-c", "1", "-w", "3"]).arg(dst.to_string());
    cmd
}

#[cfg(not(any(windows, target_os = "macos", target_os = "android")))]
fn ping_command(dst: IpAddr) -> Command {
    // Synology keeps ping outside $PATH; on DSM7 the binary's ambient
    // capabilities stand in for root when we run unprivileged.
    let program = if is_synology() { "/bin/ping" } else { "ping" };
    let mut cmd = Command::new(program);
    cmd.args(["-c", "1", "-W", "3"]).arg(dst.to_string());
    cmd
}

#[cfg(not(any(windows, target_os = "macos", target_os = "android")))]
fn is_synology() -> bool {
    static SYNOLOGY: Lazy<bool> = Lazy::new(|| {
        cfg!(target_os = "linux") && std::path::Path::new("/etc/synoinfo.conf").exists()
    });
    *SYNOLOGY
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::Harness;

    #[test]
    fn ping_command_uses_platform_arguments() {
        let cmd = ping_command("10.0.0.1".parse().unwrap());
        let args: Vec<String> = cmd
            .as_std()
            .get_args()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();

        #[cfg(windows)]
        assert_eq!(args, ["-n", "1", "-w", "3000", "10.0.0.1"]);
        #[cfg(target_os = "macos")]
        assert_eq!(args, ["-c", "1", "-W", "2000", "10.0.0.1"]);
        #[cfg(target_os = "android")]
        assert_eq!(args, ["-c", "1", "-w", "3", "10.0.0.1"]);
        #[cfg(not(any(windows, target_os = "macos", target_os = "android")))]
        assert_eq!(args, ["-c", "1", "-W", "3", "10.0.0.1"]);
    }

    #[tokio::test]
    async fn ping_reply_injection_and_semaphore_bound() {
        let h = Harness::new();

        // Success path, only where the environment can actually ping
        // loopback (sandboxes often cannot).
        let can_ping = run_ping("127.0.0.1".parse().unwrap())
            .await
            .map(|st| st.success())
            .unwrap_or(false);
        if can_ping {
            h.ns.user_ping("127.0.0.1".parse().unwrap(), vec![1, 2, 3])
                .await;
            assert_eq!(h.tun.raw_outbound(), vec![vec![1, 2, 3]]);
        }

        // With every permit taken, the request is dropped without running
        // anything or injecting a reply.
        let _all = PING_SEM
            .try_acquire_many(MAX_CONCURRENT_PINGS as u32)
            .unwrap();
        h.tun.clear_raw_outbound();
        h.ns.user_ping("127.0.0.1".parse().unwrap(), vec![9]).await;
        assert!(h.tun.raw_outbound().is_empty());
    }
}
