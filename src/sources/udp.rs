//! UDP syslog listener.

use std::net::{IpAddr, SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Deserialize;
use snafu::{ResultExt, Snafu};

use weir_core::message::flags;
use weir_core::Message;

use crate::internal_events::{emit_acl_denied, emit_received};
use crate::ruleset::Router;

use super::SourceHandle;

/// Maximum datagram we accept; larger ones are truncated by the OS.
const MAX_DATAGRAM: usize = 64 * 1024;

fn default_input_name() -> String {
    "udp".to_string()
}

#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UdpSourceConfig {
    /// Bind address, e.g. `0.0.0.0:514`.
    pub address: SocketAddr,
    #[serde(default = "default_input_name")]
    pub input_name: String,
    /// Rule set messages from this listener are bound to.
    #[serde(default)]
    pub ruleset: Option<String>,
    /// Senders allowed to talk to us; empty permits everyone.
    #[serde(default)]
    pub allowed_senders: Vec<IpAddr>,
    /// Kernel receive buffer size; bursts drop datagrams when this is too
    /// small for the traffic.
    #[serde(default)]
    pub receive_buffer_size: Option<usize>,
}

#[derive(Debug, Snafu)]
pub enum UdpSourceError {
    #[snafu(display("could not bind udp socket {address}: {source}"))]
    Bind {
        address: SocketAddr,
        source: std::io::Error,
    },
}

/// Source-address check with a one-deep cache: syslog traffic is bursty
/// per sender, so the previous verdict almost always applies.
struct SenderAcl {
    allowed: Vec<IpAddr>,
    last: Mutex<Option<(IpAddr, bool)>>,
}

impl SenderAcl {
    fn new(allowed: Vec<IpAddr>) -> Self {
        SenderAcl {
            allowed,
            last: Mutex::new(None),
        }
    }

    fn permits(&self, ip: IpAddr) -> bool {
        if self.allowed.is_empty() {
            return true;
        }
        let mut last = self.last.lock();
        if let Some((cached_ip, verdict)) = *last {
            if cached_ip == ip {
                return verdict;
            }
        }
        let verdict = self.allowed.contains(&ip);
        *last = Some((ip, verdict));
        verdict
    }
}

/// A bound, not yet running, UDP listener.
pub struct UdpSource {
    socket: UdpSocket,
    config: UdpSourceConfig,
}

impl UdpSource {
    pub fn bind(config: UdpSourceConfig) -> Result<Self, UdpSourceError> {
        let socket = UdpSocket::bind(config.address).context(BindSnafu {
            address: config.address,
        })?;
        // A short receive timeout lets the loop notice shutdown requests.
        socket
            .set_read_timeout(Some(Duration::from_millis(500)))
            .context(BindSnafu {
                address: config.address,
            })?;
        if let Some(size) = config.receive_buffer_size {
            socket2::SockRef::from(&socket)
                .set_recv_buffer_size(size)
                .context(BindSnafu {
                    address: config.address,
                })?;
        }
        Ok(UdpSource { socket, config })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Starts the receive loop on its own thread.
    pub fn spawn(self, router: Arc<Router>) -> SourceHandle {
        let shutdown = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&shutdown);
        let name = self.config.input_name.clone();
        let thread = std::thread::Builder::new()
            .name(format!("src-{name}"))
            .spawn(move || receive_loop(self.socket, self.config, router, flag))
            .expect("spawning source thread");
        SourceHandle::new(name, shutdown, thread)
    }
}

/// Binds the socket and spawns the receive loop in one step.
pub fn spawn(config: UdpSourceConfig, router: Arc<Router>) -> Result<SourceHandle, UdpSourceError> {
    Ok(UdpSource::bind(config)?.spawn(router))
}

fn receive_loop(
    socket: UdpSocket,
    config: UdpSourceConfig,
    router: Arc<Router>,
    shutdown: Arc<AtomicBool>,
) {
    let acl = SenderAcl::new(config.allowed_senders.clone());
    let mut buf = vec![0u8; MAX_DATAGRAM];
    info!(input = %config.input_name, "udp listener running");

    while !shutdown.load(Ordering::SeqCst) {
        let (len, peer) = match socket.recv_from(&mut buf) {
            Ok(r) => r,
            Err(e)
                if e.kind() == std::io::ErrorKind::WouldBlock
                    || e.kind() == std::io::ErrorKind::TimedOut =>
            {
                continue;
            }
            Err(e) => {
                error!(input = %config.input_name, error = %e, "udp receive error");
                continue;
            }
        };
        if len == 0 {
            continue;
        }
        if !acl.permits(peer.ip()) {
            emit_acl_denied(&config.input_name);
            trace!(input = %config.input_name, peer = %peer, "sender not permitted, datagram dropped");
            continue;
        }
        emit_received(&config.input_name);

        let mut msg = Message::new();
        msg.set_raw(&buf[..len]);
        msg.set_input_name(config.input_name.clone());
        msg.set_rcv_from_ip(peer.ip().to_string());
        // Reverse resolution is deferred; downstream decides whether the
        // name is ever needed.
        msg.add_flags(flags::PARSE_HOSTNAME | flags::NEEDS_DNS_RESOLUTION);
        router.route(msg, config.ruleset.as_deref());
    }
    debug!(input = %config.input_name, "udp listener stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::sink_router;
    use std::time::Instant;

    #[test]
    fn datagrams_flow_to_actions() {
        let (router, seen) = sink_router();
        let source = UdpSource::bind(UdpSourceConfig {
            address: "127.0.0.1:0".parse().unwrap(),
            input_name: "udp-test".into(),
            ruleset: None,
            allowed_senders: Vec::new(),
            receive_buffer_size: None,
        })
        .unwrap();
        let target = source.local_addr().unwrap();
        let mut handle = source.spawn(router);

        let sender = UdpSocket::bind("127.0.0.1:0").unwrap();
        sender
            .send_to(b"<34>Oct 11 22:14:15 mymachine su: 'su root' failed", target)
            .unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline && seen.lock().unwrap().is_empty() {
            std::thread::sleep(Duration::from_millis(10));
        }
        handle.stop();

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].hostname.as_deref(), Some("mymachine"));
        assert!(seen[0].body.contains("'su root' failed"));
        assert_eq!(seen[0].input_name.as_deref(), Some("udp-test"));
    }

    #[test]
    fn acl_blocks_unlisted_senders() {
        let (router, seen) = sink_router();
        let source = UdpSource::bind(UdpSourceConfig {
            address: "127.0.0.1:0".parse().unwrap(),
            input_name: "udp-acl".into(),
            ruleset: None,
            // Only a sender we will never be.
            allowed_senders: vec!["192.0.2.1".parse().unwrap()],
            receive_buffer_size: None,
        })
        .unwrap();
        let target = source.local_addr().unwrap();
        let mut handle = source.spawn(router);

        let sender = UdpSocket::bind("127.0.0.1:0").unwrap();
        sender.send_to(b"<13>blocked", target).unwrap();
        std::thread::sleep(Duration::from_millis(200));
        handle.stop();
        assert!(seen.lock().unwrap().is_empty());
    }

    #[test]
    fn acl_cache_tracks_last_sender() {
        let acl = SenderAcl::new(vec!["10.0.0.1".parse().unwrap()]);
        let good: IpAddr = "10.0.0.1".parse().unwrap();
        let bad: IpAddr = "10.0.0.2".parse().unwrap();
        assert!(acl.permits(good));
        assert!(acl.permits(good)); // cached verdict
        assert!(!acl.permits(bad));
        assert!(!acl.permits(bad));
        assert!(acl.permits(good));
    }
}
