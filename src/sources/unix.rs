//! Unix datagram (system log socket) listener.
//!
//! Local daemons log through a datagram socket. Compared to the network
//! listeners this one can trust the kernel for sender identity
//! (`SO_PASSCRED`), which enables the PID fix-up and the per-PID
//! severity-gated rate limiter. A rate-limited batch is announced with one
//! synthetic record when the window reopens.

use std::collections::HashMap;
use std::os::unix::io::AsRawFd;
use std::os::unix::net::UnixDatagram;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Deserialize;
use snafu::{ResultExt, Snafu};

use weir_core::message::flags;
use weir_core::Message;

use crate::internal_events::{emit_ratelimit_drop, emit_received};
use crate::ruleset::Router;

use super::SourceHandle;

const MAX_DATAGRAM: usize = 64 * 1024;

fn default_input_name() -> String {
    "unix".to_string()
}

fn default_ratelimit_interval() -> u64 {
    5
}

fn default_ratelimit_burst() -> u32 {
    200
}

fn default_ratelimit_severity() -> u8 {
    5
}

fn default_ignore_timestamp() -> bool {
    true
}

#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UnixSourceConfig {
    /// Socket path, e.g. `/run/weir/log.sock`.
    pub path: PathBuf,
    #[serde(default = "default_input_name")]
    pub input_name: String,
    #[serde(default)]
    pub ruleset: Option<String>,
    /// Try to parse a hostname out of local records. Local senders do not
    /// write one, so this defaults to off.
    #[serde(default)]
    pub parse_hostname: bool,
    /// Local records carry notoriously wrong timestamps; prefer the
    /// reception time.
    #[serde(default = "default_ignore_timestamp")]
    pub ignore_timestamp: bool,
    /// Use kernel credentials for the PID and the rate limiter key.
    #[serde(default)]
    pub use_creds: bool,
    /// Hostname stamped on local records.
    #[serde(default)]
    pub hostname: Option<String>,
    /// Rate-limit window in seconds; 0 disables limiting.
    #[serde(default = "default_ratelimit_interval")]
    pub ratelimit_interval: u64,
    /// Messages allowed per sender per window.
    #[serde(default = "default_ratelimit_burst")]
    pub ratelimit_burst: u32,
    /// Only severities numerically >= this are limited; more severe
    /// messages always pass.
    #[serde(default = "default_ratelimit_severity")]
    pub ratelimit_severity: u8,
}

#[derive(Debug, Snafu)]
pub enum UnixSourceError {
    #[snafu(display("could not bind unix socket {}: {source}", path.display()))]
    Bind {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// Token bucket per sender PID.
#[derive(Debug, Default)]
struct Bucket {
    begin: u64,
    done: u32,
    missed: u32,
}

/// Severity-gated token-bucket rate limiter keyed by PID.
pub(crate) struct RateLimiter {
    interval: u64,
    burst: u32,
    severity: u8,
    table: HashMap<u32, Bucket>,
}

/// Verdict for one message.
pub(crate) enum Limit {
    Accept,
    /// Accept, and announce that `missed` messages were lost in the
    /// previous window.
    AcceptWithLoss { missed: u32 },
    Drop,
}

impl RateLimiter {
    pub(crate) fn new(interval: u64, burst: u32, severity: u8) -> Self {
        RateLimiter {
            interval,
            burst,
            severity,
            table: HashMap::new(),
        }
    }

    pub(crate) fn check(&mut self, pid: u32, severity: u8, now: u64) -> Limit {
        if self.interval == 0 || severity < self.severity {
            return Limit::Accept;
        }
        let bucket = self.table.entry(pid).or_default();
        if now > bucket.begin + self.interval {
            let missed = bucket.missed;
            bucket.begin = now;
            bucket.done = 0;
            bucket.missed = 0;
            if missed > 0 {
                bucket.done = 1;
                return Limit::AcceptWithLoss { missed };
            }
        }
        if bucket.done < self.burst {
            bucket.done += 1;
            Limit::Accept
        } else {
            bucket.missed += 1;
            Limit::Drop
        }
    }
}

/// Receives one datagram along with the sender's kernel credentials.
fn recv_with_creds(
    socket: &UnixDatagram,
    buf: &mut [u8],
) -> std::io::Result<(usize, Option<libc::ucred>)> {
    let mut iov = libc::iovec {
        iov_base: buf.as_mut_ptr().cast(),
        iov_len: buf.len(),
    };
    let mut cmsg_space = [0u8; 64];
    let mut hdr: libc::msghdr = unsafe { std::mem::zeroed() };
    hdr.msg_iov = &mut iov;
    hdr.msg_iovlen = 1;
    hdr.msg_control = cmsg_space.as_mut_ptr().cast();
    hdr.msg_controllen = cmsg_space.len();

    let n = unsafe { libc::recvmsg(socket.as_raw_fd(), &mut hdr, 0) };
    if n < 0 {
        return Err(std::io::Error::last_os_error());
    }

    let mut creds = None;
    unsafe {
        let mut cmsg = libc::CMSG_FIRSTHDR(&hdr);
        while !cmsg.is_null() {
            if (*cmsg).cmsg_level == libc::SOL_SOCKET && (*cmsg).cmsg_type == libc::SCM_CREDENTIALS
            {
                let mut ucred: libc::ucred = std::mem::zeroed();
                std::ptr::copy_nonoverlapping(
                    libc::CMSG_DATA(cmsg),
                    (&mut ucred as *mut libc::ucred).cast(),
                    std::mem::size_of::<libc::ucred>(),
                );
                creds = Some(ucred);
            }
            cmsg = libc::CMSG_NXTHDR(&hdr, cmsg);
        }
    }
    Ok((n as usize, creds))
}

fn enable_passcred(socket: &UnixDatagram) -> std::io::Result<()> {
    let on: libc::c_int = 1;
    let rc = unsafe {
        libc::setsockopt(
            socket.as_raw_fd(),
            libc::SOL_SOCKET,
            libc::SO_PASSCRED,
            (&on as *const libc::c_int).cast(),
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if rc != 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

/// A bound, not yet running, unix-socket listener.
pub struct UnixSource {
    socket: UnixDatagram,
    config: UnixSourceConfig,
}

impl UnixSource {
    pub fn bind(config: UnixSourceConfig) -> Result<Self, UnixSourceError> {
        // A stale socket file from a previous run would fail the bind.
        let _ = std::fs::remove_file(&config.path);
        let socket = UnixDatagram::bind(&config.path).context(BindSnafu {
            path: config.path.clone(),
        })?;
        socket
            .set_read_timeout(Some(Duration::from_millis(500)))
            .context(BindSnafu {
                path: config.path.clone(),
            })?;
        if config.use_creds {
            enable_passcred(&socket).context(BindSnafu {
                path: config.path.clone(),
            })?;
        }
        Ok(UnixSource { socket, config })
    }

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

pub fn spawn(
    config: UnixSourceConfig,
    router: Arc<Router>,
) -> Result<SourceHandle, UnixSourceError> {
    Ok(UnixSource::bind(config)?.spawn(router))
}

/// Builds the synthetic record announcing rate-limiter losses.
fn loss_record(config: &UnixSourceConfig, pid: u32, missed: u32) -> Message {
    let mut msg = Message::new();
    let body = format!("<14>lost {missed} messages from pid {pid} due to rate-limiting");
    msg.set_raw(body.as_bytes());
    msg.set_input_name(config.input_name.clone());
    msg.add_flags(flags::INTERNAL);
    msg
}

fn receive_loop(
    socket: UnixDatagram,
    config: UnixSourceConfig,
    router: Arc<Router>,
    shutdown: Arc<AtomicBool>,
) {
    let mut limiter = RateLimiter::new(
        config.ratelimit_interval,
        config.ratelimit_burst,
        config.ratelimit_severity,
    );
    let started = Instant::now();
    let mut buf = vec![0u8; MAX_DATAGRAM];
    info!(input = %config.input_name, path = %config.path.display(), "unix socket listener running");

    while !shutdown.load(Ordering::SeqCst) {
        let (len, creds) = if config.use_creds {
            match recv_with_creds(&socket, &mut buf) {
                Ok(r) => r,
                Err(e)
                    if e.kind() == std::io::ErrorKind::WouldBlock
                        || e.kind() == std::io::ErrorKind::TimedOut =>
                {
                    continue;
                }
                Err(e) => {
                    error!(input = %config.input_name, error = %e, "unix socket receive error");
                    continue;
                }
            }
        } else {
            match socket.recv(&mut buf) {
                Ok(n) => (n, None),
                Err(e)
                    if e.kind() == std::io::ErrorKind::WouldBlock
                        || e.kind() == std::io::ErrorKind::TimedOut =>
                {
                    continue;
                }
                Err(e) => {
                    error!(input = %config.input_name, error = %e, "unix socket receive error");
                    continue;
                }
            }
        };
        if len == 0 {
            continue;
        }

        let severity = weir_core::pri::parse_pri(&buf[..len]).severity;
        let pid = creds.map(|c| c.pid as u32).unwrap_or(0);
        let now = started.elapsed().as_secs();
        match limiter.check(pid, severity, now) {
            Limit::Drop => {
                emit_ratelimit_drop(&config.input_name, 1);
                continue;
            }
            Limit::AcceptWithLoss { missed } => {
                warn!(input = %config.input_name, pid, missed, "messages lost due to rate-limiting");
                router.route(loss_record(&config, pid, missed), config.ruleset.as_deref());
            }
            Limit::Accept => {}
        }
        emit_received(&config.input_name);

        let mut msg = Message::new();
        msg.set_raw(&buf[..len]);
        msg.set_input_name(config.input_name.clone());
        msg.set_hostname(config.hostname.clone().unwrap_or_else(|| "localhost".to_string()));
        msg.set_rcv_from(config.hostname.clone().unwrap_or_else(|| "localhost".to_string()));
        if let Some(c) = creds {
            // The kernel knows better than whatever the sender wrote.
            msg.set_proc_id(c.pid.to_string());
        }
        if config.parse_hostname {
            msg.add_flags(flags::PARSE_HOSTNAME);
        }
        if config.ignore_timestamp {
            msg.add_flags(flags::IGNORE_DATE);
        }
        router.route(msg, config.ruleset.as_deref());
    }

    let _ = std::fs::remove_file(&config.path);
    debug!(input = %config.input_name, "unix socket listener stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::sink_router;
    use std::time::Instant;
    use tempfile::TempDir;

    #[test]
    fn local_records_flow_with_local_hostname() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("log.sock");
        let (router, seen) = sink_router();
        let source = UnixSource::bind(UnixSourceConfig {
            path: path.clone(),
            input_name: "unix-test".into(),
            ruleset: None,
            parse_hostname: false,
            ignore_timestamp: true,
            use_creds: false,
            hostname: Some("thishost".into()),
            ratelimit_interval: 0,
            ratelimit_burst: 0,
            ratelimit_severity: 5,
        })
        .unwrap();
        let mut handle = source.spawn(router);

        let sender = UnixDatagram::unbound().unwrap();
        sender
            .send_to(b"<30>Oct 11 22:14:15 sshd[42]: session opened", &path)
            .unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline && seen.lock().unwrap().is_empty() {
            std::thread::sleep(Duration::from_millis(10));
        }
        handle.stop();

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].hostname.as_deref(), Some("thishost"));
        assert_eq!(seen[0].tag.as_deref(), Some("sshd[42]:"));
    }

    #[test]
    fn rate_limiter_caps_bursts_per_pid() {
        let mut limiter = RateLimiter::new(10, 3, 5);
        // Three fit the burst, the rest are dropped.
        for _ in 0..3 {
            assert!(matches!(limiter.check(100, 6, 1), Limit::Accept));
        }
        for _ in 0..5 {
            assert!(matches!(limiter.check(100, 6, 2), Limit::Drop));
        }
        // Another pid has its own bucket.
        assert!(matches!(limiter.check(200, 6, 2), Limit::Accept));
        // The next window announces the losses.
        match limiter.check(100, 6, 20) {
            Limit::AcceptWithLoss { missed } => assert_eq!(missed, 5),
            _ => panic!("expected loss announcement"),
        }
    }

    #[test]
    fn severe_messages_bypass_the_limiter() {
        let mut limiter = RateLimiter::new(10, 1, 5);
        assert!(matches!(limiter.check(1, 6, 1), Limit::Accept));
        assert!(matches!(limiter.check(1, 6, 1), Limit::Drop));
        // Severity 2 is more severe than the threshold: never limited.
        for _ in 0..10 {
            assert!(matches!(limiter.check(1, 2, 1), Limit::Accept));
        }
    }

    #[test]
    fn disabled_limiter_accepts_everything() {
        let mut limiter = RateLimiter::new(0, 1, 5);
        for _ in 0..100 {
            assert!(matches!(limiter.check(7, 7, 1), Limit::Accept));
        }
    }
}
