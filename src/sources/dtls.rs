//! DTLS syslog listener.
//!
//! One UDP socket serves many peers; every peer gets its own DTLS session,
//! driven through an in-memory datagram channel so handshakes never block
//! the receive loop. Sessions are capped, swept for inactivity, and
//! authenticated per the configured mode once the handshake completes.

use std::collections::{HashMap, VecDeque};
use std::io::{Read, Write};
use std::net::{SocketAddr, UdpSocket};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use openssl::hash::MessageDigest;
use openssl::nid::Nid;
use openssl::ssl::{
    HandshakeError, MidHandshakeSslStream, Ssl, SslContext, SslContextBuilder, SslFiletype,
    SslMethod, SslStream, SslVerifyMode,
};
use openssl::x509::X509;
use serde::Deserialize;
use snafu::{ResultExt, Snafu};

use weir_core::message::flags;
use weir_core::Message;

use crate::internal_events::{emit_received, emit_session_expired};
use crate::ruleset::Router;

use super::SourceHandle;

const MAX_DATAGRAM: usize = 64 * 1024;

/// Hard cap on concurrent peers.
const MAX_SESSIONS: usize = 1024;

fn default_input_name() -> String {
    "dtls".to_string()
}

fn default_inactivity_timeout() -> u64 {
    1800
}

/// How a peer proves who it is.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AuthMode {
    /// No certificate required.
    #[default]
    Anon,
    /// Any certificate that chains to the configured CA.
    CertValid,
    /// Chain-valid certificate whose subject name is on the permitted
    /// list.
    CertName,
    /// Certificate whose SHA-1 fingerprint is on the permitted list.
    CertFingerprint,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DtlsSourceConfig {
    pub address: SocketAddr,
    #[serde(default = "default_input_name")]
    pub input_name: String,
    #[serde(default)]
    pub ruleset: Option<String>,
    pub cert_file: PathBuf,
    pub key_file: PathBuf,
    #[serde(default)]
    pub ca_file: Option<PathBuf>,
    #[serde(default)]
    pub auth_mode: AuthMode,
    /// Subject names or fingerprints, depending on the auth mode.
    #[serde(default)]
    pub permitted_peers: Vec<String>,
    /// Seconds of silence before a session is reclaimed.
    #[serde(default = "default_inactivity_timeout")]
    pub inactivity_timeout: u64,
}

#[derive(Debug, Snafu)]
pub enum DtlsSourceError {
    #[snafu(display("could not bind dtls socket {address}: {source}"))]
    Bind {
        address: SocketAddr,
        source: std::io::Error,
    },
    #[snafu(display("tls setup failed: {source}"))]
    Tls {
        source: openssl::error::ErrorStack,
    },
}

/// The transport a session's SSL engine reads from and writes to:
/// datagrams received for this peer are queued in, handshake and record
/// output goes straight back out the shared socket.
#[derive(Debug)]
struct PeerChannel {
    incoming: Arc<StdMutex<VecDeque<Vec<u8>>>>,
    socket: Arc<UdpSocket>,
    peer: SocketAddr,
}

impl Read for PeerChannel {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let Some(datagram) = self.incoming.lock().unwrap().pop_front() else {
            return Err(std::io::ErrorKind::WouldBlock.into());
        };
        let n = datagram.len().min(buf.len());
        buf[..n].copy_from_slice(&datagram[..n]);
        Ok(n)
    }
}

impl Write for PeerChannel {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.socket.send_to(buf, self.peer)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

enum SessionState {
    Handshaking(Option<MidHandshakeSslStream<PeerChannel>>),
    Established(SslStream<PeerChannel>),
    /// Fatal error or auth failure; kept only until the sweep removes it
    /// so retransmits do not recreate it instantly.
    Dead,
}

struct Session {
    state: SessionState,
    incoming: Arc<StdMutex<VecDeque<Vec<u8>>>>,
    last_activity: Instant,
}

pub struct DtlsSource {
    socket: Arc<UdpSocket>,
    ctx: SslContext,
    config: DtlsSourceConfig,
}

impl DtlsSource {
    pub fn bind(config: DtlsSourceConfig) -> Result<Self, DtlsSourceError> {
        let socket = UdpSocket::bind(config.address).context(BindSnafu {
            address: config.address,
        })?;
        socket
            .set_read_timeout(Some(Duration::from_millis(500)))
            .context(BindSnafu {
                address: config.address,
            })?;
        let ctx = build_context(&config).context(TlsSnafu)?;
        Ok(DtlsSource {
            socket: Arc::new(socket),
            ctx,
            config,
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    pub fn spawn(self, router: Arc<Router>) -> SourceHandle {
        let shutdown = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&shutdown);
        let name = self.config.input_name.clone();
        let thread = std::thread::Builder::new()
            .name(format!("src-{name}"))
            .spawn(move || receive_loop(self, router, flag))
            .expect("spawning source thread");
        SourceHandle::new(name, shutdown, thread)
    }
}

pub fn spawn(
    config: DtlsSourceConfig,
    router: Arc<Router>,
) -> Result<SourceHandle, DtlsSourceError> {
    Ok(DtlsSource::bind(config)?.spawn(router))
}

fn build_context(config: &DtlsSourceConfig) -> Result<SslContext, openssl::error::ErrorStack> {
    let mut builder = SslContextBuilder::new(SslMethod::dtls())?;
    builder.set_certificate_chain_file(&config.cert_file)?;
    builder.set_private_key_file(&config.key_file, SslFiletype::PEM)?;
    if let Some(ca) = &config.ca_file {
        builder.set_ca_file(ca)?;
    }
    match config.auth_mode {
        AuthMode::Anon => builder.set_verify(SslVerifyMode::NONE),
        AuthMode::CertValid | AuthMode::CertName => builder.set_verify(
            SslVerifyMode::PEER | SslVerifyMode::FAIL_IF_NO_PEER_CERT,
        ),
        AuthMode::CertFingerprint => {
            // The fingerprint check replaces chain validation; the peer
            // must still present a certificate.
            builder.set_verify_callback(
                SslVerifyMode::PEER | SslVerifyMode::FAIL_IF_NO_PEER_CERT,
                |_preverified, _store| true,
            );
        }
    }
    Ok(builder.build())
}

/// Colon-joined uppercase hex of the certificate's SHA-1 digest, in the
/// `SHA1:xx:yy:...` notation permitted-peer lists use.
fn sha1_fingerprint(cert: &X509) -> Option<String> {
    let digest = cert.digest(MessageDigest::sha1()).ok()?;
    let hex: Vec<String> = digest.iter().map(|b| format!("{b:02X}")).collect();
    Some(format!("SHA1:{}", hex.join(":")))
}

/// Names the certificate answers to: the subject CN plus all DNS SANs.
fn cert_names(cert: &X509) -> Vec<String> {
    let mut names = Vec::new();
    for entry in cert.subject_name().entries_by_nid(Nid::COMMONNAME) {
        if let Ok(s) = entry.data().as_utf8() {
            names.push(s.to_string());
        }
    }
    if let Some(alt_names) = cert.subject_alt_names() {
        for alt in alt_names {
            if let Some(dns) = alt.dnsname() {
                names.push(dns.to_string());
            }
        }
    }
    names
}

/// Post-handshake peer check for the modes the handshake itself cannot
/// express.
fn authenticate(config: &DtlsSourceConfig, stream: &SslStream<PeerChannel>) -> bool {
    match config.auth_mode {
        AuthMode::Anon | AuthMode::CertValid => true,
        AuthMode::CertName => {
            let Some(cert) = stream.ssl().peer_certificate() else {
                return false;
            };
            cert_names(&cert)
                .iter()
                .any(|n| config.permitted_peers.iter().any(|p| p == n))
        }
        AuthMode::CertFingerprint => {
            let Some(cert) = stream.ssl().peer_certificate() else {
                return false;
            };
            match sha1_fingerprint(&cert) {
                Some(fp) => config
                    .permitted_peers
                    .iter()
                    .any(|p| p.eq_ignore_ascii_case(&fp)),
                None => false,
            }
        }
    }
}

fn receive_loop(source: DtlsSource, router: Arc<Router>, shutdown: Arc<AtomicBool>) {
    let DtlsSource {
        socket,
        ctx,
        config,
    } = source;
    let mut sessions: HashMap<SocketAddr, Session> = HashMap::new();
    let mut buf = vec![0u8; MAX_DATAGRAM];
    let mut last_sweep = Instant::now();
    let inactivity = Duration::from_secs(config.inactivity_timeout);
    info!(input = %config.input_name, "dtls listener running");

    while !shutdown.load(Ordering::SeqCst) {
        // Reclaim idle sessions about once a second.
        if last_sweep.elapsed() >= Duration::from_secs(1) {
            let before = sessions.len();
            sessions.retain(|peer, session| {
                let keep = session.last_activity.elapsed() < inactivity
                    && !matches!(session.state, SessionState::Dead);
                if !keep {
                    trace!(input = %config.input_name, peer = %peer, "reclaiming dtls session");
                }
                keep
            });
            for _ in sessions.len()..before {
                emit_session_expired(&config.input_name);
            }
            last_sweep = Instant::now();
        }

        let (len, peer) = match socket.recv_from(&mut buf) {
            Ok(r) => r,
            Err(e)
                if e.kind() == std::io::ErrorKind::WouldBlock
                    || e.kind() == std::io::ErrorKind::TimedOut =>
            {
                continue;
            }
            Err(e) => {
                error!(input = %config.input_name, error = %e, "dtls receive error");
                continue;
            }
        };
        if len == 0 {
            continue;
        }

        if !sessions.contains_key(&peer) {
            if sessions.len() >= MAX_SESSIONS {
                warn!(input = %config.input_name, peer = %peer, "session table full, peer rejected");
                continue;
            }
            let incoming = Arc::new(StdMutex::new(VecDeque::new()));
            incoming.lock().unwrap().push_back(buf[..len].to_vec());
            let channel = PeerChannel {
                incoming: Arc::clone(&incoming),
                socket: Arc::clone(&socket),
                peer,
            };
            // First handshake attempt, fed by the datagram that opened the
            // session.
            let state = match Ssl::new(&ctx) {
                Ok(ssl) => match ssl.accept(channel) {
                    Ok(stream) => SessionState::Established(stream),
                    Err(HandshakeError::WouldBlock(mid)) => SessionState::Handshaking(Some(mid)),
                    Err(e) => {
                        debug!(input = %config.input_name, peer = %peer, error = %e, "dtls handshake failed");
                        SessionState::Dead
                    }
                },
                Err(e) => {
                    error!(input = %config.input_name, error = %e, "could not create ssl session");
                    SessionState::Dead
                }
            };
            let mut session = Session {
                state,
                incoming,
                last_activity: Instant::now(),
            };
            finish_handshake(&config, &mut session, peer);
            sessions.insert(peer, session);
            drive_session(&config, &router, &mut sessions, peer);
            continue;
        }

        let session = sessions.get_mut(&peer).expect("checked above");
        session.incoming.lock().unwrap().push_back(buf[..len].to_vec());
        session.last_activity = Instant::now();
        drive_session(&config, &router, &mut sessions, peer);
    }
    debug!(input = %config.input_name, "dtls listener stopped");
}

/// Runs the post-handshake authentication; failing peers go dead.
fn finish_handshake(config: &DtlsSourceConfig, session: &mut Session, peer: SocketAddr) {
    if let SessionState::Established(stream) = &session.state {
        if authenticate(config, stream) {
            debug!(input = %config.input_name, peer = %peer, "dtls session established");
        } else {
            warn!(input = %config.input_name, peer = %peer, "peer failed authentication, session closed");
            session.state = SessionState::Dead;
        }
    }
}

/// Pumps pending datagrams through the session: handshake progress first,
/// then application records.
fn drive_session(
    config: &DtlsSourceConfig,
    router: &Arc<Router>,
    sessions: &mut HashMap<SocketAddr, Session>,
    peer: SocketAddr,
) {
    let Some(session) = sessions.get_mut(&peer) else {
        return;
    };

    // Retry an interrupted handshake with the data that just arrived.
    if let SessionState::Handshaking(mid_slot) = &mut session.state {
        if let Some(mid) = mid_slot.take() {
            match mid.handshake() {
                Ok(stream) => {
                    session.state = SessionState::Established(stream);
                    finish_handshake(config, session, peer);
                }
                Err(HandshakeError::WouldBlock(mid)) => {
                    session.state = SessionState::Handshaking(Some(mid));
                    return;
                }
                Err(e) => {
                    debug!(input = %config.input_name, peer = %peer, error = %e, "dtls handshake failed");
                    session.state = SessionState::Dead;
                    return;
                }
            }
        } else {
            return;
        }
    }

    let SessionState::Established(stream) = &mut session.state else {
        return;
    };
    let mut record = vec![0u8; MAX_DATAGRAM];
    loop {
        match stream.ssl_read(&mut record) {
            Ok(0) => {
                session.state = SessionState::Dead;
                return;
            }
            Ok(n) => {
                emit_received(&config.input_name);
                let mut msg = Message::new();
                msg.set_raw(&record[..n]);
                msg.set_input_name(config.input_name.clone());
                msg.set_rcv_from_ip(peer.ip().to_string());
                msg.add_flags(flags::PARSE_HOSTNAME);
                router.route(msg, config.ruleset.as_deref());
            }
            Err(e) if e.code() == openssl::ssl::ErrorCode::WANT_READ => return,
            Err(e) if e.code() == openssl::ssl::ErrorCode::ZERO_RETURN => {
                session.state = SessionState::Dead;
                return;
            }
            Err(e) => {
                debug!(input = %config.input_name, peer = %peer, error = %e, "dtls read error, session closed");
                session.state = SessionState::Dead;
                return;
            }
        }
    }
}
