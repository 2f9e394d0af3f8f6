// ===========================================
// Connection acceptor
// ===========================================
// Listens, bounds total concurrency, wraps each accepted socket with an
// identity, and hands it to the protocol handler on its own task. A
// reaper aborts sessions that outlive the idle timeout; shutdown aborts
// everything and waits briefly for the live count to drain.
use crate::config_loader::Config;
use crate::handler;
use crate::honeypot_log::HoneypotLogger;
use crate::rate_limiter::RateLimiter;
use crate::upstream::UpstreamMirror;
use dashmap::DashMap;
use log::{debug, error, info, warn};
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::AbortHandle;

const REAPER_INTERVAL: Duration = Duration::from_secs(60);
const SHUTDOWN_DRAIN: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Handshaking,
    Status,
    Login,
}

/// Per-session record, created on accept and destroyed on close. Owned
/// by the acceptor; the handler sees it by reference.
pub struct Connection {
    pub id: String,
    pub remote_ip: String,
    pub started_at: Instant,
    state: Mutex<ConnectionState>,
}

impl Connection {
    fn new(id: String, remote_ip: String) -> Self {
        Self {
            id,
            remote_ip,
            started_at: Instant::now(),
            state: Mutex::new(ConnectionState::Handshaking),
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.lock().unwrap()
    }

    pub fn set_state(&self, state: ConnectionState) {
        *self.state.lock().unwrap() = state;
    }
}

struct SessionEntry {
    connection: Arc<Connection>,
    abort: AbortHandle,
}

type SessionTable = Arc<DashMap<String, SessionEntry>>;

// Removes the session from the table on every exit path, including
// abort: dropping the handler future drops the guard.
struct SessionGuard {
    id: String,
    sessions: SessionTable,
    live_count: Arc<AtomicI64>,
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.sessions.remove(&self.id);
        self.live_count.fetch_sub(1, Ordering::Relaxed);
    }
}

pub struct Server {
    config: Arc<Config>,
    limiter: Arc<RateLimiter>,
    mirror: Arc<UpstreamMirror>,
    honeypot: Arc<HoneypotLogger>,
    listener: TcpListener,
    sessions: SessionTable,
    live_count: Arc<AtomicI64>,
    session_seq: AtomicU64,
}

impl Server {
    /// Binds the listener. Failure here is fatal for the process.
    pub async fn bind(
        config: Arc<Config>,
        limiter: Arc<RateLimiter>,
        mirror: Arc<UpstreamMirror>,
        honeypot: Arc<HoneypotLogger>,
    ) -> io::Result<Self> {
        let listener = TcpListener::bind(config.listen_addr()).await?;
        info!(
            "listening on {} (max {} connections)",
            config.listen_addr(),
            config.server.max_connections
        );
        Ok(Self {
            config,
            limiter,
            mirror,
            honeypot,
            listener,
            sessions: Arc::new(DashMap::new()),
            live_count: Arc::new(AtomicI64::new(0)),
            session_seq: AtomicU64::new(0),
        })
    }

    /// The bound address; useful when the configured port is 0.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept loop. Returns after the shutdown signal once live
    /// sessions have drained (or the drain window expires).
    pub async fn run(self, shutdown: watch::Receiver<bool>) {
        let Server {
            config,
            limiter,
            mirror,
            honeypot,
            listener,
            sessions,
            live_count,
            session_seq,
        } = self;

        let reaper = tokio::spawn(run_reaper(
            sessions.clone(),
            config.server.idle_timeout(),
            shutdown.clone(),
        ));

        let mut shutdown_rx = shutdown;
        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => spawn_session(
                            stream,
                            peer,
                            &config,
                            &limiter,
                            &mirror,
                            &honeypot,
                            &sessions,
                            &live_count,
                            &session_seq,
                        ),
                        Err(err) => error!("accept failed: {}", err),
                    }
                }
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        break;
                    }
                }
            }
        }

        info!(
            "shutting down, draining {} live sessions",
            live_count.load(Ordering::Relaxed)
        );
        drop(listener);
        for entry in sessions.iter() {
            entry.value().abort.abort();
        }
        let deadline = Instant::now() + SHUTDOWN_DRAIN;
        while live_count.load(Ordering::Relaxed) > 0 && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        let remaining = live_count.load(Ordering::Relaxed);
        if remaining > 0 {
            warn!("forced shutdown with {} sessions still live", remaining);
        } else {
            info!("all sessions drained");
        }
        reaper.abort();
    }
}

#[allow(clippy::too_many_arguments)]
fn spawn_session(
    stream: TcpStream,
    peer: SocketAddr,
    config: &Arc<Config>,
    limiter: &Arc<RateLimiter>,
    mirror: &Arc<UpstreamMirror>,
    honeypot: &Arc<HoneypotLogger>,
    sessions: &SessionTable,
    live_count: &Arc<AtomicI64>,
    session_seq: &AtomicU64,
) {
    if live_count.load(Ordering::Relaxed) >= config.server.max_connections as i64 {
        warn!(
            "connection cap {} reached, dropping {}",
            config.server.max_connections, peer
        );
        drop(stream);
        return;
    }

    let remote_ip = peer.ip().to_string();
    let id = format!("{}-{}", remote_ip, session_seq.fetch_add(1, Ordering::Relaxed));
    if let Err(err) = stream.set_nodelay(true) {
        debug!("failed to disable nagle for {}: {}", id, err);
    }

    let connection = Arc::new(Connection::new(id.clone(), remote_ip));
    live_count.fetch_add(1, Ordering::Relaxed);
    let guard = SessionGuard {
        id: id.clone(),
        sessions: sessions.clone(),
        live_count: live_count.clone(),
    };

    let config = config.clone();
    let limiter = limiter.clone();
    let mirror = mirror.clone();
    let honeypot = honeypot.clone();
    let conn = connection.clone();
    let task = tokio::spawn(async move {
        let _guard = guard;
        if let Err(err) =
            handler::handle_session(stream, &conn, &config, &limiter, &mirror, &honeypot).await
        {
            debug!("session {} ended: {}", conn.id, err);
        }
    });

    sessions.insert(
        id.clone(),
        SessionEntry {
            connection,
            abort: task.abort_handle(),
        },
    );
    // the task may already have finished; don't leave a dead entry behind
    if task.is_finished() {
        sessions.remove(&id);
    }
}

/// Belt-and-braces against stuck peers: forcibly ends sessions whose
/// start time is older than the idle timeout.
async fn run_reaper(
    sessions: SessionTable,
    idle_timeout: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(REAPER_INTERVAL);
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let stale: Vec<(String, AbortHandle)> = sessions
                    .iter()
                    .filter(|entry| entry.value().connection.started_at.elapsed() > idle_timeout)
                    .map(|entry| (entry.key().clone(), entry.value().abort.clone()))
                    .collect();
                for (id, abort) in stale {
                    debug!("reaping stale session {}", id);
                    abort.abort();
                }
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    return;
                }
            }
        }
    }
}
