//! Remote simulator backend
//!
//! Drives an external simulator process over TCP. Frames are a 4-byte
//! little-endian length prefix followed by one JSON document; every
//! reply carries the server's clock, so the cached view stays current
//! without extra round trips. A transport fault drops the session and
//! every later call reports the backend as unavailable until teardown.

use std::fs::File;
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::path::Path;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::kernel::{
    KernelPhase, SimClock, SimulationKernel, SnapshotWindow, SnapshotWindows, TrafficBackend,
    WorldFrame,
};
use crate::scenario::EdgeSpec;
use crate::sim::SimConfig;
use crate::{Error, Result};

/// Wire protocol revision, checked by the server during the handshake
pub const PROTOCOL_VERSION: u32 = 1;

/// Upper bound on a single frame body; anything larger is a corrupt stream
const MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;

const CONNECT_RETRY_PAUSE: Duration = Duration::from_millis(100);

/// Commands the driver sends
///
/// `world` replies include the edge list alongside the frame; `save`
/// replies carry the server's snapshot document, which the driver
/// stores verbatim and never interprets.
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "cmd", rename_all = "snake_case")]
enum Request {
    Hello { version: u32, tick_s: f64, seed: u64 },
    Step,
    World,
    SetSignal { id: String, phase_index: usize },
    Load { snapshot: serde_json::Value },
    Save,
    Bye,
}

#[derive(Debug, Serialize, Deserialize)]
struct Reply {
    ok: bool,
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    sim_time: Option<f64>,
    #[serde(default)]
    step_count: Option<u64>,
    #[serde(default)]
    world: Option<WorldFrame>,
    #[serde(default)]
    edges: Option<Vec<EdgeSpec>>,
    #[serde(default)]
    snapshot: Option<serde_json::Value>,
}

fn reply_into_error(reply: Reply) -> Error {
    let msg = reply
        .error
        .unwrap_or_else(|| "unspecified server error".to_string());
    match reply.code.as_deref() {
        Some("config_invalid") => Error::ConfigInvalid(msg),
        Some("invalid_state") => Error::InvalidState(msg),
        Some("snapshot_invalid") => Error::SnapshotInvalid(msg),
        Some("unsupported") => Error::Unsupported(msg),
        _ => Error::BackendUnavailable(msg),
    }
}

/// Length-prefixed JSON framing over any byte stream
struct RemoteProtocol<S: Read + Write> {
    stream: S,
}

impl<S: Read + Write> RemoteProtocol<S> {
    fn new(stream: S) -> Self {
        Self { stream }
    }

    fn send_frame(&mut self, req: &Request) -> Result<()> {
        let body = serde_json::to_vec(req)
            .map_err(|e| Error::BackendUnavailable(format!("request encode failed: {e}")))?;
        if body.len() > MAX_FRAME_BYTES {
            return Err(Error::BackendUnavailable(format!(
                "request too large: {} bytes",
                body.len()
            )));
        }
        let prefix = (body.len() as u32).to_le_bytes();
        self.stream
            .write_all(&prefix)
            .and_then(|_| self.stream.write_all(&body))
            .and_then(|_| self.stream.flush())
            .map_err(|e| Error::BackendUnavailable(format!("send failed: {e}")))
    }

    fn recv_frame(&mut self) -> Result<Reply> {
        let mut prefix = [0u8; 4];
        self.stream
            .read_exact(&mut prefix)
            .map_err(|e| Error::BackendUnavailable(format!("receive failed: {e}")))?;
        let len = u32::from_le_bytes(prefix) as usize;
        if len > MAX_FRAME_BYTES {
            return Err(Error::BackendUnavailable(format!(
                "oversized reply frame: {len} bytes"
            )));
        }
        let mut body = vec![0u8; len];
        self.stream
            .read_exact(&mut body)
            .map_err(|e| Error::BackendUnavailable(format!("receive failed: {e}")))?;
        serde_json::from_slice(&body)
            .map_err(|e| Error::BackendUnavailable(format!("malformed reply: {e}")))
    }

    fn call(&mut self, req: &Request) -> Result<Reply> {
        self.send_frame(req)?;
        self.recv_frame()
    }
}

/// Connection settings for a remote simulator
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteConfig {
    /// `host:port` of the simulator's control socket
    pub addr: String,
    /// How long to keep retrying the initial connect
    pub connect_timeout: Duration,
    /// Per-call read/write timeout once connected
    pub io_timeout: Duration,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            addr: "127.0.0.1:9555".to_string(),
            connect_timeout: Duration::from_secs(5),
            io_timeout: Duration::from_secs(10),
        }
    }
}

impl RemoteConfig {
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            ..Self::default()
        }
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_io_timeout(mut self, timeout: Duration) -> Self {
        self.io_timeout = timeout;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.addr.is_empty() {
            return Err(Error::ConfigInvalid("remote address is empty".to_string()));
        }
        if self.connect_timeout.is_zero() || self.io_timeout.is_zero() {
            return Err(Error::ConfigInvalid(
                "remote timeouts must be non-zero".to_string(),
            ));
        }
        Ok(())
    }
}

fn connect(config: &RemoteConfig) -> Result<TcpStream> {
    let addrs: Vec<SocketAddr> = config
        .addr
        .to_socket_addrs()
        .map_err(|e| Error::ConfigInvalid(format!("cannot resolve {}: {e}", config.addr)))?
        .collect();
    if addrs.is_empty() {
        return Err(Error::ConfigInvalid(format!(
            "no addresses for {}",
            config.addr
        )));
    }

    let deadline = Instant::now() + config.connect_timeout;
    let mut last_err = String::new();
    loop {
        for addr in &addrs {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(Error::BackendUnavailable(format!(
                    "connect to {} timed out after {:?}: {last_err}",
                    config.addr, config.connect_timeout
                )));
            }
            match TcpStream::connect_timeout(addr, remaining.min(Duration::from_millis(500))) {
                Ok(stream) => {
                    stream
                        .set_read_timeout(Some(config.io_timeout))
                        .and_then(|_| stream.set_write_timeout(Some(config.io_timeout)))
                        .and_then(|_| stream.set_nodelay(true))
                        .map_err(|e| {
                            Error::BackendUnavailable(format!("socket setup failed: {e}"))
                        })?;
                    return Ok(stream);
                }
                Err(e) => last_err = e.to_string(),
            }
        }
        std::thread::sleep(
            CONNECT_RETRY_PAUSE.min(deadline.saturating_duration_since(Instant::now())),
        );
    }
}

/// Session with an external simulator process
///
/// Snapshots can only be restored before the first step because the
/// server rebuilds its world from the document during the handshake
/// window; saving works at any point while running. The snapshot file
/// itself lives on the driver's filesystem.
pub struct RemoteSim {
    config: SimConfig,
    remote: RemoteConfig,
    session: Option<RemoteProtocol<TcpStream>>,
    phase: KernelPhase,
    clock: SimClock,
    world_cache: WorldFrame,
    edges_cache: Vec<EdgeSpec>,
    staged: Option<serde_json::Value>,
}

impl RemoteSim {
    pub fn new(config: SimConfig, remote: RemoteConfig) -> Self {
        Self {
            config,
            remote,
            session: None,
            phase: KernelPhase::Uninitialized,
            clock: SimClock::default(),
            world_cache: WorldFrame::default(),
            edges_cache: Vec::new(),
            staged: None,
        }
    }

    pub fn config(&self) -> &SimConfig {
        &self.config
    }

    pub fn remote_config(&self) -> &RemoteConfig {
        &self.remote
    }

    /// Fold reply bookkeeping into the cached view
    fn absorb(&mut self, reply: &Reply) {
        if let (Some(sim_time), Some(step_count)) = (reply.sim_time, reply.step_count) {
            self.clock = SimClock {
                sim_time,
                step_count,
            };
        }
        if let Some(world) = &reply.world {
            self.world_cache = world.clone();
        }
        if let Some(edges) = &reply.edges {
            self.edges_cache = edges.clone();
        }
    }

    /// One request/reply exchange
    ///
    /// A transport fault drops the session; a server-side rejection
    /// (`ok: false`) keeps it, since the stream is still framed.
    fn roundtrip(&mut self, req: &Request) -> Result<Reply> {
        let session = self
            .session
            .as_mut()
            .ok_or_else(|| Error::BackendUnavailable("no active session".to_string()))?;
        let reply = match session.call(req) {
            Ok(reply) => reply,
            Err(e) => {
                self.session = None;
                tracing::warn!(addr = self.remote.addr.as_str(), "session lost: {e}");
                return Err(e);
            }
        };
        self.absorb(&reply);
        if reply.ok {
            Ok(reply)
        } else {
            Err(reply_into_error(reply))
        }
    }

    fn start_handshake(&mut self) -> Result<()> {
        self.roundtrip(&Request::Hello {
            version: PROTOCOL_VERSION,
            tick_s: self.config.tick_s,
            seed: self.config.seed,
        })?;
        if let Some(snapshot) = self.staged.clone() {
            self.roundtrip(&Request::Load { snapshot })?;
            self.staged = None;
        }
        self.roundtrip(&Request::World)?;
        Ok(())
    }
}

impl SimulationKernel for RemoteSim {
    fn name(&self) -> &str {
        "remote"
    }

    fn phase(&self) -> KernelPhase {
        self.phase
    }

    fn clock(&self) -> SimClock {
        self.clock
    }

    fn tick(&self) -> f64 {
        self.config.tick_s
    }

    fn snapshot_windows(&self) -> SnapshotWindows {
        SnapshotWindows {
            load: SnapshotWindow::BeforeFirstStep,
            save: SnapshotWindow::WhileRunning,
        }
    }

    fn start_simulation(&mut self) -> Result<()> {
        match self.phase {
            KernelPhase::Running => return Err(Error::AlreadyStarted),
            KernelPhase::Stopped => {
                return Err(Error::InvalidState(
                    "cannot restart a torn-down kernel".to_string(),
                ))
            }
            KernelPhase::Uninitialized => {}
        }
        self.config.validate()?;
        self.remote.validate()?;

        let stream = connect(&self.remote)?;
        self.session = Some(RemoteProtocol::new(stream));
        if let Err(e) = self.start_handshake() {
            self.session = None;
            return Err(e);
        }

        self.phase = KernelPhase::Running;
        tracing::info!(
            addr = self.remote.addr.as_str(),
            tick_s = self.config.tick_s,
            "remote session established"
        );
        Ok(())
    }

    fn simulation_step(&mut self) -> Result<()> {
        if self.phase != KernelPhase::Running {
            return Err(Error::InvalidState(format!(
                "cannot step while {}",
                self.phase
            )));
        }
        self.roundtrip(&Request::Step)?;
        Ok(())
    }

    fn update(&mut self) -> Result<()> {
        if self.phase != KernelPhase::Running {
            return Err(Error::InvalidState(format!(
                "cannot update while {}",
                self.phase
            )));
        }
        // the view is folded in on every reply; update only has to
        // confirm the session is still alive
        if self.session.is_none() {
            return Err(Error::BackendUnavailable("no active session".to_string()));
        }
        Ok(())
    }

    fn load_simulation(&mut self, path: &Path) -> Result<()> {
        if self.phase == KernelPhase::Stopped {
            return Err(Error::InvalidState(
                "cannot load into a torn-down kernel".to_string(),
            ));
        }
        if !self
            .snapshot_windows()
            .load
            .allows(self.phase, self.clock.step_count)
        {
            return Err(Error::Unsupported(
                "remote backend cannot load a snapshot mid-episode".to_string(),
            ));
        }

        let raw = match std::fs::read(path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(Error::SnapshotNotFound(path.to_path_buf()))
            }
            Err(e) => {
                return Err(Error::SnapshotInvalid(format!(
                    "{}: {e}",
                    path.display()
                )))
            }
        };
        let doc: serde_json::Value = serde_json::from_slice(&raw)
            .map_err(|e| Error::SnapshotInvalid(format!("{}: {e}", path.display())))?;
        if !doc.is_object() {
            return Err(Error::SnapshotInvalid(
                "snapshot is not a JSON object".to_string(),
            ));
        }

        if self.phase == KernelPhase::Running {
            self.roundtrip(&Request::Load { snapshot: doc })?;
            self.roundtrip(&Request::World)?;
        } else {
            self.staged = Some(doc);
        }
        Ok(())
    }

    fn save_simulation(&mut self, path: &Path) -> Result<()> {
        if self.phase != KernelPhase::Running {
            return Err(Error::InvalidState(format!(
                "cannot save while {}",
                self.phase
            )));
        }
        let reply = self.roundtrip(&Request::Save)?;
        let doc = reply
            .snapshot
            .ok_or_else(|| Error::BackendUnavailable("server returned no snapshot".to_string()))?;

        let file = File::create(path)
            .map_err(|e| Error::WriteFailed(format!("{}: {e}", path.display())))?;
        let mut writer = std::io::BufWriter::new(file);
        serde_json::to_writer_pretty(&mut writer, &doc)
            .map_err(|e| Error::WriteFailed(format!("{}: {e}", path.display())))?;
        writer
            .flush()
            .map_err(|e| Error::WriteFailed(format!("{}: {e}", path.display())))
    }

    fn teardown(&mut self) {
        if let Some(mut session) = self.session.take() {
            // best effort; the server closes the connection either way
            let _ = session.call(&Request::Bye);
            tracing::info!(addr = self.remote.addr.as_str(), "remote session closed");
        }
        self.phase = KernelPhase::Stopped;
        self.staged = None;
    }
}

impl TrafficBackend for RemoteSim {
    fn world(&self) -> WorldFrame {
        self.world_cache.clone()
    }

    fn edges(&self) -> Vec<EdgeSpec> {
        self.edges_cache.clone()
    }

    fn set_signal_phase(&mut self, signal_id: &str, phase_index: usize) -> Result<()> {
        if self.phase != KernelPhase::Running {
            return Err(Error::InvalidState(format!(
                "cannot set signals while {}",
                self.phase
            )));
        }
        self.roundtrip(&Request::SetSignal {
            id: signal_id.to_string(),
            phase_index,
        })?;
        Ok(())
    }
}

impl Drop for RemoteSim {
    fn drop(&mut self) {
        self.teardown();
    }
}
