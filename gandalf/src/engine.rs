// Jackson Coxson
// Joins the mapping with the mux plug event stream and owns the
// per-device TCP listeners

use std::{
    collections::HashMap,
    net::SocketAddr,
    path::PathBuf,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::{Duration, Instant},
};

use futures::future::join_all;
use tokio::{
    net::{TcpListener, TcpStream},
    sync::Mutex,
    task::JoinHandle,
    time::timeout,
};
use tracing::{debug, error, info, warn};

use crate::{
    GandalfError,
    mapping::{self, Forwarding, MappingIndex, TunnelRule},
    proxy::{self, TunnelOutcome},
    usbmuxd::{DeviceEvent, UsbmuxdAddr},
};

/// How long the initial replay of `Attached` events is drained before
/// the first batch of listeners is bound.
pub const DISCOVERY_WINDOW: Duration = Duration::from_secs(1);

/// Tunnel bookkeeping, readable while the engine runs.
#[derive(Debug, Default)]
pub struct Counters {
    pub tunnels_created: AtomicU64,
    pub tunnel_timeouts: AtomicU64,
    /// Always zero; kept so the status body stays stable.
    pub lazy_exceptions: AtomicU64,
}

struct Listener {
    forwarding: Forwarding,
    task: JoinHandle<()>,
}

#[derive(Default)]
struct EngineState {
    mapping: MappingIndex,
    /// Mux-assigned device id to UDID, for every attached device.
    devices: HashMap<u32, String>,
    /// Device id to its bound listeners, for mapped devices only.
    listeners: HashMap<u32, Vec<Listener>>,
}

/// The forwarding engine. One per process; shared behind an [`Arc`] with
/// the signal handlers and the status server.
pub struct Engine {
    mux_addr: UsbmuxdAddr,
    mappings_file: PathBuf,
    tunnel_timeout: Option<Duration>,
    started_at: Instant,
    counters: Counters,
    state: Mutex<EngineState>,
}

/// One mapped, attached device as reported by the status endpoint.
#[derive(Debug, Clone)]
pub struct DeviceStatus {
    pub name: Option<String>,
    pub device_id: u32,
    pub udid: String,
    pub tunnels: Vec<Forwarding>,
}

/// Snapshot of the engine for the status endpoint.
#[derive(Debug, Clone)]
pub struct EngineStatus {
    pub uptime: f64,
    pub tunnels_created: u64,
    pub tunnel_timeouts: u64,
    pub lazy_exceptions: u64,
    pub mappings_file: String,
    pub devices: Vec<DeviceStatus>,
}

impl Engine {
    /// Loads the mapping file and prepares an engine. No socket is
    /// touched until [`Engine::run`].
    pub fn new(
        mux_addr: UsbmuxdAddr,
        mappings_file: impl Into<PathBuf>,
        tunnel_timeout: Option<Duration>,
    ) -> Result<Arc<Self>, GandalfError> {
        let mappings_file = mappings_file.into();
        let mapping = mapping::load(&mappings_file)?;
        let mappings_file = mappings_file.canonicalize().unwrap_or(mappings_file);
        Ok(Arc::new(Self {
            mux_addr,
            mappings_file,
            tunnel_timeout,
            started_at: Instant::now(),
            counters: Counters::default(),
            state: Mutex::new(EngineState {
                mapping,
                ..Default::default()
            }),
        }))
    }

    pub fn counters(&self) -> &Counters {
        &self.counters
    }

    /// Subscribes to the mux and drives the engine until the
    /// subscription drops or fails.
    ///
    /// The initial burst of `Attached` events replayed by the mux is
    /// drained for [`DISCOVERY_WINDOW`] so the first batch of listeners
    /// binds in one pass; afterwards the same subscription feeds the
    /// ongoing attach/detach handling.
    pub async fn run(self: Arc<Self>) -> Result<(), GandalfError> {
        let mut subscription = self.mux_addr.connect(1).await?;
        subscription.listen().await?;

        let deadline = tokio::time::Instant::now() + DISCOVERY_WINDOW;
        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                break;
            }
            match timeout(remaining, subscription.next_event()).await {
                Ok(Ok(event)) => self.record_event(event).await,
                Ok(Err(e)) => return Err(e),
                Err(_) => break,
            }
        }

        {
            let mut state = self.state.lock().await;
            let matched: Vec<(u32, TunnelRule)> = state
                .devices
                .iter()
                .filter_map(|(id, udid)| state.mapping.get(udid).map(|rule| (*id, rule.clone())))
                .collect();
            for (device_id, rule) in matched {
                Engine::bind_device(&self, &mut state, device_id, &rule).await;
            }
        }
        info!("forwarding engine started");

        loop {
            let event = subscription.next_event().await?;
            Engine::handle_event(&self, event).await;
        }
    }

    /// Registry-only bookkeeping used inside the discovery window; no
    /// listener is bound yet.
    async fn record_event(&self, event: DeviceEvent) {
        let mut state = self.state.lock().await;
        match event {
            DeviceEvent::Attached {
                device_id,
                properties,
            } => {
                debug!(
                    "discovered device {device_id} with serial {}",
                    properties.serial_number
                );
                state.devices.insert(device_id, properties.serial_number);
            }
            DeviceEvent::Detached { device_id } => {
                state.devices.remove(&device_id);
            }
        }
    }

    async fn handle_event(engine: &Arc<Engine>, event: DeviceEvent) {
        let mut state = engine.state.lock().await;
        match event {
            DeviceEvent::Attached {
                device_id,
                properties,
            } => {
                if state.devices.contains_key(&device_id) {
                    debug!("duplicate attach for device {device_id}, ignoring");
                    return;
                }
                let udid = properties.serial_number;
                info!("device {device_id} attached with serial {udid}");
                state.devices.insert(device_id, udid.clone());
                if let Some(rule) = state.mapping.get(&udid).cloned() {
                    Engine::bind_device(engine, &mut state, device_id, &rule).await;
                }
            }
            DeviceEvent::Detached { device_id } => {
                info!("device {device_id} detached");
                Engine::teardown_device(&mut state, device_id).await;
                state.devices.remove(&device_id);
            }
        }
    }

    /// Binds one listener per forwarding of `rule`, all in parallel, and
    /// records the handles under `device_id`. A port that can't be bound
    /// is skipped.
    async fn bind_device(
        engine: &Arc<Engine>,
        state: &mut EngineState,
        device_id: u32,
        rule: &TunnelRule,
    ) {
        let binds = rule.forwarding.iter().map(|&forwarding| async move {
            let addr = SocketAddr::from(([127, 0, 0, 1], forwarding.local_port));
            (forwarding, TcpListener::bind(addr).await)
        });

        let mut listeners = Vec::with_capacity(rule.forwarding.len());
        for (forwarding, bound) in join_all(binds).await {
            match bound {
                Ok(listener) => {
                    info!(
                        "forwarding 127.0.0.1:{} to device {device_id} port {}",
                        forwarding.local_port, forwarding.device_port
                    );
                    let task = tokio::spawn(Arc::clone(engine).accept_loop(
                        listener,
                        device_id,
                        forwarding.device_port,
                    ));
                    listeners.push(Listener { forwarding, task });
                }
                Err(e) => {
                    error!(
                        "can't bind 127.0.0.1:{} for device {device_id}: {e}",
                        forwarding.local_port
                    );
                }
            }
        }
        state.listeners.insert(device_id, listeners);
    }

    /// Aborts every listener recorded under `device_id` and waits for
    /// the accept loops to drop their sockets. Missing ids are fine.
    async fn teardown_device(state: &mut EngineState, device_id: u32) {
        if let Some(listeners) = state.listeners.remove(&device_id) {
            for listener in listeners {
                debug!(
                    "closing listener 127.0.0.1:{} of device {device_id}",
                    listener.forwarding.local_port
                );
                listener.task.abort();
                let _ = listener.task.await;
            }
        }
    }

    async fn accept_loop(self: Arc<Self>, listener: TcpListener, device_id: u32, device_port: u16) {
        loop {
            match listener.accept().await {
                Ok((client, peer)) => {
                    debug!("accepted {peer} for device {device_id} port {device_port}");
                    let engine = Arc::clone(&self);
                    tokio::spawn(async move {
                        engine.handle_client(client, device_id, device_port).await;
                    });
                }
                Err(e) => {
                    error!("accept failed for device {device_id} port {device_port}: {e}");
                }
            }
        }
    }

    /// Opens a fresh mux session for one accepted client and pumps until
    /// the tunnel ends. Connect refusals close the client and leave the
    /// listener alone.
    async fn handle_client(&self, client: TcpStream, device_id: u32, device_port: u16) {
        let device = match self.mux_addr.connect(1).await {
            Ok(conn) => conn.connect_to_device(device_id, device_port).await,
            Err(e) => Err(e),
        };
        let device = match device {
            Ok(stream) => stream,
            Err(e @ (GandalfError::DeviceNotConnected | GandalfError::PortNotAvailable)) => {
                info!("connect to device {device_id} port {device_port} refused: {e}");
                return;
            }
            Err(e) => {
                warn!("mux connect for device {device_id} port {device_port} failed: {e}");
                return;
            }
        };

        self.counters.tunnels_created.fetch_add(1, Ordering::Relaxed);
        match proxy::pump(client, device, self.tunnel_timeout).await {
            TunnelOutcome::IdleTimeout => {
                self.counters.tunnel_timeouts.fetch_add(1, Ordering::Relaxed);
                info!("tunnel to device {device_id} port {device_port} idled out");
            }
            TunnelOutcome::Reset => {
                debug!("tunnel to device {device_id} port {device_port} reset by peer");
            }
            TunnelOutcome::Error(e) => {
                error!("tunnel to device {device_id} port {device_port} failed: {e}");
            }
            TunnelOutcome::ClientClosed | TunnelOutcome::DeviceClosed => {
                debug!("tunnel to device {device_id} port {device_port} closed");
            }
        }
    }

    /// Reloads the mapping file and rebuilds the listener set from the
    /// currently attached devices. On a load failure the running set is
    /// left untouched.
    pub async fn restart(self: Arc<Self>) {
        let mapping = match mapping::load(&self.mappings_file) {
            Ok(mapping) => mapping,
            Err(e) => {
                error!("reload failed, keeping current forwardings: {e}");
                return;
            }
        };

        let mut state = self.state.lock().await;
        let ids: Vec<u32> = state.listeners.keys().copied().collect();
        for device_id in ids {
            Engine::teardown_device(&mut state, device_id).await;
        }
        state.mapping = mapping;
        info!("mapping reloaded from {}", self.mappings_file.display());

        let matched: Vec<(u32, TunnelRule)> = state
            .devices
            .iter()
            .filter_map(|(id, udid)| state.mapping.get(udid).map(|rule| (*id, rule.clone())))
            .collect();
        for (device_id, rule) in matched {
            Engine::bind_device(&self, &mut state, device_id, &rule).await;
        }
    }

    /// Closes every listener. Tunnels that are mid-pump are not touched;
    /// they end when a peer closes.
    pub async fn complete_shutdown(&self) {
        let mut state = self.state.lock().await;
        let ids: Vec<u32> = state.listeners.keys().copied().collect();
        for device_id in ids {
            Engine::teardown_device(&mut state, device_id).await;
        }
        info!("all forwardings shut down");
    }

    pub async fn status(&self) -> EngineStatus {
        let state = self.state.lock().await;
        let mut devices: Vec<DeviceStatus> = state
            .listeners
            .iter()
            .map(|(device_id, listeners)| {
                let udid = state.devices.get(device_id).cloned().unwrap_or_default();
                let name = state.mapping.get(&udid).and_then(|rule| rule.name.clone());
                DeviceStatus {
                    name,
                    device_id: *device_id,
                    udid,
                    tunnels: listeners.iter().map(|l| l.forwarding).collect(),
                }
            })
            .collect();
        devices.sort_by_key(|device| device.device_id);

        EngineStatus {
            uptime: self.started_at.elapsed().as_secs_f64(),
            tunnels_created: self.counters.tunnels_created.load(Ordering::Relaxed),
            tunnel_timeouts: self.counters.tunnel_timeouts.load(Ordering::Relaxed),
            lazy_exceptions: self.counters.lazy_exceptions.load(Ordering::Relaxed),
            mappings_file: self.mappings_file.display().to_string(),
            devices,
        }
    }
}
