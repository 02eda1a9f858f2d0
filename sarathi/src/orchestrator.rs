//! Connection orchestrator: pairing-link credential handoff, network
//! registration, then the steady-state flight session.
//!
//! ```text
//! Idle -> AwaitingPairingLink -> CredentialHandoff -> AwaitingNetworkJoin
//!      -> Registering -> AwaitingRegistrationAck -> Ready
//! ```
//!
//! Every step runs inside a [`PollingTask`]; the caller's thread never blocks
//! on I/O. A failed step is logged, shown in the status text and retried by
//! its task. Only [`ConnectionOrchestrator::stop`] ends the flow.
//!
//! | Task | Runs in | Ends when |
//! |------|---------|-----------|
//! | `pairing-watch` | AwaitingPairingLink | pairing link opened |
//! | `handoff` | CredentialHandoff, AwaitingNetworkJoin | `WS1` received |
//! | `registration` | Registering | `CMD\|register_ip` sent |
//! | `registration-ack` | AwaitingRegistrationAck | `REGISTER` reply |
//! | `wait-animation` | whole handshake | Ready |
//! | `offline` | offline mode only | Ready |

use crate::config::{PairingTransport, SarathiConfig, secs};
use crate::error::{Result, SarathiError};
use crate::pairing::{PairedDevice, PairingAdapter};
use crate::polling::{PollingTask, TickFlow, WeakPollingTask};
use crate::session::FlightSession;
use crate::settings::SettingsStore;
use crate::shared::ControlInput;
use crate::transport::{
    ChannelId, Connector, SerialConnector, SessionMode, TcpConnector, TransportClient,
    local_address_towards,
};
use crate::translate::Translator;
use parking_lot::{Condvar, Mutex, MutexGuard};
use setu_proto::vocabulary::{CMD, REGISTER, STAINFO, WC, WLAN, WLANDATA, WS};
use setu_proto::{CommandName, Frame, status_bit};
use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

/// Registration retry interval grows up to this multiple of the base
const MAX_BACKOFF_FACTOR: u32 = 8;

/// Poll interval of the offline-mode delay
const OFFLINE_POLL: Duration = Duration::from_millis(20);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Idle,
    AwaitingPairingLink,
    CredentialHandoff,
    AwaitingNetworkJoin,
    Registering,
    AwaitingRegistrationAck,
    Ready,
}

impl ConnectionState {
    /// Transition table; `offline` admits the shortcut to `Ready`
    pub fn can_transition_to(self, next: ConnectionState, offline: bool) -> bool {
        use ConnectionState::*;
        match (self, next) {
            (_, Idle) => true,
            (Idle, AwaitingPairingLink)
            | (AwaitingPairingLink, CredentialHandoff)
            | (CredentialHandoff, AwaitingNetworkJoin)
            | (AwaitingNetworkJoin, Registering)
            | (Registering, AwaitingRegistrationAck)
            | (AwaitingRegistrationAck, Ready) => true,
            (AwaitingRegistrationAck, Registering) => true,
            (CredentialHandoff | AwaitingNetworkJoin, AwaitingPairingLink) => true,
            (Idle | AwaitingPairingLink, Ready) => offline,
            _ => false,
        }
    }

    /// Handshake in progress (the wait animation runs)
    pub fn is_connecting(self) -> bool {
        !matches!(self, ConnectionState::Idle | ConnectionState::Ready)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Device address announced in `STAINFO`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceInfo {
    pub address: IpAddr,
    pub port: u16,
}

/// External collaborators of the orchestrator
#[derive(Clone)]
pub struct Collaborators {
    pub pairing: Arc<dyn PairingAdapter>,
    pub settings: Arc<dyn SettingsStore>,
    pub translator: Arc<dyn Translator>,
}

/// Link factories for the two clients
#[derive(Clone)]
pub struct Connectors {
    pub pairing: Arc<dyn Connector>,
    pub network: Arc<dyn Connector>,
}

impl Connectors {
    /// Serial or TCP pairing link per config; TCP network link
    pub fn from_config(config: &SarathiConfig) -> Self {
        let pairing: Arc<dyn Connector> = match config.pairing.transport {
            PairingTransport::Serial => Arc::new(SerialConnector::new(config.pairing.baud_rate)),
            PairingTransport::Tcp => Arc::new(TcpConnector::new()),
        };
        Self {
            pairing,
            network: Arc::new(TcpConnector::new()),
        }
    }
}

#[derive(Debug, Clone)]
struct Credentials {
    ssid: String,
    password: String,
}

/// Position inside the credential handoff
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HandoffStep {
    SendCredentials,
    AwaitJoin,
    AwaitDeviceInfo,
    AwaitServer,
}

#[derive(Debug, Default)]
struct StatusLine {
    text: String,
    /// Overwritten by the wait animation
    waiting: bool,
}

/// Weak handles so task bodies can start and stop each other
struct TaskLinks {
    pairing_watch: WeakPollingTask,
    handoff: WeakPollingTask,
    registration: WeakPollingTask,
    ack: WeakPollingTask,
    animation: WeakPollingTask,
}

struct Tasks {
    pairing_watch: PollingTask,
    handoff: PollingTask,
    registration: PollingTask,
    ack: PollingTask,
    animation: PollingTask,
    offline: PollingTask,
}

impl Tasks {
    fn new(config: &SarathiConfig) -> Self {
        let polling = &config.polling;
        Self {
            pairing_watch: PollingTask::new("pairing-watch", secs(polling.pairing_check_secs)),
            handoff: PollingTask::new("handoff", secs(polling.ack_secs)),
            registration: PollingTask::new("registration", secs(polling.registration_secs)),
            ack: PollingTask::new("registration-ack", secs(polling.ack_secs)),
            animation: PollingTask::new("wait-animation", secs(polling.animation_secs)),
            offline: PollingTask::new(
                "offline",
                OFFLINE_POLL.min(Duration::from_millis(config.app.offline_delay_ms.max(1))),
            ),
        }
    }

    fn links(&self) -> TaskLinks {
        TaskLinks {
            pairing_watch: self.pairing_watch.downgrade(),
            handoff: self.handoff.downgrade(),
            registration: self.registration.downgrade(),
            ack: self.ack.downgrade(),
            animation: self.animation.downgrade(),
        }
    }

    fn all(&self) -> [&PollingTask; 6] {
        [
            &self.pairing_watch,
            &self.handoff,
            &self.registration,
            &self.ack,
            &self.animation,
            &self.offline,
        ]
    }
}

/// Connection state together with the run it belongs to. `stop` ends the
/// current run; tasks still executing for an older run change nothing.
#[derive(Debug, Clone, Copy)]
struct Phase {
    state: ConnectionState,
    epoch: u64,
}

struct Shared {
    config: SarathiConfig,
    collaborators: Collaborators,
    pairing_client: Arc<TransportClient>,
    network_client: Arc<TransportClient>,
    input: Arc<ControlInput>,
    links: TaskLinks,

    phase: Mutex<Phase>,
    state_changed: Condvar,
    /// Epoch allowed to touch the clients. Held for the whole side effect of
    /// a tick, so `stop` waits for it instead of racing it.
    run: Mutex<u64>,
    status: Mutex<StatusLine>,
    credentials: Mutex<Option<Credentials>>,
    handoff_step: Mutex<HandoffStep>,
    paired: Mutex<Option<PairedDevice>>,
    device: Mutex<Option<DeviceInfo>>,
    session: Mutex<Option<Arc<FlightSession>>>,
    offline_deadline: Mutex<Option<Instant>>,
    registration_attempts: AtomicU32,
    registration_failures: AtomicU32,
    animation_step: AtomicUsize,
}

/// Drives the pairing and network clients through the handshake
pub struct ConnectionOrchestrator {
    shared: Arc<Shared>,
    tasks: Tasks,
}

impl ConnectionOrchestrator {
    pub fn new(config: SarathiConfig, collaborators: Collaborators) -> Self {
        let connectors = Connectors::from_config(&config);
        Self::with_connectors(config, collaborators, connectors)
    }

    pub fn with_connectors(
        config: SarathiConfig,
        collaborators: Collaborators,
        connectors: Connectors,
    ) -> Self {
        let pairing_client = Arc::new(TransportClient::new(
            "pairing",
            connectors.pairing,
            SessionMode::Persistent,
            config.wire.framing,
            config.connect_timeout(),
        ));
        let network_client = Arc::new(TransportClient::new(
            "network",
            connectors.network,
            SessionMode::OneShot,
            config.wire.framing,
            config.connect_timeout(),
        ));

        let tasks = Tasks::new(&config);
        let shared = Arc::new(Shared {
            config,
            collaborators,
            pairing_client,
            network_client,
            input: Arc::new(ControlInput::new()),
            links: tasks.links(),
            phase: Mutex::new(Phase {
                state: ConnectionState::Idle,
                epoch: 0,
            }),
            state_changed: Condvar::new(),
            run: Mutex::new(0),
            status: Mutex::new(StatusLine::default()),
            credentials: Mutex::new(None),
            handoff_step: Mutex::new(HandoffStep::SendCredentials),
            paired: Mutex::new(None),
            device: Mutex::new(None),
            session: Mutex::new(None),
            offline_deadline: Mutex::new(None),
            registration_attempts: AtomicU32::new(0),
            registration_failures: AtomicU32::new(0),
            animation_step: AtomicUsize::new(0),
        });

        let s = Arc::clone(&shared);
        tasks.pairing_watch.add_callable(move || s.watch_pairing());
        let s = Arc::clone(&shared);
        tasks.handoff.add_callable(move || s.handoff());
        let s = Arc::clone(&shared);
        tasks.registration.add_callable(move || s.register());
        let s = Arc::clone(&shared);
        tasks.ack.add_callable(move || s.await_ack());
        let s = Arc::clone(&shared);
        tasks.animation.add_callable(move || s.animate());
        let s = Arc::clone(&shared);
        tasks.offline.add_callable(move || s.offline_tick());

        Self { shared, tasks }
    }

    /// Begin the handshake from `Idle` (stopping any previous one)
    pub fn start(&self) -> Result<()> {
        self.stop();
        let shared = &self.shared;
        let offline = shared.offline();
        {
            let run = shared.run.lock();
            let epoch = *run;
            shared.registration_attempts.store(0, Ordering::Relaxed);
            shared.registration_failures.store(0, Ordering::Relaxed);
            shared.animation_step.store(0, Ordering::Relaxed);

            if offline {
                let delay = Duration::from_millis(shared.config.app.offline_delay_ms);
                *shared.offline_deadline.lock() = Some(Instant::now() + delay);
            }
            shared.advance(
                epoch,
                ConnectionState::Idle,
                ConnectionState::AwaitingPairingLink,
            );
            if offline {
                shared.set_status("Offline mode");
            } else {
                shared.set_waiting();
            }
        }

        if offline {
            self.tasks.offline.save_start()?;
        } else {
            self.tasks.animation.save_start()?;
            self.tasks.pairing_watch.save_start()?;
        }
        Ok(())
    }

    /// Hand network credentials to the device once the pairing link is up.
    /// May be called before that; the credentials are kept until used.
    pub fn submit_credentials(&self, ssid: &str, password: &str) -> Result<()> {
        // reject anything that cannot travel in a WLAN frame
        Frame::new(WLAN, [ssid, password])?;
        if ssid.is_empty() {
            return Err(SarathiError::Config("network name is empty".into()));
        }

        *self.shared.credentials.lock() = Some(Credentials {
            ssid: ssid.to_string(),
            password: password.to_string(),
        });
        if self.state() == ConnectionState::CredentialHandoff {
            self.tasks.handoff.save_start()?;
        }
        Ok(())
    }

    pub fn has_credentials(&self) -> bool {
        self.shared.credentials.lock().is_some()
    }

    /// Back to `Idle`: best-effort `CMD|reset`, both clients reset, all
    /// tasks stopped. Safe to call in any state.
    ///
    /// Waits for a task in the middle of I/O (bounded by the connect and
    /// receive timeouts); anything it tries afterwards is discarded.
    pub fn stop(&self) {
        for task in self.tasks.all() {
            task.stop();
        }

        let shared = &self.shared;
        let mut run = shared.run.lock();
        let previous = {
            let mut phase = shared.phase.lock();
            let previous = phase.state;
            phase.epoch += 1;
            phase.state = ConnectionState::Idle;
            *run = phase.epoch;
            shared.state_changed.notify_all();
            previous
        };
        if previous != ConnectionState::Idle {
            tracing::info!("Connection state: {} -> {}", previous, ConnectionState::Idle);
        }

        let session = shared.session.lock().take();
        if let Some(session) = session {
            session.stop();
        }

        if !shared.offline() && shared.network_client.target().is_some() {
            let sent = Frame::new(CMD, [CommandName::Reset.as_str()])
                .map_err(SarathiError::from)
                .and_then(|frame| shared.network_client.send(ChannelId::CONTROL, &frame));
            match sent {
                Ok(()) => tracing::info!("Sent reset to device"),
                Err(e) => tracing::debug!("Reset not delivered: {}", e),
            }
        }

        shared.pairing_client.reset();
        shared.network_client.reset();
        *shared.paired.lock() = None;
        *shared.device.lock() = None;
        *shared.handoff_step.lock() = HandoffStep::SendCredentials;
        *shared.offline_deadline.lock() = None;

        if previous != ConnectionState::Idle {
            shared.set_status("Disconnected");
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.state()
    }

    /// Translated status text
    pub fn status(&self) -> String {
        self.shared.status.lock().text.clone()
    }

    pub fn device(&self) -> Option<DeviceInfo> {
        *self.shared.device.lock()
    }

    pub fn paired_device(&self) -> Option<PairedDevice> {
        self.shared.paired.lock().clone()
    }

    /// Steady-state session, present whenever the state is `Ready`
    pub fn session(&self) -> Option<Arc<FlightSession>> {
        self.shared.session.lock().clone()
    }

    /// Joystick positions sent by the session
    pub fn input(&self) -> Arc<ControlInput> {
        Arc::clone(&self.shared.input)
    }

    /// Failed registration sends since the last `start`
    pub fn registration_failures(&self) -> u32 {
        self.shared.registration_failures.load(Ordering::Relaxed)
    }

    /// Block until `state` is reached or `timeout` elapses
    pub fn wait_for_state(&self, state: ConnectionState, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut phase = self.shared.phase.lock();
        while phase.state != state {
            if self
                .shared
                .state_changed
                .wait_until(&mut phase, deadline)
                .timed_out()
            {
                return phase.state == state;
            }
        }
        true
    }
}

impl Drop for ConnectionOrchestrator {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Registration interval multiple after `failures` consecutive failures
fn backoff_factor(failures: u32) -> u32 {
    (1u32 << failures.min(3)).min(MAX_BACKOFF_FACTOR)
}

impl Shared {
    fn offline(&self) -> bool {
        self.config.app.offline_mode
    }

    fn phase(&self) -> Phase {
        *self.phase.lock()
    }

    fn state(&self) -> ConnectionState {
        self.phase.lock().state
    }

    /// Exclusive right to act for `epoch`; `None` once `stop` ended that run
    fn run_guard(&self, epoch: u64) -> Option<MutexGuard<'_, u64>> {
        let run = self.run.lock();
        (*run == epoch).then_some(run)
    }

    /// Move `from` -> `next` in one step; no-op if another task moved the
    /// state first or the run is over
    fn advance(&self, epoch: u64, from: ConnectionState, next: ConnectionState) -> bool {
        let mut phase = self.phase.lock();
        if phase.epoch != epoch || phase.state != from {
            tracing::debug!("Skipping {} -> {}: state is {}", from, next, phase.state);
            return false;
        }
        if !from.can_transition_to(next, self.offline()) {
            tracing::warn!("Rejected transition {} -> {}", from, next);
            return false;
        }
        phase.state = next;
        self.state_changed.notify_all();
        drop(phase);
        tracing::info!("Connection state: {} -> {}", from, next);
        true
    }

    fn translate(&self, text: &str) -> String {
        self.collaborators.translator.translate(text)
    }

    fn set_status(&self, text: &str) {
        let text = self.translate(text);
        tracing::info!("Status: {}", text);
        *self.status.lock() = StatusLine {
            text,
            waiting: false,
        };
    }

    fn set_status_detail(&self, text: &str, detail: &str) {
        let text = format!("{}: {}", self.translate(text), detail);
        tracing::info!("Status: {}", text);
        *self.status.lock() = StatusLine {
            text,
            waiting: false,
        };
    }

    fn set_waiting(&self) {
        *self.status.lock() = StatusLine {
            text: self.translate("Waiting"),
            waiting: true,
        };
    }

    fn start_task(&self, task: &WeakPollingTask) {
        if let Some(task) = task.upgrade()
            && let Err(e) = task.save_start()
        {
            tracing::error!("Failed to start task '{}': {}", task.name(), e);
        }
    }

    fn stop_task(&self, task: &WeakPollingTask) {
        if let Some(task) = task.upgrade() {
            task.stop();
        }
    }

    /// Return to `AwaitingPairingLink` after a failed or lost handoff
    fn back_to_pairing(&self, epoch: u64, from: ConnectionState) -> TickFlow {
        *self.handoff_step.lock() = HandoffStep::SendCredentials;
        if self.advance(epoch, from, ConnectionState::AwaitingPairingLink) {
            self.start_task(&self.links.pairing_watch);
        }
        TickFlow::Stop
    }

    // ---- pairing-watch ----

    fn watch_pairing(&self) -> Result<TickFlow> {
        let Phase { state, epoch } = self.phase();
        if state != ConnectionState::AwaitingPairingLink {
            return Ok(TickFlow::Stop);
        }

        // adapter queries may block; they run before taking the run guard
        let adapter = &self.collaborators.pairing;
        let name = &self.config.pairing.device_name;
        let enabled = adapter.is_enabled();
        let device = if enabled {
            adapter
                .paired_devices()
                .into_iter()
                .find(|d| &d.name == name)
        } else {
            None
        };

        let Some(_run) = self.run_guard(epoch) else {
            return Ok(TickFlow::Stop);
        };
        if !enabled {
            self.set_status("Turn on your pairing link");
            return Ok(TickFlow::Continue);
        }
        let Some(device) = device else {
            self.set_status_detail("Device not paired", name);
            return Ok(TickFlow::Continue);
        };

        if !self.pairing_client.is_connected(ChannelId::CONTROL) {
            let endpoint = &device.endpoint;
            if let Err(e) = self.pairing_client.connect(&endpoint.address, endpoint.port) {
                tracing::warn!("Pairing link to {} failed: {}", endpoint, e);
                self.set_status("Could not open the pairing link");
                return Ok(TickFlow::Continue);
            }
        }
        tracing::info!("Pairing link open to '{}' at {}", device.name, device.endpoint);
        *self.paired.lock() = Some(device);
        *self.handoff_step.lock() = HandoffStep::SendCredentials;

        if self.advance(
            epoch,
            ConnectionState::AwaitingPairingLink,
            ConnectionState::CredentialHandoff,
        ) {
            self.set_status("Enter network credentials");
            if self.credentials.lock().is_some() {
                self.start_task(&self.links.handoff);
            }
        }
        Ok(TickFlow::Stop)
    }

    // ---- handoff ----

    fn handoff(&self) -> Result<TickFlow> {
        let Phase { state, epoch } = self.phase();
        if !matches!(
            state,
            ConnectionState::CredentialHandoff | ConnectionState::AwaitingNetworkJoin
        ) {
            return Ok(TickFlow::Stop);
        }
        let Some(_run) = self.run_guard(epoch) else {
            return Ok(TickFlow::Stop);
        };

        let step = *self.handoff_step.lock();
        let outcome = match step {
            HandoffStep::SendCredentials => self.send_credentials(epoch, state),
            HandoffStep::AwaitJoin => self.await_join(epoch, state),
            HandoffStep::AwaitDeviceInfo => self.await_device_info(epoch, state),
            HandoffStep::AwaitServer => self.await_server(epoch, state),
        };

        match outcome {
            Ok(flow) => Ok(flow),
            Err(e) => {
                tracing::warn!("Handoff {:?} failed: {}", step, e);
                self.pairing_client.reset();
                self.set_status("Pairing link lost");
                Ok(self.back_to_pairing(epoch, state))
            }
        }
    }

    fn send_credentials(&self, epoch: u64, state: ConnectionState) -> Result<TickFlow> {
        if state != ConnectionState::CredentialHandoff {
            return Ok(TickFlow::Stop);
        }
        let Some(credentials) = self.credentials.lock().clone() else {
            return Ok(TickFlow::Stop);
        };

        let frame = Frame::new(WLAN, [credentials.ssid.as_str(), credentials.password.as_str()])?;
        self.pairing_client.send(ChannelId::CONTROL, &frame)?;
        tracing::info!("Sent credentials for network '{}'", credentials.ssid);

        *self.handoff_step.lock() = HandoffStep::AwaitJoin;
        self.advance(
            epoch,
            ConnectionState::CredentialHandoff,
            ConnectionState::AwaitingNetworkJoin,
        );
        self.set_waiting();
        Ok(TickFlow::Continue)
    }

    /// Next pairing frame matching `tag`, `None` on timeout
    fn receive_pairing(&self, tag: &str) -> Result<Option<Frame>> {
        self.pairing_client.receive(
            ChannelId::CONTROL,
            tag,
            Some(self.config.receive_timeout()),
        )
    }

    fn await_join(&self, epoch: u64, state: ConnectionState) -> Result<TickFlow> {
        let Some(frame) = self.receive_pairing(WC)? else {
            return Ok(TickFlow::Continue);
        };
        if status_bit(&frame, WC) == Some(true) {
            tracing::info!("Device joined the network");
            *self.handoff_step.lock() = HandoffStep::AwaitDeviceInfo;
            return Ok(TickFlow::Continue);
        }

        tracing::warn!("Device could not join the network ({})", frame);
        // wrong credentials; ask again
        *self.credentials.lock() = None;
        self.set_status("Network join failed");
        Ok(self.back_to_pairing(epoch, state))
    }

    fn await_device_info(&self, epoch: u64, state: ConnectionState) -> Result<TickFlow> {
        let Some(frame) = self.receive_pairing(STAINFO)? else {
            return Ok(TickFlow::Continue);
        };
        let (Some(address), Some(port)) = (
            frame.parse_field::<IpAddr>(0),
            frame.parse_field::<u16>(1),
        ) else {
            tracing::warn!("Unusable device info: {}", frame);
            self.set_status("Invalid device info");
            return Ok(self.back_to_pairing(epoch, state));
        };
        *self.device.lock() = Some(DeviceInfo { address, port });
        tracing::info!("Device reachable at {}:{}", address, port);

        let own = match self.config.network.controller_address {
            Some(own) => own,
            None => local_address_towards(address)?,
        };
        let frame = Frame::new(WLANDATA, [own.to_string()])?;
        self.pairing_client.send(ChannelId::CONTROL, &frame)?;

        *self.handoff_step.lock() = HandoffStep::AwaitServer;
        Ok(TickFlow::Continue)
    }

    fn await_server(&self, epoch: u64, state: ConnectionState) -> Result<TickFlow> {
        let Some(frame) = self.receive_pairing(WS)? else {
            return Ok(TickFlow::Continue);
        };
        if status_bit(&frame, WS) != Some(true) {
            tracing::warn!("Device server did not start ({})", frame);
            self.set_status("Device server failed to start");
            return Ok(self.back_to_pairing(epoch, state));
        }

        tracing::info!("Device server ready, leaving the pairing link");
        self.pairing_client.reset();
        *self.handoff_step.lock() = HandoffStep::SendCredentials;
        if self.advance(
            epoch,
            ConnectionState::AwaitingNetworkJoin,
            ConnectionState::Registering,
        ) {
            self.set_waiting();
            self.start_task(&self.links.registration);
        }
        Ok(TickFlow::Stop)
    }

    // ---- registration ----

    fn register(&self) -> Result<TickFlow> {
        let Phase { state, epoch } = self.phase();
        if state != ConnectionState::Registering {
            return Ok(TickFlow::Stop);
        }
        let Some(_run) = self.run_guard(epoch) else {
            return Ok(TickFlow::Stop);
        };

        match self.send_registration() {
            Ok(()) => {
                self.registration_attempts.store(0, Ordering::Relaxed);
                self.set_registration_interval(1);
                if self.advance(
                    epoch,
                    ConnectionState::Registering,
                    ConnectionState::AwaitingRegistrationAck,
                ) {
                    self.start_task(&self.links.ack);
                }
                Ok(TickFlow::Stop)
            }
            Err(e) => {
                self.registration_failures.fetch_add(1, Ordering::Relaxed);
                let attempts = self.registration_attempts.fetch_add(1, Ordering::Relaxed) + 1;
                tracing::warn!("Registration attempt {} failed: {}", attempts, e);
                self.set_registration_interval(backoff_factor(attempts));

                if attempts >= self.config.polling.max_registration_attempts {
                    tracing::error!(
                        "Registration failed {} times, continuing to retry",
                        attempts
                    );
                    self.set_status("Connection failed");
                    self.registration_attempts.store(0, Ordering::Relaxed);
                }
                Ok(TickFlow::Continue)
            }
        }
    }

    fn send_registration(&self) -> Result<()> {
        if self.network_client.target().is_none() {
            let device = (*self.device.lock())
                .ok_or(SarathiError::NotConnected(ChannelId::CONTROL))?;
            self.network_client
                .connect(&device.address.to_string(), device.port)?;
        }
        let frame = Frame::new(CMD, [CommandName::RegisterIp.as_str()])?;
        self.network_client.send(ChannelId::CONTROL, &frame)
    }

    fn set_registration_interval(&self, factor: u32) {
        if let Some(task) = self.links.registration.upgrade() {
            let base = secs(self.config.polling.registration_secs);
            task.set_interval(base * factor);
        }
    }

    // ---- registration-ack ----

    fn await_ack(&self) -> Result<TickFlow> {
        let Phase { state, epoch } = self.phase();
        if state != ConnectionState::AwaitingRegistrationAck {
            return Ok(TickFlow::Stop);
        }
        let Some(_run) = self.run_guard(epoch) else {
            return Ok(TickFlow::Stop);
        };

        let reply = self.network_client.receive(
            ChannelId::CONTROL,
            REGISTER,
            Some(self.config.receive_timeout()),
        );
        let accepted = match reply {
            Ok(Some(frame)) => status_bit(&frame, REGISTER),
            Ok(None) => {
                let e = SarathiError::ProtocolTimeout("no REGISTER reply".into());
                tracing::warn!("{}", e);
                None
            }
            Err(e) => {
                tracing::warn!("Registration reply failed: {}", e);
                None
            }
        };

        match accepted {
            Some(true) => self.enter_ready(epoch, ConnectionState::AwaitingRegistrationAck),
            Some(false) => {
                tracing::warn!("{}", SarathiError::RegistrationConflict);
                self.set_status("Connection failed");
                self.retry_registration(epoch);
            }
            None => self.retry_registration(epoch),
        }
        Ok(TickFlow::Stop)
    }

    fn retry_registration(&self, epoch: u64) {
        if self.advance(
            epoch,
            ConnectionState::AwaitingRegistrationAck,
            ConnectionState::Registering,
        ) {
            self.start_task(&self.links.registration);
        }
    }

    /// Publish the session, the status and `Ready` together
    fn enter_ready(&self, epoch: u64, from: ConnectionState) {
        let mut phase = self.phase.lock();
        if phase.epoch != epoch
            || phase.state != from
            || !from.can_transition_to(ConnectionState::Ready, self.offline())
        {
            tracing::debug!("Skipping {} -> Ready: state is {}", from, phase.state);
            return;
        }
        self.stop_task(&self.links.animation);

        let session = Arc::new(FlightSession::new(
            Arc::clone(&self.network_client),
            Arc::clone(&self.input),
            Arc::clone(&self.collaborators.settings),
            &self.config.polling,
            self.config.receive_timeout(),
            self.offline(),
        ));
        if let Err(e) = session.start() {
            tracing::error!("Failed to start flight session: {}", e);
        }
        *self.session.lock() = Some(session);
        self.set_status("Connected");

        phase.state = ConnectionState::Ready;
        self.state_changed.notify_all();
        drop(phase);
        tracing::info!("Connection state: {} -> {}", from, ConnectionState::Ready);
    }

    // ---- wait-animation ----

    /// Only rewrites a waiting status, which `stop` replaces, so it needs no
    /// run guard and keeps turning while another task blocks on I/O
    fn animate(&self) -> Result<TickFlow> {
        if !self.state().is_connecting() {
            return Ok(TickFlow::Stop);
        }
        let step = self.animation_step.fetch_add(1, Ordering::Relaxed) % 4;
        let mut status = self.status.lock();
        if status.waiting {
            status.text = format!("{}{}", self.translate("Waiting"), ".".repeat(step));
        }
        Ok(TickFlow::Continue)
    }

    // ---- offline ----

    fn offline_tick(&self) -> Result<TickFlow> {
        let Phase { state, epoch } = self.phase();
        if state != ConnectionState::AwaitingPairingLink {
            return Ok(TickFlow::Stop);
        }
        let Some(_run) = self.run_guard(epoch) else {
            return Ok(TickFlow::Stop);
        };

        let deadline = *self.offline_deadline.lock();
        match deadline {
            Some(deadline) if Instant::now() < deadline => Ok(TickFlow::Continue),
            Some(_) => {
                self.enter_ready(epoch, ConnectionState::AwaitingPairingLink);
                Ok(TickFlow::Stop)
            }
            None => Ok(TickFlow::Stop),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pairing::StaticPairing;
    use crate::settings::MemorySettings;
    use crate::translate::{Catalog, Passthrough};
    use crate::transport::LinkEndpointAddress;

    fn collaborators(pairing: Arc<StaticPairing>) -> Collaborators {
        Collaborators {
            pairing,
            settings: Arc::new(MemorySettings::new()),
            translator: Arc::new(Passthrough),
        }
    }

    fn fast_config() -> SarathiConfig {
        let mut config = SarathiConfig::default();
        config.pairing.transport = PairingTransport::Tcp;
        config.polling.pairing_check_secs = 0.02;
        config.polling.animation_secs = 0.02;
        config.app.offline_delay_ms = 50;
        config
    }

    #[test]
    fn test_transition_table() {
        use ConnectionState::*;
        assert!(Idle.can_transition_to(AwaitingPairingLink, false));
        assert!(AwaitingRegistrationAck.can_transition_to(Registering, false));
        assert!(AwaitingNetworkJoin.can_transition_to(AwaitingPairingLink, false));
        assert!(Ready.can_transition_to(Idle, false));

        assert!(!Ready.can_transition_to(Registering, false));
        assert!(!Registering.can_transition_to(CredentialHandoff, false));
        assert!(!Idle.can_transition_to(Registering, false));
        assert!(!AwaitingPairingLink.can_transition_to(Ready, false));
        assert!(AwaitingPairingLink.can_transition_to(Ready, true));
    }

    #[test]
    fn test_offline_mode_reaches_ready_without_io() {
        let mut config = fast_config();
        config.app.offline_mode = true;
        let pairing = Arc::new(StaticPairing::new(Vec::new()));
        let orchestrator = ConnectionOrchestrator::new(config, collaborators(pairing));

        let started = Instant::now();
        orchestrator.start().unwrap();
        assert_eq!(orchestrator.status(), "Offline mode");
        assert!(orchestrator.wait_for_state(ConnectionState::Ready, Duration::from_secs(2)));
        assert!(started.elapsed() >= Duration::from_millis(50));

        let session = orchestrator.session().unwrap();
        assert!(session.is_offline());
        assert_eq!(orchestrator.status(), "Connected");

        orchestrator.stop();
        assert_eq!(orchestrator.state(), ConnectionState::Idle);
        assert!(orchestrator.session().is_none());
    }

    #[test]
    fn test_waits_for_radio_and_paired_device() {
        let pairing = Arc::new(StaticPairing::new(Vec::new()));
        pairing.set_enabled(false);
        let mut collaborators = collaborators(Arc::clone(&pairing));
        collaborators.translator = Arc::new(Catalog::new([(
            "Turn on your pairing link",
            "Bitte Kopplung einschalten",
        )]));
        let orchestrator = ConnectionOrchestrator::new(fast_config(), collaborators);

        orchestrator.start().unwrap();
        assert_eq!(orchestrator.state(), ConnectionState::AwaitingPairingLink);
        std::thread::sleep(Duration::from_millis(80));
        assert_eq!(orchestrator.status(), "Bitte Kopplung einschalten");

        pairing.set_enabled(true);
        pairing.set_devices(vec![PairedDevice::new(
            "other-device",
            LinkEndpointAddress::new("127.0.0.1", 1),
        )]);
        std::thread::sleep(Duration::from_millis(80));
        assert_eq!(orchestrator.status(), "Device not paired: mpy-uart");
        assert_eq!(orchestrator.state(), ConnectionState::AwaitingPairingLink);

        orchestrator.stop();
        assert_eq!(orchestrator.state(), ConnectionState::Idle);
        assert_eq!(orchestrator.status(), "Disconnected");
    }

    #[test]
    fn test_backoff_doubles_up_to_cap() {
        assert_eq!(backoff_factor(0), 1);
        assert_eq!(backoff_factor(1), 2);
        assert_eq!(backoff_factor(2), 4);
        assert_eq!(backoff_factor(3), MAX_BACKOFF_FACTOR);
        assert_eq!(backoff_factor(40), MAX_BACKOFF_FACTOR);
    }

    /// Adapter whose device query blocks until the test lets it go
    struct GatedPairing {
        device: PairedDevice,
        entered: crossbeam_channel::Sender<()>,
        release: crossbeam_channel::Receiver<()>,
    }

    impl PairingAdapter for GatedPairing {
        fn is_enabled(&self) -> bool {
            true
        }

        fn paired_devices(&self) -> Vec<PairedDevice> {
            let _ = self.entered.send(());
            let _ = self.release.recv();
            vec![self.device.clone()]
        }
    }

    #[test]
    fn test_stop_discards_tick_in_flight() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let (entered_tx, entered_rx) = crossbeam_channel::unbounded();
        let (release_tx, release_rx) = crossbeam_channel::unbounded();
        let pairing = Arc::new(GatedPairing {
            device: PairedDevice::new("mpy-uart", LinkEndpointAddress::new("127.0.0.1", port)),
            entered: entered_tx,
            release: release_rx,
        });
        let collaborators = Collaborators {
            pairing,
            settings: Arc::new(MemorySettings::new()),
            translator: Arc::new(Passthrough),
        };
        let orchestrator = ConnectionOrchestrator::new(fast_config(), collaborators);

        orchestrator.start().unwrap();
        entered_rx.recv_timeout(Duration::from_secs(1)).unwrap();
        orchestrator.stop();
        assert_eq!(orchestrator.state(), ConnectionState::Idle);

        // let the stale tick finish; it must not open the link
        release_tx.send(()).unwrap();
        std::thread::sleep(Duration::from_millis(100));
        assert_eq!(orchestrator.state(), ConnectionState::Idle);
        assert!(orchestrator.paired_device().is_none());
        assert!(!orchestrator.shared.pairing_client.is_connected(ChannelId::CONTROL));
        assert!(orchestrator.shared.pairing_client.target().is_none());

        // a new run starts even while its first device query hangs
        orchestrator.start().unwrap();
        entered_rx.recv_timeout(Duration::from_secs(1)).unwrap();
        assert_eq!(orchestrator.state(), ConnectionState::AwaitingPairingLink);
        orchestrator.stop();
        drop(release_tx);
        std::thread::sleep(Duration::from_millis(50));
        assert!(orchestrator.paired_device().is_none());
    }

    #[test]
    fn test_repeated_offline_runs_release_session_observers() {
        let mut config = fast_config();
        config.app.offline_mode = true;
        config.app.offline_delay_ms = 5;
        let settings = Arc::new(MemorySettings::new());
        let collaborators = Collaborators {
            pairing: Arc::new(StaticPairing::new(Vec::new())),
            settings: Arc::clone(&settings) as Arc<dyn SettingsStore>,
            translator: Arc::new(Passthrough),
        };
        let orchestrator = ConnectionOrchestrator::new(config, collaborators);

        for _ in 0..10 {
            orchestrator.start().unwrap();
            assert!(orchestrator.wait_for_state(ConnectionState::Ready, Duration::from_secs(2)));
            assert!(orchestrator.session().is_some());
            assert_eq!(orchestrator.status(), "Connected");
            orchestrator.stop();
        }
        assert_eq!(settings.observer_count(), 0);
    }

    #[test]
    fn test_rejects_unframeable_credentials() {
        let pairing = Arc::new(StaticPairing::new(Vec::new()));
        let orchestrator = ConnectionOrchestrator::new(fast_config(), collaborators(pairing));
        assert!(matches!(
            orchestrator.submit_credentials("home|net", "secret"),
            Err(SarathiError::MalformedFrame(_))
        ));
        assert!(orchestrator.submit_credentials("", "secret").is_err());
        assert!(!orchestrator.has_credentials());
        orchestrator.submit_credentials("home", "secret").unwrap();
        assert!(orchestrator.has_credentials());
    }
}
