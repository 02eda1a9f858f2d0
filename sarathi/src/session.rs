//! Steady-state flight session.
//!
//! Created once the device acknowledged registration. Three polling tasks
//! share the network client, each on its own channel:
//!
//! - `send-control` pushes both stick positions (`RJ|x|y`, `LJ|x|y`)
//! - `fetch-telemetry` polls `get_sensor_data`
//! - `fetch-link-quality` polls `get_conn_data`
//!
//! In offline mode nothing is sent; the tasks only read local state.

use crate::config::{PollingConfig, secs};
use crate::error::{Result, SarathiError};
use crate::link_quality::LinkQuality;
use crate::polling::{PollingTask, TickFlow, WeakPollingTask};
use crate::settings::{SettingsObserver, SettingsStore, SubscriptionId};
use crate::shared::ControlInput;
use crate::transport::{ChannelId, TransportClient};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use setu_proto::vocabulary::{CMD, CONDATA, CONFIG, DENIED, GEODATA, HOVER, LJ, NOTFOUND, RJ};
use setu_proto::{CommandName, Frame};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Settings key of the control send interval, in seconds
pub const TICK_KEY: &str = "tick";

/// Settings key of the saved waypoints object
pub const WAYPOINTS_KEY: &str = "waypoints";

const WAYPOINT_NAME: &str = "new waypoint";

/// Last `GEODATA` reading
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Telemetry {
    pub altitude: f64,
    pub speed: f64,
    pub latitude: f64,
    pub longitude: f64,
}

impl Telemetry {
    pub fn from_frame(frame: &Frame) -> Result<Self> {
        let field = |index: usize| {
            frame.parse_field::<f64>(index).ok_or_else(|| {
                SarathiError::MalformedFrame(format!("GEODATA field {} is not a number", index))
            })
        };
        Ok(Self {
            altitude: field(0)?,
            speed: field(1)?,
            latitude: field(2)?,
            longitude: field(3)?,
        })
    }
}

/// Last `CONDATA` reading
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkReading {
    pub value: u32,
    pub quality: LinkQuality,
}

struct SessionShared {
    client: Arc<TransportClient>,
    input: Arc<ControlInput>,
    settings: Arc<dyn SettingsStore>,
    offline: bool,
    receive_timeout: Duration,
    telemetry: Mutex<Option<Telemetry>>,
    link: Mutex<Option<LinkReading>>,
}

/// Polling tasks and last readings of one connected session
pub struct FlightSession {
    shared: Arc<SessionShared>,
    send_control: PollingTask,
    fetch_telemetry: PollingTask,
    fetch_link_quality: PollingTask,
    /// `tick` observer, held while the session may run
    subscription: Mutex<Option<SubscriptionId>>,
}

impl FlightSession {
    pub fn new(
        client: Arc<TransportClient>,
        input: Arc<ControlInput>,
        settings: Arc<dyn SettingsStore>,
        polling: &PollingConfig,
        receive_timeout: Duration,
        offline: bool,
    ) -> Self {
        let tick = settings
            .get(TICK_KEY)
            .and_then(|v| v.as_f64())
            .unwrap_or(polling.tick_secs);

        let shared = Arc::new(SessionShared {
            client,
            input,
            settings,
            offline,
            receive_timeout,
            telemetry: Mutex::new(None),
            link: Mutex::new(None),
        });

        let send_control = PollingTask::new("send-control", secs(tick));
        let fetch_telemetry = PollingTask::new("fetch-telemetry", secs(polling.telemetry_secs));
        let fetch_link_quality =
            PollingTask::new("fetch-link-quality", secs(polling.link_quality_secs));

        let s = Arc::clone(&shared);
        send_control.add_callable(move || s.send_control());
        let s = Arc::clone(&shared);
        fetch_telemetry.add_callable(move || s.fetch_telemetry());
        let s = Arc::clone(&shared);
        fetch_link_quality.add_callable(move || s.fetch_link_quality());

        let session = Self {
            shared,
            send_control,
            fetch_telemetry,
            fetch_link_quality,
            subscription: Mutex::new(None),
        };
        session.subscribe_tick();
        session
    }

    pub fn start(&self) -> Result<()> {
        self.subscribe_tick();
        self.send_control.save_start()?;
        self.fetch_telemetry.save_start()?;
        self.fetch_link_quality.save_start()?;
        Ok(())
    }

    /// Stop the tasks and release the settings observer
    pub fn stop(&self) {
        self.send_control.stop();
        self.fetch_telemetry.stop();
        self.fetch_link_quality.stop();
        self.unsubscribe_tick();
    }

    pub fn is_offline(&self) -> bool {
        self.shared.offline
    }

    pub fn input(&self) -> &Arc<ControlInput> {
        &self.shared.input
    }

    pub fn telemetry(&self) -> Option<Telemetry> {
        *self.shared.telemetry.lock()
    }

    pub fn link_quality(&self) -> Option<LinkReading> {
        *self.shared.link.lock()
    }

    pub fn control_interval(&self) -> Duration {
        self.send_control.interval()
    }

    /// Switch hover mode; returns the device's status bit
    pub fn set_hover_mode(&self, enabled: bool) -> Result<bool> {
        let flag = if enabled { "1" } else { "0" };
        if self.shared.offline {
            return Ok(true);
        }
        let frame = command(CommandName::SetHoverMode, &[flag])?;
        let reply = self.shared.command(ChannelId::CONTROL, &frame, HOVER)?;
        Ok(setu_proto::status_bit(&reply, HOVER).unwrap_or(false))
    }

    /// Merge `config` into the device settings; returns the device's status bit
    pub fn push_config(&self, config: &Value) -> Result<bool> {
        if self.shared.offline {
            return Ok(true);
        }
        let payload = serde_json::to_string(config)?;
        // the device rejoins the payload, so separators inside JSON survive
        let frame = Frame {
            tag: CMD.to_string(),
            fields: vec![CommandName::SetConfig.as_str().to_string(), payload],
        };
        let reply = self.shared.command(ChannelId::CONTROL, &frame, CONFIG)?;
        Ok(setu_proto::status_bit(&reply, CONFIG).unwrap_or(false))
    }

    /// Store the latest telemetry under a fresh waypoint name and save the
    /// settings. Returns the name used.
    pub fn set_waypoint(&self) -> Result<String> {
        let telemetry = self
            .telemetry()
            .ok_or(SarathiError::NotConnected(ChannelId::TELEMETRY))?;
        let settings = &self.shared.settings;

        let mut waypoints = match settings.get(WAYPOINTS_KEY) {
            Some(Value::Object(map)) => map,
            _ => Map::new(),
        };
        let name = unique_waypoint_name(&waypoints);

        let mut entry = serde_json::to_value(telemetry)?;
        if let Value::Object(fields) = &mut entry {
            fields.insert("timestamp".into(), Value::from(unix_timestamp()));
        }
        waypoints.insert(name.clone(), entry);

        settings.set(WAYPOINTS_KEY, Value::Object(waypoints));
        settings.save()?;
        tracing::info!("Saved waypoint '{}'", name);
        Ok(name)
    }

    /// Follow the `tick` setting whenever it is saved
    fn subscribe_tick(&self) {
        let mut subscription = self.subscription.lock();
        if subscription.is_none() {
            let observer = tick_observer(self.send_control.downgrade());
            *subscription = Some(self.shared.settings.subscribe(observer));
        }
    }

    fn unsubscribe_tick(&self) {
        if let Some(id) = self.subscription.lock().take() {
            self.shared.settings.unsubscribe(id);
        }
    }
}

impl Drop for FlightSession {
    fn drop(&mut self) {
        self.unsubscribe_tick();
    }
}

fn tick_observer(control_task: WeakPollingTask) -> SettingsObserver {
    Arc::new(move |key, value| {
        if key != TICK_KEY {
            return;
        }
        let (Some(task), Some(tick)) = (control_task.upgrade(), value.as_f64()) else {
            return;
        };
        tracing::info!("Control interval changed to {}s", tick);
        task.set_interval(secs(tick));
    })
}

impl SessionShared {
    fn send_control(&self) -> Result<TickFlow> {
        let (rx, ry) = self.input.right.get();
        let (lx, ly) = self.input.left.get();
        if self.offline {
            tracing::trace!("Control (offline): RJ {},{} LJ {},{}", rx, ry, lx, ly);
            return Ok(TickFlow::Continue);
        }

        for (tag, x, y) in [(RJ, rx, ry), (LJ, lx, ly)] {
            let frame = Frame::new(tag, [x.to_string(), y.to_string()])?;
            self.client.send(ChannelId::CONTROL, &frame)?;
        }
        Ok(TickFlow::Continue)
    }

    fn fetch_telemetry(&self) -> Result<TickFlow> {
        if self.offline {
            return Ok(TickFlow::Continue);
        }
        let frame = command(CommandName::GetSensorData, &[])?;
        let reply = self.command(ChannelId::TELEMETRY, &frame, GEODATA)?;
        let telemetry = Telemetry::from_frame(&reply)?;
        tracing::debug!("Telemetry: {:?}", telemetry);
        *self.telemetry.lock() = Some(telemetry);
        Ok(TickFlow::Continue)
    }

    fn fetch_link_quality(&self) -> Result<TickFlow> {
        if self.offline {
            return Ok(TickFlow::Continue);
        }
        let frame = command(CommandName::GetConnData, &[])?;
        let reply = self.command(ChannelId::LINK_QUALITY, &frame, CONDATA)?;
        let value: u32 = reply
            .parse_field(0)
            .ok_or_else(|| SarathiError::MalformedFrame("CONDATA without a value".into()))?;
        let reading = LinkReading {
            value,
            quality: LinkQuality::classify(value),
        };

        let previous = self.link.lock().replace(reading);
        if previous.map(|p| p.quality) != Some(reading.quality) {
            tracing::info!("Link quality {}: {}", value, reading.quality);
        }
        Ok(TickFlow::Continue)
    }

    /// Request/reply on `channel`, mapping device rejections to errors
    fn command(&self, channel: ChannelId, frame: &Frame, expected: &str) -> Result<Frame> {
        let reply = self
            .client
            .request(channel, frame, "", Some(self.receive_timeout))?
            .ok_or_else(|| {
                SarathiError::ProtocolTimeout(format!("no {} reply on {}", expected, channel))
            })?;

        match reply.tag.as_str() {
            tag if tag == expected => Ok(reply),
            DENIED | NOTFOUND => Err(SarathiError::Unauthorized(format!(
                "{}|{}",
                reply.tag,
                reply.fields.join("|")
            ))),
            _ => Err(SarathiError::MalformedFrame(format!(
                "expected {}, got {}",
                expected, reply
            ))),
        }
    }
}

fn command(name: CommandName, args: &[&str]) -> Result<Frame> {
    let fields = std::iter::once(name.as_str()).chain(args.iter().copied());
    Ok(Frame::new(CMD, fields)?)
}

fn unique_waypoint_name(existing: &Map<String, Value>) -> String {
    if !existing.contains_key(WAYPOINT_NAME) {
        return WAYPOINT_NAME.to_string();
    }
    (1..)
        .map(|n| format!("{}({})", WAYPOINT_NAME, n))
        .find(|name| !existing.contains_key(name))
        .unwrap_or_else(|| WAYPOINT_NAME.to_string())
}

fn unix_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
