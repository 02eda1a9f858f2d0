//! Command dispatcher
//!
//! Classifies one incoming frame, checks the pairing session for private
//! commands, executes, and builds the reply.
//!
//! | Frame | Access | Reply |
//! |-------|--------|-------|
//! | `CMD\|register_ip` | public | `REGISTER\|1` or `REGISTER\|0` when already bound |
//! | `CMD\|unregister_ip` | private | `UNREGISTER\|1` / `UNREGISTER\|0` |
//! | `CMD\|get_sensor_data` | private | `GEODATA\|alt\|speed\|lat\|lon` |
//! | `CMD\|get_conn_data` | private | `CONDATA\|n` |
//! | `CMD\|set_config\|{json}` | private | `CONFIG\|1` / `CONFIG\|0` |
//! | `CMD\|set_hover_mode\|flag` | private | `HOVER\|1` / `HOVER\|0` on a bad flag |
//! | `CMD\|reset` | private | `RESET\|1`, then the listener is rebuilt |
//! | `DATA\|key\|values...`, `RJ\|x\|y`, `LJ\|x\|y`, `HOVER\|flag` | private | none |
//!
//! Private frames from any peer other than the bound one get `DENIED|<name>`.
//! Unknown command names and tags get `NOTFOUND|<name>`.

use crate::data::{DataContainer, DataUpdate, parse_flag};
use crate::session::PairingSession;
use crate::settings::DeviceSettings;
use crate::telemetry::TelemetrySource;
use setu_proto::vocabulary::{
    CMD, CONDATA, CONFIG, DATA, DENIED, GEODATA, HOVER, LJ, NOTFOUND, REGISTER, RESET, RJ,
    UNREGISTER,
};
use setu_proto::{Access, CommandName, Frame, SEPARATOR, decode};
use std::net::IpAddr;

/// What the server should do after a frame was dispatched
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Response {
    /// Frame to write back before closing the connection
    pub reply: Option<String>,
    /// Rebuild the listener after replying
    pub restart: bool,
}

impl Response {
    fn reply(tag: &str, fields: &[&str]) -> Self {
        Self {
            reply: Some(setu_proto::encode(tag, fields)),
            restart: false,
        }
    }

    fn silent() -> Self {
        Self::default()
    }
}

/// Device-side state behind the command server
pub struct CommandDispatcher {
    session: PairingSession,
    data: DataContainer,
    settings: DeviceSettings,
    telemetry: Box<dyn TelemetrySource>,
}

impl CommandDispatcher {
    pub fn new(settings: DeviceSettings, telemetry: Box<dyn TelemetrySource>) -> Self {
        Self {
            session: PairingSession::new(),
            data: DataContainer::new(),
            settings,
            telemetry,
        }
    }

    pub fn session(&self) -> &PairingSession {
        &self.session
    }

    pub fn data(&self) -> &DataContainer {
        &self.data
    }

    pub fn settings(&self) -> &DeviceSettings {
        &self.settings
    }

    /// Handle one raw frame from `peer`
    pub fn dispatch(&mut self, peer: IpAddr, raw: &str) -> Response {
        let frame = match decode(raw) {
            Ok(frame) => frame,
            Err(e) => {
                log::warn!("Dropping frame from {}: {}", peer, e);
                return Response::silent();
            }
        };

        match frame.tag.as_str() {
            CMD => self.dispatch_command(peer, &frame),
            DATA => match frame.fields.split_first() {
                Some((key, values)) => self.store_data(peer, DATA, key, values),
                None => {
                    log::warn!("DATA frame without key from {}", peer);
                    Response::silent()
                }
            },
            RJ | LJ | HOVER => self.store_data(peer, &frame.tag, &frame.tag, &frame.fields),
            other => {
                log::warn!("Unknown tag from {}: {}", peer, other);
                Response::reply(NOTFOUND, &[other])
            }
        }
    }

    fn dispatch_command(&mut self, peer: IpAddr, frame: &Frame) -> Response {
        let Some(name) = frame.field(0) else {
            log::warn!("CMD frame without name from {}", peer);
            return Response::reply(NOTFOUND, &[CMD]);
        };
        let args = &frame.fields[1..];

        let Some(command) = CommandName::parse(name) else {
            log::warn!("Command not found: {} (from {})", name, peer);
            return Response::reply(NOTFOUND, &[name]);
        };

        if command.access() == Access::Private && !self.session.is_authorized(peer) {
            log::warn!(
                "Permission denied: {} from {} (bound: {:?})",
                command,
                peer,
                self.session.bound()
            );
            return Response::reply(DENIED, &[command.as_str()]);
        }

        log::debug!("{} command from {}: {} {:?}", access_label(command), peer, command, args);
        self.execute(peer, command, args)
    }

    fn execute(&mut self, peer: IpAddr, command: CommandName, args: &[String]) -> Response {
        match command {
            CommandName::RegisterIp => {
                if self.session.register(peer) {
                    log::info!("Registered controller {}", peer);
                    Response::reply(REGISTER, &["1"])
                } else {
                    log::warn!(
                        "Registration conflict: {} while {:?} is bound",
                        peer,
                        self.session.bound()
                    );
                    Response::reply(REGISTER, &["0"])
                }
            }
            CommandName::UnregisterIp => {
                let ok = self.session.unregister(peer);
                if ok {
                    log::info!("Unregistered controller {}", peer);
                }
                Response::reply(UNREGISTER, &[bit(ok)])
            }
            CommandName::GetSensorData => {
                let fields = self.telemetry.geo().fields();
                let fields: Vec<&str> = fields.iter().map(String::as_str).collect();
                Response::reply(GEODATA, &fields)
            }
            CommandName::GetConnData => {
                let value = self.telemetry.link_quality().to_string();
                Response::reply(CONDATA, &[value.as_str()])
            }
            CommandName::SetConfig => {
                let payload = args.join(&SEPARATOR.to_string());
                match self.settings.merge_json(&payload) {
                    Ok(count) => {
                        log::info!("Applied {} setting(s) from {}", count, peer);
                        Response::reply(CONFIG, &["1"])
                    }
                    Err(e) => {
                        log::warn!("set_config rejected: {}", e);
                        Response::reply(CONFIG, &["0"])
                    }
                }
            }
            CommandName::SetHoverMode => match args.first().and_then(|a| parse_flag(a)) {
                Some(flag) => {
                    self.data.hover = flag;
                    log::info!("Hover mode {}", if flag { "on" } else { "off" });
                    Response::reply(HOVER, &["1"])
                }
                None => {
                    log::warn!("set_hover_mode needs a flag, got {:?}", args.first());
                    Response::reply(HOVER, &["0"])
                }
            },
            CommandName::Reset => {
                log::info!("Reset requested by {}", peer);
                self.reset();
                Response {
                    reply: Some(setu_proto::encode(RESET, &["1"])),
                    restart: true,
                }
            }
        }
    }

    fn store_data(&mut self, peer: IpAddr, tag: &str, key: &str, values: &[String]) -> Response {
        if !self.session.is_authorized(peer) {
            log::warn!("Permission denied: {} frame from {}", tag, peer);
            return Response::reply(DENIED, &[tag]);
        }

        match self.data.apply(key, values) {
            DataUpdate::Applied(_) => log::trace!("Data: {}", self.data),
            DataUpdate::UnknownKey(key) => log::debug!("Ignoring unknown data key {}", key),
            DataUpdate::Invalid(reason) => log::warn!("Ignoring data frame: {}", reason),
        }
        Response::silent()
    }

    /// Forget the bound controller and the control state
    pub fn reset(&mut self) {
        self.session.clear();
        self.data.clear();
    }
}

fn bit(value: bool) -> &'static str {
    if value { "1" } else { "0" }
}

fn access_label(command: CommandName) -> &'static str {
    match command.access() {
        Access::Public => "Public",
        Access::Private => "Private",
    }
}
