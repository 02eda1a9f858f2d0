//! Tag constants and the command table

use std::fmt;

// Pairing link
pub const WLAN: &str = "WLAN";
pub const WLANDATA: &str = "WLANDATA";
pub const STAINFO: &str = "STAINFO";
/// Join status prefix, followed by the status bit (`WC1`/`WC0`)
pub const WC: &str = "WC";
/// Server ready prefix, followed by the status bit (`WS1`/`WS0`)
pub const WS: &str = "WS";

// Network link
pub const CMD: &str = "CMD";
pub const DATA: &str = "DATA";
pub const REGISTER: &str = "REGISTER";
pub const UNREGISTER: &str = "UNREGISTER";
pub const GEODATA: &str = "GEODATA";
pub const CONDATA: &str = "CONDATA";
pub const CONFIG: &str = "CONFIG";
pub const HOVER: &str = "HOVER";
pub const RESET: &str = "RESET";
pub const DENIED: &str = "DENIED";
pub const NOTFOUND: &str = "NOTFOUND";

// Control axes
pub const RJ: &str = "RJ";
pub const LJ: &str = "LJ";

/// Who may invoke a command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    /// Any peer
    Public,
    /// Only the bound controller
    Private,
}

/// Commands carried in `CMD|<name>|args...`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandName {
    RegisterIp,
    UnregisterIp,
    Reset,
    SetConfig,
    SetHoverMode,
    GetSensorData,
    GetConnData,
}

impl CommandName {
    pub const ALL: [CommandName; 7] = [
        CommandName::RegisterIp,
        CommandName::UnregisterIp,
        CommandName::Reset,
        CommandName::SetConfig,
        CommandName::SetHoverMode,
        CommandName::GetSensorData,
        CommandName::GetConnData,
    ];

    /// Case-insensitive lookup of a command name
    pub fn parse(name: &str) -> Option<Self> {
        let name = name.trim();
        Self::ALL
            .into_iter()
            .find(|cmd| cmd.as_str().eq_ignore_ascii_case(name))
    }

    /// Wire spelling
    pub fn as_str(&self) -> &'static str {
        match self {
            CommandName::RegisterIp => "register_ip",
            CommandName::UnregisterIp => "unregister_ip",
            CommandName::Reset => "reset",
            CommandName::SetConfig => "set_config",
            CommandName::SetHoverMode => "set_hover_mode",
            CommandName::GetSensorData => "get_sensor_data",
            CommandName::GetConnData => "get_conn_data",
        }
    }

    pub fn access(&self) -> Access {
        match self {
            CommandName::RegisterIp => Access::Public,
            _ => Access::Private,
        }
    }
}

impl fmt::Display for CommandName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
