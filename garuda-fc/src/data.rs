//! In-memory control state pushed by the controller

use std::fmt;

/// Keys the device accepts in data frames
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataKey {
    /// Right joystick (x, y)
    RightStick,
    /// Left joystick (x, y)
    LeftStick,
    /// Hover flag
    Hover,
}

impl DataKey {
    pub fn parse(key: &str) -> Option<Self> {
        match key {
            setu_proto::vocabulary::RJ => Some(DataKey::RightStick),
            setu_proto::vocabulary::LJ => Some(DataKey::LeftStick),
            setu_proto::vocabulary::HOVER => Some(DataKey::Hover),
            _ => None,
        }
    }
}

/// Result of applying one data frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DataUpdate {
    Applied(DataKey),
    /// Key is not one of the declared keys; nothing stored
    UnknownKey(String),
    /// Known key, unusable values; nothing stored
    Invalid(String),
}

/// Declared control values
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct DataContainer {
    pub right_stick: (f32, f32),
    pub left_stick: (f32, f32),
    pub hover: bool,
}

impl DataContainer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `values` under `key` if the key is declared
    pub fn apply<S: AsRef<str>>(&mut self, key: &str, values: &[S]) -> DataUpdate {
        let Some(data_key) = DataKey::parse(key) else {
            return DataUpdate::UnknownKey(key.to_string());
        };

        match data_key {
            DataKey::RightStick | DataKey::LeftStick => {
                let Some(pair) = parse_axis(values) else {
                    return DataUpdate::Invalid(format!("{} expects two numbers", key));
                };
                if data_key == DataKey::RightStick {
                    self.right_stick = pair;
                } else {
                    self.left_stick = pair;
                }
            }
            DataKey::Hover => {
                let Some(flag) = values.first().and_then(|v| parse_flag(v.as_ref())) else {
                    return DataUpdate::Invalid(format!("{} expects a flag", key));
                };
                self.hover = flag;
            }
        }
        DataUpdate::Applied(data_key)
    }

    pub fn clear(&mut self) {
        *self = Self::default();
    }
}

impl fmt::Display for DataContainer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "RJ=({:.2}, {:.2}) LJ=({:.2}, {:.2}) hover={}",
            self.right_stick.0, self.right_stick.1, self.left_stick.0, self.left_stick.1, self.hover
        )
    }
}

fn parse_axis<S: AsRef<str>>(values: &[S]) -> Option<(f32, f32)> {
    match values {
        [x, y, ..] => {
            let x = x.as_ref().trim().parse::<f32>().ok()?;
            let y = y.as_ref().trim().parse::<f32>().ok()?;
            (x.is_finite() && y.is_finite()).then_some((x, y))
        }
        _ => None,
    }
}

/// Accepts `1/0`, `true/false` in any case
pub fn parse_flag(value: &str) -> Option<bool> {
    let value = value.trim();
    if value == "1" || value.eq_ignore_ascii_case("true") {
        Some(true)
    } else if value == "0" || value.eq_ignore_ascii_case("false") {
        Some(false)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_keys_are_stored() {
        let mut data = DataContainer::new();
        assert_eq!(
            data.apply("RJ", &["0.5", "-0.25"]),
            DataUpdate::Applied(DataKey::RightStick)
        );
        assert_eq!(
            data.apply("LJ", &["1", "0"]),
            DataUpdate::Applied(DataKey::LeftStick)
        );
        assert_eq!(data.apply("HOVER", &["True"]), DataUpdate::Applied(DataKey::Hover));
        assert_eq!(data.right_stick, (0.5, -0.25));
        assert_eq!(data.left_stick, (1.0, 0.0));
        assert!(data.hover);
    }

    #[test]
    fn test_unknown_key_is_ignored() {
        let mut data = DataContainer::new();
        assert_eq!(
            data.apply("THROTTLE", &["1"]),
            DataUpdate::UnknownKey("THROTTLE".into())
        );
        assert_eq!(data, DataContainer::default());
    }

    #[test]
    fn test_invalid_values_leave_state_alone() {
        let mut data = DataContainer::new();
        data.apply("RJ", &["0.1", "0.2"]);
        assert!(matches!(data.apply("RJ", &["x", "0.2"]), DataUpdate::Invalid(_)));
        assert!(matches!(data.apply("RJ", &["0.3"]), DataUpdate::Invalid(_)));
        assert!(matches!(data.apply("RJ", &["NaN", "1"]), DataUpdate::Invalid(_)));
        assert!(matches!(data.apply::<&str>("HOVER", &[]), DataUpdate::Invalid(_)));
        assert_eq!(data.right_stick, (0.1, 0.2));
    }

    #[test]
    fn test_parse_flag() {
        assert_eq!(parse_flag("1"), Some(true));
        assert_eq!(parse_flag("FALSE"), Some(false));
        assert_eq!(parse_flag("yes"), None);
    }
}
