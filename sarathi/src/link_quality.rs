//! Link-quality tiers for `CONDATA` values

use std::fmt;

/// Upper bound (inclusive) of each tier below `Strong`
const TOO_WEAK_MAX: u32 = 10;
const WEAK_MAX: u32 = 20;
const ACCEPTABLE_MAX: u32 = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LinkQuality {
    TooWeak,
    Weak,
    Acceptable,
    Strong,
}

impl LinkQuality {
    pub fn classify(value: u32) -> Self {
        match value {
            0..=TOO_WEAK_MAX => LinkQuality::TooWeak,
            v if v <= WEAK_MAX => LinkQuality::Weak,
            v if v <= ACCEPTABLE_MAX => LinkQuality::Acceptable,
            _ => LinkQuality::Strong,
        }
    }

    /// Untranslated label for the status line
    pub fn label(&self) -> &'static str {
        match self {
            LinkQuality::TooWeak => "Signal too weak",
            LinkQuality::Weak => "Weak signal",
            LinkQuality::Acceptable => "Acceptable signal",
            LinkQuality::Strong => "Strong signal",
        }
    }
}

impl fmt::Display for LinkQuality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}
