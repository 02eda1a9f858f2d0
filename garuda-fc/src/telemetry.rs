//! Telemetry sources answering `get_sensor_data` and `get_conn_data`

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// One position/attitude sample, in `GEODATA` field order
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GeoReading {
    pub altitude: f64,
    pub speed: f64,
    pub latitude: f64,
    pub longitude: f64,
}

impl GeoReading {
    pub fn fields(&self) -> [String; 4] {
        [
            format_reading(self.altitude),
            format_reading(self.speed),
            format_reading(self.latitude),
            format_reading(self.longitude),
        ]
    }
}

fn format_reading(value: f64) -> String {
    if value.fract() == 0.0 {
        format!("{}", value as i64)
    } else {
        format!("{:.6}", value)
    }
}

/// Provider of sensor and link readings
pub trait TelemetrySource: Send {
    fn geo(&mut self) -> GeoReading;

    /// Link signal value, 0..=100
    fn link_quality(&mut self) -> u32;
}

/// Random readings for a board with no sensors wired
pub struct SimulatedTelemetry {
    rng: StdRng,
    fixed_link_quality: Option<u32>,
}

impl SimulatedTelemetry {
    pub fn new() -> Self {
        Self {
            rng: StdRng::from_entropy(),
            fixed_link_quality: None,
        }
    }

    /// Deterministic readings
    pub fn seeded(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
            fixed_link_quality: None,
        }
    }

    /// Always report this link quality
    pub fn with_link_quality(mut self, value: u32) -> Self {
        self.fixed_link_quality = Some(value.min(100));
        self
    }
}

impl Default for SimulatedTelemetry {
    fn default() -> Self {
        Self::new()
    }
}

impl TelemetrySource for SimulatedTelemetry {
    fn geo(&mut self) -> GeoReading {
        GeoReading {
            altitude: self.rng.gen_range(1..=10) as f64,
            speed: self.rng.gen_range(1..=10) as f64,
            latitude: self.rng.gen_range(1..=10) as f64,
            longitude: self.rng.gen_range(1..=10) as f64,
        }
    }

    fn link_quality(&mut self) -> u32 {
        match self.fixed_link_quality {
            Some(value) => value,
            None => self.rng.gen_range(1..=100),
        }
    }
}
