//! Simulated environment sensor.
//!
//! Stands in for real hardware: each reading nudges temperature and humidity
//! up by one and wraps them back into their band.

use crate::client::Telemetry;

const TEMPERATURE_MAX: i32 = 40;
const TEMPERATURE_MIN: i32 = 0;
const HUMIDITY_MAX: i32 = 60;
const HUMIDITY_MIN: i32 = 20;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimulatedSensor {
    temperature: i32,
    humidity: i32,
}

impl Default for SimulatedSensor {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedSensor {
    pub fn new() -> Self {
        Self {
            temperature: TEMPERATURE_MIN,
            humidity: HUMIDITY_MIN,
        }
    }

    /// Advance the simulation and return the new reading.
    pub fn next_reading(&mut self) -> Telemetry {
        self.temperature = if self.temperature < TEMPERATURE_MAX {
            self.temperature + 1
        } else {
            TEMPERATURE_MIN
        };
        self.humidity = if self.humidity < HUMIDITY_MAX {
            self.humidity + 1
        } else {
            HUMIDITY_MIN
        };
        Telemetry {
            temperature: self.temperature,
            humidity: self.humidity,
        }
    }
}
