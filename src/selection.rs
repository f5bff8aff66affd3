use rand::Rng;
use tracing::info;

use crate::error::{AgentError, AgentResult};
use crate::simulate;
use crate::types::{SensorReading, Station};

/// The sensor the node currently reports for.
#[derive(Debug, Default, Clone)]
pub struct SelectionState {
    selected: Option<SensorReading>,
}

impl SelectionState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self) -> AgentResult<&SensorReading> {
        self.selected.as_ref().ok_or(AgentError::NotSelected)
    }

    /// Looks up `sensor_name` in `station_name`, resamples its value and makes
    /// it the current sensor. On error the previous selection is kept.
    pub fn select<R: Rng + ?Sized>(
        &mut self,
        stations: &mut [Station],
        station_name: &str,
        sensor_name: &str,
        rng: &mut R,
    ) -> AgentResult<SensorReading> {
        let station = stations
            .iter_mut()
            .find(|s| s.name == station_name)
            .ok_or_else(|| AgentError::StationNotFound(station_name.to_string()))?;
        let slot = station
            .sensor_mut(sensor_name)
            .ok_or_else(|| AgentError::SensorNotFound(sensor_name.to_string()))?;

        let reading = simulate::resample(slot, rng);
        *slot = reading.clone();
        info!(
            station = station_name,
            sensor = %reading.name,
            kind = %reading.kind,
            value = reading.value,
            "Sensor selected"
        );
        self.selected = Some(reading.clone());
        Ok(reading)
    }
}
