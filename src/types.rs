use serde::{Deserialize, Serialize};
use std::fmt;

/// The five measurements every weather station carries.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum SensorKind {
    Temperature,
    Humidity,
    Rain,
    WindDirection,
    WindIntensity,
}

impl SensorKind {
    pub const ALL: [SensorKind; 5] = [
        SensorKind::Temperature,
        SensorKind::Humidity,
        SensorKind::Rain,
        SensorKind::WindDirection,
        SensorKind::WindIntensity,
    ];

    /// Name used on the wire (`sensorType`).
    pub fn as_str(&self) -> &'static str {
        match self {
            SensorKind::Temperature => "temperature",
            SensorKind::Humidity => "humidity",
            SensorKind::Rain => "rain",
            SensorKind::WindDirection => "windDirection",
            SensorKind::WindIntensity => "windIntensity",
        }
    }

    /// Exclusive upper bound of the simulated range; the lower bound is 0.
    pub fn max_value(&self) -> f32 {
        match self {
            SensorKind::Temperature => 100.0,
            SensorKind::Humidity => 100.0,
            SensorKind::Rain => 50.0,
            SensorKind::WindDirection => 360.0,
            SensorKind::WindIntensity => 100.0,
        }
    }

    pub fn unit(&self) -> &'static str {
        match self {
            SensorKind::Temperature => "C",
            SensorKind::Humidity => "perc",
            SensorKind::Rain => "mm / h",
            SensorKind::WindDirection => "degrees",
            SensorKind::WindIntensity => "m/s",
        }
    }
}

impl fmt::Display for SensorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct SensorReading {
    pub id: String,
    pub value: f32,
    pub name: String,
    pub kind: SensorKind,
}

impl SensorReading {
    pub fn new(id: impl Into<String>, name: impl Into<String>, kind: SensorKind, value: f32) -> Self {
        Self {
            id: id.into(),
            value,
            name: name.into(),
            kind,
        }
    }

    /// Same sensor identity, new value.
    pub fn with_value(&self, value: f32) -> Self {
        Self {
            value,
            ..self.clone()
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Station {
    pub name: String,
    pub sensors: [SensorReading; 5],
}

impl Station {
    #[cfg(test)]
    pub fn sensor(&self, name: &str) -> Option<&SensorReading> {
        self.sensors.iter().find(|s| s.name == name)
    }

    pub fn sensor_mut(&mut self, name: &str) -> Option<&mut SensorReading> {
        self.sensors.iter_mut().find(|s| s.name == name)
    }
}

/// Delivery assurance requested for a publish or subscribe.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum QoS {
    #[default]
    AtMostOnce = 0,
    AtLeastOnce = 1,
    ExactlyOnce = 2,
}

impl QoS {
    /// Unknown levels fall back to QoS 0.
    pub fn from_level(level: u8) -> Self {
        match level {
            1 => QoS::AtLeastOnce,
            2 => QoS::ExactlyOnce,
            _ => QoS::AtMostOnce,
        }
    }

    pub fn level(&self) -> u8 {
        *self as u8
    }
}

/// Builds the two stations deployed with the node. Values start at zero and
/// are sampled on selection.
pub fn default_stations() -> [Station; 2] {
    [
        station(
            "Charlie",
            [
                ("2a92abd7-6d09-11ea-b89f-8f444e8fb0fc", "temperatureCharlie"),
                ("2a92abd8-6d09-11ea-b89f-8f444e8fb0fc", "humidityCharlie"),
                ("2a92abdb-6d09-11ea-b89f-8f444e8fb0fc", "rainHeightCharlie"),
                ("2a92abd9-6d09-11ea-b89f-8f444e8fb0fc", "windDirectionCharlie"),
                ("2a92abda-6d09-11ea-b89f-8f444e8fb0fc", "windIntensityCharlie"),
            ],
        ),
        station(
            "Tango",
            [
                ("2a92abd2-6d09-11ea-b89f-8f444e8fb0fc", "temperatureTango"),
                ("2a92abd3-6d09-11ea-b89f-8f444e8fb0fc", "humidityTango"),
                ("2a92abd6-6d09-11ea-b89f-8f444e8fb0fc", "rainHeightTango"),
                ("2a92abd4-6d09-11ea-b89f-8f444e8fb0fc", "windDirectionTango"),
                ("2a92abd5-6d09-11ea-b89f-8f444e8fb0fc", "windIntensityTango"),
            ],
        ),
    ]
}

// Sensor identities are listed in `SensorKind::ALL` order.
fn station(name: &str, ids: [(&str, &str); 5]) -> Station {
    let sensors = std::array::from_fn(|i| {
        let (id, sensor_name) = ids[i];
        SensorReading::new(id, sensor_name, SensorKind::ALL[i], 0.0)
    });
    Station {
        name: name.to_string(),
        sensors,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stations_carry_one_sensor_per_kind() {
        for station in default_stations() {
            for kind in SensorKind::ALL {
                assert_eq!(
                    station.sensors.iter().filter(|s| s.kind == kind).count(),
                    1,
                    "{} should have exactly one {} sensor",
                    station.name,
                    kind
                );
            }
        }
    }

    #[test]
    fn sensor_lookup_is_by_exact_name() {
        let [charlie, _] = default_stations();
        assert_eq!(
            charlie.sensor("rainHeightCharlie").map(|s| s.kind),
            Some(SensorKind::Rain)
        );
        assert!(charlie.sensor("rainheightcharlie").is_none());
    }

    #[test]
    fn unknown_qos_levels_fall_back_to_zero() {
        assert_eq!(QoS::from_level(1), QoS::AtLeastOnce);
        assert_eq!(QoS::from_level(2).level(), 2);
        assert_eq!(QoS::from_level(7), QoS::AtMostOnce);
    }
}
