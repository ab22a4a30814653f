use std::fmt;

use serde::{Deserialize, Serialize};

use crate::{error::SensorError, format::parse_suffixed};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AdcChannel {
    /// On-die temperature sensor.
    Internal,
    /// Thermistor divider input.
    External,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SensorKind {
    Internal,
    External,
    Dht,
    Bme280,
}

impl SensorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Internal => "internal",
            Self::External => "external",
            Self::Dht => "DHT",
            Self::Bme280 => "BME280",
        }
    }
}

impl fmt::Display for SensorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<AdcChannel> for SensorKind {
    fn from(channel: AdcChannel) -> Self {
        match channel {
            AdcChannel::Internal => Self::Internal,
            AdcChannel::External => Self::External,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DhtReading {
    pub temperature_c: f32,
    pub humidity: f32,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Bme280Reading {
    pub temperature_c: f32,
    pub pressure_hpa: f32,
    pub humidity: f32,
}

/// BME280 output from drivers that report text with unit suffixes, such as
/// `"21.3C"`, `"1013.25hPa"` and `"45.2%"`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bme280Text {
    pub temperature: String,
    pub pressure: String,
    pub humidity: String,
}

impl Bme280Text {
    pub fn parse(&self) -> Result<Bme280Reading, SensorError> {
        Ok(Bme280Reading {
            temperature_c: parse_suffixed(SensorKind::Bme280, &self.temperature, "C")?,
            pressure_hpa: parse_suffixed(SensorKind::Bme280, &self.pressure, "hPa")?,
            humidity: parse_suffixed(SensorKind::Bme280, &self.humidity, "%")?,
        })
    }
}

/// Values gathered during one read cycle. `None` means the sensor is not
/// fitted or faulted this cycle.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StationReadings {
    pub temperature_int: Option<f64>,
    pub temperature_ext: Option<f64>,
    pub dht: Option<DhtReading>,
    pub bme280: Option<Bme280Reading>,
}

impl StationReadings {
    pub fn is_empty(&self) -> bool {
        self.temperature_int.is_none()
            && self.temperature_ext.is_none()
            && self.dht.is_none()
            && self.bme280.is_none()
    }
}

/// Single JSON object published in `json` mode. Values are pre-formatted
/// decimal numbers; sensors without a value this cycle are left out.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WeatherPayload {
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub temperature_int: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub temperature_ext: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub temperature_dht: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub humidity_dht: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub temperature_bme: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub pressure_bme: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub humidity_bme: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Publication {
    pub topic: &'static str,
    pub payload: String,
}

impl Publication {
    pub fn new(topic: &'static str, payload: impl Into<String>) -> Self {
        Self {
            topic,
            payload: payload.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn text(temperature: &str, pressure: &str, humidity: &str) -> Bme280Text {
        Bme280Text {
            temperature: temperature.to_string(),
            pressure: pressure.to_string(),
            humidity: humidity.to_string(),
        }
    }

    #[test]
    fn suffixed_bme280_text_parses() {
        assert_eq!(
            text("21.3C", "1013.25hPa", "45.2%").parse(),
            Ok(Bme280Reading {
                temperature_c: 21.3,
                pressure_hpa: 1013.25,
                humidity: 45.2,
            })
        );
    }

    #[test]
    fn one_bad_field_fails_the_reading() {
        assert_eq!(
            text("21.3C", "--hPa", "45.2%").parse(),
            Err(SensorError::Malformed {
                sensor: SensorKind::Bme280,
                raw: "--hPa".to_string(),
            })
        );
    }
}
