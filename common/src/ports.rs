//! Boundaries between the read cycle and the hardware or transport behind it.
//!
//! Implementations live in the station binary (simulated on host, esp-idf
//! drivers on ESP32) and in test modules.

use crate::{
    error::SensorError,
    readings::{AdcChannel, Bme280Reading, DhtReading},
};

/// Source of raw 16-bit samples. Must be polled right before each
/// conversion; implementations must not return cached samples.
pub trait AdcReader {
    fn read_raw(&mut self, channel: AdcChannel) -> Result<u16, SensorError>;
}

/// Digital humidity/temperature sensor (DHT11/DHT22). Values are already
/// calibrated by the driver.
pub trait HumiditySensor {
    fn measure(&mut self) -> Result<DhtReading, SensorError>;
}

/// Combined temperature/pressure/humidity sensor (BME280).
pub trait EnvironmentSensor {
    fn values(&mut self) -> Result<Bme280Reading, SensorError>;
}

/// Resource that must be put back into a safe state when the station stops:
/// a transport to disconnect, an indicator pin to drive low.
pub trait Release {
    fn release(&mut self);
}
