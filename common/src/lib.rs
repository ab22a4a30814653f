pub mod calibration;
pub mod config;
pub mod error;
pub mod format;
pub mod guard;
pub mod link;
pub mod ports;
pub mod readings;
pub mod station;
pub mod topics;
pub mod update;

pub use calibration::{
    external_temperature, internal_temperature, DieSensorCalibration, ThermistorCalibration,
};
pub use config::{NetworkConfig, PublishMode, RuntimeConfig, SensorLayout, StationConfig, UpdateConfig};
pub use error::{LoopControl, ReadingError, SensorError, StationError};
pub use guard::ReleaseGuard;
pub use link::{LinkEvent, LinkMonitor};
pub use ports::{AdcReader, EnvironmentSensor, HumiditySensor, Release};
pub use readings::{
    AdcChannel, Bme280Reading, Bme280Text, DhtReading, Publication, SensorKind, StationReadings,
    WeatherPayload,
};
pub use station::{AuxSensors, CycleReport, SensorFault, WeatherStation};
pub use topics::*;
pub use update::{ImageDigest, UpdateDecision, UpdateError};
