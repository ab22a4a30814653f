use crate::{
    calibration::{round_tenths, DieSensorCalibration, ThermistorCalibration},
    config::{PublishMode, SensorLayout},
    error::{SensorError, StationError},
    format::{ensure_finite, format_hundredths, format_tenths, round_hundredths},
    ports::{AdcReader, EnvironmentSensor, HumiditySensor},
    readings::{
        AdcChannel, Bme280Reading, DhtReading, Publication, SensorKind, StationReadings,
        WeatherPayload,
    },
    topics::*,
};

/// Digital sensors attached for this cycle. Borrowed so the owner keeps
/// the driver handles across cycles.
#[derive(Default)]
pub struct AuxSensors<'a> {
    pub dht: Option<&'a mut dyn HumiditySensor>,
    pub bme280: Option<&'a mut dyn EnvironmentSensor>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SensorFault {
    pub sensor: SensorKind,
    pub error: SensorError,
}

/// Outcome of one read cycle: every value that converted cleanly plus one
/// fault per sensor that did not. Faults never stop the other sensors.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CycleReport {
    pub readings: StationReadings,
    pub faults: Vec<SensorFault>,
}

#[derive(Debug, Clone)]
pub struct WeatherStation {
    layout: SensorLayout,
    die: DieSensorCalibration,
    thermistor: ThermistorCalibration,
}

impl WeatherStation {
    pub fn new(layout: SensorLayout) -> Self {
        Self::with_calibration(
            layout,
            DieSensorCalibration::DEFAULT,
            ThermistorCalibration::DEFAULT,
        )
    }

    pub fn with_calibration(
        layout: SensorLayout,
        die: DieSensorCalibration,
        thermistor: ThermistorCalibration,
    ) -> Self {
        Self {
            layout,
            die,
            thermistor,
        }
    }

    pub fn sample(&self, adc: &mut dyn AdcReader, aux: AuxSensors<'_>) -> CycleReport {
        let mut report = CycleReport::default();

        if self.layout.internal {
            report.readings.temperature_int =
                report.record(SensorKind::Internal, self.read_internal(adc));
        }

        if self.layout.external {
            report.readings.temperature_ext =
                report.record(SensorKind::External, self.read_external(adc));
        }

        if self.layout.dht {
            let reading = match aux.dht {
                Some(sensor) => read_dht(sensor),
                None => Err(SensorError::driver(SensorKind::Dht, "sensor not attached")),
            };
            report.readings.dht = report.record(SensorKind::Dht, reading);
        }

        if self.layout.bme280 {
            let reading = match aux.bme280 {
                Some(sensor) => read_bme280(sensor),
                None => Err(SensorError::driver(SensorKind::Bme280, "sensor not attached")),
            };
            report.readings.bme280 = report.record(SensorKind::Bme280, reading);
        }

        report
    }

    fn read_internal(&self, adc: &mut dyn AdcReader) -> Result<f64, SensorError> {
        let raw = adc.read_raw(AdcChannel::Internal)?;
        Ok(self.die.celsius(raw))
    }

    fn read_external(&self, adc: &mut dyn AdcReader) -> Result<f64, SensorError> {
        let raw = adc.read_raw(AdcChannel::External)?;
        Ok(self.thermistor.celsius(raw)?)
    }
}

fn read_dht(sensor: &mut dyn HumiditySensor) -> Result<DhtReading, SensorError> {
    let reading = sensor.measure()?;
    ensure_finite(SensorKind::Dht, "temperature", reading.temperature_c)?;
    ensure_finite(SensorKind::Dht, "humidity", reading.humidity)?;
    Ok(reading)
}

fn read_bme280(sensor: &mut dyn EnvironmentSensor) -> Result<Bme280Reading, SensorError> {
    let reading = sensor.values()?;
    ensure_finite(SensorKind::Bme280, "temperature", reading.temperature_c)?;
    ensure_finite(SensorKind::Bme280, "pressure", reading.pressure_hpa)?;
    ensure_finite(SensorKind::Bme280, "humidity", reading.humidity)?;
    Ok(reading)
}

impl CycleReport {
    fn record<T>(&mut self, sensor: SensorKind, result: Result<T, SensorError>) -> Option<T> {
        match result {
            Ok(value) => Some(value),
            Err(error) => {
                self.faults.push(SensorFault { sensor, error });
                None
            }
        }
    }

    pub fn payload(&self) -> WeatherPayload {
        let readings = &self.readings;
        let dht = readings.dht.as_ref();
        let bme = readings.bme280.as_ref();

        WeatherPayload {
            temperature_int: readings.temperature_int,
            temperature_ext: readings.temperature_ext,
            temperature_dht: dht.map(|r| round_tenths(f64::from(r.temperature_c))),
            humidity_dht: dht.map(|r| round_tenths(f64::from(r.humidity))),
            temperature_bme: bme.map(|r| round_tenths(f64::from(r.temperature_c))),
            pressure_bme: bme.map(|r| round_hundredths(f64::from(r.pressure_hpa))),
            humidity_bme: bme.map(|r| round_tenths(f64::from(r.humidity))),
        }
    }

    /// Messages for the publishing boundary, in publish order. Empty when
    /// no sensor produced a value.
    pub fn publications(&self, mode: PublishMode) -> Result<Vec<Publication>, StationError> {
        if self.readings.is_empty() {
            return Ok(Vec::new());
        }

        match mode {
            PublishMode::Json => {
                let body = serde_json::to_string(&self.payload())?;
                Ok(vec![Publication::new(TOPIC_WEATHER, body)])
            }
            PublishMode::PerTopic => Ok(self.topic_publications()),
        }
    }

    fn topic_publications(&self) -> Vec<Publication> {
        let readings = &self.readings;
        let mut messages = Vec::with_capacity(7);

        if let Some(value) = readings.temperature_int {
            messages.push(Publication::new(TOPIC_TEMPERATURE_INT, format_tenths(value)));
        }
        if let Some(value) = readings.temperature_ext {
            messages.push(Publication::new(TOPIC_TEMPERATURE_EXT, format_tenths(value)));
        }
        if let Some(dht) = readings.dht {
            messages.push(Publication::new(
                TOPIC_TEMPERATURE_DHT,
                format_tenths(f64::from(dht.temperature_c)),
            ));
            messages.push(Publication::new(
                TOPIC_HUMIDITY_DHT,
                format_tenths(f64::from(dht.humidity)),
            ));
        }
        if let Some(bme) = readings.bme280 {
            messages.push(Publication::new(
                TOPIC_TEMPERATURE_BME,
                format_tenths(f64::from(bme.temperature_c)),
            ));
            messages.push(Publication::new(
                TOPIC_PRESSURE_BME,
                format_hundredths(f64::from(bme.pressure_hpa)),
            ));
            messages.push(Publication::new(
                TOPIC_HUMIDITY_BME,
                format_tenths(f64::from(bme.humidity)),
            ));
        }

        messages
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::error::ReadingError;

    struct FixedAdc {
        internal: Result<u16, SensorError>,
        external: Result<u16, SensorError>,
        reads: Vec<AdcChannel>,
    }

    impl FixedAdc {
        fn new(internal: u16, external: u16) -> Self {
            Self {
                internal: Ok(internal),
                external: Ok(external),
                reads: Vec::new(),
            }
        }
    }

    impl AdcReader for FixedAdc {
        fn read_raw(&mut self, channel: AdcChannel) -> Result<u16, SensorError> {
            self.reads.push(channel);
            match channel {
                AdcChannel::Internal => self.internal.clone(),
                AdcChannel::External => self.external.clone(),
            }
        }
    }

    struct FakeDht(Result<DhtReading, SensorError>);

    impl HumiditySensor for FakeDht {
        fn measure(&mut self) -> Result<DhtReading, SensorError> {
            self.0.clone()
        }
    }

    struct FakeBme(Bme280Reading);

    impl EnvironmentSensor for FakeBme {
        fn values(&mut self) -> Result<Bme280Reading, SensorError> {
            Ok(self.0)
        }
    }

    fn full_layout() -> SensorLayout {
        SensorLayout {
            internal: true,
            external: true,
            dht: true,
            bme280: true,
        }
    }

    #[test]
    fn publishes_internal_and_skips_saturated_thermistor() {
        let station = WeatherStation::new(SensorLayout::default());
        let mut adc = FixedAdc::new(0, u16::MAX);

        let report = station.sample(&mut adc, AuxSensors::default());
        let messages = report.publications(PublishMode::PerTopic).unwrap();

        assert_eq!(
            messages,
            vec![Publication::new(TOPIC_TEMPERATURE_INT, "437.2")]
        );
        assert_eq!(
            report.faults,
            vec![SensorFault {
                sensor: SensorKind::External,
                error: SensorError::Conversion(ReadingError::DivisionByZero { raw: u16::MAX }),
            }]
        );
        assert!(messages
            .iter()
            .all(|m| !m.payload.contains("inf") && !m.payload.contains("nan")));
    }

    #[test]
    fn polls_each_channel_once_per_cycle() {
        let station = WeatherStation::new(SensorLayout::default());
        let mut adc = FixedAdc::new(14_021, 32_768);

        let _ = station.sample(&mut adc, AuxSensors::default());
        let _ = station.sample(&mut adc, AuxSensors::default());

        assert_eq!(
            adc.reads,
            vec![
                AdcChannel::Internal,
                AdcChannel::External,
                AdcChannel::Internal,
                AdcChannel::External,
            ]
        );
    }

    #[test]
    fn adc_failure_is_isolated_to_its_sensor() {
        let station = WeatherStation::new(SensorLayout::default());
        let mut adc = FixedAdc::new(14_021, 32_768);
        adc.internal = Err(SensorError::driver(SensorKind::Internal, "conversion timeout"));

        let report = station.sample(&mut adc, AuxSensors::default());

        assert_eq!(report.readings.temperature_int, None);
        assert_eq!(report.readings.temperature_ext, Some(20.0));
        assert_eq!(report.faults.len(), 1);
        assert_eq!(report.faults[0].sensor, SensorKind::Internal);
    }

    #[test]
    fn per_topic_messages_cover_all_sensors_in_order() {
        let station = WeatherStation::new(full_layout());
        let mut adc = FixedAdc::new(14_021, 32_768);
        let mut dht = FakeDht(Ok(DhtReading {
            temperature_c: 21.0,
            humidity: 55.0,
        }));
        let mut bme = FakeBme(Bme280Reading {
            temperature_c: 19.84,
            pressure_hpa: 1013.254,
            humidity: 61.37,
        });

        let report = station.sample(
            &mut adc,
            AuxSensors {
                dht: Some(&mut dht),
                bme280: Some(&mut bme),
            },
        );
        let messages = report.publications(PublishMode::PerTopic).unwrap();

        assert_eq!(
            messages,
            vec![
                Publication::new(TOPIC_TEMPERATURE_INT, "27.0"),
                Publication::new(TOPIC_TEMPERATURE_EXT, "20.0"),
                Publication::new(TOPIC_TEMPERATURE_DHT, "21.0"),
                Publication::new(TOPIC_HUMIDITY_DHT, "55.0"),
                Publication::new(TOPIC_TEMPERATURE_BME, "19.8"),
                Publication::new(TOPIC_PRESSURE_BME, "1013.25"),
                Publication::new(TOPIC_HUMIDITY_BME, "61.4"),
            ]
        );
        assert!(report.faults.is_empty());
    }

    #[test]
    fn json_payload_uses_fixed_keys_and_omits_faulted_sensors() {
        let layout = SensorLayout {
            bme280: false,
            ..full_layout()
        };
        let station = WeatherStation::new(layout);
        let mut adc = FixedAdc::new(14_021, 0);
        let mut dht = FakeDht(Ok(DhtReading {
            temperature_c: 22.0,
            humidity: 40.0,
        }));

        let report = station.sample(
            &mut adc,
            AuxSensors {
                dht: Some(&mut dht),
                bme280: None,
            },
        );
        let messages = report.publications(PublishMode::Json).unwrap();

        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].topic, TOPIC_WEATHER);
        assert_eq!(
            messages[0].payload,
            r#"{"temperature_int":27.0,"temperature_dht":22.0,"humidity_dht":40.0}"#
        );
        assert!(matches!(
            report.faults[0].error,
            SensorError::Conversion(ReadingError::InvalidReading { raw: 0, .. })
        ));
    }

    #[test]
    fn non_finite_driver_values_become_faults() {
        let layout = SensorLayout {
            internal: false,
            external: false,
            dht: true,
            bme280: false,
        };
        let station = WeatherStation::new(layout);
        let mut adc = FixedAdc::new(0, 0);
        let mut dht = FakeDht(Ok(DhtReading {
            temperature_c: f32::NAN,
            humidity: 40.0,
        }));

        let report = station.sample(
            &mut adc,
            AuxSensors {
                dht: Some(&mut dht),
                bme280: None,
            },
        );

        assert!(adc.reads.is_empty());
        assert_eq!(report.readings, StationReadings::default());
        assert_eq!(
            report.faults[0].error,
            SensorError::NonFinite {
                sensor: SensorKind::Dht,
                quantity: "temperature",
            }
        );
        assert!(report.publications(PublishMode::Json).unwrap().is_empty());
    }

    #[test]
    fn missing_driver_is_reported() {
        let layout = SensorLayout {
            internal: false,
            external: false,
            dht: false,
            bme280: true,
        };
        let station = WeatherStation::new(layout);
        let mut adc = FixedAdc::new(0, 0);

        let report = station.sample(&mut adc, AuxSensors::default());

        assert_eq!(report.faults.len(), 1);
        assert_eq!(report.faults[0].sensor, SensorKind::Bme280);
    }
}
