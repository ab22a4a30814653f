use crate::error::ReadingError;

/// Full-scale value of a 16-bit ADC sample.
pub const ADC_FULL_SCALE: u16 = u16::MAX;

/// Reference voltage of the ADC and of the thermistor divider.
pub const SUPPLY_VOLTS: f64 = 3.3;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DieSensorCalibration {
    pub supply_volts: f64,
    pub reference_volts: f64,
    pub reference_celsius: f64,
    pub volts_per_degree: f64,
}

impl DieSensorCalibration {
    /// Published linear fit for the on-die sensor: 0.706 V at 27 °C, -1.721 mV/°C.
    pub const DEFAULT: Self = Self {
        supply_volts: SUPPLY_VOLTS,
        reference_volts: 0.706,
        reference_celsius: 27.0,
        volts_per_degree: 0.001721,
    };

    pub fn celsius(&self, raw: u16) -> f64 {
        let volts = adc_to_volts(raw, self.supply_volts);
        let celsius = self.reference_celsius - (volts - self.reference_volts) / self.volts_per_degree;
        round_tenths(celsius)
    }
}

impl Default for DieSensorCalibration {
    fn default() -> Self {
        Self::DEFAULT
    }
}

/// Thermistor on the low side of a divider fed from `supply_volts` through
/// `divider_ohms`, converted with the Steinhart-Hart equation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ThermistorCalibration {
    pub supply_volts: f64,
    pub divider_ohms: f64,
    pub a: f64,
    pub b: f64,
    pub c: f64,
    /// Empirical correction subtracted from the converted temperature.
    pub offset_celsius: f64,
}

impl ThermistorCalibration {
    pub const DEFAULT: Self = Self {
        supply_volts: SUPPLY_VOLTS,
        divider_ohms: 10_000.0,
        a: 0.001129148,
        b: 0.000234125,
        c: 0.0000000876741,
        offset_celsius: 5.0,
    };

    pub fn resistance(&self, raw: u16) -> Result<f64, ReadingError> {
        let volts = adc_to_volts(raw, self.supply_volts);
        let divisor = self.supply_volts - volts;

        if raw == ADC_FULL_SCALE || divisor == 0.0 {
            return Err(ReadingError::DivisionByZero { raw });
        }

        let ohms = (volts * self.divider_ohms) / divisor;
        if !ohms.is_finite() || ohms <= 0.0 {
            return Err(ReadingError::InvalidReading {
                raw,
                reason: "divider resistance is not positive",
            });
        }

        Ok(ohms)
    }

    /// Unrounded Steinhart-Hart conversion, offset included.
    pub fn celsius_for_resistance(&self, ohms: f64) -> f64 {
        let ln_r = ohms.ln();
        let kelvin = 1.0 / (self.a + self.b * ln_r + self.c * ln_r.powi(3));
        kelvin - 273.15 - self.offset_celsius
    }

    pub fn celsius(&self, raw: u16) -> Result<f64, ReadingError> {
        let ohms = self.resistance(raw)?;
        let celsius = self.celsius_for_resistance(ohms);

        if !celsius.is_finite() {
            return Err(ReadingError::InvalidReading {
                raw,
                reason: "steinhart-hart result is not finite",
            });
        }

        Ok(round_tenths(celsius))
    }
}

impl Default for ThermistorCalibration {
    fn default() -> Self {
        Self::DEFAULT
    }
}

pub fn adc_to_volts(raw: u16, supply_volts: f64) -> f64 {
    (supply_volts / f64::from(ADC_FULL_SCALE)) * f64::from(raw)
}

pub fn round_tenths(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}

pub fn internal_temperature(raw: u16) -> f64 {
    DieSensorCalibration::DEFAULT.celsius(raw)
}

pub fn external_temperature(raw: u16) -> Result<f64, ReadingError> {
    ThermistorCalibration::DEFAULT.celsius(raw)
}
