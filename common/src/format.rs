use crate::{calibration::round_tenths, error::SensorError, readings::SensorKind};

pub fn round_hundredths(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Topic payload for temperatures and humidity.
pub fn format_tenths(value: f64) -> String {
    format!("{:.1}", round_tenths(value))
}

/// Topic payload for pressure, which keeps the driver's two decimals.
pub fn format_hundredths(value: f64) -> String {
    format!("{:.2}", round_hundredths(value))
}

/// Parses a driver value reported with a unit suffix (`"1013.25hPa"`).
/// A bare number is accepted as well.
pub fn parse_suffixed(sensor: SensorKind, raw: &str, suffix: &str) -> Result<f32, SensorError> {
    let trimmed = raw.trim();
    let numeric = trimmed.strip_suffix(suffix).unwrap_or(trimmed).trim_end();

    match numeric.parse::<f32>() {
        Ok(value) if value.is_finite() => Ok(value),
        _ => Err(SensorError::Malformed {
            sensor,
            raw: raw.to_string(),
        }),
    }
}

pub(crate) fn ensure_finite(
    sensor: SensorKind,
    quantity: &'static str,
    value: f32,
) -> Result<f32, SensorError> {
    if value.is_finite() {
        Ok(value)
    } else {
        Err(SensorError::NonFinite { sensor, quantity })
    }
}
