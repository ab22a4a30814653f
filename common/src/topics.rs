pub const TOPIC_TEMPERATURE_INT: &str = "sensors/temperature_int";
pub const TOPIC_TEMPERATURE_EXT: &str = "sensors/temperature_ext";

pub const TOPIC_TEMPERATURE_DHT: &str = "sensors/temperature_dht";
pub const TOPIC_HUMIDITY_DHT: &str = "sensors/humidity_dht";

pub const TOPIC_TEMPERATURE_BME: &str = "sensors/temperature_bme";
pub const TOPIC_PRESSURE_BME: &str = "sensors/pressure_bme";
pub const TOPIC_HUMIDITY_BME: &str = "sensors/humidity_bme";

pub const TOPIC_WEATHER: &str = "sensors/weather";
pub const TOPIC_STATION_STATUS: &str = "sensors/status";
