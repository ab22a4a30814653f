use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PublishMode {
    /// One decimal string per sensor topic.
    PerTopic,
    /// One JSON object on the weather topic.
    Json,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SensorLayout {
    pub internal: bool,
    pub external: bool,
    pub dht: bool,
    pub bme280: bool,
}

impl Default for SensorLayout {
    fn default() -> Self {
        Self {
            internal: true,
            external: true,
            dht: false,
            bme280: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StationConfig {
    pub publish_interval_ms: u64,
    pub publish_mode: PublishMode,
    pub sensors: SensorLayout,
    pub client_id: String,
}

impl Default for StationConfig {
    fn default() -> Self {
        Self {
            publish_interval_ms: 30_000,
            publish_mode: PublishMode::PerTopic,
            sensors: SensorLayout::default(),
            client_id: "test_mqtt_pico".to_string(),
        }
    }
}

impl StationConfig {
    /// Layout of the later station builds: all four sensors, JSON payload,
    /// five-minute interval.
    pub fn full_station() -> Self {
        Self {
            publish_interval_ms: 300_000,
            publish_mode: PublishMode::Json,
            sensors: SensorLayout {
                internal: true,
                external: true,
                dht: true,
                bme280: true,
            },
            ..Self::default()
        }
    }

    pub fn sanitize(&mut self) {
        self.publish_interval_ms = self.publish_interval_ms.clamp(1_000, 3_600_000);
        if self.client_id.trim().is_empty() {
            self.client_id = Self::default().client_id;
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    pub wifi_ssid: String,
    pub wifi_pass: String,
    pub mqtt_host: String,
    pub mqtt_port: u16,
    pub mqtt_user: String,
    pub mqtt_pass: String,
    /// `None` keeps retrying the WiFi join forever.
    #[serde(default)]
    pub wifi_connect_timeout_ms: Option<u64>,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            wifi_ssid: String::new(),
            wifi_pass: String::new(),
            mqtt_host: "raspi".to_string(),
            mqtt_port: 1883,
            mqtt_user: String::new(),
            mqtt_pass: String::new(),
            wifi_connect_timeout_ms: None,
        }
    }
}

impl NetworkConfig {
    pub fn sanitize(&mut self) {
        if self.mqtt_port == 0 {
            self.mqtt_port = 1883;
        }
        if self.mqtt_host.trim().is_empty() {
            self.mqtt_host = Self::default().mqtt_host;
        }
        if self.wifi_connect_timeout_ms == Some(0) {
            self.wifi_connect_timeout_ms = None;
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UpdateConfig {
    pub enabled: bool,
    pub host: String,
    pub project: String,
    pub filenames: Vec<String>,
    pub use_version_prefix: bool,
    pub timeout_ms: u64,
    pub hard_reset: bool,
    /// Expected digest of the downloaded image, lowercase hex.
    #[serde(default)]
    pub sha256: Option<String>,
}

impl Default for UpdateConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            host: String::new(),
            project: String::new(),
            filenames: vec!["firmware.bin".to_string()],
            use_version_prefix: false,
            timeout_ms: 5_000,
            hard_reset: true,
            sha256: None,
        }
    }
}

impl UpdateConfig {
    pub fn sanitize(&mut self) {
        self.timeout_ms = self.timeout_ms.clamp(1_000, 120_000);
        self.filenames.retain(|name| !name.trim().is_empty());
        if let Some(sha) = self.sha256.as_mut() {
            *sha = sha.trim().to_ascii_lowercase();
        }
        if self.host.trim().is_empty() || self.filenames.is_empty() {
            self.enabled = false;
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default)]
    pub station: StationConfig,
    #[serde(default)]
    pub network: NetworkConfig,
    #[serde(default)]
    pub update: UpdateConfig,
}

impl RuntimeConfig {
    pub fn sanitize(&mut self) {
        self.station.sanitize();
        self.network.sanitize();
        self.update.sanitize();
    }
}
