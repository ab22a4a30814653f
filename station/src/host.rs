use std::{
    io::ErrorKind,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::{anyhow, Context};
use rumqttc::{AsyncClient, Event, Incoming, MqttOptions, QoS};
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use weather_common::{
    update::{file_url, version_url},
    AdcChannel, AdcReader, AuxSensors, Bme280Reading, Bme280Text, DhtReading, EnvironmentSensor,
    HumiditySensor, ImageDigest, LinkEvent, LinkMonitor, LoopControl, Release, ReleaseGuard, RuntimeConfig, SensorError,
    SensorKind, StationConfig, StationError, UpdateConfig, UpdateDecision, WeatherStation,
    TOPIC_STATION_STATUS,
};

struct StationStore {
    runtime_path: PathBuf,
    version_path: PathBuf,
    firmware_dir: PathBuf,
}

enum UpdateOutcome {
    UpToDate,
    Installed { version: String },
}

/// Sweeps plausible samples unless pinned with `STATION_ADC_INTERNAL` /
/// `STATION_ADC_EXTERNAL`.
struct SimulatedAdc {
    internal: Option<u16>,
    external: Option<u16>,
    tick: u64,
}

struct SimulatedDht {
    tick: u64,
}

/// Reports text with unit suffixes, like the common I2C BME280 drivers.
struct SimulatedBme280 {
    tick: u64,
}

struct HostSensors {
    adc: SimulatedAdc,
    dht: SimulatedDht,
    bme280: SimulatedBme280,
}

struct MqttSession {
    client: AsyncClient,
}

struct StatusLed {
    lit: bool,
}

pub async fn run() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let store = StationStore::new();
    let mut runtime = store.load_runtime_config().await.unwrap_or_else(|err| {
        warn!("failed to load runtime config from store: {err:#}");
        RuntimeConfig::default()
    });
    apply_env_overrides(&mut runtime);
    runtime.sanitize();

    if runtime.update.enabled {
        match check_for_update(&store, &runtime.update).await {
            Ok(UpdateOutcome::Installed { version }) => {
                info!("firmware {version} installed; restart required before sampling");
                return Ok(());
            }
            Ok(UpdateOutcome::UpToDate) => info!("firmware is up to date"),
            Err(err) => warn!("{}", StationError::Update(format!("{err:#}"))),
        }
    }

    let station = WeatherStation::new(runtime.station.sensors.clone());
    let mut sensors = HostSensors::from_env();

    let mut mqtt_options = MqttOptions::new(
        runtime.station.client_id.clone(),
        runtime.network.mqtt_host.clone(),
        runtime.network.mqtt_port,
    );
    mqtt_options.set_keep_alive(Duration::from_secs(60));
    if !runtime.network.mqtt_user.is_empty() {
        mqtt_options.set_credentials(
            runtime.network.mqtt_user.clone(),
            runtime.network.mqtt_pass.clone(),
        );
    }

    let (mqtt, eventloop) = AsyncClient::new(mqtt_options, 32);
    let (transport_tx, mut transport_rx) = mpsc::unbounded_channel();
    spawn_mqtt_loop(eventloop, transport_tx);

    let mut session = ReleaseGuard::new((
        MqttSession {
            client: mqtt.clone(),
        },
        StatusLed::on(),
    ));

    mqtt.publish(TOPIC_STATION_STATUS, QoS::AtLeastOnce, true, "online")
        .await
        .context("failed to publish station online status")?;

    info!(
        "station publisher started ({:?} mode, every {}s)",
        runtime.station.publish_mode,
        runtime.station.publish_interval_ms / 1000
    );

    let result = run_cycles(
        &station,
        &mut sensors,
        &mqtt,
        &runtime.station,
        &mut transport_rx,
    )
    .await;

    session.release();

    result.map_err(|err| {
        error!("station stopped: {err}");
        anyhow::Error::from(err)
    })
}

async fn run_cycles(
    station: &WeatherStation,
    sensors: &mut HostSensors,
    mqtt: &AsyncClient,
    config: &StationConfig,
    transport_rx: &mut mpsc::UnboundedReceiver<StationError>,
) -> Result<(), StationError> {
    let mut interval = tokio::time::interval(Duration::from_millis(config.publish_interval_ms));

    loop {
        tokio::select! {
            _ = interval.tick() => {}
            Some(err) = transport_rx.recv() => {
                return Err(err);
            }
            _ = tokio::signal::ctrl_c() => {
                info!("shutdown requested");
                return Ok(());
            }
        }

        match run_cycle(station, sensors, mqtt, config).await {
            Ok(published) => info!("cycle complete ({published} message(s))"),
            Err(err) => match err.control() {
                LoopControl::Continue => warn!("skipping cycle: {err}"),
                LoopControl::Terminate => return Err(err),
            },
        }
    }
}

async fn run_cycle(
    station: &WeatherStation,
    sensors: &mut HostSensors,
    mqtt: &AsyncClient,
    config: &StationConfig,
) -> Result<usize, StationError> {
    let report = sensors.sample(station);

    for fault in &report.faults {
        warn!("skipping {} reading this cycle: {}", fault.sensor, fault.error);
    }

    let messages = report.publications(config.publish_mode)?;
    for message in &messages {
        info!("publish {} -> {}", message.topic, message.payload);
        mqtt.publish(
            message.topic,
            QoS::AtLeastOnce,
            true,
            message.payload.clone(),
        )
        .await
        .map_err(|err| {
            StationError::Transport(format!("publish to `{}` failed: {err}", message.topic))
        })?;
    }

    Ok(messages.len())
}

fn spawn_mqtt_loop(
    mut eventloop: rumqttc::EventLoop,
    transport_tx: mpsc::UnboundedSender<StationError>,
) {
    tokio::spawn(async move {
        let mut link = LinkMonitor::default();
        loop {
            let event = match eventloop.poll().await {
                Ok(Event::Incoming(Incoming::ConnAck(_))) => {
                    info!("mqtt connected");
                    LinkEvent::Connected
                }
                Ok(Event::Incoming(Incoming::Disconnect)) => LinkEvent::Disconnected,
                Ok(_) => LinkEvent::Activity,
                Err(err) => LinkEvent::Error(err.to_string()),
            };

            if let Err(err) = link.observe(event) {
                warn!("station mqtt link lost: {err}");
                let _ = transport_tx.send(err);
                break;
            }
        }
    });
}

fn apply_env_overrides(runtime: &mut RuntimeConfig) {
    if let Ok(host) = std::env::var("MQTT_HOST") {
        runtime.network.mqtt_host = host;
    }
    if let Some(port) = std::env::var("MQTT_PORT")
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
    {
        runtime.network.mqtt_port = port;
    }
    if let Ok(user) = std::env::var("MQTT_USER") {
        runtime.network.mqtt_user = user;
        runtime.network.mqtt_pass = std::env::var("MQTT_PASS").unwrap_or_default();
    }
    if let Some(secs) = std::env::var("STATION_INTERVAL_SECS")
        .ok()
        .and_then(|value| value.parse::<u64>().ok())
    {
        runtime.station.publish_interval_ms = secs.saturating_mul(1000);
    }
    if let Ok(dir) = std::env::var("STATION_UPDATE_DIR") {
        runtime.update.host = dir;
        runtime.update.enabled = true;
    }
}

/// Host builds read the update source from a directory laid out like the
/// HTTP source: `<host>/<project>/version` plus the listed files.
async fn check_for_update(
    store: &StationStore,
    config: &UpdateConfig,
) -> anyhow::Result<UpdateOutcome> {
    let timeout = Duration::from_millis(config.timeout_ms);

    let remote_path = version_url(config);
    let remote = tokio::time::timeout(timeout, tokio::fs::read_to_string(&remote_path))
        .await
        .with_context(|| format!("timed out reading {remote_path}"))?
        .with_context(|| format!("failed to read {remote_path}"))?;

    let local = store.load_version().await?;
    let version = match UpdateDecision::evaluate(local.as_deref(), &remote)? {
        UpdateDecision::UpToDate => return Ok(UpdateOutcome::UpToDate),
        UpdateDecision::Install { version } => version,
    };

    info!(
        "update available: {} -> {version}",
        local.as_deref().unwrap_or("<none>")
    );

    for (index, filename) in config.filenames.iter().enumerate() {
        let source = file_url(config, &version, filename);
        let body = tokio::time::timeout(timeout, tokio::fs::read(&source))
            .await
            .with_context(|| format!("timed out reading {source}"))?
            .with_context(|| format!("failed to read {source}"))?;

        let mut digest = ImageDigest::new();
        digest.update(&body);
        let expected = if index == 0 {
            config.sha256.as_deref()
        } else {
            None
        };
        let digest_hex = digest.verify(expected)?;

        store.install_file(filename, &body).await?;
        info!("installed {filename} ({} bytes, sha256 {digest_hex})", body.len());
    }

    store.save_version(&version).await?;
    Ok(UpdateOutcome::Installed { version })
}

impl StationStore {
    fn new() -> Self {
        let data_dir = std::env::var("STATION_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./.station"));

        Self {
            runtime_path: data_dir.join("runtime.json"),
            version_path: data_dir.join("version"),
            firmware_dir: data_dir.join("firmware"),
        }
    }

    async fn load_runtime_config(&self) -> anyhow::Result<RuntimeConfig> {
        match tokio::fs::read(&self.runtime_path).await {
            Ok(raw) => Ok(serde_json::from_slice::<RuntimeConfig>(&raw)?),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(RuntimeConfig::default()),
            Err(err) => Err(err.into()),
        }
    }

    async fn load_version(&self) -> anyhow::Result<Option<String>> {
        match tokio::fs::read_to_string(&self.version_path).await {
            Ok(version) => Ok(Some(version)),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    async fn save_version(&self, version: &str) -> anyhow::Result<()> {
        write_creating_parent(&self.version_path, version.as_bytes()).await
    }

    async fn install_file(&self, filename: &str, body: &[u8]) -> anyhow::Result<()> {
        let name = Path::new(filename)
            .file_name()
            .ok_or_else(|| anyhow!("invalid update filename `{filename}`"))?;
        write_creating_parent(&self.firmware_dir.join(name), body).await
    }
}

async fn write_creating_parent(path: &Path, body: &[u8]) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(path, body)
        .await
        .with_context(|| format!("failed to write {}", path.display()))
}

impl HostSensors {
    fn from_env() -> Self {
        Self {
            adc: SimulatedAdc {
                internal: env_sample("STATION_ADC_INTERNAL"),
                external: env_sample("STATION_ADC_EXTERNAL"),
                tick: 0,
            },
            dht: SimulatedDht { tick: 0 },
            bme280: SimulatedBme280 { tick: 0 },
        }
    }

    fn sample(&mut self, station: &WeatherStation) -> weather_common::CycleReport {
        station.sample(
            &mut self.adc,
            AuxSensors {
                dht: Some(&mut self.dht),
                bme280: Some(&mut self.bme280),
            },
        )
    }
}

fn env_sample(key: &str) -> Option<u16> {
    let value = std::env::var(key).ok()?;
    match value.parse::<u16>() {
        Ok(raw) => Some(raw),
        Err(err) => {
            warn!("ignoring {key}={value}: {err}");
            None
        }
    }
}

// Hardware integration point: the ESP32 build replaces these with ADC,
// DHT11 and BME280 drivers.
impl AdcReader for SimulatedAdc {
    fn read_raw(&mut self, channel: AdcChannel) -> Result<u16, SensorError> {
        self.tick = self.tick.saturating_add(1);
        let raw = match channel {
            AdcChannel::Internal => self
                .internal
                .unwrap_or(13_990 + (self.tick % 8) as u16 * 10),
            AdcChannel::External => self
                .external
                .unwrap_or(30_000 + (self.tick % 6) as u16 * 150),
        };
        Ok(raw)
    }
}

impl HumiditySensor for SimulatedDht {
    fn measure(&mut self) -> Result<DhtReading, SensorError> {
        self.tick = self.tick.saturating_add(1);
        Ok(DhtReading {
            temperature_c: 20.0 + (self.tick % 8) as f32 * 0.2,
            humidity: 42.0 + (self.tick % 6) as f32 * 0.5,
        })
    }
}

impl SimulatedBme280 {
    fn text(&mut self) -> Result<Bme280Text, SensorError> {
        self.tick = self.tick.saturating_add(1);
        if self.tick % 97 == 0 {
            return Err(SensorError::driver(SensorKind::Bme280, "i2c read timed out"));
        }
        Ok(Bme280Text {
            temperature: format!("{:.2}C", 19.5 + (self.tick % 5) as f32 * 0.3),
            pressure: format!("{:.2}hPa", 1013.25 - (self.tick % 4) as f32 * 0.4),
            humidity: format!("{:.2}%", 48.0 + (self.tick % 3) as f32),
        })
    }
}

impl EnvironmentSensor for SimulatedBme280 {
    fn values(&mut self) -> Result<Bme280Reading, SensorError> {
        self.text()?.parse()
    }
}

impl Release for MqttSession {
    fn release(&mut self) {
        if let Err(err) = self.client.try_disconnect() {
            warn!("mqtt disconnect failed: {err}");
        } else {
            info!("mqtt disconnected");
        }
    }
}

impl StatusLed {
    fn on() -> Self {
        info!("status led on");
        Self { lit: true }
    }
}

impl Release for StatusLed {
    fn release(&mut self) {
        if self.lit {
            self.lit = false;
            info!("status led off");
        }
    }
}

#[cfg(test)]
mod tests {
    use weather_common::{PublishMode, SensorLayout, TOPIC_TEMPERATURE_EXT, TOPIC_TEMPERATURE_INT};

    use super::*;

    fn pinned_sensors(internal: u16, external: u16) -> HostSensors {
        HostSensors {
            adc: SimulatedAdc {
                internal: Some(internal),
                external: Some(external),
                tick: 0,
            },
            dht: SimulatedDht { tick: 0 },
            bme280: SimulatedBme280 { tick: 0 },
        }
    }

    #[test]
    fn pinned_samples_reach_the_topics() {
        let station = WeatherStation::new(SensorLayout::default());
        let mut sensors = pinned_sensors(0, u16::MAX);

        let report = sensors.sample(&station);
        let messages = report.publications(PublishMode::PerTopic).unwrap();

        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].topic, TOPIC_TEMPERATURE_INT);
        assert_eq!(messages[0].payload, "437.2");
        assert!(messages.iter().all(|m| m.topic != TOPIC_TEMPERATURE_EXT));
        assert_eq!(report.faults.len(), 1);
    }

    #[test]
    fn simulated_sweep_stays_inside_the_rails() {
        let mut adc = SimulatedAdc {
            internal: None,
            external: None,
            tick: 0,
        };
        for _ in 0..64 {
            let internal = adc.read_raw(AdcChannel::Internal).unwrap();
            let external = adc.read_raw(AdcChannel::External).unwrap();
            assert!((13_990..14_070).contains(&internal));
            assert!((30_000..31_000).contains(&external));
        }
    }

    #[test]
    fn simulated_bme280_reports_suffixed_text() {
        let mut bme = SimulatedBme280 { tick: 0 };
        let text = bme.text().unwrap();
        assert_eq!(text.temperature, "19.80C");
        assert_eq!(text.humidity, "49.00%");
        assert!(text.pressure.ends_with("hPa"));

        let mut bme = SimulatedBme280 { tick: 0 };
        let reading = bme.values().unwrap();
        assert_eq!(reading.temperature_c, 19.8);
        assert_eq!(reading.humidity, 49.0);
        assert!((reading.pressure_hpa - 1012.85).abs() < 0.01);
    }

    #[tokio::test]
    async fn transport_failure_ends_the_cycle_loop() {
        let station = WeatherStation::new(SensorLayout::default());
        let mut sensors = pinned_sensors(14_021, 32_768);
        let (mqtt, _eventloop) =
            AsyncClient::new(MqttOptions::new("station-test", "localhost", 1883), 32);
        let (transport_tx, mut transport_rx) = mpsc::unbounded_channel();
        transport_tx
            .send(StationError::Transport("broker closed the connection".to_string()))
            .unwrap();
        let config = StationConfig {
            publish_interval_ms: 3_600_000,
            ..StationConfig::default()
        };

        let result = tokio::time::timeout(
            Duration::from_secs(5),
            run_cycles(&station, &mut sensors, &mqtt, &config, &mut transport_rx),
        )
        .await
        .expect("cycle loop kept running after a transport failure");

        assert!(matches!(
            result,
            Err(StationError::Transport(ref message)) if message == "broker closed the connection"
        ));
    }

    #[test]
    fn led_turns_off_once() {
        let mut led = StatusLed::on();
        led.release();
        assert!(!led.lit);
        led.release();
        assert!(!led.lit);
    }

    #[tokio::test]
    async fn update_installs_new_version_then_reports_up_to_date() {
        let root = std::env::temp_dir().join(format!("station-update-{}", std::process::id()));
        let source = root.join("source");
        tokio::fs::create_dir_all(source.join("outside")).await.unwrap();
        tokio::fs::write(source.join("outside/version"), "2\n").await.unwrap();
        tokio::fs::write(source.join("outside/firmware.bin"), b"abc").await.unwrap();

        let data = root.join("data");
        let store = StationStore {
            runtime_path: data.join("runtime.json"),
            version_path: data.join("version"),
            firmware_dir: data.join("firmware"),
        };
        let config = UpdateConfig {
            enabled: true,
            host: source.display().to_string(),
            project: "outside".to_string(),
            sha256: Some(
                "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad".to_string(),
            ),
            ..UpdateConfig::default()
        };

        let first = check_for_update(&store, &config).await.unwrap();
        assert!(matches!(first, UpdateOutcome::Installed { ref version } if version == "2"));
        assert_eq!(
            tokio::fs::read(data.join("firmware/firmware.bin")).await.unwrap(),
            b"abc"
        );

        let second = check_for_update(&store, &config).await.unwrap();
        assert!(matches!(second, UpdateOutcome::UpToDate));

        let _ = tokio::fs::remove_dir_all(&root).await;
    }
}
