use std::{
    sync::{
        mpsc::{self, Receiver, TryRecvError},
        Arc, Mutex,
    },
    thread,
    time::{Duration, Instant},
};

use anyhow::{anyhow, Context};
use bme280::i2c::BME280;
use dht_sensor::dht11;
use embedded_svc::{
    http::{client::Client as HttpClient, Headers, Method, Status},
    io::Read,
    mqtt::client::{EventPayload, QoS},
    wifi::{AuthMethod, ClientConfiguration, Configuration},
};
use esp_idf_hal::{
    adc::{
        attenuation::DB_11,
        oneshot::{config::AdcChannelConfig, AdcChannelDriver, AdcDriver},
    },
    delay::Ets,
    gpio::{AnyIOPin, AnyOutputPin, Gpio34, Gpio35, IOPin, InputOutput, Output, OutputPin, PinDriver, Pull},
    i2c::{I2cConfig, I2cDriver},
    prelude::*,
};
use esp_idf_svc::{
    eventloop::EspSystemEventLoop,
    hal::{adc::ADC1, modem::Modem, prelude::Peripherals},
    http::client::{Configuration as HttpClientConfiguration, EspHttpConnection},
    log::EspLogger,
    mqtt::client::{EspMqttClient, MqttClientConfiguration},
    nvs::{EspDefaultNvsPartition, EspNvs},
    ota::EspOta,
    wifi::{BlockingWifi, EspWifi},
};
use log::{error, info, warn};

use weather_common::{
    config::NetworkConfig,
    update::{file_url, version_url},
    AdcChannel, AdcReader, AuxSensors, Bme280Reading, DhtReading, EnvironmentSensor,
    HumiditySensor, ImageDigest, LinkEvent, LinkMonitor, LoopControl, Release, ReleaseGuard, RuntimeConfig, SensorError,
    SensorKind, StationConfig, StationError, UpdateConfig, UpdateDecision, WeatherStation, TOPIC_STATION_STATUS,
};

const NVS_NAMESPACE: &str = "station";
const NVS_RUNTIME_KEY: &str = "runtime_json";
const NVS_VERSION_KEY: &str = "fw_version";

const DHT11_PIN: i32 = 16;
const MAX_VERSION_BYTES: usize = 64;
const OTA_CHUNK_SIZE: usize = 4096;
const WIFI_RETRY_DELAY_MS: u64 = 1_000;

type SharedAdc = Arc<AdcDriver<'static, ADC1>>;

/// Both conversion inputs sit on ADC1. The ESP32 has no die sensor on the
/// ADC, so the internal channel is an analog sensor with the same linear
/// fit wired to GPIO34; the thermistor divider is on GPIO35.
struct EspAdc {
    internal: AdcChannelDriver<'static, Gpio34, SharedAdc>,
    external: AdcChannelDriver<'static, Gpio35, SharedAdc>,
}

struct EspDht {
    pin: PinDriver<'static, AnyIOPin, InputOutput>,
    delay: Ets,
}

struct EspBme280 {
    sensor: BME280<I2cDriver<'static>>,
    delay: Ets,
}

struct EspSensors {
    adc: EspAdc,
    dht: Option<EspDht>,
    bme280: Option<EspBme280>,
}

struct MqttSession {
    client: Option<EspMqttClient<'static>>,
}

struct StatusLed {
    pin: PinDriver<'static, AnyOutputPin, Output>,
}

#[derive(Clone)]
struct NvsStore {
    partition: EspDefaultNvsPartition,
    lock: Arc<Mutex<()>>,
}

pub fn run() -> anyhow::Result<()> {
    esp_idf_svc::sys::link_patches();
    EspLogger::initialize_default();

    let sys_loop = EspSystemEventLoop::take()?;
    let nvs_partition = EspDefaultNvsPartition::take()?;
    let nvs_store = NvsStore {
        partition: nvs_partition.clone(),
        lock: Arc::new(Mutex::new(())),
    };

    let mut runtime = nvs_store.load_runtime_config().unwrap_or_else(|err| {
        warn!("failed to load runtime config from NVS: {err:#}");
        board_defaults()
    });
    ensure_wifi_defaults(&mut runtime);
    runtime.sanitize();

    let Peripherals {
        modem,
        pins,
        adc1,
        i2c0,
        ..
    } = Peripherals::take()?;

    let _wifi = connect_wifi(modem, sys_loop, nvs_partition, &runtime.network)?;
    info!("wifi connected");

    if let Ok(mut ota) = EspOta::new() {
        if let Err(err) = ota.mark_running_slot_valid() {
            warn!("failed to mark running OTA slot valid: {err:?}");
        }
    }

    if runtime.update.enabled {
        if let Err(err) = check_for_update(&nvs_store, &runtime.update) {
            warn!("{}", StationError::Update(format!("{err:#}")));
        }
    }

    let adc = Arc::new(AdcDriver::new(adc1)?);
    let channel_config = AdcChannelConfig {
        attenuation: DB_11,
        ..Default::default()
    };
    let layout = &runtime.station.sensors;
    let mut sensors = EspSensors {
        adc: EspAdc {
            internal: AdcChannelDriver::new(adc.clone(), pins.gpio34, &channel_config)?,
            external: AdcChannelDriver::new(adc, pins.gpio35, &channel_config)?,
        },
        dht: if layout.dht {
            Some(EspDht::new(pins.gpio16.downgrade())?)
        } else {
            None
        },
        bme280: if layout.bme280 {
            let i2c = I2cDriver::new(
                i2c0,
                pins.gpio21,
                pins.gpio22,
                &I2cConfig::new().baudrate(100.kHz().into()),
            )?;
            EspBme280::new(i2c)
        } else {
            None
        },
    };

    let station = WeatherStation::new(runtime.station.sensors.clone());
    let (client, transport_rx) = create_mqtt_client(&runtime)?;

    let mut session = ReleaseGuard::new((
        MqttSession {
            client: Some(client),
        },
        StatusLed::new(pins.gpio2.downgrade_output())?,
    ));

    session
        .0
        .publish(TOPIC_STATION_STATUS, "online")
        .context("failed to publish station online status")?;

    let interval_secs = (runtime.station.publish_interval_ms / 1000).max(1);
    let result = loop {
        match run_cycle(&station, &mut sensors, &mut session.0, &runtime) {
            Ok(published) => info!("cycle complete ({published} message(s))"),
            Err(err) => match err.control() {
                LoopControl::Continue => warn!("skipping cycle: {err}"),
                LoopControl::Terminate => break Err(err),
            },
        }

        if let Err(err) = sleep_watching_transport(interval_secs, &transport_rx) {
            break Err(err);
        }
    };

    session.release();

    result.map_err(|err| {
        error!("station stopped: {err}");
        anyhow::Error::from(err)
    })
}

fn run_cycle(
    station: &WeatherStation,
    sensors: &mut EspSensors,
    mqtt: &mut MqttSession,
    runtime: &RuntimeConfig,
) -> Result<usize, StationError> {
    let report = station.sample(
        &mut sensors.adc,
        AuxSensors {
            dht: sensors
                .dht
                .as_mut()
                .map(|sensor| sensor as &mut dyn HumiditySensor),
            bme280: sensors
                .bme280
                .as_mut()
                .map(|sensor| sensor as &mut dyn EnvironmentSensor),
        },
    );

    for fault in &report.faults {
        warn!("skipping {} reading this cycle: {}", fault.sensor, fault.error);
    }

    let messages = report.publications(runtime.station.publish_mode)?;
    for message in &messages {
        info!("publish {} -> {}", message.topic, message.payload);
        mqtt.publish(message.topic, &message.payload)?;
    }

    Ok(messages.len())
}

fn sleep_watching_transport(
    seconds: u64,
    transport_rx: &Receiver<StationError>,
) -> Result<(), StationError> {
    for _ in 0..seconds {
        match transport_rx.try_recv() {
            Ok(err) => return Err(err),
            Err(TryRecvError::Disconnected) => {
                return Err(StationError::Transport(
                    "mqtt connection thread stopped".to_string(),
                ))
            }
            Err(TryRecvError::Empty) => {}
        }
        thread::sleep(Duration::from_secs(1));
    }
    Ok(())
}

impl MqttSession {
    fn publish(&mut self, topic: &str, payload: &str) -> Result<(), StationError> {
        let client = self
            .client
            .as_mut()
            .ok_or_else(|| StationError::Transport("mqtt session already closed".to_string()))?;

        client
            .publish(topic, QoS::AtLeastOnce, true, payload.as_bytes())
            .map(|_| ())
            .map_err(|err| StationError::Transport(format!("publish to `{topic}` failed: {err:?}")))
    }
}

impl Release for MqttSession {
    fn release(&mut self) {
        // Dropping the client stops the esp-mqtt task and closes the socket.
        if self.client.take().is_some() {
            info!("mqtt disconnected");
        }
    }
}

impl StatusLed {
    fn new(pin: AnyOutputPin) -> anyhow::Result<Self> {
        let mut pin = PinDriver::output(pin)?;
        pin.set_high()?;
        Ok(Self { pin })
    }
}

impl Release for StatusLed {
    fn release(&mut self) {
        if let Err(err) = self.pin.set_low() {
            warn!("failed to turn status led off: {err:?}");
        }
    }
}

/// Widens a 12-bit conversion to the 16-bit range the calibration expects.
fn widen_to_u16(raw12: u16) -> u16 {
    let raw12 = raw12 & 0x0FFF;
    (raw12 << 4) | (raw12 >> 8)
}

impl AdcReader for EspAdc {
    fn read_raw(&mut self, channel: AdcChannel) -> Result<u16, SensorError> {
        let raw = match channel {
            AdcChannel::Internal => self.internal.read_raw(),
            AdcChannel::External => self.external.read_raw(),
        }
        .map_err(|err| SensorError::driver(channel.into(), format!("{err:?}")))?;

        Ok(widen_to_u16(raw))
    }
}

impl EspDht {
    fn new(pin: AnyIOPin) -> anyhow::Result<Self> {
        let mut pin = PinDriver::input_output_od(pin)?;
        pin.set_pull(Pull::Up)?;
        pin.set_high()?;
        Ok(Self { pin, delay: Ets })
    }
}

impl HumiditySensor for EspDht {
    fn measure(&mut self) -> Result<DhtReading, SensorError> {
        self.pin
            .set_high()
            .map_err(|err| SensorError::driver(SensorKind::Dht, format!("{err:?}")))?;

        let reading = dht11::blocking::read(&mut self.delay, &mut self.pin).map_err(|err| {
            SensorError::driver(
                SensorKind::Dht,
                format!("read on GPIO{DHT11_PIN} failed: {err:?}"),
            )
        })?;

        Ok(DhtReading {
            temperature_c: f32::from(reading.temperature),
            humidity: f32::from(reading.relative_humidity),
        })
    }
}

impl EspBme280 {
    fn new(i2c: I2cDriver<'static>) -> Option<Self> {
        let mut delay = Ets;
        let mut sensor = BME280::new_primary(i2c);
        match sensor.init(&mut delay) {
            Ok(()) => Some(Self { sensor, delay }),
            Err(err) => {
                warn!("BME280 init failed, sensor disabled: {err:?}");
                None
            }
        }
    }
}

impl EnvironmentSensor for EspBme280 {
    fn values(&mut self) -> Result<Bme280Reading, SensorError> {
        let measurements = self
            .sensor
            .measure(&mut self.delay)
            .map_err(|err| SensorError::driver(SensorKind::Bme280, format!("{err:?}")))?;

        Ok(Bme280Reading {
            temperature_c: measurements.temperature,
            pressure_hpa: measurements.pressure / 100.0,
            humidity: measurements.humidity,
        })
    }
}

/// The board carries every sensor, so an unconfigured node starts with the
/// full JSON profile.
fn board_defaults() -> RuntimeConfig {
    RuntimeConfig {
        station: StationConfig::full_station(),
        ..RuntimeConfig::default()
    }
}

fn ensure_wifi_defaults(runtime: &mut RuntimeConfig) {
    if runtime.network.wifi_ssid.is_empty() {
        runtime.network.wifi_ssid = option_env!("WIFI_SSID").unwrap_or("CHANGE_ME").to_string();
    }

    if runtime.network.wifi_pass.is_empty() {
        runtime.network.wifi_pass = option_env!("WIFI_PASS").unwrap_or("CHANGE_ME").to_string();
    }
}

/// Joins the configured network. Without `wifi_connect_timeout_ms` this
/// retries forever, once per second.
fn connect_wifi(
    modem: Modem,
    sys_loop: EspSystemEventLoop,
    nvs_partition: EspDefaultNvsPartition,
    network: &NetworkConfig,
) -> Result<EspWifi<'static>, StationError> {
    let connectivity = |err: esp_idf_svc::sys::EspError| StationError::Connectivity(format!("{err:?}"));

    let mut esp_wifi =
        EspWifi::new(modem, sys_loop.clone(), Some(nvs_partition)).map_err(connectivity)?;
    let mut wifi = BlockingWifi::wrap(&mut esp_wifi, sys_loop).map_err(connectivity)?;

    let auth_method = if network.wifi_pass.is_empty() {
        AuthMethod::None
    } else {
        AuthMethod::WPAWPA2Personal
    };

    wifi.set_configuration(&Configuration::Client(ClientConfiguration {
        ssid: network
            .wifi_ssid
            .as_str()
            .try_into()
            .map_err(|_| StationError::Connectivity("wifi ssid too long".to_string()))?,
        password: network
            .wifi_pass
            .as_str()
            .try_into()
            .map_err(|_| StationError::Connectivity("wifi password too long".to_string()))?,
        auth_method,
        ..Default::default()
    }))
    .map_err(connectivity)?;

    wifi.start().map_err(connectivity)?;
    info!("wifi started, connecting to `{}`", network.wifi_ssid);

    let deadline = network
        .wifi_connect_timeout_ms
        .map(|ms| Instant::now() + Duration::from_millis(ms));

    loop {
        match wifi.connect().and_then(|()| wifi.wait_netif_up()) {
            Ok(()) => break,
            Err(err) => {
                if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
                    let _ = wifi.stop();
                    return Err(StationError::Connectivity(format!(
                        "no connection to `{}` within {}ms: {err:?}",
                        network.wifi_ssid,
                        network.wifi_connect_timeout_ms.unwrap_or_default()
                    )));
                }
                info!("waiting for connection... ({err:?})");
                let _ = wifi.disconnect();
                thread::sleep(Duration::from_millis(WIFI_RETRY_DELAY_MS));
            }
        }
    }

    drop(wifi);
    Ok(esp_wifi)
}

fn check_for_update(nvs_store: &NvsStore, config: &UpdateConfig) -> anyhow::Result<()> {
    let timeout = Duration::from_millis(config.timeout_ms);
    let remote = fetch_version(&version_url(config), timeout)?;
    let local = nvs_store.load_version()?;

    let version = match UpdateDecision::evaluate(local.as_deref(), &remote)? {
        UpdateDecision::UpToDate => {
            info!("firmware {} is up to date", remote.trim());
            return Ok(());
        }
        UpdateDecision::Install { version } => version,
    };

    let filename = config
        .filenames
        .first()
        .ok_or_else(|| anyhow!("no firmware image configured"))?;
    let url = file_url(config, &version, filename);
    info!(
        "update available: {} -> {version}, downloading {url}",
        local.as_deref().unwrap_or("<none>")
    );

    let (bytes_written, digest_hex) =
        download_and_apply_ota(&url, timeout, config.sha256.as_deref())?;
    nvs_store.save_version(&version)?;

    info!("firmware {version} applied ({bytes_written} bytes, sha256 {digest_hex})");

    if config.hard_reset {
        thread::sleep(Duration::from_millis(800));
        unsafe { esp_idf_svc::sys::esp_restart() };
    }

    Ok(())
}

fn http_client(timeout: Duration) -> anyhow::Result<HttpClient<EspHttpConnection>> {
    let http_conf = HttpClientConfiguration {
        timeout: Some(timeout),
        crt_bundle_attach: Some(esp_idf_svc::sys::esp_crt_bundle_attach),
        ..Default::default()
    };
    Ok(HttpClient::wrap(EspHttpConnection::new(&http_conf)?))
}

fn fetch_version(url: &str, timeout: Duration) -> anyhow::Result<String> {
    let mut client = http_client(timeout)?;
    let request = client.request(Method::Get, url, &[])?;
    let mut response = request.submit().map_err(|e| anyhow!("{e:?}"))?;

    let status = response.status();
    if !(200..300).contains(&status) {
        return Err(anyhow!("version check failed with HTTP {status}"));
    }

    let mut body = [0_u8; MAX_VERSION_BYTES];
    let mut len = 0;
    while len < body.len() {
        let read = response
            .read(&mut body[len..])
            .map_err(|e| anyhow!("{e:?}"))?;
        if read == 0 {
            break;
        }
        len += read;
    }

    Ok(String::from_utf8_lossy(&body[..len]).into_owned())
}

fn download_and_apply_ota(
    url: &str,
    timeout: Duration,
    expected_sha256: Option<&str>,
) -> anyhow::Result<(u64, String)> {
    let mut client = http_client(timeout)?;
    let request = client.request(Method::Get, url, &[])?;
    let mut response = request.submit().map_err(|e| anyhow!("{e:?}"))?;

    let status = response.status();
    if !(200..300).contains(&status) {
        return Err(anyhow!("OTA download failed with HTTP {status}"));
    }

    let content_length = response
        .header("content-length")
        .or_else(|| response.header("Content-Length"))
        .and_then(|value| value.parse::<u64>().ok());

    let mut ota = EspOta::new().map_err(|err| anyhow!("failed to acquire OTA: {err:?}"))?;
    let mut update = ota
        .initiate_update()
        .map_err(|err| anyhow!("failed to initiate OTA update: {err:?}"))?;

    let mut digest = ImageDigest::new();
    let mut chunk = [0_u8; OTA_CHUNK_SIZE];

    loop {
        let read = response.read(&mut chunk).map_err(|e| anyhow!("{e:?}"))?;
        if read == 0 {
            break;
        }

        update
            .write(&chunk[..read])
            .map_err(|err| anyhow!("failed writing OTA data: {err:?}"))?;
        digest.update(&chunk[..read]);

        if let Some(total) = content_length.filter(|value| *value > 0) {
            let pct = (digest.bytes().saturating_mul(100) / total).min(100);
            info!("OTA progress {pct}%");
        }
    }

    let total_written = digest.bytes();
    let digest_hex = digest.verify(expected_sha256)?;

    update
        .complete()
        .map_err(|err| anyhow!("failed finalizing OTA image: {err:?}"))?;
    drop(ota);

    Ok((total_written, digest_hex))
}

fn create_mqtt_client(
    runtime: &RuntimeConfig,
) -> anyhow::Result<(EspMqttClient<'static>, Receiver<StationError>)> {
    let url = format!(
        "mqtt://{}:{}",
        runtime.network.mqtt_host, runtime.network.mqtt_port
    );

    let conf = MqttClientConfiguration {
        client_id: Some(runtime.station.client_id.as_str()),
        username: if runtime.network.mqtt_user.is_empty() {
            None
        } else {
            Some(runtime.network.mqtt_user.as_str())
        },
        password: if runtime.network.mqtt_pass.is_empty() {
            None
        } else {
            Some(runtime.network.mqtt_pass.as_str())
        },
        ..Default::default()
    };

    let (client, mut conn) = EspMqttClient::new(&url, &conf)?;
    let (transport_tx, transport_rx) = mpsc::channel();

    thread::Builder::new()
        .name("mqtt-poll".to_string())
        .stack_size(8192)
        .spawn(move || {
            let mut link = LinkMonitor::default();
            loop {
                let event = match conn.next() {
                    Ok(event) => match event.payload() {
                        EventPayload::Connected(_) => {
                            info!("mqtt connected");
                            LinkEvent::Connected
                        }
                        EventPayload::Disconnected => LinkEvent::Disconnected,
                        EventPayload::Error(err) => LinkEvent::Error(format!("{err:?}")),
                        _ => LinkEvent::Activity,
                    },
                    Err(err) => LinkEvent::Error(format!("{err:?}")),
                };

                if let Err(err) = link.observe(event) {
                    warn!("station mqtt link lost: {err}");
                    let _ = transport_tx.send(err);
                    break;
                }
            }
        })
        .context("failed to spawn mqtt thread")?;

    Ok((client, transport_rx))
}

impl NvsStore {
    fn load_runtime_config(&self) -> anyhow::Result<RuntimeConfig> {
        let _guard = self.lock.lock().map_err(|_| anyhow!("nvs lock poisoned"))?;
        let nvs = EspNvs::new(self.partition.clone(), NVS_NAMESPACE, true)?;
        let mut buffer = vec![0_u8; 4096];

        match nvs.get_str(NVS_RUNTIME_KEY, &mut buffer)? {
            Some(value) => Ok(serde_json::from_str::<RuntimeConfig>(value)?),
            None => Ok(board_defaults()),
        }
    }

    fn load_version(&self) -> anyhow::Result<Option<String>> {
        let _guard = self.lock.lock().map_err(|_| anyhow!("nvs lock poisoned"))?;
        let nvs = EspNvs::new(self.partition.clone(), NVS_NAMESPACE, true)?;
        let mut buffer = [0_u8; MAX_VERSION_BYTES];

        Ok(nvs.get_str(NVS_VERSION_KEY, &mut buffer)?.map(str::to_string))
    }

    fn save_version(&self, version: &str) -> anyhow::Result<()> {
        let _guard = self.lock.lock().map_err(|_| anyhow!("nvs lock poisoned"))?;
        let mut nvs = EspNvs::new(self.partition.clone(), NVS_NAMESPACE, true)?;
        nvs.set_str(NVS_VERSION_KEY, version)?;
        Ok(())
    }
}
