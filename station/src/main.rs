//! Weather station node. The host build samples simulated sensors and
//! publishes through rumqttc; `--features esp32` drives the real ADC, DHT11
//! and BME280 through esp-idf.

#[cfg(feature = "esp32")]
mod esp;
#[cfg(not(feature = "esp32"))]
mod host;

#[cfg(not(feature = "esp32"))]
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    host::run().await
}

#[cfg(feature = "esp32")]
fn main() -> anyhow::Result<()> {
    esp::run()
}
