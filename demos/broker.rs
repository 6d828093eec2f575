//! Run an MQTT broker on TCP and an MQTT-SN gateway on UDP over one selector pool.
//!
//! cargo run --example broker -- [config.toml] [mqtt_addr] [mqtt_sn_addr]
use log::{error, info};
use std::sync::Arc;

use brokerio::config::BrokerConfig;
use brokerio::protocol::mqtt::MqttProtocolFactory;
use brokerio::protocol::mqtt_sn::MqttSnProtocolFactory;
use brokerio::session::memory::MemorySessionManager;
use brokerio::{SelectorPool, TcpEndPointServer, UdpEndPointServer};

fn run(config: BrokerConfig, mqtt_addr: &str, mqtt_sn_addr: &str) -> brokerio::Result<()> {
    let pool = SelectorPool::new(&config.selector)?;
    let sessions = Arc::new(MemorySessionManager::new());

    let mqtt = TcpEndPointServer::start(
        &pool,
        mqtt_addr,
        Arc::new(MqttProtocolFactory::new(config.mqtt.clone(), sessions.clone())),
        &config.tcp,
    )?;
    let mqtt_sn = UdpEndPointServer::start(
        &pool,
        mqtt_sn_addr,
        Arc::new(MqttSnProtocolFactory::new(config.mqtt_sn.clone(), sessions.clone())),
        &config.udp,
    )?;
    info!(
        "broker up: mqtt on {}, mqtt-sn on {}, {} selector threads",
        mqtt.local_addr(),
        mqtt_sn.local_addr(),
        pool.len()
    );

    loop {
        std::thread::sleep(std::time::Duration::from_secs(60));
        info!(
            "{} registrants, {} sessions",
            pool.count_registrants(),
            sessions.session_count()
        );
    }
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let mut args = std::env::args().skip(1);
    let config = match args.next() {
        Some(path) => match BrokerConfig::load(&path) {
            Ok(config) => config,
            Err(err) => {
                error!("cannot load {}: {}", path, err);
                std::process::exit(2);
            }
        },
        None => BrokerConfig::default(),
    };
    let mqtt_addr = args.next().unwrap_or_else(|| "127.0.0.1:1883".to_owned());
    let mqtt_sn_addr = args.next().unwrap_or_else(|| "127.0.0.1:1884".to_owned());
    if let Err(err) = run(config, &mqtt_addr, &mqtt_sn_addr) {
        error!("broker stopped: {}", err);
        std::process::exit(1);
    }
}
