/// End-to-end test against a real MQTT broker.
///
/// Marked #[ignore]; start a broker first:
///   docker run -d -p 1883:1883 eclipse-mosquitto:2 mosquitto -c /mosquitto-no-auth.conf
///   MQTT_BROKER=localhost:1883 cargo test --test end_to_end_test -- --ignored
use consumption_calc::bus::mqtt::{self, MqttBus};
use consumption_calc::bus::{
    registration_fields, BusAddress, MetricStore, ServiceDirectory, AC_L1_POWER, AC_POWER,
};
use consumption_calc::config::{Config, MqttConfig};
use consumption_calc::discovery::wait_for_all;
use consumption_calc::{ConsumptionEngine, PowerInputs, TickOutcome};
use std::time::Duration;

#[tokio::test]
#[ignore]
async fn test_consumption_over_mqtt() {
    let broker = std::env::var("MQTT_BROKER").unwrap_or_else(|_| "localhost:1883".to_string());
    let address =
        BusAddress::from_session(Some(broker.as_str()), &MqttConfig::default()).unwrap();
    let root = format!("e2e-{}", std::process::id());
    let mut cfg = Config::default();
    cfg.discovery.retry_interval_ms = 200;

    // Plays the grid meter and PV inverter
    let meters = MqttBus::connect(mqtt::build_options(&address, &cfg.mqtt), root.clone());
    let calc = MqttBus::connect(mqtt::build_options(&address, &cfg.mqtt), root.clone());
    let (grid, pv) = (cfg.sources.grid.as_str(), cfg.sources.pv.as_str());
    calc.watch(grid).await.unwrap();
    calc.watch(pv).await.unwrap();
    meters.watch(&cfg.service.name).await.unwrap();

    for (service, watts) in [(grid, 1715.0), (pv, 2417.0)] {
        let store = meters.service(service);
        let fields = vec![
            (AC_POWER.to_string(), serde_json::json!(watts)),
            (AC_L1_POWER.to_string(), serde_json::json!(watts)),
        ];
        store.register(&fields, &[]).unwrap();
    }

    if let Err(e) = wait_for_all(&calc, &[grid, pv], cfg.discovery.policy()).await {
        eprintln!("⚠️  Skipping test: broker at {broker} not reachable ({e})");
        return;
    }

    let inputs = PowerInputs {
        grid_total: calc.import(grid, AC_POWER),
        grid_l1: calc.import(grid, AC_L1_POWER),
        pv_total: calc.import(pv, AC_POWER),
        pv_l1: calc.import(pv, AC_L1_POWER),
    };
    let engine = ConsumptionEngine::new(
        inputs,
        calc.service(&cfg.service.name),
        &registration_fields(&cfg.service),
    )
    .unwrap();

    match engine.update() {
        TickOutcome::Published(r) => assert_eq!(r.total, 702.0),
        TickOutcome::Faulted(e) => panic!("tick faulted: {e}"),
    }

    tokio::time::sleep(Duration::from_millis(500)).await;
    assert!(meters.exists(&cfg.service.name).unwrap());
}
