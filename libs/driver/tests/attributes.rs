//! Attribute and port operation integration tests.

mod common;

use std::sync::Arc;
use std::time::Duration;

use platnet_driver::{
    AttributeError, DriverError, PlatformDriver, PortConfig, PortState, SimulatorBackend,
};
use platnet_events::NtpTimestamp;
use rstest::rstest;
use serde_json::json;

use common::{active_driver, aid, fast_config, pid, single_platform};

async fn node1d() -> (Arc<SimulatorBackend>, PlatformDriver) {
    let sim = Arc::new(SimulatorBackend::default_network());
    let driver = PlatformDriver::new(pid("Node1D"), fast_config(), None, sim.clone()).unwrap();
    driver.go_active().await.unwrap();
    (sim, driver)
}

#[tokio::test]
async fn test_mixed_known_and_unknown_attributes() {
    let sim = single_platform();
    let driver = active_driver(&sim, &[]).await;
    sim.push_sample_at(&pid("P1"), &aid("temp"), 3, NtpTimestamp::from_parts(30, 0));
    sim.push_sample_at(&pid("P1"), &aid("temp"), 1, NtpTimestamp::from_parts(10, 0));
    sim.push_sample_at(&pid("P1"), &aid("temp"), 2, NtpTimestamp::from_parts(20, 0));

    let readings = driver
        .get_attribute_values(&[aid("temp"), aid("bogus")], NtpTimestamp::ZERO)
        .await
        .unwrap();

    let temp = readings[&aid("temp")].as_ref().unwrap();
    let values: Vec<_> = temp.iter().map(|s| s.value.clone()).collect();
    assert_eq!(values, vec![json!(1), json!(2), json!(3)]);
    assert!(temp.windows(2).all(|w| w[0].timestamp <= w[1].timestamp));
    assert_eq!(readings[&aid("bogus")], Err(AttributeError::Unknown));
}

#[rstest]
#[case::everything(0, 3)]
#[case::inclusive_lower_bound(20, 2)]
#[case::newest_only(25, 1)]
#[case::empty_range(31, 0)]
#[tokio::test]
async fn test_since_bounds_samples(#[case] since_secs: u32, #[case] expected: usize) {
    let sim = single_platform();
    let driver = active_driver(&sim, &[]).await;
    for secs in [10, 20, 30] {
        sim.push_sample_at(&pid("P1"), &aid("temp"), secs, NtpTimestamp::from_parts(secs, 0));
    }

    let readings = driver
        .get_attribute_values(&[aid("temp")], NtpTimestamp::from_parts(since_secs, 0))
        .await
        .unwrap();

    let samples = readings[&aid("temp")].as_ref().unwrap();
    assert_eq!(samples.len(), expected);
    assert!(samples
        .iter()
        .all(|s| s.timestamp >= NtpTimestamp::from_parts(since_secs, 0)));
}

#[tokio::test]
async fn test_write_echo_round_trip() {
    let (_sim, driver) = node1d().await;
    let before = NtpTimestamp::now();

    let writes = driver
        .set_attribute_values(&[(aid("input_bus_current"), json!("7"))])
        .await
        .unwrap();
    let echo = writes[&aid("input_bus_current")].clone().unwrap();
    assert_eq!(echo.value, json!(7.0));
    assert!(echo.timestamp >= before);

    let readings = driver
        .get_attribute_values(&[aid("input_bus_current")], before)
        .await
        .unwrap();
    let samples = readings[&aid("input_bus_current")].as_ref().unwrap();
    assert_eq!(samples.last(), Some(&echo));
}

#[tokio::test]
async fn test_write_out_of_range_is_clamped() {
    let (_sim, driver) = node1d().await;

    let writes = driver
        .set_attribute_values(&[(aid("input_bus_current"), json!("9876"))])
        .await
        .unwrap();

    assert_eq!(writes[&aid("input_bus_current")].as_ref().unwrap().value, json!(10.0));
}

#[tokio::test]
async fn test_write_errors_are_per_key() {
    let (_sim, driver) = node1d().await;

    let writes = driver
        .set_attribute_values(&[
            (aid("input_voltage"), json!(240)),
            (aid("bogus"), json!(1)),
            (aid("input_bus_current"), json!("lots")),
            (aid("input_bus_current"), json!(2)),
        ])
        .await
        .unwrap();

    assert_eq!(writes[&aid("input_voltage")], Err(AttributeError::NotWritable));
    assert_eq!(writes[&aid("bogus")], Err(AttributeError::Unknown));
    assert!(writes[&aid("input_bus_current")].is_ok());

    let err = writes[&aid("input_voltage")]
        .clone()
        .unwrap_err()
        .into_driver_error(aid("input_voltage"));
    assert_eq!(err, DriverError::NotWritable(aid("input_voltage")));
}

#[tokio::test]
async fn test_unreachable_backend_fails_whole_call() {
    let (sim, driver) = node1d().await;
    sim.set_reachable(false);

    let err = driver
        .get_attribute_values(&[aid("input_voltage")], NtpTimestamp::ZERO)
        .await
        .unwrap_err();
    assert!(matches!(err, DriverError::Connection(_)));

    let err = driver
        .set_attribute_values(&[(aid("input_bus_current"), json!(1))])
        .await
        .unwrap_err();
    assert!(err.is_connection_error());
}

#[tokio::test]
async fn test_slow_backend_times_out() {
    let sim = Arc::new(SimulatorBackend::default_network());
    let config = fast_config().with_timeout(Duration::from_millis(50));
    let driver = PlatformDriver::new(pid("Node1D"), config, None, sim.clone()).unwrap();
    driver.go_active().await.unwrap();

    sim.set_latency(Duration::from_millis(500));
    let err = driver.get_ports().await.unwrap_err();

    assert!(matches!(err, DriverError::Timeout { operation: "get_ports", .. }));
    assert!(err.is_retryable());
}

#[tokio::test]
async fn test_ports() {
    let (_sim, driver) = node1d().await;

    let ports = driver.get_ports().await.unwrap();
    assert_eq!(ports.len(), 1);
    assert_eq!(ports[0].port_id.as_str(), "Node1D_port_1");
    assert_eq!(ports[0].state, PortState::Off);

    let mut attributes = PortConfig::new();
    attributes.insert("networks".into(), json!(["science"]));
    let config = driver
        .set_up_port(&"Node1D_port_1".parse().unwrap(), &attributes)
        .await
        .unwrap();
    assert_eq!(config["networks"], json!(["science"]));

    let ports = driver.get_ports().await.unwrap();
    assert_eq!(ports[0].config["networks"], json!(["science"]));
}

#[tokio::test]
async fn test_unknown_port() {
    let (_sim, driver) = node1d().await;
    let port = "Node1D_port_9".parse().unwrap();

    let err = driver.set_up_port(&port, &PortConfig::new()).await.unwrap_err();
    assert_eq!(err, DriverError::UnknownPort(port));
}

#[tokio::test]
async fn test_operations_require_activation() {
    let driver = PlatformDriver::new(
        pid("Node1D"),
        fast_config(),
        None,
        Arc::new(SimulatorBackend::default_network()),
    )
    .unwrap();

    assert!(matches!(
        driver
            .get_attribute_values(&[aid("input_voltage")], NtpTimestamp::ZERO)
            .await,
        Err(DriverError::Precondition(_))
    ));
    assert!(matches!(
        driver.set_attribute_values(&[]).await,
        Err(DriverError::Precondition(_))
    ));
    assert!(matches!(driver.get_ports().await, Err(DriverError::Precondition(_))));
}
