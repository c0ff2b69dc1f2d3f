//! Integration tests for the platform agent.

use std::collections::BTreeSet;
use std::io::Write;
use std::time::Duration;

use platnet_agent::{backend_for, load_topology, Config, PlatformAgent};
use platnet_driver::DriverState;
use rstest::rstest;

fn test_config(platform_id: &str) -> Config {
    let mut config = Config::from_lookup(|_| None).unwrap();
    config.platform_id = platform_id.parse().unwrap();
    config.polling_interval_ms = 20;
    config.timeout_ms = 500;
    config
}

#[tokio::test]
async fn test_runs_driver_per_platform() {
    let config = test_config("Node1D");
    let backend = backend_for(&config).unwrap();

    let agent = PlatformAgent::start(&config, backend).await.unwrap();

    let ids: Vec<_> = agent
        .drivers()
        .iter()
        .map(|d| d.platform_id().as_str().to_string())
        .collect();
    assert_eq!(ids, vec!["Node1D", "MJ01C", "LJ01D"]);
    assert_eq!(
        agent.drivers()[2].parent_platform_id().map(|p| p.as_str()),
        Some("MJ01C")
    );
    for driver in agent.drivers() {
        assert_eq!(driver.state(), DriverState::Active);
        assert!(driver.is_monitoring().await);
    }

    tokio::time::sleep(Duration::from_millis(200)).await;
    let drivers = agent.drivers().to_vec();
    let published = agent.shutdown().await;

    assert!(published > 0);
    for driver in drivers {
        assert_eq!(driver.state(), DriverState::Destroyed);
    }
}

#[tokio::test]
async fn test_uses_topology_file() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(file, "Node1C = [\"Node1D\"]").unwrap();
    writeln!(file, "Node1D = []").unwrap();

    let mut config = test_config("Node1C");
    config.topology_file = Some(file.path().to_path_buf());
    let backend = backend_for(&config).unwrap();

    let agent = PlatformAgent::start(&config, backend).await.unwrap();
    let ids: BTreeSet<_> = agent
        .drivers()
        .iter()
        .map(|d| d.platform_id().as_str().to_string())
        .collect();
    agent.shutdown().await;

    assert_eq!(ids, BTreeSet::from(["Node1C".to_string(), "Node1D".to_string()]));
}

#[test]
fn test_missing_topology_file() {
    let err = load_topology(std::path::Path::new("/nonexistent/topology.toml")).unwrap_err();
    assert!(err.to_string().contains("failed to read topology file"));
}

#[rstest]
#[case("http://oms:9021")]
#[case("serial://dev/ttyS0")]
fn test_rejects_unsupported_scheme(#[case] endpoint: &str) {
    let mut config = test_config("Node1D");
    config.endpoint = endpoint.to_string();

    assert!(backend_for(&config).is_err());
}

#[tokio::test]
async fn test_unknown_root_platform() {
    let config = test_config("Node9Z");
    let backend = backend_for(&config).unwrap();

    assert!(PlatformAgent::start(&config, backend).await.is_err());
}
