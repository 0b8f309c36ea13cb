// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

use chrono::Utc;
use cohort_core::application::{ClusterRegistry, Orchestrator};
use cohort_core::domain::cluster::{AgentSlot, Cluster, ClusterId, ClusterKind};
use cohort_core::domain::config::{BrokerConfig, OrchestratorConfig, PortRange, RegistryConfig, TransportBinding};
use cohort_core::domain::registry::{EndpointStatus, ServiceKind};
use cohort_core::infrastructure::transport::Protocol;
use cohort_core::infrastructure::MessageBroker;
use std::collections::HashMap;
use std::sync::Arc;

/// Brings up a broker HTTP listener to act as a discoverable service.
async fn live_service() -> (Arc<MessageBroker>, u16) {
    let config = BrokerConfig {
        http: Some(TransportBinding {
            host: "127.0.0.1".to_string(),
            port: 0,
        }),
        ..BrokerConfig::default()
    };
    let broker = Arc::new(MessageBroker::new(config).unwrap().with_default_transports());
    let bound = broker.start().await.unwrap();
    (broker.clone(), bound[&Protocol::Http].port())
}

fn scanning(port: u16) -> RegistryConfig {
    RegistryConfig {
        scan_hosts: vec!["127.0.0.1".to_string()],
        scan_ports: vec![PortRange::single(port)],
        service_clusters: HashMap::from([(ServiceKind::HttpApi, ClusterId::from("gateway"))]),
        ..RegistryConfig::default()
    }
}

fn gateway() -> Cluster {
    let mut cluster = Cluster::new("gateway", "Gateway", ClusterKind::Communication);
    cluster.register_agent(AgentSlot::new("g1", ["routing"])).unwrap();
    cluster
}

#[tokio::test]
async fn test_discovers_and_checks_live_http_service() {
    let (service, port) = live_service().await;
    let registry = ClusterRegistry::from_config(scanning(port)).unwrap();
    registry.register(&gateway());

    let found = registry.discover_services().await;
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].protocol, "http");
    assert_eq!(found[0].kind, ServiceKind::HttpApi);
    assert_eq!(found[0].status, EndpointStatus::Discovered);

    let info = registry.get_cluster_info(&ClusterId::from("gateway")).unwrap();
    assert_eq!(info.endpoints, vec![found[0].address]);

    assert_eq!(registry.health_check_endpoints(Utc::now()).await, 1);
    let endpoint = registry.endpoints()[0].clone();
    assert!(endpoint.health_score > 50.0);
    assert!(endpoint.response_time_ms.is_some());

    // a second scan keeps the accumulated score
    registry.discover_services().await;
    assert_eq!(registry.endpoints()[0].health_score, endpoint.health_score);
    assert_eq!(registry.metrics().endpoints_discovered, 1);

    service.stop().await;
}

#[tokio::test]
async fn test_stopped_service_loses_health() {
    let (service, port) = live_service().await;
    let registry = ClusterRegistry::from_config(scanning(port)).unwrap();
    registry.discover_services().await;
    service.stop().await;

    registry.health_check_endpoints(Utc::now()).await;
    let endpoint = registry.endpoints()[0].clone();
    assert_eq!(endpoint.health_score, 25.0);
    assert_eq!(endpoint.status, EndpointStatus::Unreachable);
}

#[tokio::test]
async fn test_expired_registration_leaves_orchestrator() {
    let orchestrator = Arc::new(Orchestrator::new(OrchestratorConfig::default()).unwrap());
    orchestrator.register_cluster(gateway()).await.unwrap();

    let registry = ClusterRegistry::from_config(RegistryConfig::default())
        .unwrap()
        .with_orchestrator(orchestrator.clone());
    registry.register(&gateway());

    let much_later = Utc::now() + chrono::Duration::hours(1);
    let purged = registry.cleanup_stale(much_later).await;
    assert_eq!(purged, vec![ClusterId::from("gateway")]);
    assert!(registry.get_cluster_info(&ClusterId::from("gateway")).is_none());
    assert!(orchestrator.cluster(&ClusterId::from("gateway")).is_none());
}

#[tokio::test]
async fn test_membership_survives_restart() {
    let dir = tempfile::TempDir::new().unwrap();
    let config = RegistryConfig {
        persistence_path: Some(dir.path().join("state").join("registry.json")),
        ..RegistryConfig::default()
    };

    let before = ClusterRegistry::from_config(config.clone()).unwrap();
    before.register(&gateway());
    before.persist().await.unwrap();

    let after = ClusterRegistry::from_config(config).unwrap();
    assert_eq!(after.restore().await.unwrap(), 1);
    let info = after.get_cluster_info(&ClusterId::from("gateway")).unwrap();
    assert_eq!(info.name, "Gateway");
    assert!(info.capabilities.contains("routing"));
}
