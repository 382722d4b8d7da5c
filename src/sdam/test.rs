use std::{
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

use pretty_assertions::assert_eq;

use super::{ServerDescription, ServerType, TopologyDescription, TopologyType};
use crate::{
    bson::doc,
    error::{Error, ErrorKind},
    event::sdam::SdamEvent,
    options::ServerAddress,
    selection_criteria::{ReadPreference, SelectionCriteria},
    test::{MockDeployment, MockTopology, TestClient},
};

fn address(host: &str) -> ServerAddress {
    ServerAddress::parse(host).unwrap()
}

fn server(
    host: &str,
    server_type: ServerType,
    set_name: Option<&str>,
    hosts: &[&str],
    rtt_ms: u64,
) -> ServerDescription {
    ServerDescription {
        address: address(host),
        server_type,
        round_trip_time: Some(Duration::from_millis(rtt_ms)),
        set_name: set_name.map(String::from),
        hosts: hosts.iter().map(|h| address(h)).collect(),
        max_wire_version: Some(17),
        error: None,
    }
}

fn primary(host: &str, hosts: &[&str]) -> ServerDescription {
    server(host, ServerType::RsPrimary, Some("rs0"), hosts, 5)
}

fn secondary(host: &str, hosts: &[&str], rtt_ms: u64) -> ServerDescription {
    server(host, ServerType::RsSecondary, Some("rs0"), hosts, rtt_ms)
}

fn sorted_addresses(topology: &TopologyDescription) -> Vec<String> {
    let mut addresses: Vec<String> = topology
        .server_addresses()
        .iter()
        .map(ToString::to_string)
        .collect();
    addresses.sort();
    addresses
}

fn select(topology: &TopologyDescription, read_pref: ReadPreference) -> Option<String> {
    topology
        .select_server(&SelectionCriteria::ReadPreference(read_pref))
        .map(|a| a.to_string())
}

#[test]
fn single_standalone_seed() {
    let mut topology = TopologyDescription::new(&[address("a:27017")]);
    assert_eq!(topology.topology_type(), TopologyType::Unknown);
    assert_eq!(select(&topology, ReadPreference::Primary), None);

    topology.update(server("a:27017", ServerType::Standalone, None, &[], 1));
    assert_eq!(topology.topology_type(), TopologyType::Single);
    assert_eq!(
        select(&topology, ReadPreference::Secondary),
        Some("a:27017".to_string())
    );
}

#[test]
fn standalone_among_several_seeds_is_removed() {
    let mut topology = TopologyDescription::new(&[address("a:27017"), address("b:27017")]);
    topology.update(server("a:27017", ServerType::Standalone, None, &[], 1));
    assert_eq!(topology.topology_type(), TopologyType::Unknown);
    assert_eq!(sorted_addresses(&topology), vec!["b:27017"]);
}

#[test]
fn primary_reports_replica_set_members() {
    let members = ["a:27017", "b:27017", "c:27017"];
    let mut topology = TopologyDescription::new(&[address("a:27017")]);

    topology.update(primary("a:27017", &members));
    assert_eq!(topology.topology_type(), TopologyType::ReplicaSetWithPrimary);
    assert_eq!(topology.set_name(), Some("rs0"));
    assert_eq!(sorted_addresses(&topology), members.to_vec());
    assert_eq!(
        topology.server(&address("b:27017")).map(ServerDescription::server_type),
        Some(ServerType::Unknown)
    );

    topology.update(secondary("b:27017", &members, 5));
    assert_eq!(
        topology.server(&address("b:27017")).map(ServerDescription::server_type),
        Some(ServerType::RsSecondary)
    );
}

#[test]
fn new_primary_replaces_old_one() {
    let members = ["a:27017", "b:27017"];
    let mut topology = TopologyDescription::new(&[address("a:27017"), address("b:27017")]);
    topology.update(primary("a:27017", &members));
    topology.update(primary("b:27017", &members));

    assert_eq!(topology.topology_type(), TopologyType::ReplicaSetWithPrimary);
    assert_eq!(
        topology.server(&address("a:27017")).map(ServerDescription::server_type),
        Some(ServerType::Unknown)
    );
    assert_eq!(
        select(&topology, ReadPreference::Primary),
        Some("b:27017".to_string())
    );
}

#[test]
fn primary_member_list_is_authoritative() {
    let mut topology = TopologyDescription::new(&[address("a:27017"), address("z:27017")]);
    topology.update(primary("a:27017", &["a:27017", "b:27017"]));
    assert_eq!(sorted_addresses(&topology), vec!["a:27017", "b:27017"]);
}

#[test]
fn member_of_another_set_is_removed() {
    let mut topology = TopologyDescription::new(&[address("a:27017"), address("b:27017")]);
    topology.update(primary("a:27017", &["a:27017", "b:27017"]));
    topology.update(server(
        "b:27017",
        ServerType::RsSecondary,
        Some("other"),
        &[],
        5,
    ));

    assert_eq!(sorted_addresses(&topology), vec!["a:27017"]);
    assert_eq!(topology.topology_type(), TopologyType::ReplicaSetWithPrimary);
}

#[test]
fn sharded_topology_keeps_only_routers() {
    let mut topology = TopologyDescription::new(&[address("a:27017"), address("b:27017")]);
    topology.update(server("a:27017", ServerType::Mongos, None, &[], 2));
    assert_eq!(topology.topology_type(), TopologyType::Sharded);

    topology.update(secondary("b:27017", &[], 2));
    assert_eq!(sorted_addresses(&topology), vec!["a:27017"]);
    assert_eq!(
        select(&topology, ReadPreference::SecondaryPreferred),
        Some("a:27017".to_string())
    );
}

#[test]
fn updates_for_unknown_addresses_are_ignored() {
    let mut topology = TopologyDescription::new(&[address("a:27017")]);
    let before = topology.clone();
    topology.update(server("x:27017", ServerType::Standalone, None, &[], 1));
    assert_eq!(topology, before);
}

#[test]
fn read_preferences_pick_matching_members() {
    let members = ["a:27017", "b:27017"];
    let mut topology = TopologyDescription::new(&[address("a:27017")]);
    topology.update(primary("a:27017", &members));

    // No secondaries yet.
    assert_eq!(select(&topology, ReadPreference::Secondary), None);
    assert_eq!(
        select(&topology, ReadPreference::SecondaryPreferred),
        Some("a:27017".to_string())
    );

    topology.update(secondary("b:27017", &members, 5));
    assert_eq!(
        select(&topology, ReadPreference::Primary),
        Some("a:27017".to_string())
    );
    assert_eq!(
        select(&topology, ReadPreference::Secondary),
        Some("b:27017".to_string())
    );
    assert_eq!(
        select(&topology, ReadPreference::PrimaryPreferred),
        Some("a:27017".to_string())
    );
    assert_eq!(
        select(&topology, ReadPreference::SecondaryPreferred),
        Some("b:27017".to_string())
    );
}

#[test]
fn slow_servers_fall_outside_latency_window() {
    let members = ["a:27017", "b:27017", "c:27017"];
    let mut topology = TopologyDescription::new(&[address("a:27017")]);
    topology.update(primary("a:27017", &members));
    topology.update(secondary("b:27017", &members, 10));
    topology.update(secondary("c:27017", &members, 200));

    let nearest: Vec<String> = topology
        .suitable_servers_in_latency_window(&SelectionCriteria::ReadPreference(
            ReadPreference::Nearest,
        ))
        .into_iter()
        .map(|s| s.address().to_string())
        .collect::<std::collections::BTreeSet<_>>()
        .into_iter()
        .collect();
    assert_eq!(nearest, vec!["a:27017", "b:27017"]);
}

#[test]
fn predicate_selects_by_address() {
    let members = ["a:27017", "b:27017"];
    let mut topology = TopologyDescription::new(&[address("a:27017")]);
    topology.update(primary("a:27017", &members));
    topology.update(secondary("b:27017", &members, 5));

    let criteria = SelectionCriteria::from_address(address("b:27017"));
    assert_eq!(
        topology.select_server(&criteria),
        Some(address("b:27017"))
    );

    // Unknown servers are never suitable, even when the predicate matches.
    let mut topology = TopologyDescription::new(&[address("b:27017")]);
    topology.update(server("b:27017", ServerType::Unknown, None, &[], 1));
    assert_eq!(topology.select_server(&criteria), None);
}

#[test]
fn errored_servers_are_reported() {
    let mut topology = TopologyDescription::new(&[address("a:27017"), address("b:27017")]);
    assert!(!topology.all_servers_errored());

    let refused = || -> Error { std::io::Error::from(std::io::ErrorKind::ConnectionRefused).into() };
    topology.update(ServerDescription::with_error(address("a:27017"), refused()));
    assert!(!topology.all_servers_errored());
    topology.update(ServerDescription::with_error(address("b:27017"), refused()));
    assert!(topology.all_servers_errored());

    let message = topology.server_selection_error_message(&ReadPreference::Primary.into());
    assert!(message.starts_with("No available servers. Topology: Unknown"));
    assert!(message.contains("a:27017"));
}

#[tokio::test(flavor = "multi_thread")]
async fn selection_fails_fast_when_every_server_is_unreachable() {
    let deployment = MockDeployment::default();
    deployment.refuse_connections(true);

    TestClient::with_deployment(deployment, None)
        .run(|client, _| async move {
            let start = Instant::now();
            let error = client
                .database("admin")
                .run_command(doc! { "ping": 1 }, None)
                .await
                .unwrap_err();

            assert!(matches!(*error.kind, ErrorKind::ServerSelection { .. }));
            assert!(error.is_network_error());
            assert!(start.elapsed() < Duration::from_secs(4));
        })
        .await;
}

#[tokio::test(flavor = "multi_thread")]
async fn monitor_discovers_mock_topologies() {
    for (mock, expected) in [
        (MockTopology::Standalone, TopologyType::Single),
        (MockTopology::ReplicaSet, TopologyType::ReplicaSetWithPrimary),
        (MockTopology::Sharded, TopologyType::Sharded),
    ] {
        TestClient::with_deployment(MockDeployment::new(mock), None)
            .run(|client, _| async move {
                client
                    .database("admin")
                    .run_command(doc! { "ping": 1 }, None)
                    .await
                    .unwrap();

                let topology = client.pool().topology().watch().observe_latest();
                assert_eq!(topology.topology_type(), expected);
            })
            .await;
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn heartbeats_and_shutdown_are_published() {
    let events: Arc<Mutex<Vec<SdamEvent>>> = Default::default();

    TestClient::new()
        .run(|client, deployment| {
            let events = events.clone();
            async move {
                let sink = events.clone();
                client.add_sdam_event_callback(move |event| sink.lock().unwrap().push(event));

                tokio::time::sleep(Duration::from_millis(1200)).await;
                client.shutdown().await.unwrap();

                let events = events.lock().unwrap();
                assert!(events.iter().any(|e| matches!(
                    e,
                    SdamEvent::ServerHeartbeatSucceeded(hb) if hb.server_address == deployment.address()
                )));
                assert!(events.iter().any(|e| matches!(
                    e,
                    SdamEvent::ServerClosed(closed) if closed.address == deployment.address()
                )));
            }
        })
        .await;
}
