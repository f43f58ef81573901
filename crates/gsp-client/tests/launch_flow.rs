//! Two members in one room over loopback: confirmation, direct pings and
//! the launch handshake against a real room service.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::Receiver;

use gsp_client::{ClientEvent, RoomClient, RosterEntry};
use gsp_core::config::{ClientConfig, RoomConfig};
use gsp_core::types::RoomId;
use gsp_server::{DirectoryError, Identity, RoomDescription, RoomDirectory, RoomService};

const LOCALHOST: &str = "127.0.0.1";

fn client_config() -> ClientConfig {
    ClientConfig {
        ping_batch_ms: 10,
        ping_interval_ms: 50,
        ping_repeat_ms: 100,
        server_ping_secs: 1,
        launch_repeat_ms: 200,
        launch_timeout_secs: 5,
        ..ClientConfig::default()
    }
}

fn start_service() -> RoomService {
    let config = RoomConfig {
        bind: LOCALHOST.parse().unwrap(),
        main_port: 0,
        aux_port: 0,
        launch_resend_interval_ms: 50,
        launch_retry_ms: 100,
        ..RoomConfig::default()
    };
    let directory = Arc::new(RoomDirectory::new(config).unwrap());
    RoomService::start_with(directory).unwrap()
}

fn wait_until(within: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + within;
    while Instant::now() < deadline {
        if check() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    check()
}

fn wait_event(events: &Receiver<ClientEvent>, wanted: fn(&ClientEvent) -> bool) -> Option<ClientEvent> {
    let deadline = Instant::now() + Duration::from_secs(5);
    while let Some(left) = deadline.checked_duration_since(Instant::now()) {
        match events.recv_timeout(left) {
            Ok(event) if wanted(&event) => return Some(event),
            Ok(_) => continue,
            Err(_) => return None,
        }
    }
    None
}

fn roster(directory: &RoomDirectory, room: RoomId, identity: &str) -> Vec<RosterEntry> {
    directory
        .members_for(room, identity, false)
        .unwrap()
        .into_iter()
        .map(|m| RosterEntry {
            name: m.name,
            endpoint: m.endpoint,
            can_relay: m.can_relay,
            is_relay: m.is_relay,
        })
        .collect()
}

fn connect(server: SocketAddr, token: gsp_core::types::RoomToken) -> RoomClient {
    RoomClient::connect_from(
        SocketAddr::new(LOCALHOST.parse().unwrap(), 0),
        server,
        token,
        client_config(),
    )
    .unwrap()
}

#[test]
fn test_two_members_launch() {
    let service = start_service();
    let directory = service.directory().clone();
    let ip: IpAddr = LOCALHOST.parse().unwrap();

    let owner = Identity::full("u1", "Alice");
    let guest = Identity::full("u2", "Bob");
    let room = directory
        .create_room(RoomDescription::default(), &owner)
        .unwrap();

    // The guest cannot join before the owner's endpoint is known
    let host_login = directory.join(room.id, ip, &owner, true).unwrap();
    assert!(matches!(
        directory.join(room.id, ip, &guest, false),
        Err(DirectoryError::OwnerNotReady)
    ));

    let alice = connect(service.main_addr(), host_login.token);
    let alice_events = alice.events();
    assert!(wait_until(Duration::from_secs(3), || room
        .owner_endpoint()
        .is_some()));
    assert_eq!(room.owner_endpoint(), Some(alice.local_addr()));

    while alice_events.try_recv().is_ok() {}

    let guest_login = directory.join(room.id, ip, &guest, false).unwrap();
    let bob = connect(service.main_addr(), guest_login.token);
    let bob_events = bob.events();
    assert!(wait_until(Duration::from_secs(3), || {
        directory
            .members_for(room.id, "u1", false)
            .map(|m| !m.is_empty())
            .unwrap_or(false)
    }));

    // Bob's confirmation pokes Alice to refresh
    assert!(wait_event(&alice_events, |e| *e == ClientEvent::RefreshRoster).is_some());

    assert!(alice.update_peers(roster(&directory, room.id, "u1")));
    assert!(bob.update_peers(roster(&directory, room.id, "u2")));
    assert!(wait_until(Duration::from_secs(5), || {
        alice.peers().iter().all(|p| p.connected) && bob.peers().iter().all(|p| p.connected)
    }));
    let seen_by_alice = alice.peers();
    assert_eq!(seen_by_alice.len(), 1);
    assert_eq!(seen_by_alice[0].name, "Bob");
    assert_eq!(seen_by_alice[0].endpoint, bob.local_addr());
    assert!(seen_by_alice[0].connectivity > 0.0);

    let host = alice.request_launch().unwrap();
    assert_eq!(host, alice.local_addr());

    match wait_event(&bob_events, |e| matches!(e, ClientEvent::Launched { .. })) {
        Some(ClientEvent::Launched { host: seen }) => assert_eq!(seen, host),
        other => panic!("expected Launched, got {:?}", other),
    }
    assert_eq!(bob.host(), Some(host));

    // The room is gone and every LaunchEvent was acknowledged
    assert!(directory.room(room.id).is_none());
    assert!(directory.is_recently_removed_room(room.id));
    assert!(wait_until(Duration::from_secs(3), || service
        .handler()
        .pending_acks()
        == 0));

    alice.shutdown();
    bob.shutdown();
    service.shutdown();
}

#[test]
fn test_guest_cannot_launch() {
    let service = start_service();
    let directory = service.directory().clone();
    let ip: IpAddr = LOCALHOST.parse().unwrap();

    let owner = Identity::full("u1", "Alice");
    let guest = Identity::full("u2", "Bob");
    let room = directory
        .create_room(RoomDescription::default(), &owner)
        .unwrap();
    let host_login = directory.join(room.id, ip, &owner, true).unwrap();
    let alice = connect(service.main_addr(), host_login.token);
    assert!(wait_until(Duration::from_secs(3), || room
        .owner_endpoint()
        .is_some()));

    let guest_login = directory.join(room.id, ip, &guest, false).unwrap();
    let mut config = client_config();
    config.launch_timeout_secs = 1;
    let bob = RoomClient::connect_from(
        SocketAddr::new(ip, 0),
        service.main_addr(),
        guest_login.token,
        config,
    )
    .unwrap();

    assert!(bob.request_launch().is_err());
    assert!(directory.room(room.id).is_some());

    alice.shutdown();
    bob.shutdown();
    service.shutdown();
}
