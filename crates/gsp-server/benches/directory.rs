//! Room directory benchmarks
//!
//! - Datagram hot path: token lookup plus endpoint confirmation
//! - Join/exit churn on a single room
//! - Room listing with many open rooms
//!
//! Run with: cargo bench --bench directory -p gsp-server

use std::net::{IpAddr, SocketAddr};

use criterion::{black_box, criterion_group, criterion_main, Criterion};

use gsp_core::config::RoomConfig;
use gsp_core::types::TokenMint;
use gsp_server::{Identity, RoomDescription, RoomDirectory};

fn directory() -> RoomDirectory {
    RoomDirectory::with_mint(RoomConfig::default(), TokenMint::with_keys([11, 13, 17]))
}

fn bench_confirm(c: &mut Criterion) {
    let dir = directory();
    let owner = Identity::full("owner", "Owner");
    let room = dir.create_room(RoomDescription::default(), &owner).unwrap();
    let ip: IpAddr = "10.0.0.1".parse().unwrap();
    let ep = SocketAddr::new(ip, 4000);
    let login = dir.join(room.id, ip, &owner, true).unwrap();
    dir.confirm_endpoint(login.token, ep).unwrap();

    c.bench_function("confirm_endpoint", |b| {
        b.iter(|| black_box(dir.confirm_endpoint(black_box(login.token), ep).is_ok()))
    });
}

fn bench_join_exit(c: &mut Criterion) {
    let dir = directory();
    let owner = Identity::full("owner", "Owner");
    let room = dir.create_room(RoomDescription::default(), &owner).unwrap();
    let login = dir.join(room.id, "10.0.0.1".parse().unwrap(), &owner, true).unwrap();
    dir.confirm_endpoint(login.token, "10.0.0.1:4000".parse().unwrap())
        .unwrap();
    let guest = Identity::full("guest", "Guest");
    let guest_ip: IpAddr = "10.0.0.2".parse().unwrap();

    c.bench_function("join_exit", |b| {
        b.iter(|| {
            let login = dir.join(room.id, guest_ip, &guest, false).unwrap();
            dir.exit_token(login.token).unwrap();
            while dir.pop_update().is_some() {}
        })
    });
}

fn bench_list_rooms(c: &mut Criterion) {
    let dir = directory();
    for i in 0..500u32 {
        let owner = Identity::full(format!("owner-{}", i), format!("Owner {}", i));
        let room = dir.create_room(RoomDescription::default(), &owner).unwrap();
        let ip = IpAddr::from([10, 1, (i >> 8) as u8, i as u8]);
        let login = dir.join(room.id, ip, &owner, true).unwrap();
        dir.confirm_endpoint(login.token, SocketAddr::new(ip, 4000))
            .unwrap();
    }
    let viewer = Identity::full("viewer", "Viewer");

    c.bench_function("list_rooms_500", |b| {
        b.iter(|| black_box(dir.list_rooms(&viewer).rooms.len()))
    });
}

criterion_group!(benches, bench_confirm, bench_join_exit, bench_list_rooms);
criterion_main!(benches);
