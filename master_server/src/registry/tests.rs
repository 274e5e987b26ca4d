// SPDX-FileCopyrightText: 2021 Softbear, Inc.
// SPDX-License-Identifier: AGPL-3.0-or-later

use super::*;
use std::sync::Barrier;
use std::thread;

const T0: UnixTime = 1_700_000_000_000;

fn secs(s: u64) -> UnixTime {
    s * 1000
}

fn registry(dead: u64, ghost: u64) -> ServerRegistry {
    ServerRegistry::new(
        Lifecycle {
            dead_time: Duration::from_secs(dead),
            ghost_time: Duration::from_secs(ghost),
        },
        Duration::from_secs(10),
        false,
    )
}

fn new_server(addr: &str, auth_port: u16) -> NewGameServer {
    NewGameServer {
        game_addr: addr.parse().unwrap(),
        auth_port: NonZeroU16::new(auth_port),
        name: "test server".to_owned(),
        description: String::new(),
        map: "mp_forwardbase_kodai".to_owned(),
        playlist: "private_match".to_owned(),
        password: String::new(),
        player_count: 0,
        max_players: 16,
        mod_info: ModInfoDto::default(),
    }
}

fn put(reg: &ServerRegistry, addr: &str, auth_port: u16, now: UnixTime) -> GameServer {
    reg.hybrid_update_put_at(None, Some(new_server(addr, auth_port)), &RegistryLimits::default(), now)
        .unwrap()
}

fn listed_ids(reg: &ServerRegistry, now: UnixTime) -> Vec<String> {
    let bytes = reg.server_list_json_at(now);
    let value: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
    value
        .as_array()
        .unwrap()
        .iter()
        .map(|entry| entry["id"].as_str().unwrap().to_owned())
        .collect()
}

#[test]
fn register_verify_heartbeat_expire() {
    let reg = registry(30, 120);
    let server = put(&reg, "1.2.3.4:37015", 8081, T0);

    let id_str = server.id.to_string();
    assert_eq!(id_str.len(), 32);
    assert!(id_str.bytes().all(|b| b.is_ascii_hexdigit()));
    assert_eq!(server.server_auth_token.to_string().len(), 32);
    assert_eq!(server.verification_deadline, T0 + secs(10));
    assert_eq!(reg.state_of(server.id, T0), Some(ServerState::Pending));

    // Pending entries are not listed or joinable.
    assert!(listed_ids(&reg, T0).is_empty());
    assert!(reg.get_by_id_at(server.id, T0).is_none());

    assert!(reg.verify_at(server.id, T0));
    assert_eq!(reg.state_of(server.id, T0), Some(ServerState::Alive));
    assert_eq!(listed_ids(&reg, T0 + 1), vec![id_str]);

    assert_eq!(reg.state_of(server.id, T0 + secs(40)), Some(ServerState::Ghost));
    assert_eq!(reg.state_of(server.id, T0 + secs(121)), Some(ServerState::Gone));

    // Listed until the alive window closes, then dropped with no further
    // mutation; the scheduled transition invalidates the cache.
    assert_eq!(listed_ids(&reg, T0 + secs(29)).len(), 1);
    assert!(listed_ids(&reg, T0 + secs(30)).is_empty());
}

#[test]
fn duplicate_auth_addr() {
    let reg = registry(30, 120);
    let a = put(&reg, "1.2.3.4:37015", 8081, T0);
    assert!(reg.verify_at(a.id, T0));

    let err = reg
        .hybrid_update_put_at(
            None,
            Some(new_server("1.2.3.4:37016", 8081)),
            &RegistryLimits::default(),
            T0 + 1,
        )
        .unwrap_err();
    assert_eq!(err, RegistryError::DuplicateAuthAddr);

    // Once A is gone its auth slot is free again.
    let b = reg
        .hybrid_update_put_at(
            None,
            Some(new_server("1.2.3.4:37016", 8081)),
            &RegistryLimits::default(),
            T0 + secs(121),
        )
        .unwrap();
    assert_ne!(b.id, a.id);
}

#[test]
fn restart_replaces_in_place() {
    let reg = registry(30, 120);
    let a = put(&reg, "1.2.3.4:37015", 8081, T0);
    assert!(reg.verify_at(a.id, T0));

    // Same game address and auth address while A is alive: same server
    // restarting. Fresh identity, fresh secret.
    let b = put(&reg, "1.2.3.4:37015", 8081, T0 + secs(5));
    assert_ne!(b.id, a.id);
    assert_ne!(b.server_auth_token, a.server_auth_token);

    assert!(reg.state_of(a.id, T0 + secs(5)).is_none());
    assert!(reg.verify_at(b.id, T0 + secs(5)));
    assert_eq!(reg.get_live_at(|_| true, T0 + secs(6)).len(), 1);
}

#[test]
fn update_values_and_heartbeat_revival() {
    let reg = registry(30, 120);
    let server = put(&reg, "1.2.3.4:37015", 8081, T0);
    assert!(reg.verify_at(server.id, T0));

    let mut update = ServerUpdate::new(server.id);
    update.name = Some("renamed".to_owned());
    update.player_count = Some(9);
    let updated = reg
        .hybrid_update_put_at(Some(&update), None, &RegistryLimits::default(), T0 + secs(1))
        .unwrap();
    assert_eq!(updated.name, "renamed");
    assert_eq!(updated.player_count, 9);
    // A value update is not a heartbeat.
    assert_eq!(updated.last_heartbeat, T0);

    // A heartbeat revives a ghost.
    let at = T0 + secs(100);
    assert_eq!(reg.state_of(server.id, at), Some(ServerState::Ghost));
    let revived = reg
        .hybrid_update_put_at(
            Some(&ServerUpdate::heartbeat(server.id, None)),
            None,
            &RegistryLimits::default(),
            at,
        )
        .unwrap();
    assert_eq!(revived.last_heartbeat, at);
    assert_eq!(reg.state_of(server.id, at), Some(ServerState::Alive));
    assert_eq!(revived.name, "renamed");
}

#[test]
fn ghost_value_update_is_not_found() {
    let reg = registry(30, 120);
    let server = put(&reg, "1.2.3.4:37015", 8081, T0);
    assert!(reg.verify_at(server.id, T0));

    let mut update = ServerUpdate::new(server.id);
    update.name = Some("too late".to_owned());
    let err = reg
        .hybrid_update_put_at(Some(&update), None, &RegistryLimits::default(), T0 + secs(60))
        .unwrap_err();
    assert_eq!(err, RegistryError::ServerNotFound);
}

#[test]
fn expect_ip_gates_updates() {
    let reg = registry(30, 120);
    let server = put(&reg, "1.2.3.4:37015", 8081, T0);
    assert!(reg.verify_at(server.id, T0));

    let mut update = ServerUpdate::heartbeat(server.id, Some("9.9.9.9".parse().unwrap()));
    let err = reg
        .hybrid_update_put_at(Some(&update), None, &RegistryLimits::default(), T0 + 1)
        .unwrap_err();
    assert_eq!(err, RegistryError::ServerNotFound);

    update.expect_ip = Some("1.2.3.4".parse().unwrap());
    assert!(reg
        .hybrid_update_put_at(Some(&update), None, &RegistryLimits::default(), T0 + 2)
        .is_ok());
}

#[test]
fn update_with_registration_fallback() {
    let reg = registry(30, 120);
    // The id is unknown (e.g. the registry restarted), but the request
    // carries enough to register anew.
    let update = ServerUpdate::heartbeat(GameServerId(0xdead), None);
    let server = reg
        .hybrid_update_put_at(
            Some(&update),
            Some(new_server("1.2.3.4:37015", 8081)),
            &RegistryLimits::default(),
            T0,
        )
        .unwrap();
    assert_ne!(server.id, GameServerId(0xdead));
    assert_eq!(reg.state_of(server.id, T0), Some(ServerState::Pending));
}

#[test]
fn gone_id_is_freed_then_falls_through() {
    let reg = registry(30, 120);
    let server = put(&reg, "1.2.3.4:37015", 8081, T0);
    assert!(reg.verify_at(server.id, T0));

    let at = T0 + secs(300);
    let err = reg
        .hybrid_update_put_at(
            Some(&ServerUpdate::heartbeat(server.id, None)),
            None,
            &RegistryLimits::default(),
            at,
        )
        .unwrap_err();
    assert_eq!(err, RegistryError::ServerNotFound);
    // The gone entry was freed eagerly.
    assert!(reg.state_of(server.id, at).is_none());
}

#[test]
fn per_ip_limit() {
    let reg = registry(30, 120);
    let limits = RegistryLimits {
        max_servers: -1,
        max_servers_per_ip: 2,
    };

    for port in [37015u16, 37016] {
        let server = reg
            .hybrid_update_put_at(
                None,
                Some(new_server(&format!("1.2.3.4:{}", port), port - 29000)),
                &limits,
                T0,
            )
            .unwrap();
        assert!(reg.verify_at(server.id, T0));
    }

    let err = reg
        .hybrid_update_put_at(None, Some(new_server("1.2.3.4:37017", 8017)), &limits, T0)
        .unwrap_err();
    assert_eq!(err, RegistryError::TooManyPerIp);

    // A different IP is unaffected.
    assert!(reg
        .hybrid_update_put_at(None, Some(new_server("5.6.7.8:37015", 8081)), &limits, T0)
        .is_ok());

    // Replacing one of our own does not count against the limit.
    assert!(reg
        .hybrid_update_put_at(None, Some(new_server("1.2.3.4:37015", 8015)), &limits, T0)
        .is_ok());

    // -1 disables the check entirely.
    let unlimited = RegistryLimits {
        max_servers: -1,
        max_servers_per_ip: -1,
    };
    for port in 40000u16..40010 {
        assert!(reg
            .hybrid_update_put_at(
                None,
                Some(new_server(&format!("1.2.3.4:{}", port), port + 1000)),
                &unlimited,
                T0,
            )
            .is_ok());
    }
}

#[test]
fn total_limit() {
    let reg = registry(30, 120);
    let limits = RegistryLimits {
        max_servers: 2,
        max_servers_per_ip: -1,
    };
    put_with(&reg, "1.2.3.4:37015", 8081, &limits);
    put_with(&reg, "5.6.7.8:37015", 8081, &limits);
    let err = reg
        .hybrid_update_put_at(None, Some(new_server("9.9.9.9:37015", 8081)), &limits, T0)
        .unwrap_err();
    assert_eq!(err, RegistryError::TooManyServers);
}

fn put_with(reg: &ServerRegistry, addr: &str, auth_port: u16, limits: &RegistryLimits) {
    reg.hybrid_update_put_at(None, Some(new_server(addr, auth_port)), limits, T0)
        .unwrap();
}

#[test]
fn address_validation() {
    let reg = registry(30, 120);
    let limits = RegistryLimits::default();

    let mut bad_port = new_server("1.2.3.4:37015", 8081);
    bad_port.game_addr.set_port(0);
    assert_eq!(
        reg.hybrid_update_put_at(None, Some(bad_port), &limits, T0).unwrap_err(),
        RegistryError::InvalidAddr
    );

    assert_eq!(
        reg.hybrid_update_put_at(None, Some(new_server("0.0.0.0:37015", 8081)), &limits, T0)
            .unwrap_err(),
        RegistryError::InvalidAddr
    );

    assert_eq!(
        reg.hybrid_update_put_at(None, Some(new_server("[2001:db8::1]:37015", 8081)), &limits, T0)
            .unwrap_err(),
        RegistryError::Ipv6NotAllowed
    );

    let v6 = ServerRegistry::new(Lifecycle::DEFAULT, Duration::from_secs(10), true);
    assert!(v6
        .hybrid_update_put_at(None, Some(new_server("[2001:db8::1]:37015", 8081)), &limits, T0)
        .is_ok());
}

#[test]
fn live_ids_and_game_addrs_are_unique() {
    let reg = registry(30, 120);
    let mut ids = std::collections::HashSet::new();
    for i in 0..20u16 {
        let server = put(&reg, &format!("10.0.0.{}:37015", i + 1), 8081, T0);
        assert!(reg.verify_at(server.id, T0));
        assert!(ids.insert(server.id));
    }
    let live = reg.get_live_at(|_| true, T0);
    assert_eq!(live.len(), 20);
    let addrs: std::collections::HashSet<_> = live.iter().map(|s| s.game_addr).collect();
    assert_eq!(addrs.len(), 20);
}

#[test]
fn concurrent_registration_on_same_game_addr() {
    let reg = Arc::new(registry(30, 120));
    let barrier = Arc::new(Barrier::new(2));

    let handles: Vec<_> = (0..2)
        .map(|_| {
            let reg = Arc::clone(&reg);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                reg.hybrid_update_put_at(
                    None,
                    Some(new_server("1.2.3.4:37015", 8081)),
                    &RegistryLimits::default(),
                    T0,
                )
                .unwrap()
            })
        })
        .collect();

    let winners: Vec<GameServer> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    assert_ne!(winners[0].id, winners[1].id);

    // Exactly one survives, and it is one of the two registrations.
    let survivors: Vec<_> = winners
        .iter()
        .filter(|w| reg.state_of(w.id, T0).is_some())
        .collect();
    assert_eq!(survivors.len(), 1);

    assert!(reg.verify_at(survivors[0].id, T0));
    let live = reg.get_live_at(|_| true, T0);
    assert_eq!(live.len(), 1);
    assert_eq!(live[0].game_addr, "1.2.3.4:37015".parse().unwrap());
}

#[test]
fn concurrent_registration_on_distinct_addrs() {
    let reg = Arc::new(registry(30, 120));
    let barrier = Arc::new(Barrier::new(8));
    let handles: Vec<_> = (0..8u16)
        .map(|i| {
            let reg = Arc::clone(&reg);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                reg.hybrid_update_put_at(
                    None,
                    Some(new_server(&format!("10.0.1.{}:37015", i + 1), 8081)),
                    &RegistryLimits::default(),
                    T0,
                )
                .unwrap()
            })
        })
        .collect();
    for handle in handles {
        let server = handle.join().unwrap();
        assert!(reg.state_of(server.id, T0).is_some());
    }
}

#[test]
fn delete_by_id_removes_alive_only() {
    let reg = registry(30, 120);
    let server = put(&reg, "1.2.3.4:37015", 8081, T0);

    // Pending is not deletable through the public path.
    assert!(!reg.delete_by_id_at(server.id, T0));
    assert!(reg.verify_at(server.id, T0));

    assert!(reg.delete_by_id_at(server.id, T0 + 1));
    assert!(!reg.delete_by_id_at(server.id, T0 + 2));
    assert!(listed_ids(&reg, T0 + 3).is_empty());
}

#[test]
fn remove_pending_clears_failed_verification() {
    let reg = registry(30, 120);
    let server = put(&reg, "1.2.3.4:37015", 8081, T0);
    assert!(reg.remove_pending(server.id));
    assert!(reg.state_of(server.id, T0).is_none());
    assert!(!reg.remove_pending(server.id));
}

#[test]
fn reap_frees_gone_entries() {
    let reg = registry(30, 120);
    let server = put(&reg, "1.2.3.4:37015", 8081, T0);
    assert!(reg.verify_at(server.id, T0));

    // Ghost entries survive the reaper.
    reg.reap_at(T0 + secs(60));
    assert_eq!(reg.state_of(server.id, T0 + secs(60)), Some(ServerState::Ghost));

    reg.reap_at(T0 + secs(121));
    assert!(reg.state_of(server.id, T0 + secs(121)).is_none());
}

#[test]
fn list_is_ordered_by_registration() {
    let reg = registry(30, 120);
    let mut expected = Vec::new();
    for i in 0..5u16 {
        let server = put(&reg, &format!("10.0.2.{}:37015", i + 1), 8081, T0 + i as u64);
        assert!(reg.verify_at(server.id, T0 + i as u64));
        expected.push(server.id.to_string());
    }
    // Mutating the middle entry must not reorder the list.
    let target: GameServerId = expected[2].parse().unwrap();
    let mut update = ServerUpdate::new(target);
    update.player_count = Some(3);
    reg.hybrid_update_put_at(Some(&update), None, &RegistryLimits::default(), T0 + secs(1))
        .unwrap();

    assert_eq!(listed_ids(&reg, T0 + secs(2)), expected);
}

#[test]
fn cache_sees_committed_mutations() {
    let reg = registry(30, 120);
    assert_eq!(&*reg.server_list_json_at(T0), b"[]");

    let server = put(&reg, "1.2.3.4:37015", 8081, T0);
    assert!(reg.verify_at(server.id, T0));
    assert_eq!(listed_ids(&reg, T0 + 1).len(), 1);

    let mut update = ServerUpdate::new(server.id);
    update.name = Some("fresh name".to_owned());
    reg.hybrid_update_put_at(Some(&update), None, &RegistryLimits::default(), T0 + 2)
        .unwrap();
    let bytes = reg.server_list_json_at(T0 + 3);
    assert!(std::str::from_utf8(&bytes).unwrap().contains("fresh name"));
}

#[test]
fn cache_fast_path_returns_same_buffer() {
    let reg = registry(30, 120);
    let server = put(&reg, "1.2.3.4:37015", 8081, T0);
    assert!(reg.verify_at(server.id, T0));

    let first = reg.server_list_json_at(T0 + 1);
    let second = reg.server_list_json_at(T0 + 2);
    assert!(Arc::ptr_eq(&first, &second));
}

#[test]
fn gzip_cache_decompresses_to_plain() {
    let reg = registry(30, 120);
    for i in 0..3u16 {
        let server = put(&reg, &format!("10.0.3.{}:37015", i + 1), 8081, T0);
        assert!(reg.verify_at(server.id, T0));
    }

    let plain = reg.server_list_json_at(T0 + 1);
    let gzipped = reg.server_list_gzip_at(T0 + 1);
    assert_eq!(server_util::http::gunzip(&gzipped).unwrap(), *plain);

    // Same revision, same buffer.
    let again = reg.server_list_gzip_at(T0 + 2);
    assert!(Arc::ptr_eq(&gzipped, &again));

    // A mutation obsoletes the gzip twin along with the plain buffer.
    let id: GameServerId = listed_ids(&reg, T0 + 2)[0].parse().unwrap();
    let mut update = ServerUpdate::new(id);
    update.map = Some("mp_rise".to_owned());
    reg.hybrid_update_put_at(Some(&update), None, &RegistryLimits::default(), T0 + 3)
        .unwrap();
    let plain2 = reg.server_list_json_at(T0 + 4);
    let gzipped2 = reg.server_list_gzip_at(T0 + 4);
    assert_ne!(&*plain, &*plain2);
    assert_eq!(server_util::http::gunzip(&gzipped2).unwrap(), *plain2);
}

#[test]
fn concurrent_cache_reads_coalesce_to_one_rebuild() {
    let reg = Arc::new(registry(30, 120));
    let server = put(&reg, "1.2.3.4:37015", 8081, T0);
    assert!(reg.verify_at(server.id, T0));

    // The verify invalidated the cache; every reader below contends on the
    // same rebuild.
    let barrier = Arc::new(Barrier::new(8));
    let handles: Vec<_> = (0..8)
        .map(|_| {
            let reg = Arc::clone(&reg);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                reg.server_list_json_at(T0 + 1)
            })
        })
        .collect();

    let buffers: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    // One winner rebuilt; everyone else reused its buffer.
    for buffer in &buffers[1..] {
        assert!(Arc::ptr_eq(&buffers[0], buffer));
    }
    let value: serde_json::Value = serde_json::from_slice(&buffers[0]).unwrap();
    assert_eq!(value.as_array().unwrap().len(), 1);
}

#[test]
fn heartbeats_reschedule_the_cache_expiry() {
    let reg = registry(30, 120);
    let server = put(&reg, "1.2.3.4:37015", 8081, T0);
    assert!(reg.verify_at(server.id, T0));
    assert_eq!(listed_ids(&reg, T0 + 1).len(), 1);

    // A heartbeat at t+25s pushes the alive window out to t+55s.
    reg.hybrid_update_put_at(
        Some(&ServerUpdate::heartbeat(server.id, None)),
        None,
        &RegistryLimits::default(),
        T0 + secs(25),
    )
    .unwrap();
    assert_eq!(listed_ids(&reg, T0 + secs(40)).len(), 1);
    assert!(listed_ids(&reg, T0 + secs(56)).is_empty());
}

#[test]
fn slots_are_reusable_through_replace_delete_create() {
    let reg = registry(30, 120);

    let a = put(&reg, "1.2.3.4:37015", 8081, T0);
    assert!(reg.verify_at(a.id, T0));

    // Restart replaces in place.
    let b = put(&reg, "1.2.3.4:37015", 8081, T0 + 1);
    assert!(reg.verify_at(b.id, T0 + 1));
    assert!(reg.state_of(a.id, T0 + 1).is_none());

    // Deletion frees both index slots for a later registration.
    assert!(reg.delete_by_id_at(b.id, T0 + 2));
    let c = put(&reg, "1.2.3.4:37015", 8081, T0 + 3);
    assert!(reg.verify_at(c.id, T0 + 3));
    assert_eq!(reg.get_live_at(|_| true, T0 + 4).len(), 1);
    assert_ne!(c.id, b.id);
}

#[test]
fn get_live_applies_the_predicate() {
    let reg = registry(30, 120);
    for (i, map) in ["mp_glitch", "mp_rise", "mp_glitch"].iter().enumerate() {
        let mut new = new_server(&format!("10.0.9.{}:37015", i + 1), 8081);
        new.map = (*map).to_owned();
        let server = reg
            .hybrid_update_put_at(None, Some(new), &RegistryLimits::default(), T0)
            .unwrap();
        assert!(reg.verify_at(server.id, T0));
    }
    let glitch = reg.get_live_at(|s| s.map == "mp_glitch", T0 + 1);
    assert_eq!(glitch.len(), 2);
}

#[test]
fn zero_dead_time_never_ghosts() {
    let reg = registry(0, 120);
    let server = put(&reg, "1.2.3.4:37015", 8081, T0);
    assert!(reg.verify_at(server.id, T0));

    assert_eq!(reg.state_of(server.id, T0 + secs(119)), Some(ServerState::Alive));
    assert_eq!(reg.state_of(server.id, T0 + secs(120)), Some(ServerState::Gone));
}
