// SPDX-FileCopyrightText: 2021 Softbear, Inc.
// SPDX-License-Identifier: AGPL-3.0-or-later

//! The live in-memory directory of game servers. Single-node by intent: the
//! directory is cheap to rebuild from server heartbeats, so nothing here is
//! replicated or persisted.

mod cache;
pub mod server;

pub use server::{GameServer, Lifecycle, ServerState};

use cache::ServerListCache;
use master_protocol::dto::ModInfoDto;
use master_protocol::id::{GameServerId, ServerAuthToken};
use master_protocol::{get_unix_time_now, UnixTime};
use server_util::http::gzip;
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::num::NonZeroU16;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error, Eq, PartialEq)]
pub enum RegistryError {
    #[error("no such game server")]
    ServerNotFound,
    /// Another live server already answers auth on that address. The common
    /// cause is two server processes configured with the same auth port.
    #[error("a server with that auth address already exists")]
    DuplicateAuthAddr,
    #[error("invalid game address")]
    InvalidAddr,
    #[error("ipv6 game servers are not accepted")]
    Ipv6NotAllowed,
    #[error("server registration limit reached")]
    TooManyServers,
    #[error("per-ip server registration limit reached")]
    TooManyPerIp,
}

/// Registration limits. Negative values disable the respective limit.
#[derive(Copy, Clone, Debug)]
pub struct RegistryLimits {
    pub max_servers: i64,
    pub max_servers_per_ip: i64,
}

impl Default for RegistryLimits {
    fn default() -> Self {
        Self {
            max_servers: 1000,
            max_servers_per_ip: 25,
        }
    }
}

/// Mutation of an existing entry, located by id.
#[derive(Clone, Debug)]
pub struct ServerUpdate {
    pub id: GameServerId,
    /// When set, the entry's game IP must match or the update is treated as
    /// targeting a server we do not know.
    pub expect_ip: Option<IpAddr>,
    /// Refreshes `last_heartbeat` and may revive a ghost.
    pub heartbeat: bool,
    pub name: Option<String>,
    pub description: Option<String>,
    pub map: Option<String>,
    pub playlist: Option<String>,
    pub player_count: Option<u32>,
    pub max_players: Option<u32>,
    pub password: Option<String>,
    pub mod_info: Option<ModInfoDto>,
}

impl ServerUpdate {
    pub fn new(id: GameServerId) -> Self {
        Self {
            id,
            expect_ip: None,
            heartbeat: false,
            name: None,
            description: None,
            map: None,
            playlist: None,
            player_count: None,
            max_players: None,
            password: None,
            mod_info: None,
        }
    }

    pub fn heartbeat(id: GameServerId, expect_ip: Option<IpAddr>) -> Self {
        Self {
            expect_ip,
            heartbeat: true,
            ..Self::new(id)
        }
    }
}

/// A registration. The id and secrets are minted by the registry.
#[derive(Clone, Debug)]
pub struct NewGameServer {
    pub game_addr: SocketAddr,
    /// `None` declares the no-inbound-TCP variant (UDP hand-off).
    pub auth_port: Option<NonZeroU16>,
    pub name: String,
    pub description: String,
    pub map: String,
    pub playlist: String,
    pub password: String,
    pub player_count: u32,
    pub max_players: u32,
    pub mod_info: ModInfoDto,
}

/// Index entry: the id of the server occupying a slot plus its identity
/// stamp, so unlinking can verify it still refers to the same registration.
type Slot = (GameServerId, u64);

struct Inner {
    /// Primary store, keyed by id. The two address indexes refer into it.
    servers: HashMap<GameServerId, GameServer>,
    by_game_addr: HashMap<SocketAddr, Slot>,
    by_auth_addr: HashMap<SocketAddr, Slot>,
    next_order: u64,
    next_epoch: u64,
    /// Bumped by every committed mutation; lets the cache rebuild detect a
    /// racing write between its render snapshot and its install.
    mutations: u64,
    cache: ServerListCache,
}

pub struct ServerRegistry {
    inner: RwLock<Inner>,
    /// Fan-in for cache rebuilds: exactly one rebuilder at a time, losers
    /// block here and reuse the winner's buffer.
    rebuild: Mutex<()>,
    lifecycle: Lifecycle,
    verify_time: Duration,
    allow_ipv6: bool,
}

impl ServerRegistry {
    pub fn new(lifecycle: Lifecycle, verify_time: Duration, allow_ipv6: bool) -> Self {
        Self {
            inner: RwLock::new(Inner {
                servers: HashMap::new(),
                by_game_addr: HashMap::new(),
                by_auth_addr: HashMap::new(),
                next_order: 0,
                next_epoch: 0,
                mutations: 0,
                cache: ServerListCache::new(),
            }),
            rebuild: Mutex::new(()),
            lifecycle,
            verify_time,
            allow_ipv6,
        }
    }

    pub fn lifecycle(&self) -> Lifecycle {
        self.lifecycle
    }

    /// One entry point that refreshes an existing entry by id, or registers
    /// by game address, or both (update with registration fallback).
    pub fn hybrid_update_put(
        &self,
        update: Option<&ServerUpdate>,
        new: Option<NewGameServer>,
        limits: &RegistryLimits,
    ) -> Result<GameServer, RegistryError> {
        self.hybrid_update_put_at(update, new, limits, get_unix_time_now())
    }

    pub fn hybrid_update_put_at(
        &self,
        update: Option<&ServerUpdate>,
        new: Option<NewGameServer>,
        limits: &RegistryLimits,
        now: UnixTime,
    ) -> Result<GameServer, RegistryError> {
        let mut guard = self.inner.write().unwrap();
        let inner = &mut *guard;

        if let Some(update) = update {
            enum Disposition {
                Apply,
                FreeGone,
                NotFound,
            }
            let disposition = match inner.servers.get(&update.id) {
                None => Disposition::NotFound,
                Some(server) => {
                    let state = server.state(self.lifecycle, now);
                    let updatable = matches!(state, ServerState::Alive | ServerState::Pending)
                        || (state == ServerState::Ghost && update.heartbeat);
                    // Another server may have taken the auth slot since this
                    // one went quiet; if so, this id is no longer
                    // authoritative.
                    let slot_intact = inner.by_auth_addr.get(&server.auth_addr())
                        == Some(&(server.id, server.epoch));
                    let ip_ok = update
                        .expect_ip
                        .map_or(true, |ip| ip == server.game_addr.ip());

                    if state == ServerState::Gone {
                        Disposition::FreeGone
                    } else if updatable && slot_intact && ip_ok {
                        Disposition::Apply
                    } else {
                        Disposition::NotFound
                    }
                }
            };

            match disposition {
                Disposition::Apply => {
                    let server = inner.servers.get_mut(&update.id).unwrap();
                    Self::apply_update(server, update, now);
                    Self::commit(inner, self.lifecycle, now);
                    return Ok(inner.servers[&update.id].clone());
                }
                Disposition::FreeGone => {
                    // Free the stale entry, then fall through to the
                    // registration path (if any).
                    Self::unlink(inner, update.id);
                }
                Disposition::NotFound => {}
            }
            if new.is_none() {
                return Err(RegistryError::ServerNotFound);
            }
        }

        let new = match new {
            Some(new) => new,
            None => return Err(RegistryError::ServerNotFound),
        };
        let server = Self::register(inner, self.lifecycle, self.verify_time, self.allow_ipv6, new, limits, now)?;
        Self::commit(inner, self.lifecycle, now);
        Ok(server)
    }

    fn apply_update(server: &mut GameServer, update: &ServerUpdate, now: UnixTime) {
        if let Some(name) = &update.name {
            server.name = name.clone();
        }
        if let Some(description) = &update.description {
            server.description = description.clone();
        }
        if let Some(map) = &update.map {
            server.map = map.clone();
        }
        if let Some(playlist) = &update.playlist {
            server.playlist = playlist.clone();
        }
        if let Some(player_count) = update.player_count {
            server.player_count = player_count;
        }
        if let Some(max_players) = update.max_players {
            server.max_players = max_players;
        }
        if let Some(password) = &update.password {
            server.password = password.clone();
        }
        if let Some(mod_info) = &update.mod_info {
            server.mod_info = mod_info.clone();
        }
        if update.heartbeat {
            server.last_heartbeat = now;
        }
    }

    fn register(
        inner: &mut Inner,
        lifecycle: Lifecycle,
        verify_time: Duration,
        allow_ipv6: bool,
        new: NewGameServer,
        limits: &RegistryLimits,
        now: UnixTime,
    ) -> Result<GameServer, RegistryError> {
        let ip = new.game_addr.ip();
        if new.game_addr.port() == 0 || ip.is_unspecified() || ip.is_multicast() {
            return Err(RegistryError::InvalidAddr);
        }
        if ip.is_ipv6() && !allow_ipv6 {
            return Err(RegistryError::Ipv6NotAllowed);
        }
        let auth_addr = match new.auth_port {
            Some(port) => SocketAddr::new(ip, port.get()),
            None => new.game_addr,
        };

        // Entries this registration supersedes (same server restarting, or a
        // last-writer-wins race on the game address).
        let mut replaced: Vec<GameServerId> = Vec::new();

        let auth_holder = inner
            .by_auth_addr
            .get(&auth_addr)
            .map(|&(id, _)| id)
            .and_then(|id| {
                inner
                    .servers
                    .get(&id)
                    .map(|s| (id, s.state(lifecycle, now), s.game_addr))
            });
        if let Some((holder_id, state, holder_game_addr)) = auth_holder {
            if state == ServerState::Gone {
                Self::unlink(inner, holder_id);
            } else if holder_game_addr != new.game_addr {
                return Err(RegistryError::DuplicateAuthAddr);
            } else {
                replaced.push(holder_id);
            }
        }

        let game_holder = inner
            .by_game_addr
            .get(&new.game_addr)
            .map(|&(id, _)| id)
            .and_then(|id| inner.servers.get(&id).map(|s| (id, s.state(lifecycle, now))));
        if let Some((holder_id, state)) = game_holder {
            if state == ServerState::Gone {
                Self::unlink(inner, holder_id);
            } else if !replaced.contains(&holder_id) {
                replaced.push(holder_id);
            }
        }

        let counted = |server: &GameServer| {
            server.state(lifecycle, now) != ServerState::Gone && !replaced.contains(&server.id)
        };
        if limits.max_servers >= 0 {
            let live = inner.servers.values().filter(|s| counted(s)).count();
            if live as i64 >= limits.max_servers {
                return Err(RegistryError::TooManyServers);
            }
        }
        if limits.max_servers_per_ip >= 0 {
            let live_on_ip = inner
                .servers
                .values()
                .filter(|s| counted(s) && s.game_addr.ip() == ip)
                .count();
            if live_on_ip as i64 >= limits.max_servers_per_ip {
                return Err(RegistryError::TooManyPerIp);
            }
        }

        // Collisions on 128 random bits are astronomically unlikely, but a
        // retry costs nothing.
        let mut id = GameServerId::generate();
        while inner.servers.contains_key(&id) {
            id = GameServerId::generate();
        }

        for replaced_id in replaced {
            Self::unlink(inner, replaced_id);
        }

        let epoch = inner.next_epoch;
        inner.next_epoch += 1;
        let order = inner.next_order;
        inner.next_order += 1;

        let server = GameServer {
            id,
            game_addr: new.game_addr,
            auth_port: new.auth_port,
            name: new.name,
            description: new.description,
            map: new.map,
            playlist: new.playlist,
            password: new.password,
            player_count: new.player_count,
            max_players: new.max_players,
            mod_info: new.mod_info,
            last_heartbeat: now,
            verified: false,
            verification_deadline: now + verify_time.as_millis() as UnixTime,
            server_auth_token: ServerAuthToken::generate(),
            order,
            epoch,
        };

        inner.by_game_addr.insert(server.game_addr, (id, epoch));
        inner.by_auth_addr.insert(server.auth_addr(), (id, epoch));
        let copy = server.clone();
        inner.servers.insert(id, server);
        Ok(copy)
    }

    /// Removes `id` from every index, but only where the index entry still
    /// identifies this registration; a newer replacement must never be
    /// unlinked by a straggler freeing its predecessor.
    fn unlink(inner: &mut Inner, id: GameServerId) {
        if let Some(server) = inner.servers.remove(&id) {
            let slot = (server.id, server.epoch);
            if inner.by_game_addr.get(&server.game_addr) == Some(&slot) {
                inner.by_game_addr.remove(&server.game_addr);
            }
            let auth_addr = server.auth_addr();
            if inner.by_auth_addr.get(&auth_addr) == Some(&slot) {
                inner.by_auth_addr.remove(&auth_addr);
            }
        }
    }

    /// Finishes a mutation: bumps the mutation counter and invalidates the
    /// cache, all before the write lock drops, so any cache read that starts
    /// after this commit observes the change.
    fn commit(inner: &mut Inner, lifecycle: Lifecycle, now: UnixTime) {
        inner.mutations = inner.mutations.wrapping_add(1);
        let next = Self::next_transition(&inner.servers, lifecycle, now);
        inner.cache.invalidate(next);
    }

    /// Earliest future alive→ghost or ghost→gone transition across verified
    /// servers. Zero when nothing is scheduled.
    fn next_transition(
        servers: &HashMap<GameServerId, GameServer>,
        lifecycle: Lifecycle,
        now: UnixTime,
    ) -> UnixTime {
        let mut next: UnixTime = 0;
        let mut consider = |at: UnixTime| {
            if at > now && (next == 0 || at < next) {
                next = at;
            }
        };
        for server in servers.values() {
            if !server.verified {
                continue;
            }
            if !lifecycle.dead_time.is_zero() {
                consider(server.last_heartbeat + lifecycle.dead_time.as_millis() as UnixTime);
            }
            if !lifecycle.ghost_time.is_zero() {
                consider(server.last_heartbeat + lifecycle.ghost_time.as_millis() as UnixTime);
            }
        }
        next
    }

    /// Deep copies of all alive servers matching `predicate`, in no
    /// particular order.
    pub fn get_live<F: FnMut(&GameServer) -> bool>(&self, predicate: F) -> Vec<GameServer> {
        self.get_live_at(predicate, get_unix_time_now())
    }

    pub fn get_live_at<F: FnMut(&GameServer) -> bool>(
        &self,
        mut predicate: F,
        now: UnixTime,
    ) -> Vec<GameServer> {
        let inner = self.inner.read().unwrap();
        inner
            .servers
            .values()
            .filter(|s| s.state(self.lifecycle, now) == ServerState::Alive)
            .filter(|s| predicate(s))
            .cloned()
            .collect()
    }

    /// Deep copy of an alive server.
    pub fn get_by_id(&self, id: GameServerId) -> Option<GameServer> {
        self.get_by_id_at(id, get_unix_time_now())
    }

    pub fn get_by_id_at(&self, id: GameServerId, now: UnixTime) -> Option<GameServer> {
        let inner = self.inner.read().unwrap();
        inner
            .servers
            .get(&id)
            .filter(|s| s.state(self.lifecycle, now) == ServerState::Alive)
            .cloned()
    }

    /// Current state of an entry, for diagnostics and tests.
    pub fn state_of(&self, id: GameServerId, now: UnixTime) -> Option<ServerState> {
        let inner = self.inner.read().unwrap();
        inner.servers.get(&id).map(|s| s.state(self.lifecycle, now))
    }

    /// True iff an alive server was removed.
    pub fn delete_by_id(&self, id: GameServerId) -> bool {
        self.delete_by_id_at(id, get_unix_time_now())
    }

    pub fn delete_by_id_at(&self, id: GameServerId, now: UnixTime) -> bool {
        let mut guard = self.inner.write().unwrap();
        let inner = &mut *guard;
        let alive = inner
            .servers
            .get(&id)
            .map_or(false, |s| s.state(self.lifecycle, now) == ServerState::Alive);
        if alive {
            Self::unlink(inner, id);
            Self::commit(inner, self.lifecycle, now);
        }
        alive
    }

    /// Promotes a pending entry to alive after external verification. The
    /// heartbeat clock restarts at `now`. Returns false when the entry no
    /// longer exists (or was already verified and replaced).
    pub fn verify(&self, id: GameServerId) -> bool {
        self.verify_at(id, get_unix_time_now())
    }

    pub fn verify_at(&self, id: GameServerId, now: UnixTime) -> bool {
        let mut guard = self.inner.write().unwrap();
        let inner = &mut *guard;
        let promoted = match inner.servers.get_mut(&id) {
            Some(server) if !server.verified => {
                server.verified = true;
                server.last_heartbeat = now;
                true
            }
            _ => false,
        };
        if promoted {
            Self::commit(inner, self.lifecycle, now);
        }
        promoted
    }

    /// Removes a pending entry whose verification failed.
    pub fn remove_pending(&self, id: GameServerId) -> bool {
        let mut guard = self.inner.write().unwrap();
        let inner = &mut *guard;
        let pending = inner.servers.get(&id).map_or(false, |s| !s.verified);
        if pending {
            Self::unlink(inner, id);
            Self::commit(inner, self.lifecycle, get_unix_time_now());
        }
        pending
    }

    /// Frees every gone entry. Called periodically; gone entries are also
    /// freed opportunistically when their slots are contended.
    pub fn reap(&self) {
        self.reap_at(get_unix_time_now())
    }

    pub fn reap_at(&self, now: UnixTime) {
        let mut guard = self.inner.write().unwrap();
        let inner = &mut *guard;
        let gone: Vec<GameServerId> = inner
            .servers
            .values()
            .filter(|s| s.state(self.lifecycle, now) == ServerState::Gone)
            .map(|s| s.id)
            .collect();
        if gone.is_empty() {
            return;
        }
        let count = gone.len();
        for id in gone {
            Self::unlink(inner, id);
        }
        Self::commit(inner, self.lifecycle, now);
        log::debug!("reaped {} gone server(s)", count);
    }

    /// (alive, pending) entry counts, for `/status`.
    pub fn counts(&self) -> (usize, usize) {
        let now = get_unix_time_now();
        let inner = self.inner.read().unwrap();
        let mut alive = 0;
        let mut pending = 0;
        for server in inner.servers.values() {
            match server.state(self.lifecycle, now) {
                ServerState::Alive => alive += 1,
                ServerState::Pending => pending += 1,
                _ => {}
            }
        }
        (alive, pending)
    }

    /// The cached plain-JSON server list. Fast path is a read lock and an
    /// `Arc` clone; a stale cache is rebuilt by exactly one caller while the
    /// rest wait and reuse its buffer.
    pub fn server_list_json(&self) -> Arc<Vec<u8>> {
        self.server_list_json_at(get_unix_time_now())
    }

    pub fn server_list_json_at(&self, now: UnixTime) -> Arc<Vec<u8>> {
        {
            let inner = self.inner.read().unwrap();
            if inner.cache.fresh(now) {
                return inner.cache.plain();
            }
        }
        let _rebuild = self.rebuild.lock().unwrap();
        self.rebuild_plain_locked(now).0
    }

    /// The gzip twin of the plain cache, built lazily per plain revision.
    pub fn server_list_gzip(&self) -> Arc<Vec<u8>> {
        self.server_list_gzip_at(get_unix_time_now())
    }

    pub fn server_list_gzip_at(&self, now: UnixTime) -> Arc<Vec<u8>> {
        {
            let inner = self.inner.read().unwrap();
            if inner.cache.fresh(now) {
                if let Some(gzipped) = inner.cache.gzip_for(inner.cache.revision()) {
                    return gzipped;
                }
            }
        }
        let _rebuild = self.rebuild.lock().unwrap();
        let (plain, revision) = self.rebuild_plain_locked(now);
        {
            let inner = self.inner.read().unwrap();
            if let Some(gzipped) = inner.cache.gzip_for(revision) {
                return gzipped;
            }
        }
        let gzipped = gzip(&plain);
        let mut inner = self.inner.write().unwrap();
        if inner.cache.revision() == revision {
            inner.cache.install_gzip(revision, gzipped);
            inner.cache.gzip_for(revision).unwrap()
        } else {
            // A racing rebuild replaced the plain buffer; ours still
            // decompresses to the plain bytes the caller was handed.
            Arc::new(gzipped)
        }
    }

    /// Must be called with the rebuild mutex held. Returns the fresh plain
    /// buffer and its revision.
    fn rebuild_plain_locked(&self, now: UnixTime) -> (Arc<Vec<u8>>, u64) {
        // The winner of the rebuild race may have already produced a fresh
        // buffer while this caller waited on the mutex.
        {
            let inner = self.inner.read().unwrap();
            if inner.cache.fresh(now) {
                return (inner.cache.plain(), inner.cache.revision());
            }
        }

        // Render under the read lock so no mutation can race the snapshot.
        let (snapshot, bytes) = {
            let inner = self.inner.read().unwrap();
            let mut alive: Vec<&GameServer> = inner
                .servers
                .values()
                .filter(|s| s.state(self.lifecycle, now) == ServerState::Alive)
                .collect();
            alive.sort_unstable_by_key(|s| s.order);
            (inner.mutations, cache::render_server_list(alive.into_iter()))
        };

        let mut guard = self.inner.write().unwrap();
        let inner = &mut *guard;
        let clean = inner.mutations == snapshot;
        let next = Self::next_transition(&inner.servers, self.lifecycle, now);
        inner.cache.install_plain(bytes, clean, next);
        (inner.cache.plain(), inner.cache.revision())
    }
}

#[cfg(test)]
mod tests;
