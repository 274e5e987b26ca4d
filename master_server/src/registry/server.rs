// SPDX-FileCopyrightText: 2021 Softbear, Inc.
// SPDX-License-Identifier: AGPL-3.0-or-later

use master_protocol::dto::ModInfoDto;
use master_protocol::id::{GameServerId, ServerAuthToken};
use master_protocol::UnixTime;
use std::net::SocketAddr;
use std::num::NonZeroU16;
use std::time::Duration;

/// Heartbeat-driven lifecycle durations. `dead_time <= ghost_time` when both
/// are enabled.
#[derive(Copy, Clone, Debug)]
pub struct Lifecycle {
    /// Without a heartbeat for this long, alive becomes ghost. Zero keeps
    /// servers alive all the way to `ghost_time`.
    pub dead_time: Duration,
    /// Without a heartbeat for this long, the entry is gone and its id and
    /// addresses may be reused. Zero disables the ghost stage.
    pub ghost_time: Duration,
}

impl Lifecycle {
    pub const DEFAULT: Self = Self {
        dead_time: Duration::from_secs(30),
        ghost_time: Duration::from_secs(2 * 60),
    };
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::DEFAULT
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ServerState {
    /// Registered, awaiting external verification.
    Pending,
    /// Heartbeat fresh; listed to clients and joinable.
    Alive,
    /// Heartbeat stale but within grace; revivable by a heartbeat.
    Ghost,
    /// Past grace; eligible for reaping and address reuse.
    Gone,
}

/// The state is a pure function of heartbeat age (and verification).
pub fn state_for_age(lifecycle: Lifecycle, age: Duration, verified: bool) -> ServerState {
    if !verified {
        return ServerState::Pending;
    }
    let Lifecycle {
        dead_time,
        ghost_time,
    } = lifecycle;
    if dead_time.is_zero() {
        if !ghost_time.is_zero() && age >= ghost_time {
            ServerState::Gone
        } else {
            ServerState::Alive
        }
    } else if age < dead_time {
        ServerState::Alive
    } else if !ghost_time.is_zero() && age < ghost_time {
        ServerState::Ghost
    } else {
        ServerState::Gone
    }
}

/// One registered game server. Copies of this struct are handed out of the
/// registry; the registry's indexed instance is only mutated under its lock.
#[derive(Clone, Debug)]
pub struct GameServer {
    pub id: GameServerId,
    /// IP and port of the game traffic.
    pub game_addr: SocketAddr,
    /// HTTP auth listener port on the same IP. `None` for servers that
    /// cannot accept inbound TCP; those get the UDP hand-off.
    pub auth_port: Option<NonZeroU16>,
    pub name: String,
    pub description: String,
    pub map: String,
    pub playlist: String,
    /// Empty means no password.
    pub password: String,
    pub player_count: u32,
    pub max_players: u32,
    pub mod_info: ModInfoDto,
    pub last_heartbeat: UnixTime,
    pub verified: bool,
    /// Absolute deadline by which verification must have succeeded.
    pub verification_deadline: UnixTime,
    pub server_auth_token: ServerAuthToken,
    /// Monotonically increasing registration counter; the client list is
    /// sorted by it.
    pub order: u64,
    /// Identity stamp; guards index unlinking against replacement races.
    pub(crate) epoch: u64,
}

impl GameServer {
    /// Target for the HTTP auth callback or the sigreq1 datagrams.
    pub fn auth_addr(&self) -> SocketAddr {
        match self.auth_port {
            Some(port) => SocketAddr::new(self.game_addr.ip(), port.get()),
            None => self.game_addr,
        }
    }

    pub fn has_auth_listener(&self) -> bool {
        self.auth_port.is_some()
    }

    pub fn has_password(&self) -> bool {
        !self.password.is_empty()
    }

    pub fn state(&self, lifecycle: Lifecycle, now: UnixTime) -> ServerState {
        let age = Duration::from_millis(now.saturating_sub(self.last_heartbeat));
        state_for_age(lifecycle, age, self.verified)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SEC: Duration = Duration::from_secs(1);

    fn lifecycle(dead: u64, ghost: u64) -> Lifecycle {
        Lifecycle {
            dead_time: SEC * dead as u32,
            ghost_time: SEC * ghost as u32,
        }
    }

    #[test]
    fn unverified_is_pending_regardless_of_age() {
        assert_eq!(
            state_for_age(lifecycle(30, 120), SEC * 1000, false),
            ServerState::Pending
        );
    }

    #[test]
    fn lifecycle_intervals() {
        let l = lifecycle(30, 120);
        assert_eq!(state_for_age(l, Duration::ZERO, true), ServerState::Alive);
        assert_eq!(state_for_age(l, SEC * 29, true), ServerState::Alive);
        assert_eq!(state_for_age(l, SEC * 30, true), ServerState::Ghost);
        assert_eq!(state_for_age(l, SEC * 119, true), ServerState::Ghost);
        assert_eq!(state_for_age(l, SEC * 120, true), ServerState::Gone);
    }

    #[test]
    fn zero_dead_time_skips_ghost() {
        let l = lifecycle(0, 120);
        assert_eq!(state_for_age(l, SEC * 119, true), ServerState::Alive);
        assert_eq!(state_for_age(l, SEC * 120, true), ServerState::Gone);
    }

    #[test]
    fn zero_ghost_time_goes_straight_to_gone() {
        let l = lifecycle(30, 0);
        assert_eq!(state_for_age(l, SEC * 29, true), ServerState::Alive);
        assert_eq!(state_for_age(l, SEC * 30, true), ServerState::Gone);
    }

    #[test]
    fn both_zero_is_immortal() {
        let l = lifecycle(0, 0);
        assert_eq!(state_for_age(l, SEC * 1_000_000, true), ServerState::Alive);
    }

    #[test]
    fn auth_addr_falls_back_to_game_addr() {
        let mut server = GameServer {
            id: GameServerId(1),
            game_addr: "1.2.3.4:37015".parse().unwrap(),
            auth_port: NonZeroU16::new(8081),
            name: String::new(),
            description: String::new(),
            map: String::new(),
            playlist: String::new(),
            password: String::new(),
            player_count: 0,
            max_players: 0,
            mod_info: Default::default(),
            last_heartbeat: 0,
            verified: true,
            verification_deadline: 0,
            server_auth_token: ServerAuthToken(0),
            order: 0,
            epoch: 0,
        };
        assert_eq!(server.auth_addr(), "1.2.3.4:8081".parse().unwrap());
        assert!(server.has_auth_listener());

        server.auth_port = None;
        assert_eq!(server.auth_addr(), server.game_addr);
        assert!(!server.has_auth_listener());
    }
}
