// SPDX-FileCopyrightText: 2021 Softbear, Inc.
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Display-name resolution against the two upstream identity providers.
//! Lookups are best-effort: a player with no resolvable name still gets to
//! play, just anonymously.

use lru::LruCache;
use master_protocol::id::PlayerId;
use master_protocol::name::sanitize_username;
use master_protocol::{get_unix_time_now, UnixTime};
use serde::Deserialize;
use std::fmt::{self, Display, Formatter};
use std::str::FromStr;
use std::sync::Mutex;
use std::time::Duration;

pub const DEFAULT_LOOKUP_TIMEOUT: Duration = Duration::from_secs(15);

/// How long a resolved (or definitively missing) name is reused before the
/// providers are asked again. Names change rarely and the providers rate
/// limit aggressively.
const CACHE_TTL: Duration = Duration::from_secs(60 * 60);
const CACHE_CAPACITY: usize = 4096;

/// Which provider(s) answer username lookups, and in what order.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum UsernameSource {
    /// Lookups disabled; every name resolves empty.
    None,
    Origin,
    /// Origin, falling back to EAX.
    OriginEax,
    /// Origin, with a shadow EAX lookup that only logs disagreements.
    OriginEaxDebug,
    Eax,
    /// EAX, falling back to Origin.
    EaxOrigin,
}

impl UsernameSource {
    fn as_str(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Origin => "origin",
            Self::OriginEax => "origin-eax",
            Self::OriginEaxDebug => "origin-eax-debug",
            Self::Eax => "eax",
            Self::EaxOrigin => "eax-origin",
        }
    }
}

impl Display for UsernameSource {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug)]
pub struct InvalidUsernameSource;

impl Display for InvalidUsernameSource {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str("expected none, origin, origin-eax, origin-eax-debug, eax or eax-origin")
    }
}

impl FromStr for UsernameSource {
    type Err = InvalidUsernameSource;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "none" => Self::None,
            "origin" => Self::Origin,
            "origin-eax" => Self::OriginEax,
            "origin-eax-debug" => Self::OriginEaxDebug,
            "eax" => Self::Eax,
            "eax-origin" => Self::EaxOrigin,
            _ => return Err(InvalidUsernameSource),
        })
    }
}

/// `GET {origin}/atom/users?userIds={uid}` response.
#[derive(Deserialize)]
struct OriginUsers {
    #[serde(default)]
    users: Vec<OriginUser>,
}

#[derive(Deserialize)]
struct OriginUser {
    #[serde(rename = "userId", default)]
    user_id: String,
    #[serde(rename = "eaId", default)]
    ea_id: String,
}

/// `GET {eax}/v1/player/{uid}` response.
#[derive(Deserialize)]
struct EaxPlayer {
    #[serde(rename = "displayName", default)]
    display_name: String,
}

enum Provider {
    Origin,
    Eax,
}

impl Provider {
    fn name(&self) -> &'static str {
        match self {
            Self::Origin => "origin",
            Self::Eax => "eax",
        }
    }
}

pub struct IdentityResolver {
    source: UsernameSource,
    client: reqwest::Client,
    origin_base: String,
    eax_base: String,
    cache: Mutex<LruCache<PlayerId, (String, UnixTime)>>,
}

impl IdentityResolver {
    pub fn new(
        source: UsernameSource,
        client: reqwest::Client,
        origin_base: String,
        eax_base: String,
    ) -> Self {
        Self {
            source,
            client,
            origin_base,
            eax_base,
            cache: Mutex::new(LruCache::new(CACHE_CAPACITY)),
        }
    }

    /// Resolves a display name, or empty when disabled, unknown, or all
    /// configured providers failed. Dropping the returned future aborts any
    /// outstanding requests.
    pub async fn lookup(&self, uid: PlayerId) -> String {
        if self.source == UsernameSource::None {
            return String::new();
        }

        let now = get_unix_time_now();
        if let Some(name) = self.cached(uid, now) {
            return name;
        }
        let name = self.resolve(uid).await;
        // Only hits are cached; an empty result may be a transient provider
        // failure, and those must not stick for a whole TTL.
        if !name.is_empty() {
            self.cache.lock().unwrap().put(uid, (name.clone(), now));
        }
        name
    }

    fn cached(&self, uid: PlayerId, now: UnixTime) -> Option<String> {
        let mut cache = self.cache.lock().unwrap();
        let hit = match cache.get(&uid) {
            Some((name, resolved_at))
                if now.saturating_sub(*resolved_at) < CACHE_TTL.as_millis() as UnixTime =>
            {
                Some(name.clone())
            }
            // Present but expired.
            Some(_) => None,
            None => return None,
        };
        if hit.is_none() {
            cache.pop(&uid);
        }
        hit
    }

    async fn resolve(&self, uid: PlayerId) -> String {
        match self.source {
            UsernameSource::None => String::new(),
            UsernameSource::Origin => self.attempt(Provider::Origin, uid).await.unwrap_or_default(),
            UsernameSource::OriginEax => match self.attempt(Provider::Origin, uid).await {
                Some(name) => name,
                None => self.attempt(Provider::Eax, uid).await.unwrap_or_default(),
            },
            UsernameSource::OriginEaxDebug => {
                let origin = self.attempt(Provider::Origin, uid).await;
                let eax = self.attempt(Provider::Eax, uid).await;
                if origin != eax {
                    log::warn!(
                        "identity providers disagree for {}: origin={:?} eax={:?}",
                        uid,
                        origin,
                        eax
                    );
                }
                origin.or(eax).unwrap_or_default()
            }
            UsernameSource::Eax => self.attempt(Provider::Eax, uid).await.unwrap_or_default(),
            UsernameSource::EaxOrigin => match self.attempt(Provider::Eax, uid).await {
                Some(name) => name,
                None => self.attempt(Provider::Origin, uid).await.unwrap_or_default(),
            },
        }
    }

    /// One provider attempt, with the outcome collapsed for fallback logic:
    /// transient failures and "no such user" both yield `None`, at different
    /// log severities.
    async fn attempt(&self, provider: Provider, uid: PlayerId) -> Option<String> {
        let outcome = match provider {
            Provider::Origin => self.origin_lookup(uid).await,
            Provider::Eax => self.eax_lookup(uid).await,
        };
        match outcome {
            Ok(Some(name)) => {
                let name = sanitize_username(&name);
                if name.is_empty() {
                    log::debug!("{} returned an unusable name for {}", provider.name(), uid);
                    None
                } else {
                    Some(name)
                }
            }
            Ok(None) => {
                log::debug!("{} has no user {}", provider.name(), uid);
                None
            }
            Err(e) => {
                log::warn!("{} lookup for {} failed: {}", provider.name(), uid, e);
                None
            }
        }
    }

    /// `Ok(Some(name))` found, `Ok(None)` definitively no such user,
    /// `Err` transient.
    async fn origin_lookup(&self, uid: PlayerId) -> Result<Option<String>, reqwest::Error> {
        let url = format!("{}/atom/users?userIds={}", self.origin_base, uid);
        let response = self.client.get(&url).send().await?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let users: OriginUsers = response.error_for_status()?.json().await?;
        let uid_str = uid.to_string();
        Ok(users
            .users
            .into_iter()
            .find(|user| user.user_id == uid_str)
            .map(|user| user.ea_id)
            .filter(|name| !name.is_empty()))
    }

    async fn eax_lookup(&self, uid: PlayerId) -> Result<Option<String>, reqwest::Error> {
        let url = format!("{}/v1/player/{}", self.eax_base, uid);
        let response = self.client.get(&url).send().await?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let player: EaxPlayer = response.error_for_status()?.json().await?;
        Ok(Some(player.display_name).filter(|name| !name.is_empty()))
    }
}
