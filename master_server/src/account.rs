// SPDX-FileCopyrightText: 2021 Softbear, Inc.
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Per-player auth records and the storage seam they live behind.

use crate::store::StoreError;
use async_trait::async_trait;
use master_protocol::id::{PlayerId, SessionToken};
use master_protocol::UnixTime;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Mutex;

/// `last_server_id` value denoting a local/self-hosted session.
pub const SELF_SERVER_ID: &str = "self";

/// One player's auth record. Created lazily on first successful
/// authentication, mutated on every later one, never deleted.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Account {
    pub uid: PlayerId,
    /// Display name as last resolved from the identity providers. May be
    /// empty; not unique across uids.
    pub username: String,
    /// IP the current session token was issued to.
    pub auth_ip: Option<IpAddr>,
    /// Unset until the first token is issued.
    pub auth_token: Option<SessionToken>,
    /// Absolute expiry in unix millis; zero means unset.
    pub auth_token_expiry: UnixTime,
    /// Registry id of the last joined server, or [`SELF_SERVER_ID`].
    pub last_server_id: String,
}

impl Account {
    pub fn new(uid: PlayerId) -> Self {
        Self {
            uid,
            username: String::new(),
            auth_ip: None,
            auth_token: None,
            auth_token_expiry: 0,
            last_server_id: String::new(),
        }
    }

    /// True if `token` is the single live session token for this account.
    pub fn token_valid(&self, token: SessionToken, now: UnixTime) -> bool {
        self.auth_token == Some(token) && self.auth_token_expiry != 0 && now < self.auth_token_expiry
    }
}

/// The account storage collaborator. Each operation is independently atomic;
/// there are no multi-op transactions, so concurrent authentications of the
/// same uid race and the last writer wins.
#[async_trait]
pub trait AccountStore: Send + Sync {
    async fn get(&self, uid: PlayerId) -> Result<Option<Account>, StoreError>;

    /// Case-insensitive exact match. Usernames are not unique, hence plural.
    async fn get_uids_by_username(&self, username: &str) -> Result<Vec<PlayerId>, StoreError>;

    /// Upsert by uid.
    async fn save(&self, account: Account) -> Result<(), StoreError>;
}

/// In-process account store. Suits a single-node master where accounts are
/// cheap to re-create from upstream authentication.
#[derive(Default)]
pub struct MemoryAccountStore {
    accounts: Mutex<HashMap<PlayerId, Account>>,
}

impl MemoryAccountStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl AccountStore for MemoryAccountStore {
    async fn get(&self, uid: PlayerId) -> Result<Option<Account>, StoreError> {
        Ok(self.accounts.lock().unwrap().get(&uid).cloned())
    }

    async fn get_uids_by_username(&self, username: &str) -> Result<Vec<PlayerId>, StoreError> {
        let accounts = self.accounts.lock().unwrap();
        let mut uids: Vec<PlayerId> = accounts
            .values()
            .filter(|account| {
                !account.username.is_empty() && account.username.eq_ignore_ascii_case(username)
            })
            .map(|account| account.uid)
            .collect();
        // Map order is arbitrary; keep the response stable.
        uids.sort_unstable();
        Ok(uids)
    }

    async fn save(&self, account: Account) -> Result<(), StoreError> {
        self.accounts.lock().unwrap().insert(account.uid, account);
        Ok(())
    }
}

/// Accounts as one JSON file per uid under a spool directory, mirrored in
/// memory for lookups. Writes go through a temp file and rename; the whole
/// spool is reloaded at startup.
pub struct FileAccountStore {
    dir: PathBuf,
    cache: Mutex<HashMap<PlayerId, Account>>,
}

impl FileAccountStore {
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir).await?;

        let mut cache = HashMap::new();
        let mut entries = tokio::fs::read_dir(&dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().map_or(true, |ext| ext != "json") {
                continue;
            }
            let bytes = tokio::fs::read(&path).await?;
            match serde_json::from_slice::<Account>(&bytes) {
                Ok(account) => {
                    cache.insert(account.uid, account);
                }
                Err(e) => {
                    // One bad record must not take the whole service down.
                    log::warn!("skipping malformed account file {}: {}", path.display(), e);
                }
            }
        }
        log::info!("loaded {} account(s) from {}", cache.len(), dir.display());
        Ok(Self {
            dir,
            cache: Mutex::new(cache),
        })
    }

    fn path(&self, uid: PlayerId) -> PathBuf {
        self.dir.join(format!("{}.json", uid))
    }
}

#[async_trait]
impl AccountStore for FileAccountStore {
    async fn get(&self, uid: PlayerId) -> Result<Option<Account>, StoreError> {
        Ok(self.cache.lock().unwrap().get(&uid).cloned())
    }

    async fn get_uids_by_username(&self, username: &str) -> Result<Vec<PlayerId>, StoreError> {
        let cache = self.cache.lock().unwrap();
        let mut uids: Vec<PlayerId> = cache
            .values()
            .filter(|account| {
                !account.username.is_empty() && account.username.eq_ignore_ascii_case(username)
            })
            .map(|account| account.uid)
            .collect();
        uids.sort_unstable();
        Ok(uids)
    }

    async fn save(&self, account: Account) -> Result<(), StoreError> {
        let bytes = serde_json::to_vec(&account).map_err(|e| StoreError::Corrupt {
            uid: account.uid,
            detail: format!("unserializable account: {}", e),
        })?;
        let path = self.path(account.uid);
        let tmp = self.dir.join(format!("{}.json.tmp", account.uid));
        tokio::fs::write(&tmp, &bytes).await?;
        tokio::fs::rename(&tmp, &path).await?;
        self.cache.lock().unwrap().insert(account.uid, account);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;

    fn account(uid: u64, username: &str) -> Account {
        let mut account = Account::new(PlayerId(uid));
        account.username = username.to_owned();
        account
    }

    #[tokio::test]
    async fn save_then_get() {
        let store = MemoryAccountStore::new();
        assert_eq!(store.get(PlayerId(7)).await.unwrap(), None);

        store.save(account(7, "Jack")).await.unwrap();
        let loaded = store.get(PlayerId(7)).await.unwrap().unwrap();
        assert_eq!(loaded.username, "Jack");

        // Upsert replaces.
        store.save(account(7, "Cooper")).await.unwrap();
        let loaded = store.get(PlayerId(7)).await.unwrap().unwrap();
        assert_eq!(loaded.username, "Cooper");
    }

    #[tokio::test]
    async fn username_lookup_is_case_insensitive_and_plural() {
        let store = MemoryAccountStore::new();
        store.save(account(1, "Viper")).await.unwrap();
        store.save(account(2, "viper")).await.unwrap();
        store.save(account(3, "Ash")).await.unwrap();

        assert_eq!(
            store.get_uids_by_username("VIPER").await.unwrap(),
            vec![PlayerId(1), PlayerId(2)]
        );
        assert_eq!(store.get_uids_by_username("ash").await.unwrap(), vec![PlayerId(3)]);
        assert!(store.get_uids_by_username("ronin").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn empty_username_never_matches() {
        let store = MemoryAccountStore::new();
        store.save(account(1, "")).await.unwrap();
        assert!(store.get_uids_by_username("").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn file_store_persists_across_reopen() {
        let dir = std::env::temp_dir().join(format!(
            "accounts-test-{}",
            rand::thread_rng().gen::<u64>()
        ));

        {
            let store = FileAccountStore::open(&dir).await.unwrap();
            let mut record = account(7, "Jack");
            record.auth_token = Some(SessionToken(0xfeed));
            record.auth_token_expiry = 12_345;
            record.auth_ip = Some("203.0.113.9".parse().unwrap());
            record.last_server_id = "self".to_owned();
            store.save(record).await.unwrap();
            store.save(account(8, "jack")).await.unwrap();
        }

        let reopened = FileAccountStore::open(&dir).await.unwrap();
        let loaded = reopened.get(PlayerId(7)).await.unwrap().unwrap();
        assert_eq!(loaded.username, "Jack");
        assert_eq!(loaded.auth_token, Some(SessionToken(0xfeed)));
        assert_eq!(loaded.auth_token_expiry, 12_345);
        assert_eq!(loaded.auth_ip, Some("203.0.113.9".parse().unwrap()));
        assert_eq!(loaded.last_server_id, "self");
        assert_eq!(
            reopened.get_uids_by_username("JACK").await.unwrap(),
            vec![PlayerId(7), PlayerId(8)]
        );

        let _ = tokio::fs::remove_dir_all(&dir).await;
    }

    #[tokio::test]
    async fn file_store_skips_malformed_records() {
        let dir = std::env::temp_dir().join(format!(
            "accounts-test-{}",
            rand::thread_rng().gen::<u64>()
        ));
        {
            let store = FileAccountStore::open(&dir).await.unwrap();
            store.save(account(1, "Ash")).await.unwrap();
        }
        tokio::fs::write(dir.join("2.json"), b"{half a record")
            .await
            .unwrap();

        let reopened = FileAccountStore::open(&dir).await.unwrap();
        assert!(reopened.get(PlayerId(1)).await.unwrap().is_some());
        assert!(reopened.get(PlayerId(2)).await.unwrap().is_none());

        let _ = tokio::fs::remove_dir_all(&dir).await;
    }

    #[test]
    fn token_validity() {
        let mut account = Account::new(PlayerId(7));
        let token = SessionToken(0x55);
        assert!(!account.token_valid(token, 1_000));

        account.auth_token = Some(token);
        account.auth_token_expiry = 2_000;
        assert!(account.token_valid(token, 1_999));
        assert!(!account.token_valid(token, 2_000));
        assert!(!account.token_valid(SessionToken(0x56), 1_999));
    }
}
