// SPDX-FileCopyrightText: 2021 Softbear, Inc.
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Main-menu promo content. Pluggable so operators can point the slots at
//! their own news without redeploying.

use async_trait::async_trait;
use master_protocol::dto::{
    MainMenuPromosDto, PromoLargeButtonDto, PromoNewInfoDto, PromoSmallButtonDto,
};
use std::path::PathBuf;

#[async_trait]
pub trait PromoSource: Send + Sync {
    async fn fetch(&self) -> MainMenuPromosDto;
}

/// Shipped defaults, also the fallback when a configured source fails.
pub fn default_promos() -> MainMenuPromosDto {
    MainMenuPromosDto {
        new_info: PromoNewInfoDto {
            title1: "Welcome to the community master server".to_owned(),
            title2: "Browse servers or host your own".to_owned(),
            title3: String::new(),
        },
        large_button: PromoLargeButtonDto {
            title: "Server hosting".to_owned(),
            text: "Run your own server and it will appear in this browser.".to_owned(),
            url: "https://r2northstar.gitbook.io/r2northstar-wiki/hosting-a-server-with-northstar"
                .to_owned(),
            image_index: 0,
        },
        small_button1: PromoSmallButtonDto {
            title: "Wiki".to_owned(),
            url: "https://r2northstar.gitbook.io/r2northstar-wiki/".to_owned(),
            image_index: 0,
        },
        small_button2: PromoSmallButtonDto {
            title: "Mods".to_owned(),
            url: "https://northstar.thunderstore.io/".to_owned(),
            image_index: 1,
        },
    }
}

pub struct StaticPromoSource(pub MainMenuPromosDto);

#[async_trait]
impl PromoSource for StaticPromoSource {
    async fn fetch(&self) -> MainMenuPromosDto {
        self.0.clone()
    }
}

/// Re-reads a JSON file per request; promo traffic is light and operators
/// edit the file live.
pub struct FilePromoSource {
    path: PathBuf,
}

impl FilePromoSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl PromoSource for FilePromoSource {
    async fn fetch(&self) -> MainMenuPromosDto {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) => match serde_json::from_slice(&bytes) {
                Ok(promos) => promos,
                Err(e) => {
                    log::warn!("promos file {} is malformed: {}", self.path.display(), e);
                    default_promos()
                }
            },
            Err(e) => {
                log::warn!("promos file {} unreadable: {}", self.path.display(), e);
                default_promos()
            }
        }
    }
}
