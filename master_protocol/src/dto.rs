// SPDX-FileCopyrightText: 2021 Softbear, Inc.
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Data transfer objects for the public HTTP surface. Field names follow the
//! game's conventions (a mix of camelCase and TitleCase) rather than ours;
//! the serde renames are load-bearing.

use crate::id::{GameServerId, JoinToken, PlayerId, ServerAuthToken, SessionToken};
use serde::{Deserialize, Serialize};

/// One mod carried by a game server. Clients refuse to join servers whose
/// required mods they lack.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct ModDto {
    #[serde(rename = "Name", default)]
    pub name: String,
    #[serde(rename = "Version", default)]
    pub version: String,
    #[serde(rename = "RequiredOnClient", default)]
    pub required_on_client: bool,
}

/// The `{"Mods": [...]}` wrapper the game uses for mod lists, both in the
/// `modinfo` upload and in the server list projection.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct ModInfoDto {
    #[serde(rename = "Mods", default)]
    pub mods: Vec<ModDto>,
}

/// The three-line news ticker on the main menu.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct PromoNewInfoDto {
    #[serde(rename = "Title1", default)]
    pub title1: String,
    #[serde(rename = "Title2", default)]
    pub title2: String,
    #[serde(rename = "Title3", default)]
    pub title3: String,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct PromoLargeButtonDto {
    #[serde(rename = "Title", default)]
    pub title: String,
    #[serde(rename = "Text", default)]
    pub text: String,
    #[serde(rename = "Url", default)]
    pub url: String,
    #[serde(rename = "ImageIndex", default)]
    pub image_index: u32,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct PromoSmallButtonDto {
    #[serde(rename = "Title", default)]
    pub title: String,
    #[serde(rename = "Url", default)]
    pub url: String,
    #[serde(rename = "ImageIndex", default)]
    pub image_index: u32,
}

/// Payload of `/client/mainmenupromos`.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct MainMenuPromosDto {
    #[serde(rename = "newInfo", default)]
    pub new_info: PromoNewInfoDto,
    #[serde(rename = "largeButton", default)]
    pub large_button: PromoLargeButtonDto,
    #[serde(rename = "smallButton1", default)]
    pub small_button1: PromoSmallButtonDto,
    #[serde(rename = "smallButton2", default)]
    pub small_button2: PromoSmallButtonDto,
}

/// Success payload of `/client/origin_auth`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OriginAuthDto {
    pub success: bool,
    pub token: SessionToken,
}

/// Success payload of `/client/auth_with_server`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AuthWithServerDto {
    pub success: bool,
    pub ip: String,
    pub port: u16,
    #[serde(rename = "authToken")]
    pub auth_token: JoinToken,
}

/// Success payload of `/client/auth_with_self`. `persistent_data` is the raw
/// pdata rendered as a JSON array of numbers; the encoding is dictated by the
/// game and is not negotiable.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AuthWithSelfDto {
    pub success: bool,
    pub id: String,
    #[serde(rename = "persistentData")]
    pub persistent_data: Vec<u8>,
    #[serde(rename = "authToken")]
    pub auth_token: JoinToken,
}

/// Success payload of the server create path of `/server/add_server`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AddServerDto {
    pub success: bool,
    pub id: GameServerId,
    #[serde(rename = "serverAuthToken")]
    pub server_auth_token: ServerAuthToken,
}

/// Success payload of `/accounts/lookup_uid`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LookupUidDto {
    pub success: bool,
    pub username: String,
    pub matches: Vec<PlayerId>,
}

/// Success payload of `/accounts/get_username`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GetUsernameDto {
    pub success: bool,
    pub uid: PlayerId,
    pub matches: Vec<String>,
}
