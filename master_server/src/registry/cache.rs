// SPDX-FileCopyrightText: 2021 Softbear, Inc.
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Cached projections of the live server list. `/client/servers` is by far
//! the hottest endpoint while the underlying data changes slowly, so the
//! plain JSON bytes and their gzip twin are kept ready-made and rebuilt
//! lazily.

use crate::registry::server::GameServer;
use master_protocol::UnixTime;
use std::fmt::Write;
use std::sync::Arc;

pub(crate) struct ServerListCache {
    /// Set by every value mutation; forces a rebuild on the next read.
    force: bool,
    /// False until the first rebuild.
    valid: bool,
    /// Earliest upcoming alive→ghost or ghost→gone transition, in unix
    /// millis. Zero when no transition is scheduled.
    next_update_at: UnixTime,
    /// Bumped on every plain rebuild; the gzip buffer is keyed to it.
    revision: u64,
    plain: Arc<Vec<u8>>,
    gzip: Option<(u64, Arc<Vec<u8>>)>,
}

impl ServerListCache {
    pub fn new() -> Self {
        Self {
            force: false,
            valid: false,
            next_update_at: 0,
            revision: 0,
            plain: Arc::new(b"[]".to_vec()),
            gzip: None,
        }
    }

    /// True when the plain buffer may be served without a rebuild.
    pub fn fresh(&self, now: UnixTime) -> bool {
        self.valid && !self.force && (self.next_update_at == 0 || now < self.next_update_at)
    }

    /// Called by every registry mutation before its write lock drops.
    pub fn invalidate(&mut self, next_update_at: UnixTime) {
        self.force = true;
        self.next_update_at = next_update_at;
    }

    /// Installs a freshly rendered plain buffer. `clean` is false when a
    /// mutation slipped in after the render snapshot was taken; the buffer is
    /// still installed (it is newer than what it replaces) but stays marked
    /// stale so the next reader rebuilds again.
    pub fn install_plain(&mut self, bytes: Vec<u8>, clean: bool, next_update_at: UnixTime) {
        self.plain = Arc::new(bytes);
        self.revision = self.revision.wrapping_add(1);
        self.valid = true;
        self.next_update_at = next_update_at;
        if clean {
            self.force = false;
        }
    }

    pub fn plain(&self) -> Arc<Vec<u8>> {
        Arc::clone(&self.plain)
    }

    pub fn revision(&self) -> u64 {
        self.revision
    }

    /// The gzip twin, if it belongs to the given plain revision.
    pub fn gzip_for(&self, revision: u64) -> Option<Arc<Vec<u8>>> {
        match &self.gzip {
            Some((rev, bytes)) if *rev == revision => Some(Arc::clone(bytes)),
            _ => None,
        }
    }

    pub fn install_gzip(&mut self, revision: u64, bytes: Vec<u8>) {
        self.gzip = Some((revision, Arc::new(bytes)));
    }
}

/// Renders the client-visible server list. `servers` must already be
/// filtered to alive entries and sorted by registration order. Written by
/// hand rather than through a reflective encoder; this runs for every cache
/// miss on the hottest endpoint.
pub(crate) fn render_server_list<'a>(servers: impl Iterator<Item = &'a GameServer>) -> Vec<u8> {
    let mut out = String::with_capacity(4096);
    out.push('[');
    for (i, server) in servers.enumerate() {
        if i > 0 {
            out.push(',');
        }
        out.push_str("{\"lastHeartbeat\":");
        let _ = write!(out, "{}", server.last_heartbeat as i64);
        out.push_str(",\"id\":\"");
        let _ = write!(out, "{}", server.id);
        out.push_str("\",\"name\":");
        write_json_str(&mut out, &server.name);
        out.push_str(",\"description\":");
        write_json_str(&mut out, &server.description);
        out.push_str(",\"playerCount\":");
        let _ = write!(out, "{}", server.player_count);
        out.push_str(",\"maxPlayers\":");
        let _ = write!(out, "{}", server.max_players);
        out.push_str(",\"map\":");
        write_json_str(&mut out, &server.map);
        out.push_str(",\"playlist\":");
        write_json_str(&mut out, &server.playlist);
        out.push_str(",\"hasPassword\":");
        out.push_str(if server.has_password() { "true" } else { "false" });
        out.push_str(",\"modInfo\":{\"Mods\":[");
        for (j, m) in server.mod_info.mods.iter().enumerate() {
            if j > 0 {
                out.push(',');
            }
            out.push_str("{\"Name\":");
            write_json_str(&mut out, &m.name);
            out.push_str(",\"Version\":");
            write_json_str(&mut out, &m.version);
            out.push_str(",\"RequiredOnClient\":");
            out.push_str(if m.required_on_client { "true" } else { "false" });
            out.push('}');
        }
        out.push_str("]}}");
    }
    out.push(']');
    out.into_bytes()
}

/// Appends `s` as a JSON string literal.
fn write_json_str(out: &mut String, s: &str) {
    out.push('"');
    for c in s.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if (c as u32) < 0x20 => {
                let _ = write!(out, "\\u{:04x}", c as u32);
            }
            c => out.push(c),
        }
    }
    out.push('"');
}

#[cfg(test)]
mod tests {
    use super::*;
    use master_protocol::dto::{ModDto, ModInfoDto};
    use master_protocol::id::{GameServerId, ServerAuthToken};
    use std::num::NonZeroU16;

    fn sample_server() -> GameServer {
        GameServer {
            id: GameServerId(0xabc),
            game_addr: "1.2.3.4:37015".parse().unwrap(),
            auth_port: NonZeroU16::new(8081),
            name: "The \"Best\" Server\n".to_owned(),
            description: "free\tform".to_owned(),
            map: "mp_glitch".to_owned(),
            playlist: "aitdm".to_owned(),
            password: "hunter2".to_owned(),
            player_count: 7,
            max_players: 16,
            mod_info: ModInfoDto {
                mods: vec![ModDto {
                    name: "Archon".to_owned(),
                    version: "1.2.3".to_owned(),
                    required_on_client: true,
                }],
            },
            last_heartbeat: 1_700_000_000_123,
            verified: true,
            verification_deadline: 0,
            server_auth_token: ServerAuthToken(0),
            order: 1,
            epoch: 1,
        }
    }

    #[test]
    fn renders_valid_json_with_expected_fields() {
        let server = sample_server();
        let bytes = render_server_list(std::iter::once(&server));
        let value: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        let entry = &value[0];
        assert_eq!(entry["lastHeartbeat"], 1_700_000_000_123i64);
        assert_eq!(entry["id"], format!("{}", server.id));
        assert_eq!(entry["name"], "The \"Best\" Server\n");
        assert_eq!(entry["playerCount"], 7);
        assert_eq!(entry["maxPlayers"], 16);
        assert_eq!(entry["map"], "mp_glitch");
        assert_eq!(entry["playlist"], "aitdm");
        assert_eq!(entry["hasPassword"], true);
        assert_eq!(entry["modInfo"]["Mods"][0]["Name"], "Archon");
        assert_eq!(entry["modInfo"]["Mods"][0]["RequiredOnClient"], true);
        // The password itself never leaks into the projection.
        assert!(!String::from_utf8(bytes).unwrap().contains("hunter2"));
    }

    #[test]
    fn renders_empty_list() {
        assert_eq!(render_server_list(std::iter::empty()), b"[]");
    }

    #[test]
    fn escaping_matches_serde() {
        for s in [
            "plain",
            "with \"quotes\" and \\slashes\\",
            "control\u{1}\u{1f}chars",
            "newline\nand tab\t",
            "unicode ✓ stays literal",
        ] {
            let mut out = String::new();
            write_json_str(&mut out, s);
            let reference = serde_json::to_string(s).unwrap();
            let parsed: String = serde_json::from_str(&out).unwrap();
            let parsed_ref: String = serde_json::from_str(&reference).unwrap();
            assert_eq!(parsed, parsed_ref);
        }
    }

    #[test]
    fn cache_freshness_rules() {
        let mut cache = ServerListCache::new();
        // Never valid before the first rebuild.
        assert!(!cache.fresh(0));

        cache.install_plain(b"[]".to_vec(), true, 0);
        assert!(cache.fresh(1_000));

        // Time-based staleness.
        cache.install_plain(b"[]".to_vec(), true, 5_000);
        assert!(cache.fresh(4_999));
        assert!(!cache.fresh(5_000));

        // Force flag.
        cache.invalidate(0);
        assert!(!cache.fresh(0));
        cache.install_plain(b"[]".to_vec(), true, 0);
        assert!(cache.fresh(0));

        // A dirty install (mutation raced the render) stays stale, because
        // the racing mutation set the force flag.
        cache.invalidate(0);
        cache.install_plain(b"[]".to_vec(), false, 0);
        assert!(!cache.fresh(0));
    }

    #[test]
    fn gzip_is_keyed_to_revision() {
        let mut cache = ServerListCache::new();
        cache.install_plain(b"[1]".to_vec(), true, 0);
        let rev = cache.revision();
        assert!(cache.gzip_for(rev).is_none());

        cache.install_gzip(rev, b"gz".to_vec());
        assert!(cache.gzip_for(rev).is_some());

        // A new plain buffer obsoletes the gzip twin.
        cache.install_plain(b"[2]".to_vec(), true, 0);
        assert!(cache.gzip_for(cache.revision()).is_none());
    }
}
