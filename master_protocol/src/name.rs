// SPDX-FileCopyrightText: 2021 Softbear, Inc.
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Display-name hygiene. Names come from external identity providers and
//! end up in logs, JSON projections, and the game's UI, so anything
//! unprintable is stripped before it enters the system.

/// Longest display name the game's UI renders without truncation.
pub const MAX_USERNAME_LEN: usize = 64;

/// Normalizes an upstream display name: trims surrounding whitespace, drops
/// control characters, and caps the length at a character boundary. Returns
/// an empty string for names that were nothing but noise.
pub fn sanitize_username(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len().min(MAX_USERNAME_LEN));
    let mut kept = 0;
    for c in raw.trim().chars() {
        if c.is_control() {
            continue;
        }
        if kept >= MAX_USERNAME_LEN {
            break;
        }
        out.push(c);
        kept += 1;
    }
    out
}
