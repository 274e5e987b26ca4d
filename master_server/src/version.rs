// SPDX-FileCopyrightText: 2021 Softbear, Inc.
// SPDX-License-Identifier: AGPL-3.0-or-later

//! The launcher version gate. Clients announce themselves via User-Agent;
//! launchers older than the configured minimum are refused before any
//! upstream traffic is spent on them.

use std::fmt::{self, Display, Formatter};
use std::str::FromStr;

/// User-Agent prefix the launcher sends, e.g. `R2Northstar/v1.12.0`.
const LAUNCHER_UA_PREFIX: &str = "R2Northstar/";

#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd)]
pub struct LauncherVersion {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl LauncherVersion {
    pub const fn new(major: u32, minor: u32, patch: u32) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }

    /// Parses the version out of a User-Agent header value. Tolerates a
    /// leading `v` and trailing build metadata.
    pub fn from_user_agent(user_agent: &str) -> Option<Self> {
        let rest = user_agent.strip_prefix(LAUNCHER_UA_PREFIX)?;
        let rest = rest.split_whitespace().next()?;
        rest.parse().ok()
    }
}

impl Display for LauncherVersion {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

#[derive(Debug)]
pub struct InvalidVersion;

impl Display for InvalidVersion {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str("expected major.minor.patch")
    }
}

impl FromStr for LauncherVersion {
    type Err = InvalidVersion;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.strip_prefix('v').unwrap_or(s);
        // Strip `-rc1`-style suffixes; prereleases gate like their release.
        let s = s.split(|c| c == '-' || c == '+').next().unwrap_or(s);
        let mut parts = s.splitn(3, '.');
        let mut next = || {
            parts
                .next()
                .and_then(|part| part.parse::<u32>().ok())
                .ok_or(InvalidVersion)
        };
        Ok(Self {
            major: next()?,
            minor: next()?,
            patch: next()?,
        })
    }
}

/// True when the client may proceed. `minimum = None` disables the gate;
/// with a gate configured, a missing or unparseable announcement is refused.
pub fn version_allowed(minimum: Option<LauncherVersion>, user_agent: Option<&str>) -> bool {
    let minimum = match minimum {
        Some(minimum) => minimum,
        None => return true,
    };
    match user_agent.and_then(LauncherVersion::from_user_agent) {
        Some(version) => version >= minimum,
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_launcher_user_agents() {
        assert_eq!(
            LauncherVersion::from_user_agent("R2Northstar/v1.12.0"),
            Some(LauncherVersion::new(1, 12, 0))
        );
        assert_eq!(
            LauncherVersion::from_user_agent("R2Northstar/1.2.3 (Windows)"),
            Some(LauncherVersion::new(1, 2, 3))
        );
        assert_eq!(
            LauncherVersion::from_user_agent("R2Northstar/v1.5.0-rc2"),
            Some(LauncherVersion::new(1, 5, 0))
        );
        assert_eq!(LauncherVersion::from_user_agent("curl/8.0"), None);
        assert_eq!(LauncherVersion::from_user_agent("R2Northstar/unknown"), None);
    }

    #[test]
    fn ordering_is_semver_like() {
        assert!(LauncherVersion::new(1, 10, 0) > LauncherVersion::new(1, 9, 9));
        assert!(LauncherVersion::new(2, 0, 0) > LauncherVersion::new(1, 99, 99));
        assert!(LauncherVersion::new(1, 2, 3) >= LauncherVersion::new(1, 2, 3));
    }

    #[test]
    fn gate_rules() {
        let min = Some(LauncherVersion::new(1, 10, 0));
        assert!(version_allowed(None, None));
        assert!(version_allowed(None, Some("anything")));
        assert!(version_allowed(min, Some("R2Northstar/v1.10.0")));
        assert!(version_allowed(min, Some("R2Northstar/v1.11.2")));
        assert!(!version_allowed(min, Some("R2Northstar/v1.9.7")));
        assert!(!version_allowed(min, Some("definitely-not-a-launcher")));
        assert!(!version_allowed(min, None));
    }
}
