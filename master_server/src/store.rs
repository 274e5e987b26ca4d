// SPDX-FileCopyrightText: 2021 Softbear, Inc.
// SPDX-License-Identifier: AGPL-3.0-or-later

use master_protocol::id::PlayerId;
use thiserror::Error;

/// Failures surfaced by the storage collaborators. Never swallowed; the
/// HTTP front logs them with request context and renders a 500.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("storage i/o: {0}")]
    Io(#[from] std::io::Error),
    /// A stored blob no longer digests to its recorded hash. Fatal to the
    /// request that observed it.
    #[error("stored data for {uid} is corrupt: {detail}")]
    Corrupt { uid: PlayerId, detail: String },
}
