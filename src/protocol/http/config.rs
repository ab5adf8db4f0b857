/*
 * config.rs
 * Copyright (C) 2026 Chris Burdess
 *
 * This file is part of Tagliacarte, a cross-platform email client.
 *
 * Tagliacarte is free software: you can redistribute it and/or modify
 * it under the terms of the GNU General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * Tagliacarte is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 * GNU General Public License for more details.
 *
 * You should have received a copy of the GNU General Public License
 * along with Tagliacarte.  If not, see <http://www.gnu.org/licenses/>.
 */

//! Connection configuration surface.

use std::sync::Arc;

use crate::protocol::http::auth::{Credentials, OAuthRefresh};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PreferredVersion {
    Http10,
    Http11,
    Http2,
}

impl Default for PreferredVersion {
    fn default() -> Self {
        PreferredVersion::Http2
    }
}

#[derive(Clone)]
pub struct ClientConfig {
    pub preferred_version: PreferredVersion,
    pub h2c_upgrade_enabled: bool,
    pub h2_with_prior_knowledge: bool,
    pub credentials: Option<Credentials>,
    pub oauth_refresh: Option<Arc<dyn OAuthRefresh>>,
    pub max_auth_retries: u32,
    pub max_concurrent_streams: Option<u32>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            preferred_version: PreferredVersion::default(),
            h2c_upgrade_enabled: true,
            h2_with_prior_knowledge: false,
            credentials: None,
            oauth_refresh: None,
            max_auth_retries: 3,
            max_concurrent_streams: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_prefer_http2_and_h2c() {
        let cfg = ClientConfig::default();
        assert_eq!(cfg.preferred_version, PreferredVersion::Http2);
        assert!(cfg.h2c_upgrade_enabled);
        assert!(!cfg.h2_with_prior_knowledge);
        assert!(cfg.credentials.is_none());
    }
}
