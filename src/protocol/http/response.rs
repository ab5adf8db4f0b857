/*
 * response.rs
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

//! Response status line: code and optional reason phrase. Headers are delivered
//! separately to ResponseHandler::header() rather than stored here.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusFamily {
    Informational,
    Success,
    Redirection,
    ClientError,
    ServerError,
    Unknown,
}

#[derive(Debug, Clone)]
pub struct Response {
    code: u16,
    reason: Option<String>,
}

impl Response {
    pub fn new(code: u16) -> Self {
        Self { code, reason: None }
    }

    pub fn with_reason(code: u16, reason: impl Into<String>) -> Self {
        Self {
            code,
            reason: Some(reason.into()),
        }
    }

    pub fn code(&self) -> u16 {
        self.code
    }

    pub fn reason(&self) -> Option<&str> {
        self.reason.as_deref()
    }

    pub fn status_family(&self) -> StatusFamily {
        match self.code {
            100..=199 => StatusFamily::Informational,
            200..=299 => StatusFamily::Success,
            300..=399 => StatusFamily::Redirection,
            400..=499 => StatusFamily::ClientError,
            500..=599 => StatusFamily::ServerError,
            _ => StatusFamily::Unknown,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status_family() == StatusFamily::Success
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_families() {
        assert_eq!(Response::new(200).status_family(), StatusFamily::Success);
        assert_eq!(Response::new(401).status_family(), StatusFamily::ClientError);
        assert_eq!(Response::new(503).status_family(), StatusFamily::ServerError);
        assert_eq!(Response::new(101).status_family(), StatusFamily::Informational);
        assert_eq!(Response::new(301).status_family(), StatusFamily::Redirection);
    }

    #[test]
    fn with_reason_preserves_text() {
        let r = Response::with_reason(404, "Not Found");
        assert_eq!(r.code(), 404);
        assert_eq!(r.reason(), Some("Not Found"));
    }
}
