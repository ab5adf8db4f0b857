/*
 * error.rs
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

//! Error taxonomy for the HTTP engine: transport, protocol, stream, auth,
//! cancellation, and server shutdown.

use std::fmt;

#[derive(Debug)]
pub enum HttpError {
    Transport(String),
    Protocol(String),
    Stream { stream_id: u32, reason: String },
    AuthenticationFailed(String),
    Cancelled,
    ServerShutdown { last_stream_id: u32 },
}

impl fmt::Display for HttpError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HttpError::Transport(msg) => write!(f, "transport error: {}", msg),
            HttpError::Protocol(msg) => write!(f, "protocol error: {}", msg),
            HttpError::Stream { stream_id, reason } => {
                write!(f, "stream {} error: {}", stream_id, reason)
            }
            HttpError::AuthenticationFailed(msg) => write!(f, "authentication failed: {}", msg),
            HttpError::Cancelled => write!(f, "request cancelled"),
            HttpError::ServerShutdown { last_stream_id } => {
                write!(f, "server shutting down connection (last stream {})", last_stream_id)
            }
        }
    }
}

impl std::error::Error for HttpError {}

impl From<HttpError> for std::io::Error {
    fn from(e: HttpError) -> Self {
        let kind = match &e {
            HttpError::Transport(_) => std::io::ErrorKind::ConnectionAborted,
            HttpError::Protocol(_) => std::io::ErrorKind::InvalidData,
            HttpError::Stream { .. } => std::io::ErrorKind::Other,
            HttpError::AuthenticationFailed(_) => std::io::ErrorKind::Other,
            HttpError::ServerShutdown { .. } => std::io::ErrorKind::Other,
            HttpError::Cancelled => std::io::ErrorKind::Interrupted,
        };
        std::io::Error::new(kind, e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancelled_maps_to_interrupted() {
        let io_err: std::io::Error = HttpError::Cancelled.into();
        assert_eq!(io_err.kind(), std::io::ErrorKind::Interrupted);
    }

    #[test]
    fn protocol_error_maps_to_invalid_data() {
        let io_err: std::io::Error = HttpError::Protocol("bad preface".into()).into();
        assert_eq!(io_err.kind(), std::io::ErrorKind::InvalidData);
    }

    #[test]
    fn display_includes_stream_id() {
        let e = HttpError::Stream {
            stream_id: 7,
            reason: "reset".into(),
        };
        assert_eq!(e.to_string(), "stream 7 error: reset");
    }
}
