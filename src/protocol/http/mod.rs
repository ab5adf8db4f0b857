/*
 * mod.rs
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

//! HTTP client: generic HTTP/1.1 and HTTP/2 client with push-parsed responses.
//!
//! - Callback-based response API: `ResponseHandler` with `ok`/`error`, `header`, `start_body`, `body_chunk`, `end_body`, `complete`, `failed`.
//! - Buffers: `bytes` crate (BytesMut for parse buffer, Bytes for payload slices).
//! - HTTP/1.1: state-machine response parser. HTTP/2: our own frame parser + HPACK (no external h2 crate).
//! - TLS with ALPN `h2`, `http/1.1`. Plaintext: h2c upgrade and optional prior knowledge.
//! - Auth: proactive Basic/Bearer/OAuth, challenge-retry for Digest and OAuth token refresh.

mod handler;
mod request;
mod response;

pub mod auth;
pub mod config;
pub mod h1;
pub mod h2;
pub mod hpack;

pub use handler::ResponseHandler;
pub use h1::H1ResponseHandler;
pub use request::{Method, RequestBuilder};
pub use response::{Response, StatusFamily};

pub mod client;
pub mod connection;
pub mod error;

pub use client::HttpClient;
pub use config::{ClientConfig, PreferredVersion};
pub use connection::{HttpConnection, HttpStream, HttpVersion, StreamHandle};
pub use error::HttpError;
