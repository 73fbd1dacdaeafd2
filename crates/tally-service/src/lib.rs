// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
mod types;
mod error;
mod service;
mod http;
mod mock;
pub mod decoder;

pub use types::*;
pub use error::ServiceError;
pub use service::{AnalysisService, ByteStream};
pub use http::HttpService;
pub use mock::{MockService, ScriptedMockService, StreamScript};
pub use decoder::{decode_stream, FrameDecoder, FrameError, EventStream};

use tally_config::ServerConfig;

/// Construct the HTTP-backed [`AnalysisService`] from configuration.
pub fn from_config(cfg: &ServerConfig) -> Result<HttpService, ServiceError> {
    HttpService::new(&cfg.base_url, cfg.connect_timeout())
}
