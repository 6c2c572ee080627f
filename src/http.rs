// Copyright (C) 2025 the chronicle authors
//
// This file is part of chronicle.
//
// chronicle is free software: you can redistribute it and/or modify it under the terms of the GNU
// General Public License as published by the Free Software Foundation, either version 3 of the
// License, or (at your option) any later version.
//
// chronicle is distributed in the hope that it will be useful, but WITHOUT ANY WARRANTY; without
// even the implied warranty of MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the GNU
// General Public License for more details.
//
// You should have received a copy of the GNU General Public License along with chronicle.  If not,
// see <http://www.gnu.org/licenses/>.

//! # http
//!
//! Application state & the few HTTP-level conveniences shared by the REST handlers.

use std::sync::Arc;

use axum::Json;
use serde::{Deserialize, Serialize};

use crate::{correlator::Correlator, feed::Feed, notifier::Notifier, storage::Backend};

/// All handlers return errors in one shape; setup a standard representation of an error response.
#[derive(Debug, Deserialize, Serialize)]
pub struct ErrorResponseBody {
    pub error: String,
}

impl axum::response::IntoResponse for ErrorResponseBody {
    fn into_response(self) -> axum::response::Response {
        Json(self).into_response()
    }
}

/// Application state available to all handlers
pub struct Chronicle {
    pub storage: Arc<dyn Backend + Send + Sync>,
    pub notifier: Notifier,
    pub correlator: Correlator,
    pub feed: Feed,
}
