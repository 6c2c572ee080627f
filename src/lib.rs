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

//! # chronicle
//!
//! The asynchronous request/notification core of a data archive's administrative tier.
//!
//! Mutations to archive objects (collections, resources, groups, users) are not applied inline:
//! the [notifier] validates them & appends them to an append-only notification log as *request*
//! notifications, the [dispatcher] picks requests up in the background & applies them to the
//! object store, appending a *terminal* (success or fail) notification under the same request id,
//! and the [correlator] lets the issuing side block, bounded, for that terminal. The [feed]
//! renders the same log as a human-readable audit trail.
//!
//! Storage is abstracted behind [storage::Backend], with implementations in [memory] (in-process)
//! and [scylla] (ScyllaDB/Cassandra).
pub mod correlator;
pub mod dispatcher;
pub mod entities;
pub mod feed;
pub mod http;
pub mod memory;
pub mod metrics;
pub mod notifier;
pub mod payload;
pub mod rest;
pub mod scylla;
pub mod storage;
