// Copyright (C) 2025 Michael Herstine <sp1ff@pobox.com>
//
// This file is part of tiermaster.
//
// tiermaster is free software: you can redistribute it and/or modify it under the terms of the GNU
// General Public License as published by the Free Software Foundation, either version 3 of the
// License, or (at your option) any later version.
//
// tiermaster is distributed in the hope that it will be useful, but WITHOUT ANY WARRANTY; without
// even the implied warranty of MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the GNU
// General Public License for more details.
//
// You should have received a copy of the GNU General Public License along with tiermaster.  If not,
// see <http://www.gnu.org/licenses/>.

//! # tiermaster
//!
//! A ranked leaderboard service.
//!
//! Players submit scores; tiermaster keeps each player's latest submission and answers "who's on
//! top?" and "where do I stand?". Two projections of every entry are kept in the backing store: a
//! ranking index ordered by score, and a payload table holding the full entry. [storage] defines
//! what we need of a store, [redis] & [memory] provide it, [repository] reads & writes both
//! projections, and [service] applies the rules. [leaderboard] exposes all that over HTTP and
//! [gateway] fronts it.
//!
//! Right now, the library crate has the same name as the package, meaning that `rustdoc` will
//! ignore the binary crates.
pub mod entities;
pub mod gateway;
pub mod http;
pub mod leaderboard;
pub mod memory;
pub mod metrics;
pub mod redis;
pub mod repository;
pub mod service;
pub mod storage;
pub mod tiermaster;
