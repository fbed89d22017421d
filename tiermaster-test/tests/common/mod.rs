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

use libtest_mimic::Failed;
use tiermaster_test::Fixture;

/// One integration test
///
/// Register instances with [inventory::submit]; `main()` will stand-up a fresh [Fixture] for each
/// & hand it to `test_fn`.
#[derive(Debug)]
pub struct Test {
    pub name: &'static str,
    pub test_fn: fn(fixture: &Fixture) -> std::result::Result<(), Failed>,
}

inventory::collect!(Test);
