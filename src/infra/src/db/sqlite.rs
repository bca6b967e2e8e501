// Copyright 2025 FlowerPower Contributors
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program.  If not, see <http://www.gnu.org/licenses/>.

use std::{str::FromStr, time::Duration};

use sqlx::{
    sqlite::{
        SqliteConnectOptions, SqliteJournalMode, SqliteLockingMode, SqlitePoolOptions,
        SqliteSynchronous,
    },
    Pool, Sqlite,
};

use crate::errors::Result;

/// Single writer connection; callers serialize access behind a mutex.
pub fn connect_rw(uri: &str) -> Result<Pool<Sqlite>> {
    let db_opts = SqliteConnectOptions::from_str(uri)?
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Normal)
        .locking_mode(SqliteLockingMode::Normal)
        .busy_timeout(Duration::from_secs(30))
        .create_if_missing(true);

    Ok(SqlitePoolOptions::new()
        .min_connections(1)
        .max_connections(1)
        .acquire_timeout(Duration::from_secs(30))
        .connect_lazy_with(db_opts))
}

pub fn connect_ro(uri: &str) -> Result<Pool<Sqlite>> {
    let cfg = config::get_config();
    let db_opts = SqliteConnectOptions::from_str(uri)?
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Normal)
        .locking_mode(SqliteLockingMode::Normal)
        .busy_timeout(Duration::from_secs(30))
        .read_only(true);

    Ok(SqlitePoolOptions::new()
        .min_connections(cfg.limit.sql_min_db_connections)
        .max_connections(cfg.limit.sql_max_db_connections)
        .acquire_timeout(Duration::from_secs(30))
        .connect_lazy_with(db_opts))
}
