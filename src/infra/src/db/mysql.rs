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

use std::str::FromStr;

use sqlx::{
    mysql::{MySqlConnectOptions, MySqlPoolOptions},
    ConnectOptions, MySql, Pool,
};

use crate::errors::Result;

pub fn connect(uri: &str) -> Result<Pool<MySql>> {
    let cfg = config::get_config();
    let db_opts = MySqlConnectOptions::from_str(uri)?.disable_statement_logging();

    Ok(MySqlPoolOptions::new()
        .min_connections(cfg.limit.sql_min_db_connections)
        .max_connections(cfg.limit.sql_max_db_connections)
        .connect_lazy_with(db_opts))
}
