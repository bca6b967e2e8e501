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
    postgres::{PgConnectOptions, PgPoolOptions},
    ConnectOptions, Pool, Postgres,
};

use crate::errors::Result;

pub fn connect(uri: &str, schema: Option<&str>) -> Result<Pool<Postgres>> {
    let cfg = config::get_config();
    let mut db_opts = PgConnectOptions::from_str(uri)?.disable_statement_logging();
    if let Some(schema) = schema.filter(|s| !s.is_empty()) {
        // unqualified tables resolve into the configured schema
        db_opts = db_opts.options([("search_path", format!("{schema},public").as_str())]);
    }

    Ok(PgPoolOptions::new()
        .min_connections(cfg.limit.sql_min_db_connections)
        .max_connections(cfg.limit.sql_max_db_connections)
        .connect_lazy_with(db_opts))
}
