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

use flowerpower::{cli, registry};
use infra::errors::Error;

#[tokio::main]
async fn main() {
    env_logger::init_from_env(env_logger::Env::new().default_filter_or("info"));
    if let Err(e) = config::init() {
        eprintln!("config init failed: {e}");
        std::process::exit(1);
    }
    registry::register_builtins();

    match cli::basic::cli::cli().await {
        Ok(true) => {}
        Ok(false) => {
            // no subcommand given
            println!("run 'flowerpower --help' for usage");
        }
        Err(e) => {
            eprintln!("{e}");
            let code = match e.downcast_ref::<Error>() {
                Some(Error::BackendUnavailable(_)) => 2,
                _ => 1,
            };
            std::process::exit(code);
        }
    }
}
