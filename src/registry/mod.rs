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

use std::sync::Arc;

use config::utils::json;
use dashmap::DashMap;
use futures::future::BoxFuture;
use infra::{
    errors::{Error, Result},
    store::FunctionRef,
};
use once_cell::sync::Lazy;
use tokio_util::sync::CancellationToken;

/// Signature every registered function shares: positional args, keyword args
/// and a cancellation token the body is expected to poll between long steps.
pub type JobFn = Arc<
    dyn Fn(
            Vec<json::Value>,
            json::Map<String, json::Value>,
            CancellationToken,
        ) -> BoxFuture<'static, anyhow::Result<json::Value>>
        + Send
        + Sync,
>;

static REGISTRY: Lazy<DashMap<String, JobFn>> = Lazy::new(DashMap::new);

/// Register a callable under `(module, name)`. Workers resolve stored
/// function references against this map; registration must happen at program
/// start, before any worker is spawned.
pub fn register<F>(module: &str, name: &str, f: F)
where
    F: Fn(
            Vec<json::Value>,
            json::Map<String, json::Value>,
            CancellationToken,
        ) -> BoxFuture<'static, anyhow::Result<json::Value>>
        + Send
        + Sync
        + 'static,
{
    REGISTRY.insert(
        FunctionRef::new(module, name).to_string(),
        Arc::new(f) as JobFn,
    );
}

pub fn resolve(func: &FunctionRef) -> Result<JobFn> {
    REGISTRY
        .get(&func.to_string())
        .map(|f| f.value().clone())
        .ok_or_else(|| Error::FunctionNotRegistered(func.to_string()))
}

pub fn is_registered(func: &FunctionRef) -> bool {
    REGISTRY.contains_key(&func.to_string())
}

/// Functions every deployment has; the pipeline registry adds its runners on
/// top of these at startup.
pub fn register_builtins() {
    register("flowerpower", "noop", |_args, _kwargs, _token| {
        Box::pin(async { Ok(json::Value::Null) })
    });
    register("flowerpower", "echo", |args, kwargs, _token| {
        Box::pin(async move {
            Ok(json::json!({
                "args": args,
                "kwargs": kwargs,
            }))
        })
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_register_and_resolve() {
        register("math", "add", |args, _kwargs, _token| {
            Box::pin(async move {
                let sum: i64 = args.iter().filter_map(|a| a.as_i64()).sum();
                Ok(json::json!(sum))
            })
        });
        let f = resolve(&FunctionRef::new("math", "add")).unwrap();
        let out = f(
            vec![json::json!(2), json::json!(3)],
            json::Map::new(),
            CancellationToken::new(),
        )
        .await
        .unwrap();
        assert_eq!(out, json::json!(5));
    }

    #[test]
    fn test_unknown_function() {
        match resolve(&FunctionRef::new("nope", "missing")) {
            Err(err) => assert!(matches!(err, Error::FunctionNotRegistered(_))),
            Ok(_) => panic!("expected FunctionNotRegistered error"),
        }
    }
}
