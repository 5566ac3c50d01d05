//! End-to-end scenarios over the in-memory engine

mod batching;
mod reads;

use std::sync::Arc;

use crate::codec::StringCodec;
use crate::config::{EnvConfig, StoreOptions};
use crate::engine::MemEngine;
use crate::env::{Environment, Store};

pub(crate) fn open(config: EnvConfig) -> (Arc<MemEngine>, Environment) {
    let engine = Arc::new(MemEngine::new(config.map_size, config.region_span, config.max_dbs).unwrap());
    let env = Environment::open(engine.clone(), config).unwrap();
    (engine, env)
}

pub(crate) fn string_store(env: &Environment, name: &str) -> Store<StringCodec> {
    env.open_store(StoreOptions::named(name), StringCodec).unwrap()
}

pub(crate) fn s(value: &str) -> String {
    value.to_string()
}
