#![allow(dead_code)]

use std::time::Duration;

use ckv_client::{ConnectionUrl, PoolConfig, StoreClient, StoreConfig};
use ckv_mockstore::MockStore;

pub fn start_store() -> MockStore {
    MockStore::start().expect("start mock store")
}

pub fn store_config(store: &MockStore) -> StoreConfig {
    StoreConfig {
        address: "127.0.0.1".to_string(),
        port: store.port(),
        read_timeout_secs: 5,
        write_timeout_secs: 5,
        connect_timeout_secs: 1,
        ..StoreConfig::default()
    }
}

pub fn pool_config(store: &MockStore) -> PoolConfig {
    let mut config = PoolConfig::new(ConnectionUrl {
        host: "127.0.0.1".to_string(),
        port: store.port(),
        database: 1,
        password: None,
    });
    config.read_timeout = Some(Duration::from_secs(5));
    config.write_timeout = Some(Duration::from_secs(5));
    config.connect_timeout = Some(Duration::from_secs(1));
    config
}

pub fn client(store: &MockStore) -> StoreClient {
    StoreClient::new(&store_config(store))
}
