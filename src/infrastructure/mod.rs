pub mod exchange;
pub mod fetcher;
pub mod kv;
pub mod mock;
pub mod persistence;
