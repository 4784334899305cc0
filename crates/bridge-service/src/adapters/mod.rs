pub mod mqtt;
pub mod postgres_store;
pub mod redis_cache;
