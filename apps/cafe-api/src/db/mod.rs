pub mod kv;
pub mod pg_repo;
pub mod pool;
pub mod redis_store;
pub mod repo;
pub mod schema;
