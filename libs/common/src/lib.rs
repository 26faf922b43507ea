pub mod id;
pub mod snowflake;

pub use id::{pair_key, prefixed_ulid, PrefixedId};
pub use snowflake::SnowflakeGenerator;
