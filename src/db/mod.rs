pub mod activity_store;
pub mod postgres;
pub mod redis;

pub use activity_store::{ActivityStore, PgActivityStore};
pub use postgres::create_pool;
pub use redis::create_redis_client;
pub use redis::Cache;
pub use redis::CacheKey;
pub use redis::CacheWriterHandle;
