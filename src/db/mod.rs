pub mod postgres;
pub mod redis;

pub use postgres::create_pool;
pub use postgres::run_migrations;
pub use redis::create_redis_client;
pub use redis::RedisKey;
pub use redis::RedisRunLock;
