pub mod lease;

pub use lease::create_redis_client;
pub use lease::RedisKey;
pub use lease::RedisRunLock;
