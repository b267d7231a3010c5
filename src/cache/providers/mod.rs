//! Cache tier implementations

pub mod memory;

#[cfg(feature = "cache-redis")]
pub mod redis;

pub use memory::MemoryCacheService;

#[cfg(feature = "cache-redis")]
pub use self::redis::RedisCacheService;
