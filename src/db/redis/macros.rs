/// A macro to simplify caching logic using Redis.
///
/// Checks the cache for `$key`; on a miss, evaluates `$block`, stores the
/// result with the given TTL via the background writer, and returns it.
///
/// # Arguments
/// * `$cache`: The cache instance; must expose `get_from_cache` and
///   `set_in_background`.
/// * `$key`: The key to use for caching the value.
/// * `$ttl`: The time-to-live (TTL) for the cached value in seconds.
/// * `$block`: The async block computing the value on a cache miss.
#[macro_export]
macro_rules! cached {
    ($cache:expr, $key:expr, $ttl:expr, $block:expr) => {{
        // Attempt to get the value from cache
        if let Some(cached) = $cache.get_from_cache(&$key).await? {
            Ok(cached)
        } else {
            // If not in cache, execute the block to compute the value
            let value = $block.await?;
            // Store the computed value in cache
            $cache.set_in_background(&$key, &value, $ttl);
            Ok(value)
        }
    }};
}
