use super::SessionCache;

/// Sleep until the oldest session can expire, then sweep. Never returns;
/// wrap it in a shutdown guard.
pub async fn expiry_loop(cache: SessionCache) {
    let idle_time = cache.idle_time();
    loop {
        let wait = if let Some((id, touched)) = cache.oldest() {
            let age = touched.elapsed();
            if age > idle_time {
                let count = cache.evict_expired();
                log::debug!("expired {count} sessions, oldest {id:#x}");
                continue;
            }
            idle_time - age
        } else {
            idle_time
        };
        tokio::time::sleep(wait).await;
    }
}
