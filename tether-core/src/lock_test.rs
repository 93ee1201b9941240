#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::time::Instant;

    use crate::client::TetherClient;
    use crate::error::LockError;
    use crate::lock::{LockContext, MAX_LOCK_TIMEOUT};
    use crate::test_support::{client, client_with, fast_options, FlakyStore};
    use crate::types::now_ms;

    const SHORT: Duration = Duration::from_millis(100);
    const LONG: Duration = Duration::from_secs(5);

    #[tokio::test]
    async fn test_acquire_and_release() {
        let client = client();
        let lock = client.lock();
        let ctx = LockContext::new();

        let mut guard = lock.acquire(&ctx, "res", SHORT).await.unwrap();
        assert_eq!(guard.resource(), "res");
        assert_eq!(ctx.depth("res"), 1);
        assert!(client.store().find_lock("res").unwrap().is_some());

        guard.release().unwrap();
        assert_eq!(ctx.depth("res"), 0);
        assert!(client.store().find_lock("res").unwrap().is_none());

        // Second release is a no-op
        guard.release().unwrap();
    }

    #[tokio::test]
    async fn test_drop_releases() {
        let client = client();
        let lock = client.lock();
        {
            let _guard = lock.acquire(&LockContext::new(), "res", SHORT).await.unwrap();
            assert!(client.store().find_lock("res").unwrap().is_some());
        }
        assert!(client.store().find_lock("res").unwrap().is_none());
    }

    #[tokio::test]
    async fn test_reentrant_acquire_in_same_context() {
        let client = client();
        let lock = client.lock();
        let ctx = LockContext::new();

        let mut outer = lock.acquire(&ctx, "res", SHORT).await.unwrap();
        let mut inner = lock.acquire(&ctx, "res", SHORT).await.unwrap();
        assert_eq!(ctx.depth("res"), 2);

        inner.release().unwrap();
        assert_eq!(ctx.depth("res"), 1);
        assert!(
            client.store().find_lock("res").unwrap().is_some(),
            "outer guard still owns the lease"
        );

        outer.release().unwrap();
        assert_eq!(ctx.depth("res"), 0);
        assert!(client.store().find_lock("res").unwrap().is_none());
    }

    #[tokio::test]
    async fn test_cloned_context_shares_reentrancy() {
        let client = client();
        let lock = client.lock();
        let ctx = LockContext::new();

        let _outer = lock.acquire(&ctx, "res", SHORT).await.unwrap();
        let nested = ctx.clone();
        let _inner = lock.acquire(&nested, "res", SHORT).await.unwrap();
        assert_eq!(ctx.depth("res"), 2);
    }

    #[tokio::test]
    async fn test_other_context_times_out() {
        let client = client();
        let lock = client.lock();
        let _held = lock.acquire(&LockContext::new(), "res", SHORT).await.unwrap();

        let started = Instant::now();
        let err = lock
            .acquire(&LockContext::new(), "res", SHORT)
            .await
            .unwrap_err();
        assert!(err.is_timeout(), "unexpected error: {err}");
        assert!(started.elapsed() >= SHORT);
    }

    #[tokio::test]
    async fn test_different_resources_do_not_contend() {
        let client = client();
        let lock = client.lock();
        let _a = lock.acquire(&LockContext::new(), "a", SHORT).await.unwrap();
        let _b = lock.acquire(&LockContext::new(), "b", SHORT).await.unwrap();
        assert_eq!(client.store().list_locks().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_invalid_arguments() {
        let client = client();
        let lock = client.lock();
        let ctx = LockContext::new();

        let err = lock.acquire(&ctx, "", SHORT).await.unwrap_err();
        assert!(matches!(err, LockError::InvalidArgument(_)));

        let err = lock
            .acquire(&ctx, "res", MAX_LOCK_TIMEOUT + Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, LockError::InvalidArgument(_)));
        assert!(client.store().find_lock("res").unwrap().is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_release_wakes_waiter_without_polling() {
        // Polls are effectively disabled, so only the release signal can wake the waiter
        let client = client_with(
            fast_options()
                .with_lock_lifetime(Duration::from_secs(30))
                .with_signal_poll_interval(Duration::from_secs(60)),
        );
        let lock = client.lock();
        let mut held = lock.acquire(&LockContext::new(), "res", SHORT).await.unwrap();

        let waiter = {
            let lock = lock.clone();
            tokio::spawn(async move {
                let started = Instant::now();
                let guard = lock.acquire(&LockContext::new(), "res", Duration::from_secs(20)).await;
                (guard, started.elapsed())
            })
        };

        tokio::time::sleep(Duration::from_millis(100)).await;
        held.release().unwrap();

        let (guard, waited) = waiter.await.unwrap();
        assert!(guard.is_ok());
        assert!(waited < LONG, "waiter took {waited:?}");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_acquirers_are_mutually_exclusive() {
        let client = client();
        let live = Arc::new(AtomicUsize::new(0));
        let max_live = Arc::new(AtomicUsize::new(0));

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let lock = client.lock();
            let live = live.clone();
            let max_live = max_live.clone();
            tasks.push(tokio::spawn(async move {
                let mut guard = lock
                    .acquire(&LockContext::new(), "shared", Duration::from_secs(20))
                    .await?;
                let now_live = live.fetch_add(1, Ordering::SeqCst) + 1;
                max_live.fetch_max(now_live, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(20)).await;
                live.fetch_sub(1, Ordering::SeqCst);
                guard.release()
            }));
        }

        for task in tasks {
            task.await.unwrap().unwrap();
        }
        assert_eq!(max_live.load(Ordering::SeqCst), 1);
        assert!(client.store().find_lock("shared").unwrap().is_none());
    }

    #[tokio::test]
    async fn test_expired_lease_from_crashed_holder_is_reclaimed() {
        let client = client();
        // A holder that crashed long ago never released
        client
            .store()
            .insert_lock_if_absent("res", now_ms() - 10_000)
            .unwrap();

        let guard = client
            .lock()
            .acquire(&LockContext::new(), "res", SHORT)
            .await
            .unwrap();
        let record = client.store().find_lock("res").unwrap().unwrap();
        assert!(record.expire_at > now_ms());
        drop(guard);
    }

    #[tokio::test]
    async fn test_waiter_takes_over_when_lease_lapses() {
        let client = client_with(fast_options().with_signal_poll_interval(Duration::from_secs(60)));
        // Live lease whose holder dies: no heartbeat, no release signal
        client
            .store()
            .insert_lock_if_absent("res", now_ms() + 200)
            .unwrap();

        let started = Instant::now();
        let guard = client
            .lock()
            .acquire(&LockContext::new(), "res", LONG)
            .await
            .unwrap();
        let waited = started.elapsed();
        assert!(waited >= Duration::from_millis(150), "took over too early: {waited:?}");
        assert!(waited < LONG);
        drop(guard);
    }

    #[tokio::test]
    async fn test_heartbeat_keeps_lease_alive() {
        let client = client();
        let lifetime = client.options().lock_lifetime;
        let mut guard = client
            .lock()
            .acquire(&LockContext::new(), "res", SHORT)
            .await
            .unwrap();

        let until = Instant::now() + lifetime * 3;
        while Instant::now() < until {
            let record = client.store().find_lock("res").unwrap().unwrap();
            assert!(record.expire_at >= now_ms(), "lease lapsed while held");
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        // Nobody else can take it while the heartbeat runs
        let err = client
            .lock()
            .acquire(&LockContext::new(), "res", SHORT)
            .await
            .unwrap_err();
        assert!(err.is_timeout());
        guard.release().unwrap();
    }

    #[tokio::test]
    async fn test_heartbeat_stops_after_release() {
        let client = client();
        let mut guard = client
            .lock()
            .acquire(&LockContext::new(), "res", SHORT)
            .await
            .unwrap();
        guard.release().unwrap();

        tokio::time::sleep(client.options().heartbeat_interval() * 3).await;
        assert!(
            client.store().find_lock("res").unwrap().is_none(),
            "heartbeat resurrected a released lock"
        );
    }

    fn flaky_client() -> (Arc<FlakyStore>, TetherClient) {
        let store = Arc::new(FlakyStore::default());
        let client = TetherClient::new(store.clone(), fast_options()).unwrap();
        (store, client)
    }

    #[tokio::test]
    async fn test_store_failure_is_an_acquisition_error() {
        let (store, client) = flaky_client();
        store.fail_lock_inserts.store(true, Ordering::SeqCst);

        let err = client
            .lock()
            .acquire(&LockContext::new(), "res", SHORT)
            .await
            .unwrap_err();
        assert!(matches!(err, LockError::Acquisition { .. }), "unexpected: {err}");
        assert!(!err.is_timeout());
    }

    #[tokio::test]
    async fn test_cleanup_failure_does_not_block_acquire() {
        let (store, client) = flaky_client();
        store.fail_lock_deletes.store(true, Ordering::SeqCst);

        let guard = client
            .lock()
            .acquire(&LockContext::new(), "res", SHORT)
            .await;
        assert!(guard.is_ok());

        store.fail_lock_deletes.store(false, Ordering::SeqCst);
        drop(guard);
    }

    #[tokio::test]
    async fn test_release_failure_still_clears_context() {
        let (store, client) = flaky_client();
        let ctx = LockContext::new();
        let mut guard = client.lock().acquire(&ctx, "res", SHORT).await.unwrap();

        store.fail_lock_deletes.store(true, Ordering::SeqCst);
        let err = guard.release().unwrap_err();
        assert!(matches!(err, LockError::Release { .. }));
        assert_eq!(ctx.depth("res"), 0);

        // The error is reported once; the guard is done
        guard.release().unwrap();
    }
}
