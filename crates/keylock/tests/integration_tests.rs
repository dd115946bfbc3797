//! Keylock Integration Tests

use keylock::{IMMEDIATE, KeyLock, KeyLockConfig, KeyLockError, LockEventType, LockStatus};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::{Barrier, oneshot};
use tokio::time::{Instant, sleep, timeout};

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_holders_never_overlap() {
    let keylock = KeyLock::new();
    let active = Arc::new(AtomicUsize::new(0));
    let max_seen = Arc::new(AtomicUsize::new(0));
    let rounds = Arc::new(AtomicUsize::new(0));

    let mut handles = Vec::new();
    for _ in 0..16 {
        let keylock = keylock.clone();
        let active = Arc::clone(&active);
        let max_seen = Arc::clone(&max_seen);
        let rounds = Arc::clone(&rounds);

        handles.push(tokio::spawn(async move {
            for _ in 0..25 {
                let unlock = keylock.acquire("shared").await;
                let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                max_seen.fetch_max(now, Ordering::SeqCst);
                tokio::task::yield_now().await;
                active.fetch_sub(1, Ordering::SeqCst);
                rounds.fetch_add(1, Ordering::SeqCst);
                unlock.unlock();
            }
        }));
    }

    for handle in handles {
        handle.await.unwrap();
    }

    assert_eq!(max_seen.load(Ordering::SeqCst), 1);
    assert_eq!(rounds.load(Ordering::SeqCst), 16 * 25);
}

#[tokio::test]
async fn test_second_acquire_waits_for_release() {
    let keylock = KeyLock::new();
    let unlock = keylock.acquire("test-key").await;

    let acquired = Arc::new(AtomicBool::new(false));
    let waiter = {
        let keylock = keylock.clone();
        let acquired = Arc::clone(&acquired);
        tokio::spawn(async move {
            let unlock = keylock.acquire("test-key").await;
            acquired.store(true, Ordering::SeqCst);
            unlock.unlock();
        })
    };

    sleep(Duration::from_millis(100)).await;
    assert!(!acquired.load(Ordering::SeqCst), "lock should still be held");

    unlock.unlock();
    timeout(Duration::from_secs(5), waiter)
        .await
        .expect("waiter should finish after release")
        .unwrap();
    assert!(acquired.load(Ordering::SeqCst));
}

#[tokio::test(start_paused = true)]
async fn test_held_key_times_out_then_succeeds_after_release() {
    let keylock = KeyLock::new();
    let unlock = keylock.acquire("k").await;

    let blocked = keylock
        .acquire_with_timeout("k", Duration::from_millis(50))
        .await;
    assert_eq!(blocked.unwrap_err(), KeyLockError::Timeout);

    unlock.unlock();

    let start = Instant::now();
    let unlock = keylock
        .acquire_with_timeout("k", Duration::from_millis(50))
        .await
        .expect("released key should be acquired");
    assert!(start.elapsed() < Duration::from_millis(50));
    unlock.unlock();
}

#[tokio::test(start_paused = true)]
async fn test_release_before_deadline_succeeds() {
    let keylock = KeyLock::new();
    let unlock = keylock.acquire("k").await;

    tokio::spawn(async move {
        sleep(Duration::from_millis(20)).await;
        unlock.unlock();
    });

    let start = Instant::now();
    let result = keylock
        .acquire_with_timeout("k", Duration::from_millis(100))
        .await;

    assert!(result.is_ok());
    let waited = start.elapsed();
    assert!(waited >= Duration::from_millis(20));
    assert!(waited < Duration::from_millis(100));
}

#[tokio::test(start_paused = true)]
async fn test_release_after_deadline_times_out() {
    let keylock = KeyLock::new();
    let unlock = keylock.acquire("k").await;

    let releaser = tokio::spawn(async move {
        sleep(Duration::from_millis(200)).await;
        unlock.unlock();
    });

    let start = Instant::now();
    let result = keylock
        .acquire_with_timeout("k", Duration::from_millis(100))
        .await;

    assert_eq!(result.unwrap_err(), KeyLockError::Timeout);
    assert!(start.elapsed() >= Duration::from_millis(100));

    releaser.await.unwrap();
    assert!(keylock.try_acquire("k").is_ok());
}

#[tokio::test]
async fn test_timed_out_wait_leaves_no_hold() {
    let keylock = KeyLock::new();

    for _ in 0..50 {
        let unlock = keylock.acquire("k").await;
        let contender = {
            let keylock = keylock.clone();
            tokio::spawn(async move {
                keylock
                    .acquire_with_timeout("k", Duration::from_millis(1))
                    .await
            })
        };
        tokio::task::yield_now().await;
        unlock.unlock();

        // Either outcome is fine, but a win must come back as a capability
        // and a loss must leave the key free.
        match contender.await.unwrap() {
            Ok(unlock) => unlock.unlock(),
            Err(err) => assert_eq!(err, KeyLockError::Timeout),
        }
        assert!(keylock.try_acquire("k").is_ok(), "no ghost hold after race");
    }
}

#[tokio::test(start_paused = true)]
async fn test_immediate_on_held_key_fails_without_waiting() {
    let keylock = KeyLock::new();
    let first = keylock
        .acquire_with_timeout("test-key", IMMEDIATE)
        .await
        .expect("free key");

    let start = Instant::now();
    let second = keylock.acquire_with_timeout("test-key", IMMEDIATE).await;

    assert_eq!(second.unwrap_err(), KeyLockError::Timeout);
    assert_eq!(start.elapsed(), Duration::ZERO);
    first.unlock();
}

#[tokio::test]
async fn test_keys_are_independent() {
    let keylock = KeyLock::new();
    let _held_a = keylock.acquire("a").await;

    let round_trip = {
        let keylock = keylock.clone();
        tokio::spawn(async move {
            let unlock = keylock.acquire("b").await;
            unlock.unlock();
        })
    };

    timeout(Duration::from_secs(5), round_trip)
        .await
        .expect("key b must not wait on key a")
        .unwrap();
    assert_eq!(keylock.status("a"), Some(LockStatus::InUse));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_first_touch_of_distinct_keys() {
    let keylock = KeyLock::new();
    let barrier = Arc::new(Barrier::new(32));

    // key-0 is created and taken by one of the group while the rest are
    // being created alongside it
    let (held_tx, held_rx) = oneshot::channel();
    let holder = {
        let keylock = keylock.clone();
        let barrier = Arc::clone(&barrier);
        tokio::spawn(async move {
            barrier.wait().await;
            let unlock = keylock.acquire("key-0").await;
            let _ = held_tx.send(unlock);
        })
    };

    let mut handles = Vec::new();
    for i in 1..32 {
        let keylock = keylock.clone();
        let barrier = Arc::clone(&barrier);
        handles.push(tokio::spawn(async move {
            let key = format!("key-{i}");
            barrier.wait().await;
            let unlock = keylock.acquire(key.as_str()).await;
            unlock.unlock();
        }));
    }

    holder.await.unwrap();
    let held = held_rx.await.expect("key-0 should be acquired");

    for handle in handles {
        timeout(Duration::from_secs(5), handle)
            .await
            .expect("distinct keys must not block each other")
            .unwrap();
    }
    assert_eq!(keylock.status("key-0"), Some(LockStatus::InUse));
    assert_eq!(keylock.len(), 32);
    held.unlock();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_event_stream_never_shows_two_holders() {
    let config = KeyLockConfig::default().with_event_capacity(100_000);
    let keylock = KeyLock::<String>::with_config(config);
    let mut events = keylock.subscribe();

    let mut handles = Vec::new();
    for _ in 0..8 {
        let keylock = keylock.clone();
        handles.push(tokio::spawn(async move {
            for _ in 0..500 {
                keylock.acquire("k").await.unlock();
            }
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    let mut outstanding: i64 = 0;
    let mut acquired = 0;
    while let Ok(event) = events.try_recv() {
        match event.event_type {
            LockEventType::Acquired => {
                outstanding += 1;
                acquired += 1;
                assert_eq!(outstanding, 1, "acquired while another hold was outstanding");
            }
            LockEventType::Released => {
                outstanding -= 1;
                assert_eq!(outstanding, 0, "released without a matching acquire");
            }
            _ => {}
        }
    }
    assert_eq!(acquired, 8 * 500);
    assert_eq!(outstanding, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_first_touch_of_same_key_creates_one_lock() {
    let keylock = KeyLock::new();
    let mut events = keylock.subscribe();
    let barrier = Arc::new(Barrier::new(16));
    let active = Arc::new(AtomicUsize::new(0));

    let mut handles = Vec::new();
    for _ in 0..16 {
        let keylock = keylock.clone();
        let barrier = Arc::clone(&barrier);
        let active = Arc::clone(&active);
        handles.push(tokio::spawn(async move {
            barrier.wait().await;
            let unlock = keylock.acquire("fresh").await;
            assert_eq!(active.fetch_add(1, Ordering::SeqCst), 0);
            tokio::task::yield_now().await;
            active.fetch_sub(1, Ordering::SeqCst);
            unlock.unlock();
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    let created = std::iter::from_fn(|| events.try_recv().ok())
        .filter(|event| event.event_type == LockEventType::Created)
        .count();
    assert_eq!(created, 1);
    assert_eq!(keylock.len(), 1);
}

#[tokio::test]
async fn test_unlock_from_another_task() {
    let keylock = KeyLock::new();
    let unlock = keylock.acquire("handoff").await;

    tokio::spawn(async move { unlock.unlock() }).await.unwrap();

    assert!(keylock.try_acquire("handoff").is_ok());
}

#[test]
fn test_blocking_acquire_across_threads() {
    let keylock = KeyLock::new();
    let active = Arc::new(AtomicUsize::new(0));
    let max_seen = Arc::new(AtomicUsize::new(0));

    let threads: Vec<_> = (0..8)
        .map(|_| {
            let keylock = keylock.clone();
            let active = Arc::clone(&active);
            let max_seen = Arc::clone(&max_seen);
            std::thread::spawn(move || {
                for _ in 0..20 {
                    let unlock = keylock.blocking_acquire("shared");
                    let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                    max_seen.fetch_max(now, Ordering::SeqCst);
                    std::thread::yield_now();
                    active.fetch_sub(1, Ordering::SeqCst);
                    unlock.unlock();
                }
            })
        })
        .collect();

    for thread in threads {
        thread.join().unwrap();
    }
    assert_eq!(max_seen.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_prune_then_reacquire() {
    let keylock = KeyLock::new();
    for i in 0..10 {
        keylock.acquire(format!("job-{i}").as_str()).await.unlock();
    }
    let _held = keylock.acquire("job-3").await;

    assert_eq!(keylock.prune(), 9);
    assert_eq!(keylock.keys(), vec!["job-3".to_string()]);

    let unlock = keylock.try_acquire("job-0").expect("pruned key is free");
    unlock.unlock();
    assert_eq!(keylock.len(), 2);
}
