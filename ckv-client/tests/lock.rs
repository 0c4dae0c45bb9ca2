use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use ckv_client::{ClientError, LockManager, UnlockOutcome};

mod common;

#[test]
fn second_locker_is_rejected_until_release() {
    let store = common::start_store();
    let locks = common::client(&store).locks();

    let token = locks.lock("job:5").expect("lock");
    let err = locks.lock("job:5").unwrap_err();
    assert!(err.is_already_locked());
    assert!(matches!(err, ClientError::AlreadyLocked { ref name } if name == "job:5"));

    assert_eq!(locks.try_unlock("job:5", token).expect("unlock"), UnlockOutcome::Released);
    let again = locks.lock("job:5").expect("relock");
    assert!(again > token);
}

#[test]
fn lock_key_uses_prefix_and_dashes() {
    let store = common::start_store();
    let client = common::client(&store);
    let locks = client.locks();

    let token = locks.lock("job:5").expect("lock");
    let stored = client.get("nodes:lock:job-5").expect("get");
    assert_eq!(stored, Some(token.to_string().into_bytes()));
}

#[test]
fn only_one_thread_holds_the_lock() {
    let store = common::start_store();
    let client = common::client(&store);
    let holders = Arc::new(AtomicUsize::new(0));
    let overlaps = Arc::new(AtomicUsize::new(0));
    let acquired = Arc::new(AtomicUsize::new(0));

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let locks = client.locks();
            let holders = holders.clone();
            let overlaps = overlaps.clone();
            let acquired = acquired.clone();
            thread::spawn(move || {
                for _ in 0..20 {
                    let token = match locks.lock("shared") {
                        Ok(token) => token,
                        Err(err) if err.is_already_locked() => continue,
                        Err(err) => panic!("lock failed: {err}"),
                    };
                    if holders.fetch_add(1, Ordering::SeqCst) != 0 {
                        overlaps.fetch_add(1, Ordering::SeqCst);
                    }
                    acquired.fetch_add(1, Ordering::SeqCst);
                    thread::sleep(Duration::from_millis(2));
                    holders.fetch_sub(1, Ordering::SeqCst);
                    locks.unlock("shared", token);
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().expect("worker");
    }

    assert_eq!(overlaps.load(Ordering::SeqCst), 0);
    assert!(acquired.load(Ordering::SeqCst) > 0);
}

#[test]
fn abandoned_lock_expires_after_ttl() {
    let store = common::start_store();
    let locks = LockManager::new(common::client(&store)).with_ttl(Duration::from_millis(200));

    let _abandoned = locks.lock("crashed").expect("lock");
    assert!(locks.lock("crashed").unwrap_err().is_already_locked());

    thread::sleep(Duration::from_millis(350));
    locks.lock("crashed").expect("lock after ttl");
}

#[test]
fn foreign_token_does_not_release() {
    let store = common::start_store();
    let client = common::client(&store);
    let locks = client.locks();

    let token = locks.lock("job:7").expect("lock");
    let outcome = locks.try_unlock("job:7", token + 1).expect("unlock");
    assert_eq!(outcome, UnlockOutcome::NotOwner { stored: token.to_string() });
    assert!(client.get("nodes:lock:job-7").expect("get").is_some());

    assert_eq!(locks.try_unlock("job:7", token).expect("unlock"), UnlockOutcome::Released);
    assert_eq!(locks.try_unlock("job:7", token).expect("unlock"), UnlockOutcome::Missing);
}

#[test]
fn unlock_after_expiry_and_takeover_leaves_new_holder() {
    let store = common::start_store();
    let client = common::client(&store);
    let locks = client.locks().with_ttl(Duration::from_millis(100));

    let stale = locks.lock("job:9").expect("lock");
    thread::sleep(Duration::from_millis(200));
    let fresh = locks.lock("job:9").expect("takeover");

    locks.unlock("job:9", stale);
    assert_eq!(
        client.get("nodes:lock:job-9").expect("get"),
        Some(fresh.to_string().into_bytes())
    );
}

#[test]
fn retry_waits_out_a_short_lived_holder() {
    let store = common::start_store();
    let locks = common::client(&store).locks().with_ttl(Duration::from_millis(150));

    locks.lock("busy").expect("first holder");
    locks
        .lock_with_retry("busy", 20, Duration::from_millis(50))
        .expect("acquired after expiry");

    let err = locks.lock_with_retry("busy", 2, Duration::from_millis(10)).unwrap_err();
    assert!(err.is_already_locked());
}

#[test]
fn guard_releases_on_drop() {
    let store = common::start_store();
    let client = common::client(&store);
    let locks = client.locks();

    {
        let guard = locks.guard("job:11").expect("guard");
        assert_eq!(guard.name(), "job:11");
        assert!(locks.lock("job:11").unwrap_err().is_already_locked());
    }
    assert_eq!(client.get("nodes:lock:job-11").expect("get"), None);
    assert_eq!(client.pool_stats().active, 0);
}

#[test]
fn queue_job_flow_under_lock() {
    let store = common::start_store();
    let client = common::client(&store);
    let locks = client.locks();
    let queues = client.queues();

    queues.push("jobs", "5").expect("push");
    let token = locks.lock("job:5").expect("lock");
    let job = queues.blocking_pop("jobs", Duration::from_secs(1)).expect("pop");
    assert_eq!(job, Some(b"5".to_vec()));
    locks.unlock("job:5", token);

    locks.lock("job:5").expect("free again");
}
