
use regent::leadership::LeadershipError;
use regent::manager::LeaseManager;
use regent::store::{Assert, Op};
use std::sync::Arc;
use std::time::Duration;
use test_helpers::{new_harness, settle, HOUR, MINUTE};
use tokio::sync::oneshot;

#[regent::test]
async fn restart_honors_existing_lease() {
    let h = new_harness().await;
    h.claimer
        .claim_leadership("application", "application/0", MINUTE)
        .await
        .unwrap();

    h.manager.restart().await.unwrap();

    // A lease claimed before the restart is still honored right after,
    // without re-claiming.
    let token = h.checker.leadership_check("application", "application/0");
    token.check(None).await.unwrap();
}

#[regent::test]
async fn claimer_keeps_working_across_restart() {
    let h = new_harness().await;
    h.manager.restart().await.unwrap();
    h.claimer
        .claim_leadership("blah", "blah/0", MINUTE)
        .await
        .unwrap();
}

#[regent::test]
async fn restart_keeps_pending_waiters() {
    let h = new_harness().await;
    h.claimer
        .claim_leadership("blah", "blah/0", MINUTE)
        .await
        .unwrap();

    let manager = h.manager.clone();
    let wait = tokio::spawn(async move {
        manager.block_until_leadership_released("blah", None).await
    });
    settle().await;

    h.manager.restart().await.unwrap();
    assert!(!wait.is_finished(), "waiter must survive a hot restart");

    h.clock.advance(HOUR).await.unwrap();
    with_timeout!(2_000, {
        wait.await.unwrap().unwrap();
    });
}

#[regent::test]
async fn restart_releases_waiters_for_externally_released_leases() {
    let h = new_harness().await;
    h.claimer
        .claim_leadership("blah", "blah/0", MINUTE)
        .await
        .unwrap();

    let manager = h.manager.clone();
    let wait = tokio::spawn(async move {
        manager.block_until_leadership_released("blah", None).await
    });
    settle().await;

    // Another controller process releases the lease behind our back.
    h.store
        .atomic_apply(&[Op::delete("lease/blah", Assert::Exists)])
        .await
        .unwrap();

    h.manager.restart().await.unwrap();
    with_timeout!(2_000, {
        wait.await.unwrap().unwrap();
    });
}

#[regent::test]
async fn replacement_manager_resumes_from_persisted_state() {
    let h = new_harness().await;
    h.claimer
        .claim_leadership("application", "application/0", MINUTE)
        .await
        .unwrap();

    // Tear the worker down, then start a fresh one over the same store and
    // clock, as happens when the clock source is replaced.
    h.manager.shutdown();
    with_timeout!(2_000, {
        h.worker.await.unwrap();
    });
    let (manager, worker) = LeaseManager::start(h.leases.clone(), Arc::clone(&h.clock));

    // Existing leadership survives the swap.
    let token = h.checker.leadership_check("application", "application/0");
    token.check(None).await.unwrap();

    // The replacement still expires leases.
    let wait = {
        let manager = manager.clone();
        tokio::spawn(async move {
            manager
                .block_until_leadership_released("application", None)
                .await
        })
    };
    settle().await;
    h.clock.advance(HOUR).await.unwrap();
    with_timeout!(2_000, {
        wait.await.unwrap().unwrap();
    });

    manager.shutdown();
    with_timeout!(2_000, {
        worker.await.unwrap();
    });
}

#[regent::test]
async fn cancelled_waiters_are_pruned_from_the_registry() {
    let h = new_harness().await;
    h.claimer
        .claim_leadership("blah", "blah/0", MINUTE)
        .await
        .unwrap();

    // Register and immediately cancel a handful of waits.
    for _ in 0..4 {
        let (cancel_tx, cancel_rx) = oneshot::channel::<()>();
        drop(cancel_tx);
        let err = h
            .manager
            .block_until_leadership_released("blah", Some(cancel_rx))
            .await
            .unwrap_err();
        assert!(matches!(err, LeadershipError::BlockCancelled));
    }
    settle().await;

    // A scan that expires nothing still clears the dead registrations.
    h.clock.advance(Duration::from_secs(1)).await.unwrap();
    settle().await;
    assert_eq!(h.manager.pending_waiters().await.unwrap(), 0);

    // A live waiter is not swept up with them.
    let manager = h.manager.clone();
    let wait = tokio::spawn(async move {
        manager.block_until_leadership_released("blah", None).await
    });
    settle().await;
    h.clock.advance(Duration::from_secs(1)).await.unwrap();
    settle().await;
    assert_eq!(h.manager.pending_waiters().await.unwrap(), 1);

    h.clock.advance(HOUR).await.unwrap();
    with_timeout!(2_000, {
        wait.await.unwrap().unwrap();
    });
}

#[regent::test]
async fn manager_expires_leases_already_due_at_startup() {
    let h = new_harness().await;
    h.claimer
        .claim_leadership("blah", "blah/0", MINUTE)
        .await
        .unwrap();
    h.manager.shutdown();
    with_timeout!(2_000, {
        h.worker.await.unwrap();
    });

    // Expiry passes while no manager is running.
    h.clock.advance(HOUR).await.unwrap();

    let (manager, worker) = LeaseManager::start(h.leases.clone(), Arc::clone(&h.clock));
    with_timeout!(2_000, {
        manager
            .block_until_leadership_released("blah", None)
            .await
            .unwrap();
    });
    manager.shutdown();
    with_timeout!(2_000, {
        worker.await.unwrap();
    });
}
