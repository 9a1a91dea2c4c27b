//! Invariant-focused tests: accounting, authorization, conflict rules,
//! races, events, and input bounds.

mod common;

use common::{register, register_infra, service, service_with};
use pinchwork_service::{CreateTask, MarketConfig, PickupFilter};
use pinchwork_types::{MarketError, MarketEvent, TaskStatus};
use std::time::Duration;

/// A hold that would breach the balance fails without side effects.
#[tokio::test]
async fn test_insufficient_credits_rejected_cleanly() {
    let svc = service();
    let alice = register(&svc, "alice").await;

    let err = svc
        .create_task(
            &alice,
            CreateTask {
                need: "too rich for me".into(),
                max_credits: 200,
                ..Default::default()
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, MarketError::InsufficientCredits { have: 100, need: 200 }));

    let credits = svc.get_credits(&alice).await.unwrap();
    assert_eq!(credits.balance, 100);
    assert_eq!(credits.escrowed, 0);
    assert!(svc.verify_ledger().await.unwrap().is_empty());
}

/// The ledger fold reproduces the cached balances across a mixed history,
/// including admin grants.
#[tokio::test]
async fn test_ledger_fold_survives_mixed_history() {
    let svc = service();
    let alice = register(&svc, "alice").await;
    let bob = register(&svc, "bob").await;

    // Settled task.
    let t1 = svc
        .create_task(&alice, CreateTask { need: "one".into(), max_credits: 20, ..Default::default() })
        .await
        .unwrap();
    svc.pickup_specific(&bob, &t1.id).await.unwrap();
    svc.deliver_task(&bob, &t1.id, "ok".into(), Some(15)).await.unwrap();
    svc.approve_task(&alice, &t1.id, None).await.unwrap();

    // Cancelled task.
    let t2 = svc
        .create_task(&alice, CreateTask { need: "two".into(), max_credits: 10, ..Default::default() })
        .await
        .unwrap();
    svc.cancel_task(&alice, &t2.id).await.unwrap();

    // Outstanding escrow.
    svc.create_task(&alice, CreateTask { need: "three".into(), max_credits: 25, ..Default::default() })
        .await
        .unwrap();

    // Admin grant.
    svc.grant_credits(&bob, 40, "welcome back").await.unwrap();

    assert!(svc.verify_ledger().await.unwrap().is_empty());

    // Alice paid 15 in total; the rest is split between balance and the
    // outstanding escrow.
    let report = svc.get_credits(&alice).await.unwrap();
    assert_eq!(report.balance + report.escrowed + 15, 100);
    assert_eq!(report.escrowed, 25);
    assert!(!report.recent.is_empty());
}

/// A worker never claims their own task.
#[tokio::test]
async fn test_worker_is_never_poster() {
    let svc = service();
    let alice = register(&svc, "alice").await;

    let task = svc
        .create_task(&alice, CreateTask { need: "mine".into(), max_credits: 10, ..Default::default() })
        .await
        .unwrap();

    let err = svc.pickup_specific(&alice, &task.id).await.unwrap_err();
    assert!(matches!(err, MarketError::Conflict(_)));
    assert!(svc
        .pickup_next(&alice, &PickupFilter::default())
        .await
        .unwrap()
        .is_none());
}

/// An agent that performed system work on a task is disqualified from
/// working the task itself.
#[tokio::test]
async fn test_system_worker_conflict_rule() {
    let svc = service();
    let alice = register(&svc, "alice").await;
    let _bob = register(&svc, "bob").await;
    let ingo = register_infra(&svc, "ingo").await;

    let task = svc
        .create_task(&alice, CreateTask { need: "match me".into(), max_credits: 10, ..Default::default() })
        .await
        .unwrap();

    let match_task = svc
        .pickup_next(&ingo, &PickupFilter::default())
        .await
        .unwrap()
        .unwrap();
    // Unusable result: the parent falls back to broadcast.
    svc.deliver_task(&ingo, &match_task.id, "no json here".into(), None)
        .await
        .unwrap();

    let task_after = svc.get_task(&task.id, None).await.unwrap();
    assert_eq!(task_after.status, TaskStatus::Posted);

    let err = svc.pickup_specific(&ingo, &task.id).await.unwrap_err();
    assert!(matches!(err, MarketError::Conflict(_)));
    assert!(svc
        .pickup_next(&ingo, &PickupFilter::default())
        .await
        .unwrap()
        .is_none());
}

/// Concurrent pickups of the same task produce at most one claimant.
#[tokio::test]
async fn test_concurrent_pickup_single_winner() {
    let svc = std::sync::Arc::new(service());
    let alice = register(&svc, "alice").await;
    let bob = register(&svc, "bob").await;
    let carol = register(&svc, "carol").await;

    let task = svc
        .create_task(&alice, CreateTask { need: "race me".into(), max_credits: 10, ..Default::default() })
        .await
        .unwrap();

    let (first, second) = tokio::join!(
        svc.pickup_specific(&bob, &task.id),
        svc.pickup_specific(&carol, &task.id),
    );
    let outcomes = [first.is_ok(), second.is_ok()];
    assert_eq!(outcomes.iter().filter(|ok| **ok).count(), 1);

    let task = svc.get_task(&task.id, None).await.unwrap();
    assert_eq!(task.status, TaskStatus::Claimed);
    assert!(task.worker_id == Some(bob) || task.worker_id == Some(carol));
}

/// Two approvals of one delivery settle exactly once.
#[tokio::test]
async fn test_double_approval_settles_once() {
    let svc = service();
    let alice = register(&svc, "alice").await;
    let bob = register(&svc, "bob").await;

    let task = svc
        .create_task(&alice, CreateTask { need: "pay once".into(), max_credits: 20, ..Default::default() })
        .await
        .unwrap();
    svc.pickup_specific(&bob, &task.id).await.unwrap();
    svc.deliver_task(&bob, &task.id, "done".into(), None).await.unwrap();

    svc.approve_task(&alice, &task.id, None).await.unwrap();
    let err = svc.approve_task(&alice, &task.id, None).await.unwrap_err();
    assert!(matches!(err, MarketError::Conflict(_)));

    assert_eq!(svc.get_agent(&bob).await.unwrap().balance, 118);
    assert!(svc.verify_ledger().await.unwrap().is_empty());
}

/// Wrong-role callers are refused.
#[tokio::test]
async fn test_authorization_checks() {
    let svc = service();
    let alice = register(&svc, "alice").await;
    let bob = register(&svc, "bob").await;
    let mallory = register(&svc, "mallory").await;

    let task = svc
        .create_task(&alice, CreateTask { need: "guarded".into(), max_credits: 10, ..Default::default() })
        .await
        .unwrap();
    svc.pickup_specific(&bob, &task.id).await.unwrap();

    let err = svc
        .deliver_task(&mallory, &task.id, "not mine".into(), None)
        .await
        .unwrap_err();
    assert!(matches!(err, MarketError::Unauthorized(_)));

    svc.deliver_task(&bob, &task.id, "mine".into(), None).await.unwrap();

    let err = svc.approve_task(&mallory, &task.id, None).await.unwrap_err();
    assert!(matches!(err, MarketError::Unauthorized(_)));
    let err = svc
        .reject_task(&mallory, &task.id, "nope".into(), None)
        .await
        .unwrap_err();
    assert!(matches!(err, MarketError::Unauthorized(_)));
}

/// Suspended agents cannot post or pick up.
#[tokio::test]
async fn test_suspension_blocks_operations() {
    let svc = service();
    let alice = register(&svc, "alice").await;
    let bob = register(&svc, "bob").await;

    svc.create_task(&alice, CreateTask { need: "open".into(), max_credits: 10, ..Default::default() })
        .await
        .unwrap();

    svc.suspend(&bob, true, Some("abuse".into())).await.unwrap();
    let err = svc
        .pickup_next(&bob, &PickupFilter::default())
        .await
        .unwrap_err();
    assert!(matches!(err, MarketError::Suspended(_)));
    let err = svc
        .create_task(&bob, CreateTask { need: "blocked".into(), max_credits: 5, ..Default::default() })
        .await
        .unwrap_err();
    assert!(matches!(err, MarketError::Suspended(_)));

    // Suspension is soft.
    svc.suspend(&bob, false, None).await.unwrap();
    assert!(svc
        .pickup_next(&bob, &PickupFilter::default())
        .await
        .unwrap()
        .is_some());
}

/// Too many abandons trigger the pickup cooldown.
#[tokio::test]
async fn test_abandon_cooldown() {
    let config = MarketConfig {
        max_abandons_before_cooldown: 1,
        ..Default::default()
    };
    let svc = service_with(config);
    let alice = register(&svc, "alice").await;
    let bob = register(&svc, "bob").await;

    let task = svc
        .create_task(&alice, CreateTask { need: "flaky".into(), max_credits: 10, ..Default::default() })
        .await
        .unwrap();
    svc.pickup_specific(&bob, &task.id).await.unwrap();
    svc.abandon_task(&bob, &task.id).await.unwrap();

    let err = svc
        .pickup_next(&bob, &PickupFilter::default())
        .await
        .unwrap_err();
    assert!(matches!(err, MarketError::Cooldown { .. }));
}

/// Input bounds from the contract are enforced.
#[tokio::test]
async fn test_input_bounds() {
    let svc = service();
    let alice = register(&svc, "alice").await;

    for input in [
        CreateTask { need: "".into(), max_credits: 10, ..Default::default() },
        CreateTask { need: "ok".into(), max_credits: 0, ..Default::default() },
        CreateTask { need: "ok".into(), max_credits: 100_001, ..Default::default() },
        CreateTask {
            need: "ok".into(),
            max_credits: 10,
            tags: vec!["Not-Lower".into()],
            ..Default::default()
        },
    ] {
        let err = svc.create_task(&alice, input).await.unwrap_err();
        assert!(matches!(err, MarketError::InvalidInput(_)));
    }

    let err = svc
        .register(pinchwork_types::AgentProfile {
            name: "x".repeat(201),
            ..Default::default()
        })
        .await
        .unwrap_err();
    assert!(matches!(err, MarketError::InvalidInput(_)));
}

/// Tag and text filters narrow pickup.
#[tokio::test]
async fn test_pickup_filters() {
    let svc = service();
    let alice = register(&svc, "alice").await;
    let bob = register(&svc, "bob").await;

    svc.create_task(
        &alice,
        CreateTask {
            need: "translate the docs".into(),
            max_credits: 10,
            tags: vec!["translation".into()],
            ..Default::default()
        },
    )
    .await
    .unwrap();
    svc.create_task(
        &alice,
        CreateTask {
            need: "tune the database".into(),
            max_credits: 10,
            tags: vec!["databases".into()],
            ..Default::default()
        },
    )
    .await
    .unwrap();

    let picked = svc
        .pickup_next(
            &bob,
            &PickupFilter { tags: vec!["databases".into()], search: None },
        )
        .await
        .unwrap()
        .unwrap();
    assert!(picked.need.contains("database"));

    let picked = svc
        .pickup_next(
            &bob,
            &PickupFilter { tags: vec![], search: Some("TRANSLATE".into()) },
        )
        .await
        .unwrap()
        .unwrap();
    assert!(picked.need.contains("translate"));
}

/// Lifecycle events reach the right parties.
#[tokio::test]
async fn test_event_notifications() {
    let svc = service();
    let alice = register(&svc, "alice").await;
    let bob = register(&svc, "bob").await;

    let mut alice_events = svc.subscribe_events(&alice).await;
    let mut bob_events = svc.subscribe_events(&bob).await;

    let task = svc
        .create_task(&alice, CreateTask { need: "observe me".into(), max_credits: 10, ..Default::default() })
        .await
        .unwrap();
    svc.pickup_specific(&bob, &task.id).await.unwrap();
    svc.deliver_task(&bob, &task.id, "done".into(), None).await.unwrap();
    svc.approve_task(&alice, &task.id, None).await.unwrap();

    let claimed = alice_events.try_recv().unwrap().unwrap();
    assert!(matches!(claimed.event, MarketEvent::TaskClaimed { .. }));
    let delivered = alice_events.try_recv().unwrap().unwrap();
    assert!(matches!(delivered.event, MarketEvent::TaskDelivered { .. }));
    let approved = alice_events.try_recv().unwrap().unwrap();
    assert!(matches!(approved.event, MarketEvent::TaskApproved { auto: false, .. }));

    let approved = bob_events.try_recv().unwrap().unwrap();
    assert!(matches!(approved.event, MarketEvent::TaskApproved { .. }));
}

/// Blocking `get_task` returns as soon as the delivery lands.
#[tokio::test]
async fn test_get_task_waits_for_delivery() {
    let svc = std::sync::Arc::new(service());
    let alice = register(&svc, "alice").await;
    let bob = register(&svc, "bob").await;

    let task = svc
        .create_task(&alice, CreateTask { need: "wait for me".into(), max_credits: 10, ..Default::default() })
        .await
        .unwrap();
    svc.pickup_specific(&bob, &task.id).await.unwrap();

    let waiter = {
        let svc = svc.clone();
        let task_id = task.id.clone();
        tokio::spawn(async move { svc.get_task(&task_id, Some(5)).await })
    };

    tokio::time::sleep(Duration::from_millis(50)).await;
    svc.deliver_task(&bob, &task.id, "here".into(), None).await.unwrap();

    let waited = tokio::time::timeout(Duration::from_secs(2), waiter)
        .await
        .expect("wait should resolve promptly")
        .unwrap()
        .unwrap();
    assert_eq!(waited.status, TaskStatus::Delivered);
}

/// Worker rates the poster once, after approval.
#[tokio::test]
async fn test_bidirectional_rating() {
    let svc = service();
    let alice = register(&svc, "alice").await;
    let bob = register(&svc, "bob").await;

    let task = svc
        .create_task(&alice, CreateTask { need: "rate me".into(), max_credits: 10, ..Default::default() })
        .await
        .unwrap();
    svc.pickup_specific(&bob, &task.id).await.unwrap();

    let err = svc.rate_poster(&bob, &task.id, 4).await.unwrap_err();
    assert!(matches!(err, MarketError::Conflict(_)));

    svc.deliver_task(&bob, &task.id, "done".into(), None).await.unwrap();
    svc.approve_task(&alice, &task.id, Some(5)).await.unwrap();

    svc.rate_poster(&bob, &task.id, 4).await.unwrap();
    let err = svc.rate_poster(&bob, &task.id, 2).await.unwrap_err();
    assert!(matches!(err, MarketError::Conflict(_)));

    assert_eq!(svc.get_agent(&alice).await.unwrap().reputation, 4.0);
    assert_eq!(svc.get_agent(&bob).await.unwrap().reputation, 5.0);
}

/// Questions before pickup, messages while in flight.
#[tokio::test]
async fn test_questions_and_messages() {
    let svc = service();
    let alice = register(&svc, "alice").await;
    let bob = register(&svc, "bob").await;

    let task = svc
        .create_task(&alice, CreateTask { need: "ambiguous".into(), max_credits: 10, ..Default::default() })
        .await
        .unwrap();

    let question = svc
        .ask_question(&bob, &task.id, "which format?".into())
        .await
        .unwrap();
    let answered = svc
        .answer_question(&alice, &task.id, &question.id, "markdown".into())
        .await
        .unwrap();
    assert_eq!(answered.answer.as_deref(), Some("markdown"));

    // One answer per question.
    let err = svc
        .answer_question(&alice, &task.id, &question.id, "again".into())
        .await
        .unwrap_err();
    assert!(matches!(err, MarketError::Conflict(_)));

    svc.pickup_specific(&bob, &task.id).await.unwrap();

    // Questions are for posted tasks only.
    let err = svc
        .ask_question(&bob, &task.id, "too late?".into())
        .await
        .unwrap_err();
    assert!(matches!(err, MarketError::Conflict(_)));

    svc.send_message(&bob, &task.id, "halfway there".into()).await.unwrap();
    svc.send_message(&alice, &task.id, "looking good".into()).await.unwrap();
    let messages = svc.list_messages(&alice, &task.id).await.unwrap();
    assert_eq!(messages.len(), 2);

    let err = svc
        .send_message(&register(&svc, "outsider").await, &task.id, "hi".into())
        .await
        .unwrap_err();
    assert!(matches!(err, MarketError::Unauthorized(_)));
}

/// Listing shows what pickup would see, without claiming.
#[tokio::test]
async fn test_list_available_and_mine() {
    let svc = service();
    let alice = register(&svc, "alice").await;
    let bob = register(&svc, "bob").await;

    let t1 = svc
        .create_task(&alice, CreateTask { need: "first".into(), max_credits: 10, ..Default::default() })
        .await
        .unwrap();
    let _t2 = svc
        .create_task(&alice, CreateTask { need: "second".into(), max_credits: 10, ..Default::default() })
        .await
        .unwrap();

    let available = svc
        .list_available(&bob, &PickupFilter::default())
        .await
        .unwrap();
    assert_eq!(available.len(), 2);
    assert_eq!(available[0].id, t1.id);

    // Nothing was claimed by listing.
    assert_eq!(
        svc.get_task(&t1.id, None).await.unwrap().status,
        TaskStatus::Posted
    );

    svc.pickup_specific(&bob, &t1.id).await.unwrap();
    let mine = svc
        .list_my_tasks(&bob, Some(pinchwork_service::TaskRole::Worker), None)
        .await
        .unwrap();
    assert_eq!(mine.len(), 1);
    assert_eq!(mine[0].id, t1.id);

    let posted = svc.list_my_tasks(&alice, None, None).await.unwrap();
    assert_eq!(posted.len(), 2);
}
