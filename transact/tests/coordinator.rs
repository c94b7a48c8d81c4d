use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;

use tc_txn::*;
use tc_txn_error::*;

#[derive(Clone, Default)]
struct Events(Arc<Mutex<Vec<String>>>);

impl Events {
    fn push(&self, event: String) {
        self.0.lock().unwrap().push(event);
    }

    fn take(&self) -> Vec<String> {
        std::mem::take(&mut *self.0.lock().unwrap())
    }
}

/// A resource which records every request it receives.
struct Probe {
    name: String,
    events: Events,
    vote: Vote,
    delay: Duration,
    fail_prepare: bool,
    fail_commit: bool,
    fail_rollback: bool,
}

impl Probe {
    fn new(name: &str, events: &Events) -> Self {
        Self {
            name: name.to_string(),
            events: events.clone(),
            vote: Vote::Commit,
            delay: Duration::ZERO,
            fail_prepare: false,
            fail_commit: false,
            fail_rollback: false,
        }
    }

    fn vote(mut self, vote: Vote) -> Self {
        self.vote = vote;
        self
    }

    fn delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    fn fail_prepare(mut self) -> Self {
        self.fail_prepare = true;
        self
    }

    fn fail_commit(mut self) -> Self {
        self.fail_commit = true;
        self
    }

    fn fail_rollback(mut self) -> Self {
        self.fail_rollback = true;
        self
    }

    fn build(self) -> Arc<dyn Resource> {
        Arc::new(self)
    }

    fn result(&self, fail: bool) -> TCResult<()> {
        if fail {
            Err(TCError::resource(format!("{} is unavailable", self.name)))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl Resource for Probe {
    fn name(&self) -> &str {
        &self.name
    }

    async fn prepare(&self, _txn_id: &TxnId) -> TCResult<Vote> {
        self.events.push(format!("{} prepare", self.name));

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        self.result(self.fail_prepare).map(|()| self.vote)
    }

    async fn commit(&self, _txn_id: &TxnId) -> TCResult<()> {
        self.events.push(format!("{} commit", self.name));
        self.result(self.fail_commit)
    }

    async fn rollback(&self, _txn_id: &TxnId) -> TCResult<()> {
        self.events.push(format!("{} rollback", self.name));
        self.result(self.fail_rollback)
    }
}

/// A resource which checks that the prepare decision is logged before it's asked to commit.
struct LogCheck {
    log: Arc<MemoryLog>,
    seen: Mutex<Vec<Status>>,
}

#[async_trait]
impl Resource for LogCheck {
    fn name(&self) -> &str {
        "log check"
    }

    async fn prepare(&self, _txn_id: &TxnId) -> TCResult<Vote> {
        Ok(Vote::Commit)
    }

    async fn commit(&self, txn_id: &TxnId) -> TCResult<()> {
        *self.seen.lock().unwrap() = self.log.statuses(txn_id);
        Ok(())
    }

    async fn rollback(&self, _txn_id: &TxnId) -> TCResult<()> {
        Ok(())
    }
}

struct BrokenLog;

#[async_trait]
impl TxnLog for BrokenLog {
    async fn record(&self, _txn_id: &TxnId, _status: Status) -> TCResult<()> {
        Err(TCError::resource("disk full"))
    }
}

fn coordinator() -> Coordinator {
    let _ = env_logger::builder().is_test(true).try_init();

    Builder::new()
        .sweep_interval(Duration::from_millis(10))
        .build()
}

fn sorted(mut events: Vec<String>) -> Vec<String> {
    events.sort();
    events
}

#[tokio::test]
async fn test_commit_in_enlistment_order() {
    let log = Arc::new(MemoryLog::new());
    let coordinator = Builder::new().with_log(log.clone()).build();
    let context = coordinator.context();
    let events = Events::default();

    let handle = coordinator.begin(&context, None).unwrap();
    let a = Probe::new("a", &events).build();
    let b = Probe::new("b", &events).build();

    coordinator.enlist(&context, b.clone()).await.unwrap();
    coordinator.enlist(&context, a.clone()).await.unwrap();
    coordinator.enlist(&context, b.clone()).await.unwrap();
    assert_eq!(coordinator.get_status(&context), Some(Status::Active));
    assert_eq!(coordinator.live_count(), 1);

    coordinator.commit(&context).await.unwrap();

    assert_eq!(
        events.take(),
        vec!["b prepare", "a prepare", "b commit", "a commit"]
    );

    assert_eq!(handle.status(), Status::Committed);
    assert_eq!(handle.outcome(), Some(Outcome::Committed));
    assert_eq!(
        handle.history().await,
        vec![
            Status::Active,
            Status::Preparing,
            Status::Prepared,
            Status::Committing,
            Status::Committed
        ]
    );

    assert_eq!(
        log.statuses(handle.id()),
        vec![Status::Prepared, Status::Committed]
    );

    assert_eq!(coordinator.get_status(&context), None);
    assert!(!context.is_bound());
    assert_eq!(coordinator.live_count(), 0);
}

#[tokio::test]
async fn test_prepare_is_logged_before_commit() {
    let log = Arc::new(MemoryLog::new());
    let coordinator = Builder::new().with_log(log.clone()).build();
    let context = coordinator.context();

    let check = Arc::new(LogCheck {
        log: log.clone(),
        seen: Mutex::new(vec![]),
    });

    coordinator.begin(&context, None).unwrap();
    coordinator.enlist(&context, check.clone()).await.unwrap();
    coordinator.commit(&context).await.unwrap();

    assert_eq!(*check.seen.lock().unwrap(), vec![Status::Prepared]);
}

#[tokio::test]
async fn test_commit_empty_transaction() {
    let coordinator = coordinator();
    let context = coordinator.context();

    let handle = coordinator.begin(&context, None).unwrap();
    coordinator.commit(&context).await.unwrap();

    assert_eq!(handle.wait().await, Status::Committed);
    assert_eq!(handle.history().await.len(), 5);
}

#[tokio::test]
async fn test_begin_twice() {
    let coordinator = coordinator();
    let context = coordinator.context();

    coordinator.begin(&context, None).unwrap();
    let err = coordinator.begin(&context, None).unwrap_err();
    assert_eq!(err.code(), ErrorType::AlreadyActive);

    // a different context is independent
    let other = coordinator.context();
    coordinator.begin(&other, None).unwrap();
    assert_eq!(coordinator.live_count(), 2);
}

#[tokio::test]
async fn test_no_active_transaction() {
    let coordinator = coordinator();
    let context = coordinator.context();
    let events = Events::default();

    let err = coordinator
        .enlist(&context, Probe::new("a", &events).build())
        .await
        .unwrap_err();

    assert_eq!(err.code(), ErrorType::NoActiveTransaction);

    let err = coordinator.commit(&context).await.unwrap_err();
    assert_eq!(err.code(), ErrorType::NoActiveTransaction);

    let err = coordinator.rollback(&context).await.unwrap_err();
    assert_eq!(err.code(), ErrorType::NoActiveTransaction);

    let err = coordinator.set_rollback_only(&context).await.unwrap_err();
    assert_eq!(err.code(), ErrorType::NoActiveTransaction);

    assert!(events.take().is_empty());
}

#[tokio::test]
async fn test_vote_rollback() {
    let coordinator = coordinator();
    let context = coordinator.context();
    let events = Events::default();

    let handle = coordinator.begin(&context, None).unwrap();
    for resource in [
        Probe::new("a", &events).build(),
        Probe::new("b", &events).vote(Vote::Rollback).build(),
        Probe::new("c", &events).build(),
    ] {
        coordinator.enlist(&context, resource).await.unwrap();
    }

    let err = coordinator.commit(&context).await.unwrap_err();
    assert_eq!(err.code(), ErrorType::RolledBack);

    let events = events.take();
    assert_eq!(&events[..2], &["a prepare", "b prepare"]);
    assert_eq!(
        sorted(events[2..].to_vec()),
        vec!["a rollback", "b rollback", "c rollback"]
    );

    assert_eq!(handle.status(), Status::RolledBack);
    assert_eq!(handle.outcome(), Some(Outcome::RolledBack));
    assert_eq!(
        handle.history().await,
        vec![
            Status::Active,
            Status::Preparing,
            Status::RollingBack,
            Status::RolledBack
        ]
    );

    assert!(!context.is_bound());
    coordinator.begin(&context, None).unwrap();
}

#[tokio::test]
async fn test_prepare_error() {
    let coordinator = coordinator();
    let context = coordinator.context();
    let events = Events::default();

    let handle = coordinator.begin(&context, None).unwrap();
    coordinator
        .enlist(&context, Probe::new("a", &events).fail_prepare().build())
        .await
        .unwrap();

    coordinator
        .enlist(&context, Probe::new("b", &events).build())
        .await
        .unwrap();

    let err = coordinator.commit(&context).await.unwrap_err();
    assert_eq!(err.code(), ErrorType::RolledBack);

    assert_eq!(
        sorted(events.take()),
        vec!["a prepare", "a rollback", "b rollback"]
    );

    assert_eq!(handle.status(), Status::RolledBack);
}

#[tokio::test]
async fn test_heuristic_commit() {
    let coordinator = coordinator();
    let context = coordinator.context();
    let events = Events::default();

    let handle = coordinator.begin(&context, None).unwrap();
    coordinator
        .enlist(&context, Probe::new("a", &events).fail_commit().build())
        .await
        .unwrap();

    coordinator
        .enlist(&context, Probe::new("b", &events).build())
        .await
        .unwrap();

    let err = coordinator.commit(&context).await.unwrap_err();
    assert_eq!(err.code(), ErrorType::HeuristicOutcome);

    assert_eq!(
        events.take(),
        vec!["a prepare", "b prepare", "a commit", "b commit"]
    );

    assert_eq!(handle.status(), Status::Heuristic);
    assert_eq!(handle.outcome(), Some(Outcome::Heuristic));
    assert_eq!(handle.anomalies().await.len(), 1);
    assert!(!context.is_bound());
}

#[tokio::test]
async fn test_rollback_sweep_continues_after_failure() {
    let coordinator = coordinator();
    let context = coordinator.context();
    let events = Events::default();

    let handle = coordinator.begin(&context, None).unwrap();
    coordinator
        .enlist(&context, Probe::new("a", &events).fail_rollback().build())
        .await
        .unwrap();

    coordinator
        .enlist(&context, Probe::new("b", &events).build())
        .await
        .unwrap();

    coordinator.rollback(&context).await.unwrap();

    assert_eq!(sorted(events.take()), vec!["a rollback", "b rollback"]);
    assert_eq!(handle.status(), Status::RolledBack);
    assert_eq!(
        handle.history().await,
        vec![Status::Active, Status::RollingBack, Status::RolledBack]
    );
    assert_eq!(handle.anomalies().await.len(), 1);
}

#[tokio::test]
async fn test_rollback_fails_everywhere() {
    let coordinator = coordinator();
    let context = coordinator.context();
    let events = Events::default();

    let handle = coordinator.begin(&context, None).unwrap();
    coordinator
        .enlist(&context, Probe::new("a", &events).fail_rollback().build())
        .await
        .unwrap();

    let err = coordinator.rollback(&context).await.unwrap_err();
    assert_eq!(err.code(), ErrorType::HeuristicOutcome);
    assert_eq!(handle.status(), Status::Heuristic);
    assert!(!context.is_bound());
}

#[tokio::test(start_paused = true)]
async fn test_enlist_while_preparing() {
    let coordinator = coordinator();
    let context = coordinator.context();
    let events = Events::default();

    let handle = coordinator.begin(&context, None).unwrap();
    coordinator
        .enlist(
            &context,
            Probe::new("a", &events)
                .delay(Duration::from_secs(1))
                .build(),
        )
        .await
        .unwrap();

    let commit = tokio::spawn({
        let coordinator = coordinator.clone();
        let context = context.clone();
        async move { coordinator.commit(&context).await }
    });

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(handle.status(), Status::Preparing);

    let err = coordinator
        .enlist(&context, Probe::new("b", &events).build())
        .await
        .unwrap_err();

    assert_eq!(err.code(), ErrorType::IllegalState);

    let err = coordinator.commit(&context).await.unwrap_err();
    assert_eq!(err.code(), ErrorType::IllegalState);

    // changing the timeout of a transaction being prepared has no effect
    let deadline = handle.deadline().await;
    coordinator
        .set_transaction_timeout(&context, Duration::from_secs(5))
        .await
        .unwrap();

    assert_eq!(handle.deadline().await, deadline);

    commit.await.unwrap().unwrap();
    assert_eq!(handle.status(), Status::Committed);
    assert_eq!(events.take(), vec!["a prepare", "a commit"]);
}

#[tokio::test(start_paused = true)]
async fn test_timeout_during_prepare() {
    let coordinator = coordinator();
    let context = coordinator.context();
    let events = Events::default();

    let handle = coordinator
        .begin(&context, Some(Duration::from_secs(1)))
        .unwrap();

    coordinator
        .enlist(
            &context,
            Probe::new("a", &events)
                .delay(Duration::from_secs(5))
                .build(),
        )
        .await
        .unwrap();

    let start = Instant::now();
    let err = coordinator.commit(&context).await.unwrap_err();
    assert_eq!(err.code(), ErrorType::Timeout);
    assert!(start.elapsed() < Duration::from_secs(2));

    assert_eq!(handle.status(), Status::RolledBack);
    assert_eq!(handle.outcome(), Some(Outcome::TimedOut));
    assert_eq!(
        handle.history().await,
        vec![
            Status::Active,
            Status::Preparing,
            Status::RollingBack,
            Status::RolledBack
        ]
    );

    let events = events.take();
    assert_eq!(events[0], "a prepare");
    assert!(events.iter().any(|event| event == "a rollback"));
    assert!(!events.iter().any(|event| event == "a commit"));

    assert!(!context.is_bound());
    assert_eq!(coordinator.live_count(), 0);
    coordinator.begin(&context, None).unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_timeout_while_active() {
    let coordinator = coordinator();
    let context = coordinator.context();
    let events = Events::default();

    let handle = coordinator
        .begin(&context, Some(Duration::from_secs(1)))
        .unwrap();

    coordinator
        .enlist(&context, Probe::new("a", &events).build())
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_secs(2)).await;

    assert_eq!(handle.status(), Status::RolledBack);
    assert_eq!(handle.outcome(), Some(Outcome::TimedOut));
    assert_eq!(events.take(), vec!["a rollback"]);
    assert_eq!(coordinator.get_status(&context), None);

    let err = coordinator.commit(&context).await.unwrap_err();
    assert_eq!(err.code(), ErrorType::Timeout);

    let err = coordinator.commit(&context).await.unwrap_err();
    assert_eq!(err.code(), ErrorType::NoActiveTransaction);

    coordinator.begin(&context, None).unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_begin_after_timeout() {
    let coordinator = coordinator();
    let context = coordinator.context();

    let first = coordinator
        .begin(&context, Some(Duration::from_secs(1)))
        .unwrap();

    assert_eq!(first.wait().await, Status::RolledBack);

    let second = coordinator.begin(&context, None).unwrap();
    assert_ne!(first.id(), second.id());
    assert_eq!(context.txn_id(), Some(*second.id()));
}

#[tokio::test(start_paused = true)]
async fn test_commit_after_deadline_before_sweep() {
    let coordinator = Builder::new()
        .sweep_interval(Duration::from_secs(10))
        .build();

    let context = coordinator.context();
    let events = Events::default();

    let handle = coordinator
        .begin(&context, Some(Duration::from_secs(1)))
        .unwrap();

    coordinator
        .enlist(&context, Probe::new("a", &events).build())
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(1500)).await;
    assert_eq!(handle.status(), Status::Active);

    let err = coordinator.commit(&context).await.unwrap_err();
    assert_eq!(err.code(), ErrorType::Timeout);

    assert_eq!(events.take(), vec!["a rollback"]);
    assert_eq!(handle.outcome(), Some(Outcome::TimedOut));
    assert_eq!(
        handle.history().await,
        vec![Status::Active, Status::RollingBack, Status::RolledBack]
    );

    assert!(!context.is_bound());
}

#[tokio::test(start_paused = true)]
async fn test_deadline_passes_during_prepare() {
    let coordinator = Builder::new()
        .sweep_interval(Duration::from_secs(10))
        .build();

    let context = coordinator.context();
    let events = Events::default();

    let handle = coordinator
        .begin(&context, Some(Duration::from_secs(1)))
        .unwrap();

    coordinator
        .enlist(
            &context,
            Probe::new("a", &events)
                .delay(Duration::from_secs(2))
                .build(),
        )
        .await
        .unwrap();

    let err = coordinator.commit(&context).await.unwrap_err();
    assert_eq!(err.code(), ErrorType::Timeout);

    assert_eq!(events.take(), vec!["a prepare", "a rollback"]);
    assert_eq!(handle.outcome(), Some(Outcome::TimedOut));
    assert_eq!(
        handle.history().await,
        vec![
            Status::Active,
            Status::Preparing,
            Status::RollingBack,
            Status::RolledBack
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn test_commit_beats_timeout() {
    let coordinator = coordinator();
    let context = coordinator.context();
    let events = Events::default();

    let handle = coordinator
        .begin(&context, Some(Duration::from_secs(1)))
        .unwrap();

    coordinator
        .enlist(
            &context,
            Probe::new("a", &events)
                .delay(Duration::from_millis(500))
                .build(),
        )
        .await
        .unwrap();

    coordinator.commit(&context).await.unwrap();

    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(handle.status(), Status::Committed);
    assert_eq!(events.take(), vec!["a prepare", "a commit"]);
}

#[tokio::test(start_paused = true)]
async fn test_extend_timeout() {
    let coordinator = coordinator();
    let context = coordinator.context();

    let handle = coordinator
        .begin(&context, Some(Duration::from_secs(1)))
        .unwrap();

    tokio::time::sleep(Duration::from_millis(500)).await;
    coordinator
        .set_transaction_timeout(&context, Duration::from_secs(3))
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(handle.status(), Status::Active);

    coordinator.commit(&context).await.unwrap();
    assert_eq!(handle.status(), Status::Committed);
}

#[tokio::test(start_paused = true)]
async fn test_shorten_timeout() {
    let coordinator = coordinator();
    let context = coordinator.context();

    let handle = coordinator.begin(&context, None).unwrap();
    coordinator
        .set_transaction_timeout(&context, Duration::from_secs(1))
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(handle.outcome(), Some(Outcome::TimedOut));
}

#[tokio::test(start_paused = true)]
async fn test_context_timeout() {
    let coordinator = coordinator();
    let context = coordinator.context();

    coordinator
        .set_transaction_timeout(&context, Duration::from_secs(1))
        .await
        .unwrap();

    let first = coordinator.begin(&context, None).unwrap();
    assert!(first.deadline().await <= Instant::now() + Duration::from_secs(1));
    assert_eq!(first.wait().await, Status::RolledBack);

    // the timeout applies to every later transaction on the same context
    let second = coordinator.begin(&context, None).unwrap();
    assert!(second.deadline().await <= Instant::now() + Duration::from_secs(1));
    coordinator.rollback(&context).await.unwrap();

    // and zero restores the default
    coordinator
        .set_transaction_timeout(&context, Duration::ZERO)
        .await
        .unwrap();

    let third = coordinator.begin(&context, None).unwrap();
    assert!(third.deadline().await >= Instant::now() + Duration::from_secs(30));
}

#[tokio::test]
async fn test_rollback_only() {
    let coordinator = coordinator();
    let context = coordinator.context();
    let events = Events::default();

    let handle = coordinator.begin(&context, None).unwrap();
    coordinator
        .enlist(&context, Probe::new("a", &events).build())
        .await
        .unwrap();

    coordinator.set_rollback_only(&context).await.unwrap();

    let err = coordinator.commit(&context).await.unwrap_err();
    assert_eq!(err.code(), ErrorType::RolledBack);
    assert_eq!(events.take(), vec!["a rollback"]);
    assert_eq!(handle.status(), Status::RolledBack);
    assert!(!context.is_bound());
}

#[tokio::test]
async fn test_suspend_and_resume() {
    let coordinator = coordinator();
    let context = coordinator.context();
    let events = Events::default();

    let outer = coordinator.begin(&context, None).unwrap();
    coordinator
        .enlist(&context, Probe::new("outer", &events).build())
        .await
        .unwrap();

    let suspended = coordinator.suspend(&context).unwrap();
    assert_eq!(suspended.id(), outer.id());
    assert_eq!(coordinator.get_status(&context), None);
    assert!(coordinator.suspend(&context).is_none());

    let inner = coordinator.begin(&context, None).unwrap();
    coordinator
        .enlist(&context, Probe::new("inner", &events).build())
        .await
        .unwrap();

    let err = coordinator
        .resume(&context, suspended.clone())
        .unwrap_err();

    assert_eq!(err.code(), ErrorType::AlreadyActive);

    coordinator.commit(&context).await.unwrap();
    assert_eq!(inner.status(), Status::Committed);
    assert_eq!(outer.status(), Status::Active);

    coordinator.resume(&context, suspended).unwrap();
    coordinator.commit(&context).await.unwrap();
    assert_eq!(outer.status(), Status::Committed);

    assert_eq!(
        events.take(),
        vec![
            "inner prepare",
            "inner commit",
            "outer prepare",
            "outer commit"
        ]
    );

    let err = coordinator.resume(&context, inner).unwrap_err();
    assert_eq!(err.code(), ErrorType::IllegalState);
}

#[tokio::test]
async fn test_resume_bound_transaction() {
    let coordinator = coordinator();
    let first = coordinator.context();
    let second = coordinator.context();

    let handle = coordinator.begin(&first, None).unwrap();

    let err = coordinator.resume(&second, handle.clone()).unwrap_err();
    assert_eq!(err.code(), ErrorType::IllegalState);
    assert!(!second.is_bound());

    let suspended = coordinator.suspend(&first).unwrap();
    coordinator.resume(&second, suspended).unwrap();
    assert_eq!(second.txn_id(), Some(*handle.id()));

    let err = coordinator.resume(&first, handle.clone()).unwrap_err();
    assert_eq!(err.code(), ErrorType::IllegalState);

    coordinator.commit(&second).await.unwrap();
    assert_eq!(handle.status(), Status::Committed);
}

#[tokio::test]
async fn test_log_failure_rolls_back() {
    let coordinator = Builder::new().with_log(Arc::new(BrokenLog)).build();
    let context = coordinator.context();
    let events = Events::default();

    let handle = coordinator.begin(&context, None).unwrap();
    coordinator
        .enlist(&context, Probe::new("a", &events).build())
        .await
        .unwrap();

    let err = coordinator.commit(&context).await.unwrap_err();
    assert_eq!(err.code(), ErrorType::RolledBack);
    assert_eq!(events.take(), vec!["a prepare", "a rollback"]);
    assert_eq!(handle.status(), Status::RolledBack);
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_contexts() {
    let coordinator = coordinator();
    let events = Events::default();

    let slow = coordinator.context();
    let fast = coordinator.context();

    let slow_handle = coordinator
        .begin(&slow, Some(Duration::from_secs(1)))
        .unwrap();

    let fast_handle = coordinator
        .begin(&fast, Some(Duration::from_secs(1)))
        .unwrap();

    coordinator
        .enlist(
            &slow,
            Probe::new("slow", &events)
                .delay(Duration::from_secs(5))
                .build(),
        )
        .await
        .unwrap();

    coordinator
        .enlist(&fast, Probe::new("fast", &events).build())
        .await
        .unwrap();

    let (slow_result, fast_result) =
        tokio::join!(coordinator.commit(&slow), coordinator.commit(&fast));

    assert_eq!(slow_result.unwrap_err().code(), ErrorType::Timeout);
    fast_result.unwrap();

    assert_eq!(slow_handle.outcome(), Some(Outcome::TimedOut));
    assert_eq!(fast_handle.outcome(), Some(Outcome::Committed));
}
