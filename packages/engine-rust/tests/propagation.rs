//! End-to-end propagation scenarios against the in-memory backend.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use connscope_core::NO_CONNECTION_MESSAGE;
use connscope_engine::{
    ConnectionCustomizer, ConnectionDefinition, ConnectionError, ConnectionOperations,
    ConnectionStatus, ConnectionSynchronization, Isolation, MemoryBackend, MemoryConnection,
    PropagatedContext, Result, TracingCustomizer, UnitOfWork,
};
use parking_lot::Mutex;

fn engine() -> ConnectionOperations<MemoryBackend> {
    ConnectionOperations::new("memory", MemoryBackend::new())
}

/// Counts units of work passing through the chain.
struct Counting {
    calls: Arc<AtomicUsize>,
}

impl ConnectionCustomizer<MemoryConnection> for Counting {
    fn order(&self) -> i32 {
        10
    }

    fn intercept<'a>(&'a self, work: UnitOfWork<'a, MemoryConnection>) -> UnitOfWork<'a, MemoryConnection> {
        Box::new(move |status: &ConnectionStatus<MemoryConnection>| -> Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            work(status)
        })
    }
}

/// Records which stages fired and whether the connection was closed at the time.
struct ObserveClose {
    connection: MemoryConnection,
    log: Arc<Mutex<Vec<String>>>,
}

impl ConnectionSynchronization for ObserveClose {
    fn before_closed(&self) -> anyhow::Result<()> {
        self.log
            .lock()
            .push(format!("before_closed:closed={}", self.connection.is_closed()));
        Ok(())
    }

    fn after_closed(&self) -> anyhow::Result<()> {
        self.log
            .lock()
            .push(format!("after_closed:closed={}", self.connection.is_closed()));
        Ok(())
    }
}

#[test]
fn nested_required_scopes_share_one_connection() {
    let ops = engine();
    ops.execute(&ConnectionDefinition::required(), |outer| {
        let id = outer.connection().id();
        for _ in 0..3 {
            let inner = ops.execute(&ConnectionDefinition::required(), |inner| {
                assert!(!inner.is_new());
                Ok(inner.connection().id())
            })?;
            assert_eq!(inner, id);
        }
        assert!(ops.backend().is_open(id));
        assert_eq!(outer.connection().settings().setups, 4);
        Ok(())
    })
    .unwrap();

    assert_eq!(ops.backend().opened_total(), 1);
    assert_eq!(ops.backend().closed_total(), 1);
    assert_eq!(ops.backend().open_count(), 0);
}

#[test]
fn requires_new_runs_on_a_separate_connection() {
    let ops = engine();
    ops.execute(&ConnectionDefinition::required(), |outer| {
        let outer_connection = outer.connection().clone();
        let inner_connection = ops.execute(&ConnectionDefinition::requires_new(), |inner| {
            assert!(inner.is_new());
            assert!(!outer_connection.is_closed());
            assert_eq!(ops.backend().open_count(), 2);
            Ok(inner.connection().clone())
        })?;

        assert_ne!(inner_connection, outer_connection);
        assert!(inner_connection.is_closed());
        assert!(!outer_connection.is_closed());

        let resumed = ops.find_connection_status().unwrap();
        assert_eq!(resumed.connection(), &outer_connection);
        Ok(())
    })
    .unwrap();

    assert_eq!(ops.backend().closed_total(), 2);
}

#[test]
fn mandatory_needs_an_enclosing_scope() {
    let ops = engine();
    let err = ops
        .execute(&ConnectionDefinition::mandatory(), |_| Ok(()))
        .unwrap_err();
    assert!(matches!(err, ConnectionError::NoConnection { .. }));
    assert_eq!(err.to_string(), NO_CONNECTION_MESSAGE);
    assert_eq!(ops.backend().opened_total(), 0);

    let id = ops
        .execute_write(|outer| {
            ops.execute(&ConnectionDefinition::mandatory(), |inner| {
                assert_eq!(inner.connection(), outer.connection());
                Ok(inner.connection().id())
            })
        })
        .unwrap();
    assert_eq!(id, 1);
}

#[test]
fn definition_attributes_reach_the_connection() {
    let ops = engine();
    let definition = ConnectionDefinition::READ_ONLY
        .with_name("reports")
        .with_isolation(Isolation::RepeatableRead)
        .with_timeout(Duration::from_millis(250));

    let settings = ops
        .execute(&definition, |status| {
            assert_eq!(status.connection().name(), Some("reports"));
            Ok(status.connection().settings())
        })
        .unwrap();

    assert!(settings.read_only);
    assert_eq!(settings.isolation, Isolation::RepeatableRead);
    assert_eq!(settings.timeout, Some(Duration::from_millis(250)));
}

#[test]
fn definition_from_config_drives_propagation() {
    let outer: ConnectionDefinition =
        serde_json::from_str(r#"{"name":"batch","propagation":"REQUIRED"}"#).unwrap();
    let inner: ConnectionDefinition =
        serde_json::from_str(r#"{"propagation":"requires-new","read_only":true}"#).unwrap();

    let ops = engine();
    let (a, b) = ops
        .execute(&outer, |outer| {
            let b = ops.execute(&inner, |inner| Ok(inner.connection().id()))?;
            Ok((outer.connection().id(), b))
        })
        .unwrap();
    assert_ne!(a, b);
}

#[test]
fn get_connection_and_complete_restore_context_for_every_propagation() {
    let ops = engine();
    let outer = ops.get_connection(&ConnectionDefinition::required()).unwrap();
    assert!(outer.is_new());

    for definition in [
        ConnectionDefinition::required(),
        ConnectionDefinition::mandatory(),
        ConnectionDefinition::requires_new(),
    ] {
        let inner = ops.get_connection(&definition).unwrap();
        assert!(Arc::ptr_eq(&ops.find_connection_status().unwrap(), &inner));
        ops.complete(&inner).unwrap();
        assert!(Arc::ptr_eq(&ops.find_connection_status().unwrap(), &outer));
    }

    assert!(!outer.connection().is_closed());
    ops.complete(&outer).unwrap();
    assert!(outer.connection().is_closed());
    assert!(PropagatedContext::current().is_empty());
    assert_eq!(ops.backend().opened_total(), 2);
    assert_eq!(ops.backend().open_count(), 0);

    let err = ops.complete(&outer).unwrap_err();
    assert!(err.is_already_completed());
}

#[test]
fn synchronizations_straddle_the_close() {
    let ops = engine();
    let log = Arc::new(Mutex::new(Vec::new()));
    ops.execute(&ConnectionDefinition::required(), |status| {
        status.register_synchronization(ObserveClose {
            connection: status.connection().clone(),
            log: log.clone(),
        });
        Ok(())
    })
    .unwrap();

    assert_eq!(
        *log.lock(),
        vec!["before_closed:closed=false", "after_closed:closed=true"]
    );
}

#[test]
fn borrowed_scope_never_closes() {
    let ops = engine();
    let log = Arc::new(Mutex::new(Vec::new()));
    ops.execute(&ConnectionDefinition::required(), |_| {
        ops.execute(&ConnectionDefinition::mandatory(), |inner| {
            inner.register_synchronization(ObserveClose {
                connection: inner.connection().clone(),
                log: log.clone(),
            });
            Ok(())
        })
    })
    .unwrap();

    assert_eq!(
        *log.lock(),
        vec!["before_closed:closed=false", "after_closed:closed=false"]
    );
}

#[test]
fn customizers_see_every_unit_of_work() {
    let ops = engine();
    let calls = Arc::new(AtomicUsize::new(0));
    ops.add_connection_customizer(TracingCustomizer::default());
    ops.add_connection_customizer(Counting {
        calls: calls.clone(),
    });

    ops.execute(&ConnectionDefinition::required(), |_| {
        ops.execute(&ConnectionDefinition::required(), |_| Ok(()))
    })
    .unwrap();

    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(ops.customizer_count(), 2);
}

#[test]
fn engines_with_separate_backends_stay_independent() {
    let primary = engine();
    let replica = ConnectionOperations::new("replica", MemoryBackend::new());

    primary
        .execute(&ConnectionDefinition::required(), |p| {
            replica.execute(&ConnectionDefinition::required(), |r| {
                assert!(r.is_new());
                assert_eq!(p.connection().id(), r.connection().id());
                assert_ne!(p.connection(), r.connection());
                Ok(())
            })
        })
        .unwrap();

    assert_eq!(primary.backend().closed_total(), 1);
    assert_eq!(replica.backend().closed_total(), 1);
}

#[test]
fn context_does_not_leak_between_threads() {
    let ops = Arc::new(engine());
    let status = ops.get_connection(&ConnectionDefinition::required()).unwrap();

    let other = Arc::clone(&ops);
    let seen = std::thread::spawn(move || other.find_connection_status().is_some())
        .join()
        .unwrap();
    assert!(!seen);

    ops.complete(&status).unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn wrapped_future_carries_the_connection_across_tasks() {
    let ops = Arc::new(engine());
    let status = ops.get_connection(&ConnectionDefinition::required()).unwrap();
    let expected = status.connection().id();

    let task_ops = Arc::clone(&ops);
    let handle = tokio::spawn(PropagatedContext::current().wrap(async move {
        tokio::task::yield_now().await;
        let before = task_ops.find_connection_status().map(|s| s.connection().id());
        tokio::time::sleep(Duration::from_millis(5)).await;
        let joined = task_ops.execute(&ConnectionDefinition::mandatory(), |inner| {
            assert!(!inner.is_new());
            Ok(inner.connection().id())
        });
        (before, joined.ok())
    }));
    let (before, joined) = handle.await.unwrap();

    assert_eq!(before, Some(expected));
    assert_eq!(joined, Some(expected));

    ops.complete(&status).unwrap();
    assert_eq!(ops.backend().closed_total(), 1);
}

#[tokio::test]
async fn unwrapped_task_sees_no_connection() {
    let ops = Arc::new(engine());
    let status = ops.get_connection(&ConnectionDefinition::required()).unwrap();

    let task_ops = Arc::clone(&ops);
    let found = tokio::task::spawn_blocking(move || task_ops.find_connection_status().is_some())
        .await
        .unwrap();
    assert!(!found);

    ops.complete(&status).unwrap();
}
