mod support;

use std::sync::Arc;

use proptest::prelude::*;
use spark_stream_engine::{Engine, EngineConfig, IdentityFilter};
use spark_stream_engine::platform::tokio_platform::{TokioDeferredRunner, TokioTimer};
use support::{MockLowerLayer, OpenMode, RecordingUser};
use tokio::sync::oneshot;

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .build()
        .unwrap()
}

fn open_engine(rt: &tokio::runtime::Runtime) -> (Engine, Arc<MockLowerLayer>, Arc<RecordingUser>) {
    let ll = MockLowerLayer::new(OpenMode::Immediate);
    let user = Arc::new(RecordingUser::new());
    let engine = Engine::new(
        Box::new(Arc::clone(&ll)),
        Box::new(IdentityFilter),
        Arc::clone(&user) as Arc<dyn spark_stream_engine::UserCallbacks>,
        Arc::new(TokioDeferredRunner::new()),
        Arc::new(TokioTimer::new()),
        EngineConfig::default(),
    );
    rt.block_on(async {
        let (tx, rx) = oneshot::channel();
        engine
            .open(Box::new(move |r| {
                let _ = tx.send(r);
            }))
            .unwrap();
        rx.await.unwrap().unwrap();
    });
    (engine, ll, user)
}

proptest! {
    /// Toggling read-enable to the same value repeatedly must never change
    /// the lower layer's effective callback-enable state beyond the first
    /// toggle: reconciliation is idempotent.
    #[test]
    fn set_read_enable_reconciliation_is_idempotent(values in proptest::collection::vec(any::<bool>(), 1..20)) {
        let rt = runtime();
        let (engine, ll, _user) = open_engine(&rt);
        for v in &values {
            engine.set_read_enable(*v).unwrap();
            prop_assert_eq!(ll.read_enabled(), *v);
        }
    }

    /// An `IdentityFilter` pipeline delivers exactly the bytes it was
    /// handed, in order, regardless of how the input is chunked.
    #[test]
    fn identity_pipeline_preserves_byte_count(chunks in proptest::collection::vec(
        proptest::collection::vec(any::<u8>(), 0..16), 0..8
    )) {
        let rt = runtime();
        let (engine, ll, user) = open_engine(&rt);
        engine.set_read_enable(true).unwrap();
        let mut expected = Vec::new();
        for chunk in &chunks {
            let consumed = ll.deliver(chunk);
            prop_assert_eq!(consumed, chunk.len());
            expected.extend_from_slice(chunk);
        }
        prop_assert_eq!(user.received(), expected);
    }
}

#[test]
fn open_then_close_returns_to_closed_and_accepts_a_fresh_open() {
    let rt = runtime();
    let (engine, ll, user) = open_engine(&rt);
    rt.block_on(async {
        let (tx, rx) = oneshot::channel();
        engine
            .close(Box::new(move || {
                let _ = tx.send(());
            }))
            .unwrap();
        rx.await.unwrap();
    });
    assert!(ll.is_closed());

    // A handle that already went through one full open/close cycle may be
    // reopened: CLOSED is the only state `open()` accepts from, and the
    // prior close sequence must have landed there.
    rt.block_on(async {
        let (tx, rx) = oneshot::channel();
        engine
            .open(Box::new(move |r| {
                let _ = tx.send(r);
            }))
            .unwrap();
        rx.await.unwrap().unwrap();
    });
    let _ = user.received();
}
