//! Property tests: resolution determinism and convergence.

use docsync_replication::{ConflictHandler, DefaultConflictHandler};
use docsync_testkit::prelude::*;
use proptest::prelude::*;

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap()
}

proptest! {
    #![proptest_config(PropTestConfig::default().to_proptest_config())]

    #[test]
    fn resolution_is_deterministic(a in doc_state_strategy(), b in doc_state_strategy()) {
        let handler = DefaultConflictHandler;
        let first = handler.resolve(&a, &b, "peer-1").unwrap().unwrap();
        let second = handler.resolve(&a, &b, "peer-2").unwrap().unwrap();
        prop_assert_eq!(&first, &second);

        // Peers that see the states the other way round pick the same content.
        let swapped = handler.resolve(&b, &a, "peer-3").unwrap().unwrap();
        prop_assert!(first.same_content(&swapped));
        prop_assert!(first == a || first == b);
    }
}

proptest! {
    #![proptest_config(PropTestConfig::async_cases().to_proptest_config())]

    #[test]
    fn replicas_converge(
        before in write_sequence_strategy(0, 8),
        during in write_sequence_strategy(1, 12),
    ) {
        let converged = runtime().block_on(async {
            let harness = ReplicationHarness::new();
            for op in &before {
                op.apply(&harness).await;
            }
            let state = harness.start(test_config("prop").with_push_batch_size(3));
            state.await_first_in_sync().await.unwrap();
            for op in &during {
                op.apply(&harness).await;
                tokio::task::yield_now().await;
            }
            let converged = eventually(Duration::from_secs(5), || harness.converged()).await;
            state.await_idle().await.unwrap();
            let still = eventually(Duration::from_secs(5), || harness.converged()).await;
            assert!(state.last_error().is_none(), "{:?}", state.last_error());
            state.cancel().await;
            converged && still
        });
        prop_assert!(converged);
    }
}
