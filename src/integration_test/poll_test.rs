#[cfg(feature = "integration_tests")]
mod poll_test {
    use crate::content::ContentStore;
    use crate::integration_test::test_net::{build_node, poll_test_config, Router, TestNode};
    use crate::manager::{CallPoll, ListPolls, PollManager};
    use crate::peer_id::PollId;
    use crate::poller::PollStatus;

    use actix::{Actor, Addr};

    use std::time::Duration;

    const AU: &str = "au-integration";

    async fn build_network(count: usize) -> (Addr<Router>, Vec<TestNode>) {
        let router = Router::new().start();
        let mut nodes = vec![];
        for _ in 0..count {
            let state = tempfile::tempdir().unwrap();
            let config = poll_test_config(state.path());
            std::mem::forget(state);
            nodes.push(build_node(&router, AU, config).await);
        }
        // Everyone knows everyone.
        for node in nodes.iter() {
            for other in nodes.iter() {
                if node.id != other.id {
                    node.registry.admit(&other.id).unwrap();
                }
            }
        }
        (router, nodes)
    }

    async fn await_finished(manager: &Addr<PollManager>, key: PollId) -> PollStatus {
        for _ in 0..400 {
            let directory = manager.send(ListPolls).await.unwrap();
            if let Some((_, status)) = directory.finished.iter().find(|(k, _)| *k == key) {
                return *status;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        panic!("poll {} did not finish", key);
    }

    fn seed(node: &TestNode, x_content: &[u8]) {
        node.store.insert("/a", b"alpha");
        node.store.insert("/b", b"beta");
        node.store.insert("/x", x_content);
    }

    #[actix_rt::test]
    async fn test_poll_with_agreeing_majority_is_won() {
        let (_router, nodes) = build_network(6).await;
        // The poller and four voters agree on everything; one voter holds a
        // stale copy of /x.
        seed(&nodes[0], b"mainline");
        for node in nodes[1..5].iter() {
            seed(node, b"mainline");
        }
        seed(&nodes[5], b"stale");

        let key = nodes[0].manager.send(CallPoll { au_id: AU.into() }).await.unwrap().unwrap();
        let status = await_finished(&nodes[0].manager, key).await;
        assert_eq!(status, PollStatus::Complete);

        // A won URL is never repaired.
        let versions = nodes[0].store.versions(&"/x".to_string()).unwrap();
        assert_eq!(versions, vec![b"mainline".to_vec()]);
    }

    #[actix_rt::test]
    async fn test_losing_poll_repairs_from_a_peer() {
        let (_router, nodes) = build_network(6).await;
        // The poller and two voters hold a stale /x; three voters hold the
        // mainline copy and outvote them.
        seed(&nodes[0], b"stale");
        seed(&nodes[1], b"stale");
        seed(&nodes[2], b"stale");
        for node in nodes[3..].iter() {
            seed(node, b"mainline");
        }

        let key = nodes[0].manager.send(CallPoll { au_id: AU.into() }).await.unwrap().unwrap();
        let status = await_finished(&nodes[0].manager, key).await;
        assert_eq!(status, PollStatus::Complete);

        // The majority copy arrived from a disagreeing peer and is now the
        // newest preserved version; the stale copy is retained as history.
        let versions = nodes[0].store.versions(&"/x".to_string()).unwrap();
        assert_eq!(versions.len(), 2);
        assert_eq!(versions[0], b"mainline".to_vec());
        assert_eq!(versions[1], b"stale".to_vec());

        // Undisputed URLs are untouched.
        let versions = nodes[0].store.versions(&"/a".to_string()).unwrap();
        assert_eq!(versions, vec![b"alpha".to_vec()]);
    }
}
