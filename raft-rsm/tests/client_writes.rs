mod fixtures;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use kvstore::SetResponse;
use pretty_assertions::assert_eq;
use raft_rsm::Config;
use raft_rsm::Response;

use fixtures::set_command;
use fixtures::Router;

/// Cluster client_writes test (the happy path).
///
/// - brings 3 replicas online and elects a leader;
/// - executes one `Set` against the leader;
/// - asserts the entry is committed, applied and identical on all replicas;
/// - asserts that re-sending the same request id (to the leader or to a
///   follower) answers from the dedup cache without growing the log;
/// - asserts that a follower redirects fresh commands to the leader.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn client_writes() -> Result<()> {
    fixtures::init_tracing();

    let config = Arc::new(Config::build("test".into()).validate()?);
    let router = Router::new(config);
    let members = router.new_cluster(3).await;

    let leader = router.wait_for_leader(Duration::from_secs(10), "initial election").await?;
    let leader_term = router.replica(leader).await.metrics().borrow().current_term;

    let cmd = set_command("cli-1", 1, "x", "1");
    let expected_response = serde_json::to_vec(&SetResponse)?;

    let res = router.replica(leader).await.execute(cmd.clone()).await?;
    assert_eq!(
        res,
        Response::Ack {
            response: expected_response.clone()
        }
    );

    router.wait_for_applied(&members, 1, Some(Duration::from_secs(5)), "all applied the Set").await?;

    for id in members.iter() {
        let entries = router.log_of(*id).await.entries();
        assert_eq!(entries.len(), 1, "node {} log length", id);
        assert_eq!(entries[0].term, leader_term, "node {} entry term", id);
        assert_eq!(entries[0].command, cmd, "node {} entry command", id);

        let m = router.replica(*id).await.metrics().borrow().clone();
        assert_eq!(m.commit_index, 1, "node {} commit index", id);
        assert_eq!(m.last_applied, 1, "node {} last applied", id);
    }

    // A repeat of the same request id answers from the dedup cache on any
    // replica, leader or not, and does not re-append.
    let repeat_on_leader = router.replica(leader).await.execute(cmd.clone()).await?;
    assert_eq!(
        repeat_on_leader,
        Response::Ack {
            response: expected_response.clone()
        }
    );

    let follower = *members.iter().find(|id| **id != leader).unwrap();
    let repeat_on_follower = router.replica(follower).await.execute(cmd.clone()).await?;
    assert_eq!(
        repeat_on_follower,
        Response::Ack {
            response: expected_response
        }
    );
    assert_eq!(router.log_of(leader).await.len(), 1, "duplicates do not grow the log");

    // A fresh command hitting a follower is redirected to the leader.
    let fresh = set_command("cli-1", 2, "y", "2");
    let redirected = router.replica(follower).await.execute(fresh).await?;
    assert_eq!(redirected, Response::RedirectToLeader { leader });

    // The full client path agrees on the stored value.
    let client = router.kv_client();
    assert_eq!(client.get("x".into()).await?, "1");

    router.assert_at_most_one_leader_per_term().await;
    router.assert_log_matching().await;
    router.assert_committed_prefix_agreement().await;

    Ok(())
}
