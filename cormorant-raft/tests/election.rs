mod fixtures;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use cormorant_raft::protocol::{AppendEntriesRequest, LogEntry, ProtocolMetadata, VoteRequest};
use cormorant_raft::{Config, GroupId, NodeId, VoteState};
use fixtures::{standalone_node, standalone_node_in, TestCluster};

/// Three-node election and partition recovery.
///
/// - three nodes elect a single leader.
/// - with the leader isolated, the remaining two elect a successor within
///   a few election timeouts and keep committing.
/// - the old leader rejoins, adopts the higher term, and becomes a follower
///   with the successor's commits intact.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn three_node_election_and_rejoin() -> Result<()> {
    fixtures::init_tracing();

    let config = Arc::new(Config::build().validate()?);
    let cluster = TestCluster::new(config, &[1, 2, 3]).await?;

    let first = cluster.wait_for_leader(Duration::from_secs(10)).await?;
    cluster.wait_for_commit(1, Duration::from_secs(10)).await?;

    // Exactly one leader among the live nodes.
    let leaders = cluster
        .latest_metrics()
        .into_iter()
        .filter(|m| m.state == VoteState::Leader)
        .count();
    assert_eq!(leaders, 1);
    let old_term = cluster.node(first.0).consensus.meta().term;

    cluster.router.isolate_node(first).await;
    let second = cluster.wait_for_leader(Duration::from_secs(10)).await?;
    assert_ne!(second, first);
    let new_term = cluster.node(second.0).consensus.meta().term;
    assert!(new_term > old_term);

    // The successor commits an entry the old leader has never seen.
    let commit_to = cluster
        .node(second.0)
        .consensus
        .replicate(vec![LogEntry::data(b"after-partition".to_vec())])
        .await?
        .last_offset;

    cluster.router.restore_node(first).await;

    // The rejoined node adopts the successor's term and demotes itself.
    let rejoined = cluster.node(first.0);
    rejoined
        .consensus
        .wait(Some(Duration::from_secs(10)))
        .metrics(
            |m| m.state == VoteState::Follower && m.current_term >= new_term,
            "rejoined node adopts higher term as follower",
        )
        .await?;

    // ... and catches up on the commits it missed.
    rejoined
        .consensus
        .wait(Some(Duration::from_secs(10)))
        .commit(commit_to, "rejoined node catches up")
        .await?;
    let entry = rejoined.log.entries().into_iter().find(|e| e.offset == commit_to).unwrap();
    assert_eq!(entry.payload, b"after-partition".to_vec());

    Ok(())
}

/// A vote request from a stale term is rejected with the current term.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn stale_vote_rejected() -> Result<()> {
    fixtures::init_tracing();

    let node = standalone_node(1, &[1, 2, 3], Vec::new()).await?;

    // Observe term 5 through a granted vote.
    let reply = node
        .consensus
        .vote(VoteRequest {
            group: GroupId(1),
            node_id: NodeId(2),
            term: 5,
            prev_log_offset: 0,
            prev_log_term: 0,
        })
        .await?;
    assert!(reply.granted);
    assert_eq!(reply.term, 5);

    // A candidate still at term 4 is turned away.
    let reply = node
        .consensus
        .vote(VoteRequest {
            group: GroupId(1),
            node_id: NodeId(3),
            term: 4,
            prev_log_offset: 0,
            prev_log_term: 0,
        })
        .await?;
    assert!(!reply.granted);
    assert_eq!(reply.term, 5);

    // And within term 5 the vote is not handed out twice.
    let reply = node
        .consensus
        .vote(VoteRequest {
            group: GroupId(1),
            node_id: NodeId(3),
            term: 5,
            prev_log_offset: 0,
            prev_log_term: 0,
        })
        .await?;
    assert!(!reply.granted);

    // The original candidate may re-request its grant.
    let reply = node
        .consensus
        .vote(VoteRequest {
            group: GroupId(1),
            node_id: NodeId(2),
            term: 5,
            prev_log_offset: 0,
            prev_log_term: 0,
        })
        .await?;
    assert!(reply.granted);

    Ok(())
}

/// A vote is withheld from a candidate whose log is behind ours.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn vote_withheld_from_stale_log() -> Result<()> {
    fixtures::init_tracing();

    let node = standalone_node(1, &[1, 2, 3], Vec::new()).await?;

    // Replicate two entries from a term-2 leader so the local log has a tail.
    let mut entries = vec![LogEntry::data(b"a".to_vec()), LogEntry::data(b"b".to_vec())];
    for (idx, entry) in entries.iter_mut().enumerate() {
        entry.term = 2;
        entry.offset = idx as u64 + 1;
    }
    let reply = node
        .consensus
        .append_entries(AppendEntriesRequest {
            node_id: NodeId(2),
            meta: ProtocolMetadata {
                group: GroupId(1),
                term: 2,
                prev_log_offset: 0,
                prev_log_term: 0,
                commit_offset: 0,
            },
            entries,
        })
        .await?;
    assert!(reply.success);
    assert_eq!(reply.last_log_offset, 2);

    // A shorter log at the same tail term must not win.
    let reply = node
        .consensus
        .vote(VoteRequest {
            group: GroupId(1),
            node_id: NodeId(2),
            term: 3,
            prev_log_offset: 1,
            prev_log_term: 2,
        })
        .await?;
    assert!(!reply.granted);
    assert!(!reply.log_ok);

    // An equal log wins.
    let reply = node
        .consensus
        .vote(VoteRequest {
            group: GroupId(1),
            node_id: NodeId(3),
            term: 4,
            prev_log_offset: 2,
            prev_log_term: 2,
        })
        .await?;
    assert!(reply.granted);
    assert!(reply.log_ok);

    Ok(())
}

/// Leader step-down on a higher term, with the cleared vote persisted.
///
/// A leader observing a higher term anywhere (here, in a vote request whose
/// candidate loses the log comparison) must fall back to follower, emit a
/// leadership loss, and adopt the term durably.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn leader_steps_down_on_higher_term() -> Result<()> {
    fixtures::init_tracing();

    let config = Arc::new(Config::build().validate()?);
    let cluster = TestCluster::new(config, &[1]).await?;
    let leader = cluster.wait_for_leader(Duration::from_secs(5)).await?;
    let node = cluster.node(leader.0);
    let term = node.consensus.meta().term;

    let statuses: Arc<std::sync::Mutex<Vec<(GroupId, u64, Option<NodeId>)>>> = Default::default();
    let statuses_cb = statuses.clone();
    node.manager.register_leadership_notification(move |group, term, leader| {
        statuses_cb.lock().unwrap().push((group, term, leader));
    });

    // An empty-logged candidate at a much higher term: the vote is withheld
    // (log comparison fails) but the term must still be adopted. The
    // leadership loss is emitted before the reply leaves, so the assertions
    // below cannot race the re-election that follows.
    let reply = node
        .consensus
        .vote(VoteRequest {
            group: cluster.group,
            node_id: NodeId(99),
            term: term + 5,
            prev_log_offset: 0,
            prev_log_term: 0,
        })
        .await?;
    assert!(!reply.granted);
    assert_eq!(reply.term, term + 5);
    assert!(statuses.lock().unwrap().contains(&(cluster.group, term + 5, None)));
    assert!(node.consensus.meta().term >= term + 5);

    Ok(())
}

/// Across a stop/start cycle, `current_term` and `voted_for` are preserved:
/// the restarted node refuses to hand its vote to another candidate in the
/// same term.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn voted_for_survives_restart() -> Result<()> {
    fixtures::init_tracing();

    let node = standalone_node(1, &[1, 2, 3], Vec::new()).await?;
    let reply = node
        .consensus
        .vote(VoteRequest {
            group: GroupId(1),
            node_id: NodeId(2),
            term: 9,
            prev_log_offset: 0,
            prev_log_term: 0,
        })
        .await?;
    assert!(reply.granted);

    node.consensus.stop().await;
    let dir = node.dir;
    let node = standalone_node_in(1, &[1, 2, 3], Vec::new(), dir).await?;

    assert_eq!(node.consensus.meta().term, 9);
    let reply = node
        .consensus
        .vote(VoteRequest {
            group: GroupId(1),
            node_id: NodeId(3),
            term: 9,
            prev_log_offset: 0,
            prev_log_term: 0,
        })
        .await?;
    assert!(!reply.granted, "the term-9 vote belongs to node 2");

    Ok(())
}
