//! End-to-end cluster behavior over the in-process transport: election,
//! replication, fail-over, leadership transfer and log compaction.

mod common;

use common::Cluster;

use multiraft::{NodeRole, RaftError};

#[tokio::test]
async fn three_nodes_elect_a_leader_and_apply_in_order() {
    let cluster = Cluster::new(&[1, 2, 3]);
    cluster.create_group(1, &[1, 2, 3]);

    let leader = cluster.wait_for_leader(1).await;
    for cmd in [b"a".as_slice(), b"b", b"c", b"d", b"e"] {
        cluster.submit_to(leader, 1, cmd).await;
    }

    for node in [1, 2, 3] {
        cluster.wait_applied(node, 1, 5).await;
    }

    let expected = cluster.sm(leader, 1).commands();
    assert_eq!(expected.len(), 5);
    assert_eq!(expected[0], (1, b"a".to_vec()));
    assert_eq!(expected[4], (5, b"e".to_vec()));
    for node in [1, 2, 3] {
        let sm = cluster.sm(node, 1);
        assert_eq!(sm.commands(), expected, "node {node} diverged");
        assert!(sm.violations().is_empty(), "node {node}: {:?}", sm.violations());
    }

    cluster.stop();
}

#[tokio::test]
async fn isolated_leader_is_replaced_and_catches_up_after_healing() {
    let cluster = Cluster::new(&[1, 2, 3]);
    cluster.create_group(1, &[1, 2, 3]);

    let old_leader = cluster.wait_for_leader(1).await;
    cluster.submit_to(old_leader, 1, b"before").await;
    for node in [1, 2, 3] {
        cluster.wait_applied(node, 1, 1).await;
    }
    let (_, old_term) = cluster.group(old_leader, 1).leader_term();

    cluster.isolate(old_leader);
    let new_leader = cluster.wait_for_leader_other_than(1, old_leader).await;
    assert_ne!(new_leader, old_leader);
    let (_, new_term) = cluster.group(new_leader, 1).leader_term();
    assert!(new_term > old_term, "fail-over must move to a higher term");

    cluster.submit_to(new_leader, 1, b"during").await;
    for node in [1, 2, 3] {
        if node != old_leader {
            cluster.wait_applied(node, 1, 2).await;
        }
    }

    // The deposed leader rejoins as a follower and converges without
    // re-applying or skipping anything.
    cluster.heal(old_leader);
    cluster.wait_applied(old_leader, 1, 2).await;
    let sm = cluster.sm(old_leader, 1);
    assert_eq!(
        sm.commands(),
        vec![(1, b"before".to_vec()), (2, b"during".to_vec())]
    );
    assert!(sm.violations().is_empty(), "{:?}", sm.violations());

    cluster.stop();
}

#[tokio::test]
async fn follower_rejects_submit_and_names_the_leader() {
    let cluster = Cluster::new(&[1, 2, 3]);
    cluster.create_group(1, &[1, 2, 3]);

    let leader = cluster.wait_for_leader(1).await;
    let follower = [1, 2, 3].into_iter().find(|n| *n != leader).unwrap();

    // Wait until the follower has heard from the leader at all.
    let group = cluster.group(follower, 1);
    common::wait_until("follower to learn the leader", || {
        group.leader_term().0 == Some(leader)
    })
    .await;

    match group.submit(b"nope".to_vec()) {
        Err(RaftError::NotLeader { leader: hint }) => assert_eq!(hint, Some(leader)),
        other => panic!("expected NotLeader, got {other:?}"),
    }

    cluster.stop();
}

#[tokio::test]
async fn leadership_transfer_moves_the_leader_to_the_target() {
    let cluster = Cluster::new(&[1, 2, 3]);
    cluster.create_group(1, &[1, 2, 3]);

    let leader = cluster.wait_for_leader(1).await;
    cluster.submit_to(leader, 1, b"x").await;
    let target = [1, 2, 3].into_iter().find(|n| *n != leader).unwrap();
    cluster.wait_applied(target, 1, 1).await;

    cluster.group(target, 1).try_to_leader().unwrap();
    let target_group = cluster.group(target, 1);
    common::wait_until("leadership to reach the target", || {
        target_group.is_leader()
    })
    .await;

    // The new leader is fully functional.
    cluster.submit_to(target, 1, b"y").await;
    for node in [1, 2, 3] {
        cluster.wait_applied(node, 1, 2).await;
    }

    cluster.stop();
}

#[tokio::test]
async fn truncate_compacts_the_prefix_and_is_bounded_by_applied() {
    let cluster = Cluster::new(&[1]);
    cluster.create_group(1, &[1]);

    let leader = cluster.wait_for_leader(1).await;
    let group = cluster.group(leader, 1);
    for i in 0..5u8 {
        cluster.submit_to(leader, 1, &[i]).await;
    }
    cluster.wait_applied(leader, 1, 5).await;

    assert!(matches!(
        group.truncate(0),
        Err(RaftError::InvalidArgument(_))
    ));
    assert!(matches!(
        group.truncate(6),
        Err(RaftError::InvalidArgument(_))
    ));

    group.truncate(3).unwrap();
    let status = group.status();
    assert_eq!(status.first_index, 4);
    assert_eq!(status.applied_index, 5);

    // The group keeps accepting commands after compaction.
    cluster.submit_to(leader, 1, b"later").await;
    cluster.wait_applied(leader, 1, 6).await;

    cluster.stop();
}

#[tokio::test]
async fn status_reflects_roles_replication_progress_and_membership() {
    let cluster = Cluster::new(&[1, 2, 3]);
    cluster.create_group(1, &[1, 2, 3]);

    let leader = cluster.wait_for_leader(1).await;
    cluster.submit_to(leader, 1, b"a").await;
    cluster.submit_to(leader, 1, b"b").await;
    for node in [1, 2, 3] {
        cluster.wait_applied(node, 1, 2).await;
    }

    let leader_group = cluster.group(leader, 1);
    common::wait_until("leader to see both followers caught up", || {
        let status = leader_group.status();
        status.replicas.len() == 2 && status.replicas.iter().all(|r| r.match_index == 2)
    })
    .await;

    let status = leader_group.status();
    assert_eq!(status.role, NodeRole::Leader);
    assert_eq!(status.leader, Some(leader));
    assert_eq!(status.commit_index, 2);
    assert_eq!(status.applied_index, 2);
    assert_eq!(status.peers.len(), 3);
    assert!(status.down_peers.is_empty());
    assert!(status.pending_peers.is_empty());

    let follower = [1, 2, 3].into_iter().find(|n| *n != leader).unwrap();
    let status = cluster.group(follower, 1).status();
    assert_eq!(status.role, NodeRole::Follower);
    assert!(status.replicas.is_empty());

    let server_status = cluster.nodes[&leader].server.get_status();
    assert_eq!(server_status.node_id, leader);
    assert_eq!(server_status.groups.len(), 1);
    assert_eq!(server_status.snapshot_slots_in_use, 0);

    cluster.stop();
}

#[tokio::test]
async fn independent_groups_on_the_same_servers_do_not_interfere() {
    let cluster = Cluster::new(&[1, 2, 3]);
    cluster.create_group(1, &[1, 2, 3]);
    cluster.create_group(2, &[1, 2, 3]);

    let leader1 = cluster.wait_for_leader(1).await;
    let leader2 = cluster.wait_for_leader(2).await;

    cluster.submit_to(leader1, 1, b"g1").await;
    cluster.submit_to(leader2, 2, b"g2").await;

    for node in [1, 2, 3] {
        cluster.wait_applied(node, 1, 1).await;
        cluster.wait_applied(node, 2, 1).await;
        assert_eq!(cluster.sm(node, 1).commands(), vec![(1, b"g1".to_vec())]);
        assert_eq!(cluster.sm(node, 2).commands(), vec![(1, b"g2".to_vec())]);
    }

    cluster.stop();
}
