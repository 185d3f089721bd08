//! # cluster scenarios
//!
//! why: check raft's safety and liveness guarantees on whole clusters
//! relations: uses tests/support (deterministic in-memory harness) over maelstrom-core
//! what: election, majority commit, minority partition, divergent logs, leader crash,
//!       chaos runs over partitions and over a lossy, duplicating, reordering network

mod support;

use std::collections::BTreeMap;

use maelstrom_core::{
    Command, CommandOutput, HardState, InMemoryStorage, LogEntry, LogIndex, NodeId, NodeState,
    Storage, Term,
};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use support::{raft_config, Cluster, Faults};

fn put_entry(term: Term, index: LogIndex) -> LogEntry {
    let command = Command::put(format!("key{index}"), format!("t{term}"));
    LogEntry::new(term, index, command.encode().unwrap())
}

fn others(cluster: &Cluster, id: NodeId) -> Vec<NodeId> {
    cluster.ids().into_iter().filter(|other| *other != id).collect()
}

// =============================================================================
// SECTION 1: ELECTION
// =============================================================================

mod election {
    use super::*;

    #[test]
    fn three_node_cluster_elects_exactly_one_leader() {
        let mut cluster = Cluster::new(3, 11);

        let leader = cluster.wait_for_leader(1_000);

        assert_eq!(cluster.leaders(), vec![leader]);
        assert_eq!(cluster.node(leader).current_term(), 1, "won in the first election");
        for id in others(&cluster, leader) {
            let node = cluster.node(id);
            assert_eq!(node.state(), NodeState::Follower);
            assert_eq!(node.current_term(), 1);
            assert_eq!(node.leader_id(), Some(leader));
        }
    }

    #[test]
    fn heartbeats_keep_the_leader_in_place() {
        let mut cluster = Cluster::new(3, 12);
        let leader = cluster.wait_for_leader(1_000);

        cluster.run_for(3_000);

        assert_eq!(cluster.leader(), Some(leader));
        assert_eq!(cluster.node(leader).current_term(), 1);
    }

    #[test]
    fn leader_noop_commits_everywhere() {
        let mut cluster = Cluster::new(3, 13);
        cluster.wait_for_leader(1_000);

        cluster.run_for(100);

        for id in cluster.ids() {
            assert_eq!(cluster.node(id).commit_index(), 1);
            assert_eq!(cluster.output(id, 1), Some(&CommandOutput::Noop));
        }
    }

    #[test]
    fn isolated_leader_is_replaced() {
        let mut cluster = Cluster::new(3, 14);
        let old = cluster.wait_for_leader(1_000);
        let rest = others(&cluster, old);

        cluster.partition(&[&[old][..], &rest[..]]);
        let replaced = cluster.run_until(2_000, |c| rest.iter().any(|id| c.node(*id).is_leader()));

        assert!(replaced);
        let new = rest.iter().copied().find(|id| cluster.node(*id).is_leader()).unwrap();
        assert!(cluster.node(new).current_term() > cluster.node(old).current_term());

        cluster.heal();
        cluster.run_for(200);
        assert_eq!(cluster.node(old).state(), NodeState::Follower);
        assert_eq!(cluster.node(old).leader_id(), Some(new));
    }

    #[test]
    fn elected_leaders_are_unique_per_term() {
        let mut cluster = Cluster::new(5, 15);
        for round in 0..5u64 {
            let leader = cluster.wait_for_leader(2_000);
            cluster.crash(leader);
            cluster.run_for(400);
            cluster.restart(leader);
            cluster.run_for(100 + round * 10);
        }
        // the harness asserts uniqueness on every step; here we only check it ran
        assert!(cluster.elected_leaders().len() >= 5);
    }
}

// =============================================================================
// SECTION 2: REPLICATION AND COMMIT
// =============================================================================

mod replication {
    use super::*;

    #[test]
    fn leader_commits_with_two_of_four_followers_cut_off() {
        let mut cluster = Cluster::new(5, 3);
        let leader = cluster.wait_for_leader(1_000);
        for i in 0..3 {
            cluster.propose(leader, &Command::put(format!("k{i}"), "v")).unwrap();
        }
        let followers = others(&cluster, leader);
        let (cut, kept) = followers.split_at(2);
        for follower in cut {
            cluster.block_both(leader, *follower);
        }

        let index = cluster.propose(leader, &Command::put("x", "X")).unwrap();

        assert_eq!(index, 5);
        assert!(cluster.node(leader).commit_index() >= 5);
        assert_eq!(cluster.output(leader, 5), Some(&CommandOutput::Written));
        assert_eq!(cluster.store(leader).get("x"), Some("X"));
        for follower in kept {
            assert_eq!(cluster.node(*follower).log().last_index(), 5);
        }
        for follower in cut {
            assert_eq!(cluster.node(*follower).log().last_index(), 4);
        }
    }

    #[test]
    fn every_node_applies_the_same_commands() {
        let mut cluster = Cluster::new(3, 4);
        let leader = cluster.wait_for_leader(1_000);

        cluster.propose(leader, &Command::put("a", "1")).unwrap();
        cluster.propose(leader, &Command::put("b", "2")).unwrap();
        cluster.propose(leader, &Command::delete("a")).unwrap();
        let get = cluster.propose(leader, &Command::get("b")).unwrap();
        cluster.run_for(100);

        assert_eq!(
            cluster.output(leader, get),
            Some(&CommandOutput::Value(Some("2".to_string())))
        );
        let expected = cluster.store(leader).snapshot();
        for id in cluster.ids() {
            assert_eq!(cluster.store(id).snapshot(), expected);
            assert_eq!(cluster.store(id).get("a"), None);
        }
    }

    #[test]
    fn slow_follower_catches_up_after_reconnecting() {
        let mut cluster = Cluster::new(3, 5);
        let leader = cluster.wait_for_leader(1_000);
        let lagging = others(&cluster, leader)[0];
        cluster.block_both(leader, lagging);
        for i in 0..100 {
            cluster.propose(leader, &Command::put(format!("k{i}"), i.to_string())).unwrap();
        }

        cluster.heal();
        let caught_up = cluster.run_until(3_000, |c| {
            c.leader().is_some_and(|l| {
                c.node(lagging).commit_index() == c.node(l).commit_index()
                    && c.node(l).commit_index() >= 101
            })
        });

        assert!(caught_up);
        assert_eq!(cluster.store(lagging).get("k99"), Some("99"));
    }

    #[test]
    fn minority_side_never_commits() {
        let mut cluster = Cluster::new(5, 6);
        let old = cluster.wait_for_leader(1_000);
        cluster.propose(old, &Command::put("before", "1")).unwrap();
        let peers = others(&cluster, old);
        let buddy = peers[0];
        let majority: Vec<NodeId> = peers[1..].to_vec();
        cluster.partition(&[&[old, buddy][..], &majority[..]]);

        let stranded = cluster.propose(old, &Command::put("lost", "1")).unwrap();
        let stranded_term = cluster.node(old).log().term_at(stranded).unwrap();
        assert!(cluster.node(old).commit_index() < stranded);

        let elected = cluster.run_until(3_000, |c| majority.iter().any(|id| c.node(*id).is_leader()));
        assert!(elected);
        let new = majority.iter().copied().find(|id| cluster.node(*id).is_leader()).unwrap();
        assert!(cluster.node(old).commit_index() < stranded);
        assert_eq!(cluster.output(old, stranded), None);

        let kept = cluster.propose(new, &Command::put("kept", "2")).unwrap();
        assert!(cluster.node(new).commit_index() >= kept);

        cluster.heal();
        let converged = cluster.run_until(3_000, |c| {
            c.node(old).state() == NodeState::Follower && c.node(old).commit_index() >= kept
        });

        assert!(converged);
        assert_ne!(cluster.node(old).log().term_at(stranded), Some(stranded_term));
        assert_eq!(cluster.store(old).get("lost"), None);
        assert_eq!(cluster.store(old).get("kept"), Some("2"));
        assert_eq!(cluster.store(buddy).get("lost"), None);
    }

    #[test]
    fn divergent_follower_suffix_is_replaced() {
        let mut leader_log: Vec<LogEntry> = (1..=9).map(|i| put_entry(1, i)).collect();
        leader_log.push(put_entry(3, 10));
        let mut follower_log: Vec<LogEntry> = (1..=9).map(|i| put_entry(1, i)).collect();
        follower_log.extend((10..=12).map(|i| put_entry(2, i)));

        let storages: BTreeMap<NodeId, InMemoryStorage> = [
            (1, InMemoryStorage::with_state(HardState { term: 3, voted_for: None }, leader_log.clone())),
            (2, InMemoryStorage::with_state(HardState { term: 2, voted_for: None }, follower_log)),
            (3, InMemoryStorage::with_state(HardState { term: 3, voted_for: None }, leader_log)),
        ]
        .into_iter()
        .collect();
        let mut cluster = Cluster::with_storages(storages, raft_config(9));

        cluster.campaign(1);
        assert!(cluster.node(1).is_leader());
        assert_eq!(cluster.node(1).current_term(), 4);

        // one heartbeat interval: the append rejected at election time is retried
        cluster.run_for(cluster.node(1).config().heartbeat_interval);

        let follower = cluster.node(2).log();
        assert_eq!(follower.last_index(), 11);
        assert_eq!(follower.term_at(10), Some(3));
        assert_eq!(follower.term_at(11), Some(4));
        assert!(follower.entry_at(12).is_none());
        assert_eq!(cluster.storage(2).load_log().unwrap().len(), 11);
        assert_eq!(cluster.node(2).log().entries(1, 11), cluster.node(1).log().entries(1, 11));
    }

    #[test]
    fn crashed_leader_commit_survives_on_new_leader() {
        let mut cluster = Cluster::new(5, 21);
        let old = cluster.wait_for_leader(1_000);
        let peers = others(&cluster, old);
        let (acks, silent) = peers.split_at(2);
        for node in silent {
            cluster.block(old, *node);
        }

        let n = cluster.propose(old, &Command::put("durable", "yes")).unwrap();
        assert!(cluster.node(old).commit_index() >= n);
        assert_eq!(cluster.output(old, n), Some(&CommandOutput::Written));
        for node in acks {
            assert!(cluster.node(*node).log().last_index() >= n);
            assert!(cluster.node(*node).commit_index() < n, "followers not told yet");
        }

        cluster.crash(old);
        cluster.heal();
        let recommitted = cluster.run_until(5_000, |c| {
            c.leader().is_some_and(|l| l != old && c.node(l).commit_index() >= n)
        });

        assert!(recommitted);
        let new = cluster.leader().unwrap();
        assert!(acks.contains(&new), "only a node holding index {n} can win");
        let applied_everywhere = cluster.run_until(2_000, |c| {
            others(c, old).iter().all(|id| c.store(*id).get("durable") == Some("yes"))
        });
        assert!(applied_everywhere);
    }

    #[test]
    fn restarted_node_rebuilds_its_state_machine() {
        let mut cluster = Cluster::new(3, 22);
        let leader = cluster.wait_for_leader(1_000);
        cluster.propose(leader, &Command::put("a", "1")).unwrap();
        cluster.propose(leader, &Command::put("b", "2")).unwrap();
        cluster.run_for(100);
        let follower = others(&cluster, leader)[0];

        cluster.crash(follower);
        cluster.restart(follower);
        assert!(cluster.store(follower).is_empty());
        assert_eq!(cluster.node(follower).log().last_index(), 3);

        cluster.run_for(200);
        assert_eq!(cluster.store(follower).get("a"), Some("1"));
        assert_eq!(cluster.store(follower).get("b"), Some("2"));
    }
}

// =============================================================================
// SECTION 3: CHAOS
// =============================================================================

mod chaos {
    use super::*;

    /// Random partitions and writes; the harness checks every safety
    /// property after every single step.
    fn run_chaos(seed: u64) {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut cluster = Cluster::new(5, seed);
        let ids = cluster.ids();
        let mut written = 0u64;

        for _ in 0..20 {
            let mut shuffled = ids.clone();
            for i in (1..shuffled.len()).rev() {
                shuffled.swap(i, rng.gen_range(0..=i));
            }
            let split = rng.gen_range(1..shuffled.len());
            let (left, right) = shuffled.split_at(split);
            cluster.partition(&[left, right]);

            for _ in 0..rng.gen_range(1..4) {
                if let Some(leader) = cluster.leader() {
                    written += 1;
                    cluster
                        .propose(leader, &Command::put(format!("k{}", written % 7), written.to_string()))
                        .unwrap();
                }
                cluster.run_for(rng.gen_range(10..120));
            }
            cluster.run_for(rng.gen_range(100..400));
        }

        cluster.heal();
        settle(&mut cluster, seed);
    }

    /// Wait for every node to apply the leader's whole log, then compare
    /// the state machines.
    fn settle(cluster: &mut Cluster, seed: u64) {
        let settled = cluster.run_until(10_000, |c| {
            let Some(leader) = c.leader() else {
                return false;
            };
            let commit = c.node(leader).commit_index();
            commit == c.node(leader).log().last_index()
                && c.ids().iter().all(|id| {
                    c.node(*id).commit_index() == commit && c.node(*id).last_applied() == commit
                })
        });
        assert!(settled, "cluster did not settle for seed {seed}");

        let ids = cluster.ids();
        let reference = cluster.store(ids[0]).snapshot();
        for id in &ids {
            assert_eq!(cluster.store(*id).snapshot(), reference, "node {id} diverged (seed {seed})");
        }
    }

    /// Writes and crash/restart cycles while one message in ten is lost,
    /// one in ten arrives twice, and everything arrives late and out of order.
    fn run_lossy(seed: u64) {
        let mut rng = StdRng::seed_from_u64(seed.wrapping_mul(31));
        let mut cluster = Cluster::new(5, seed);
        cluster.set_faults(Faults { drop_rate: 0.1, duplicate_rate: 0.1, max_delay_ms: 200 });
        let ids = cluster.ids();
        let mut crashed: Option<NodeId> = None;
        let mut written = 0u64;

        for round in 0..80 {
            if let Some(leader) = cluster.leader() {
                written += 1;
                cluster
                    .propose(leader, &Command::put(format!("k{}", written % 5), written.to_string()))
                    .unwrap();
            }
            cluster.run_for(rng.gen_range(10..150));

            if round % 10 == 9 {
                match crashed.take() {
                    Some(id) => cluster.restart(id),
                    None => {
                        let id = ids[rng.gen_range(0..ids.len())];
                        cluster.crash(id);
                        crashed = Some(id);
                    }
                }
            }
        }
        if let Some(id) = crashed {
            cluster.restart(id);
        }

        cluster.clear_faults();
        settle(&mut cluster, seed);
        assert!(written > 0, "no leader was ever available (seed {seed})");
        assert!(cluster.highest_committed() >= 1);
    }

    #[test]
    fn partitions_never_break_safety() {
        for seed in [1, 2, 3, 4, 5] {
            run_chaos(seed);
        }
    }

    #[test]
    fn lost_duplicated_and_reordered_messages_never_break_safety() {
        for seed in [7, 8, 9, 10] {
            run_lossy(seed);
        }
    }

    #[test]
    fn duplicated_traffic_alone_still_commits_everything() {
        let mut cluster = Cluster::new(3, 31);
        cluster.set_faults(Faults { drop_rate: 0.0, duplicate_rate: 1.0, max_delay_ms: 30 });
        let leader = cluster.wait_for_leader(3_000);

        let mut last = 0;
        for i in 0..10 {
            last = cluster.propose(leader, &Command::put(format!("k{i}"), i.to_string())).unwrap();
        }
        let applied = cluster.run_until(3_000, |c| c.ids().iter().all(|id| c.node(*id).last_applied() >= last));

        assert!(applied);
        for id in cluster.ids() {
            assert_eq!(cluster.store(id).get("k9"), Some("9"));
            assert_eq!(cluster.node(id).log().last_index(), last, "duplicates never grow the log");
        }
    }
}
