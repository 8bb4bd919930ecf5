use manifold_core::{ByteKey, KeyRange, LockPolicy, NodeConfig, ReactorConfig, SyncConfig};
use manifold_node::{LocalCluster, NodeRuntime, ReactorStatus};
use manifold_state::get_at;
use manifold_txn::{TransactionView, TxnStatus};
use std::cell::Cell;
use std::io::Write;
use std::rc::Rc;
use std::time::{Duration, Instant};

fn key(s: &str) -> ByteKey {
    ByteKey::from_str_key(s).unwrap()
}

fn fast_config(threads: usize) -> NodeConfig {
    NodeConfig {
        name: "test-node".to_string(),
        reactor: ReactorConfig {
            threads,
            idle_poll_ms: 5,
            ..ReactorConfig::default()
        },
        sync: SyncConfig {
            gossip_interval_ms: 20,
            ..SyncConfig::default()
        },
        ..NodeConfig::default()
    }
}

fn wait_for<F>(runtime: &NodeRuntime, mut done: F) -> Vec<ReactorStatus>
where
    F: FnMut(&[ReactorStatus]) -> bool,
{
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        let status = runtime.status();
        if done(&status) || Instant::now() > deadline {
            return status;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
}

#[test]
fn test_runtime_replicates_client_writes() {
    let runtime = NodeRuntime::start(fast_config(2)).unwrap();
    let nodes = runtime.nodes().to_vec();
    assert_eq!(nodes.len(), 2);

    assert!(runtime.put(nodes[0], key("a"), b"1".to_vec()).unwrap());
    assert!(runtime.put(nodes[1], key("b"), b"2".to_vec()).unwrap());

    let status = wait_for(&runtime, |s| s.len() == 2 && s.iter().all(|n| n.keys == 2));
    assert_eq!(status.len(), 2);
    for node in &status {
        assert_eq!(node.keys, 2, "{} did not converge", node.node);
        assert!(node.running);
    }

    runtime.shutdown().unwrap();
}

#[test]
fn test_runtime_shutdown_without_traffic() {
    let runtime = NodeRuntime::start(fast_config(1)).unwrap();
    let status = wait_for(&runtime, |s| s.len() == 1);
    assert_eq!(status.len(), 1);
    assert_eq!(status[0].keys, 0);
    runtime.shutdown().unwrap();
}

#[test]
fn test_cluster_merge_and_snapshot_isolation() {
    let cluster = LocalCluster::new(2, &fast_config(2)).unwrap();
    let a = cluster.node(0).unwrap();
    let b = cluster.node(1).unwrap();

    let mut reader = b.engine().begin();
    reader.try_lock_range(KeyRange::point(key("x"))).unwrap();

    let mut writer = a.engine().begin();
    writer.try_lock_range(KeyRange::point(key("x"))).unwrap();
    writer.write(key("x"), b"from-a".to_vec()).unwrap();
    assert!(writer.commit().unwrap());

    cluster.gossip_round();
    assert!(cluster.converged());
    assert_eq!(get_at(b.store(), &key("x"), b.latest_stamp()), Some(b"from-a".to_vec()));

    // the reader's snapshot predates the merge, and the merge invalidates it
    assert_eq!(reader.get(&key("x")).unwrap(), None);
    assert!(!reader.commit().unwrap());
    assert_eq!(reader.status(), TxnStatus::Conflicted);
}

#[test]
fn test_no_wait_policy_from_config_file() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    write!(
        file,
        r#"{{ "name": "cfg", "transaction": {{ "lock_policy": "no_wait" }}, "reactor": {{ "threads": 1 }} }}"#
    )
    .unwrap();
    let config = NodeConfig::load(file.path()).unwrap();
    assert_eq!(config.transaction.lock_policy, LockPolicy::NoWait);

    let cluster = LocalCluster::new(1, &config).unwrap();
    let engine = cluster.node(0).unwrap().engine();
    assert_eq!(engine.policy(), LockPolicy::NoWait);

    let mut holder = engine.begin();
    holder.try_lock_range(KeyRange::point(key("k"))).unwrap();
    let other = engine.begin();
    let failed = Rc::new(Cell::new(false));
    let f = failed.clone();
    other.lock_range(KeyRange::point(key("k")), move |_, locked, _| {
        f.set(locked.is_err());
    });
    assert!(failed.get());
    holder.close();
    assert_eq!(engine.held_lock_count(), 0);
}
