//! Integration tests for a table running as an in-process cluster.
//!
//! Every test drives all nodes at once through `LocalCluster::run`, the way
//! an application would: each node thread issues its own calls, meets the
//! others at `sync`, and finishes with `destroy`.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicUsize, Ordering};

use anyhow::{Result, ensure};
use distributed_hash_table::telemetry::init_tracing;
use distributed_hash_table::{DhtConfig, DhtError, KEY_NOT_FOUND, LocalCluster, Node};

/// Finishes a node and returns what it drained.
fn destroy_to_string(node: Node) -> Result<String> {
    let mut out = Vec::new();
    node.destroy(&mut out)?;
    Ok(String::from_utf8(out)?)
}

/// Picks `count` keys owned by `owner`.
fn keys_owned_by(node: &Node, owner: usize, count: usize) -> Result<Vec<String>> {
    let mut keys = Vec::with_capacity(count);
    for i in 0.. {
        if keys.len() == count {
            break;
        }
        let key = format!("key-{i}");
        if node.owner_of(&key)? == owner {
            keys.push(key);
        }
    }
    Ok(keys)
}

#[test]
fn two_nodes_share_one_table() -> Result<()> {
    init_tracing();
    let cluster = LocalCluster::new(2, DhtConfig::default())?;

    let results = cluster.run(|node| {
        if node.rank() == 0 {
            node.put("alice", 42)?;
            node.put("bob", 7)?;
        } else {
            node.put("carol", 9)?;
        }
        node.sync()?;

        let alice = node.get("alice")?;
        let carol = node.get("carol")?;
        let dave = node.get("dave")?;
        let size = node.size()?;
        node.destroy(&mut std::io::sink())?;
        Ok((alice, carol, dave, size))
    })?;

    for (alice, carol, dave, size) in results {
        assert_eq!(alice, 42);
        assert_eq!(carol, 9);
        assert_eq!(dave, KEY_NOT_FOUND);
        assert_eq!(size, 3);
    }
    Ok(())
}

#[test]
fn writes_from_every_node_are_visible_everywhere() -> Result<()> {
    init_tracing();
    let nodes = 4;
    let per_node = 25;
    let cluster = LocalCluster::new(nodes, DhtConfig::default())?;

    let results = cluster.run(|node| {
        let rank = node.rank();
        for i in 0..per_node {
            node.put(&format!("n{rank}-k{i}"), (rank * 1000 + i) as i64)?;
        }
        node.sync()?;

        for writer in 0..nodes {
            for i in 0..per_node {
                let value = node.get(&format!("n{writer}-k{i}"))?;
                ensure!(
                    value == (writer * 1000 + i) as i64,
                    "node {rank} read {value} for n{writer}-k{i}"
                );
            }
        }
        let size = node.size()?;
        node.destroy(&mut std::io::sink())?;
        Ok(size)
    })?;

    assert_eq!(results, vec![(nodes * per_node) as u64; nodes]);
    Ok(())
}

#[test]
fn overwrite_replaces_value_without_growing() -> Result<()> {
    init_tracing();
    let cluster = LocalCluster::new(3, DhtConfig::default())?;

    let results = cluster.run(|node| {
        if node.rank() == 2 {
            node.put("counter", 1)?;
            node.put("counter", 2)?;
            node.put("counter", 3)?;
        }
        node.sync()?;
        let value = node.get("counter")?;
        let size = node.size()?;
        node.destroy(&mut std::io::sink())?;
        Ok((value, size))
    })?;

    assert_eq!(results, vec![(3, 1); 3]);
    Ok(())
}

#[test]
fn own_writes_are_visible_before_sync() -> Result<()> {
    init_tracing();
    let cluster = LocalCluster::new(3, DhtConfig::default())?;

    cluster.run(|node| {
        let key = format!("mine-{}", node.rank());
        ensure!(node.get(&key)? == KEY_NOT_FOUND);
        node.put(&key, node.rank() as i64)?;
        ensure!(node.get(&key)? == node.rank() as i64);
        node.sync()?;
        node.destroy(&mut std::io::sink())?;
        Ok(())
    })?;
    Ok(())
}

#[test]
fn destroy_drains_each_owner_in_key_order() -> Result<()> {
    init_tracing();
    let nodes = 3;
    let keys = ["delta", "alpha", "echo", "charlie", "bravo", "foxtrot", "golf"];
    let cluster = LocalCluster::new(nodes, DhtConfig::default())?;

    let drained = cluster.run(|node| {
        if node.rank() == 0 {
            for (i, key) in keys.iter().enumerate() {
                node.put(key, i as i64)?;
            }
        }
        node.sync()?;

        let mut owned = Vec::new();
        for key in keys {
            if node.owner_of(key)? == node.rank() {
                owned.push(key);
            }
        }
        let output = destroy_to_string(node)?;
        Ok((owned, output))
    })?;

    let mut seen = BTreeSet::new();
    for (mut owned, output) in drained {
        owned.sort_unstable();
        let expected: String = owned
            .iter()
            .map(|key| {
                let value = keys.iter().position(|k| k == key).unwrap_or_default();
                format!("  Key=\"{key}\" Value={value}\n")
            })
            .collect();
        assert_eq!(output, expected);
        for key in owned {
            assert!(seen.insert(key), "{key} drained twice");
        }
    }
    assert_eq!(seen.len(), keys.len());
    Ok(())
}

#[test]
fn full_owner_drops_writes_and_counts_them() -> Result<()> {
    init_tracing();
    let cluster = LocalCluster::new(2, DhtConfig { capacity: 2 })?;

    let results = cluster.run(|node| {
        if node.rank() == 0 {
            for (i, key) in keys_owned_by(&node, 1, 5)?.iter().enumerate() {
                node.put(key, i as i64)?;
            }
        }
        node.sync()?;
        let size = node.size()?;
        let dropped = node.stats().dropped_puts();
        let drained = node.destroy(&mut std::io::sink())?;
        Ok((size, dropped, drained))
    })?;

    assert_eq!(results, vec![(2, 0, 0), (2, 3, 2)]);
    Ok(())
}

#[test]
fn nobody_leaves_sync_before_everyone_arrives() -> Result<()> {
    init_tracing();
    let nodes = 5;
    let arrived = AtomicUsize::new(0);
    let cluster = LocalCluster::new(nodes, DhtConfig::default())?;

    let observed = cluster.run(|node| {
        arrived.fetch_add(1, Ordering::SeqCst);
        node.sync()?;
        let seen = arrived.load(Ordering::SeqCst);
        node.destroy(&mut std::io::sink())?;
        Ok(seen)
    })?;

    assert_eq!(observed, vec![nodes; nodes]);
    Ok(())
}

#[test]
fn sync_is_once_per_node() -> Result<()> {
    init_tracing();
    let cluster = LocalCluster::new(2, DhtConfig::default())?;

    cluster.run(|node| {
        node.sync()?;
        match node.sync() {
            Err(DhtError::AlreadySynced(rank)) => ensure!(rank == node.rank()),
            other => anyhow::bail!("second sync returned {other:?}"),
        }
        node.destroy(&mut std::io::sink())?;
        Ok(())
    })?;
    Ok(())
}

#[test]
fn concurrent_size_calls_all_complete() -> Result<()> {
    init_tracing();
    let nodes = 4;
    let cluster = LocalCluster::new(nodes, DhtConfig::default())?;

    let sizes = cluster.run(|node| {
        node.put(&format!("node-{}", node.rank()), 1)?;
        node.sync()?;
        let mut sizes = Vec::new();
        for _ in 0..10 {
            sizes.push(node.size()?);
        }
        node.destroy(&mut std::io::sink())?;
        Ok(sizes)
    })?;

    for per_node in sizes {
        assert_eq!(per_node, vec![nodes as u64; 10]);
    }
    Ok(())
}

#[test]
fn invalid_keys_never_leave_the_caller() -> Result<()> {
    init_tracing();
    let cluster = LocalCluster::new(2, DhtConfig::default())?;

    cluster.run(|node| {
        let long = "k".repeat(64);
        ensure!(matches!(
            node.put(&long, 1),
            Err(DhtError::KeyTooLong { len: 64, .. })
        ));
        ensure!(matches!(node.get("nul\0key"), Err(DhtError::KeyContainsNul)));
        node.sync()?;
        ensure!(node.size()? == 0);
        node.destroy(&mut std::io::sink())?;
        Ok(())
    })?;
    Ok(())
}

#[test]
fn servers_count_handled_messages() -> Result<()> {
    init_tracing();
    let cluster = LocalCluster::new(2, DhtConfig::default())?;

    let handled = cluster.run(|node| {
        for i in 0..10 {
            node.put(&format!("m{i}"), i)?;
        }
        node.sync()?;
        let handled = node.stats().messages_handled();
        node.destroy(&mut std::io::sink())?;
        Ok(handled)
    })?;

    // Each put is one request plus one confirmation somewhere in the cluster.
    assert_eq!(handled.iter().sum::<u64>(), 2 * 2 * 10);
    Ok(())
}

#[test]
fn racing_writes_to_one_key_leave_one_pair() -> Result<()> {
    init_tracing();
    let nodes = 5;
    let writes = 200;
    let cluster = LocalCluster::new(nodes, DhtConfig::default())?;

    let results = cluster.run(|node| {
        let rank = node.rank() as i64;
        for i in 0..writes {
            node.put("shared", rank * 1000 + i)?;
            node.put(&format!("own-{rank}-{i}"), i)?;
        }
        node.sync()?;
        let value = node.get("shared")?;
        let size = node.size()?;
        let drained = destroy_to_string(node)?;
        Ok((value, size, drained))
    })?;

    let (winner, _, _) = results[0];
    // Puts from one node arrive in order, so the survivor is some node's
    // last write.
    assert_eq!(winner % 1000, writes - 1);
    assert!((0..nodes as i64).contains(&(winner / 1000)));

    let mut holders = 0;
    for (value, size, drained) in &results {
        assert_eq!(*value, winner);
        assert_eq!(*size, (nodes as u64) * (writes as u64) + 1);
        let lines = drained.matches("Key=\"shared\"").count();
        if lines > 0 {
            assert_eq!(lines, 1);
            assert!(drained.contains(&format!("  Key=\"shared\" Value={winner}\n")));
            holders += 1;
        }
    }
    assert_eq!(holders, 1);
    Ok(())
}
