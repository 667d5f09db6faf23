//! Integration tests for typed resource allocation.
//!
//! Covers:
//! 1. Multi-node bin-packing splits and denials
//! 2. All-or-nothing commits under every strategy
//! 3. Bounds and conservation over arbitrary allocate/release sequences

use std::collections::BTreeMap;
use std::sync::Arc;

use orbit_coordinator::resources::TOLERANCE;
use orbit_coordinator::{
    AllocationStrategy, AllocatorError, NodeResources, ResourceAllocator, ResourceKind,
    ResourceMap,
};
use orbit_id::NodeId;
use proptest::prelude::*;
use rstest::rstest;

use ResourceKind::{Cpu, Gpu, Memory};

fn id(name: &str) -> NodeId {
    NodeId::parse(name).unwrap()
}

fn map(entries: &[(ResourceKind, f64)]) -> ResourceMap {
    entries.iter().copied().collect()
}

async fn fleet(strategy: AllocationStrategy, nodes: &[(&str, ResourceMap)]) -> ResourceAllocator {
    let allocator = ResourceAllocator::new(strategy);
    for (name, total) in nodes {
        allocator.register_node(id(name), total.clone()).await.unwrap();
    }
    allocator
}

async fn snapshot(allocator: &ResourceAllocator) -> BTreeMap<NodeId, NodeResources> {
    let mut nodes = BTreeMap::new();
    for node_id in allocator.node_ids().await {
        let node = allocator.node_snapshot(&node_id).await.unwrap();
        nodes.insert(node_id, node);
    }
    nodes
}

fn allocated(nodes: &BTreeMap<NodeId, NodeResources>) -> BTreeMap<NodeId, ResourceMap> {
    nodes
        .iter()
        .map(|(id, node)| (id.clone(), node.allocated.clone()))
        .collect()
}

fn assert_close(actual: f64, expected: f64) {
    assert!(
        (actual - expected).abs() <= TOLERANCE,
        "expected {expected}, got {actual}"
    );
}

#[tokio::test]
async fn test_bin_packing_splits_across_nodes() {
    let allocator = fleet(
        AllocationStrategy::BinPacking,
        &[
            ("node-x", map(&[(Cpu, 10.0), (Memory, 20.0)])),
            ("node-y", map(&[(Cpu, 5.0), (Memory, 5.0)])),
        ],
    )
    .await;

    let request = map(&[(Cpu, 12.0), (Memory, 18.0)]);
    let grant = allocator.allocate(&request).await.unwrap();

    assert_eq!(grant.node_ids(), vec![&id("node-x"), &id("node-y")]);
    assert_eq!(grant.parts[0].resources, map(&[(Cpu, 10.0), (Memory, 18.0)]));
    assert_eq!(grant.parts[1].resources, map(&[(Cpu, 2.0)]));
    assert_eq!(grant.total(), request);

    let x = allocator.node_snapshot(&id("node-x")).await.unwrap();
    let y = allocator.node_snapshot(&id("node-y")).await.unwrap();
    assert_eq!(x.allocated, map(&[(Cpu, 10.0), (Memory, 18.0)]));
    assert_eq!(y.allocated, map(&[(Cpu, 2.0), (Memory, 0.0)]));
}

#[tokio::test]
async fn test_denial_names_remainder_and_changes_nothing() {
    let allocator = fleet(
        AllocationStrategy::BinPacking,
        &[("solo", map(&[(Cpu, 10.0)]))],
    )
    .await;

    let err = allocator
        .allocate(&map(&[(Cpu, 20.0)]))
        .await
        .unwrap_err();
    assert_eq!(
        err,
        AllocatorError::InsufficientResources {
            remaining: map(&[(Cpu, 10.0)])
        }
    );
    assert_eq!(err.to_string(), "insufficient resources: cpu:10 remaining");

    let node = allocator.node_snapshot(&id("solo")).await.unwrap();
    assert_eq!(node.allocated[&Cpu], 0.0);
}

#[tokio::test]
async fn test_bin_packing_prefers_least_loaded_fitting_node() {
    let allocator = fleet(
        AllocationStrategy::BinPacking,
        &[
            ("a", map(&[(Cpu, 8.0)])),
            ("b", map(&[(Cpu, 8.0)])),
            ("c", map(&[(Cpu, 2.0)])),
        ],
    )
    .await;

    let first = allocator.allocate(&map(&[(Cpu, 4.0)])).await.unwrap();
    assert_eq!(first.node_ids(), vec![&id("a")]);

    // "a" is now half full, so the idle "b" ranks first.
    let second = allocator.allocate(&map(&[(Cpu, 2.0)])).await.unwrap();
    assert_eq!(second.node_ids(), vec![&id("b")]);
}

#[tokio::test]
async fn test_bin_packing_is_deterministic() {
    let nodes = [
        ("n1", map(&[(Cpu, 4.0), (Memory, 4.0)])),
        ("n2", map(&[(Cpu, 4.0), (Memory, 4.0)])),
        ("n3", map(&[(Cpu, 4.0), (Memory, 4.0)])),
    ];
    let request = map(&[(Cpu, 9.0), (Memory, 2.0)]);

    let first = fleet(AllocationStrategy::BinPacking, &nodes).await;
    let second = fleet(AllocationStrategy::BinPacking, &nodes).await;

    let a = first.allocate(&request).await.unwrap();
    let b = second.allocate(&request).await.unwrap();
    assert_eq!(a.parts, b.parts);
    assert_eq!(allocated(&snapshot(&first).await), allocated(&snapshot(&second).await));
}

#[tokio::test]
async fn test_spread_balances_free_capacity() {
    let allocator = fleet(
        AllocationStrategy::Spread,
        &[
            ("a", map(&[(Cpu, 30.0)])),
            ("b", map(&[(Cpu, 10.0)])),
        ],
    )
    .await;

    let grant = allocator.allocate(&map(&[(Cpu, 8.0)])).await.unwrap();
    assert_eq!(grant.parts.len(), 2);

    let a = allocator.utilization(&id("a")).await.unwrap();
    let b = allocator.utilization(&id("b")).await.unwrap();
    assert_close(a[&Cpu], 0.2);
    assert_close(b[&Cpu], 0.2);
}

#[rstest]
#[case::bin_packing(AllocationStrategy::BinPacking)]
#[case::spread(AllocationStrategy::Spread)]
#[case::random(AllocationStrategy::Random)]
#[tokio::test]
async fn test_failed_allocation_is_atomic(#[case] strategy: AllocationStrategy) {
    let allocator = fleet(
        strategy,
        &[
            ("a", map(&[(Cpu, 4.0), (Memory, 16.0)])),
            ("b", map(&[(Cpu, 4.0), (Memory, 16.0), (Gpu, 1.0)])),
        ],
    )
    .await;
    allocator
        .allocate(&map(&[(Cpu, 1.0), (Memory, 2.0)]))
        .await
        .unwrap();
    let before = snapshot(&allocator).await;

    // CPU and memory would fit, GPU cannot.
    let err = allocator
        .allocate(&map(&[(Cpu, 2.0), (Memory, 4.0), (Gpu, 3.0)]))
        .await
        .unwrap_err();
    assert!(matches!(err, AllocatorError::InsufficientResources { .. }));

    assert_eq!(allocated(&snapshot(&allocator).await), allocated(&before));
}

#[rstest]
#[case::bin_packing(AllocationStrategy::BinPacking)]
#[case::spread(AllocationStrategy::Spread)]
#[case::random(AllocationStrategy::Random)]
#[tokio::test]
async fn test_grant_covers_request_exactly(#[case] strategy: AllocationStrategy) {
    let allocator = fleet(
        strategy,
        &[
            ("a", map(&[(Cpu, 6.0), (Memory, 8.0)])),
            ("b", map(&[(Cpu, 3.0), (Memory, 8.0)])),
            ("c", map(&[(Cpu, 3.0)])),
        ],
    )
    .await;

    let request = map(&[(Cpu, 11.0), (Memory, 10.0)]);
    let grant = allocator.allocate(&request).await.unwrap();
    assert_eq!(grant.strategy, strategy);

    let total = grant.total();
    for (kind, amount) in &request {
        assert_close(total[kind], *amount);
    }
    for (_, node) in snapshot(&allocator).await {
        for (kind, total) in &node.total {
            assert!(node.allocated[kind] <= *total);
        }
    }
}

#[tokio::test]
async fn test_release_grant_restores_counters() {
    let allocator = fleet(
        AllocationStrategy::BinPacking,
        &[
            ("a", map(&[(Cpu, 4.0)])),
            ("b", map(&[(Cpu, 4.0)])),
        ],
    )
    .await;
    let before = allocated(&snapshot(&allocator).await);

    let grant = allocator.allocate(&map(&[(Cpu, 6.0)])).await.unwrap();
    allocator.release_grant(&grant).await;

    assert_eq!(allocated(&snapshot(&allocator).await), before);
}

#[tokio::test]
async fn test_concurrent_allocations_never_overcommit() {
    let allocator = Arc::new(
        fleet(
            AllocationStrategy::BinPacking,
            &[
                ("a", map(&[(Cpu, 10.0)])),
                ("b", map(&[(Cpu, 10.0)])),
            ],
        )
        .await,
    );

    let mut handles = Vec::new();
    for _ in 0..8 {
        let allocator = allocator.clone();
        handles.push(tokio::spawn(async move {
            allocator.allocate(&map(&[(Cpu, 3.0)])).await.is_ok()
        }));
    }

    let mut approved = 0;
    for handle in handles {
        if handle.await.unwrap() {
            approved += 1;
        }
    }

    // 20 CPUs hold six grants of 3 with 2 left over.
    assert_eq!(approved, 6);
    let util = allocator.cluster_utilization().await;
    assert_close(util[&Cpu], 0.9);
}

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap()
}

prop_compose! {
    fn arb_strategy()(idx in 0..3usize) -> AllocationStrategy {
        AllocationStrategy::ALL[idx]
    }
}

prop_compose! {
    fn arb_fleet()(
        totals in prop::collection::vec((0.0f64..32.0, 0.0f64..64.0), 1..5)
    ) -> Vec<ResourceMap> {
        totals
            .into_iter()
            .map(|(cpu, memory)| map(&[(Cpu, cpu), (Memory, memory)]))
            .collect()
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn prop_allocated_stays_within_total(
        strategy in arb_strategy(),
        totals in arb_fleet(),
        ops in prop::collection::vec((0.1f64..24.0, 0.1f64..48.0, any::<bool>()), 1..24),
    ) {
        runtime().block_on(async {
            let allocator = ResourceAllocator::new(strategy);
            for (index, total) in totals.into_iter().enumerate() {
                allocator.register_node(id(&format!("n{index}")), total).await.unwrap();
            }

            let mut outstanding = Vec::new();
            for (cpu, memory, release) in ops {
                let before = snapshot(&allocator).await;
                match allocator.allocate(&map(&[(Cpu, cpu), (Memory, memory)])).await {
                    Ok(grant) => outstanding.push(grant),
                    Err(_) => {
                        prop_assert_eq!(allocated(&snapshot(&allocator).await), allocated(&before));
                    }
                }
                if release && !outstanding.is_empty() {
                    let grant = outstanding.remove(0);
                    allocator.release_grant(&grant).await;
                }

                for (_, node) in snapshot(&allocator).await {
                    for (kind, total) in &node.total {
                        let used = node.allocated[kind];
                        prop_assert!(used >= 0.0);
                        prop_assert!(used <= *total, "{} allocated above total", kind);
                    }
                }
            }
            Ok::<(), TestCaseError>(())
        })?;
    }

    #[test]
    fn prop_allocate_then_release_conserves(
        strategy in arb_strategy(),
        totals in arb_fleet(),
        cpu in 0.1f64..16.0,
        memory in 0.1f64..32.0,
    ) {
        runtime().block_on(async {
            let allocator = ResourceAllocator::new(strategy);
            for (index, total) in totals.into_iter().enumerate() {
                allocator.register_node(id(&format!("n{index}")), total).await.unwrap();
            }
            let before = snapshot(&allocator).await;

            if let Ok(grant) = allocator.allocate(&map(&[(Cpu, cpu), (Memory, memory)])).await {
                allocator.release_grant(&grant).await;
            }

            for (node_id, node) in snapshot(&allocator).await {
                for (kind, used) in &node.allocated {
                    let prior = before[&node_id].allocated[kind];
                    prop_assert!((used - prior).abs() < 1e-9);
                }
            }
            Ok::<(), TestCaseError>(())
        })?;
    }
}
