// Partition Integration Tests
//
// End-to-end scenario: groups of row ids, each group held as a pair of two
// identical id lists, are repeatedly re-partitioned by `id % 4`. Exercises
// three levels of nested arrays, in-place mutation through aliases, maps,
// and the shared/child context fan-out.

mod common;

use direx_mem::{HashMap, MemoryContext, Result, SharedContext, Slice};
use std::collections::BTreeSet;
use std::sync::Mutex;
use std::thread;

/// Groups of id pairs: `groups[g][table]` is one id list.
type Groups<'a> = Slice<'a, Slice<'a, Slice<'a, i32>>>;

const INPUT: [&[i32]; 4] = [
    &[0, 1, 2, 3, 4, 5, 6, 7, 8, 9, 10],
    &[11, 12, 13, 14, 15, 16, 17, 18, 19, 20],
    &[100, 200],
    &[55, 66, 77, 88, 99],
];

const PASSES: usize = 3;

fn seed<'a, C: MemoryContext<'a> + ?Sized>(ctx: &C) -> Result<Groups<'a>> {
    let mut groups = Groups::default();
    for ids in INPUT {
        let pair = Slice::with_length(ctx, 2)?;
        pair.set(0, Slice::from_slice(ctx, ids)?);
        pair.set(1, Slice::from_slice(ctx, ids)?);
        groups.append(pair, ctx)?;
    }
    Ok(groups)
}

fn free_groups<'a, C: MemoryContext<'a> + ?Sized>(groups: Groups<'a>, ctx: &C) {
    groups.iterate(|pair| {
        pair.iterate(|ids| ids.free(ctx));
        pair.free(ctx);
    });
    groups.free(ctx);
}

/// Splits one pair by `id % 4`, allocating the surviving pairs from `keep`
/// and bookkeeping from `scratch`.
fn split_pair<'a, K, S>(pair: Slice<'a, Slice<'a, i32>>, keep: &K, scratch: &S) -> Result<Groups<'a>>
where
    K: MemoryContext<'a> + ?Sized,
    S: MemoryContext<'a> + ?Sized,
{
    let mut index_of = HashMap::<i32, usize>::new(0, scratch)?;
    let mut split = Groups::default();

    for (table, ids) in pair.iter().enumerate() {
        for id in ids.iter() {
            let remainder = id % 4;
            let index = match index_of.get(&remainder) {
                Some(index) => index,
                None => {
                    let index = split.len();
                    split.append(Slice::with_length(keep, 2)?, scratch)?;
                    index_of.put(remainder, index, scratch)?;
                    index
                }
            };
            let out = split.get(index);
            let mut ids = out.get(table);
            ids.append(id, keep)?;
            out.set(table, ids);
        }
    }

    index_of.free(scratch);
    Ok(split)
}

/// One sequential pass; consumes `groups`.
fn partition<'a, C: MemoryContext<'a> + ?Sized>(groups: Groups<'a>, ctx: &C) -> Result<Groups<'a>> {
    let mut result = Groups::default();
    for pair in groups.iter() {
        let split = split_pair(pair, ctx, ctx)?;
        result.append_batch(split, ctx)?;
        split.free(ctx);
    }
    free_groups(groups, ctx);
    Ok(result)
}

/// One parallel pass: a worker per pair, scratch data in child contexts,
/// results merged under a lock.
fn partition_parallel<'a>(groups: Groups<'a>, shared: &'a SharedContext<'a>) -> Result<Groups<'a>> {
    let result = Mutex::new(Groups::default());

    thread::scope(|s| {
        let workers: Vec<_> = groups
            .iter()
            .map(|pair| {
                let result = &result;
                s.spawn(move || -> Result<()> {
                    let scratch = shared.local();
                    let split = split_pair(pair, shared, &scratch)?;
                    result.lock().unwrap().append_batch(split, shared)?;
                    split.free(&scratch);
                    scratch.destroy();
                    Ok(())
                })
            })
            .collect();

        workers.into_iter().try_for_each(|worker| worker.join().unwrap())
    })?;

    free_groups(groups, shared);
    Ok(result.into_inner().unwrap())
}

/// Expected groups after any number of passes, as sorted id lists.
fn expected() -> BTreeSet<Vec<i32>> {
    let mut groups = BTreeSet::new();
    for ids in INPUT {
        for remainder in 0..4 {
            let group: Vec<i32> = ids.iter().copied().filter(|id| id % 4 == remainder).collect();
            if !group.is_empty() {
                groups.insert(group);
            }
        }
    }
    groups
}

fn assert_partitioned(groups: Groups<'_>) {
    let mut found = BTreeSet::new();
    groups.iterate(|pair| {
        assert_eq!(pair.len(), 2);
        let (mut left, mut right) = (pair.get(0).to_vec(), pair.get(1).to_vec());
        left.sort_unstable();
        right.sort_unstable();
        assert_eq!(left, right, "pair halves diverged");
        assert!(left.iter().all(|id| id % 4 == left[0] % 4));
        assert!(found.insert(left), "group produced twice");
    });
    assert_eq!(found, expected());
}

/// Test the partition scenario on a single exclusive context
#[test]
fn test_partition_sequential() {
    let arena = common::arena(1);
    let ctx = arena.local_context();

    let mut groups = seed(&ctx).unwrap();
    assert_eq!(groups.len(), 4);
    for _ in 0..PASSES {
        groups = partition(groups, &ctx).unwrap();
        assert_eq!(groups.len(), 13);
        assert_partitioned(groups);
    }

    free_groups(groups, &ctx);
    assert_eq!(ctx.reserved(), 0);
    assert_eq!(ctx.live(), 0);
}

/// Test the partition scenario with a worker per group
#[test]
fn test_partition_parallel() {
    let arena = common::arena(4);
    let shared = arena.shared_context();

    let mut groups = seed(&shared).unwrap();
    for _ in 0..PASSES {
        groups = partition_parallel(groups, &shared).unwrap();
        assert_eq!(groups.len(), 13);
        assert_partitioned(groups);
        assert_eq!(shared.lent(), 0);
    }

    free_groups(groups, &shared);
    assert_eq!(shared.reserved(), 0);
    assert_eq!(shared.children(), 0);
}

/// Test that a pass failing for lack of memory reports it instead of panicking
#[test]
fn test_partition_out_of_memory() {
    let arena = direx_mem::Arena::new(direx_mem::config::KB).unwrap();
    let ctx = arena.local_context();

    let outcome = seed(&ctx).and_then(|groups| partition(groups, &ctx));
    assert!(matches!(outcome, Err(direx_mem::Error::OutOfMemory { .. })));
}
