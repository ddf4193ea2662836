// Concurrency Integration Tests
//
// Many workers creating and freeing strings through one shared factory and
// context, and per-worker child contexts merging into shared structures.

mod common;

use direx_mem::{HashMap, MemoryContext, RcString, Slice, StringFactory};
use std::sync::Mutex;
use std::thread;

const WORKERS: usize = 8;
const STRINGS_PER_WORKER: usize = 1000;
const RUNS: usize = 20;

/// Test that concurrent factory use never leaks or corrupts a counter
#[test]
fn test_factory_returns_to_baseline() {
    let arena = common::arena(16);
    let ctx = arena.shared_context();
    let baseline = ctx.reserved();

    for run in 0..RUNS {
        let factory = StringFactory::new();

        thread::scope(|s| {
            for worker in 0..WORKERS {
                let (factory, ctx) = (&factory, &ctx);
                s.spawn(move || {
                    let mut created = Vec::with_capacity(STRINGS_PER_WORKER);
                    for i in 0..STRINGS_PER_WORKER {
                        let text = format!("{run}-{worker}-{i}");
                        let string = factory.create_from_str(&text, ctx).unwrap();
                        assert!(string.ref_count() >= 1);
                        assert_eq!(string, text.as_str());
                        created.push(string);
                    }
                    for (i, string) in created.into_iter().enumerate() {
                        assert_eq!(string.to_string(), format!("{run}-{worker}-{i}"));
                        assert!(string.ref_count() >= 1);
                        string.free(ctx);
                    }
                });
            }
        });

        factory.destroy(&ctx);
        assert_eq!(ctx.reserved(), baseline, "run {run} leaked");
        assert_eq!(ctx.live(), 0);
    }

    ctx.destroy();
    assert_eq!(arena.used(), 0);
}

/// Test strings shared across threads, each thread dropping its own reference
#[test]
fn test_cross_thread_sharing() {
    let arena = common::arena(4);
    let ctx = arena.shared_context();
    let factory = StringFactory::with_slab_size(1024);

    let originals: Vec<RcString> = (0..64)
        .map(|i| factory.create_from_str(&format!("shared-{i}"), &ctx).unwrap())
        .collect();

    thread::scope(|s| {
        for _ in 0..WORKERS {
            let shares: Vec<RcString> = originals.iter().map(RcString::share).collect();
            let ctx = &ctx;
            s.spawn(move || {
                for string in shares {
                    assert!(string.to_str().unwrap().starts_with("shared-"));
                    string.free(ctx);
                }
            });
        }
    });

    for string in &originals {
        assert!(string.ref_count() >= 1);
        string.free(&ctx);
    }
    factory.destroy(&ctx);
    assert_eq!(ctx.reserved(), 0);
}

/// Test workers building scratch maps in child contexts and merging under a lock
#[test]
fn test_children_merge_into_shared_map() {
    let arena = common::arena(16);
    let shared = arena.shared_context();
    let merged = Mutex::new(HashMap::<u64, u64>::new(0, &shared).unwrap());

    thread::scope(|s| {
        for worker in 0..WORKERS as u64 {
            let (shared, merged) = (&shared, &merged);
            s.spawn(move || {
                let scratch = shared.local();
                let mut counts = HashMap::<u64, u64>::new(0, &scratch).unwrap();
                let mut seen = Slice::<u64>::default();
                for i in 0..2000u64 {
                    let key = (i * 7 + worker) % 500;
                    let (count, _) = counts.get2(&key);
                    counts.put(key, count + 1, &scratch).unwrap();
                    seen.append(key, &scratch).unwrap();
                }
                assert_eq!(seen.len(), 2000);

                let mut merged = merged.lock().unwrap();
                for (key, count) in counts.iter() {
                    let (total, _) = merged.get2(&key);
                    merged.put(key, total + count, shared).unwrap();
                }
                drop(merged);

                seen.free(&scratch);
                counts.free(&scratch);
                assert_eq!(scratch.reserved(), 0);
                scratch.destroy();
            });
        }
    });

    assert_eq!(shared.lent(), 0);
    assert_eq!(shared.children(), 0);

    let merged = merged.into_inner().unwrap();
    assert_eq!(merged.len(), 500);
    let total: u64 = merged.iter().map(|(_, count)| count).sum();
    assert_eq!(total, WORKERS as u64 * 2000);
    merged.free(&shared);
    assert_eq!(shared.reserved(), 0);
}
