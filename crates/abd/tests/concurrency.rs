// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Integration tests covering cross-thread use of `Abd`: concurrent view creation/release races
//! against `try_move`, and concurrent dual-ABD copies in the crate's fixed lock order.

#![cfg(feature = "test-util")]

use std::sync::Arc;
use std::thread;

use abd::test_pool::{TestBufPool, TestChunkPool};
use abd::{Config, bufops, config, handle, try_move};

fn with_runtime<R>(chunk_size: usize, f: impl FnOnce() -> R) -> R {
    let _ = tracing_subscriber::fmt::try_init();
    config::fini();
    config::init(
        Config {
            chunk_size,
            ..Config::default()
        },
        Arc::new(TestChunkPool::new(chunk_size)),
        Arc::new(TestBufPool::new()),
    )
    .expect("valid test config");
    let result = f();
    config::fini();
    result
}

#[test]
fn concurrent_view_churn_leaves_refcount_quiescent() {
    with_runtime(4096, || {
        let parent = handle::alloc(4096 * 8, false);

        thread::scope(|scope| {
            for _ in 0..8 {
                let parent = &parent;
                scope.spawn(move || {
                    for _ in 0..200 {
                        let view = handle::get_offset_size(parent, 0, 4096);
                        handle::put(view);
                    }
                });
            }
        });

        assert_eq!(parent.children_refcount_for_test(), 0);
        handle::free(parent);
    });
}

#[test]
fn try_move_eventually_succeeds_once_views_are_released() {
    with_runtime(4096, || {
        let abd = handle::alloc(4096 * 4, false);
        let pattern = vec![0x42u8; 4096 * 4];
        bufops::copy_from_buf(&abd, &pattern);

        let view = handle::get_offset(&abd, 0);
        assert!(!try_move(&abd));

        handle::put(view);
        assert!(try_move(&abd));
        assert_eq!(bufops::cmp_buf(&abd, &pattern), std::cmp::Ordering::Equal);

        handle::free(abd);
    });
}

#[test]
fn concurrent_copies_between_disjoint_abd_pairs_do_not_corrupt_each_other() {
    with_runtime(512, || {
        let pairs: Vec<(abd::Abd, abd::Abd)> = (0..4)
            .map(|i| {
                let src = handle::alloc(2048, false);
                let dst = handle::alloc_linear(2048, false);
                let pattern = vec![(i * 17) as u8; 2048];
                bufops::copy_from_buf(&src, &pattern);
                (dst, src)
            })
            .collect();

        thread::scope(|scope| {
            for (dst, src) in &pairs {
                scope.spawn(move || {
                    bufops::copy(dst, src);
                });
            }
        });

        for (i, (dst, src)) in pairs.iter().enumerate() {
            let expected = vec![(i as u8) * 17; 2048];
            assert_eq!(bufops::cmp_buf(dst, &expected), std::cmp::Ordering::Equal);
            handle::free(dst.clone());
            handle::free(src.clone());
        }
    });
}
