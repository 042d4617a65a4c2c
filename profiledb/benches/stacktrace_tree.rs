// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use criterion::*;
use profiledb::config::SymDbConfig;
use profiledb::symdb::{StacktraceTree, SymDb};

/// Deterministic stack traces sharing a small set of root frames, the way
/// real call stacks share `main` and the runtime entry points.
fn stacks(n: u64) -> Vec<Vec<u64>> {
    (0..n)
        .map(|i| {
            let depth = 8 + (i % 24);
            (0..depth)
                .map(|d| if d + 6 >= depth { depth - d } else { (i * 31 + d * 7) % 512 + 16 })
                .collect()
        })
        .collect()
}

pub fn tree_insert(c: &mut Criterion) {
    let stacks = stacks(10_000);
    c.bench_function("stacktrace tree insert 10k", |b| {
        b.iter(|| {
            let mut tree = StacktraceTree::with_capacity(1 << 16);
            for s in &stacks {
                black_box(tree.insert(s));
            }
            tree.len()
        })
    });
}

pub fn symdb_append(c: &mut Criterion) {
    let stacks = stacks(10_000);
    let refs: Vec<&[u64]> = stacks.iter().map(Vec::as_slice).collect();
    c.bench_function("symdb append 10k, 4k nodes per chunk", |b| {
        b.iter(|| {
            let db = SymDb::new(SymDbConfig {
                max_nodes_per_chunk: 4 << 10,
                ..Default::default()
            });
            let mut dst = vec![0u32; refs.len()];
            let mut appender = db.mapping_writer(1).stacktrace_appender();
            appender.append_stacktraces(&mut dst, &refs).unwrap();
            appender.release();
            black_box(dst)
        })
    });
}

criterion_group!(benches, tree_insert, symdb_append);
