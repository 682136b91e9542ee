use criterion::{criterion_group, criterion_main, Criterion};
use stocktake_core::{select_best_template, PartId, TemplateCandidate, TemplateId, TreePosition};

// A single chain of nested parts, each owning one template for the same key.
fn mk_chain(depth: i64) -> Vec<TemplateCandidate> {
    (0..depth)
        .map(|level| TemplateCandidate {
            template_id: TemplateId(level + 1),
            part_id: PartId(level + 1),
            key: "leaktest".to_string(),
            position: TreePosition {
                tree_id: 1,
                lft: level,
                rght: 2 * depth - level,
                level,
            },
        })
        .collect()
}

// Siblings that share a key but sit on other branches than the target.
fn mk_siblings(count: i64) -> Vec<TemplateCandidate> {
    (0..count)
        .map(|index| TemplateCandidate {
            template_id: TemplateId(index + 1),
            part_id: PartId(index + 1),
            key: if index % 3 == 0 { "flow".to_string() } else { "leaktest".to_string() },
            position: TreePosition { tree_id: 1, lft: 2 * index + 1, rght: 2 * index + 2, level: 1 },
        })
        .collect()
}

fn bench_deep_chain(c: &mut Criterion) {
    let candidates = mk_chain(1_000);
    let target = TreePosition { tree_id: 1, lft: 999, rght: 1_001, level: 999 };

    c.bench_function("select_best_template_chain_1000", |b| {
        b.iter(|| {
            if select_best_template(&target, "leaktest", &candidates).is_none() {
                panic!("chain benchmark found no template");
            }
        });
    });
}

fn bench_wide_siblings(c: &mut Criterion) {
    let candidates = mk_siblings(1_000);
    let target = TreePosition { tree_id: 1, lft: 5_000, rght: 5_001, level: 2 };

    c.bench_function("select_best_template_siblings_1000", |b| {
        b.iter(|| select_best_template(&target, "leaktest", &candidates).is_none());
    });
}

criterion_group!(template_resolver_benches, bench_deep_chain, bench_wide_siblings);
criterion_main!(template_resolver_benches);
