use criterion::{criterion_group, criterion_main, Criterion};
use phyloforge::alignment::Alignment;
use phyloforge::optimizer::iqp;
use phyloforge::optimizer::nni::NoObserver;
use phyloforge::optimizer::{MoveEngine, NniSettings};
use phyloforge::oracle::{ParsimonyOracle, ScoringOracle};
use phyloforge::topology::{PartitionScheme, Topology};
use std::hint::black_box;

const TAXA: usize = 24;
const SITES: usize = 400;

fn setup_alignment() -> Alignment {
    let mut rng = fastrand::Rng::with_seed(2024);
    let tree = Topology::random(TAXA, &mut rng).unwrap();
    let bases = b"ACGT";
    let mut rows = vec![Vec::with_capacity(SITES); TAXA];
    let mut state = vec![0u8; tree.node_count()];
    for _ in 0..SITES {
        for (node, parent) in tree.preorder() {
            state[node] = match parent {
                Some(p) if rng.f64() >= 0.15 => state[p],
                _ => bases[rng.usize(..4)],
            };
        }
        for (leaf, row) in rows.iter_mut().enumerate() {
            row.push(state[leaf]);
        }
    }
    let names = (0..TAXA).map(|i| format!("t{}", i)).collect();
    Alignment::new(names, rows).unwrap()
}

fn bench_search(c: &mut Criterion) {
    let alignment = setup_alignment();
    let oracle = ParsimonyOracle::new(&alignment, PartitionScheme::Single);
    let mut rng = fastrand::Rng::with_seed(7);
    let start = Topology::random(TAXA, &mut rng).unwrap();

    c.bench_function("parsimony_full_evaluate", |b| {
        b.iter(|| oracle.full_evaluate(black_box(&start)).unwrap())
    });

    c.bench_function("nni_local_search", |b| {
        b.iter(|| {
            let mut topo = start.clone();
            let mut rng = fastrand::Rng::with_seed(1);
            let engine = MoveEngine::new(&oracle, NniSettings::default());
            let score = oracle.full_evaluate(&topo).unwrap();
            black_box(engine.optimize(&mut topo, score, None, &mut rng, &mut NoObserver))
        })
    });

    c.bench_function("iqp_perturbation", |b| {
        b.iter(|| {
            let mut topo = start.clone();
            let mut rng = fastrand::Rng::with_seed(3);
            black_box(iqp::perturb(&mut topo, &oracle, TAXA / 4, 4, None, &mut rng).unwrap())
        })
    });
}

criterion_group!(benches, bench_search);
criterion_main!(benches);
