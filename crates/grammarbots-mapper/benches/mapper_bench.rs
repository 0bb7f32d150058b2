use criterion::{BatchSize, Criterion, criterion_group, criterion_main};
use grammarbots_grammar::Grammar;
use grammarbots_mapper::{DEFAULT_CODON_SIZE, Genome, MapLimits, map, map_tree};
use rand::{SeedableRng, rngs::SmallRng};
use std::time::Duration;

const GRAMMAR: &str = "\
<expr> ::= <expr><op><expr> | <var>
<op> ::= '+' | '-' | '*' | '/'
<var> ::= x | y | z | '1' | '2'";

fn bench_mapping(c: &mut Criterion) {
    let mut group = c.benchmark_group("mapping");
    // Allow env overrides for longer local runs.
    let samples: usize = std::env::var("GB_BENCH_SAMPLES")
        .ok()
        .and_then(|s| s.parse().ok())
        .filter(|v| *v > 0)
        .unwrap_or(30);
    let measure: u64 = std::env::var("GB_BENCH_MEASURE_SECS")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(5);
    group.sample_size(samples);
    group.measurement_time(Duration::from_secs(measure));

    let grammar = Grammar::parse_bnf(GRAMMAR).expect("bench grammar should parse");
    let limits = MapLimits {
        max_wraps: 2,
        max_tree_depth: Some(30),
    };

    for genome_len in [16usize, 64, 256] {
        let mut rng = SmallRng::seed_from_u64(0x5EED);
        let genomes: Vec<Genome> = (0..64)
            .map(|_| Genome::random(&mut rng, genome_len, DEFAULT_CODON_SIZE))
            .collect();

        group.bench_function(format!("fast/{genome_len}"), |b| {
            b.iter_batched(
                || genomes.clone(),
                |genomes| {
                    for genome in &genomes {
                        let _ = map(genome, &grammar, &limits);
                    }
                },
                BatchSize::SmallInput,
            );
        });

        group.bench_function(format!("tree/{genome_len}"), |b| {
            b.iter_batched(
                || genomes.clone(),
                |genomes| {
                    for genome in &genomes {
                        let _ = map_tree(genome, &grammar, &limits);
                    }
                },
                BatchSize::SmallInput,
            );
        });
    }

    group.finish();
}

criterion_group!(benches, bench_mapping);
criterion_main!(benches);
