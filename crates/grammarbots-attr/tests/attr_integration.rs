//! End-to-end attribute evaluation over a knapsack-style grammar: weights
//! and values synthesize upward, capacity is inherited downward, and an
//! overweight selection trips `error()`.

use grammarbots_attr::{Direction, evaluate};
use grammarbots_grammar::{Grammar, Value};
use grammarbots_mapper::{DerivationTree, Genome, Individual, MapLimits, map_tree};

const KNAPSACK_BNF: &str = "\
<S> ::= <K> { <K>.c = 10
<S>.w = <K>.w
<S>.v = <K>.v }
<K> ::= <I><K> { <K_2>.c = <K_1>.c
<K_1>.w = <K_2>.w + <I>.w
<K_1>.v = <K_2>.v + <I>.v
<K_1>.w <= <K_1>.c or error() } | <I> { <K>.w = <I>.w
<K>.v = <I>.v }
<I> ::= a { <I>.w = 4
<I>.v = 5 } | b { <I>.w = 3
<I>.v = 1 }";

const KNAPSACK_SYMBOLS: &str = "\
<S>
w, int, 0
v, int, 0
---
<K>
w, int, 0
v, int, 0
c, int, 0
---
<I>
w, int, 0
v, int, 0";

fn knapsack_grammar() -> Grammar {
    let mut grammar = Grammar::parse_bnf(KNAPSACK_BNF).expect("grammar should parse");
    let table = Grammar::parse_symbol_table(KNAPSACK_SYMBOLS).expect("table should parse");
    grammar.attach_symbols(table);
    grammar
}

fn mapped(grammar: &Grammar, codons: Vec<u32>) -> DerivationTree {
    let outcome = map_tree(
        &Genome::new(codons),
        grammar,
        &MapLimits::with_wraps(0).unbounded_depth(),
    );
    assert!(!outcome.is_invalid(), "mapping must be structurally valid");
    outcome.tree.expect("tree variant builds a tree")
}

#[test]
fn weights_and_values_accumulate_within_capacity() {
    let grammar = knapsack_grammar();
    // Items: one `a` (w4 v5) and one `b` (w3 v1).
    let mut tree = mapped(&grammar, vec![0, 0, 0, 1, 1]);
    assert_eq!(tree.phenotype(), "ab");

    let code_tree = evaluate(&mut tree, &grammar).expect("evaluation should succeed");
    assert!(!code_tree.invalid());
    assert!(!tree.invalid);
    assert_eq!(code_tree.attribute("<K>", "w"), Some(&Value::Int(7)));
    assert_eq!(code_tree.attribute("<K>", "v"), Some(&Value::Int(6)));
    assert_eq!(code_tree.attribute("<K>", "c"), Some(&Value::Int(10)));
    assert_eq!(code_tree.attribute("<S>", "w"), Some(&Value::Int(7)));
    assert_eq!(code_tree.attribute("<S>", "v"), Some(&Value::Int(6)));
}

#[test]
fn capacity_is_inherited_and_totals_are_synthesized() {
    let grammar = knapsack_grammar();
    let mut tree = mapped(&grammar, vec![0, 0, 0, 1, 1]);
    let code_tree = evaluate(&mut tree, &grammar).expect("evaluation should succeed");

    assert_eq!(code_tree.direction("<K>", "c"), Some(Direction::Inherited));
    assert_eq!(code_tree.direction("<K>", "w"), Some(Direction::Synthesized));
    assert_eq!(code_tree.direction("<K>", "v"), Some(Direction::Synthesized));
    assert_eq!(code_tree.direction("<S>", "w"), Some(Direction::Synthesized));
    assert_eq!(code_tree.direction("<I>", "w"), Some(Direction::Synthesized));
}

#[test]
fn overweight_selection_is_semantically_invalid() {
    let grammar = knapsack_grammar();
    // Three `a` items: weight 12 exceeds the capacity of 10.
    let mut tree = mapped(&grammar, vec![0, 0, 0, 0, 0, 1, 0]);
    assert_eq!(tree.phenotype(), "aaa");

    let code_tree = evaluate(&mut tree, &grammar).expect("evaluation should succeed");
    assert!(code_tree.invalid());
    assert!(tree.invalid);
    // Values are still computed and stay readable for penalty scoring.
    assert_eq!(code_tree.attribute("<K>", "w"), Some(&Value::Int(12)));
    assert_eq!(code_tree.attribute("<K>", "v"), Some(&Value::Int(15)));
}

#[test]
fn evaluation_is_deterministic() {
    let grammar = knapsack_grammar();
    for _ in 0..3 {
        let mut tree = mapped(&grammar, vec![0, 0, 0, 1, 1]);
        let code_tree = evaluate(&mut tree, &grammar).expect("evaluation should succeed");
        assert_eq!(code_tree.attribute("<K>", "w"), Some(&Value::Int(7)));
        assert!(!code_tree.invalid());
    }
}

#[test]
fn fitness_reads_evaluated_attributes() {
    let grammar = knapsack_grammar();
    let limits = MapLimits::with_wraps(0).unbounded_depth();

    let mut light = Individual::from_genome_with_tree(
        Genome::new(vec![0, 0, 1, 1, 1]),
        &grammar,
        &limits,
    );
    let mut heavy = Individual::from_genome_with_tree(
        Genome::new(vec![0, 0, 0, 1, 1]),
        &grammar,
        &limits,
    );

    for individual in [&mut light, &mut heavy] {
        let tree = individual.tree.as_mut().expect("tree was requested");
        let code_tree = evaluate(tree, &grammar).expect("evaluation should succeed");
        let weight = code_tree
            .attribute("<K>", "w")
            .and_then(Value::as_f64)
            .expect("weight is numeric");
        let value = code_tree
            .attribute("<K>", "v")
            .and_then(Value::as_f64)
            .expect("value is numeric");
        let capacity = code_tree
            .attribute("<K>", "c")
            .and_then(Value::as_f64)
            .expect("capacity is numeric");
        individual.fitness = weight / capacity * value;
    }

    assert_eq!(
        light.compare_fitness(&heavy),
        std::cmp::Ordering::Less,
        "the all-b selection scores below the a+b selection"
    );
}
