//! Genotype-to-phenotype mapping core shared across the GrammarBots workspace.
//!
//! A [`Genome`] of integer codons drives a bounded left-most derivation over a
//! shared read-only [`Grammar`]. Two equivalent mappers exist: [`map`] tracks
//! only counts and is the fast path for plain genome operations, while
//! [`map_tree`] materializes the full [`DerivationTree`] needed for attribute
//! evaluation and for re-sequencing a genome out of a tree.

use grammarbots_grammar::{Grammar, Symbol};
use ordered_float::OrderedFloat;
use rand::{Rng, RngCore};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::VecDeque;
use std::fmt;
use tracing::{debug, trace};

/// Default exclusive upper bound for randomly drawn codon values.
pub const DEFAULT_CODON_SIZE: u32 = 100_000;

/// Linear integer genome. Read-only during mapping; variation operators work
/// on their own clone.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Genome(Vec<u32>);

impl Genome {
    #[must_use]
    pub fn new(codons: Vec<u32>) -> Self {
        Self(codons)
    }

    /// Draw `len` codons uniformly below `codon_size`.
    #[must_use]
    pub fn random(rng: &mut dyn RngCore, len: usize, codon_size: u32) -> Self {
        Self((0..len).map(|_| rng.random_range(0..codon_size)).collect())
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    #[must_use]
    pub fn codons(&self) -> &[u32] {
        &self.0
    }

    /// Codon at `index`, wrapping by index modulo genome length.
    ///
    /// Panics on an empty genome; mapping asserts non-emptiness up front.
    #[must_use]
    pub fn codon(&self, index: usize) -> u32 {
        self.0[index % self.0.len()]
    }
}

impl From<Vec<u32>> for Genome {
    fn from(codons: Vec<u32>) -> Self {
        Self(codons)
    }
}

/// Budget limits applied to one mapping operation.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct MapLimits {
    /// How many times codons may be reused from the start of the genome.
    pub max_wraps: usize,
    /// Optional ceiling on derivation tree depth.
    pub max_tree_depth: Option<usize>,
}

impl Default for MapLimits {
    fn default() -> Self {
        Self {
            max_wraps: 0,
            max_tree_depth: Some(90),
        }
    }
}

impl MapLimits {
    #[must_use]
    pub fn with_wraps(max_wraps: usize) -> Self {
        Self {
            max_wraps,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn unbounded_depth(mut self) -> Self {
        self.max_tree_depth = None;
        self
    }
}

/// Why a mapping failed structurally.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum InvalidReason {
    /// Wrap budget exhausted with unexpanded non-terminals remaining.
    WrapLimitExhausted,
    /// Derivation exceeded the configured tree depth ceiling.
    DepthLimitExceeded,
}

impl fmt::Display for InvalidReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::WrapLimitExhausted => "wrap limit exhausted",
            Self::DepthLimitExceeded => "tree depth limit exceeded",
        };
        write!(f, "{text}")
    }
}

/// Outcome statistics of one mapping. A sum type rather than NaN-marked
/// counters: an invalid individual has no phenotype and no counts at all.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum MappingResult {
    Valid {
        phenotype: String,
        node_count: usize,
        max_depth: usize,
        used_codons: usize,
    },
    Invalid {
        reason: InvalidReason,
    },
}

impl MappingResult {
    #[must_use]
    pub fn is_invalid(&self) -> bool {
        matches!(self, Self::Invalid { .. })
    }

    #[must_use]
    pub fn phenotype(&self) -> Option<&str> {
        match self {
            Self::Valid { phenotype, .. } => Some(phenotype),
            Self::Invalid { .. } => None,
        }
    }

    #[must_use]
    pub fn used_codons(&self) -> Option<usize> {
        match self {
            Self::Valid { used_codons, .. } => Some(*used_codons),
            Self::Invalid { .. } => None,
        }
    }
}

/// Everything produced by one mapping call.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MappingOutcome {
    pub genome: Genome,
    pub tree: Option<DerivationTree>,
    pub result: MappingResult,
}

impl MappingOutcome {
    #[must_use]
    pub fn is_invalid(&self) -> bool {
        self.result.is_invalid()
    }

    #[must_use]
    pub fn phenotype(&self) -> Option<&str> {
        self.result.phenotype()
    }
}

/// One node of the concrete derivation tree. Children are exclusively owned;
/// cloning yields a fully independent tree.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DerivationTree {
    pub symbol: Symbol,
    /// Codon consumed to choose this node's expansion; absent for terminals.
    pub codon: Option<u32>,
    /// Depth in the tree, 1 at the root.
    pub depth: usize,
    /// Expansion sequence number; terminal leaves are not numbered.
    pub id: usize,
    pub children: Vec<DerivationTree>,
    /// Attribute code of the chosen production, braces already stripped.
    pub raw_code: Option<String>,
    /// Attribute-evaluation verdict, set on the root by the evaluator.
    pub invalid: bool,
}

impl DerivationTree {
    fn leaf(symbol: Symbol, depth: usize) -> Self {
        Self {
            symbol,
            codon: None,
            depth,
            id: 0,
            children: Vec::new(),
            raw_code: None,
            invalid: false,
        }
    }

    /// Terminal texts of this subtree in left-to-right derivation order.
    #[must_use]
    pub fn phenotype(&self) -> String {
        let mut out = String::new();
        self.collect_phenotype(&mut out);
        out
    }

    fn collect_phenotype(&self, out: &mut String) {
        if !self.symbol.is_non_terminal() {
            out.push_str(&self.symbol.name);
        }
        for child in &self.children {
            child.collect_phenotype(out);
        }
    }
}

fn rule_or_panic<'a>(grammar: &'a Grammar, name: &str) -> &'a grammarbots_grammar::Rule {
    grammar
        .rule(name)
        .unwrap_or_else(|| panic!("non-terminal {name} has no rule entry in the grammar"))
}

/// Fast count-only mapping: bounded left-most derivation over a work queue,
/// no tree materialized.
///
/// # Panics
///
/// Panics on an empty genome or on a production referencing a non-terminal
/// absent from the rule table; both are caller contract violations.
#[must_use]
pub fn map(genome: &Genome, grammar: &Grammar, limits: &MapLimits) -> MappingOutcome {
    assert!(
        !genome.is_empty(),
        "genome must contain at least one codon"
    );

    let n_input = genome.len();
    let mut used_input = 0usize;
    let mut max_depth = 1usize;
    let mut nodes = 1usize;
    let mut wraps: i64 = -1;
    let mut output = String::new();
    let mut reason: Option<InvalidReason> = None;

    let start_symbol = Symbol::non_terminal(grammar.start.clone());
    let mut unexpanded: VecDeque<(&Symbol, usize)> = VecDeque::new();
    unexpanded.push_back((&start_symbol, 1));

    while wraps < limits.max_wraps as i64 && !unexpanded.is_empty() {
        if limits.max_tree_depth.is_some_and(|limit| max_depth > limit) {
            reason = Some(InvalidReason::DepthLimitExceeded);
            break;
        }

        if used_input > 0
            && used_input % n_input == 0
            && unexpanded.iter().any(|(symbol, _)| symbol.is_non_terminal())
        {
            wraps += 1;
            trace!(wraps, used_input, "reusing codons from genome start");
        }

        let (symbol, depth) = unexpanded.pop_front().expect("queue checked non-empty");
        if depth > max_depth {
            max_depth = depth;
        }

        if !symbol.is_non_terminal() {
            output.push_str(&symbol.name);
            continue;
        }

        let rule = rule_or_panic(grammar, &symbol.name);
        let selection = genome.codon(used_input) as usize % rule.no_choices();
        used_input += 1;

        let production = &rule.choices[selection];
        let mut nt_count = 0usize;
        for child in production.symbols.iter().rev() {
            // Front insertion in reverse keeps left-to-right derivation order.
            unexpanded.push_front((child, depth + 1));
        }
        for child in &production.symbols {
            if child.is_non_terminal() {
                nt_count += 1;
            }
        }
        nodes += if nt_count > 0 { nt_count } else { 1 };
    }

    if !unexpanded.is_empty() {
        let reason = reason.unwrap_or(InvalidReason::WrapLimitExhausted);
        debug!(%reason, used_input, "mapping invalid");
        return MappingOutcome {
            genome: genome.clone(),
            tree: None,
            result: MappingResult::Invalid { reason },
        };
    }

    MappingOutcome {
        genome: genome.clone(),
        tree: None,
        result: MappingResult::Valid {
            phenotype: output,
            node_count: nodes,
            max_depth,
            used_codons: used_input,
        },
    }
}

/// Recursive tree-building state shared across one [`map_tree`] call.
struct TreeBuilder<'a> {
    genome: &'a Genome,
    grammar: &'a Grammar,
    limits: &'a MapLimits,
    codon_budget: usize,
    output: String,
    index: usize,
    nodes: usize,
    max_depth: usize,
    invalid: bool,
    reason: Option<InvalidReason>,
}

impl TreeBuilder<'_> {
    fn fail(&mut self, reason: InvalidReason) {
        self.invalid = true;
        self.reason.get_or_insert(reason);
    }

    /// Expand `node` in place; `parent_depth` is the depth of its parent
    /// (0 for the root call).
    fn expand(&mut self, node: &mut DerivationTree, parent_depth: usize) {
        if self.invalid || self.index >= self.codon_budget {
            self.fail(InvalidReason::WrapLimitExhausted);
            return;
        }
        if self
            .limits
            .max_tree_depth
            .is_some_and(|limit| self.max_depth > limit)
        {
            self.fail(InvalidReason::DepthLimitExceeded);
        }

        self.nodes += 1;
        let depth = parent_depth + 1;
        node.depth = depth;
        node.id = self.nodes;

        let rule = rule_or_panic(self.grammar, &node.symbol.name);
        let codon = self.genome.codon(self.index);
        node.codon = Some(codon);
        let selection = codon as usize % rule.no_choices();
        self.index += 1;

        let production = &rule.choices[selection];
        node.raw_code = production.attr_code.clone();

        let mut has_nt_child = false;
        for symbol in &production.symbols {
            let mut child = DerivationTree::leaf(symbol.clone(), depth + 1);
            if symbol.is_non_terminal() {
                has_nt_child = true;
                self.expand(&mut child, depth);
            } else {
                self.output.push_str(&symbol.name);
            }
            node.children.push(child);
        }

        // An all-terminal production terminates the branch one level lower.
        let mut local_depth = depth;
        if !has_nt_child {
            local_depth += 1;
            self.nodes += 1;
        }

        if !self.invalid {
            if local_depth > self.max_depth {
                self.max_depth = local_depth;
            }
            if self
                .limits
                .max_tree_depth
                .is_some_and(|limit| self.max_depth > limit)
            {
                self.fail(InvalidReason::DepthLimitExceeded);
            }
        }
    }
}

/// Tree-building mapping: identical codon selection to [`map`], but
/// materializes the full derivation tree depth-first. Required whenever
/// attribute evaluation or genome re-sequencing is needed.
///
/// # Panics
///
/// Same contract violations as [`map`].
#[must_use]
pub fn map_tree(genome: &Genome, grammar: &Grammar, limits: &MapLimits) -> MappingOutcome {
    assert!(
        !genome.is_empty(),
        "genome must contain at least one codon"
    );

    let mut builder = TreeBuilder {
        genome,
        grammar,
        limits,
        codon_budget: genome.len() * (limits.max_wraps + 1),
        output: String::new(),
        index: 0,
        nodes: 0,
        max_depth: 0,
        invalid: false,
        reason: None,
    };

    let mut root = DerivationTree::leaf(Symbol::non_terminal(grammar.start.clone()), 1);
    builder.expand(&mut root, 0);

    let result = if builder.invalid {
        let reason = builder
            .reason
            .unwrap_or(InvalidReason::WrapLimitExhausted);
        debug!(%reason, used_codons = builder.index, "tree mapping invalid");
        MappingResult::Invalid { reason }
    } else {
        MappingResult::Valid {
            phenotype: builder.output,
            node_count: builder.nodes,
            max_depth: builder.max_depth,
            used_codons: builder.index,
        }
    };

    MappingOutcome {
        genome: genome.clone(),
        tree: Some(root),
        result,
    }
}

/// Recover the codon sequence that produced `tree`, in pre-order. Returns
/// the genome together with the number of codons collected.
#[must_use]
pub fn sequence_genome(tree: &DerivationTree) -> (Genome, usize) {
    fn walk(node: &DerivationTree, codons: &mut Vec<u32>) {
        if let Some(codon) = node.codon {
            codons.push(codon);
        }
        for child in &node.children {
            walk(child, codons);
        }
    }

    let mut codons = Vec::new();
    walk(tree, &mut codons);
    let used = codons.len();
    (Genome::new(codons), used)
}

/// Map a batch of genomes against one shared grammar in parallel. Each
/// outcome is fully independent; the grammar is only ever read.
#[must_use]
pub fn map_population(
    genomes: &[Genome],
    grammar: &Grammar,
    limits: &MapLimits,
) -> Vec<MappingOutcome> {
    genomes
        .par_iter()
        .map(|genome| map(genome, grammar, limits))
        .collect()
}

/// A mapped individual: genome, optional derivation tree, mapping result and
/// a fitness slot. Fitness stays NaN until scored; NaN sorts as worst.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Individual {
    pub genome: Genome,
    pub tree: Option<DerivationTree>,
    pub result: MappingResult,
    pub fitness: f64,
}

impl Individual {
    /// Map a genome with the fast mapper (no tree).
    #[must_use]
    pub fn from_genome(genome: Genome, grammar: &Grammar, limits: &MapLimits) -> Self {
        Self::from_outcome(map(&genome, grammar, limits))
    }

    /// Map a genome with the tree-building mapper.
    #[must_use]
    pub fn from_genome_with_tree(genome: Genome, grammar: &Grammar, limits: &MapLimits) -> Self {
        Self::from_outcome(map_tree(&genome, grammar, limits))
    }

    /// Build an individual from a tree produced by subtree-level variation:
    /// the genome is re-sequenced from the stored codons and mapped directly.
    #[must_use]
    pub fn from_tree(tree: &DerivationTree, grammar: &Grammar, limits: &MapLimits) -> Self {
        let (genome, _) = sequence_genome(tree);
        Self::from_outcome(map_tree(&genome, grammar, limits))
    }

    #[must_use]
    pub fn from_outcome(outcome: MappingOutcome) -> Self {
        Self {
            genome: outcome.genome,
            tree: outcome.tree,
            result: outcome.result,
            fitness: f64::NAN,
        }
    }

    #[must_use]
    pub fn is_invalid(&self) -> bool {
        self.result.is_invalid()
    }

    #[must_use]
    pub fn phenotype(&self) -> Option<&str> {
        self.result.phenotype()
    }

    /// Total order on fitness where NaN (unscored or invalid) sorts first,
    /// i.e. as the worst individual under maximisation.
    #[must_use]
    pub fn compare_fitness(&self, other: &Self) -> Ordering {
        match (self.fitness.is_nan(), other.fitness.is_nan()) {
            (true, true) => Ordering::Equal,
            (true, false) => Ordering::Less,
            (false, true) => Ordering::Greater,
            (false, false) => OrderedFloat(self.fitness).cmp(&OrderedFloat(other.fitness)),
        }
    }
}
