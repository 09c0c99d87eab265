//! Outer parameter vector layout.
//!
//! The outer optimizer works on one flat vector ordered
//! `beta | beta_zi | beta_disp | theta | theta_zi | psi`. The layout
//! records where each block starts, the names of its entries and, for
//! every random-effect term, where its covariance parameters sit in the
//! outer vector and where its modes sit in the random-effect vector b.

use std::ops::Range;

use serde::{Deserialize, Serialize};

use super::spec::{ModelSpec, ReTerm};
use crate::glmm::covariance::CovStructure;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Block {
    Beta,
    BetaZi,
    BetaDisp,
    Theta,
    ThetaZi,
    Psi,
}

impl Block {
    pub const ALL: [Block; 6] = [
        Block::Beta,
        Block::BetaZi,
        Block::BetaDisp,
        Block::Theta,
        Block::ThetaZi,
        Block::Psi,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Block::Beta => "beta",
            Block::BetaZi => "beta_zi",
            Block::BetaDisp => "beta_disp",
            Block::Theta => "theta",
            Block::ThetaZi => "theta_zi",
            Block::Psi => "psi",
        }
    }

    /// Prefix used when block-local names are shown in one list.
    fn display_prefix(self) -> &'static str {
        match self {
            Block::Beta | Block::Theta | Block::Psi => "",
            Block::BetaZi | Block::ThetaZi => "zi~",
            Block::BetaDisp => "disp~",
        }
    }

    /// Whether the block holds fixed-effect coefficients.
    pub fn is_fixed_effect(self) -> bool {
        matches!(self, Block::Beta | Block::BetaZi | Block::BetaDisp | Block::Psi)
    }

    fn index(self) -> usize {
        self as usize
    }
}

/// One random-effect term's place in the outer vector and in b.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReBlock {
    pub label: String,
    pub group: String,
    pub structure: CovStructure,
    pub columns: Vec<String>,
    pub dim: usize,
    pub n_levels: usize,
    /// Start of the term's theta in the outer vector.
    pub theta_start: usize,
    pub n_theta: usize,
    /// Start of the term's modes in b (level-major, `dim` per level).
    pub b_start: usize,
    /// Term of the zero-inflation model.
    pub zi: bool,
}

impl ReBlock {
    fn new(term: &ReTerm, theta_start: usize, b_start: usize, zi: bool) -> Self {
        let dim = term.dim();
        ReBlock {
            label: term.label.clone(),
            group: term.group.clone(),
            structure: term.structure,
            columns: term.columns.clone(),
            dim,
            n_levels: term.levels.len(),
            theta_start,
            n_theta: term.structure.n_params(dim),
            b_start,
            zi,
        }
    }

    pub fn theta_range(&self) -> Range<usize> {
        self.theta_start..self.theta_start + self.n_theta
    }

    pub fn n_b(&self) -> usize {
        self.n_levels * self.dim
    }

    /// Modes of level `l`.
    pub fn level_range(&self, l: usize) -> Range<usize> {
        let s = self.b_start + l * self.dim;
        s..s + self.dim
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterLayout {
    /// Block-local names, in vector order.
    pub names: Vec<String>,
    /// Block boundaries: block k spans `starts[k]..starts[k + 1]`.
    starts: [usize; 7],
    pub re: Vec<ReBlock>,
    /// Length of b.
    pub n_b: usize,
    /// Length of the conditional part of b (zi modes follow it).
    pub n_b_cond: usize,
}

impl ParameterLayout {
    pub fn from_spec(spec: &ModelSpec) -> Self {
        let mut names: Vec<String> = Vec::new();
        let mut starts = [0usize; 7];

        starts[Block::Beta.index()] = names.len();
        names.extend(spec.cond.names.iter().cloned());
        starts[Block::BetaZi.index()] = names.len();
        if let Some(zi) = &spec.zi {
            names.extend(zi.names.iter().cloned());
        }
        starts[Block::BetaDisp.index()] = names.len();
        names.extend(spec.disp.names.iter().cloned());

        let mut re = Vec::new();
        let mut b_start = 0;
        starts[Block::Theta.index()] = names.len();
        for term in &spec.cond.re_terms {
            let block = ReBlock::new(term, names.len(), b_start, false);
            names.extend(term.structure.param_names(&term.columns, &term.group));
            b_start += block.n_b();
            re.push(block);
        }
        let n_b_cond = b_start;
        starts[Block::ThetaZi.index()] = names.len();
        if let Some(zi) = &spec.zi {
            for term in &zi.re_terms {
                let block = ReBlock::new(term, names.len(), b_start, true);
                names.extend(term.structure.param_names(&term.columns, &term.group));
                b_start += block.n_b();
                re.push(block);
            }
        }
        starts[Block::Psi.index()] = names.len();
        if spec.family.has_power() {
            names.push("psi".to_string());
        }
        starts[6] = names.len();

        ParameterLayout {
            names,
            starts,
            re,
            n_b: b_start,
            n_b_cond,
        }
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub fn range(&self, block: Block) -> Range<usize> {
        self.starts[block.index()]..self.starts[block.index() + 1]
    }

    pub fn block_names(&self, block: Block) -> &[String] {
        &self.names[self.range(block)]
    }

    pub fn block_of(&self, index: usize) -> Block {
        Block::ALL
            .iter()
            .copied()
            .find(|b| self.range(*b).contains(&index))
            .unwrap_or(Block::Psi)
    }

    /// Name of entry `index` qualified by its sub-model, e.g. `zi~(Intercept)`.
    pub fn display_name(&self, index: usize) -> String {
        format!("{}{}", self.block_of(index).display_prefix(), self.names[index])
    }

    /// Position of the Tweedie power parameter, if any.
    pub fn psi_index(&self) -> Option<usize> {
        let r = self.range(Block::Psi);
        (!r.is_empty()).then_some(r.start)
    }

    /// Index of a block-local name.
    pub fn find(&self, block: Block, name: &str) -> Option<usize> {
        let r = self.range(block);
        self.names[r.clone()]
            .iter()
            .position(|n| n == name)
            .map(|p| r.start + p)
    }
}

/// Values of the outer parameters together with their layout.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterVector {
    pub layout: ParameterLayout,
    pub values: Vec<f64>,
}

impl ParameterVector {
    pub fn new(layout: ParameterLayout, values: Vec<f64>) -> Self {
        debug_assert_eq!(layout.len(), values.len());
        ParameterVector { layout, values }
    }

    pub fn block(&self, block: Block) -> &[f64] {
        &self.values[self.layout.range(block)]
    }

    /// Value of a block-local name.
    pub fn get(&self, block: Block, name: &str) -> Option<f64> {
        self.layout.find(block, name).map(|i| self.values[i])
    }

    /// Copy entries whose block and name also exist in `other`; returns
    /// how many were matched.
    pub fn warm_start_from(&mut self, other: &ParameterVector) -> usize {
        let mut matched = 0;
        for block in Block::ALL {
            for i in self.layout.range(block) {
                if let Some(v) = other.get(block, &self.layout.names[i]) {
                    self.values[i] = v;
                    matched += 1;
                }
            }
        }
        matched
    }
}
