//! Cotangent storage container.

use std::collections::{HashMap, HashSet};

use crate::error::{GraphError, Result};
use crate::node::Variable;
use crate::ops;
use crate::recorder::Recorder;

/// Accumulated reverse-mode sensitivities, keyed by primal variable.
///
/// Each entry is itself a graph variable, so a cotangent can be evaluated,
/// lowered, or differentiated again. Only variables on a path between the
/// requested inputs and the seeds are tracked; [`wants`](Self::wants) tells
/// derivative rules which inputs to bother with.
#[derive(Debug, Default)]
pub struct Cotangents {
    cots: HashMap<Variable, Variable>,
    wanted: HashSet<Variable>,
}

impl Cotangents {
    /// Create an empty container tracking `wanted`.
    pub fn new(wanted: HashSet<Variable>) -> Self {
        Self {
            cots: HashMap::new(),
            wanted,
        }
    }

    /// Whether contributions to `v` are needed.
    #[inline]
    pub fn wants(&self, v: Variable) -> bool {
        self.wanted.contains(&v)
    }

    /// Whether any contribution has reached `v`.
    #[inline]
    pub fn check(&self, v: Variable) -> bool {
        self.cots.contains_key(&v)
    }

    /// Cotangent of `v`, `None` if no contribution reached it.
    #[inline]
    pub fn get(&self, v: Variable) -> Option<Variable> {
        self.cots.get(&v).copied()
    }

    /// Add a contribution for `v`.
    ///
    /// If a cotangent already exists, an `add` operation is recorded in the
    /// active graph of `rec`. Contributions to variables that are not wanted
    /// are dropped.
    ///
    /// # Errors
    ///
    /// Returns `GraphError::ShapeMismatch` if `contribution` is not shaped like `v`.
    pub fn accumulate(&mut self, rec: &mut Recorder, v: Variable, contribution: Variable) -> Result<()> {
        if !self.wants(v) {
            return Ok(());
        }
        if rec.shape(v) != rec.shape(contribution) {
            return Err(GraphError::shape_mismatch(
                format!("cotangent of {}", rec.variable(v).info.name),
                rec.shape(v),
                rec.shape(contribution),
            ));
        }
        let total = match self.cots.get(&v) {
            Some(&existing) => ops::add(rec, existing, contribution)?,
            None => contribution,
        };
        self.cots.insert(v, total);
        Ok(())
    }

    /// Remove and return the cotangent of `v`.
    pub fn remove(&mut self, v: Variable) -> Option<Variable> {
        self.cots.remove(&v)
    }

    /// Number of variables with a cotangent.
    pub fn len(&self) -> usize {
        self.cots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cots.is_empty()
    }

    /// Iterate over `(primal, cotangent)` pairs.
    pub fn iter(&self) -> impl Iterator<Item = (Variable, Variable)> + '_ {
        self.cots.iter().map(|(k, v)| (*k, *v))
    }
}
