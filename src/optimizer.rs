//! Fixed-point rewriting of a graph with an ordered list of rules.

use std::collections::{BTreeMap, HashSet, VecDeque};

use log::{debug, info, warn};

use crate::error::{IterationCapExceededSnafu, Result};
use crate::language::rewrites::{EdgePatch, Rewrite, Rule};
use crate::language::{Builder, Graph, NodeId};

pub const DEFAULT_MAX_ITERATIONS: usize = 100;

/// A rule that fired at some anchor.
#[derive(Debug)]
pub struct Fired {
    pub rule: &'static str,
    pub rewrite: Rewrite,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct PassReport {
    /// Sweeps over the graph, including the final one that changed nothing.
    pub iterations: usize,
    /// Rewrites committed.
    pub rewrites: usize,
    /// Committed rewrites per rule name.
    pub fired: BTreeMap<&'static str, usize>,
}

/// An ordered list of rules. Earlier rules take priority: at each node the
/// first rule that fires wins.
pub struct Pass {
    name: String,
    rules: Vec<Box<dyn Rule>>,
    max_iterations: usize,
}

impl Pass {
    pub fn new(name: &str) -> Self {
        Pass {
            name: name.to_string(),
            rules: Vec::new(),
            max_iterations: DEFAULT_MAX_ITERATIONS,
        }
    }

    pub fn with_rule(self, rule: impl Rule + 'static) -> Self {
        self.with_boxed_rule(Box::new(rule))
    }

    pub fn with_boxed_rule(mut self, rule: Box<dyn Rule>) -> Self {
        self.rules.push(rule);
        self
    }

    /// Bound on the number of sweeps [`Pass::run`] makes before giving up.
    pub fn with_max_iterations(mut self, n: usize) -> Self {
        self.max_iterations = n;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn rule_names(&self) -> Vec<&'static str> {
        self.rules.iter().map(|rule| rule.name()).collect()
    }

    /// Try every rule at `node`, in order, and return the first rewrite.
    ///
    /// Nothing is committed. A rule that fails (say, by reaching into a scope
    /// it cannot see) is logged and skipped; the remaining rules still get
    /// their turn. Nodes allocated by failed or declining attempts are
    /// detached again before the next rule runs.
    pub fn apply_at(&self, graph: &mut Graph, node: NodeId) -> Option<Fired> {
        for rule in &self.rules {
            let watermark = graph.len();
            let mut builder = Builder::new(graph);
            match rule.try_rewrite(&mut builder, node) {
                Ok(Some(rewrite)) => {
                    if rewrite.replacement != node || !rewrite.patches.is_empty() {
                        return Some(Fired {
                            rule: rule.name(),
                            rewrite,
                        });
                    }
                }
                Ok(None) => (),
                Err(e) => warn!("{}: rule {} aborted at {}: {}", self.name, rule.name(), node, e),
            }
            graph.release_unused_since(watermark);
        }
        None
    }

    /// Rewrite `graph` until no rule fires anywhere.
    ///
    /// Fails with `IterationCapExceeded` when the graph is still changing
    /// after the configured number of sweeps, which usually means two rules
    /// undo each other.
    pub fn run(&self, graph: &mut Graph) -> Result<PassReport> {
        let mut report = PassReport::default();
        while report.iterations < self.max_iterations {
            report.iterations += 1;
            if self.sweep(graph, &mut report) == 0 {
                info!(
                    "{}: converged after {} iterations, {} rewrites",
                    self.name, report.iterations, report.rewrites
                );
                return Ok(report);
            }
        }
        info!(
            "{}: no fixed point after {} iterations, {} rewrites",
            self.name, report.iterations, report.rewrites
        );
        IterationCapExceededSnafu {
            iterations: report.iterations,
            rewrites: report.rewrites,
        }
        .fail()
    }

    /// One visit of every live node, operands first. Nodes next to a
    /// committed rewrite are visited again within the same sweep, up to as
    /// many extra visits as there were live nodes to begin with.
    ///
    /// The whole arena is collected once, up front; commits detach what they
    /// orphan as they go.
    fn sweep(&self, graph: &mut Graph, report: &mut PassReport) -> usize {
        let mut queue: VecDeque<NodeId> = graph.collect_garbage().into_iter().collect();
        let mut queued: HashSet<NodeId> = queue.iter().copied().collect();
        let mut budget = queue.len();
        let mut rewrites = 0;

        while let Some(node) = queue.pop_front() {
            queued.remove(&node);
            if !graph.is_attached(node) || !graph.node(node).is_call() {
                continue;
            }
            let allocated = graph.len();
            let fired = match self.apply_at(graph, node) {
                Some(fired) => fired,
                None => continue,
            };
            let committed = commit(graph, node, &fired.rewrite);
            graph.release_unused_since(allocated);
            if let Err(e) = committed {
                warn!("{}: could not commit {} at {}: {}", self.name, fired.rule, node, e);
                continue;
            }
            debug!(
                "{}: {} rewrote {} to {}",
                self.name, fired.rule, node, fired.rewrite.replacement
            );
            rewrites += 1;
            report.rewrites += 1;
            *report.fired.entry(fired.rule).or_insert(0) += 1;

            let replacement = fired.rewrite.replacement;
            let neighbours: Vec<NodeId> = std::iter::once(replacement)
                .chain(graph.args(replacement).iter().copied())
                .chain(graph.users(replacement))
                .collect();
            for neighbour in neighbours {
                if budget == 0 {
                    break;
                }
                if queued.insert(neighbour) {
                    queue.push_back(neighbour);
                    budget -= 1;
                }
            }
        }
        rewrites
    }
}

/// Validate the whole rewrite, then apply it: the anchor's uses move to the
/// replacement first, then the patches run in order.
fn commit(graph: &mut Graph, anchor: NodeId, rewrite: &Rewrite) -> Result<()> {
    graph.check_replace_uses(anchor, rewrite.replacement)?;
    for patch in &rewrite.patches {
        match patch {
            EdgePatch::RewireConsumersExcept {
                source,
                target,
                exempt,
            } => graph.check_rewire(*source, *target, *exempt)?,
        }
    }

    graph.replace_uses(anchor, rewrite.replacement)?;
    for patch in &rewrite.patches {
        match patch {
            EdgePatch::RewireConsumersExcept {
                source,
                target,
                exempt,
            } => {
                let moved = graph.rewire_consumers_except(*source, *target, *exempt)?;
                debug!(
                    "rewired {} consumers of {} to {} (kept {})",
                    moved, source, target, exempt
                );
            }
        }
    }
    Ok(())
}
