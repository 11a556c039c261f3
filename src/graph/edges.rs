//! Edge variants and routing predicates.
//!
//! Edges translate each outgoing message of a step into zero or more
//! targeted deliveries for the next step. Expansion is deterministic: given
//! the same outgoing messages and the same edge graph, the produced
//! deliveries are identical. Tie-breaks follow declaration order.

use std::sync::Arc;

use serde_json::Value;

use crate::envelope::Envelope;
use crate::types::ExecutorId;

/// Predicate evaluated against an outgoing envelope to decide routing.
///
/// Receives the full envelope so predicates can inspect the payload, the
/// declared type, and the producing executor.
///
/// # Examples
///
/// ```
/// use relaygraph::graph::EdgePredicate;
/// use std::sync::Arc;
///
/// let over_threshold: EdgePredicate = Arc::new(|env| {
///     env.payload.as_i64().map(|n| n > 10).unwrap_or(false)
/// });
/// ```
pub type EdgePredicate = Arc<dyn Fn(&Envelope) -> bool + Send + Sync + 'static>;

/// Completion predicate for fan-in edges.
///
/// Receives the contributions gathered so far, in source-declaration order
/// (`None` for sources that have not fired). Returning `true` fires the
/// aggregate early with the partial set.
pub type FanInPredicate = Arc<dyn Fn(&[Option<Value>]) -> bool + Send + Sync + 'static>;

/// Saturation behavior of a fan-out edge.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FanOutMode {
    /// Strict broadcast: every target must match (unconditional targets
    /// always match); if any predicate rejects, nothing is delivered.
    All,
    /// Deliver to every target whose predicate matches. The default.
    AnyMatching,
    /// Deliver to the first matching target only.
    FirstMatching,
}

/// One target of a fan-out edge, with an optional condition.
#[derive(Clone)]
pub struct FanOutTarget {
    pub target: ExecutorId,
    pub predicate: Option<EdgePredicate>,
}

impl FanOutTarget {
    #[must_use]
    pub fn unconditional(target: impl Into<ExecutorId>) -> Self {
        Self {
            target: target.into(),
            predicate: None,
        }
    }

    #[must_use]
    pub fn conditional(target: impl Into<ExecutorId>, predicate: EdgePredicate) -> Self {
        Self {
            target: target.into(),
            predicate: Some(predicate),
        }
    }

    pub(crate) fn matches(&self, envelope: &Envelope) -> bool {
        self.predicate.as_ref().map_or(true, |p| p(envelope))
    }
}

/// One case of a switch-case edge.
#[derive(Clone)]
pub struct SwitchCase {
    pub predicate: EdgePredicate,
    pub target: ExecutorId,
}

/// Routing element of the workflow graph.
#[derive(Clone)]
pub enum Edge {
    /// Unconditional `source → target`.
    Direct {
        source: ExecutorId,
        target: ExecutorId,
    },
    /// `source → target` gated by a predicate.
    Conditional {
        source: ExecutorId,
        target: ExecutorId,
        predicate: EdgePredicate,
    },
    /// `source → {targets}` with per-target conditions and a saturation mode.
    FanOut {
        source: ExecutorId,
        targets: Vec<FanOutTarget>,
        mode: FanOutMode,
    },
    /// `{sources} → target`; fires when every source has contributed within
    /// one superstep, or earlier when the completion predicate passes. The
    /// aggregate payload is a JSON array in source-declaration order.
    FanIn {
        sources: Vec<ExecutorId>,
        target: ExecutorId,
        completion: Option<FanInPredicate>,
    },
    /// `source → cases + default`; first matching case wins, at most one
    /// target receives a delivery.
    Switch {
        source: ExecutorId,
        cases: Vec<SwitchCase>,
        default: Option<ExecutorId>,
    },
}

impl Edge {
    /// The executor whose sends this edge consumes. Fan-in edges consume
    /// from several sources and return `None` here.
    #[must_use]
    pub fn single_source(&self) -> Option<&ExecutorId> {
        match self {
            Edge::Direct { source, .. }
            | Edge::Conditional { source, .. }
            | Edge::FanOut { source, .. }
            | Edge::Switch { source, .. } => Some(source),
            Edge::FanIn { .. } => None,
        }
    }

    /// Every executor id this edge references, sources and targets alike.
    pub(crate) fn referenced_ids(&self) -> Vec<&ExecutorId> {
        match self {
            Edge::Direct { source, target } | Edge::Conditional { source, target, .. } => {
                vec![source, target]
            }
            Edge::FanOut { source, targets, .. } => {
                let mut ids = vec![source];
                ids.extend(targets.iter().map(|t| &t.target));
                ids
            }
            Edge::FanIn {
                sources, target, ..
            } => {
                let mut ids: Vec<&ExecutorId> = sources.iter().collect();
                ids.push(target);
                ids
            }
            Edge::Switch {
                source,
                cases,
                default,
            } => {
                let mut ids = vec![source];
                ids.extend(cases.iter().map(|c| &c.target));
                if let Some(d) = default {
                    ids.push(d);
                }
                ids
            }
        }
    }
}

impl std::fmt::Debug for Edge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Edge::Direct { source, target } => write!(f, "Direct({source} -> {target})"),
            Edge::Conditional { source, target, .. } => {
                write!(f, "Conditional({source} -> {target})")
            }
            Edge::FanOut {
                source,
                targets,
                mode,
            } => write!(
                f,
                "FanOut({source} -> {:?}, {mode:?})",
                targets.iter().map(|t| t.target.as_str()).collect::<Vec<_>>()
            ),
            Edge::FanIn {
                sources, target, ..
            } => write!(
                f,
                "FanIn({:?} -> {target})",
                sources.iter().map(ExecutorId::as_str).collect::<Vec<_>>()
            ),
            Edge::Switch { source, cases, default } => write!(
                f,
                "Switch({source} -> {} cases, default {:?})",
                cases.len(),
                default.as_ref().map(ExecutorId::as_str)
            ),
        }
    }
}

/// Builder for switch-case edges; cases fire in declaration order.
#[derive(Default)]
pub struct SwitchBuilder {
    cases: Vec<SwitchCase>,
    default: Option<ExecutorId>,
}

impl SwitchBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn case(mut self, predicate: EdgePredicate, target: impl Into<ExecutorId>) -> Self {
        self.cases.push(SwitchCase {
            predicate,
            target: target.into(),
        });
        self
    }

    #[must_use]
    pub fn default_target(mut self, target: impl Into<ExecutorId>) -> Self {
        self.default = Some(target.into());
        self
    }

    pub(crate) fn into_parts(self) -> (Vec<SwitchCase>, Option<ExecutorId>) {
        (self.cases, self.default)
    }
}
