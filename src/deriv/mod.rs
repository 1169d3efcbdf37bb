//! Derived metrics: expressions over real metrics, evaluated against
//! each fetch result.
//!
//! An expression is registered once, parsed immediately, and bound
//! lazily on the first fetch that mentions its metric id.  Binding
//! fails soft: an unbindable expression yields no values, just like a
//! metric absent from an agent.

use fxhash::FxHashMap;
use regex::Regex;
use tracing::debug;

use crate::desc::{Descriptor, MetricType, Semantics};
use crate::error::{Error, Result};
use crate::ident::{IndomId, InstId, MetricId};
use crate::timestamp::Timestamp;
use crate::units::Units;
use crate::value::{BinOp, Value};

mod bind;
mod eval;
mod fetch;
mod parse;

pub use parse::parse_expr;

/// Evaluations of a regex filter between garbage-collection passes.
pub const REGEX_INST_COMPACT: u32 = 16;

/// Access to metric metadata, implemented by live and archive contexts.
pub trait MetadataSource {
    fn desc(&self, pmid: MetricId) -> Result<Descriptor>;
    fn pmid(&self, name: &str) -> Result<MetricId>;
    /// Map an external instance name to its id within `indom`.
    fn lookup_inst(&self, indom: IndomId, name: &str, at: Option<Timestamp>) -> Result<InstId>;
    /// Map an instance id to its external name within `indom`.
    fn inst_name(&self, indom: IndomId, inst: InstId, at: Option<Timestamp>) -> Result<String>;
    /// Changes whenever the indom record answering queries at `at`
    /// changes; lets exact-match filters invalidate cached instance
    /// ids on dynamic indoms.
    fn indom_generation(&self, _indom: IndomId, _at: Option<Timestamp>) -> u64 {
        0
    }
}

/// One instance-value pair in a node's current or previous fetch
/// result.
#[derive(Clone, Debug, PartialEq)]
pub struct IVal {
    pub inst: InstId,
    pub value: Value,
}

/// Instance filter payload of a `Pattern` node.
#[derive(Debug)]
pub enum Pattern {
    /// Match exactly one instance by external name.  The resolved id is
    /// cached together with the indom generation that produced it.
    Exact {
        name: String,
        cached: Option<(InstId, u64)>,
    },
    /// Regular-expression match over external names, with a usage-
    /// counted cache of seen instances for dynamic indoms.
    Regex {
        re: Regex,
        invert: bool,
        seen: FxHashMap<InstId, InstUsage>,
        used: u32,
    },
}

#[derive(Clone, Copy, Debug)]
pub struct InstUsage {
    pub matched: bool,
    pub used: u32,
}

/// Expression node variants.
#[derive(Debug)]
pub enum NodeKind {
    Integer(String),
    Double(String),
    Name(String),
    Scale(Units),
    Pattern(Pattern),
    Defined(String),
    Anon(MetricType),
    Neg,
    Not,
    Bin(BinOp),
    Quest,
    Colon,
    Avg,
    Count,
    Sum,
    Max,
    Min,
    Scalar,
    Delta,
    Rate,
    Instant,
    Rescale,
    FilterInst,
}

/// Per-node evaluation state.
#[derive(Debug)]
pub struct NodeInfo {
    /// Real metric id for Name nodes; NULL elsewhere.
    pub pmid: MetricId,
    pub ivlist: Vec<IVal>,
    /// Previous generation of `ivlist`; kept only under delta/rate.
    pub last_ivlist: Option<Vec<IVal>>,
    pub stamp: Timestamp,
    pub last_stamp: Timestamp,
    /// Counter-to-seconds factor for rate(); computed on first use.
    pub time_scale: Option<f64>,
    /// Unit-normalisation multiplier applied when this node is an
    /// operand of a double-typed binary operation.
    pub scale: f64,
    /// Set on the operand of delta()/rate(): the old value list is
    /// captured as the previous generation instead of freed.
    pub save_last: bool,
    /// Literal nodes parse their lexeme once, on first evaluation.
    pub parsed: bool,
}

impl Default for NodeInfo {
    fn default() -> NodeInfo {
        NodeInfo {
            pmid: MetricId::NULL,
            ivlist: Vec::new(),
            last_ivlist: None,
            stamp: Timestamp::default(),
            last_stamp: Timestamp::default(),
            time_scale: None,
            scale: 1.0,
            save_last: false,
            parsed: false,
        }
    }
}

/// A node in an expression tree.  Trees are strictly trees; children
/// are owned exclusively.
#[derive(Debug)]
pub struct Node {
    pub kind: NodeKind,
    pub left: Option<Box<Node>>,
    pub right: Option<Box<Node>>,
    pub desc: Descriptor,
    pub info: NodeInfo,
}

impl Node {
    pub fn new(kind: NodeKind) -> Node {
        Node {
            kind,
            left: None,
            right: None,
            desc: Descriptor {
                pmid: MetricId::NULL,
                typ: MetricType::NoSupport,
                indom: IndomId::NULL,
                sem: Semantics::Instant,
                units: Units::NONE,
            },
            info: NodeInfo::default(),
        }
    }

    pub fn unary(kind: NodeKind, operand: Node) -> Node {
        let mut node = Node::new(kind);
        node.left = Some(Box::new(operand));
        node
    }

    pub fn binary(kind: NodeKind, left: Node, right: Node) -> Node {
        let mut node = Node::new(kind);
        node.left = Some(Box::new(left));
        node.right = Some(Box::new(right));
        node
    }

    /// Collect the real-metric ids referenced by this tree.
    pub fn operand_pmids(&self, out: &mut Vec<MetricId>) {
        if let Some(left) = &self.left {
            left.operand_pmids(out);
        }
        if let Some(right) = &self.right {
            right.operand_pmids(out);
        }
        if let NodeKind::Name(_) = self.kind {
            out.push(self.info.pmid);
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum BindState {
    Unbound,
    Bound,
    Failed,
}

struct DerivedMetric {
    pmid: MetricId,
    name: String,
    expr: Node,
    state: BindState,
}

/// The per-context registry of derived metrics, and the bookkeeping
/// carried from pre-fetch to post-fetch.
#[derive(Default)]
pub struct DerivedRegistry {
    metrics: Vec<DerivedMetric>,
    /// Number of metric ids in the caller's fetch list, saved by
    /// prefetch for the post-fetch rewrite.  Fetches on one context
    /// cannot be nested, so a single slot is enough.
    fetch_numpmid: usize,
    fetch_has_dm: bool,
}

impl DerivedRegistry {
    pub fn new() -> DerivedRegistry {
        DerivedRegistry::default()
    }

    /// Parse and register an expression under `name`.  Returns the
    /// derived metric id allocated for it.
    pub fn register(&mut self, name: &str, expr: &str) -> Result<MetricId> {
        let tree = parse::parse_expr(expr)?;
        let pmid = MetricId::derived(self.metrics.len() as u32 + 1);
        debug!(%pmid, name, "registered derived metric");
        self.metrics.push(DerivedMetric {
            pmid,
            name: name.to_string(),
            expr: tree,
            state: BindState::Unbound,
        });
        Ok(pmid)
    }

    pub fn lookup(&self, name: &str) -> Option<MetricId> {
        self.metrics
            .iter()
            .find(|m| m.name == name)
            .map(|m| m.pmid)
    }

    pub fn desc(&self, pmid: MetricId) -> Result<Descriptor> {
        let metric = self
            .metrics
            .iter()
            .find(|m| m.pmid == pmid && m.state == BindState::Bound)
            .ok_or(Error::NoSuchMetric)?;
        let mut desc = metric.expr.desc;
        desc.pmid = pmid;
        Ok(desc)
    }

    pub fn is_empty(&self) -> bool {
        self.metrics.is_empty()
    }
}
