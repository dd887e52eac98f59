use std::{collections::HashMap, fmt};

use log::debug;
use serde::{Deserialize, Serialize};

use crate::error::{BackendError, Result};

/// The kinds of resources a worker slot can be carved from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ResourceKind {
    Gpu,
    Cpu,
}

impl ResourceKind {
    /// The name under which the cluster advertises this resource.
    pub fn as_str(self) -> &'static str {
        match self {
            ResourceKind::Gpu => "GPU",
            ResourceKind::Cpu => "CPU",
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Immutable snapshot of the resources a single node advertises.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeResourceReport {
    pub node_id: String,
    pub resources: HashMap<String, f64>,
}

impl NodeResourceReport {
    /// Creates a new `NodeResourceReport`.
    ///
    /// # Args
    /// * `node_id` - The cluster-wide identifier of the node.
    /// * `resources` - Pairs of resource name and available amount.
    ///
    /// # Returns
    /// A new `NodeResourceReport` instance.
    pub fn new<I, K>(node_id: impl Into<String>, resources: I) -> Self
    where
        I: IntoIterator<Item = (K, f64)>,
        K: Into<String>,
    {
        Self {
            node_id: node_id.into(),
            resources: resources.into_iter().map(|(k, v)| (k.into(), v)).collect(),
        }
    }

    /// The whole number of slots of `kind` this node offers, fractions are truncated.
    pub fn slots(&self, kind: ResourceKind) -> usize {
        self.resources
            .get(kind.as_str())
            .filter(|amount| amount.is_finite() && **amount > 0.0)
            .map_or(0, |amount| amount.trunc() as usize)
    }
}

/// A set of nodes that all offer the same amount of slots of one resource kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceBucket {
    pub kind: ResourceKind,
    pub slots_per_node: usize,
    pub node_count: usize,
    pub node_ids: Vec<String>,
}

impl ResourceBucket {
    /// Whether this bucket schedules workers on GPUs.
    pub fn use_gpu(&self) -> bool {
        self.kind == ResourceKind::Gpu
    }

    /// The total amount of slots in the bucket, saturating at `usize::MAX`.
    pub fn total_slots(&self) -> usize {
        self.slots_per_node.saturating_mul(self.node_count)
    }
}

/// Picks the largest homogeneous slot configuration out of a heterogeneous cluster.
pub struct ResourceBucketer {
    reports: Vec<NodeResourceReport>,
}

impl ResourceBucketer {
    /// Creates a new `ResourceBucketer`.
    ///
    /// # Args
    /// * `reports` - The resource reports of every node in the cluster.
    ///
    /// # Returns
    /// A new `ResourceBucketer` instance.
    pub fn new(reports: Vec<NodeResourceReport>) -> Self {
        Self { reports }
    }

    /// Sums the amount of `kind` available across the whole cluster, saturating at
    /// `usize::MAX`.
    pub fn cluster_total(&self, kind: ResourceKind) -> usize {
        self.reports
            .iter()
            .fold(0, |total, report| total.saturating_add(report.slots(kind)))
    }

    /// The resource kind workers are carved from: GPUs whenever the cluster has any.
    pub fn target_kind(&self) -> ResourceKind {
        if self.cluster_total(ResourceKind::Gpu) > 0 {
            ResourceKind::Gpu
        } else {
            ResourceKind::Cpu
        }
    }

    /// Groups the nodes by their slot count and keeps the bucket that maximizes
    /// `slots_per_node * node_count`. Ties resolve to the bucket seen first.
    ///
    /// # Returns
    /// The winning bucket or `ResourceDiscovery` if there are no reports.
    pub fn select(&self) -> Result<ResourceBucket> {
        if self.reports.is_empty() {
            return Err(BackendError::ResourceDiscovery(
                "the cluster reported no nodes".into(),
            ));
        }

        let kind = self.target_kind();

        // Kept as a vec so that iteration follows first-seen order.
        let mut buckets: Vec<(usize, Vec<&str>)> = Vec::new();
        for report in &self.reports {
            let slots = report.slots(kind);
            match buckets.iter_mut().find(|(s, _)| *s == slots) {
                Some((_, nodes)) => nodes.push(&report.node_id),
                None => buckets.push((slots, vec![&report.node_id])),
            }
        }

        if buckets.iter().any(|(slots, _)| *slots > 0) {
            buckets.retain(|(slots, _)| *slots > 0);
        }

        let mut best: Option<&(usize, Vec<&str>)> = None;
        for bucket in &buckets {
            let score = bucket.0.saturating_mul(bucket.1.len());
            if best.is_none_or(|(slots, nodes)| score > slots.saturating_mul(nodes.len())) {
                best = Some(bucket);
            }
        }

        let (slots, nodes) = best.ok_or_else(|| {
            BackendError::ResourceDiscovery(format!("no node advertises any {kind}"))
        })?;

        debug!(
            kind = kind.as_str(), slots = *slots, nodes = nodes.len();
            "selected resource bucket"
        );

        Ok(ResourceBucket {
            kind,
            slots_per_node: *slots,
            node_count: nodes.len(),
            node_ids: nodes.iter().map(|id| id.to_string()).collect(),
        })
    }
}
