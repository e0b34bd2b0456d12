use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::errors::*;

pub const PHASE_PENDING: &str = "Pending";
pub const PHASE_PROCESSING: &str = "Processing";
pub const PHASE_FINISHED: &str = "Finished";

pub const OP_TYPE_CREATE: &str = "create";
pub const OP_TYPE_DELETE: &str = "delete";
pub const OP_TYPE_REPLACE: &str = "replace";

/// A requested change to the cluster's replication topology. The spec is
/// immutable once created; all progress lives in the status subresource.
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "chainctl.io",
    version = "v1",
    kind = "ChainTableOp",
    status = "ChainTableOpStatus",
    shortname = "cto",
    namespaced,
    printcolumn = r#"{"name":"Process","type":"string","jsonPath":".status.process"}"#,
    printcolumn = r#"{"name":"Status","type":"string","jsonPath":".status.phase"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ChainTableOpSpec {
    pub cluster_name: String,
    pub cluster_namespace: String,
    #[serde(default)]
    pub new_node: Vec<String>,
    #[serde(default)]
    pub old_node: Vec<String>,
    /// One of "create", "delete", "replace".
    #[serde(rename = "type")]
    pub op_type: String,
    /// Skips the wait for old targets to report OFFLINE. Operator-declared
    /// override for nodes that are already dead.
    #[serde(default)]
    pub force: bool,
}

/// The durable checkpoint of a running operation: a crashed pass resumes
/// from these fields plus a fresh read of the live chain table.
#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ChainTableOpStatus {
    /// Pending, Processing or Finished.
    pub phase: Option<String>,

    /// Last attempted step, for the operator watching a stalled run.
    pub process: Option<String>,

    /// `chainId@targetId` pairs currently being mutated. Persisted before
    /// the first mutation so a resumed pass never has to recompute them from
    /// a half-rewritten chain table.
    #[serde(default)]
    pub process_chain_ids: Vec<String>,

    /// Set once the requested change has fully converged.
    #[serde(default)]
    pub executed: bool,
}

/// Storage-cluster shape consumed by the workflow. The cluster object is
/// owned elsewhere; only these fields are read here.
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "chainctl.io",
    version = "v1",
    kind = "StorageCluster",
    shortname = "sc",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct StorageClusterSpec {
    /// Targets per chain (fault-tolerance degree).
    pub replica: usize,
    /// Minimum number of chains the distribution scheme needs.
    pub stripe_size: usize,
    /// Mount points of the physical disks on each storage node.
    pub target_paths: Vec<String>,
    pub target_per_disk: usize,
    #[serde(default)]
    pub chain_table_id: Option<String>,
}

/// Minimum node count for a growth operation.
const MIN_CREATE_NODES: usize = 3;

/// Chain arithmetic shared with the admission webhook: the target count must
/// divide evenly into chains and yield at least one full stripe.
pub fn validate_create_arithmetic(
    new_nodes: usize,
    disks_per_node: usize,
    targets_per_disk: usize,
    replica: usize,
    stripe_size: usize,
) -> Result<()> {
    if replica == 0 {
        return Err(ErrorKind::InvalidSpec("replica must be positive".to_string()).into());
    }
    let min_nodes = MIN_CREATE_NODES.max(replica);
    if new_nodes < min_nodes {
        return Err(ErrorKind::InvalidSpec(format!(
            "newNode count {} is less than {}",
            new_nodes, min_nodes
        ))
        .into());
    }
    let target_num = new_nodes * disks_per_node * targets_per_disk;
    if target_num % replica != 0 {
        return Err(ErrorKind::InvalidSpec(format!(
            "target count {} is not divisible by replica {}",
            target_num, replica
        ))
        .into());
    }
    let chain_num = target_num / replica;
    if chain_num < stripe_size {
        return Err(ErrorKind::InvalidSpec(format!(
            "stripe size {} must be less or equal than chain num {}",
            stripe_size, chain_num
        ))
        .into());
    }
    Ok(())
}

/// A replacement swaps exactly one node for exactly one other.
pub fn validate_replace_nodes(old_node: &[String], new_node: &[String]) -> Result<()> {
    if old_node.len() != 1 || new_node.len() != 1 {
        return Err(ErrorKind::InvalidSpec(
            "oldNode or newNode is empty or more than 1".to_string(),
        )
        .into());
    }
    if old_node[0] == new_node[0] {
        return Err(ErrorKind::InvalidSpec(format!(
            "oldNode {} is already used in newNode list",
            old_node[0]
        ))
        .into());
    }
    Ok(())
}

/// Pre-mutation validation of one operation against its cluster. Delete is
/// validated for shape but then rejected outright; see the controller notes.
pub fn validate_op(spec: &ChainTableOpSpec, cluster: &StorageClusterSpec) -> Result<()> {
    match spec.op_type.as_str() {
        OP_TYPE_CREATE => validate_create_arithmetic(
            spec.new_node.len(),
            cluster.target_paths.len(),
            cluster.target_per_disk,
            cluster.replica,
            cluster.stripe_size,
        ),
        OP_TYPE_REPLACE => validate_replace_nodes(&spec.old_node, &spec.new_node),
        OP_TYPE_DELETE => {
            if spec.old_node.is_empty() {
                return Err(ErrorKind::InvalidSpec("oldNode is empty".to_string()).into());
            }
            Err(ErrorKind::UnsupportedOperation(spec.op_type.clone()).into())
        }
        other => Err(ErrorKind::InvalidSpec(format!("type {} is invalid", other)).into()),
    }
}
