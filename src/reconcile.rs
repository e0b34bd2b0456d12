use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use kube::api::{Api, Patch, PatchParams};
use kube::client::Client;
use kube::ResourceExt;
use kube_runtime::controller::Action;
use log::info;
use serde_json::json;

use crate::admin_cli::AdminCli;
use crate::config::Config;
use crate::crd::{
    validate_op, ChainTableOp, StorageCluster, OP_TYPE_CREATE, OP_TYPE_REPLACE, PHASE_FINISHED,
    PHASE_PROCESSING,
};
use crate::errors::*;
use crate::merge;
use crate::placement::{PlacementParams, FRAGMENT_CHAINS_FILE, FRAGMENT_CHAIN_TABLE_FILE};
use crate::topology::{self, NODE_TYPE_STORAGE, TARGET_STATE_OFFLINE, TARGET_STATE_SERVING};

pub const PROCESS_ALLOCATING_IDS: &str = "allocating-ids";
pub const PROCESS_GENERATING_PLACEMENT: &str = "generating-placement";
pub const PROCESS_MERGING_FRAGMENT: &str = "merging-fragment";
pub const PROCESS_CREATING_TARGETS: &str = "creating-targets";
pub const PROCESS_UPLOADING_CHAIN_TABLE: &str = "uploading-chain-table";
pub const PROCESS_OFFLINING_OLD_TARGETS: &str = "offlining-old-targets";
pub const PROCESS_REMOVING_OLD_TARGETS: &str = "removing-old-targets";
pub const PROCESS_ADDING_NEW_TARGETS: &str = "adding-new-targets";
pub const PROCESS_VERIFYING: &str = "verifying";

/// Id prefixes the placement generator stamps onto fresh targets and chains.
const TARGET_ID_PREFIX: u32 = 1;
const CHAIN_ID_PREFIX: u32 = 9;

/// Drives one ChainTableOp from Pending to Finished. Every pass is written to
/// be re-entrant: steps are either idempotent against the admin tool or
/// checkpointed through the status subresource, so the controller can requeue
/// after any failure and pick up where the last pass stopped.
#[derive(Clone)]
pub struct ChainTableReconciler {
    client: Client,
    config: Config,
}

impl ChainTableReconciler {
    pub fn new(client: Client, config: Config) -> Self {
        ChainTableReconciler { client, config }
    }

    fn requeue(&self) -> Action {
        Action::requeue(Duration::from_secs(self.config.requeue_seconds))
    }

    pub async fn reconcile(&self, op: Arc<ChainTableOp>) -> Result<Action> {
        let name = op.name_any();
        let status = op.status.clone().unwrap_or_default();
        if status.executed || status.phase.as_deref() == Some(PHASE_FINISHED) {
            return Ok(Action::await_change());
        }

        let cluster: StorageCluster =
            Api::namespaced(self.client.clone(), &op.spec.cluster_namespace)
                .get(&op.spec.cluster_name)
                .await?;
        validate_op(&op.spec, &cluster.spec)?;

        if status.phase.as_deref() != Some(PHASE_PROCESSING) {
            self.update_phase(&op, PHASE_PROCESSING).await?;
        }

        info!("reconcile {} type {}", name, op.spec.op_type);
        match op.spec.op_type.as_str() {
            OP_TYPE_CREATE => self.handle_create(&op, &cluster).await,
            OP_TYPE_REPLACE => self.handle_replace(&op).await,
            other => Err(ErrorKind::UnsupportedOperation(other.to_string()).into()),
        }
    }

    /// Grows the chain table onto a set of freshly provisioned nodes.
    async fn handle_create(&self, op: &ChainTableOp, cluster: &StorageCluster) -> Result<Action> {
        let admin_cli = self.config.admin_cli();
        let token = self.config.token.as_str();
        let status = op.status.clone().unwrap_or_default();

        // Once the fragment is live, regenerating it would renumber past the
        // grown high-water marks and upload a second set of chains against
        // the same target ids. A resumed pass skips straight to verification
        // when it recorded the verifying checkpoint, or when the new nodes'
        // chains are already in the table.
        let process = status.process.as_deref();
        let chains_live = match process {
            None | Some(PROCESS_VERIFYING) => false,
            Some(_) => {
                self.new_node_chains_live(&admin_cli, &op.spec.new_node)
                    .await?
            }
        };
        if resume_at_verify(process, chains_live) {
            if process != Some(PROCESS_VERIFYING) {
                self.update_process(op, PROCESS_VERIFYING).await?;
            }
            return self.verify_create(op, &admin_cli).await;
        }

        self.update_process(op, PROCESS_ALLOCATING_IDS).await?;
        let node_ids = self.ensure_node_ids(&admin_cli, &op.spec.new_node).await?;
        let (node_id_begin, node_id_end) = contiguous_range(&node_ids)?;

        self.update_process(op, PROCESS_GENERATING_PLACEMENT).await?;
        let disks_per_node = cluster.spec.target_paths.len();
        let fragment = self
            .config
            .placement()
            .generate(&PlacementParams {
                num_nodes: op.spec.new_node.len(),
                replica: cluster.spec.replica,
                targets_per_disk: cluster.spec.target_per_disk,
                disks_per_node,
                node_id_begin,
                node_id_end,
                target_id_prefix: TARGET_ID_PREFIX,
                chain_id_prefix: CHAIN_ID_PREFIX,
            })
            .await?;

        self.update_process(op, PROCESS_MERGING_FRAGMENT).await?;
        let live_chains = topology::parse_chain_table(&admin_cli.list_chains().await?);
        let offsets = merge::merge_offsets(&live_chains);
        let merged_dir = Path::new(&self.config.output_dir).join("merged");
        let merged = merge::merge_fragment(
            &fragment.targets_path,
            &fragment.chains_path,
            &fragment.chain_table_path,
            &offsets,
            &merged_dir,
        )?;

        self.update_process(op, PROCESS_CREATING_TARGETS).await?;
        admin_cli
            .create_target(token, &merged.targets_path.display().to_string())
            .await?;

        self.update_process(op, PROCESS_UPLOADING_CHAIN_TABLE).await?;
        if live_chains.is_empty() {
            // Nothing uploaded yet: the fragment is the whole table.
            admin_cli
                .upload_chains(token, &merged.chains_path.display().to_string())
                .await?;
            admin_cli
                .upload_chain_table(token, &merged.chain_table_path.display().to_string())
                .await?;
        } else {
            let chains = self
                .grow_csv(&admin_cli, token, FRAGMENT_CHAINS_FILE, &merged.chains_path, false)
                .await?;
            admin_cli
                .upload_chains(token, &chains.display().to_string())
                .await?;
            let table = self
                .grow_csv(
                    &admin_cli,
                    token,
                    FRAGMENT_CHAIN_TABLE_FILE,
                    &merged.chain_table_path,
                    true,
                )
                .await?;
            admin_cli
                .upload_chain_table(token, &table.display().to_string())
                .await?;
        }

        self.update_process(op, PROCESS_VERIFYING).await?;
        self.verify_create(op, &admin_cli).await
    }

    /// Dumps the live file and appends the merged fragment to it, so the
    /// upload always carries the full table.
    async fn grow_csv(
        &self,
        admin_cli: &AdminCli,
        token: &str,
        name: &str,
        merged: &Path,
        chain_table: bool,
    ) -> Result<PathBuf> {
        let out_dir = Path::new(&self.config.output_dir).join("merged");
        let dumped = out_dir.join(format!("dumped_{}", name));
        let dumped_str = dumped.display().to_string();
        if chain_table {
            admin_cli.dump_chain_table(token, &dumped_str).await?;
        } else {
            admin_cli.dump_chains(token, &dumped_str).await?;
        }
        let combined = out_dir.join(format!("combined_{}", name));
        merge::merge_csv_files(&dumped, merged, &combined)?;
        Ok(combined)
    }

    async fn verify_create(&self, op: &ChainTableOp, admin_cli: &AdminCli) -> Result<Action> {
        for node_name in &op.spec.new_node {
            let chains = topology::chains_with_node(admin_cli, node_name).await?;
            if chains.is_empty() {
                bail!("no chains found for new node {}", node_name);
            }
            let converged = topology::check_chain_with_status(&chains, TARGET_STATE_SERVING);
            if converged != chains.len() {
                info!(
                    "node {}: {}/{} chains serving, requeue",
                    node_name,
                    converged,
                    chains.len()
                );
                return Ok(self.requeue());
            }
        }
        self.finish(op).await
    }

    /// True when every new node is registered and already owns chains in the
    /// live table, i.e. an earlier pass got its fragment uploaded.
    async fn new_node_chains_live(
        &self,
        admin_cli: &AdminCli,
        node_names: &[String],
    ) -> Result<bool> {
        for node_name in node_names {
            match topology::chains_with_node(admin_cli, node_name).await {
                Ok(chains) if !chains.is_empty() => {}
                Ok(_) => return Ok(false),
                Err(Error(ErrorKind::NodeNotFound(_), _)) => return Ok(false),
                Err(e) => return Err(e),
            }
        }
        Ok(true)
    }

    /// Resolves each node name against the registry; unregistered nodes get
    /// the next free id and are registered under it.
    async fn ensure_node_ids(&self, admin_cli: &AdminCli, node_names: &[String]) -> Result<Vec<u32>> {
        let mut ids = Vec::with_capacity(node_names.len());
        for node_name in node_names {
            match topology::resolve_node_id(admin_cli, NODE_TYPE_STORAGE, node_name).await {
                Ok(id) => ids.push(id),
                Err(Error(ErrorKind::NodeNotFound(_), _)) => {
                    let id = topology::allocate_node_id(
                        admin_cli,
                        NODE_TYPE_STORAGE,
                        self.config.storage_start_node_id,
                    )
                    .await?;
                    admin_cli.register_node(id, NODE_TYPE_STORAGE).await?;
                    info!("registered node {} as {}", node_name, id);
                    ids.push(id);
                }
                Err(e) => return Err(e),
            }
        }
        ids.sort_unstable();
        Ok(ids)
    }

    /// Moves every replica slot of the old node onto the new node, one chain
    /// at a time, then waits for the chains to converge.
    async fn handle_replace(&self, op: &ChainTableOp) -> Result<Action> {
        let admin_cli = self.config.admin_cli();
        let token = self.config.token.as_str();
        let status = op.status.clone().unwrap_or_default();
        let old_name = &op.spec.old_node[0];
        let new_name = &op.spec.new_node[0];

        let old_id = topology::resolve_node_id(&admin_cli, NODE_TYPE_STORAGE, old_name).await?;
        let new_id = topology::resolve_node_id(&admin_cli, NODE_TYPE_STORAGE, new_name).await?;

        // The working set is persisted before the first mutation; a resumed
        // pass must never recompute it from a half-rewritten table.
        let pairs = if status.process_chain_ids.is_empty() {
            let chains = topology::chains_with_node(&admin_cli, old_name).await?;
            let pairs = topology::process_chain_pairs(&chains, old_id);
            if pairs.is_empty() {
                bail!("node {} holds no chain targets", old_name);
            }
            self.update_process_chain_ids(op, &pairs).await?;
            pairs
        } else {
            status.process_chain_ids.clone()
        };

        if status.process.as_deref() == Some(PROCESS_VERIFYING) {
            return self.verify_replace(op, &admin_cli, &pairs).await;
        }

        self.update_process(op, PROCESS_OFFLINING_OLD_TARGETS).await?;
        let old_targets = topology::targets_with_node(&admin_cli, old_name).await?;
        let state_of: HashMap<&str, &str> = old_targets
            .iter()
            .map(|t| (t.target_id.as_str(), t.state.as_str()))
            .collect();
        for pair in &pairs {
            let (_, target_id) = topology::split_pair(pair)?;
            let offline = state_of
                .get(target_id)
                .map(|s| s.contains(TARGET_STATE_OFFLINE))
                .unwrap_or(true);
            if !offline {
                admin_cli.offline_target(token, old_id, target_id).await?;
            }
        }

        if !op.spec.force {
            let targets = topology::targets_with_node(&admin_cli, old_name).await?;
            let online = targets
                .iter()
                .filter(|t| !t.state.contains(TARGET_STATE_OFFLINE))
                .count();
            if online > 0 {
                info!(
                    "node {}: {} targets still online, requeue",
                    old_name, online
                );
                return Ok(self.requeue());
            }
        }

        self.update_process(op, PROCESS_REMOVING_OLD_TARGETS).await?;
        let live = topology::parse_chain_table(&admin_cli.list_chains().await?);
        let affected = topology::filter_chains_by_pairs(live, &pairs)?;
        for chain in &affected {
            if let Some(target_id) = &chain.key {
                admin_cli
                    .update_chain(token, "remove", &chain.chain_id, target_id)
                    .await?;
            }
        }

        self.update_process(op, PROCESS_ADDING_NEW_TARGETS).await?;
        for pair in &pairs {
            let (chain_id, target_id) = topology::split_pair(pair)?;
            let new_target = merge::replace_node_in_target_id(target_id, old_id, new_id);
            admin_cli
                .update_chain(token, "add", chain_id, &new_target)
                .await?;
        }

        self.update_process(op, PROCESS_CREATING_TARGETS).await?;
        let cmd_path = self.write_replace_targets(&pairs, old_id, new_id)?;
        admin_cli
            .create_target(token, &cmd_path.display().to_string())
            .await?;

        self.update_process(op, PROCESS_VERIFYING).await?;
        self.verify_replace(op, &admin_cli, &pairs).await
    }

    /// Renders the create-target command file for the new node's side of the
    /// replacement.
    fn write_replace_targets(&self, pairs: &[String], old_id: u32, new_id: u32) -> Result<PathBuf> {
        let dir = Path::new(&self.config.output_dir).join("merged");
        std::fs::create_dir_all(&dir)?;
        let path = dir.join("replace_create_target_cmd.txt");
        let mut file = std::fs::File::create(&path)?;
        for pair in pairs {
            let (chain_id, target_id) = topology::split_pair(pair)?;
            let new_target = merge::replace_node_in_target_id(target_id, old_id, new_id);
            writeln!(
                file,
                "{}",
                render_create_target_line(new_id, &new_target, chain_id)?
            )?;
        }
        info!("wrote {} create-target lines to {}", pairs.len(), path.display());
        Ok(path)
    }

    async fn verify_replace(
        &self,
        op: &ChainTableOp,
        admin_cli: &AdminCli,
        pairs: &[String],
    ) -> Result<Action> {
        let mut chain_ids = Vec::with_capacity(pairs.len());
        for pair in pairs {
            let (chain_id, _) = topology::split_pair(pair)?;
            chain_ids.push(chain_id.to_string());
        }
        let chains = topology::parse_chain_table(&admin_cli.list_chains().await?);
        let affected = topology::filter_chains_by_ids(chains, &chain_ids);
        let converged = topology::check_chain_with_status(&affected, TARGET_STATE_SERVING);
        if converged != affected.len() {
            info!(
                "{}/{} replaced chains serving, requeue",
                converged,
                affected.len()
            );
            return Ok(self.requeue());
        }
        self.finish(op).await
    }

    /// Terminal update. One patch carries the cleared working set together
    /// with the completion flags; a crash between separate patches would
    /// leave an op that can neither resume nor finish.
    async fn finish(&self, op: &ChainTableOp) -> Result<Action> {
        self.patch_status(op, finish_patch()).await?;
        info!("{} finished", op.name_any());
        Ok(Action::await_change())
    }

    async fn update_phase(&self, op: &ChainTableOp, phase: &str) -> Result<()> {
        self.patch_status(op, json!({ "phase": phase })).await
    }

    async fn update_process(&self, op: &ChainTableOp, process: &str) -> Result<()> {
        info!("{} process: {}", op.name_any(), process);
        self.patch_status(op, json!({ "process": process })).await
    }

    async fn update_process_chain_ids(&self, op: &ChainTableOp, pairs: &[String]) -> Result<()> {
        self.patch_status(op, json!({ "processChainIds": pairs }))
            .await
    }

    async fn patch_status(&self, op: &ChainTableOp, status: serde_json::Value) -> Result<()> {
        let ns = op
            .namespace()
            .ok_or_else(|| Error::from("ChainTableOp is namespaced"))?;
        let api: Api<ChainTableOp> = Api::namespaced(self.client.clone(), &ns);
        api.patch_status(
            &op.name_any(),
            &PatchParams::default(),
            &Patch::Merge(json!({ "status": status })),
        )
        .await?;
        Ok(())
    }
}

fn finish_patch() -> serde_json::Value {
    json!({ "processChainIds": [], "executed": true, "phase": PHASE_FINISHED })
}

/// A resumed create pass must not regenerate once its fragment is live;
/// anything at or past the verifying checkpoint only watches convergence.
fn resume_at_verify(process: Option<&str>, new_node_chains_live: bool) -> bool {
    match process {
        Some(PROCESS_VERIFYING) => true,
        Some(_) => new_node_chains_live,
        None => false,
    }
}

/// One line of a create-target command file. The disk index flag is 0-based
/// while target ids embed the 1-based index.
pub fn render_create_target_line(node_id: u32, target_id: &str, chain_id: &str) -> Result<String> {
    let disk_index = topology::disk_index_of_target(target_id)?;
    if disk_index == 0 {
        bail!("target id {} has disk index 0, want 1-based", target_id);
    }
    Ok(format!(
        "create-target --node-id {} --disk-index {} --target-id {} --chain-id {} --use-new-chunk-engine",
        node_id,
        disk_index - 1,
        target_id,
        chain_id
    ))
}

/// Placement scripts take an inclusive id range, so the resolved ids must be
/// gap-free.
pub fn contiguous_range(ids: &[u32]) -> Result<(u32, u32)> {
    let first = *ids
        .first()
        .ok_or_else(|| Error::from("no node ids resolved"))?;
    let last = *ids.last().ok_or_else(|| Error::from("no node ids resolved"))?;
    if (last - first + 1) as usize != ids.len() {
        bail!(
            "node ids are not contiguous: {} .. {} for {} nodes",
            first,
            last,
            ids.len()
        );
    }
    Ok((first, last))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_target_line_uses_zero_based_disk_index() {
        // disk index digits [7..10] of the target id are "001"
        let line = render_create_target_line(10011, "101001100101", "900100013").unwrap();
        assert_eq!(
            line,
            "create-target --node-id 10011 --disk-index 0 --target-id 101001100101 \
             --chain-id 900100013 --use-new-chunk-engine"
        );
    }

    #[test]
    fn create_target_line_rejects_zero_disk_index() {
        assert!(render_create_target_line(10011, "101001100001", "900100013").is_err());
    }

    #[test]
    fn create_resumes_at_verify_once_chains_are_live() {
        // fresh op regenerates
        assert!(!resume_at_verify(None, false));
        // recorded verifying checkpoint always resumes there
        assert!(resume_at_verify(Some(PROCESS_VERIFYING), false));
        // a pass that died after upload but before the verifying checkpoint
        // must not regenerate against the grown high-water marks
        assert!(resume_at_verify(Some(PROCESS_UPLOADING_CHAIN_TABLE), true));
        assert!(resume_at_verify(Some(PROCESS_CREATING_TARGETS), true));
        // died before anything was uploaded: safe to rerun from the start
        assert!(!resume_at_verify(Some(PROCESS_MERGING_FRAGMENT), false));
    }

    #[test]
    fn finish_patch_clears_working_set_in_the_same_update() {
        let patch = finish_patch();
        assert_eq!(patch["executed"], true);
        assert_eq!(patch["phase"], PHASE_FINISHED);
        // cleared together with the flags: a crash between separate patches
        // would strand the op with process == verifying and no pairs left
        assert_eq!(patch["processChainIds"], serde_json::json!([]));
    }

    #[test]
    fn contiguous_range_checks_gaps() {
        assert_eq!(contiguous_range(&[10001, 10002, 10003]).unwrap(), (10001, 10003));
        assert!(contiguous_range(&[10001, 10003]).is_err());
        assert!(contiguous_range(&[]).is_err());
        assert_eq!(contiguous_range(&[10005]).unwrap(), (10005, 10005));
    }
}
