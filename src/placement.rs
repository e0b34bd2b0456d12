use std::path::{Path, PathBuf};
use std::time::Duration;

use log::info;

use crate::command::CommandRunner;
use crate::errors::*;

/// The placement solver can run for a long time on large clusters; this is
/// the one deliberately long timeout in the system.
const PLACEMENT_TIMEOUT: Duration = Duration::from_secs(30 * 60);

const MODEL_DIR_PREFIX: &str = "DataPlacementModel";
const INCIDENCE_MATRIX_FILE: &str = "incidence_matrix.pickle";

pub const FRAGMENT_TARGETS_FILE: &str = "create_target_cmd.txt";
pub const FRAGMENT_CHAINS_FILE: &str = "generated_chains.csv";
pub const FRAGMENT_CHAIN_TABLE_FILE: &str = "generated_chain_table.csv";

/// Runs the external placement tool: a solver script that produces a
/// placement model directory, then a generator script that turns the model
/// into the three tabular fragment files. The fragment is numbered
/// independently of the live cluster and must be merged before upload.
#[derive(Debug, Clone)]
pub struct PlacementGenerator {
    pub python_path: String,
    pub placement_dir: String,
    pub output_dir: String,
}

#[derive(Debug, Clone)]
pub struct PlacementParams {
    pub num_nodes: usize,
    pub replica: usize,
    pub targets_per_disk: usize,
    pub disks_per_node: usize,
    pub node_id_begin: u32,
    pub node_id_end: u32,
    pub target_id_prefix: u32,
    pub chain_id_prefix: u32,
}

/// The three files of one generated topology fragment.
#[derive(Debug, Clone)]
pub struct FragmentPaths {
    pub targets_path: PathBuf,
    pub chains_path: PathBuf,
    pub chain_table_path: PathBuf,
}

impl PlacementGenerator {
    pub fn new<S: Into<String>>(python_path: S, placement_dir: S, output_dir: S) -> Self {
        PlacementGenerator {
            python_path: python_path.into(),
            placement_dir: placement_dir.into(),
            output_dir: output_dir.into(),
        }
    }

    pub async fn generate(&self, params: &PlacementParams) -> Result<FragmentPaths> {
        // a model directory left over from an earlier run must never be
        // mistaken for the one this run produces
        let output = Path::new(&self.output_dir).join("output");
        if output.exists() {
            std::fs::remove_dir_all(&output)
                .chain_err(|| format!("can't clear output dir {}", output.display()))?;
        }

        self.run_model(params).await?;
        let model_dir = self.find_model_dir()?;
        self.run_chain_table(params, &model_dir).await?;

        let output = Path::new(&self.output_dir).join("output");
        let paths = FragmentPaths {
            targets_path: output.join(FRAGMENT_TARGETS_FILE),
            chains_path: output.join(FRAGMENT_CHAINS_FILE),
            chain_table_path: output.join(FRAGMENT_CHAIN_TABLE_FILE),
        };
        for p in [&paths.targets_path, &paths.chains_path, &paths.chain_table_path] {
            if !p.exists() {
                bail!("placement tool did not produce {}", p.display());
            }
        }
        Ok(paths)
    }

    async fn run_model(&self, params: &PlacementParams) -> Result<()> {
        let script = Path::new(&self.placement_dir)
            .join("src/model/data_placement.py")
            .display()
            .to_string();
        let runner = CommandRunner::new(
            self.python_path.clone(),
            vec![
                script,
                "-ql".to_string(),
                "-relax".to_string(),
                "-type".to_string(),
                "CR".to_string(),
                "--num_nodes".to_string(),
                params.num_nodes.to_string(),
                "--replication_factor".to_string(),
                params.replica.to_string(),
                "--min_targets_per_disk".to_string(),
                params.targets_per_disk.to_string(),
            ],
            PLACEMENT_TIMEOUT,
        )
        .in_dir(self.output_dir.clone());
        runner.exec().await?;
        Ok(())
    }

    async fn run_chain_table(&self, params: &PlacementParams, model_dir: &Path) -> Result<()> {
        let script = Path::new(&self.placement_dir)
            .join("src/setup/gen_chain_table.py")
            .display()
            .to_string();
        let matrix = model_dir.join(INCIDENCE_MATRIX_FILE).display().to_string();
        let runner = CommandRunner::new(
            self.python_path.clone(),
            vec![
                script,
                "--chain_table_type".to_string(),
                "CR".to_string(),
                "--node_id_begin".to_string(),
                params.node_id_begin.to_string(),
                "--node_id_end".to_string(),
                params.node_id_end.to_string(),
                "--num_disks_per_node".to_string(),
                params.disks_per_node.to_string(),
                "--num_targets_per_disk".to_string(),
                params.targets_per_disk.to_string(),
                "--target_id_prefix".to_string(),
                params.target_id_prefix.to_string(),
                "--chain_id_prefix".to_string(),
                params.chain_id_prefix.to_string(),
                "--incidence_matrix_path".to_string(),
                matrix,
            ],
            PLACEMENT_TIMEOUT,
        )
        .in_dir(self.output_dir.clone());
        runner.exec().await?;
        Ok(())
    }

    /// The solver names its model directory after its parameters. The output
    /// dir is cleared before the solver runs, so exactly one match must
    /// exist; more than one means a stale model survived and neither can be
    /// trusted.
    fn find_model_dir(&self) -> Result<PathBuf> {
        let dir = Path::new(&self.output_dir).join("output");
        let found = find_by_prefix(&dir, MODEL_DIR_PREFIX)?;
        info!("placement model directory: {}", found.display());
        Ok(found)
    }
}

fn find_by_prefix(dir: &Path, prefix: &str) -> Result<PathBuf> {
    let mut matches: Vec<PathBuf> = std::fs::read_dir(dir)
        .chain_err(|| format!("can't read dir {}", dir.display()))?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|p| {
            p.file_name()
                .and_then(|n| n.to_str())
                .map(|n| n.starts_with(prefix))
                .unwrap_or(false)
        })
        .collect();
    if matches.len() > 1 {
        bail!(
            "{} entries with prefix {} under {}, want exactly one",
            matches.len(),
            prefix,
            dir.display()
        );
    }
    matches
        .pop()
        .ok_or_else(|| Error::from(format!("no entry with prefix {} under {}", prefix, dir.display())))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn find_by_prefix_picks_the_single_match() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("DataPlacementModel-v_5-b_9")).unwrap();
        std::fs::create_dir(dir.path().join("unrelated")).unwrap();

        let found = find_by_prefix(dir.path(), MODEL_DIR_PREFIX).unwrap();
        assert!(found.ends_with("DataPlacementModel-v_5-b_9"));
    }

    #[test]
    fn find_by_prefix_rejects_a_stale_model_dir() {
        // a survivor from an earlier run must not be silently picked over
        // the fresh model
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("DataPlacementModel-v_9-b_9-stale")).unwrap();
        std::fs::create_dir(dir.path().join("DataPlacementModel-v_3-b_1-fresh")).unwrap();

        assert!(find_by_prefix(dir.path(), MODEL_DIR_PREFIX).is_err());
    }

    #[test]
    fn find_by_prefix_errors_when_absent() {
        let dir = tempfile::tempdir().unwrap();
        assert!(find_by_prefix(dir.path(), MODEL_DIR_PREFIX).is_err());
    }
}
