use std::path::Path;
use std::time::Duration;

use log::info;

use crate::command::CommandRunner;
use crate::errors::*;

/// Short bound for admin CLI queries and mutations. The only slow external
/// step is placement generation, which lives in `placement` with its own
/// timeout.
const ADMIN_CLI_TIMEOUT: Duration = Duration::from_secs(10);

/// Typed facade over the external administrative CLI.
///
/// Each method renders one fixed command-line template and applies the
/// tool-specific idempotency rules to the raw output, so that reconciliation
/// can be retried from any point without tripping over "already done"
/// answers.
#[derive(Debug, Clone)]
pub struct AdminCli {
    pub admin_cli_path: String,
    pub config_path: String,
    pub mgmtd_addresses: String,
}

impl AdminCli {
    pub fn new<S: Into<String>>(admin_cli_path: S, config_path: S, mgmtd_addresses: S) -> Self {
        AdminCli {
            admin_cli_path: admin_cli_path.into(),
            config_path: config_path.into(),
            mgmtd_addresses: mgmtd_addresses.into(),
        }
    }

    /// Base invocation: config file, mgmtd override, optional token, then the
    /// verb after `--`.
    fn runner(&self, token: Option<&str>, verb: String) -> CommandRunner {
        let mut args = vec![
            "-cfg".to_string(),
            self.config_path.clone(),
            "--config.mgmtd_client.mgmtd_server_addresses".to_string(),
            self.mgmtd_addresses.clone(),
        ];
        if let Some(token) = token {
            args.push("--config.user_info.token".to_string());
            args.push(token.to_string());
        }
        args.push("--".to_string());
        args.push(verb);
        CommandRunner::new(self.admin_cli_path.clone(), args, ADMIN_CLI_TIMEOUT)
    }

    pub async fn init_cluster(
        &self,
        mgmtd_config_path: &str,
        chain_table_id: &str,
        chunk_size: u64,
        stripe_size: usize,
    ) -> Result<()> {
        // init-cluster reads the mgmtd config directly and takes no address override
        let runner = CommandRunner::new(
            self.admin_cli_path.clone(),
            vec![
                "-cfg".to_string(),
                self.config_path.clone(),
                "--".to_string(),
                format!(
                    "init-cluster --mgmtd {} {} {} {}",
                    mgmtd_config_path, chain_table_id, chunk_size, stripe_size
                ),
            ],
            ADMIN_CLI_TIMEOUT,
        );
        let output = normalize(runner.exec().await, &["Config for MGMTD existed"])?;
        info!("init cluster output: {}", output);
        Ok(())
    }

    pub async fn upload_main_config(&self, component_type: &str, config_path: &str) -> Result<()> {
        let runner = self.runner(
            None,
            format!("set-config --type {} --file {}", component_type, config_path),
        );
        let output = normalize(runner.exec().await, &["config existed"])?;
        info!("upload main config output: {}", output);
        Ok(())
    }

    /// Registers the admin user; the output carries the credential token.
    pub async fn user_add(&self) -> Result<String> {
        let runner = self.runner(None, "user-add --root --admin 0 root".to_string());
        let output = normalize(runner.exec().await, &["already exists"])?;
        info!("user-add output: {}", output);
        Ok(output)
    }

    pub async fn register_node(&self, node_id: u32, node_type: &str) -> Result<()> {
        let runner = self.runner(None, format!("register-node {} {}", node_id, node_type));
        let output = normalize(runner.exec().await, &["already exists"])?;
        fail_on_error_text("register node", output)?;
        Ok(())
    }

    pub async fn unregister_node(&self, node_id: u32, node_type: &str) -> Result<()> {
        let runner = self.runner(None, format!("unregister-node {} {}", node_id, node_type));
        let (output, _) = runner.exec().await?;
        fail_on_error_text("unregister node", output)?;
        Ok(())
    }

    /// Feeds a file of create-target commands to the CLI on stdin. This is
    /// the one place a credential is interpolated into a composite shell
    /// argument; everything else passes argv verbatim.
    pub async fn create_target(&self, token: &str, file_path: &str) -> Result<()> {
        let runner = CommandRunner::new(
            "bash".to_string(),
            vec![
                "-c".to_string(),
                format!(
                    "{} -cfg {} --config.mgmtd_client.mgmtd_server_addresses '{}' --config.user_info.token {} < {}",
                    self.admin_cli_path, self.config_path, self.mgmtd_addresses, token, file_path
                ),
            ],
            ADMIN_CLI_TIMEOUT,
        );
        let output = normalize(runner.exec().await, &["already exists", "TargetExisted"])?;
        fail_on_error_text("create target", output)?;
        Ok(())
    }

    pub async fn dump_chain_table(&self, token: &str, chaintable_path: &str) -> Result<()> {
        prepare_dump_file(chaintable_path)?;
        let runner = self.runner(
            Some(token),
            format!("dump-chain-table 1 {}", chaintable_path),
        );
        runner.exec().await?;
        Ok(())
    }

    pub async fn upload_chain_table(&self, token: &str, chaintable_path: &str) -> Result<()> {
        let runner = self.runner(
            Some(token),
            format!("upload-chain-table --desc stage 1 {}", chaintable_path),
        );
        runner.exec().await?;
        Ok(())
    }

    pub async fn dump_chains(&self, token: &str, chains_path: &str) -> Result<()> {
        if let Some(parent) = Path::new(chains_path).parent() {
            std::fs::create_dir_all(parent)?;
        }
        let runner = self.runner(Some(token), format!("dump-chains {}", chains_path));
        runner.exec().await?;
        Ok(())
    }

    pub async fn upload_chains(&self, token: &str, chains_path: &str) -> Result<()> {
        let runner = self.runner(Some(token), format!("upload-chains {}", chains_path));
        runner.exec().await?;
        Ok(())
    }

    pub async fn list_nodes(&self) -> Result<String> {
        let runner = self.runner(None, "list-nodes".to_string());
        let (output, _) = runner.exec().await?;
        fail_on_error_text("list nodes", output)
    }

    pub async fn list_targets(&self) -> Result<String> {
        let runner = self.runner(None, "list-targets".to_string());
        let (output, _) = runner.exec().await?;
        fail_on_error_text("list targets", output)
    }

    pub async fn list_chains(&self) -> Result<String> {
        let runner = self.runner(None, "list-chains".to_string());
        let (output, _) = runner.exec().await?;
        fail_on_error_text("list chains", output)
    }

    /// `mode` is either "add" or "remove".
    pub async fn update_chain(
        &self,
        token: &str,
        mode: &str,
        chain_id: &str,
        target_id: &str,
    ) -> Result<String> {
        let runner = self.runner(
            Some(token),
            format!("update-chain --mode {} {} {}", mode, chain_id, target_id),
        );
        let output = normalize(runner.exec().await, &["TargetExisted"])?;
        info!("update-chain output: {}", output);
        Ok(output)
    }

    pub async fn offline_target(
        &self,
        token: &str,
        node_id: u32,
        target_id: &str,
    ) -> Result<String> {
        let runner = self.runner(
            Some(token),
            format!(
                "offline-target --node-id {} --target-id {}",
                node_id, target_id
            ),
        );
        let output = normalize(runner.exec().await, &["target is already offline"])?;
        info!("offline-target output: {}", output);
        fail_on_error_text("offline target", output)
    }
}

/// Treats known benign tool answers as success. The tool reports e.g.
/// "already exists" both on stdout with a zero exit and on stderr with a
/// non-zero one, so both streams are checked on failure.
fn normalize(res: Result<(String, String)>, benign: &[&str]) -> Result<String> {
    match res {
        Ok((stdout, _)) => Ok(stdout),
        Err(Error(ErrorKind::CommandFailed(stdout, stderr), state)) => {
            if benign
                .iter()
                .any(|b| stdout.contains(b) || stderr.contains(b))
            {
                return Ok(stdout);
            }
            Err(Error(ErrorKind::CommandFailed(stdout, stderr), state))
        }
        Err(e) => Err(e),
    }
}

/// Some failures come back on stdout with a zero exit code.
fn fail_on_error_text(op: &str, output: String) -> Result<String> {
    if output.contains("error") {
        bail!("{} failed, err: {}", op, output);
    }
    Ok(output)
}

/// dump-chain-table refuses to overwrite, so start from an empty file.
fn prepare_dump_file(path: &str) -> Result<()> {
    let path = Path::new(path);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    if path.exists() {
        std::fs::remove_file(path)?;
    }
    std::fs::File::create(path)?;
    Ok(())
}
