#[macro_use]
extern crate error_chain;

pub mod admin_cli;
pub mod command;
pub mod config;
pub mod crd;
pub mod manager;
pub mod merge;
pub mod placement;
pub mod reconcile;
pub mod topology;

pub mod errors {
    // Create the Error, ErrorKind, ResultExt, and Result types
    error_chain! {
        foreign_links {
            Io(std::io::Error);
            Json(serde_json::Error);
            Yaml(serde_yaml::Error);
            Csv(csv::Error);
            Kube(kube::Error);
            ParseInt(std::num::ParseIntError);
        }
        errors {
            CommandTimeout(timeout: std::time::Duration) {
                description("process did not exit in time")
                display("wait process to exit timeout after {:?}", timeout)
            }
            Cancelled {
                description("execution cancelled")
                display("execution cancelled by caller")
            }
            CommandFailed(stdout: String, stderr: String) {
                description("command exited with failure")
                display("command failed, stdout: {}, stderr: {}", stdout, stderr)
            }
            NodeNotFound(name: String) {
                description("node not registered")
                display("node {} not found", name)
            }
            UnsupportedOperation(op: String) {
                description("operation type not supported")
                display("not support type {}", op)
            }
            InvalidSpec(msg: String) {
                description("invalid operation spec")
                display("invalid spec: {}", msg)
            }
        }
    }
}

/*
Drives the replication topology ("chain table") of a storage cluster while
nodes are added or swapped, by sequencing an external administrative CLI:

- A ChainTableOp object declares the operation: create (grow the cluster),
  replace (swap exactly one node), delete (rejected for now).
- Every mutation goes through the admin CLI as a child process; its tabular
  text output is parsed leniently so transient noise never aborts a pass.
- Chain ids encode disk index and chain index (diskIdx*100000 + chainIdx).
  Fragments produced by the external placement tool are renumbered against
  the live per-disk high-water marks before upload, so a merged fragment
  never collides with existing chains.
- status.{phase,process,processChainIds,executed} is the durable checkpoint:
  a crashed pass resumes from the persisted chainId@targetId set plus a
  fresh read of the live chain table, never from in-memory state.
*/
