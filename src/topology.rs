use std::collections::HashMap;
use std::sync::OnceLock;

use log::{info, warn};
use regex::Regex;

use crate::admin_cli::AdminCli;
use crate::errors::*;

/// Target state reported once the storage layer has caught up.
pub const TARGET_STATE_SERVING: &str = "SERVING-UPTODATE";
/// Substring present in every offline-ish composite state.
pub const TARGET_STATE_OFFLINE: &str = "OFFLINE";

pub const NODE_TYPE_STORAGE: &str = "STORAGE";

/// A single replica slot on one disk of a storage node. The id embeds the
/// owning node id in digits [2..7] and the 1-based disk index in [7..10];
/// only `state` ever changes after creation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub target_id: String,
    pub state: String,
}

/// An ordered replication group of targets. `key` carries the matched
/// targetId when the chain was selected through a persisted
/// `chainId@targetId` pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chain {
    pub chain_id: String,
    pub referenced_by: String,
    pub chain_version: String,
    pub status: String,
    pub preferred_order: String,
    pub targets: Vec<Target>,
    pub key: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Node {
    pub id: String,
    pub node_type: String,
    pub status: String,
    pub hostname: String,
}

fn target_field_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^(\d+)\((\S+-\S+)\)$").expect("valid target field regex"))
}

/// Parses one chain-table line: positional scalars followed by a trailing
/// run of `<targetId>(<state>)` fields. The preferred-order column is not
/// always printed, so the scalars are counted from the back: everything
/// before the target run must be 4 or 5 fields, and a line whose leftover
/// fields are neither scalars nor valid targets is rejected.
pub fn parse_chain(line: &str) -> Result<Chain> {
    let fields: Vec<&str> = line.split_whitespace().collect();
    let mut split = fields.len();
    while split > 0 && target_field_re().is_match(fields[split - 1]) {
        split -= 1;
    }
    let scalars = &fields[..split];
    if scalars.len() < 4 || scalars.len() > 5 {
        bail!(
            "chain line has {} scalar fields, want 4 or 5",
            scalars.len()
        );
    }
    if split == fields.len() {
        bail!("chain line has no valid target fields");
    }
    let mut targets = Vec::with_capacity(fields.len() - split);
    for field in &fields[split..] {
        let caps = target_field_re()
            .captures(field)
            .ok_or_else(|| Error::from(format!("invalid target format: {}", field)))?;
        targets.push(Target {
            target_id: caps[1].to_string(),
            state: caps[2].to_string(),
        });
    }
    Ok(Chain {
        chain_id: scalars[0].to_string(),
        referenced_by: scalars[1].to_string(),
        chain_version: scalars[2].to_string(),
        status: scalars[3].to_string(),
        preferred_order: scalars.get(4).unwrap_or(&"").to_string(),
        targets,
        key: None,
    })
}

/// Lenient by design: the header line, blank lines, and malformed lines are
/// skipped (with a diagnostic) so transient tool output noise never aborts a
/// reconciliation pass.
pub fn parse_chain_table(output: &str) -> Vec<Chain> {
    let mut chains = Vec::new();
    for (i, line) in output.lines().enumerate() {
        if i == 0 || line.trim().is_empty() {
            continue;
        }
        match parse_chain(line) {
            Ok(chain) => chains.push(chain),
            Err(e) => warn!("parse line({}) '{}' failed: {}", i, line, e),
        }
    }
    chains
}

pub fn parse_target(line: &str) -> Result<Target> {
    let fields: Vec<&str> = line.split_whitespace().collect();
    if fields.len() < 5 {
        bail!("target line has {} fields, want at least 5", fields.len());
    }
    Ok(Target {
        target_id: fields[0].to_string(),
        state: fields[4].to_string(),
    })
}

pub fn parse_targets(output: &str) -> Vec<Target> {
    let mut targets = Vec::new();
    for (i, line) in output.lines().enumerate() {
        if i == 0 || line.trim().is_empty() {
            continue;
        }
        match parse_target(line) {
            Ok(target) => targets.push(target),
            Err(e) => warn!("parse line({}) '{}' failed: {}", i, line, e),
        }
    }
    targets
}

pub fn parse_node(line: &str) -> Result<Node> {
    let fields: Vec<&str> = line.split_whitespace().collect();
    if fields.len() < 4 {
        bail!("node line has {} fields, want at least 4", fields.len());
    }
    Ok(Node {
        id: fields[0].to_string(),
        node_type: fields[1].to_string(),
        status: fields[2].to_string(),
        hostname: fields[3].to_string(),
    })
}

pub fn parse_node_table(output: &str) -> Vec<Node> {
    let mut nodes = Vec::new();
    for (i, line) in output.lines().enumerate() {
        if i == 0 || line.trim().is_empty() {
            continue;
        }
        match parse_node(line) {
            Ok(node) => nodes.push(node),
            Err(e) => warn!("parse line({}) '{}' failed: {}", i, line, e),
        }
    }
    nodes
}

/// The tool registers hostnames in a restricted character set.
pub fn normalize_hostname(node_name: &str) -> String {
    node_name.replace('-', "_").replace('.', "_")
}

/// Node id embedded in a target identifier (digits [2..7]).
pub fn node_id_of_target(target_id: &str) -> Result<u32> {
    let sub = target_id
        .get(2..7)
        .ok_or_else(|| Error::from(format!("target id {} too short", target_id)))?;
    Ok(sub.parse()?)
}

/// 1-based disk index embedded in a target identifier (digits [7..10]).
pub fn disk_index_of_target(target_id: &str) -> Result<u32> {
    let sub = target_id
        .get(7..10)
        .ok_or_else(|| Error::from(format!("target id {} too short", target_id)))?;
    Ok(sub.parse()?)
}

/// Membership is decided numerically, so a zero-padded id substring still
/// matches its unpadded node id.
pub fn target_belongs_to_node(target_id: &str, node_id: u32) -> bool {
    matches!(node_id_of_target(target_id), Ok(id) if id == node_id)
}

/// Resolves a node name to the id the tool registered it under.
pub async fn resolve_node_id(
    admin_cli: &AdminCli,
    node_type: &str,
    node_name: &str,
) -> Result<u32> {
    let wanted = normalize_hostname(node_name);
    let output = admin_cli.list_nodes().await?;
    for node in parse_node_table(&output) {
        if node.node_type == node_type && node.hostname == wanted {
            return Ok(node.id.parse()?);
        }
    }
    Err(ErrorKind::NodeNotFound(wanted).into())
}

/// Next free node id for a type: max(existing) + 1, floored at the
/// configured start id. Not atomic against concurrent allocation; the tool's
/// duplicate-id rejection is the backstop.
pub async fn allocate_node_id(
    admin_cli: &AdminCli,
    node_type: &str,
    start_node_id: u32,
) -> Result<u32> {
    let output = admin_cli.list_nodes().await?;
    let mut max_id = start_node_id;
    for node in parse_node_table(&output) {
        if node.node_type != node_type {
            continue;
        }
        if let Ok(id) = node.id.parse::<u32>() {
            if id > max_id {
                max_id = id;
            }
        }
    }
    Ok(max_id + 1)
}

/// All chains holding at least one target on the given node.
pub async fn chains_with_node(admin_cli: &AdminCli, node_name: &str) -> Result<Vec<Chain>> {
    let output = admin_cli.list_chains().await?;
    let chains = parse_chain_table(&output);
    let node_id = resolve_node_id(admin_cli, NODE_TYPE_STORAGE, node_name).await?;
    Ok(chains
        .into_iter()
        .filter(|c| {
            c.targets
                .iter()
                .any(|t| target_belongs_to_node(&t.target_id, node_id))
        })
        .collect())
}

/// All targets living on the given node.
pub async fn targets_with_node(admin_cli: &AdminCli, node_name: &str) -> Result<Vec<Target>> {
    let output = admin_cli.list_targets().await?;
    let targets = parse_targets(&output);
    let node_id = resolve_node_id(admin_cli, NODE_TYPE_STORAGE, node_name).await?;
    Ok(targets
        .into_iter()
        .filter(|t| target_belongs_to_node(&t.target_id, node_id))
        .collect())
}

/// `chainId@targetId` pairs for every target of `node_id` in the chains.
/// This is the working set persisted in status.processChainIds.
pub fn process_chain_pairs(chains: &[Chain], node_id: u32) -> Vec<String> {
    let mut pairs = Vec::with_capacity(chains.len());
    for chain in chains {
        for target in &chain.targets {
            if target_belongs_to_node(&target.target_id, node_id) {
                pairs.push(format!("{}@{}", chain.chain_id, target.target_id));
            }
        }
    }
    pairs
}

pub fn split_pair(pair: &str) -> Result<(&str, &str)> {
    let mut it = pair.splitn(2, '@');
    match (it.next(), it.next()) {
        (Some(chain_id), Some(target_id)) => Ok((chain_id, target_id)),
        _ => bail!("malformed chainId@targetId pair: {}", pair),
    }
}

/// Selects chains by persisted pairs, recording the matched targetId in
/// `key` so a resumed pass knows which replica slot it was working on.
pub fn filter_chains_by_pairs(chains: Vec<Chain>, pairs: &[String]) -> Result<Vec<Chain>> {
    let mut by_chain: HashMap<&str, &str> = HashMap::new();
    for pair in pairs {
        let (chain_id, target_id) = split_pair(pair)?;
        by_chain.insert(chain_id, target_id);
    }
    Ok(chains
        .into_iter()
        .filter_map(|mut c| {
            by_chain.get(c.chain_id.as_str()).map(|target_id| {
                c.key = Some((*target_id).to_string());
                c
            })
        })
        .collect())
}

pub fn filter_chains_by_ids(chains: Vec<Chain>, chain_ids: &[String]) -> Vec<Chain> {
    let wanted: HashMap<&str, ()> = chain_ids.iter().map(|id| (id.as_str(), ())).collect();
    chains
        .into_iter()
        .filter(|c| wanted.contains_key(c.chain_id.as_str()))
        .collect()
}

/// Number of chains whose every target reports `status`; each chain counts
/// at most once. Equal to `chains.len()` exactly when the whole set has
/// converged.
pub fn check_chain_with_status(chains: &[Chain], status: &str) -> usize {
    let mut converged = 0;
    for chain in chains {
        if chain.targets.iter().all(|t| t.state == status) {
            converged += 1;
        } else if let Some(t) = chain.targets.iter().find(|t| t.state != status) {
            info!(
                "chain {} target {} state is {}",
                chain.chain_id, t.target_id, t.state
            );
        }
    }
    if converged != chains.len() {
        info!("chains is not all {}", status);
    }
    converged
}

/// Guard: no target in the set may be in `status`.
pub fn check_chain_without_status(chains: &[Chain], status: &str) -> Result<()> {
    for chain in chains {
        for target in &chain.targets {
            if target.state == status {
                bail!(
                    "chain {} target {} state is {}",
                    chain.chain_id,
                    target.target_id,
                    target.state
                );
            }
        }
    }
    Ok(())
}

/// Like `check_chain_with_status`, but only targets owned by `node_id` are
/// inspected. Used to verify one node's side of a replacement.
pub fn check_node_targets_with_status(chains: &[Chain], node_id: u32, status: &str) -> usize {
    let mut mismatched = 0;
    for chain in chains {
        let bad = chain
            .targets
            .iter()
            .filter(|t| target_belongs_to_node(&t.target_id, node_id))
            .any(|t| t.state != status);
        if bad {
            mismatched += 1;
            if let Some(t) = chain
                .targets
                .iter()
                .find(|t| target_belongs_to_node(&t.target_id, node_id) && t.state != status)
            {
                info!(
                    "chain {} target {} state is {}",
                    chain.chain_id, t.target_id, t.state
                );
            }
        }
    }
    chains.len() - mismatched
}

#[cfg(test)]
mod tests {
    use super::*;

    const CHAIN_TABLE: &str = "ChainId ReferencedBy ChainVersion Status PreferredOrder Targets\n\
        100000001 - - SERVING 100(SERVING-UPTODATE) 200(SERVING-UPTODATE)\n\
        \n\
        100000002 - - SERVING bad-target\n\
        100000003 1 2 SERVING 300(SERVING-OFFLINE)\n";

    #[test]
    fn parses_chain_table_and_skips_malformed_lines() {
        let chains = parse_chain_table(CHAIN_TABLE);
        assert_eq!(chains.len(), 2);

        assert_eq!(chains[0].chain_id, "100000001");
        assert_eq!(chains[0].targets.len(), 2);
        assert_eq!(chains[0].targets[0].target_id, "100");
        assert_eq!(chains[0].targets[0].state, "SERVING-UPTODATE");
        assert_eq!(chains[0].targets[1].target_id, "200");

        // the malformed line is dropped, later lines still parse
        assert_eq!(chains[1].chain_id, "100000003");
        assert_eq!(chains[1].targets[0].state, "SERVING-OFFLINE");
    }

    #[test]
    fn parses_optional_preferred_order_column() {
        let chain = parse_chain("900300101 1 2 SERVING [] 101000300101(SERVING-UPTODATE)").unwrap();
        assert_eq!(chain.preferred_order, "[]");
        assert_eq!(chain.targets.len(), 1);

        let chain = parse_chain("100000001 - - SERVING 100(SERVING-UPTODATE)").unwrap();
        assert_eq!(chain.preferred_order, "");
    }

    #[test]
    fn rejects_lines_without_valid_targets() {
        // a field that is neither a scalar nor a target poisons the line
        assert!(parse_chain("100000002 - - SERVING bad-target").is_err());
        // a malformed field between valid targets does too
        assert!(parse_chain(
            "100000002 - - SERVING 100(SERVING-UPTODATE) junk 200(SERVING-UPTODATE)"
        )
        .is_err());
        // scalars alone are not a chain
        assert!(parse_chain("100000002 - - SERVING").is_err());
    }

    #[test]
    fn parses_targets_positionally() {
        let output = "TargetId ChainId Role PublicState LocalState\n\
            101000300101 900300101 HEAD SERVING SERVING-UPTODATE\n\
            101000300102 900300102 TAIL SERVING SYNCING\n";
        let targets = parse_targets(output);
        assert_eq!(targets.len(), 2);
        assert_eq!(targets[0].target_id, "101000300101");
        assert_eq!(targets[0].state, "SERVING-UPTODATE");
        assert_eq!(targets[1].state, "SYNCING");
    }

    #[test]
    fn parses_node_table() {
        let output = "Id Type Status Hostname\n\
            10001 STORAGE HEARTBEAT_CONNECTED node_1_example_com\n";
        let nodes = parse_node_table(output);
        assert_eq!(nodes.len(), 1);
        assert_eq!(nodes[0].id, "10001");
        assert_eq!(nodes[0].node_type, "STORAGE");
        assert_eq!(nodes[0].hostname, "node_1_example_com");
    }

    #[test]
    fn normalizes_hostnames() {
        assert_eq!(normalize_hostname("node-1.example.com"), "node_1_example_com");
    }

    #[test]
    fn node_membership_is_numeric() {
        // substring [2..7] is "00042": padded id still matches node 42
        let target_id = "1000042001234";
        assert_eq!(node_id_of_target(target_id).unwrap(), 42);
        assert!(target_belongs_to_node(target_id, 42));
        assert!(!target_belongs_to_node(target_id, 43));
    }

    #[test]
    fn disk_index_extraction() {
        // [7..10] of "101000300319" is "003"
        assert_eq!(disk_index_of_target("101000300319").unwrap(), 3);
    }

    #[test]
    fn target_field_regex_matches_real_sample() {
        let caps = target_field_re()
            .captures("101000300319(SERVING-UPTODATE)")
            .unwrap();
        assert_eq!(&caps[1], "101000300319");
        assert_eq!(&caps[2], "SERVING-UPTODATE");
    }

    fn chain(id: &str, states: &[&str]) -> Chain {
        Chain {
            chain_id: id.to_string(),
            referenced_by: "-".to_string(),
            chain_version: "-".to_string(),
            status: "SERVING".to_string(),
            preferred_order: "-".to_string(),
            targets: states
                .iter()
                .enumerate()
                .map(|(i, s)| Target {
                    target_id: format!("10100030010{}", i),
                    state: s.to_string(),
                })
                .collect(),
            key: None,
        }
    }

    #[test]
    fn check_chain_with_status_counts_each_chain_once() {
        let all_good = vec![
            chain("1", &[TARGET_STATE_SERVING, TARGET_STATE_SERVING]),
            chain("2", &[TARGET_STATE_SERVING]),
        ];
        assert_eq!(check_chain_with_status(&all_good, TARGET_STATE_SERVING), 2);

        let one_bad = vec![
            chain("1", &[TARGET_STATE_SERVING, "SYNCING"]),
            chain("2", &[TARGET_STATE_SERVING]),
        ];
        assert_eq!(check_chain_with_status(&one_bad, TARGET_STATE_SERVING), 1);

        // two bad targets in the same chain subtract once, not twice
        let double_bad = vec![chain("1", &["SYNCING", "SYNCING"])];
        assert_eq!(check_chain_with_status(&double_bad, TARGET_STATE_SERVING), 0);
    }

    #[test]
    fn check_chain_without_status_flags_matches() {
        let chains = vec![chain("1", &[TARGET_STATE_SERVING, "SERVING-OFFLINE"])];
        assert!(check_chain_without_status(&chains, "SERVING-OFFLINE").is_err());
        assert!(check_chain_without_status(&chains, "SYNCING").is_ok());
    }

    #[test]
    fn pairs_roundtrip_through_filter() {
        let chains = vec![
            chain("900300101", &[TARGET_STATE_SERVING]),
            chain("900300102", &[TARGET_STATE_SERVING]),
        ];
        let pairs = vec!["900300101@101000300101".to_string()];
        let filtered = filter_chains_by_pairs(chains, &pairs).unwrap();
        assert_eq!(filtered.len(), 1);
        assert_eq!(filtered[0].chain_id, "900300101");
        assert_eq!(filtered[0].key.as_deref(), Some("101000300101"));
    }

    #[test]
    fn split_pair_rejects_garbage() {
        assert!(split_pair("900300101@101000300101").is_ok());
        assert!(split_pair("no-separator").is_err());
    }

    #[test]
    fn process_chain_pairs_selects_node_targets() {
        let mut c = chain("900300101", &[]);
        c.targets = vec![
            Target {
                target_id: "1010003001".to_string() + "01",
                state: TARGET_STATE_SERVING.to_string(),
            },
            Target {
                target_id: "1010004001".to_string() + "01",
                state: TARGET_STATE_SERVING.to_string(),
            },
        ];
        // node 3 owns the first target only ([2..7] == "10003")
        let pairs = process_chain_pairs(&[c], 10003);
        assert_eq!(pairs, vec!["900300101@101000300101".to_string()]);
    }

    #[test]
    fn node_scoped_status_check() {
        let mut c1 = chain("1", &[]);
        c1.targets = vec![
            Target {
                target_id: "101000300101".to_string(),
                state: TARGET_STATE_SERVING.to_string(),
            },
            Target {
                target_id: "101000400101".to_string(),
                state: "SYNCING".to_string(),
            },
        ];
        // node 10003's target is fine, the other node's state is ignored
        assert_eq!(check_node_targets_with_status(&[c1.clone()], 10003, TARGET_STATE_SERVING), 1);
        assert_eq!(check_node_targets_with_status(&[c1], 10004, TARGET_STATE_SERVING), 0);
    }
}
