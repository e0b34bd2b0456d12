use std::collections::HashMap;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use log::info;
use regex::Regex;

use crate::errors::*;
use crate::topology::Chain;

/// chainId = diskIndex * 100_000 + chainIndex, disk index capped at 3 digits.
pub fn encode_chain_id(chain_index: u32, disk_index: u32) -> u64 {
    disk_index as u64 * 100_000 + chain_index as u64
}

/// Inverse of `encode_chain_id`.
pub fn decode_chain_id(chain_id: &str) -> Result<(u32, u32)> {
    let value: u64 = chain_id.trim().parse()?;
    let chain_index = (value % 100_000) as u32;
    let disk_index = ((value / 100_000) % 1_000) as u32;
    Ok((chain_index, disk_index))
}

/// Highest chain index observed per disk index across the live table.
/// Fragments are renumbered past these marks so their indices cannot collide
/// with anything already uploaded.
pub fn max_chain_index_per_disk(chains: &[Chain]) -> HashMap<u32, u32> {
    let mut maxima = HashMap::new();
    for chain in chains {
        if let Ok((chain_index, disk_index)) = decode_chain_id(&chain.chain_id) {
            let entry = maxima.entry(disk_index).or_insert(0);
            if chain_index > *entry {
                *entry = chain_index;
            }
        }
    }
    maxima
}

/// Per-disk offsets that place a fragment strictly past the live table.
/// One past the high-water mark, so even a fragment numbered from zero
/// cannot collide with an existing chain index.
pub fn merge_offsets(chains: &[Chain]) -> HashMap<u32, u32> {
    max_chain_index_per_disk(chains)
        .into_iter()
        .map(|(disk, max)| (disk, max + 1))
        .collect()
}

/// Rewritten fragment files. The source fragment is never touched: a failed
/// merge leaves it intact for the next pass.
#[derive(Debug, Clone)]
pub struct MergedFragment {
    pub targets_path: PathBuf,
    pub chains_path: PathBuf,
    pub chain_table_path: PathBuf,
}

fn out_path(out_dir: &Path, prefix: &str, ext: &str) -> PathBuf {
    out_dir.join(format!("{}_{:08x}.{}", prefix, rand::random::<u32>(), ext))
}

/// Offsets the leading chain-id column of a chains/chain-table CSV by the
/// per-disk high-water mark; every other column is preserved verbatim.
pub fn rewrite_chain_csv(
    path: &Path,
    offsets: &HashMap<u32, u32>,
    out_dir: &Path,
    prefix: &str,
) -> Result<PathBuf> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_path(path)?;

    let out = out_path(out_dir, prefix, "csv");
    let mut writer = csv::WriterBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_path(&out)?;

    for (i, record) in reader.records().enumerate() {
        let record = record?;
        if i == 0 {
            writer.write_record(&record)?;
            continue;
        }
        let mut fields: Vec<String> = record.iter().map(|f| f.to_string()).collect();
        if let Some(first) = fields.first_mut() {
            let old: u64 = first.trim().parse()?;
            let (_, disk_index) = decode_chain_id(first)?;
            let offset = offsets.get(&disk_index).copied().unwrap_or(0);
            *first = (old + offset as u64).to_string();
        }
        writer.write_record(&fields)?;
    }
    writer.flush()?;

    info!("rewrote {} into {}", path.display(), out.display());
    Ok(out)
}

fn chain_id_flag_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"--chain-id\s+(\d+)").expect("valid chain-id flag regex"))
}

// Replacement for one matched flag value: (start, end, new text). Edits are
// applied by match position, so other digit runs in the line are never
// touched.
fn flag_edit(line: &str, re: &Regex, replacement: impl Fn(&str) -> Option<String>) -> Option<(usize, usize, String)> {
    let m = re.captures(line)?.get(1)?;
    let repl = replacement(m.as_str())?;
    Some((m.start(), m.end(), repl))
}

/// Rewrites a create-target command file: the `--chain-id` value is offset
/// per disk, every other flag is preserved verbatim. The substitution is
/// done by match position, never by a second search for the digits, so a
/// target id that happens to contain the same digit run is left alone.
pub fn rewrite_target_file(
    path: &Path,
    offsets: &HashMap<u32, u32>,
    out_dir: &Path,
) -> Result<PathBuf> {
    let file = std::fs::File::open(path)
        .chain_err(|| format!("can't open file {}", path.display()))?;
    let out = out_path(out_dir, "target_updated", "txt");
    let out_file = std::fs::File::create(&out)?;
    let mut writer = BufWriter::new(out_file);

    for line in BufReader::new(file).lines() {
        let mut line = line?;
        if let Some((s, e, repl)) = flag_edit(&line, chain_id_flag_re(), |v| {
            let (_, disk_index) = decode_chain_id(v).ok()?;
            let old: u64 = v.trim().parse().ok()?;
            let offset = offsets.get(&disk_index).copied().unwrap_or(0);
            Some((old + offset as u64).to_string())
        }) {
            line.replace_range(s..e, &repl);
        }
        writeln!(writer, "{}", line)?;
    }
    writer.flush()?;

    info!("rewrote {} into {}", path.display(), out.display());
    Ok(out)
}

/// Substitutes the first occurrence of the old node-id digits with the new
/// ones. Target ids embed the node id once, right after the 2-digit prefix.
pub fn replace_node_in_target_id(target_id: &str, old_node_id: u32, new_node_id: u32) -> String {
    target_id.replacen(&old_node_id.to_string(), &new_node_id.to_string(), 1)
}

/// Renumbers all three fragment files into the live numbering space.
pub fn merge_fragment(
    targets_path: &Path,
    chains_path: &Path,
    chain_table_path: &Path,
    offsets: &HashMap<u32, u32>,
    out_dir: &Path,
) -> Result<MergedFragment> {
    std::fs::create_dir_all(out_dir)?;
    Ok(MergedFragment {
        targets_path: rewrite_target_file(targets_path, offsets, out_dir)?,
        chains_path: rewrite_chain_csv(chains_path, offsets, out_dir, "chains_updated")?,
        chain_table_path: rewrite_chain_csv(
            chain_table_path,
            offsets,
            out_dir,
            "chain_table_updated",
        )?,
    })
}

/// Appends the second CSV (minus its header) to the first, replacing any
/// existing output file.
pub fn merge_csv_files(first: &Path, second: &Path, output: &Path) -> Result<()> {
    let mut records = Vec::new();
    let mut r1 = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_path(first)?;
    for record in r1.records() {
        records.push(record?);
    }
    let mut r2 = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_path(second)?;
    for (i, record) in r2.records().enumerate() {
        if i == 0 {
            continue;
        }
        records.push(record?);
    }

    if output.exists() {
        std::fs::remove_file(output)?;
    }
    let mut writer = csv::WriterBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_path(output)?;
    for record in &records {
        writer.write_record(record)?;
    }
    writer.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::topology::parse_chain_table;
    use std::io::Read;

    #[test]
    fn encode_decode_are_inverses() {
        for &(chain_index, disk_index) in &[(0, 0), (1, 0), (99_999, 999), (12, 3), (8, 1)] {
            let id = encode_chain_id(chain_index, disk_index);
            let (ci, di) = decode_chain_id(&id.to_string()).unwrap();
            assert_eq!((ci, di), (chain_index, disk_index));
        }
    }

    #[test]
    fn decode_samples() {
        assert_eq!(decode_chain_id("100000001").unwrap(), (1, 0));
        // 900300101: index 101 on disk 3 (prefix 9)
        assert_eq!(decode_chain_id("900300101").unwrap(), (101, 3));
        assert!(decode_chain_id("not-a-number").is_err());
    }

    #[test]
    fn per_disk_maxima() {
        let table = "header\n\
            900000012 - - SERVING 100(SERVING-UPTODATE)\n\
            900000005 - - SERVING 100(SERVING-UPTODATE)\n\
            900100007 - - SERVING 100(SERVING-UPTODATE)\n";
        let chains = parse_chain_table(table);
        let maxima = max_chain_index_per_disk(&chains);
        assert_eq!(maxima.get(&0), Some(&12));
        assert_eq!(maxima.get(&1), Some(&7));
    }

    #[test]
    fn merged_indices_start_past_the_high_water_mark() {
        // live maxima {disk 0: 12, disk 1: 7}; fragment indices start at 0
        let live = "header\n\
            900000012 - - SERVING 100(SERVING-UPTODATE)\n\
            900100007 - - SERVING 100(SERVING-UPTODATE)\n";
        let offsets = merge_offsets(&parse_chain_table(live));
        assert_eq!(offsets.get(&0), Some(&13));
        assert_eq!(offsets.get(&1), Some(&8));

        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("chains.csv");
        std::fs::write(
            &src,
            "ChainId,TargetId\n900000000,101000300101\n900100000,101000300102\n900100001,101000300103\n",
        )
        .unwrap();

        let out = rewrite_chain_csv(&src, &offsets, dir.path(), "chains_updated").unwrap();
        let mut text = String::new();
        std::fs::File::open(&out)
            .unwrap()
            .read_to_string(&mut text)
            .unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "ChainId,TargetId");
        // disk 0 starts at 13, disk 1 at 8; nothing collides with the live ids
        assert!(lines[1].starts_with("900000013,"));
        assert!(lines[2].starts_with("900100008,"));
        assert!(lines[3].starts_with("900100009,"));
        // other columns preserved verbatim
        assert!(lines[1].ends_with(",101000300101"));
    }

    #[test]
    fn rewrite_target_file_offsets_chain_ids_only() {
        let mut offsets = HashMap::new();
        offsets.insert(3u32, 100u32);

        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("create_target_cmd.txt");
        std::fs::write(
            &src,
            "create-target --node-id 10003 --disk-index 2 --target-id 101000300319 --chain-id 900300101\n\
             # a comment line without flags\n",
        )
        .unwrap();

        let out = rewrite_target_file(&src, &offsets, dir.path()).unwrap();
        let text = std::fs::read_to_string(&out).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert!(lines[0].contains("--chain-id 900300201"));
        // target id untouched
        assert!(lines[0].contains("--target-id 101000300319"));
        assert_eq!(lines[1], "# a comment line without flags");
    }

    #[test]
    fn node_substitution_replaces_first_occurrence() {
        assert_eq!(
            replace_node_in_target_id("101000300101", 10003, 10011),
            "101001100101"
        );
    }

    #[test]
    fn merge_csv_drops_second_header() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a.csv");
        let b = dir.path().join("b.csv");
        let out = dir.path().join("out.csv");
        std::fs::write(&a, "ChainId,TargetId\n1,100\n").unwrap();
        std::fs::write(&b, "ChainId,TargetId\n2,200\n").unwrap();

        merge_csv_files(&a, &b, &out).unwrap();
        let text = std::fs::read_to_string(&out).unwrap();
        assert_eq!(text, "ChainId,TargetId\n1,100\n2,200\n");
    }
}
