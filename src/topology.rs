//! Processor, cache and NUMA layout of the host, read from sysfs.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::fs;
use std::io;
use std::path::Path;

use tracing::debug;

pub const MIN_CACHE_LEVEL: usize = 1;
pub const MAX_CACHE_LEVEL: usize = 3;

/// Inclusive on both ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CpuRange {
    pub lo: usize,
    pub hi: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NumaNode {
    pub numa_node_number: usize,
    pub ranges: Vec<CpuRange>,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CacheLevelStats {
    pub n_caches: usize,
    pub total_bytes: u64,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct HostTopology {
    pub numa_nodes: Vec<NumaNode>,
    pub n_physical_processors: usize,
    pub n_logical_processors: usize,
    /// Index 0 is L1.
    pub caches: [CacheLevelStats; MAX_CACHE_LEVEL],
}

impl HostTopology {
    pub fn cache_level(&self, level: usize) -> &CacheLevelStats {
        assert!((MIN_CACHE_LEVEL..=MAX_CACHE_LEVEL).contains(&level));
        &self.caches[level - 1]
    }
}

// Same shape as the harness's host-info YAML.
impl fmt::Display for HostTopology {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "numa_nodes:")?;
        for nn in &self.numa_nodes {
            writeln!(f, "  -")?;
            writeln!(f, "    numa_node_number: {}", nn.numa_node_number)?;
            // Linux has no processor groups.
            writeln!(f, "    cpu_group_number: 0")?;
            writeln!(f, "    ranges:")?;
            for r in &nn.ranges {
                writeln!(f, "      - {{ lo: {}, hi: {} }}", r.lo, r.hi)?;
            }
        }
        writeln!(f, "n_physical_processors: {}", self.n_physical_processors)?;
        writeln!(f, "n_logical_processors: {}", self.n_logical_processors)?;
        writeln!(f, "caches:")?;
        for level in MIN_CACHE_LEVEL..=MAX_CACHE_LEVEL {
            let stats = self.cache_level(level);
            writeln!(f, "  l{}: {{ n_caches: {}, total_bytes: {} }}", level, stats.n_caches, stats.total_bytes)?;
        }
        Ok(())
    }
}

/// Parse a kernel cpu list such as `0-3,8,10-11`.
pub fn parse_cpu_list(s: &str) -> Option<Vec<usize>> {
    let mut cpus = Vec::new();
    for part in s.trim().split(',').filter(|p| !p.is_empty()) {
        match part.split_once('-') {
            Some((lo, hi)) => {
                let lo: usize = lo.trim().parse().ok()?;
                let hi: usize = hi.trim().parse().ok()?;
                if hi < lo {
                    return None;
                }
                cpus.extend(lo..=hi);
            }
            None => cpus.push(part.trim().parse().ok()?),
        }
    }
    Some(cpus)
}

/// Coalesce ascending cpu numbers into runs.
pub fn ranges_from_numbers(ns: impl IntoIterator<Item = usize>) -> Vec<CpuRange> {
    let mut ranges: Vec<CpuRange> = Vec::new();
    for n in ns {
        match ranges.last_mut() {
            Some(last) if n == last.hi + 1 => last.hi = n,
            _ => ranges.push(CpuRange { lo: n, hi: n }),
        }
    }
    ranges
}

/// Parse a sysfs cache size: `32K`, `8M`, `1G`, or plain bytes.
pub fn parse_cache_size(s: &str) -> Option<u64> {
    let s = s.trim();
    let (digits, mult) = match s.chars().last()? {
        'K' => (&s[..s.len() - 1], 1u64 << 10),
        'M' => (&s[..s.len() - 1], 1 << 20),
        'G' => (&s[..s.len() - 1], 1 << 30),
        _ => (s, 1),
    };
    digits.parse::<u64>().ok()?.checked_mul(mult)
}

fn read_trimmed(path: &Path) -> io::Result<String> {
    Ok(fs::read_to_string(path)?.trim().to_string())
}

fn invalid(path: &Path) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, format!("unexpected contents in {}", path.display()))
}

/// Entries of `dir` named `<prefix><number>`, sorted by number.
fn numbered_entries(dir: &Path, prefix: &str) -> io::Result<Vec<(usize, std::path::PathBuf)>> {
    let mut out = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name();
        let Some(num) = name.to_str().and_then(|n| n.strip_prefix(prefix)).and_then(|n| n.parse::<usize>().ok()) else {
            continue;
        };
        out.push((num, entry.path()));
    }
    out.sort_by_key(|(n, _)| *n);
    Ok(out)
}

fn is_online(cpu_dir: &Path) -> io::Result<bool> {
    match read_trimmed(&cpu_dir.join("online")) {
        Ok(s) => Ok(s != "0"),
        // cpu0 often has no `online` file because it can't be taken offline.
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(true),
        Err(e) => Err(e),
    }
}

/// Read the topology from a sysfs tree rooted at `sysfs_root` (normally `/sys`).
pub fn read_topology(sysfs_root: &Path) -> io::Result<HostTopology> {
    let mut topo = HostTopology::default();

    let cpu_root = sysfs_root.join("devices/system/cpu");
    let mut cores = BTreeSet::new();
    // (level, type, shared_cpu_list) identifies one physical cache.
    let mut caches: BTreeMap<(usize, String, String), u64> = BTreeMap::new();

    for (cpu, cpu_dir) in numbered_entries(&cpu_root, "cpu")? {
        if !is_online(&cpu_dir)? {
            continue;
        }
        topo.n_logical_processors += 1;

        let package_path = cpu_dir.join("topology/physical_package_id");
        let core_path = cpu_dir.join("topology/core_id");
        let package: i64 = read_trimmed(&package_path)?.parse().map_err(|_| invalid(&package_path))?;
        let core: i64 = read_trimmed(&core_path)?.parse().map_err(|_| invalid(&core_path))?;
        cores.insert((package, core));

        let cache_dir = cpu_dir.join("cache");
        if !cache_dir.is_dir() {
            continue;
        }
        for (_, index_dir) in numbered_entries(&cache_dir, "index")? {
            let level_path = index_dir.join("level");
            let size_path = index_dir.join("size");
            let level: usize = read_trimmed(&level_path)?.parse().map_err(|_| invalid(&level_path))?;
            if !(MIN_CACHE_LEVEL..=MAX_CACHE_LEVEL).contains(&level) {
                debug!(cpu, level, "ignoring cache outside L1-L3");
                continue;
            }
            let size = parse_cache_size(&read_trimmed(&size_path)?).ok_or_else(|| invalid(&size_path))?;
            let kind = read_trimmed(&index_dir.join("type")).unwrap_or_default();
            let shared = read_trimmed(&index_dir.join("shared_cpu_list")).unwrap_or_else(|_| cpu.to_string());
            caches.insert((level, kind, shared), size);
        }
    }

    topo.n_physical_processors = cores.len();
    for ((level, _, _), size) in caches {
        let stats = &mut topo.caches[level - 1];
        stats.n_caches += 1;
        stats.total_bytes += size;
    }

    let node_root = sysfs_root.join("devices/system/node");
    if node_root.is_dir() {
        for (number, node_dir) in numbered_entries(&node_root, "node")? {
            let cpulist_path = node_dir.join("cpulist");
            let cpus = parse_cpu_list(&read_trimmed(&cpulist_path)?).ok_or_else(|| invalid(&cpulist_path))?;
            // Memory-only nodes have no cpus; they don't matter for placement.
            if cpus.is_empty() {
                continue;
            }
            topo.numa_nodes.push(NumaNode { numa_node_number: number, ranges: ranges_from_numbers(cpus) });
        }
    }

    Ok(topo)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn cpu_lists() {
        assert_eq!(parse_cpu_list("0-3,8,10-11"), Some(vec![0, 1, 2, 3, 8, 10, 11]));
        assert_eq!(parse_cpu_list("5\n"), Some(vec![5]));
        assert_eq!(parse_cpu_list(""), Some(vec![]));
        assert_eq!(parse_cpu_list("3-1"), None);
        assert_eq!(parse_cpu_list("a-b"), None);
    }

    #[test]
    fn ranges() {
        assert_eq!(
            ranges_from_numbers([0, 1, 2, 4, 6, 7]),
            vec![CpuRange { lo: 0, hi: 2 }, CpuRange { lo: 4, hi: 4 }, CpuRange { lo: 6, hi: 7 }]
        );
        assert!(ranges_from_numbers([]).is_empty());
    }

    #[test]
    fn cache_sizes() {
        assert_eq!(parse_cache_size("32K"), Some(32 * 1024));
        assert_eq!(parse_cache_size("8M"), Some(8 * 1024 * 1024));
        assert_eq!(parse_cache_size("4096"), Some(4096));
        assert_eq!(parse_cache_size("K"), None);
        assert_eq!(parse_cache_size(""), None);
    }

    struct FakeSysfs {
        dir: tempfile::TempDir,
    }

    impl FakeSysfs {
        fn new() -> Self {
            Self { dir: tempfile::tempdir().unwrap() }
        }

        fn write(&self, rel: &str, contents: &str) {
            let p: PathBuf = self.dir.path().join(rel);
            fs::create_dir_all(p.parent().unwrap()).unwrap();
            fs::write(p, contents).unwrap();
        }

        /// 2 cores x 2 threads in one package. Per-core L1d/L1i/L2, one shared L3.
        fn smt_host() -> Self {
            let s = Self::new();
            let siblings = ["0-1", "0-1", "2-3", "2-3"];
            for cpu in 0..4 {
                let base = format!("devices/system/cpu/cpu{cpu}");
                s.write(&format!("{base}/topology/physical_package_id"), "0\n");
                s.write(&format!("{base}/topology/core_id"), &format!("{}\n", cpu / 2));
                if cpu != 0 {
                    s.write(&format!("{base}/online"), "1\n");
                }
                let caches = [
                    (1, "Data", "32K", siblings[cpu]),
                    (1, "Instruction", "32K", siblings[cpu]),
                    (2, "Unified", "512K", siblings[cpu]),
                    (3, "Unified", "8M", "0-3"),
                ];
                for (i, (level, kind, size, shared)) in caches.iter().enumerate() {
                    let idx = format!("{base}/cache/index{i}");
                    s.write(&format!("{idx}/level"), &format!("{level}\n"));
                    s.write(&format!("{idx}/type"), &format!("{kind}\n"));
                    s.write(&format!("{idx}/size"), &format!("{size}\n"));
                    s.write(&format!("{idx}/shared_cpu_list"), &format!("{shared}\n"));
                }
            }
            s.write("devices/system/node/node0/cpulist", "0-3\n");
            s
        }
    }

    #[test]
    fn reads_an_smt_host() {
        let s = FakeSysfs::smt_host();
        let t = read_topology(s.dir.path()).unwrap();
        assert_eq!(t.n_logical_processors, 4);
        assert_eq!(t.n_physical_processors, 2);
        assert_eq!(*t.cache_level(1), CacheLevelStats { n_caches: 4, total_bytes: 4 * 32 * 1024 });
        assert_eq!(*t.cache_level(2), CacheLevelStats { n_caches: 2, total_bytes: 2 * 512 * 1024 });
        assert_eq!(*t.cache_level(3), CacheLevelStats { n_caches: 1, total_bytes: 8 * 1024 * 1024 });
        assert_eq!(t.numa_nodes, vec![NumaNode { numa_node_number: 0, ranges: vec![CpuRange { lo: 0, hi: 3 }] }]);
    }

    #[test]
    fn offline_cpus_and_memory_only_nodes_are_skipped() {
        let s = FakeSysfs::smt_host();
        s.write("devices/system/cpu/cpu3/online", "0\n");
        s.write("devices/system/node/node1/cpulist", "\n");
        // Not a cpu directory.
        s.write("devices/system/cpu/cpufreq/boost", "1\n");
        let t = read_topology(s.dir.path()).unwrap();
        assert_eq!(t.n_logical_processors, 3);
        assert_eq!(t.n_physical_processors, 2);
        assert_eq!(t.numa_nodes.len(), 1);
    }

    #[test]
    fn renders_host_info_yaml() {
        let s = FakeSysfs::smt_host();
        let text = read_topology(s.dir.path()).unwrap().to_string();
        assert!(text.starts_with("numa_nodes:\n  -\n    numa_node_number: 0\n    cpu_group_number: 0\n    ranges:\n      - { lo: 0, hi: 3 }\n"));
        assert!(text.contains("n_physical_processors: 2\nn_logical_processors: 4\n"));
        assert!(text.ends_with("  l3: { n_caches: 1, total_bytes: 8388608 }\n"));
    }

    #[test]
    fn garbage_is_reported() {
        let s = FakeSysfs::smt_host();
        s.write("devices/system/cpu/cpu1/topology/core_id", "core one\n");
        let err = read_topology(s.dir.path()).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }
}
