// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! # CPU topology tree
//!
//! The host's CPU hierarchy modelled as a tree of named nodes. Each node
//! carries a topology level tag and the set of CPUs spanned by its subtree;
//! leaves are hardware threads holding exactly one CPU id. The tree is built
//! once, either from sysfs with [`new_tree_from_system`] or by hand with
//! [`CpuTree::add_child`] and [`CpuTree::add_cpus`], and is read-only
//! afterwards. If the host topology changes (e.g. hotplug), a new tree
//! should be built.
//!
//! Nodes live in an arena owned by the [`CpuTree`]; parent and child links
//! are arena indices, so trees are cycle-free by construction and cheap to
//! traverse. [`CpuTree::depth_first_walk`] visits nodes in pre-order under
//! the control of the visitor's [`WalkAction`] return value.

use crate::cpumask::read_cpulist;
use crate::cpumask::Cpumask;
use crate::misc::read_from_file;
use anyhow::anyhow;
use anyhow::bail;
use anyhow::Result;
use glob::glob;
use log::warn;
use serde::de;
use serde::de::Visitor;
use serde::Deserialize;
use serde::Deserializer;
use serde::Serialize;
use serde::Serializer;
use sscanf::sscanf;
use std::collections::BTreeMap;
use std::env;
use std::fmt;
use std::path::Path;
use std::str::FromStr;

lazy_static::lazy_static! {
    /// Prefix prepended to all sysfs paths read by topology discovery. Set
    /// the CPUTREE_SYSFS_PREFIX environment variable to point discovery at
    /// an alternate sysfs root.
    static ref ROOT_PREFIX: String =
        env::var("CPUTREE_SYSFS_PREFIX").unwrap_or("".to_string());
}

/// One level of the CPU topology hierarchy, ordered coarsest to finest.
/// Level tags are carried for diagnostics; no allocation decision switches
/// on them.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum CpuTopologyLevel {
    Undefined,
    System,
    Package,
    Die,
    Numa,
    Core,
    Thread,
}

const LEVEL_NAMES: [&str; 7] = [
    "undefined",
    "system",
    "package",
    "die",
    "numa",
    "core",
    "thread",
];

impl CpuTopologyLevel {
    pub fn name(&self) -> &'static str {
        LEVEL_NAMES[*self as usize]
    }

    fn from_ordinal(ordinal: usize) -> Option<CpuTopologyLevel> {
        match ordinal {
            0 => Some(CpuTopologyLevel::Undefined),
            1 => Some(CpuTopologyLevel::System),
            2 => Some(CpuTopologyLevel::Package),
            3 => Some(CpuTopologyLevel::Die),
            4 => Some(CpuTopologyLevel::Numa),
            5 => Some(CpuTopologyLevel::Core),
            6 => Some(CpuTopologyLevel::Thread),
            _ => None,
        }
    }
}

impl fmt::Display for CpuTopologyLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl FromStr for CpuTopologyLevel {
    type Err = anyhow::Error;

    /// Parse a level from its case-insensitive name or its decimal ordinal.
    fn from_str(s: &str) -> Result<Self> {
        if let Ok(ordinal) = s.parse::<usize>() {
            return Self::from_ordinal(ordinal)
                .ok_or_else(|| anyhow!("unknown CPU topology level {:?}", s));
        }
        let name = s.to_lowercase();
        LEVEL_NAMES
            .iter()
            .position(|n| *n == name)
            .and_then(Self::from_ordinal)
            .ok_or_else(|| anyhow!("unknown CPU topology level {:?}", s))
    }
}

impl Serialize for CpuTopologyLevel {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(self.name())
    }
}

struct CpuTopologyLevelVisitor;

impl Visitor<'_> for CpuTopologyLevelVisitor {
    type Value = CpuTopologyLevel;

    fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "a CPU topology level name or ordinal")
    }

    fn visit_str<E>(self, value: &str) -> Result<Self::Value, E>
    where
        E: de::Error,
    {
        value.parse::<CpuTopologyLevel>().map_err(de::Error::custom)
    }

    fn visit_u64<E>(self, value: u64) -> Result<Self::Value, E>
    where
        E: de::Error,
    {
        usize::try_from(value)
            .ok()
            .and_then(CpuTopologyLevel::from_ordinal)
            .ok_or_else(|| de::Error::custom(format!("unknown CPU topology level {}", value)))
    }

    fn visit_i64<E>(self, value: i64) -> Result<Self::Value, E>
    where
        E: de::Error,
    {
        usize::try_from(value)
            .ok()
            .and_then(CpuTopologyLevel::from_ordinal)
            .ok_or_else(|| de::Error::custom(format!("unknown CPU topology level {}", value)))
    }
}

impl<'de> Deserialize<'de> for CpuTopologyLevel {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        deserializer.deserialize_any(CpuTopologyLevelVisitor)
    }
}

/// A node in a [`CpuTree`]. `cpus` spans the node's whole subtree: it is
/// the union of the children's `cpus`, and sibling spans are disjoint.
#[derive(Debug)]
pub struct CpuTreeNode {
    pub name: String,
    pub level: CpuTopologyLevel,
    pub parent: Option<usize>,
    pub children: Vec<usize>,
    pub cpus: Cpumask,
}

/// A CPU topology tree. Nodes are arena-allocated and addressed by index;
/// the root is always [`CpuTree::ROOT`].
#[derive(Debug)]
pub struct CpuTree {
    nodes: Vec<CpuTreeNode>,
}

/// Flow control returned by a [`CpuTree::depth_first_walk`] visitor.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum WalkAction {
    /// Continue to the next node.
    Continue,
    /// Continue to the next node but skip this node's descendants.
    SkipChildren,
    /// Stop the walk altogether.
    Stop,
}

impl CpuTree {
    pub const ROOT: usize = 0;

    /// Build a tree holding a single root node with an empty CPU set.
    pub fn new(name: impl Into<String>, level: CpuTopologyLevel) -> CpuTree {
        CpuTree {
            nodes: vec![CpuTreeNode {
                name: name.into(),
                level,
                parent: None,
                children: Vec::new(),
                cpus: Cpumask::new(),
            }],
        }
    }

    /// Create a new node with an empty CPU set and link it under `parent`.
    /// Returns the new node's index.
    pub fn add_child(
        &mut self,
        parent: usize,
        name: impl Into<String>,
        level: CpuTopologyLevel,
    ) -> usize {
        let id = self.nodes.len();
        self.nodes.push(CpuTreeNode {
            name: name.into(),
            level,
            parent: Some(parent),
            children: Vec::new(),
            cpus: Cpumask::new(),
        });
        self.nodes[parent].children.push(id);
        id
    }

    /// Add CPUs to a node and, transitively, to every ancestor up to the
    /// root. This is how leaves populate their ancestors during
    /// construction; once construction finishes the tree is treated as
    /// immutable.
    pub fn add_cpus(&mut self, node: usize, cpus: &Cpumask) {
        let mut next = Some(node);
        while let Some(id) = next {
            self.nodes[id].cpus |= cpus;
            next = self.nodes[id].parent;
        }
    }

    pub fn node(&self, id: usize) -> &CpuTreeNode {
        &self.nodes[id]
    }

    pub fn root(&self) -> &CpuTreeNode {
        &self.nodes[Self::ROOT]
    }

    /// Walk the tree in depth-first pre-order. Every node is passed to the
    /// handler, whose return value controls the walk: `Continue` descends
    /// into the node's children, `SkipChildren` skips them, and `Stop` ends
    /// the walk. Returns `Stop` if the handler stopped the walk, `Continue`
    /// if the walk ran to completion.
    pub fn depth_first_walk<F>(&self, handler: &mut F) -> WalkAction
    where
        F: FnMut(&CpuTreeNode) -> WalkAction,
    {
        self.walk_node(Self::ROOT, handler)
    }

    fn walk_node<F>(&self, id: usize, handler: &mut F) -> WalkAction
    where
        F: FnMut(&CpuTreeNode) -> WalkAction,
    {
        match handler(&self.nodes[id]) {
            WalkAction::Stop => return WalkAction::Stop,
            WalkAction::SkipChildren => return WalkAction::Continue,
            WalkAction::Continue => {}
        }
        for &child in &self.nodes[id].children {
            if self.walk_node(child, handler) == WalkAction::Stop {
                return WalkAction::Stop;
            }
        }
        WalkAction::Continue
    }

    fn fmt_node(&self, f: &mut fmt::Formatter<'_>, id: usize) -> fmt::Result {
        let node = &self.nodes[id];
        write!(f, "{}", node.name)?;
        if !node.children.is_empty() {
            write!(f, "[")?;
            for (i, &child) in node.children.iter().enumerate() {
                if i > 0 {
                    write!(f, " ")?;
                }
                self.fmt_node(f, child)?;
            }
            write!(f, "]")?;
        }
        Ok(())
    }
}

impl fmt::Display for CpuTree {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.fmt_node(f, Self::ROOT)
    }
}

fn cpus_online() -> Result<Cpumask> {
    let path = format!("{}/sys/devices/system/cpu/online", *ROOT_PREFIX);
    let online = std::fs::read_to_string(path)?;
    Cpumask::from_cpulist(&online)
}

/// Map NUMA node id to the online CPUs it holds. Memory-only nodes come
/// back with an empty CPU list.
fn numa_node_cpus(online: &Cpumask) -> Result<BTreeMap<usize, Vec<usize>>> {
    let mut nodes = BTreeMap::new();
    let pattern = format!("{}/sys/devices/system/node/node[0-9]*", *ROOT_PREFIX);
    for node_path in glob(&pattern)?.filter_map(Result::ok) {
        let node_name = match node_path.file_name().and_then(|n| n.to_str()) {
            Some(name) => name,
            None => continue,
        };
        let node_id = match sscanf!(node_name, "node{usize}") {
            Ok(id) => id,
            Err(_) => {
                bail!("Failed to parse NUMA node directory {:?}", node_path);
            }
        };
        let cpulist = std::fs::read_to_string(node_path.join("cpulist"))?;
        let cpus = read_cpulist(&cpulist)?
            .into_iter()
            .filter(|cpu| online.test_cpu(*cpu))
            .collect();
        nodes.insert(node_id, cpus);
    }
    Ok(nodes)
}

/// Build the system→package→die→numa→core→thread tree from sysfs.
///
/// NUMA nodes come from /sys/devices/system/node when the kernel exposes
/// it; otherwise all online CPUs land on a single node 0. Per-CPU placement
/// comes from each CPU's topology directory, with `die_id` defaulting to 0
/// on kernels that do not enumerate dies. Offline CPUs are skipped. Core
/// nodes are named after their lowest CPU id.
pub fn new_tree_from_system() -> Result<CpuTree> {
    let online = cpus_online()?;
    let node_dir = format!("{}/sys/devices/system/node", *ROOT_PREFIX);
    let node_cpus = if Path::new(&node_dir).exists() {
        numa_node_cpus(&online)?
    } else {
        warn!("NUMA enumeration not available in sysfs, assuming a single node");
        let mut nodes = BTreeMap::new();
        nodes.insert(0, online.iter().collect());
        nodes
    };

    // package -> die -> numa node -> core -> threads
    let mut packages: BTreeMap<usize, BTreeMap<usize, BTreeMap<usize, BTreeMap<usize, Vec<usize>>>>> =
        BTreeMap::new();
    for (node_id, cpus) in &node_cpus {
        for &cpu in cpus {
            let top_str = format!("{}/sys/devices/system/cpu/cpu{}/topology", *ROOT_PREFIX, cpu);
            let top_path = Path::new(&top_str);
            let package_id: usize = read_from_file(&top_path.join("physical_package_id"))?;
            let die_id: usize = read_from_file(&top_path.join("die_id")).unwrap_or(0);
            let core_id: usize = read_from_file(&top_path.join("core_id"))?;
            packages
                .entry(package_id)
                .or_default()
                .entry(die_id)
                .or_default()
                .entry(*node_id)
                .or_default()
                .entry(core_id)
                .or_default()
                .push(cpu);
        }
    }

    let mut tree = CpuTree::new("system", CpuTopologyLevel::System);
    for (package_id, dies) in &packages {
        let package = tree.add_child(
            CpuTree::ROOT,
            format!("p{}", package_id),
            CpuTopologyLevel::Package,
        );
        for (die_id, numas) in dies {
            let die = tree.add_child(
                package,
                format!("p{}d{}", package_id, die_id),
                CpuTopologyLevel::Die,
            );
            for (node_id, cores) in numas {
                let numa = tree.add_child(
                    die,
                    format!("p{}d{}n{}", package_id, die_id, node_id),
                    CpuTopologyLevel::Numa,
                );
                for threads in cores.values() {
                    let first = threads[0];
                    let core = tree.add_child(
                        numa,
                        format!("p{}d{}n{}cpu{}", package_id, die_id, node_id, first),
                        CpuTopologyLevel::Core,
                    );
                    for &cpu in threads {
                        let thread = tree.add_child(
                            core,
                            format!("p{}d{}n{}cpu{}t{}", package_id, die_id, node_id, first, cpu),
                            CpuTopologyLevel::Thread,
                        );
                        tree.add_cpus(thread, &[cpu].into_iter().collect());
                    }
                }
            }
        }
    }
    Ok(tree)
}


#[cfg(test)]
mod tests {
    use super::testgrid::tree_from_counts;
    use super::*;

    fn assert_sound(tree: &CpuTree, id: usize) {
        let node = tree.node(id);
        if node.children.is_empty() {
            if node.level == CpuTopologyLevel::Thread {
                assert_eq!(node.cpus.weight(), 1, "thread {} spans {}", node.name, node.cpus);
            }
            return;
        }
        let mut union = Cpumask::new();
        for &child_id in &node.children {
            let child = tree.node(child_id);
            assert!(
                child.cpus.and(&union).is_empty(),
                "sibling spans overlap under {}",
                node.name
            );
            union |= &child.cpus;
            assert_sound(tree, child_id);
        }
        assert_eq!(union, node.cpus, "{} does not span its children", node.name);
    }

    #[test]
    fn level_parse_and_format() {
        assert_eq!("numa".parse::<CpuTopologyLevel>().unwrap(), CpuTopologyLevel::Numa);
        assert_eq!("Package".parse::<CpuTopologyLevel>().unwrap(), CpuTopologyLevel::Package);
        assert_eq!("THREAD".parse::<CpuTopologyLevel>().unwrap(), CpuTopologyLevel::Thread);
        assert_eq!("3".parse::<CpuTopologyLevel>().unwrap(), CpuTopologyLevel::Die);
        assert_eq!("0".parse::<CpuTopologyLevel>().unwrap(), CpuTopologyLevel::Undefined);

        for level in [
            CpuTopologyLevel::Undefined,
            CpuTopologyLevel::System,
            CpuTopologyLevel::Package,
            CpuTopologyLevel::Die,
            CpuTopologyLevel::Numa,
            CpuTopologyLevel::Core,
            CpuTopologyLevel::Thread,
        ] {
            assert_eq!(level.to_string().parse::<CpuTopologyLevel>().unwrap(), level);
        }

        let err = "warp".parse::<CpuTopologyLevel>().unwrap_err();
        assert!(err.to_string().contains("warp"));
        let err = "7".parse::<CpuTopologyLevel>().unwrap_err();
        assert!(err.to_string().contains("7"));
    }

    #[test]
    fn level_serde() {
        let level: CpuTopologyLevel = serde_json::from_str("\"die\"").unwrap();
        assert_eq!(level, CpuTopologyLevel::Die);
        let level: CpuTopologyLevel = serde_json::from_str("\"NUMA\"").unwrap();
        assert_eq!(level, CpuTopologyLevel::Numa);
        let level: CpuTopologyLevel = serde_json::from_str("4").unwrap();
        assert_eq!(level, CpuTopologyLevel::Numa);
        assert_eq!(serde_json::to_string(&CpuTopologyLevel::Core).unwrap(), "\"core\"");
        assert!(serde_json::from_str::<CpuTopologyLevel>("\"warp\"").is_err());
        assert!(serde_json::from_str::<CpuTopologyLevel>("9").is_err());
    }

    #[test]
    fn add_cpus_propagates_to_ancestors() {
        let mut tree = CpuTree::new("system", CpuTopologyLevel::System);
        let package = tree.add_child(CpuTree::ROOT, "p0", CpuTopologyLevel::Package);
        let t0 = tree.add_child(package, "p0t0", CpuTopologyLevel::Thread);
        let t1 = tree.add_child(package, "p0t1", CpuTopologyLevel::Thread);
        tree.add_cpus(t0, &[0].into_iter().collect());
        tree.add_cpus(t1, &[1].into_iter().collect());

        assert_eq!(tree.node(t0).cpus, [0].into_iter().collect());
        assert_eq!(tree.node(package).cpus, [0, 1].into_iter().collect());
        assert_eq!(tree.root().cpus, [0, 1].into_iter().collect());
        assert_eq!(tree.to_string(), "system[p0[p0t0 p0t1]]");
    }

    #[test]
    fn grid_builder_is_sound() {
        let (tree, locs) = tree_from_counts([2, 2, 2, 2, 2]);
        assert_eq!(locs.len(), 32);
        assert_eq!(tree.root().cpus.weight(), 32);
        assert_sound(&tree, CpuTree::ROOT);
        assert_eq!(locs[0].thread, "p0d0n0c00t0");
        assert_eq!(locs[31].thread, "p1d1n1c01t1");
    }

    #[test]
    fn walk_visits_preorder_and_skips() {
        let (tree, _) = tree_from_counts([2, 2, 2, 2, 2]);

        let mut visited = Vec::new();
        let action = tree.depth_first_walk(&mut |node| {
            visited.push(node.name.clone());
            WalkAction::Continue
        });
        assert_eq!(action, WalkAction::Continue);
        assert_eq!(visited.len(), 63);
        assert_eq!(visited[0], "system");
        assert_eq!(visited[1], "p0");
        assert_eq!(visited[2], "p0d0");

        // Pruning at die level leaves the root, the packages and the dies.
        let mut count = 0;
        tree.depth_first_walk(&mut |node| {
            count += 1;
            if node.level == CpuTopologyLevel::Die {
                WalkAction::SkipChildren
            } else {
                WalkAction::Continue
            }
        });
        assert_eq!(count, 7);
    }

    #[test]
    fn walk_stops_early() {
        let (tree, _) = tree_from_counts([2, 2, 2, 2, 2]);
        let mut count = 0;
        let action = tree.depth_first_walk(&mut |node| {
            count += 1;
            if node.name == "p1" {
                WalkAction::Stop
            } else {
                WalkAction::Continue
            }
        });
        assert_eq!(action, WalkAction::Stop);
        // Root, the whole p0 subtree, then p1.
        assert_eq!(count, 33);
    }

    #[test]
    fn system_tree_smoke() {
        if !Path::new("/sys/devices/system/cpu/online").exists() {
            return;
        }
        let tree = match new_tree_from_system() {
            Ok(tree) => tree,
            // Hosts without full topology enumeration (minimal containers).
            Err(_) => return,
        };
        assert!(tree.root().cpus.weight() > 0);
        assert_sound(&tree, CpuTree::ROOT);
        tree.depth_first_walk(&mut |node| {
            if node.children.is_empty() {
                assert_eq!(node.level, CpuTopologyLevel::Thread);
                assert_eq!(node.cpus.weight(), 1);
            }
            WalkAction::Continue
        });
    }
}
