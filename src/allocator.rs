// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! # CPU tree allocator
//!
//! Decides where in a [`CpuTree`] a group of pinned CPUs should grow or
//! shrink. [`CpuTreeAllocator::resize_cpus`] takes the group's current CPU
//! set, the set of CPUs owned by nobody, and a signed CPU count, and
//! returns candidate sets: free CPUs to allocate from, or owned CPUs to
//! release from. The caller applies the actual ownership change; the
//! allocator itself is pure, performs no I/O, and holds no state beyond its
//! options and a borrow of the tree.
//!
//! Every node that survives a feasibility filter is scored by how the
//! current and free CPUs are distributed along the node's path from the
//! root, and the best-ranked node's spans are returned. Growth lands in the
//! tightest topological enclosure that can host it; release thins out the
//! regions where the group holds the fewest CPUs, defragmenting ownership
//! back toward dense enclosures.

use crate::cpumask::Cpumask;
use crate::topology::{CpuTree, CpuTreeNode};
use anyhow::bail;
use anyhow::Result;
use std::cmp::Ordering;
use std::fmt;

/// Parameters for a CPU tree allocator.
#[derive(Clone, Copy, Debug, Default)]
pub struct CpuTreeAllocatorOptions {
    /// Prefer spreading allocations across the topology for isolation
    /// instead of packing them into already occupied regions.
    pub topology_balancing: bool,
}

/// Chooses the topology tree nodes to allocate CPUs from and to release
/// them from. Allocators borrow the tree; any number of them may share one.
pub struct CpuTreeAllocator<'a> {
    tree: &'a CpuTree,
    options: CpuTreeAllocatorOptions,
}

impl CpuTree {
    /// Return a new allocator for CPUs in this tree.
    pub fn new_allocator(&self, options: CpuTreeAllocatorOptions) -> CpuTreeAllocator<'_> {
        CpuTreeAllocator {
            tree: self,
            options,
        }
    }
}

/// Attributes of one tree node gathered against a current and a free CPU
/// set. The count vectors accumulate along the path from the root, one
/// entry per depth up to and including the node itself; they are the sort
/// keys for ranking nodes against each other.
struct CpuTreeNodeAttributes<'a> {
    node: &'a CpuTreeNode,
    /// Position in the emitted pre-order sequence, the final tie-break.
    index: usize,
    depth: usize,
    current_cpus: Cpumask,
    free_cpus: Cpumask,
    current_cpu_count: usize,
    current_cpu_counts: Vec<usize>,
    free_cpu_count: usize,
    free_cpu_counts: Vec<usize>,
}

impl fmt::Debug for CpuTreeNodeAttributes<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}{{{},{:?},{},{:?}}}",
            self.node.name,
            self.depth,
            self.current_cpu_counts,
            self.free_cpu_count,
            self.free_cpu_counts
        )
    }
}

/// Walk the tree in pre-order and collect attributes for every node the
/// filter accepts. A rejected node prunes its whole subtree.
fn to_attributed_vec<'a, F>(
    tree: &'a CpuTree,
    current_cpus: &Cpumask,
    free_cpus: &Cpumask,
    filter: &F,
) -> Vec<CpuTreeNodeAttributes<'a>>
where
    F: Fn(&CpuTreeNodeAttributes) -> bool,
{
    let mut tnas = Vec::new();
    attribute_node(
        tree,
        CpuTree::ROOT,
        0,
        current_cpus,
        free_cpus,
        filter,
        &[],
        &[],
        &mut tnas,
    );
    tnas
}

#[allow(clippy::too_many_arguments)]
fn attribute_node<'a, F>(
    tree: &'a CpuTree,
    id: usize,
    depth: usize,
    current_cpus: &Cpumask,
    free_cpus: &Cpumask,
    filter: &F,
    current_counts: &[usize],
    free_counts: &[usize],
    tnas: &mut Vec<CpuTreeNodeAttributes<'a>>,
) where
    F: Fn(&CpuTreeNodeAttributes) -> bool,
{
    let node = tree.node(id);
    let current_here = node.cpus.and(current_cpus);
    let free_here = node.cpus.and(free_cpus);

    let mut current_counts_here = Vec::with_capacity(depth + 1);
    current_counts_here.extend_from_slice(current_counts);
    current_counts_here.push(current_here.weight());

    let mut free_counts_here = Vec::with_capacity(depth + 1);
    free_counts_here.extend_from_slice(free_counts);
    free_counts_here.push(free_here.weight());

    let tna = CpuTreeNodeAttributes {
        node,
        index: tnas.len(),
        depth,
        current_cpu_count: current_here.weight(),
        free_cpu_count: free_here.weight(),
        current_cpus: current_here,
        free_cpus: free_here,
        current_cpu_counts: current_counts_here,
        free_cpu_counts: free_counts_here,
    };

    if !filter(&tna) {
        return;
    }

    let current_counts = tna.current_cpu_counts.clone();
    let free_counts = tna.free_cpu_counts.clone();
    tnas.push(tna);
    for &child in &node.children {
        attribute_node(
            tree,
            child,
            depth + 1,
            current_cpus,
            free_cpus,
            filter,
            &current_counts,
            &free_counts,
            tnas,
        );
    }
}

impl CpuTreeAllocator<'_> {
    /// Ordering whose first element is the best node for allocating new
    /// CPUs. Deepest nodes first: the deepest feasible node is the tightest
    /// enclosure that can still host the growth. Among equally deep nodes,
    /// maximize the current CPU counts along the path, as high in the
    /// topology as possible, so growth stays in regions the group already
    /// occupies. Free CPU counts break the remaining ties: when packing,
    /// carve out of the region with the fewest free CPUs so untouched
    /// regions stay untouched; when balancing, the most free CPUs, pushing
    /// groups apart. Equal keys fall back to emission order, later nodes
    /// first.
    fn compare_allocate(
        &self,
        a: &CpuTreeNodeAttributes,
        b: &CpuTreeNodeAttributes,
    ) -> Ordering {
        b.depth
            .cmp(&a.depth)
            .then_with(|| b.current_cpu_counts.cmp(&a.current_cpu_counts))
            .then_with(|| {
                if self.options.topology_balancing {
                    b.free_cpu_counts.cmp(&a.free_cpu_counts)
                } else {
                    a.free_cpu_counts.cmp(&b.free_cpu_counts)
                }
            })
            .then_with(|| b.index.cmp(&a.index))
    }

    /// Ordering whose first element is the best node for releasing a CPU.
    /// Deepest nodes first, then minimize the current CPU counts along the
    /// path: releasing where the group holds the fewest CPUs thins out
    /// stragglers and defragments ownership, as high in the topology as
    /// possible. Then minimize the free CPU counts, returning CPUs to
    /// regions where free CPUs are scarce, which raises the minimum
    /// headroom across the topology regardless of the balancing mode. Equal
    /// keys fall back to emission order, earlier nodes first.
    fn compare_release(
        &self,
        a: &CpuTreeNodeAttributes,
        b: &CpuTreeNodeAttributes,
    ) -> Ordering {
        b.depth
            .cmp(&a.depth)
            .then_with(|| a.current_cpu_counts.cmp(&b.current_cpu_counts))
            .then_with(|| a.free_cpu_counts.cmp(&b.free_cpu_counts))
            .then_with(|| a.index.cmp(&b.index))
    }

    /// Plan adding CPUs to or removing CPUs from a group. Returns CPU sets
    /// from which the actual allocation or release can be done; ownership
    /// itself is not touched.
    ///
    /// Parameters:
    /// - `current_cpus`: CPUs already owned by the group being resized.
    /// - `free_cpus`: CPUs owned by nobody.
    /// - `delta`: number of CPUs to add (positive) or remove (negative).
    ///
    /// Return values:
    /// - `add_from` contains free CPUs from which `delta` CPUs can be
    ///   allocated. The set may be larger than `delta`; there is room for
    ///   other allocation logic to choose between these CPUs.
    /// - `remove_from` contains CPUs of `current_cpus` from which exactly
    ///   `-delta` CPUs can be freed. It is empty when growing, and
    ///   `add_from` is empty when shrinking.
    pub fn resize_cpus(
        &self,
        current_cpus: &Cpumask,
        free_cpus: &Cpumask,
        delta: isize,
    ) -> Result<(Cpumask, Cpumask)> {
        if delta > 0 {
            return self.resize_once(current_cpus, free_cpus, delta);
        }
        // Remove CPUs one by one instead of looking for a single topology
        // element that could give up all of them at once.
        let mut current_cpus = current_cpus.clone();
        let mut free_cpus = free_cpus.clone();
        let mut remove_from = Cpumask::new();
        for n in 0..delta.unsigned_abs() {
            let (_, remove_single_from) = self.resize_once(&current_cpus, &free_cpus, -1)?;
            // Cheap consistency checks to capture issues in alternative
            // ranking schemes.
            if remove_single_from.weight() != 1 {
                bail!(
                    "internal error: failed to find a single cpu to release, current: {} free: {} got: {}",
                    current_cpus,
                    free_cpus,
                    remove_single_from
                );
            }
            if remove_from.or(&remove_single_from).weight() != n + 1 {
                bail!(
                    "internal error: double release of a cpu, current: {} free: {} already released: {} releasing: {}",
                    current_cpus,
                    free_cpus,
                    remove_from,
                    remove_single_from
                );
            }
            remove_from |= &remove_single_from;
            current_cpus = current_cpus.diff(&remove_single_from);
            free_cpus |= &remove_single_from;
        }
        Ok((Cpumask::new(), remove_from))
    }

    fn resize_once(
        &self,
        current_cpus: &Cpumask,
        free_cpus: &Cpumask,
        delta: isize,
    ) -> Result<(Cpumask, Cpumask)> {
        // Branches without enough free CPUs to host the growth, or with
        // nothing to release, are pruned entirely.
        let mut tnas = to_attributed_vec(self.tree, current_cpus, free_cpus, &|tna| {
            if delta > 0 {
                tna.free_cpu_count as isize >= delta
            } else {
                tna.current_cpu_count as isize >= -delta
            }
        });

        if delta > 0 {
            tnas.sort_by(|a, b| self.compare_allocate(a, b));
        } else {
            tnas.sort_by(|a, b| self.compare_release(a, b));
        }

        match tnas.first() {
            Some(best) => Ok((best.free_cpus.clone(), best.current_cpus.clone())),
            None if delta > 0 => bail!("not enough free CPUs"),
            None => bail!("not enough CPUs to release"),
        }
    }
}
