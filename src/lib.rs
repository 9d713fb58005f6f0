// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! # CPU tree
//!
//! A crate that models the host's CPU topology as a tree and decides where
//! in that tree a group of pinned CPUs should grow or shrink.
//!
//! A CpuTree is a hierarchy of named nodes, one level per topological
//! enclosure, where every node spans the CPUs of all its descendants and
//! leaves are hardware threads:
//!
//!```text
//!                          system
//!                         /      \
//!                       p0        p1           package
//!                      /  \      /  \
//!                  p0d0    p0d1 ...            die
//!                 /    \
//!            p0d0n0    p0d0n1                  numa
//!             /   \
//!      p0d0n0cpu0  p0d0n0cpu2                  core
//!         /   \
//! p0d0n0cpu0t0 p0d0n0cpu0t1                    thread
//!```
//!
//! CPU-pinning policies keep one CPU set per workload group plus a set of
//! CPUs owned by nobody. Resizing a group is the hard part: which free CPUs
//! should it grow into, and which of its own CPUs should it give up, so that
//! ownership stays topologically tight? [`CpuTreeAllocator`] answers exactly
//! that: it walks the tree, scores every feasible node by how the group's
//! current CPUs and the free CPUs are distributed along the node's path from
//! the root, and hands back candidate sets. It never mutates ownership
//! itself.
//!
//! Creating a tree
//! ---------------
//!
//! On a live host the tree is discovered from sysfs once and treated as
//! immutable afterwards:
//!
//!```no_run
//!     use cputree::new_tree_from_system;
//!     let tree = new_tree_from_system().unwrap();
//!```
//!
//! Trees can also be built by hand, leaves populating their ancestors:
//!
//!```
//!     use cputree::{CpuTopologyLevel, CpuTree, CpuTreeAllocatorOptions, Cpumask};
//!
//!     let mut tree = CpuTree::new("system", CpuTopologyLevel::System);
//!     for p in 0..2 {
//!         let package = tree.add_child(
//!             CpuTree::ROOT,
//!             format!("p{}", p),
//!             CpuTopologyLevel::Package,
//!         );
//!         for t in 0..2 {
//!             let cpu = p * 2 + t;
//!             let thread = tree.add_child(
//!                 package,
//!                 format!("p{}t{}", p, t),
//!                 CpuTopologyLevel::Thread,
//!             );
//!             tree.add_cpus(thread, &[cpu].into_iter().collect());
//!         }
//!     }
//!
//!     let allocator = tree.new_allocator(CpuTreeAllocatorOptions::default());
//!     let current = Cpumask::new();
//!     let free = tree.root().cpus.clone();
//!     let (add_from, _) = allocator.resize_cpus(&current, &free, 1).unwrap();
//!     assert_eq!(add_from.weight(), 1);
//!```
//!
//! The returned `add_from` is a candidate pool: it may contain more CPUs
//! than were asked for, and the caller picks which ones to take (ascending
//! id order in practice).

mod cpumask;
pub use cpumask::read_cpulist;
pub use cpumask::Cpumask;
pub use cpumask::CpumaskIterator;

pub mod misc;

mod topology;
pub use topology::new_tree_from_system;
pub use topology::CpuTopologyLevel;
pub use topology::CpuTree;
pub use topology::CpuTreeNode;
pub use topology::WalkAction;

mod allocator;
pub use allocator::CpuTreeAllocator;
pub use allocator::CpuTreeAllocatorOptions;
