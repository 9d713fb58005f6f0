// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! # Cpumask
//!
//! A module for creating, reading, and manipulating sets of CPU ids.
//!
//! Cpumask
//! -------
//!
//! A Cpumask object is a BitVec of u64's along with a series of helper
//! functions for creating, manipulating, and reading it. The mask is
//! unbounded: storage grows in whole 64-bit words as ids are set, and two
//! masks holding the same ids are equal no matter how many words each
//! happens to carry.
//!
//! Empty Cpumasks can be created directly, from a kernel cpulist string, or
//! from a kernel hexadecimal mask string:
//!
//!```
//!     use cputree::Cpumask;
//!     let empty = Cpumask::new();
//!     let from_list = Cpumask::from_cpulist("0-3,8").unwrap();
//!     let from_hex = Cpumask::from_str("0xf0").unwrap();
//!```
//!
//! A Cpumask can be queried and updated using its helper functions:
//!
//!```
//!     use cputree::Cpumask;
//!     let mut mask = Cpumask::from_cpulist("0-3").unwrap();
//!     assert!(mask.test_cpu(2));
//!     mask.clear_cpu(2);
//!     assert_eq!(mask.to_string(), "0-1,3");
//!     assert_eq!(mask.weight(), 3);
//!```
//!
//! `Display` renders cpulist syntax; the `LowerHex`/`UpperHex` formatters
//! render the kernel's comma-grouped hexadecimal form.

use anyhow::bail;
use anyhow::Context;
use anyhow::Result;
use bitvec::prelude::*;
use sscanf::sscanf;
use std::fmt;
use std::ops::BitAndAssign;
use std::ops::BitOrAssign;

#[derive(Debug, Clone, Default)]
pub struct Cpumask {
    mask: BitVec<u64, Lsb0>,
}

impl Cpumask {
    /// Build a new empty Cpumask object.
    pub fn new() -> Cpumask {
        Default::default()
    }

    /// Build a Cpumask object from a hexadecimal string. The kernel's
    /// comma-grouped form and `_` separators are accepted.
    pub fn from_str(cpumask: &str) -> Result<Cpumask> {
        let hex_str = {
            let mut tmp_str = cpumask
                .strip_prefix("0x")
                .unwrap_or(cpumask)
                .replace(['_', ','], "");
            if tmp_str.len() % 2 != 0 {
                tmp_str = "0".to_string() + &tmp_str;
            }
            tmp_str
        };
        let byte_vec =
            hex::decode(&hex_str).with_context(|| format!("Failed to parse cpumask: {cpumask}"))?;

        let mut mask = Cpumask::new();
        for (index, &val) in byte_vec.iter().rev().enumerate() {
            let mut v = val;
            while v != 0 {
                let lsb = v.trailing_zeros() as usize;
                v &= !(1 << lsb);
                mask.set_cpu(index * 8 + lsb);
            }
        }
        Ok(mask)
    }

    /// Build a Cpumask object from a kernel cpulist string, e.g. "0-3,8".
    pub fn from_cpulist(cpulist: &str) -> Result<Cpumask> {
        Ok(read_cpulist(cpulist)?.into_iter().collect())
    }

    pub fn from_vec(vec: Vec<u64>) -> Self {
        Self {
            mask: BitVec::from_vec(vec),
        }
    }

    /// Return a slice of u64's whose bits reflect the Cpumask.
    pub fn as_raw_slice(&self) -> &[u64] {
        self.mask.as_raw_slice()
    }

    /// Set a bit in the Cpumask, growing the backing storage as needed.
    pub fn set_cpu(&mut self, cpu: usize) {
        if cpu >= self.mask.len() {
            self.mask.resize((cpu / 64 + 1) * 64, false);
        }
        self.mask.set(cpu, true);
    }

    /// Clear a bit from the Cpumask. Clearing a bit beyond the backing
    /// storage is a no-op.
    pub fn clear_cpu(&mut self, cpu: usize) {
        if cpu < self.mask.len() {
            self.mask.set(cpu, false);
        }
    }

    /// Test whether the specified CPU bit is set in the Cpumask.
    pub fn test_cpu(&self, cpu: usize) -> bool {
        match self.mask.get(cpu) {
            Some(bit) => *bit,
            None => false,
        }
    }

    /// Count the number of bits set in the Cpumask.
    pub fn weight(&self) -> usize {
        self.mask.count_ones()
    }

    /// Return true if the Cpumask has no bit set, false otherwise.
    pub fn is_empty(&self) -> bool {
        self.mask.count_ones() == 0
    }

    fn word(&self, index: usize) -> u64 {
        self.mask.as_raw_slice().get(index).copied().unwrap_or(0)
    }

    fn zip_words(&self, other: &Cpumask, op: impl Fn(u64, u64) -> u64) -> Cpumask {
        let words = self
            .mask
            .as_raw_slice()
            .len()
            .max(other.mask.as_raw_slice().len());
        Cpumask::from_vec((0..words).map(|i| op(self.word(i), other.word(i))).collect())
    }

    /// Create a Cpumask that is the intersection of the current Cpumask and
    /// another.
    pub fn and(&self, other: &Cpumask) -> Cpumask {
        self.zip_words(other, |a, b| a & b)
    }

    /// Create a Cpumask that is the union of the current Cpumask and
    /// another.
    pub fn or(&self, other: &Cpumask) -> Cpumask {
        self.zip_words(other, |a, b| a | b)
    }

    /// Create a Cpumask holding the bits of the current Cpumask that are not
    /// set in another.
    pub fn diff(&self, other: &Cpumask) -> Cpumask {
        self.zip_words(other, |a, b| a & !b)
    }

    /// Iterate over each element of a Cpumask, returning the indices with
    /// bits set in ascending order.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use cputree::Cpumask;
    /// let mask = Cpumask::from_cpulist("2,5").unwrap();
    /// let cpus: Vec<usize> = mask.iter().collect();
    /// assert_eq!(cpus, vec![2, 5]);
    /// ```
    pub fn iter(&self) -> CpumaskIterator<'_> {
        CpumaskIterator {
            mask: self,
            index: 0,
        }
    }

    fn fmt_with(&self, f: &mut fmt::Formatter<'_>, case: char) -> fmt::Result {
        let mut chunks: Vec<u32> = self
            .mask
            .as_raw_slice()
            .iter()
            .flat_map(|x| [*x as u32, (x >> 32) as u32])
            .collect();

        // Drop leading all-zero 32-bit groups.
        while chunks.len() > 1 && chunks.last() == Some(&0) {
            chunks.pop();
        }

        match chunks.pop() {
            Some(top) => match case {
                'x' => write!(f, "{top:x}")?,
                'X' => write!(f, "{top:X}")?,
                _ => unreachable!(),
            },
            None => write!(f, "0")?,
        }

        // The rest in descending order.
        for chunk in chunks.iter().rev() {
            match case {
                'x' => write!(f, ",{chunk:08x}")?,
                'X' => write!(f, ",{chunk:08X}")?,
                _ => unreachable!(),
            }
        }
        Ok(())
    }
}

/// Parse a kernel cpulist string, e.g. "0-5,7,31", into CPU ids. An empty
/// list parses to no ids.
pub fn read_cpulist(cpulist: &str) -> Result<Vec<usize>> {
    let cpulist = cpulist.trim_end_matches('\0').trim();
    if cpulist.is_empty() {
        return Ok(vec![]);
    }
    let mut cpu_ids = vec![];
    for group in cpulist.split(',') {
        let (min, max) = match sscanf!(group.trim(), "{usize}-{usize}") {
            Ok((x, y)) => (x, y),
            Err(_) => match sscanf!(group.trim(), "{usize}") {
                Ok(x) => (x, x),
                Err(_) => {
                    bail!("Failed to parse cpulist {}", group.trim());
                }
            },
        };
        for i in min..(max + 1) {
            cpu_ids.push(i);
        }
    }

    Ok(cpu_ids)
}

pub struct CpumaskIterator<'a> {
    mask: &'a Cpumask,
    index: usize,
}

impl Iterator for CpumaskIterator<'_> {
    type Item = usize;

    fn next(&mut self) -> Option<Self::Item> {
        while self.index < self.mask.mask.len() {
            let index = self.index;
            self.index += 1;
            if self.mask.test_cpu(index) {
                return Some(index);
            }
        }

        None
    }
}

impl PartialEq for Cpumask {
    fn eq(&self, other: &Self) -> bool {
        let words = self
            .mask
            .as_raw_slice()
            .len()
            .max(other.mask.as_raw_slice().len());
        (0..words).all(|i| self.word(i) == other.word(i))
    }
}

impl Eq for Cpumask {}

impl FromIterator<usize> for Cpumask {
    fn from_iter<I: IntoIterator<Item = usize>>(iter: I) -> Self {
        let mut mask = Cpumask::new();
        for cpu in iter {
            mask.set_cpu(cpu);
        }
        mask
    }
}

impl fmt::Display for Cpumask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut iter = self.iter().peekable();
        let mut sep = "";
        while let Some(start) = iter.next() {
            let mut end = start;
            while let Some(&next) = iter.peek() {
                if next != end + 1 {
                    break;
                }
                end = next;
                iter.next();
            }
            if start == end {
                write!(f, "{sep}{start}")?;
            } else {
                write!(f, "{sep}{start}-{end}")?;
            }
            sep = ",";
        }
        Ok(())
    }
}

impl fmt::LowerHex for Cpumask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.fmt_with(f, 'x')
    }
}

impl fmt::UpperHex for Cpumask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.fmt_with(f, 'X')
    }
}

impl BitAndAssign<&Self> for Cpumask {
    fn bitand_assign(&mut self, rhs: &Self) {
        *self = self.and(rhs);
    }
}

impl BitOrAssign<&Self> for Cpumask {
    fn bitor_assign(&mut self, rhs: &Self) {
        *self = self.or(rhs);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cpulist_parse_and_format() {
        let mask = Cpumask::from_cpulist("0-2,6-8").unwrap();
        assert_eq!(mask.weight(), 6);
        assert_eq!(mask.iter().collect::<Vec<_>>(), vec![0, 1, 2, 6, 7, 8]);
        assert_eq!(mask.to_string(), "0-2,6-8");

        let single = Cpumask::from_cpulist("3\n").unwrap();
        assert_eq!(single.to_string(), "3");

        assert_eq!(Cpumask::from_cpulist("").unwrap(), Cpumask::new());
        assert_eq!(Cpumask::new().to_string(), "");

        assert!(Cpumask::from_cpulist("0-2,x").is_err());
    }

    #[test]
    fn hex_parse_and_format() {
        let mask = Cpumask::from_str("0xf0").unwrap();
        assert_eq!(mask.iter().collect::<Vec<_>>(), vec![4, 5, 6, 7]);
        assert_eq!(format!("{:x}", mask), "f0");

        // One bit past the first word, kernel comma grouping on output.
        let mut high = Cpumask::new();
        high.set_cpu(64);
        assert_eq!(format!("{:x}", high), "1,00000000,00000000");
        assert_eq!(Cpumask::from_str(&format!("{:x}", high)).unwrap(), high);

        assert_eq!(format!("{:x}", Cpumask::new()), "0");
        assert!(Cpumask::from_str("0xzz").is_err());
    }

    #[test]
    fn equality_ignores_storage_width() {
        let mut wide = Cpumask::new();
        wide.set_cpu(200);
        wide.clear_cpu(200);
        assert_eq!(wide, Cpumask::new());

        wide.set_cpu(3);
        let narrow: Cpumask = [3].into_iter().collect();
        assert_eq!(wide, narrow);
        wide.set_cpu(4);
        assert_ne!(wide, narrow);
    }

    #[test]
    fn set_algebra() {
        let a: Cpumask = [0, 1, 2, 8].into_iter().collect();
        let b: Cpumask = [2, 8, 9].into_iter().collect();
        assert_eq!(a.and(&b), [2, 8].into_iter().collect());
        assert_eq!(a.or(&b), [0, 1, 2, 8, 9].into_iter().collect());
        assert_eq!(a.diff(&b), [0, 1].into_iter().collect());
        assert_eq!(b.diff(&a), [9].into_iter().collect());

        let mut acc = a.clone();
        acc |= &b;
        assert_eq!(acc, a.or(&b));
        acc &= &b;
        assert_eq!(acc, b);
    }

    #[test]
    fn grows_on_demand() {
        let mut mask = Cpumask::new();
        assert!(!mask.test_cpu(1000));
        mask.set_cpu(200);
        assert!(mask.test_cpu(200));
        assert!(!mask.test_cpu(199));
        assert_eq!(mask.weight(), 1);
        mask.clear_cpu(1000);
        assert_eq!(mask.weight(), 1);
    }
}
