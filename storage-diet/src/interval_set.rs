// SPDX-License-Identifier: GPL-3.0-only

use std::fmt;
use std::ops::RangeInclusive;

type Link = Option<Box<Node>>;

struct Node {
    min: u64,
    max: u64,
    left: Link,
    right: Link,
}

impl Node {
    fn leaf(min: u64, max: u64) -> Box<Self> {
        Box::new(Self {
            min,
            max,
            left: None,
            right: None,
        })
    }

    fn span(&self) -> u64 {
        span(self.min, self.max)
    }
}

/// Set of `u64` values stored as disjoint, maximally merged inclusive ranges.
///
/// No two stored ranges overlap or touch: inserting `[1, 4]` next to `[5, 10]`
/// leaves a single `[1, 10]` range behind. Counts are returned as `u64`, so a
/// set covering the whole `u64` domain reports one value short.
///
/// The tree is not rebalanced on insert. Callers bulk-load ranges and then call
/// [`IntervalSet::balance`] once; after that the set is only read.
#[derive(Default)]
pub struct IntervalSet {
    root: Link,
    ranges: usize,
}

impl IntervalSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add every value in `[x, y]` to the set. The bounds may be given in
    /// either order.
    pub fn insert(&mut self, x: u64, y: u64) {
        let (x, y) = ordered(x, y);
        let mut cursor = &mut self.root;

        while let Some(node) = cursor {
            if y.saturating_add(1) < node.min {
                cursor = &mut node.left;
            } else if x > node.max.saturating_add(1) {
                cursor = &mut node.right;
            } else {
                // Overlapping or adjacent: widen this node, then fold in any
                // neighbouring ranges the widened bounds now touch.
                if x < node.min {
                    let (min, absorbed) = absorb_left(&mut node.left, x);
                    node.min = min;
                    self.ranges -= absorbed;
                }
                if y > node.max {
                    let (max, absorbed) = absorb_right(&mut node.right, y);
                    node.max = max;
                    self.ranges -= absorbed;
                }
                return;
            }
        }

        *cursor = Some(Node::leaf(x, y));
        self.ranges += 1;
    }

    /// Whether every value in `[x, y]` is a member of the set.
    pub fn contains(&self, x: u64, y: u64) -> bool {
        let (x, y) = ordered(x, y);
        self.intersection(x, y) == span(x, y)
    }

    /// Number of members of the set that fall within `[x, y]`.
    pub fn intersection(&self, x: u64, y: u64) -> u64 {
        let (x, y) = ordered(x, y);
        let mut count = 0;
        let mut pending = vec![(x, y, self.root.as_deref())];

        while let Some((l, r, link)) = pending.pop() {
            let Some(node) = link else {
                continue;
            };

            if l > node.max {
                pending.push((l, r, node.right.as_deref()));
            } else if r < node.min {
                pending.push((l, r, node.left.as_deref()));
            } else {
                count += span(l.max(node.min), r.min(node.max));
                if l < node.min {
                    pending.push((l, node.min - 1, node.left.as_deref()));
                }
                if r > node.max {
                    pending.push((node.max + 1, r, node.right.as_deref()));
                }
            }
        }

        count
    }

    /// Number of values that are members of both this set and `other`.
    pub fn intersection_all(&self, other: &IntervalSet) -> u64 {
        self.nodes()
            .map(|node| other.intersection(node.min, node.max))
            .sum()
    }

    /// Number of values in the set.
    pub fn total(&self) -> u64 {
        self.nodes().map(Node::span).sum()
    }

    /// Number of disjoint ranges stored.
    pub fn range_count(&self) -> usize {
        self.ranges
    }

    pub fn is_empty(&self) -> bool {
        self.root.is_none()
    }

    /// Stored ranges in ascending order.
    pub fn ranges(&self) -> Vec<RangeInclusive<u64>> {
        let mut out = Vec::with_capacity(self.ranges);
        let mut stack = Vec::new();
        let mut current = self.root.as_deref();

        loop {
            while let Some(node) = current {
                stack.push(node);
                current = node.left.as_deref();
            }
            let Some(node) = stack.pop() else {
                break;
            };
            out.push(node.min..=node.max);
            current = node.right.as_deref();
        }

        out
    }

    /// Rebalance the tree with the Day-Stout-Warren algorithm: rotate the
    /// tree into a right-leaning vine, then compress it back into a tree of
    /// minimal height.
    pub fn balance(&mut self) {
        let mut spine = into_vine(self.root.take());
        let size = spine.len();

        let leaves = size + 1 - nearest_pow2(size + 1);
        spine = compress(spine, leaves);

        let mut remaining = size - leaves;
        while remaining > 1 {
            remaining /= 2;
            spine = compress(spine, remaining);
        }

        self.root = link_vine(spine);
    }

    fn nodes(&self) -> Nodes<'_> {
        Nodes {
            stack: self.root.as_deref().into_iter().collect(),
        }
    }
}

impl Drop for IntervalSet {
    fn drop(&mut self) {
        // An unbalanced tree can be as deep as it has ranges; tear it down
        // iteratively instead of through recursive Box drops.
        let mut stack: Vec<Box<Node>> = self.root.take().into_iter().collect();
        while let Some(mut node) = stack.pop() {
            stack.extend(node.left.take());
            stack.extend(node.right.take());
        }
    }
}

impl fmt::Debug for IntervalSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.ranges()).finish()
    }
}

impl FromIterator<(u64, u64)> for IntervalSet {
    fn from_iter<I: IntoIterator<Item = (u64, u64)>>(iter: I) -> Self {
        let mut set = Self::new();
        for (x, y) in iter {
            set.insert(x, y);
        }
        set.balance();
        set
    }
}

struct Nodes<'a> {
    stack: Vec<&'a Node>,
}

impl<'a> Iterator for Nodes<'a> {
    type Item = &'a Node;

    fn next(&mut self) -> Option<Self::Item> {
        let node = self.stack.pop()?;
        self.stack.extend(node.left.as_deref());
        self.stack.extend(node.right.as_deref());
        Some(node)
    }
}

fn ordered(x: u64, y: u64) -> (u64, u64) {
    if y > x { (x, y) } else { (y, x) }
}

fn span(min: u64, max: u64) -> u64 {
    (max - min).saturating_add(1)
}

/// Remove every range in `link` that overlaps or touches a range starting at
/// `min`, returning the extended lower bound and the number of ranges removed.
fn absorb_left(link: &mut Link, mut min: u64) -> (u64, usize) {
    let mut absorbed = 0;
    while let Some(max) = peek_max(link) {
        if max.saturating_add(1) < min {
            break;
        }
        match pop_max(link) {
            Some((lo, _)) => {
                min = min.min(lo);
                absorbed += 1;
            }
            None => break,
        }
    }
    (min, absorbed)
}

fn absorb_right(link: &mut Link, mut max: u64) -> (u64, usize) {
    let mut absorbed = 0;
    while let Some(min) = peek_min(link) {
        if min > max.saturating_add(1) {
            break;
        }
        match pop_min(link) {
            Some((_, hi)) => {
                max = max.max(hi);
                absorbed += 1;
            }
            None => break,
        }
    }
    (max, absorbed)
}

fn peek_max(link: &Link) -> Option<u64> {
    let mut node = link.as_deref()?;
    while let Some(next) = node.right.as_deref() {
        node = next;
    }
    Some(node.max)
}

fn peek_min(link: &Link) -> Option<u64> {
    let mut node = link.as_deref()?;
    while let Some(next) = node.left.as_deref() {
        node = next;
    }
    Some(node.min)
}

/// Detach the rightmost node of `link`, splicing its left child into its place.
fn pop_max(link: &mut Link) -> Option<(u64, u64)> {
    let mut cursor = link;
    while cursor.as_ref().is_some_and(|node| node.right.is_some()) {
        cursor = match cursor {
            Some(node) => &mut node.right,
            None => return None,
        };
    }
    let node = cursor.take()?;
    let Node { min, max, left, .. } = *node;
    *cursor = left;
    Some((min, max))
}

fn pop_min(link: &mut Link) -> Option<(u64, u64)> {
    let mut cursor = link;
    while cursor.as_ref().is_some_and(|node| node.left.is_some()) {
        cursor = match cursor {
            Some(node) => &mut node.left,
            None => return None,
        };
    }
    let node = cursor.take()?;
    let Node { min, max, right, .. } = *node;
    *cursor = right;
    Some((min, max))
}

/// Largest power of two not greater than `i`.
fn nearest_pow2(i: usize) -> usize {
    if i == 0 { 0 } else { 1 << i.ilog2() }
}

/// Flatten a tree into its in-order spine using right rotations. Every node in
/// the returned spine has no children.
fn into_vine(root: Link) -> Vec<Box<Node>> {
    let mut spine = Vec::new();
    let mut rest = root;

    while let Some(mut node) = rest {
        match node.left.take() {
            Some(mut left) => {
                node.left = left.right.take();
                left.right = Some(node);
                rest = Some(left);
            }
            None => {
                rest = node.right.take();
                spine.push(node);
            }
        }
    }

    spine
}

/// One DSW compression pass: left-rotate `count` alternate spine nodes so each
/// odd node becomes the left child of its successor.
fn compress(spine: Vec<Box<Node>>, count: usize) -> Vec<Box<Node>> {
    let mut rest = spine.into_iter();
    let mut compressed = Vec::with_capacity(rest.len().saturating_sub(count));

    for _ in 0..count {
        let Some(mut child) = rest.next() else {
            break;
        };
        let Some(mut parent) = rest.next() else {
            compressed.push(child);
            break;
        };
        child.right = parent.left.take();
        parent.left = Some(child);
        compressed.push(parent);
    }

    compressed.extend(rest);
    compressed
}

fn link_vine(spine: Vec<Box<Node>>) -> Link {
    let mut link = None;
    for mut node in spine.into_iter().rev() {
        node.right = link;
        link = Some(node);
    }
    link
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use super::*;

    impl IntervalSet {
        fn depth(&self) -> usize {
            let mut deepest = 0;
            let mut stack: Vec<(&Node, usize)> =
                self.root.as_deref().map(|node| (node, 1)).into_iter().collect();
            while let Some((node, depth)) = stack.pop() {
                deepest = deepest.max(depth);
                stack.extend(node.left.as_deref().map(|child| (child, depth + 1)));
                stack.extend(node.right.as_deref().map(|child| (child, depth + 1)));
            }
            deepest
        }
    }

    /// Small deterministic generator so the model comparison is repeatable.
    struct Lcg(u64);

    impl Lcg {
        fn next(&mut self, bound: u64) -> u64 {
            self.0 = self
                .0
                .wrapping_mul(6364136223846793005)
                .wrapping_add(1442695040888963407);
            (self.0 >> 33) % bound
        }
    }

    fn assert_disjoint(set: &IntervalSet) {
        let ranges = set.ranges();
        for pair in ranges.windows(2) {
            assert!(
                pair[0].end().saturating_add(1) < *pair[1].start(),
                "ranges {:?} and {:?} touch or overlap",
                pair[0],
                pair[1]
            );
        }
        assert_eq!(ranges.len(), set.range_count());
    }

    #[test]
    fn totals_sum_of_disjoint_ranges() {
        let mut set = IntervalSet::new();
        set.insert(1, 5);
        set.insert(11, 15);
        set.insert(100, 100);

        assert_eq!(set.total(), 11);
        assert_eq!(set.intersection(0, 12), 7);
        assert_eq!(set.intersection(6, 10), 0);
        assert_eq!(set.range_count(), 3);
    }

    #[test]
    fn adjacent_inserts_merge() {
        let mut set = IntervalSet::new();
        set.insert(5, 10);
        set.insert(1, 4);

        assert!(set.contains(1, 10));
        assert_eq!(set.range_count(), 1);
        assert_eq!(set.ranges(), vec![1..=10]);
    }

    #[test]
    fn reversed_bounds_match_ordered_bounds() {
        let mut forward = IntervalSet::new();
        forward.insert(10, 20);
        let mut reversed = IntervalSet::new();
        reversed.insert(20, 10);

        assert_eq!(forward.ranges(), reversed.ranges());
        assert_eq!(forward.intersection(15, 25), reversed.intersection(25, 15));
        assert!(reversed.contains(20, 10));
        assert!(!reversed.contains(9, 10));
    }

    #[test]
    fn bridging_insert_absorbs_every_touched_range() {
        let mut set = IntervalSet::new();
        for (x, y) in [(20, 21), (1, 2), (5, 6), (9, 10), (13, 14), (30, 31)] {
            set.insert(x, y);
        }

        set.insert(3, 19);

        assert_eq!(set.ranges(), vec![1..=21, 30..=31]);
        assert_eq!(set.total(), 23);
        assert_disjoint(&set);
    }

    #[test]
    fn insert_inside_existing_range_is_noop() {
        let mut set = IntervalSet::new();
        set.insert(10, 50);
        set.insert(20, 30);

        assert_eq!(set.ranges(), vec![10..=50]);
    }

    #[test]
    fn intersection_all_counts_shared_members() {
        let devices: IntervalSet = [(1, 5), (11, 15), (21, 25), (31, 35), (41, 45)]
            .into_iter()
            .collect();
        let other: IntervalSet = [(6, 30)].into_iter().collect();

        assert_eq!(devices.intersection_all(&other), 10);
        assert_eq!(other.intersection_all(&devices), 10);
    }

    #[test]
    fn matches_model_set_for_random_inserts() {
        let mut rng = Lcg(7);
        let mut set = IntervalSet::new();
        let mut model = BTreeSet::new();

        for _ in 0..300 {
            let x = rng.next(2000);
            let y = x + rng.next(12);
            if rng.next(2) == 0 {
                set.insert(x, y);
            } else {
                set.insert(y, x);
            }
            model.extend(x..=y);
        }

        assert_disjoint(&set);
        assert_eq!(set.total(), model.len() as u64);
        for _ in 0..200 {
            let a = rng.next(2100);
            let b = rng.next(2100);
            let (lo, hi) = (a.min(b), a.max(b));
            let expected = model.range(lo..=hi).count() as u64;
            assert_eq!(set.intersection(a, b), expected, "range [{lo}, {hi}]");
        }
    }

    #[test]
    fn balance_preserves_queries() {
        let mut rng = Lcg(42);
        let mut set = IntervalSet::new();
        for _ in 0..500 {
            let x = rng.next(10_000);
            set.insert(x, x + rng.next(5));
        }
        let probes: Vec<(u64, u64)> = (0..100)
            .map(|_| (rng.next(10_000), rng.next(10_000)))
            .collect();
        let before: Vec<u64> = probes.iter().map(|&(a, b)| set.intersection(a, b)).collect();
        let total = set.total();
        let ranges = set.ranges();

        set.balance();

        let after: Vec<u64> = probes.iter().map(|&(a, b)| set.intersection(a, b)).collect();
        assert_eq!(before, after);
        assert_eq!(set.total(), total);
        assert_eq!(set.ranges(), ranges);
    }

    #[test]
    fn balance_flattens_sorted_load() {
        let mut set = IntervalSet::new();
        for block in 0..2000u64 {
            set.insert(block * 2, block * 2);
        }
        assert_eq!(set.depth(), 2000);

        set.balance();

        // 2000 nodes fit in a tree of height 11.
        assert_eq!(set.depth(), 11);
        assert_eq!(set.total(), 2000);
        assert!(set.contains(3998, 3998));
        assert_eq!(set.intersection(0, 9), 5);
    }

    #[test]
    fn balance_handles_left_heavy_and_empty_trees() {
        let mut empty = IntervalSet::new();
        empty.balance();
        assert!(empty.is_empty());
        assert_eq!(empty.total(), 0);

        let mut set = IntervalSet::new();
        for block in (0..64u64).rev() {
            set.insert(block * 3, block * 3 + 1);
        }
        set.balance();

        assert_eq!(set.depth(), 7);
        assert_eq!(set.range_count(), 64);
        assert_eq!(set.total(), 128);
    }

    #[test]
    fn debug_lists_ranges() {
        let set: IntervalSet = [(3, 4), (1, 1)].into_iter().collect();
        assert_eq!(format!("{set:?}"), "{1..=1, 3..=4}");
    }
}
