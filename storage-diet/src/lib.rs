// SPDX-License-Identifier: GPL-3.0-only

//! Discrete Interval Encoding Tree
//!
//! An [`IntervalSet`] stores a set of `u64` values as disjoint, maximally
//! merged inclusive ranges in a binary search tree. It is used to represent
//! the data blocks owned by a thin-provisioned device and to count blocks
//! shared between devices.
//!
//! Trees are built by inserting ranges and then calling
//! [`IntervalSet::balance`] once. Removal of ranges is not supported.

pub mod interval_set;

pub use interval_set::IntervalSet;
