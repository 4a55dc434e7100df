//! Polytope geometry.
//!
//! A convex polytope is the intersection of half-spaces `w · x + b ≥ 0`.
//! The classifier accepts a point when at least one of its polytopes
//! contains it.

pub mod hyperplane;
pub mod layout;
