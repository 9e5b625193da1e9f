//! Per-resolution mutable state threaded through the iterative walk

use crate::dns::message::Record;
use crate::dns::name::Name;
use crate::dns::rdata::RrType;
use std::collections::HashMap;
use std::time::Instant;

/// State carried by move through each step of a resolution. Every
/// recursion rebuilds the next context from the previous one, so no
/// cycles of ownership form between steps.
#[derive(Clone)]
pub struct ResolveContext {
    /// Absolute deadline for the whole resolution.
    pub deadline: Instant,
    /// Remaining delegation-walk budget.
    pub depth: u32,
    /// Labels of the query name already resolved.
    pub level: usize,
    /// DS set of the parent zone; empty means provably unsigned.
    pub parent_ds: Vec<Record>,
    /// Suppresses qname minimization after a minimized walk failed.
    pub no_minimize: bool,
    /// First step of a resolution, before a cached delegation is chosen.
    pub is_root: bool,
    /// Keep the additional section of the final response.
    pub keep_extra: bool,
    /// This resolution serves a nested glue lookup.
    pub nested: bool,
    /// NS names already chased per record type, bounding cycles.
    visited: HashMap<RrType, Vec<Name>>,
}

impl ResolveContext {
    pub fn new(deadline: Instant, depth: u32) -> Self {
        ResolveContext {
            deadline,
            depth,
            level: 0,
            parent_ds: Vec::new(),
            no_minimize: false,
            is_root: true,
            keep_extra: false,
            nested: false,
            visited: HashMap::new(),
        }
    }

    /// Record `name` as visited for `qtype`. Returns false when it was
    /// already there, signalling a resolution cycle.
    pub fn visit(&mut self, qtype: RrType, name: &Name) -> bool {
        let list = self.visited.entry(qtype).or_default();
        if list.contains(name) {
            return false;
        }
        // the list can never outgrow the recursion budget
        if list.len() as u32 >= self.depth.max(1) * 2 {
            return false;
        }
        list.push(name.clone());
        true
    }

    pub fn visited_count(&self, qtype: RrType) -> usize {
        self.visited.get(&qtype).map(Vec::len).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_visit_detects_cycles() {
        let mut ctx = ResolveContext::new(Instant::now() + Duration::from_secs(10), 30);
        let ns = Name::parse("ns1.example.com.").unwrap();
        assert!(ctx.visit(RrType::A, &ns));
        assert!(!ctx.visit(RrType::A, &ns));
        // a different type tracks independently
        assert!(ctx.visit(RrType::Aaaa, &ns));
        assert_eq!(ctx.visited_count(RrType::A), 1);
    }

    #[test]
    fn test_visit_bounded_by_depth() {
        let mut ctx = ResolveContext::new(Instant::now() + Duration::from_secs(10), 1);
        assert!(ctx.visit(RrType::A, &Name::parse("a.example.").unwrap()));
        assert!(ctx.visit(RrType::A, &Name::parse("b.example.").unwrap()));
        assert!(!ctx.visit(RrType::A, &Name::parse("c.example.").unwrap()));
    }
}
