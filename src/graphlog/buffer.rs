//! NodeBuffer -- a bounded buffer of graph-log nodes with FIFO eviction.

use std::collections::VecDeque;
use std::io::Write;

use rustc_hash::FxHashMap;

use crate::graphlog::GlNode;
use crate::types::{Ci, Di, Result};

/// A buffer of at most `max_size` recently read nodes keyed by cache
/// index. When full, `put` evicts the oldest surviving node and spills it
/// to the pending file instead.
pub struct NodeBuffer {
    max_size: usize,
    tbl: FxHashMap<u32, (Vec<Ci>, Vec<Di>)>,
    /// CIs in insertion order. Entries removed by `delete` stay in the
    /// queue and are skipped at eviction time.
    fifo: VecDeque<u32>,
    /// Nodes written to the overflow sink by `put` since the last reset.
    pub flushed_cnt: u64,
}

impl NodeBuffer {
    pub fn new(max_size: usize) -> NodeBuffer {
        assert!(max_size > 0, "node buffer needs room for at least one node");
        NodeBuffer {
            max_size,
            tbl: FxHashMap::default(),
            fifo: VecDeque::with_capacity(max_size),
            flushed_cnt: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.tbl.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tbl.is_empty()
    }

    /// Removes and returns the node buffered under `ci`, if any.
    pub fn delete(&mut self, ci: Ci) -> Option<GlNode> {
        self.tbl.remove(&ci.0).map(|(kids, refs)| GlNode {
            ci,
            kids,
            refs,
        })
    }

    /// Adds `node` to the buffer. If the buffer is full, the oldest node
    /// still present is written to `sink` first. Buffering a CI twice is a
    /// checked error.
    pub fn put(&mut self, node: GlNode, sink: &mut impl Write) -> Result<()> {
        if self.tbl.len() >= self.max_size {
            // Queue entries may already have been taken by `delete`; pop
            // until one still resident turns up.
            let evicted = loop {
                let ci = self.fifo.pop_front().expect("fifo covers the table");
                if let Some((kids, refs)) = self.tbl.remove(&ci) {
                    break GlNode {
                        ci: Ci(ci),
                        kids,
                        refs,
                    };
                }
            };
            evicted.write_to(sink)?;
            self.flushed_cnt += 1;
        }

        let prev = self.tbl.insert(node.ci.0, (node.kids, node.refs));
        assert!(prev.is_none(), "node {} buffered twice", node.ci);
        self.fifo.push_back(node.ci.0);
        Ok(())
    }
}
