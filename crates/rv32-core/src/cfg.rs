//! Control-flow utilities over translated blocks: walk the recorded
//! successor edges, compute the root's dominated set, and pick out the
//! body of a loop headed by the root. The result decides which blocks are
//! worth handing to the native backend; nothing here runs on the hot path.

use std::collections::{HashMap, HashSet};

use crate::ir::{Block, BlockArena, BlockRef};

struct Node {
    block: BlockRef,
    pc: u32,
    left: Option<usize>,  // untaken successor
    right: Option<usize>, // taken successor
}

fn successor_pc(arena: &BlockArena, block: &Block, taken: bool) -> Option<u32> {
    let tail = block.tail();
    let link = if taken {
        tail.branch_taken.then_some(tail.taken)?
    } else {
        tail.branch_untaken.then_some(tail.untaken)?
    };
    link.and_then(|r| arena.get(r).map(|b| b.pc_start))
}

fn build(
    arena: &BlockArena,
    at: BlockRef,
    nodes: &mut Vec<Node>,
    visited: &mut HashMap<u32, usize>,
) -> Option<usize> {
    let block = arena.get(at)?;
    if visited.contains_key(&block.pc_start) {
        return None;
    }
    let index = nodes.len();
    visited.insert(block.pc_start, index);
    nodes.push(Node {
        block: at,
        pc: block.pc_start,
        left: None,
        right: None,
    });
    let tail = block.tail();
    if tail.branch_untaken {
        if let Some(succ) = tail.untaken {
            let left = build(arena, succ, nodes, visited);
            nodes[index].left = left;
        }
    }
    if tail.branch_taken {
        if let Some(succ) = tail.taken {
            let right = build(arena, succ, nodes, visited);
            nodes[index].right = right;
        }
    }
    Some(index)
}

fn reach(nodes: &[Node], from: usize, marked: &mut HashSet<usize>) {
    if !marked.insert(from) {
        return;
    }
    if let Some(left) = nodes[from].left {
        reach(nodes, left, marked);
    }
    if let Some(right) = nodes[from].right {
        reach(nodes, right, marked);
    }
}

/// Nodes dominated by `target`: unreachable from the root once `target`
/// is taken out of the graph.
fn dominated(nodes: &[Node], target: usize) -> Vec<usize> {
    let mut reachable = HashSet::new();
    reachable.insert(target);
    reach(nodes, 0, &mut reachable);
    (0..nodes.len()).filter(|j| !reachable.contains(j)).collect()
}

/// Detect the loop headed by `root` and return its body, root first.
///
/// A block dominated by the root whose terminator branches back to the
/// root closes a loop; whatever that block dominates in turn lies past
/// the back edge and is excluded from the body. With no back edge the
/// result is just the root.
pub fn detect_loop(arena: &BlockArena, root: BlockRef) -> Vec<BlockRef> {
    let mut nodes = Vec::new();
    let mut visited = HashMap::new();
    if build(arena, root, &mut nodes, &mut visited).is_none() {
        return Vec::new();
    }
    let root_pc = nodes[0].pc;
    let root_dom = dominated(&nodes, 0);

    let mut removed: HashSet<usize> = HashSet::new();
    for &d in &root_dom {
        let Some(block) = arena.get(nodes[d].block) else {
            continue;
        };
        let back_edge = successor_pc(arena, block, true) == Some(root_pc)
            || successor_pc(arena, block, false) == Some(root_pc);
        if back_edge {
            removed.extend(dominated(&nodes, d));
        }
    }

    let mut body = vec![nodes[0].block];
    for &d in &root_dom {
        if !removed.contains(&d) {
            body.push(nodes[d].block);
        }
    }
    body
}
