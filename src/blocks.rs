//! The basic-block builder.
//!
//! Splits a procedure's linear instruction stream at labels and jumps
//! into a [`Cfg`] of blocks with up to two successors each. The builder
//! runs twice per procedure: once after translation, and again after the
//! jump-editing optimizer passes.

use arrayvec::ArrayVec;
use hashbrown::HashMap;

use crate::mk_id;
use crate::types::IdxVec;
use crate::types::cell::CellId;
use crate::types::ir::{Code, Instr, Op};

mk_id! {
  /// The index of a block within one procedure's [`Cfg`].
  BlockId,
}

/// A maximal straight-line instruction sequence with a single entry and
/// a single exit.
#[derive(Debug, Default)]
pub struct BasicBlock {
  /// The entry label, when one names this block.
  pub label: Option<CellId>,
  pub code: Code,
  /// The branch-taken successor, for blocks ending in a jump.
  pub taken: Option<BlockId>,
  /// The fall-through successor.
  pub next: Option<BlockId>,
}

impl BasicBlock {
  /// The zero, one or two successors of this block.
  #[must_use] pub fn successors(&self) -> ArrayVec<BlockId, 2> {
    self.taken.into_iter().chain(self.next).collect()
  }

  /// The terminating jump of the block, if it ends in one.
  #[must_use] pub fn terminator(&self) -> Option<&Instr> {
    self.code.last().filter(|i| i.op.is_jump())
  }
}

/// A procedure body structured into basic blocks.
#[derive(Debug, Default)]
pub struct Cfg {
  pub blocks: IdxVec<BlockId, BasicBlock>,
  /// Label cell → the block it names.
  pub labels: HashMap<CellId, BlockId>,
}

impl Cfg {
  /// The entry block.
  pub const ENTRY: BlockId = BlockId(0);

  /// Flatten back into a linear stream, rematerializing entry labels.
  #[must_use] pub fn into_code(self) -> Code {
    let mut out = vec![];
    for block in self.blocks.0 {
      if let Some(label) = block.label {
        out.push(Instr::new(Op::Label, Some(label), None, None));
      }
      out.extend(block.code);
    }
    out
  }

  /// Predecessor lists, computed on demand.
  #[must_use] pub fn predecessors(&self) -> IdxVec<BlockId, Vec<BlockId>> {
    let mut preds: IdxVec<BlockId, Vec<BlockId>> =
      self.blocks.0.iter().map(|_| vec![]).collect();
    for (id, block) in self.blocks.enum_iter() {
      for succ in block.successors() {
        preds[succ].push(id);
      }
    }
    preds
  }
}

/// Split a linear stream into basic blocks and resolve successors.
///
/// Label definitions are consumed into block entries. A jump whose
/// target is not defined in this stream gets no taken-edge; the usage
/// analyzer has already reported it. A conditional branch at the end of
/// the stream simply falls off the procedure: its not-taken edge is
/// absent.
#[must_use] pub fn build_cfg(code: Code) -> Cfg {
  let mut cfg = Cfg::default();
  let mut cur = BasicBlock::default();
  // The most recently closed block still awaiting its fallthrough edge.
  let mut pending_fall: Option<BlockId> = None;

  fn close(
    cfg: &mut Cfg, cur: &mut BasicBlock, falls: bool, pending_fall: &mut Option<BlockId>,
  ) {
    let id = cfg.blocks.push(std::mem::take(cur));
    if let Some(label) = cfg.blocks[id].label {
      cfg.labels.insert(label, id);
    }
    // Blocks are pushed in stream order, so the pending block's
    // fallthrough target is exactly the block pushed now.
    if let Some(prev) = pending_fall.take() {
      cfg.blocks[prev].next = Some(id);
    }
    *pending_fall = falls.then_some(id);
  }

  for i in code {
    match i.op {
      Op::Label => {
        let label = i.result.expect("label instruction names a label");
        if cur.label.is_some() || !cur.code.is_empty() {
          close(&mut cfg, &mut cur, true, &mut pending_fall);
        }
        cur.label = Some(label);
      }
      Op::Goto => {
        cur.code.push(i);
        close(&mut cfg, &mut cur, false, &mut pending_fall);
      }
      op if op.is_cond_jump() => {
        cur.code.push(i);
        close(&mut cfg, &mut cur, true, &mut pending_fall);
      }
      _ => cur.code.push(i),
    }
  }
  if cur.label.is_some() || !cur.code.is_empty() || cfg.blocks.is_empty() {
    close(&mut cfg, &mut cur, false, &mut pending_fall);
  }

  // Resolve taken edges now that every label has its block.
  for block in &mut cfg.blocks.0 {
    if let Some(jump) = block.code.last() {
      if jump.op.is_jump() {
        let target = jump.result.expect("jumps name a target label");
        block.taken = cfg.labels.get(&target).copied();
      }
    }
  }
  cfg
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::types::cell::{CellPool, Kind};

  #[test]
  fn straight_line_code_is_one_block() {
    let mut pool = CellPool::new();
    let root = pool.alloc(Kind::Scope);
    let byte = pool.builtins.t_byte;
    let x = pool.new_var("x", byte, root);
    let one = pool.int(1);
    let code = vec![
      Instr::new(Op::Let, Some(x), Some(one), None),
      Instr::new(Op::Add, Some(x), Some(x), Some(one)),
    ];
    let cfg = build_cfg(code);
    assert_eq!(cfg.blocks.len(), 1);
    assert!(cfg.blocks[Cfg::ENTRY].successors().is_empty());
  }

  #[test]
  fn loop_shape_has_back_edge() {
    let mut pool = CellPool::new();
    let root = pool.alloc(Kind::Scope);
    let byte = pool.builtins.t_byte;
    let i = pool.new_var("i", byte, root);
    let body = pool.new_tmp_label(root);
    let zero = pool.int(0);
    let one = pool.int(1);
    let nine = pool.int(9);
    // let i,0 / body: / add i,i,1 / ifgt body, 9, i
    let code = vec![
      Instr::new(Op::Let, Some(i), Some(zero), None),
      Instr::new(Op::Label, Some(body), None, None),
      Instr::new(Op::Add, Some(i), Some(i), Some(one)),
      Instr::new(Op::IfGt, Some(body), Some(nine), Some(i)),
    ];
    let cfg = build_cfg(code);
    assert_eq!(cfg.blocks.len(), 2);
    let header = cfg.labels[&body];
    assert_eq!(cfg.blocks[Cfg::ENTRY].next, Some(header));
    assert_eq!(cfg.blocks[header].taken, Some(header), "the branch loops back");
    assert_eq!(cfg.blocks[header].next, None, "nothing follows the loop");
  }

  #[test]
  fn goto_ends_a_block_without_fallthrough() {
    let mut pool = CellPool::new();
    let root = pool.alloc(Kind::Scope);
    let skip = pool.new_tmp_label(root);
    let byte = pool.builtins.t_byte;
    let x = pool.new_var("x", byte, root);
    let one = pool.int(1);
    let code = vec![
      Instr::new(Op::Goto, Some(skip), None, None),
      Instr::new(Op::Let, Some(x), Some(one), None),
      Instr::new(Op::Label, Some(skip), None, None),
    ];
    let cfg = build_cfg(code);
    assert_eq!(cfg.blocks.len(), 3);
    let first = &cfg.blocks[Cfg::ENTRY];
    assert_eq!(first.taken, Some(cfg.labels[&skip]));
    assert_eq!(first.next, None);
    // The dead middle block still falls through to the labeled block.
    assert_eq!(cfg.blocks[BlockId(1)].next, Some(BlockId(2)));
  }

  #[test]
  fn round_trips_through_linear_code() {
    let mut pool = CellPool::new();
    let root = pool.alloc(Kind::Scope);
    let l = pool.new_tmp_label(root);
    let byte = pool.builtins.t_byte;
    let x = pool.new_var("x", byte, root);
    let one = pool.int(1);
    let code = vec![
      Instr::new(Op::Label, Some(l), None, None),
      Instr::new(Op::Add, Some(x), Some(x), Some(one)),
      Instr::new(Op::Goto, Some(l), None, None),
    ];
    let cfg = build_cfg(code.clone());
    assert_eq!(cfg.into_code(), code);
  }
}
