//! Optimizer passes: jump threading, dead-store elimination, and the
//! procedure inliner.
//!
//! Constant folding is not a pass; it happens while expressions are
//! assembled (see [`crate::types::ir::eval_const_op`]). The inliner runs
//! before basic-block construction because it splices the linear
//! instruction list; the other passes run on whichever form they need.

use bit_set::BitSet;

use crate::blocks::Cfg;
use crate::types::Idx;
use crate::types::cell::{CellId, CellPool, Flags, Kind, Submode};
use crate::types::ir::{Instr, Op};

/// Longest chain of trivial jumps worth following; cycles of pure gotos
/// would otherwise loop forever.
const THREAD_LIMIT: usize = 64;

/// Largest body (in instructions) the inliner will splice into a caller.
const INLINE_LIMIT: usize = 16;

/// Rewrite jumps that land on blocks consisting solely of an
/// unconditional jump, forwarding them to the final destination, then
/// drop blocks that became unreachable.
pub fn optimize_jumps(cfg: &mut Cfg) {
  // A trivial block is one `goto` and nothing else.
  let trivial_target = |cfg: &Cfg, label: CellId| -> Option<CellId> {
    let &bl = cfg.labels.get(&label)?;
    let block = &cfg.blocks[bl];
    match block.code.as_slice() {
      [only] if only.op == Op::Goto => only.result,
      _ => None,
    }
  };

  let resolve = |cfg: &Cfg, mut label: CellId| -> CellId {
    for _ in 0..THREAD_LIMIT {
      match trivial_target(cfg, label) {
        Some(next) if next != label => label = next,
        _ => break,
      }
    }
    label
  };

  for bl in cfg.blocks.keys().collect::<Vec<_>>() {
    let Some(jump) = cfg.blocks[bl].terminator() else { continue };
    let target = jump.result.expect("jumps name a target label");
    let fin = resolve(cfg, target);
    if fin != target {
      let taken = cfg.labels.get(&fin).copied();
      let block = &mut cfg.blocks[bl];
      block.code.last_mut().expect("terminator exists").result = Some(fin);
      block.taken = taken;
    }
  }

  drop_unreachable(cfg);
}

/// Clear every block not reachable from the entry. Cleared blocks emit
/// nothing and hold no label.
fn drop_unreachable(cfg: &mut Cfg) {
  let mut reachable = BitSet::with_capacity(cfg.blocks.len());
  let mut work = vec![Cfg::ENTRY];
  while let Some(bl) = work.pop() {
    if reachable.insert(bl.into_usize()) {
      work.extend(cfg.blocks[bl].successors());
    }
  }
  for bl in cfg.blocks.keys().collect::<Vec<_>>() {
    if !reachable.contains(bl.into_usize()) {
      let block = &mut cfg.blocks[bl];
      if let Some(label) = block.label.take() {
        cfg.labels.remove(&label);
      }
      block.code.clear();
      block.taken = None;
      block.next = None;
    }
  }
}

/// The variable a store ultimately lands in, when the instruction is a
/// plain computation. Control flow, calls and structural instructions
/// have no removable store.
fn store_root(pool: &CellPool, i: &Instr) -> Option<CellId> {
  let removable = matches!(i.op, Op::Let | Op::LetAdr)
    || (i.op.is_operator() && !i.op.is_jump());
  if !removable {
    return None;
  }
  let mut root = i.result?;
  loop {
    match pool[root].kind {
      Kind::Element { arr, .. } | Kind::Byte { arr, .. } => root = arr,
      Kind::Var { .. } => return Some(root),
      // Tuple and deref destinations are not tracked precisely; keep them.
      _ => return None,
    }
  }
}

/// Remove stores to variables that are never read and have no externally
/// visible side effect (not IN, not OUT, not a register). Returns true
/// when anything was removed; callers recount uses and repeat, since a
/// removed store may strand its operands.
pub fn dead_store_elimination(pool: &mut CellPool, proc: CellId) -> bool {
  let Some(code) = pool[proc].code.take() else { return false };
  let before = code.len();
  let kept: Vec<Instr> = code.into_iter()
    .filter(|i| {
      let Some(root) = store_root(pool, i) else { return true };
      let cell = &pool[root];
      cell.read > 0
        || cell.submode.intersects(Submode::IN | Submode::OUT)
        || pool.is_reg(root)
    })
    .collect();
  let changed = kept.len() != before;
  pool[proc].code = Some(kept);
  changed
}

/// Whether a procedure body is small and simple enough to splice into
/// its callers: short, straight-line, and never used by address or from
/// an interrupt vector.
fn inlinable(pool: &CellPool, callee: CellId) -> bool {
  if pool[callee].flags.contains(Flags::PROC_ADDRESS) || pool.is_interrupt(callee) {
    return false;
  }
  match pool[callee].code {
    Some(ref code) => {
      code.len() <= INLINE_LIMIT
        && code.iter().all(|i| {
          !matches!(i.op, Op::Label | Op::Call) && !i.op.is_jump()
        })
    }
    None => false,
  }
}

/// Splice small callees into a procedure's linear stream. Must run
/// before basic-block construction.
pub fn inline_calls(pool: &mut CellPool, proc: CellId) -> bool {
  let Some(code) = pool[proc].code.take() else { return false };
  let mut changed = false;
  let mut out = Vec::with_capacity(code.len());
  for i in code {
    if i.op == Op::Call {
      let callee = i.result.expect("call has a target");
      if callee != proc && inlinable(pool, callee) {
        let body = pool[callee].code.clone().expect("inlinable bodies exist");
        out.extend(body);
        changed = true;
        continue;
      }
    }
    out.push(i);
  }
  pool[proc].code = Some(out);
  changed
}

/// All reachable procedures with bodies, the root included.
pub fn reachable_procs(pool: &CellPool, root: CellId) -> Vec<CellId> {
  let mut procs: Vec<CellId> = pool.live_cells().into_iter()
    .filter(|&id| pool.is_proc(id) && pool[id].read > 0 && pool[id].code.is_some())
    .collect();
  if !procs.contains(&root) && pool[root].code.is_some() {
    procs.push(root);
  }
  procs
}

/// Whether a body writes anything observable outside the procedure: an
/// OUT cell, or any cell that is not local to it. Such procedures are
/// marked `OUT` themselves so caller-side passes keep their calls.
pub fn code_has_side_effects(pool: &CellPool, proc: CellId) -> bool {
  let Some(ref code) = pool[proc].code else { return false };
  let is_local = |mut cell: CellId| {
    loop {
      match pool[cell].scope {
        Some(s) if s == proc => return true,
        Some(s) => cell = s,
        None => return false,
      }
    }
  };
  code.iter().any(|i| match i.op {
    Op::Call => {
      i.result.is_some_and(|callee| pool[callee].submode.contains(Submode::OUT))
    }
    Op::Line | Op::Label | Op::Goto => false,
    op if op.is_cond_jump() => false,
    _ => store_root(pool, i).is_some_and(|root| {
      pool[root].submode.contains(Submode::OUT) || !is_local(root)
    }),
  })
}

/// Drop `Assert` pragmas from release builds, keeping the begin/end
/// markers balanced out as well.
pub fn strip_asserts(pool: &mut CellPool, proc: CellId) {
  if let Some(code) = pool[proc].code.as_mut() {
    code.retain(|i| !matches!(i.op, Op::Assert | Op::AssertBegin | Op::AssertEnd));
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::blocks::build_cfg;
  use crate::types::cell::TypeVariant;
  use crate::usage::count_uses;

  fn pool_with_root() -> (CellPool, CellId, CellId) {
    let mut pool = CellPool::new();
    let scope = pool.alloc(Kind::Scope);
    let ty = pool.type_alloc(TypeVariant::Proc);
    let root = pool.new_var("_root", ty, scope);
    pool[root].code = Some(vec![]);
    (pool, scope, root)
  }

  #[test]
  fn threads_goto_chains_and_drops_dead_blocks() {
    let (mut pool, scope, _) = pool_with_root();
    let l1 = pool.new_tmp_label(scope);
    let l2 = pool.new_tmp_label(scope);
    let byte = pool.builtins.t_byte;
    let x = pool.new_var("x", byte, scope);
    let one = pool.int(1);
    // goto l1 / l1: goto l2 / l2: let x,1
    let code = vec![
      Instr::new(Op::Goto, Some(l1), None, None),
      Instr::new(Op::Label, Some(l1), None, None),
      Instr::new(Op::Goto, Some(l2), None, None),
      Instr::new(Op::Label, Some(l2), None, None),
      Instr::new(Op::Let, Some(x), Some(one), None),
    ];
    let mut cfg = build_cfg(code);
    optimize_jumps(&mut cfg);
    let entry = &cfg.blocks[Cfg::ENTRY];
    assert_eq!(entry.terminator().expect("still a jump").result, Some(l2));
    // The l1 trampoline died with its contents.
    let flat = cfg.into_code();
    assert!(!flat.iter().any(|i| i.result == Some(l1)));
    assert!(flat.iter().any(|i| i.op == Op::Let));
  }

  #[test]
  fn jump_cycles_do_not_hang() {
    let (mut pool, scope, _) = pool_with_root();
    let l1 = pool.new_tmp_label(scope);
    let l2 = pool.new_tmp_label(scope);
    let code = vec![
      Instr::new(Op::Label, Some(l1), None, None),
      Instr::new(Op::Goto, Some(l2), None, None),
      Instr::new(Op::Label, Some(l2), None, None),
      Instr::new(Op::Goto, Some(l1), None, None),
    ];
    let mut cfg = build_cfg(code);
    optimize_jumps(&mut cfg);
  }

  #[test]
  fn dead_stores_are_removed_and_live_ones_kept() {
    let (mut pool, scope, root) = pool_with_root();
    let byte = pool.builtins.t_byte;
    let x = pool.new_var("x", byte, scope);
    let y = pool.new_var("y", byte, scope);
    let out = pool.new_var("port", byte, scope);
    pool[out].submode |= Submode::OUT;
    let one = pool.int(1);
    pool[root].code = Some(vec![
      Instr::new(Op::Let, Some(x), Some(one), None),
      Instr::new(Op::Let, Some(y), Some(x), None),
      Instr::new(Op::Let, Some(out), Some(one), None),
    ]);
    count_uses(&mut pool);
    assert!(dead_store_elimination(&mut pool, root), "y is dead");
    count_uses(&mut pool);
    assert!(dead_store_elimination(&mut pool, root), "x became dead");
    count_uses(&mut pool);
    assert!(!dead_store_elimination(&mut pool, root));
    let code = pool[root].code.as_ref().expect("body survives");
    assert_eq!(code.len(), 1, "only the OUT store remains");
    assert_eq!(code[0].result, Some(out));
  }

  #[test]
  fn small_straight_line_callees_inline() {
    let (mut pool, scope, root) = pool_with_root();
    let byte = pool.builtins.t_byte;
    let x = pool.new_var("x", byte, scope);
    let one = pool.int(1);
    let ty = pool.type_alloc(TypeVariant::Proc);
    let tick = pool.new_var("tick", ty, scope);
    pool[tick].code = Some(vec![Instr::new(Op::Add, Some(x), Some(x), Some(one))]);
    pool[root].code = Some(vec![Instr::new(Op::Call, Some(tick), None, None)]);
    assert!(inline_calls(&mut pool, root));
    let code = pool[root].code.as_ref().expect("body survives");
    assert_eq!(code.len(), 1);
    assert_eq!(code[0].op, Op::Add);
  }

  #[test]
  fn address_taken_and_branching_callees_stay_calls() {
    let (mut pool, scope, root) = pool_with_root();
    let ty = pool.type_alloc(TypeVariant::Proc);
    let vectored = pool.new_var("vectored", ty, scope);
    pool[vectored].code = Some(vec![]);
    pool[vectored].flags |= Flags::PROC_ADDRESS;
    let ty2 = pool.type_alloc(TypeVariant::Proc);
    let loopy = pool.new_var("loopy", ty2, scope);
    let l = pool.new_tmp_label(loopy);
    pool[loopy].code = Some(vec![
      Instr::new(Op::Label, Some(l), None, None),
      Instr::new(Op::Goto, Some(l), None, None),
    ]);
    pool[root].code = Some(vec![
      Instr::new(Op::Call, Some(vectored), None, None),
      Instr::new(Op::Call, Some(loopy), None, None),
    ]);
    assert!(!inline_calls(&mut pool, root));
    let code = pool[root].code.as_ref().expect("body survives");
    assert!(code.iter().all(|i| i.op == Op::Call));
  }

  #[test]
  fn side_effect_detection() {
    let (mut pool, scope, root) = pool_with_root();
    let byte = pool.builtins.t_byte;
    let global = pool.new_var("g", byte, scope);
    let ty = pool.type_alloc(TypeVariant::Proc);
    let pure_proc = pool.new_var("calc", ty, scope);
    let local = pool.new_var("t", byte, pure_proc);
    let one = pool.int(1);
    pool[pure_proc].code = Some(vec![Instr::new(Op::Let, Some(local), Some(one), None)]);
    assert!(!code_has_side_effects(&pool, pure_proc));
    pool[pure_proc].code = Some(vec![Instr::new(Op::Let, Some(global), Some(one), None)]);
    assert!(code_has_side_effects(&pool, pure_proc));
    let _ = root;
  }

  #[test]
  fn release_builds_drop_asserts() {
    let (mut pool, _, root) = pool_with_root();
    pool[root].code = Some(vec![
      Instr::new(Op::AssertBegin, None, None, None),
      Instr::new(Op::Assert, None, None, None),
      Instr::new(Op::AssertEnd, None, None, None),
      Instr::new(Op::Prologue, None, None, None),
    ]);
    strip_asserts(&mut pool, root);
    assert_eq!(pool[root].code.as_ref().expect("body survives").len(), 1);
  }
}
