//! Reachability and use analysis.
//!
//! Starting from the root procedure, every called procedure is marked
//! reachable (its read count incremented), interrupt status and
//! address-taken status are propagated, and jump targets are validated.
//! The pass runs twice per compile — after parsing and again after
//! translation, because translation may materialize new calls.

use hashbrown::HashSet;

use crate::report::Reporter;
use crate::types::cell::{CellId, CellPool, Flags, Kind, TypeVariant};
use crate::types::ir::Op;

/// Recompute read/write counters of all non-procedure cells from the
/// instruction streams of reachable procedures.
pub fn count_uses(pool: &mut CellPool) {
  let live = pool.live_cells();
  for &id in &live {
    let keep_proc = pool.is_proc(id);
    if !keep_proc {
      let cell = &mut pool[id];
      cell.read = 0;
      cell.write = 0;
      cell.flags &= !(Flags::UNINITIALIZED | Flags::LOOP | Flags::LOOP_DEPENDENT);
    }
  }
  for &id in &live {
    if pool[id].code.is_none() {
      continue;
    }
    let code = pool[id].code.take().expect("checked above");
    for i in &code {
      match i.op {
        Op::Line | Op::Label => {}
        Op::Goto => {
          if let Some(l) = i.result {
            pool[l].read += 1;
          }
        }
        Op::Call => {
          // Procedure read counts belong to the reachability walk.
          for arg in [i.arg1, i.arg2].into_iter().flatten() {
            mark_read(pool, arg);
          }
        }
        op if op.is_cond_jump() => {
          if let Some(l) = i.result {
            pool[l].read += 1;
          }
          for arg in [i.arg1, i.arg2].into_iter().flatten() {
            mark_read(pool, arg);
          }
        }
        _ => {
          if let Some(r) = i.result {
            mark_write(pool, r);
          }
          for arg in [i.arg1, i.arg2].into_iter().flatten() {
            mark_read(pool, arg);
          }
        }
      }
    }
    pool[id].code = Some(code);
  }
}

fn mark_write(pool: &mut CellPool, id: CellId) {
  match pool[id].kind {
    Kind::Var { .. } | Kind::Name { .. } => pool[id].write += 1,
    Kind::Element { arr, index } | Kind::Byte { arr, index } => {
      mark_write(pool, arr);
      mark_read(pool, index);
    }
    Kind::Tuple { l, r } => {
      mark_write(pool, l);
      mark_write(pool, r);
    }
    // A write through a pointer reads the pointer itself.
    Kind::Deref { var } => mark_read(pool, var),
    _ => {}
  }
}

fn mark_read(pool: &mut CellPool, id: CellId) {
  match pool[id].kind {
    Kind::Var { .. } | Kind::Name { .. } => pool[id].read += 1,
    Kind::Element { arr, index } | Kind::Byte { arr, index } => {
      mark_read(pool, arr);
      mark_read(pool, index);
    }
    Kind::Tuple { l, r } | Kind::Op { l, r, .. } | Kind::Range { lo: l, hi: r } => {
      mark_read(pool, l);
      mark_read(pool, r);
    }
    Kind::Deref { var } => mark_read(pool, var),
    _ => {}
  }
}

/// Run the whole analysis from the root procedure.
///
/// Procedure read counts are reset first, so the pass can run again
/// after translation; label-definition flags are re-swept globally so
/// validation does not depend on traversal order.
pub fn analyze(pool: &mut CellPool, rep: &mut Reporter, root: CellId) {
  let live = pool.live_cells();
  for &id in &live {
    if pool.is_proc(id) || id == root {
      pool[id].read = 0;
    }
    if pool.is_label(id) {
      pool[id].flags &= !Flags::LABEL_DEFINED;
    }
  }
  for &id in &live {
    if let Some(code) = pool[id].code.take() {
      for i in &code {
        if i.op == Op::Label {
          let l = i.result.expect("label instruction names a label");
          pool[l].flags |= Flags::LABEL_DEFINED;
        }
      }
      pool[id].code = Some(code);
    }
  }
  proc_use(pool, rep, root, Flags::empty());
}

/// Mark `proc` and everything it reaches as used, propagating the given
/// flags. `PROCESSED` guards against call cycles and is cleared on exit.
pub fn proc_use(pool: &mut CellPool, rep: &mut Reporter, proc: CellId, flags: Flags) {
  pool[proc].read += 1;
  // Bodiless declarations and procedures already being traversed only
  // take the read count; flags land on the fall-through path alone.
  if pool[proc].code.is_none() || pool[proc].flags.contains(Flags::PROCESSED) {
    return;
  }
  pool[proc].flags |= flags | Flags::PROCESSED;

  let mut child_flags = flags;
  if pool.is_interrupt(proc) {
    pool[proc].flags |= Flags::PROC_INTERRUPT;
    child_flags |= Flags::USED_IN_INTERRUPT;
  }

  let code = pool[proc].code.take().expect("checked above");

  // Labels defined by this procedure's own stream.
  let local_labels: HashSet<CellId> = code.iter()
    .filter(|i| i.op == Op::Label)
    .filter_map(|i| i.result)
    .collect();

  for i in &code {
    if i.op == Op::Line {
      continue;
    }
    if i.op == Op::Call {
      let callee = i.result.expect("call has a target");
      proc_use(pool, rep, callee, child_flags);
      continue;
    }
    for arg in [i.arg1, i.arg2].into_iter().flatten() {
      if pool.value_variant(arg) == TypeVariant::Proc {
        // The procedure's name is used as a value, not called.
        proc_use(pool, rep, arg, child_flags | Flags::PROC_ADDRESS);
      }
    }
    if i.op != Op::Label {
      if let Some(label) = i.result.filter(|&r| pool.is_label(r)) {
        if !local_labels.contains(&label) {
          report_unknown_label(pool, rep, label, i.bookmark);
        }
      }
    }
  }

  pool[proc].code = Some(code);
  pool[proc].flags &= !Flags::PROCESSED;
}

fn report_unknown_label(
  pool: &CellPool, rep: &mut Reporter, label: CellId, bookmark: crate::types::Bookmark,
) {
  let name = pool.cell_name(label);
  let defined_elsewhere = pool[label].flags.contains(Flags::LABEL_DEFINED)
    || pool.live_cells().iter().any(|&c| {
      c != label
        && pool.is_label(c)
        && pool[c].flags.contains(Flags::LABEL_DEFINED)
        && pool[c].name == pool[label].name
        && pool[c].idx == pool[label].idx
    });
  if defined_elsewhere {
    rep.error(
      bookmark,
      format!(
        "Label [{name}] is defined in other procedure.\n\
         It is not possible to jump between procedures."
      ),
    );
  } else {
    rep.error(bookmark, format!("Label [{name}] is undefined"));
  }
}
