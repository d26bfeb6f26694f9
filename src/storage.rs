//! Variable-address allocation.
//!
//! Addresses come from a per-procedure heap of free memory blocks:
//! storage of procedures that can never be live at the same time as the
//! one being allocated is offered for reuse, storage of call-graph
//! neighbours and interrupt handlers is withheld, and whatever cannot be
//! reused is carved out of the platform's `VAR_HEAP` region. Running out
//! of both is a fatal error.

use std::fmt;

use smallvec::{SmallVec, smallvec};

use crate::types::cell::{CellId, CellPool, Flags, Kind};

/// A heap of free memory blocks, kept sorted and coalesced.
#[derive(Clone, Debug, Default)]
pub struct MemHeap {
  /// `(address, size)` pairs, disjoint, ascending.
  blocks: Vec<(u32, u32)>,
}

impl MemHeap {
  #[must_use] pub fn new() -> Self { Self::default() }

  /// Total free bytes.
  #[must_use] pub fn free_bytes(&self) -> u32 {
    self.blocks.iter().map(|&(_, size)| size).sum()
  }

  /// Return a block of memory to the heap, merging neighbours.
  pub fn add_block(&mut self, adr: u32, size: u32) {
    if size == 0 {
      return;
    }
    self.blocks.push((adr, size));
    self.blocks.sort_unstable();
    let mut merged: Vec<(u32, u32)> = vec![];
    for &(a, s) in &self.blocks {
      match merged.last_mut() {
        Some((ma, ms)) if a <= *ma + *ms => {
          let end = (a + s).max(*ma + *ms);
          *ms = end - *ma;
        }
        _ => merged.push((a, s)),
      }
    }
    self.blocks = merged;
  }

  /// Add a whole inclusive address range.
  pub fn add_range(&mut self, min: u32, max: u32) {
    if min <= max {
      self.add_block(min, max - min + 1);
    }
  }

  /// Withdraw a block of memory from the heap, splitting as needed.
  pub fn remove_block(&mut self, adr: u32, size: u32) {
    if size == 0 {
      return;
    }
    let (lo, hi) = (adr, adr + size);
    let mut out = vec![];
    for &(a, s) in &self.blocks {
      let (ba, be) = (a, a + s);
      if be <= lo || hi <= ba {
        out.push((a, s));
        continue;
      }
      if ba < lo {
        out.push((ba, lo - ba));
      }
      if hi < be {
        out.push((hi, be - hi));
      }
    }
    self.blocks = out;
  }

  /// Take `size` bytes from the lowest-addressed block that fits.
  pub fn alloc(&mut self, size: u32) -> Option<u32> {
    let pos = self.blocks.iter().position(|&(_, s)| s >= size)?;
    let (adr, s) = self.blocks[pos];
    if s == size {
      self.blocks.remove(pos);
    } else {
      self.blocks[pos] = (adr + size, s - size);
    }
    Some(adr)
  }
}

/// Fatal allocation failure: both the reuse heap and the platform
/// `VAR_HEAP` are exhausted.
#[derive(Debug, Clone, Copy)]
pub struct HeapExhausted {
  /// The variable that could not be placed.
  pub var: CellId,
  pub size: u32,
}

impl fmt::Display for HeapExhausted {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "out of variable space ({} bytes requested)", self.size)
  }
}

impl std::error::Error for HeapExhausted {}

/// Whether `proc` (transitively) calls `callee`. `PROCESSED` guards
/// against recursion and is cleared on every path out.
pub fn proc_calls_proc(pool: &mut CellPool, proc: CellId, callee: CellId) -> bool {
  if pool[proc].flags.contains(Flags::PROCESSED) {
    return false;
  }
  pool[proc].flags |= Flags::PROCESSED;
  let mut calls = false;
  if let Some(code) = pool[proc].code.take() {
    for i in &code {
      if i.op == crate::types::ir::Op::Call {
        let target = i.result.expect("call has a target");
        if target == callee || proc_calls_proc(pool, target, callee) {
          calls = true;
          break;
        }
      }
    }
    pool[proc].code = Some(code);
  }
  pool[proc].flags &= !Flags::PROCESSED;
  calls
}

/// The scopes holding a procedure's storage: its body scope, plus its
/// type cell, where the arguments live.
fn storage_scopes(pool: &CellPool, proc: CellId) -> SmallVec<[CellId; 2]> {
  let mut scopes = smallvec![proc];
  if let Some(ty) = pool[proc].ty {
    if pool.type_variant(ty) == crate::types::cell::TypeVariant::Proc {
      scopes.push(ty);
    }
  }
  scopes
}

/// Collect a procedure's addressed locals into `(address, size)` pairs,
/// descending into anonymous subscopes.
fn placed_vars(pool: &CellPool, scope: CellId, out: &mut Vec<(u32, u32)>) {
  for member in pool.members(scope) {
    match pool[member].kind {
      Kind::Scope => placed_vars(pool, member, out),
      Kind::Var { adr: Some(adr), .. } => {
        if let Some(n) = pool.int_value(adr) {
          let size = pool[member].ty.map_or(0, |ty| pool.type_size(ty));
          if size > 0 {
            if let Ok(a) = u32::try_from(n) {
              out.push((a, size));
            }
          }
        }
      }
      _ => {}
    }
  }
}

fn unplaced_vars(pool: &CellPool, scope: CellId, out: &mut Vec<CellId>) {
  for member in pool.members(scope) {
    match pool[member].kind {
      Kind::Scope => unplaced_vars(pool, member, out),
      Kind::Var { adr: None, .. } => {
        // Arrays are reserved by the assembler through ALLOC directives,
        // not carved out of the variable heap.
        let is_array = pool[member].ty
          .is_some_and(|ty| pool.type_variant(ty) == crate::types::cell::TypeVariant::Array);
        if pool.is_used(member) && !pool.is_label(member) && !pool.is_virtual(member) && !is_array
        {
          out.push(member);
        }
      }
      _ => {}
    }
  }
}

/// Assign addresses to one procedure's locals.
///
/// `procs` is every reachable procedure (allocation visits them one by
/// one; storage already placed in earlier visits is what later visits
/// reuse). `var_heap` is the platform region; bytes taken from it are
/// gone for the rest of the compile.
pub fn allocate_variables(
  pool: &mut CellPool, proc: CellId, procs: &[CellId], var_heap: &mut MemHeap,
) -> Result<(), HeapExhausted> {
  let mut heap = MemHeap::new();

  // Interrupt handlers may preempt anything, so they never share
  // storage with anyone, in either direction.
  let isolated = pool[proc].flags.intersects(Flags::PROC_INTERRUPT | Flags::USED_IN_INTERRUPT);

  if !isolated {
    for &other in procs {
      if other == proc || pool[other].read == 0 || pool[other].code.is_none() {
        continue;
      }
      if !proc_calls_proc(pool, proc, other) && !proc_calls_proc(pool, other, proc) {
        let mut ranges = vec![];
        for scope in storage_scopes(pool, other) {
          placed_vars(pool, scope, &mut ranges);
        }
        for (adr, size) in ranges {
          heap.add_block(adr, size);
        }
      }
    }
    for &other in procs {
      if other == proc {
        continue;
      }
      let conflicts = pool[other].flags
        .intersects(Flags::PROC_INTERRUPT | Flags::USED_IN_INTERRUPT)
        || proc_calls_proc(pool, proc, other)
        || proc_calls_proc(pool, other, proc);
      if conflicts {
        let mut ranges = vec![];
        for scope in storage_scopes(pool, other) {
          placed_vars(pool, scope, &mut ranges);
        }
        for (adr, size) in ranges {
          heap.remove_block(adr, size);
        }
      }
    }
  }

  let mut pending = vec![];
  for scope in storage_scopes(pool, proc) {
    unplaced_vars(pool, scope, &mut pending);
  }
  for var in pending {
    let size = pool[var].ty.map_or(0, |ty| pool.type_size(ty));
    if size == 0 {
      continue;
    }
    let adr = heap.alloc(size)
      .or_else(|| var_heap.alloc(size))
      .ok_or(HeapExhausted { var, size })?;
    let adr_cell = pool.int(adr);
    if let Kind::Var { ref mut adr, .. } = pool[var].kind {
      *adr = Some(adr_cell);
    }
  }
  Ok(())
}
