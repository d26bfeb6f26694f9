//! The emitter: walk the final IR, select an emission rule for every
//! instruction, and write assembler text.
//!
//! The core knows nothing about the target ISA; every mnemonic comes
//! from platform-supplied emission rules. Format strings interpolate
//! `%0`/`%1`/`%2` (result and arguments), `%A..%Z` (macro bindings),
//! `%'` (quote-constant formatting) and `%t` (tab). An instruction with
//! no matching rule is an internal error: translation promised the
//! stream was target-legal.

use std::io::{self, Write};

use itertools::Itertools;

use crate::rules::{Bindings, RuleSet};
use crate::types::cell::{CellId, CellPool, Kind, Submode, TypeVariant};
use crate::types::ir::{Instr, Op};

/// The emission context for one output file.
pub struct Emitter<'a, W: Write> {
  pool: &'a mut CellPool,
  rules: &'a RuleSet,
  /// The root procedure; its scope never prefixes emitted names.
  root: CellId,
  w: &'a mut W,
}

impl<'a, W: Write> Emitter<'a, W> {
  pub fn new(pool: &'a mut CellPool, rules: &'a RuleSet, root: CellId, w: &'a mut W) -> Self {
    Emitter { pool, rules, root, w }
  }

  /// Emit one instruction through its emission rule.
  pub fn instr(&mut self, i: &Instr) -> io::Result<()> {
    if i.op == Op::Ref {
      return Ok(());
    }
    let (rule, bindings) = self.rules.match_emit(self.pool, i).unwrap_or_else(|| {
      panic!("no rule for translating instruction {:?}", i.op)
    });
    let lines: Vec<Box<str>> = rule.to.iter()
      .filter(|t| t.op == Op::Emit)
      .map(|t| {
        let fmt = t.arg1.expect("emit carries its format string");
        match self.pool[fmt].kind {
          Kind::Text(ref s) => s.clone(),
          ref k => panic!("emit format must be a text cell, found {k:?}"),
        }
      })
      .collect();
    for fmt in lines {
      self.format_line(&fmt, i, &bindings)?;
    }
    Ok(())
  }

  /// Emit an ad-hoc instruction assembled from operands.
  pub fn instr_op(
    &mut self, op: Op, result: Option<CellId>, arg1: Option<CellId>, arg2: Option<CellId>,
  ) -> io::Result<()> {
    self.instr(&Instr::new(op, result, arg1, arg2))
  }

  fn format_line(&mut self, fmt: &str, i: &Instr, b: &Bindings) -> io::Result<()> {
    let mut out = String::new();
    let mut chars = fmt.chars().peekable();
    while let Some(c) = chars.next() {
      if c != '%' {
        out.push(c);
        continue;
      }
      let mut quoted = false;
      let mut d = chars.next().unwrap_or('%');
      if d == '\'' {
        quoted = true;
        d = chars.next().unwrap_or('%');
      }
      match d {
        'A'..='Z' => {
          let slot = u8::try_from(d as u32 - 'A' as u32 + 1).expect("fits");
          if let Some(cell) = b.get(slot) {
            self.push_cell(&mut out, cell, quoted);
          }
        }
        '0' => {
          if let Some(r) = i.result {
            self.push_cell(&mut out, r, quoted);
          }
        }
        '1' => {
          // LINE carries its annotation in the argument slots.
          if let Some(a) = i.arg1 {
            if i.op == Op::Line {
              if let Some(n) = self.pool.int_value(a) {
                out.push_str(&n.to_string());
              }
            } else {
              self.push_cell(&mut out, a, quoted);
            }
          }
        }
        '2' => {
          if let Some(a) = i.arg2 {
            if i.op == Op::Line {
              if let Kind::Text(ref s) = self.pool[a].kind {
                out.push_str(s);
              }
            } else {
              self.push_cell(&mut out, a, quoted);
            }
          }
        }
        't' => out.push('\t'),
        '@' => {}
        other => out.push(other),
      }
    }
    out.push('\n');
    log::trace!("{}", out.trim_end());
    self.w.write_all(out.as_bytes())
  }

  /// Append a cell's assembler spelling.
  fn push_cell(&mut self, out: &mut String, id: CellId, quoted: bool) {
    match self.pool[id].kind {
      Kind::Name { .. } => {
        // Source-module cells print their file name verbatim.
        if let Some(ref name) = self.pool[id].name {
          out.push_str(name);
        }
      }
      Kind::Element { arr, index } => {
        let base_is_struct = self.pool[arr].ty
          .is_some_and(|ty| self.pool.type_variant(ty) == TypeVariant::Struct);
        if base_is_struct {
          self.push_cell(out, arr, quoted);
          out.push('+');
          self.push_cell(out, index, quoted);
        } else {
          panic!("array element survived translation into emission");
        }
      }
      _ if self.pool[id].name.is_some() => {
        self.push_qualified_name(out, id);
      }
      Kind::Int(ref n) => out.push_str(&n.to_string()),
      Kind::Text(ref s) => {
        if quoted {
          push_str_const(out, s);
        } else {
          out.push_str(s);
        }
      }
      ref k => panic!("cell not representable in assembler output: {k:?}"),
    }
  }

  /// A named cell prefixed with its owning scope (`scope__name`), except
  /// at root scope and for labels, which are already procedure-unique.
  fn push_qualified_name(&mut self, out: &mut String, id: CellId) {
    let cell = &self.pool[id];
    let owner = cell.ty.and_then(|ty| match self.pool[ty].kind {
      Kind::Type(ref t) if t.variant == TypeVariant::Int => t.owner,
      _ => None,
    });
    if let Some(owner) = owner.filter(|&o| self.pool.cell_is_const(id) && o != id) {
      push_var_name(out, self.pool, owner);
      out.push_str("__");
    } else if let Some(scope) = cell.scope {
      if scope != self.root && self.pool[scope].name.is_some() && !self.pool.is_label(id) {
        push_var_name(out, self.pool, scope);
        out.push_str("__");
      }
    }
    push_var_name(out, self.pool, id);
  }
}

/// Mangle one identifier: a leading digit gets an `_N` prefix, quotes
/// become underscores, anything else outside `[A-Za-z0-9_]` is
/// hex-escaped as `xNN`.
fn push_var_name(out: &mut String, pool: &CellPool, id: CellId) {
  let cell = &pool[id];
  if let Some(ref name) = cell.name {
    if name.starts_with(|c: char| c.is_ascii_digit()) {
      out.push_str("_N");
    }
    for c in name.chars() {
      match c {
        '\'' => out.push_str("__"),
        '_' | 'a'..='z' | 'A'..='Z' | '0'..='9' => out.push(c),
        other => {
          let mut buf = [0u8; 4];
          for byte in other.encode_utf8(&mut buf).bytes() {
            out.push('x');
            out.push_str(&format!("{byte:02x}"));
          }
        }
      }
    }
  }
  // Generated names are numbered from 1; the printed suffix starts at
  // the second instance, so the first keeps the bare name.
  let suffix = cell.idx.saturating_sub(1);
  if suffix != 0 {
    out.push_str(&suffix.to_string());
  }
}

/// Quote-constant formatting: printable runs become `c'...'`, quote
/// characters are emitted as the byte value 39, all comma-separated.
fn push_str_const(out: &mut String, s: &str) {
  let mut in_quotes = false;
  let mut empty = true;
  for c in s.chars() {
    if c == '\'' {
      if in_quotes {
        out.push('\'');
        in_quotes = false;
      }
      if !empty {
        out.push(',');
      }
      out.push_str("39");
      empty = false;
    } else {
      if !in_quotes {
        if !empty {
          out.push(',');
        }
        out.push_str("c'");
        in_quotes = true;
      }
      out.push(c);
      empty = false;
    }
  }
  if in_quotes {
    out.push('\'');
  }
}

/// Emit `VARDEF` symbols: every named variable with a known address, and
/// every named, read constant.
pub fn emit_var_defs<W: Write>(e: &mut Emitter<'_, W>) -> io::Result<()> {
  let live = e.pool.live_cells();
  for id in live {
    if e.pool[id].name.is_none() || e.pool.is_label(id) || e.pool.is_reg(id) {
      continue;
    }
    let Kind::Var { adr, value } = e.pool[id].kind else { continue };
    let is_const = e.pool.cell_is_const(id);
    match (adr, value) {
      (Some(adr), _) if e.pool.is_used(id) && !is_const && !e.pool.is_reg(adr) => {
        e.instr_op(Op::VarDef, Some(id), Some(adr), None)?;
      }
      (None, Some(value)) if e.pool[id].read > 0 && is_const => {
        e.instr_op(Op::VarDef, Some(id), Some(value), None)?;
      }
      _ => {}
    }
  }
  Ok(())
}

/// Emit one procedure body. The stream was linearized after the last
/// optimizer run, so labels are ordinary instructions here.
pub fn emit_proc<W: Write>(e: &mut Emitter<'_, W>, proc: CellId) -> io::Result<()> {
  let Some(code) = e.pool[proc].code.take() else { return Ok(()) };
  for i in &code {
    e.instr(i)?;
  }
  e.pool[proc].code = Some(code);
  Ok(())
}

/// Emit every used procedure other than the root, wrapped in
/// `PROC`/`ENDPROC`.
pub fn emit_procedures<W: Write>(e: &mut Emitter<'_, W>, root: CellId) -> io::Result<()> {
  let procs: Vec<CellId> = e.pool.live_cells().into_iter()
    .filter(|&id| {
      id != root && e.pool.is_proc(id) && e.pool[id].read > 0 && e.pool[id].code.is_some()
    })
    .collect();
  for proc in procs {
    e.instr_op(Op::Proc, Some(proc), None, None)?;
    emit_proc(e, proc)?;
    e.instr_op(Op::EndProc, Some(proc), None, None)?;
  }
  Ok(())
}

/// For every included source module with a sibling `.asm` file, emit an
/// include of that file.
pub fn emit_asm_includes<W: Write>(
  e: &mut Emitter<'_, W>, project_dir: &std::path::Path,
) -> io::Result<()> {
  let modules: Vec<CellId> = e.pool.live_cells().into_iter()
    .filter(|&id| {
      matches!(e.pool[id].kind, Kind::Name { .. })
        && e.pool[id].name.is_some()
        && !e.pool[id].submode.contains(Submode::MAIN_FILE)
    })
    .collect();
  for m in modules {
    let stem = e.pool[m].name.clone().expect("modules are named");
    let asm = project_dir.join(format!("{stem}.asm"));
    if asm.is_file() {
      let path_cell = e.pool.text(&asm.display().to_string());
      e.instr_op(Op::Include, Some(path_cell), None, None)?;
    }
  }
  Ok(())
}

/// Emit storage-allocation directives for used variables the allocator
/// left to the assembler: labels plus `ALLOC` for arrays (with their
/// dimensions), honoring an alignment hint carried by the type, and a
/// plain `ALLOC` for any other unplaced variable the platform knows how
/// to reserve.
pub fn emit_allocations<W: Write>(e: &mut Emitter<'_, W>) -> io::Result<()> {
  let vars: Vec<CellId> = e.pool.live_cells().into_iter()
    .filter(|&id| {
      matches!(e.pool[id].kind, Kind::Var { adr: None, .. }) && e.pool.is_used(id)
    })
    .collect();
  for var in vars {
    let Some(ty) = e.pool[var].ty else { continue };
    if e.pool.type_variant(ty) == TypeVariant::Array && e.pool[var].code.is_none() {
      if let Some(align) = e.pool.type_cell(ty).adr {
        e.instr_op(Op::Align, None, Some(align), None)?;
      }
      let (dim1, dim2) = e.pool.array_dims(ty);
      let size = e.pool.type_size(ty);
      e.instr_op(Op::Label, Some(var), None, None)?;
      if dim2.is_some() {
        e.instr_op(Op::Alloc, Some(var), dim1, dim2)?;
      } else {
        let size_cell = e.pool.int(size);
        e.instr_op(Op::Alloc, Some(var), Some(size_cell), None)?;
      }
    } else if !e.pool.is_virtual(var) {
      let probe = Instr::new(Op::Alloc, Some(var), None, None);
      if e.rules.can_emit(e.pool, &probe) {
        e.instr(&probe)?;
      }
    }
  }
  Ok(())
}

/// Emit index helper data for used arrays, for platforms that register
/// an `ARRAY_INDEX` rule (row-address tables and the like).
pub fn emit_array_indexes<W: Write>(e: &mut Emitter<'_, W>) -> io::Result<()> {
  let arrays: Vec<CellId> = e.pool.live_cells().into_iter()
    .filter(|&id| {
      matches!(e.pool[id].kind, Kind::Var { .. })
        && e.pool.is_used(id)
        && e.pool[id].ty.is_some_and(|ty| e.pool.type_variant(ty) == TypeVariant::Array)
    })
    .collect();
  for arr in arrays {
    let probe = Instr::new(Op::ArrayIndex, None, Some(arr), None);
    if e.rules.can_emit(e.pool, &probe) {
      e.instr(&probe)?;
    }
  }
  Ok(())
}

/// Emit bodies of initialized arrays: alignment, the array's label, then
/// its `DATA` stream, with `ORG` first when the array is placed at a
/// fixed address.
pub fn emit_array_initializers<W: Write>(e: &mut Emitter<'_, W>) -> io::Result<()> {
  let arrays: Vec<CellId> = e.pool.live_cells().into_iter()
    .filter(|&id| {
      matches!(e.pool[id].kind, Kind::Var { .. })
        && e.pool[id].code.is_some()
        && e.pool.is_used(id)
        && e.pool[id].ty.is_some_and(|ty| e.pool.type_variant(ty) == TypeVariant::Array)
    })
    .sorted()
    .collect();
  for arr in arrays {
    let ty = e.pool[arr].ty.expect("filtered on type");
    if let Some(align) = e.pool.type_cell(ty).adr {
      e.instr_op(Op::Align, None, Some(align), None)?;
    }
    if let Kind::Var { adr: Some(adr), .. } = e.pool[arr].kind {
      e.instr_op(Op::Org, None, Some(adr), None)?;
    }
    e.instr_op(Op::Label, Some(arr), None, None)?;
    emit_proc(e, arr)?;
  }
  Ok(())
}
