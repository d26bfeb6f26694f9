//! Compiler core for the Atalan language, a small imperative language
//! for 8-bit platforms (MOS 6502, Atari 8-bit and friends).
//!
//! The pipeline lowers a program built out of [`Cell`]s and abstract IR
//! instructions into target-legal IR by rule-driven rewriting, then into
//! assembler text by rule-driven emission:
//!
//! ```text
//! front-end -> (cells + raw IR) -> translator -> basic blocks ->
//!   optimizer -> basic blocks -> address allocator -> emitter
//! ```
//!
//! The surface parser is an external collaborator: it drives the builder
//! API on [`Compiler`] ([`Compiler::new_var`], [`Compiler::cursor`], scope
//! entry/exit) and everything from there on is this crate. The
//! procedure-use analysis runs twice, after parsing and after
//! translation, because translation may materialize new calls.
//!
//! [`Cell`]: types::cell::Cell

pub mod blocks;
pub mod emit;
pub mod optimize;
pub mod report;
pub mod rules;
pub mod storage;
pub mod translate;
pub mod types;
pub mod usage;

use std::io::Write;
use std::path::PathBuf;

use thiserror::Error;

use crate::report::Reporter;
use crate::rules::RuleSet;
use crate::storage::{HeapExhausted, MemHeap};
use crate::types::cell::{CellId, CellPool, Kind, Submode, TypeVariant};
use crate::types::ir::{Code, Gen, Instr, Op, eval_const_op};

/// Compiler options, as assembled by the command-line front-end.
#[derive(Clone, Debug)]
pub struct Options {
  /// Per-procedure verbose output.
  pub verbose: bool,
  /// Optimization level; 0 disables the optimizer passes.
  pub optimize: u8,
  /// Release build: drop asserts from generated code.
  pub asserts_off: bool,
  /// Directory of the compiled project; outputs land here.
  pub project_dir: PathBuf,
  /// Installation root holding `module/`, `platform/` and `cpu/`.
  pub system_dir: PathBuf,
  /// Explicit platform module name.
  pub platform: Option<String>,
}

impl Default for Options {
  fn default() -> Self {
    Options {
      verbose: false,
      optimize: 9,
      asserts_off: false,
      project_dir: PathBuf::from("."),
      system_dir: PathBuf::from("."),
      platform: None,
    }
  }
}

/// The current CPU description, built from the platform's `cpu` scope.
#[derive(Debug, Default)]
pub struct Cpu {
  pub scope: Option<CellId>,
  /// Register cells, in declaration order.
  pub regs: Vec<CellId>,
  /// The type describing addressable memory.
  pub memory: Option<CellId>,
}

/// Fatal outcomes of a compile. User-level diagnostics are collected in
/// the [`Reporter`]; this type only says why the pipeline stopped.
#[derive(Debug, Error)]
pub enum CompileError {
  #[error("compilation failed with {errors} error(s)")]
  Failed { errors: u32 },
  #[error("{0}")]
  OutOfMemory(#[from] HeapExhausted),
  #[error("i/o error: {0}")]
  Io(#[from] std::io::Error),
}

/// The process-wide compiler state, threaded through every pass: cell
/// pool, rule database, diagnostics, current scope, generation cursor,
/// CPU description and the platform variable heap.
pub struct Compiler {
  pub pool: CellPool,
  pub rules: RuleSet,
  pub reporter: Reporter,
  pub cursor: Gen,
  pub options: Options,
  pub cpu: Cpu,
  /// The root procedure; the main program body attaches here.
  pub root: CellId,
  /// The platform-declared fallback allocation region.
  pub var_heap: MemHeap,
  scope: CellId,
}

impl Compiler {
  pub fn new(options: Options) -> Self {
    let mut pool = CellPool::new();
    let root_ty = pool.type_alloc(TypeVariant::Proc);
    let root = pool.alloc(Kind::Var { adr: None, value: None });
    pool[root].name = Some("_root".into());
    pool[root].ty = Some(root_ty);
    pool.type_cell_mut(root_ty).owner = Some(root);

    // The `interrupt` base type: procedures whose type chain ends here
    // are interrupt handlers.
    let interrupt = pool.type_alloc(TypeVariant::Proc);
    pool[interrupt].name = Some("interrupt".into());
    pool.set_scope(interrupt, root);
    pool.interrupt = Some(interrupt);

    Compiler {
      pool,
      rules: RuleSet::new(),
      reporter: Reporter::default(),
      cursor: Gen::new(),
      options,
      cpu: Cpu::default(),
      root,
      var_heap: MemHeap::new(),
      scope: root,
    }
  }

  // -------------------------------------------------------------- scoping

  /// The scope new cells are attached to.
  #[must_use] pub fn current_scope(&self) -> CellId { self.scope }

  /// Switch to a scope, returning the previous one. Every `in_scope`
  /// must be paired with [`Compiler::return_scope`] on every exit path.
  pub fn in_scope(&mut self, scope: CellId) -> CellId {
    std::mem::replace(&mut self.scope, scope)
  }

  pub fn return_scope(&mut self, prev: CellId) {
    self.scope = prev;
  }

  /// Open an anonymous subscope under the current scope.
  pub fn enter_subscope(&mut self) {
    self.scope = self.pool.new_subscope(self.scope);
  }

  pub fn exit_subscope(&mut self) {
    self.scope = self.pool[self.scope].scope.expect("subscope has a parent");
  }

  // ------------------------------------------------- builder (parser API)

  /// Declare a variable in the current scope.
  pub fn new_var(&mut self, name: &str, ty: CellId) -> CellId {
    let scope = self.scope;
    self.pool.new_var(name, ty, scope)
  }

  /// Declare a procedure in the current scope: a fresh procedure type
  /// cell plus the named variable carrying it.
  pub fn new_proc(&mut self, name: &str) -> CellId {
    let ty = self.pool.type_alloc(TypeVariant::Proc);
    let proc = self.new_var(name, ty);
    self.pool.type_cell_mut(ty).owner = Some(proc);
    proc
  }

  /// Declare an argument on a procedure's type cell so it is visible to
  /// every body sharing the type.
  pub fn new_arg(&mut self, proc: CellId, name: &str, ty: CellId, submode: Submode) -> CellId {
    let proc_ty = self.pool[proc].ty.expect("procedures are typed");
    let arg = self.pool.new_var(name, ty, proc_ty);
    self.pool[arg].submode |= submode;
    arg
  }

  /// Open a procedure body: enter its scope and a fresh generation
  /// buffer. Returns the token for [`Compiler::end_proc`].
  pub fn begin_proc(&mut self, proc: CellId) -> CellId {
    self.cursor.begin();
    self.in_scope(proc)
  }

  /// Close a procedure body begun with [`Compiler::begin_proc`]: attach
  /// the generated stream and mark the procedure `OUT` when the body has
  /// visible side effects.
  pub fn end_proc(&mut self, proc: CellId, prev_scope: CellId) {
    let body = self.cursor.end();
    self.pool[proc].code = Some(body);
    self.return_scope(prev_scope);
    if optimize::code_has_side_effects(&self.pool, proc) {
      self.pool[proc].submode |= Submode::OUT;
    }
  }

  /// Register a source module. The emitter scans these for sibling
  /// `.asm` files.
  pub fn register_module(&mut self, stem: &str, main_file: bool) -> types::FileId {
    let file = self.reporter.add_file(format!("{stem}.atl"));
    let root = self.root;
    let cell = self.pool.alloc_in_scope(Kind::Name { value: None }, root);
    self.pool[cell].name = Some(stem.into());
    if main_file {
      self.pool[cell].submode |= Submode::MAIN_FILE;
    }
    file
  }

  /// Assemble a binary expression node, folding constant operands
  /// without emitting code.
  pub fn expr_binary(&mut self, op: Op, a1: CellId, a2: CellId) -> CellId {
    if let Some(c) = eval_const_op(&mut self.pool, op, Some(a1), Some(a2)) {
      return c;
    }
    let ty = self.pool[a1].ty.unwrap_or(self.pool.builtins.t_int);
    let scope = self.scope;
    let tmp = self.pool.new_tmp(ty, scope);
    self.cursor.op(op, Some(tmp), Some(a1), Some(a2));
    tmp
  }

  /// Assemble a unary expression node. `HI` and `LO` always produce a
  /// byte.
  pub fn expr_unary(&mut self, op: Op, a1: CellId) -> CellId {
    if let Some(c) = eval_const_op(&mut self.pool, op, Some(a1), None) {
      return c;
    }
    let ty = match op {
      Op::Hi | Op::Lo => self.pool.builtins.t_byte,
      _ => self.pool[a1].ty.unwrap_or(self.pool.builtins.t_int),
    };
    let scope = self.scope;
    let tmp = self.pool.new_tmp(ty, scope);
    self.cursor.op(op, Some(tmp), Some(a1), None);
    tmp
  }

  /// Lower a `for var: min..max [step s]` loop around an already
  /// generated body.
  ///
  /// The shape is: init, body label, body, increment, then a backward
  /// branch while the limit exceeds the variable. When the step is a
  /// constant 1 (or provably cannot wrap), no overflow check is
  /// inserted; a limit sitting exactly on a byte boundary degenerates to
  /// an overflow test alone.
  pub fn gen_for_range(
    &mut self, var: CellId, min: CellId, max: CellId, step: Option<CellId>, body: Code,
  ) {
    use num::BigInt;
    let scope = self.scope;
    let body_label = self.pool.new_tmp_label(scope);
    let step = step.unwrap_or_else(|| self.pool.int(1));

    self.cursor.op(Op::Let, Some(var), Some(min), None);
    self.cursor.label(body_label);
    self.cursor.block(body);
    self.cursor.op(Op::Add, Some(var), Some(var), Some(step));

    let step_n = self.pool.int_value(step).cloned();
    if let Some(max_n) = self.pool.int_value(max).cloned() {
      // The mask of all-ones bytes covering the limit.
      let mut nmask = BigInt::from(0xff);
      while max_n > nmask {
        nmask = (nmask << 8) | BigInt::from(0xff);
      }
      match step_n {
        // Stepping past an all-ones limit is exactly an overflow.
        Some(ref s) if max_n == nmask && *s > BigInt::from(255) => {
          self.cursor.op(Op::IfNoverflow, Some(body_label), None, None);
          return;
        }
        None if max_n == nmask => {
          self.cursor.op(Op::IfNoverflow, Some(body_label), None, None);
          return;
        }
        // A small constant step below the mask cannot wrap.
        Some(ref s) if &nmask - &max_n >= *s => {
          self.cursor.op(Op::IfGt, Some(body_label), Some(max), Some(var));
          return;
        }
        _ => {}
      }
    }
    let needs_overflow_check = step_n.as_ref().is_none_or(|s| *s != BigInt::from(1));
    if needs_overflow_check {
      let f_label = self.pool.new_tmp_label(scope);
      self.cursor.op(Op::IfOverflow, Some(f_label), None, None);
      self.cursor.op(Op::IfGt, Some(body_label), Some(max), Some(var));
      self.cursor.label(f_label);
    } else {
      self.cursor.op(Op::IfGt, Some(body_label), Some(max), Some(var));
    }
  }

  // ------------------------------------------------------------- platform

  /// Build the register file from the platform's CPU scope: every
  /// address-less integer variable in it is a register; variables with
  /// addresses are register sets. `cpu.memory` must be declared.
  pub fn init_cpu(&mut self, cpu_scope: CellId) {
    self.cpu.scope = Some(cpu_scope);
    self.cpu.regs.clear();
    for member in self.pool.members(cpu_scope).collect::<Vec<_>>() {
      if let Kind::Var { adr: None, .. } = self.pool[member].kind {
        let int_like = self.pool[member].ty.is_some_and(|ty| self.pool.type_is_int2(ty));
        if int_like {
          self.pool[member].submode |= Submode::REG;
          self.cpu.regs.push(member);
        }
      }
    }
    match self.pool.find(cpu_scope, "memory") {
      Some(mem) => self.cpu.memory = self.pool[mem].ty,
      None => panic!("CPU.memory was not defined"),
    }
  }

  /// Install the platform's `VAR_HEAP` region from the range of the
  /// `varheap` declaration.
  pub fn init_var_heap(&mut self) {
    let Some(var) = self.pool.find(self.root, "varheap") else {
      panic!("Platform does not define varheap");
    };
    let Some((min, max)) = self.pool.cell_range(var) else {
      panic!("varheap has no address range");
    };
    let min = u32::try_from(min).expect("varheap range fits the address space");
    let max = u32::try_from(max).expect("varheap range fits the address space");
    self.var_heap.add_range(min, max);
  }

  // ------------------------------------------------------------- pipeline

  /// Detach the main program body from the generation cursor into the
  /// root procedure.
  pub fn finish_root(&mut self) {
    let generator = std::mem::take(&mut self.cursor);
    self.pool[self.root].code = Some(generator.finish());
  }

  fn reachable(&self) -> Vec<CellId> {
    optimize::reachable_procs(&self.pool, self.root)
  }

  /// Every declared user variable whose type the platform cannot store
  /// is reported at its declaration.
  fn check_implementable(&mut self) {
    for id in self.pool.live_cells() {
      let cell = &self.pool[id];
      if !cell.submode.contains(Submode::USER_DEFINED) || !self.pool.is_used(id) {
        continue;
      }
      if !matches!(cell.kind, Kind::Var { adr: None, .. }) || self.pool.is_virtual(id) {
        continue;
      }
      let Some(ty) = cell.ty else { continue };
      if self.pool.type_variant(ty) != TypeVariant::Array {
        continue;
      }
      let (dim1, dim2) = self.pool.array_dims(ty);
      let probe = Instr::new(Op::Alloc, Some(id), dim1, dim2);
      if !self.rules.can_emit(&self.pool, &probe) {
        let bookmark = self.pool[id].bookmark;
        let name = self.pool.cell_name(id);
        self.reporter.platform_not_supported(
          bookmark,
          format!("Variable [{name}] has a type not supported by this platform"),
        );
      }
    }
  }

  fn fail_if_errors(&self) -> Result<(), CompileError> {
    if self.reporter.failed() {
      Err(CompileError::Failed { errors: self.reporter.error_count() })
    } else {
      Ok(())
    }
  }

  /// Run the middle- and back-end over the program built so far and
  /// write assembler text.
  pub fn compile(&mut self, out: &mut impl Write) -> Result<(), CompileError> {
    if self.pool[self.root].code.is_none() {
      self.finish_root();
    }
    self.fail_if_errors()?;

    usage::count_uses(&mut self.pool);
    usage::analyze(&mut self.pool, &mut self.reporter, self.root);
    self.check_implementable();
    self.fail_if_errors()?;

    if self.options.asserts_off {
      for proc in self.reachable() {
        optimize::strip_asserts(&mut self.pool, proc);
      }
    }

    // Inlining edits the linear streams, so it must precede any
    // basic-block construction.
    if self.options.optimize > 0 {
      for proc in self.reachable() {
        optimize::inline_calls(&mut self.pool, proc);
      }
    }

    for proc in self.reachable() {
      self.log_proc("parsed", proc);
      translate::translate_proc(&mut self.pool, &self.rules, proc);
    }

    // Translation may have materialized new calls.
    usage::analyze(&mut self.pool, &mut self.reporter, self.root);
    usage::count_uses(&mut self.pool);
    self.fail_if_errors()?;

    if self.options.optimize > 0 {
      for proc in self.reachable() {
        let code = self.pool[proc].code.take().expect("reachable procs have bodies");
        let mut cfg = blocks::build_cfg(code);
        optimize::optimize_jumps(&mut cfg);
        self.pool[proc].code = Some(cfg.into_code());
      }
      loop {
        usage::count_uses(&mut self.pool);
        let mut changed = false;
        for proc in self.reachable() {
          changed |= optimize::dead_store_elimination(&mut self.pool, proc);
        }
        if !changed {
          break;
        }
      }
      // Jump edits may have stranded blocks; rebuild and thread again.
      for proc in self.reachable() {
        let code = self.pool[proc].code.take().expect("reachable procs have bodies");
        let mut cfg = blocks::build_cfg(code);
        optimize::optimize_jumps(&mut cfg);
        self.pool[proc].code = Some(cfg.into_code());
        self.log_proc("optimized", proc);
      }
    }
    usage::count_uses(&mut self.pool);

    for id in self.pool.live_cells() {
      if let Kind::Type(ref t) = self.pool[id].kind {
        if t.variant == TypeVariant::Struct {
          self.pool.struct_assign_offsets(id);
        }
      }
    }

    let procs = self.reachable();
    for &proc in &procs {
      if let Err(err) = storage::allocate_variables(
        &mut self.pool, proc, &procs, &mut self.var_heap,
      ) {
        let bookmark = self.pool[err.var].bookmark;
        let name = self.pool.cell_name(err.var);
        self.reporter.platform_not_supported(
          bookmark,
          format!("out of variable space allocating [{name}] ({} bytes)", err.size),
        );
        return Err(err.into());
      }
    }

    usage::count_uses(&mut self.pool);
    let root = self.root;
    let project_dir = self.options.project_dir.clone();
    let mut emitter = emit::Emitter::new(&mut self.pool, &self.rules, root, out);
    emit::emit_var_defs(&mut emitter)?;
    emit::emit_proc(&mut emitter, root)?;
    emit::emit_procedures(&mut emitter, root)?;
    emit::emit_array_initializers(&mut emitter)?;
    emit::emit_array_indexes(&mut emitter)?;
    emit::emit_asm_includes(&mut emitter, &project_dir)?;
    emitter.instr_op(Op::CodeEnd, None, None, None)?;
    emit::emit_allocations(&mut emitter)?;

    self.reporter.finish();
    self.fail_if_errors()
  }

  /// Render the external assembler invocation through the platform's
  /// `COMPILER` emission rule, using the `BIN_EXTENSION` variable the
  /// platform module declares.
  pub fn assembler_command(&mut self, path_stem: &str) -> Option<String> {
    let bin_ext = self.pool.find(self.root, "BIN_EXTENSION")?;
    let ext_text = match self.pool[bin_ext].kind {
      Kind::Var { value: Some(v), .. } => v,
      _ => bin_ext,
    };
    let path_cell = self.pool.text(path_stem);
    let mut buf = Vec::new();
    {
      let root = self.root;
      let mut emitter = emit::Emitter::new(&mut self.pool, &self.rules, root, &mut buf);
      emitter.instr_op(Op::Compiler, Some(path_cell), Some(ext_text), None).ok()?;
    }
    let command = String::from_utf8(buf).ok()?;
    Some(command.trim_end().to_string())
  }

  fn log_proc(&self, stage: &str, proc: CellId) {
    if !log::log_enabled!(log::Level::Debug) {
      return;
    }
    let name = self.pool.cell_name(proc);
    log::debug!("---- {stage}: {name} ----");
    if let Some(ref code) = self.pool[proc].code {
      for i in code {
        log::debug!("{}", instr_to_string(&self.pool, i));
      }
    }
  }
}

/// A compact one-line rendering of an instruction for verbose dumps.
#[must_use] pub fn instr_to_string(pool: &CellPool, i: &Instr) -> String {
  let operand = |c: Option<CellId>| c.map_or(String::new(), |c| pool.cell_name(c));
  format!(
    "{} {}, {}, {}",
    i.op.as_str(),
    operand(i.result),
    operand(i.arg1),
    operand(i.arg2)
  )
}

/// Convenience for tests and front-ends: build a `Code` stream from
/// parts without going through the generation cursor.
#[must_use] pub fn instr(
  op: Op, result: Option<CellId>, arg1: Option<CellId>, arg2: Option<CellId>,
) -> Instr {
  Instr::new(op, result, arg1, arg2)
}

/// Re-exported for front-ends stamping bookmarks.
pub use crate::types::FileId;
