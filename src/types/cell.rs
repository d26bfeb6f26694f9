//! The cell universe.
//!
//! Every semantic entity the compiler manipulates — variables, constants,
//! types, ranges, scopes, whole expressions — is a [`Cell`] in one arena,
//! the [`CellPool`]. Cells reference each other by stable [`CellId`]
//! indices, so the cyclic graphs the compiler needs (scope ↔ member,
//! type ↔ owner, recursive call edges) are expressed without shared
//! ownership.
//!
//! Storage is a chain of fixed-capacity slabs with a free list threaded
//! through unused slots. Cells are never freed individually; the pool
//! lives for the whole batch compile.

use bitflags::bitflags;
use hashbrown::HashMap;
use num::BigInt;

use crate::mk_id;
use crate::types::Bookmark;
use crate::types::ir::{Code, Op};

mk_id! {
  /// The index of a cell in the [`CellPool`].
  CellId,
}

/// Capacity of one slab in the pool.
const CELL_BLOCK_CAPACITY: usize = 512;

bitflags! {
  /// Secondary mode bits of a cell.
  #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
  pub struct Submode: u16 {
    /// The cell is a CPU register (or aliases one).
    const REG          = 1 << 0;
    /// Defined by a system module rather than user code.
    const SYSTEM       = 1 << 1;
    /// Defined by the user program.
    const USER_DEFINED = 1 << 2;
    /// Read side effect: reading yields a new value each time.
    const IN           = 1 << 3;
    /// Write side effect: writes are externally observable.
    const OUT          = 1 << 4;
    /// Part of a sequence definition.
    const IN_SEQUENCE  = 1 << 5;
    /// Input argument of a procedure.
    const ARG_IN       = 1 << 6;
    /// Output argument of a procedure.
    const ARG_OUT      = 1 << 7;
    /// Compile-time parameter.
    const PARAM        = 1 << 8;
    /// Passed by reference.
    const REF          = 1 << 9;
    /// The main source file (as opposed to an included module).
    const MAIN_FILE    = 1 << 10;
  }
}

bitflags! {
  /// Transient and analysis flags of a cell.
  #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
  pub struct Flags: u16 {
    /// Recursion guard for graph traversals. Every traversal that sets it
    /// must clear it on all exit paths.
    const PROCESSED         = 1 << 0;
    /// The procedure is an interrupt handler.
    const PROC_INTERRUPT    = 1 << 1;
    /// The procedure's address is taken (used as a value).
    const PROC_ADDRESS      = 1 << 2;
    /// The procedure is reachable from an interrupt handler.
    const USED_IN_INTERRUPT = 1 << 3;
    /// The label has a definition in the current procedure.
    const LABEL_DEFINED     = 1 << 4;
    /// The variable may be read before it is written.
    const UNINITIALIZED     = 1 << 5;
    /// The variable is a loop induction variable.
    const LOOP              = 1 << 6;
    /// The variable's value depends on a loop variable.
    const LOOP_DEPENDENT    = 1 << 7;
    /// Generic per-pass scratch mark.
    const USED              = 1 << 8;
  }
}

/// The semantic family a type cell belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TypeVariant {
  Undefined,
  Int,
  String,
  Label,
  Proc,
  Macro,
  Array,
  Struct,
  Tuple,
  Variant,
  Adr,
  Scope,
  Type,
}

/// Payload of a `TYPE` cell.
///
/// The two generic children are variant-dependent: for `Array` they are
/// the index type and the element type, for `Adr` the left child is the
/// pointee, for `Tuple`/`Variant` they are the two parts, and for `Type`
/// the left child is the restriction.
#[derive(Clone, Debug, Default)]
pub struct TypeCell {
  pub variant: TypeVariant,
  /// Integer range `[min, max]`; `None` for non-integer variants.
  pub range: Option<(BigInt, BigInt)>,
  /// Array element stride in bytes; 0 falls through to the element size.
  pub step: u32,
  /// Explicit set of admissible values (enumerated constants).
  pub possible_values: Option<CellId>,
  /// The cell this type was declared for.
  pub owner: Option<CellId>,
  /// Alignment hint for storage carrying this type.
  pub adr: Option<CellId>,
  /// The range may still widen during inference.
  pub flexible: bool,
  pub l: Option<CellId>,
  pub r: Option<CellId>,
}

impl Default for TypeVariant {
  fn default() -> Self { TypeVariant::Undefined }
}

/// The kind tag of a cell, with kind-specific payload.
#[derive(Clone, Debug, Default)]
pub enum Kind {
  /// A free-listed slot; never observed by passes.
  #[default]
  Null,
  /// A named variable. `adr` is its physical address cell (if placed),
  /// `value` an attached compile-time value.
  Var { adr: Option<CellId>, value: Option<CellId> },
  /// An integer constant.
  Int(BigInt),
  /// A text constant.
  Text(Box<str>),
  /// An inclusive range of two bound cells.
  Range { lo: CellId, hi: CellId },
  /// A pair of cells.
  Tuple { l: CellId, r: CellId },
  /// An indexed access `arr(index)`; the index may itself be a range or
  /// tuple cell.
  Element { arr: CellId, index: CellId },
  /// Dereference of a pointer cell.
  Deref { var: CellId },
  /// The `index`-th byte of a wider cell.
  Byte { arr: CellId, index: CellId },
  /// An array literal; its initializers are the attached code.
  ArrayLit,
  /// A type; see [`TypeCell`].
  Type(Box<TypeCell>),
  /// A named alias for another cell.
  Name { value: Option<CellId> },
  /// A namespace. Members hang off `subscope`.
  Scope,
  /// The absence of a value (distinct from `Null`: `Empty` is live).
  Empty,
  /// An arithmetic sequence `init, init+step, .. limit` (or the
  /// multiplicative analogue); used for induction-variable reasoning.
  Sequence { op: Op, init: CellId, step: CellId, limit: CellId },
  /// An operator applied to one or two operand cells.
  Op { op: Op, l: CellId, r: CellId },
}

impl Kind {
  /// The two generic child slots, in `l`/`r` order.
  #[must_use] pub fn children(&self) -> (Option<CellId>, Option<CellId>) {
    match *self {
      Kind::Var { adr, value } => (adr, value),
      Kind::Range { lo, hi } => (Some(lo), Some(hi)),
      Kind::Tuple { l, r } | Kind::Op { l, r, .. } => (Some(l), Some(r)),
      Kind::Element { arr, index } | Kind::Byte { arr, index } => (Some(arr), Some(index)),
      Kind::Deref { var } => (None, Some(var)),
      Kind::Name { value } => (None, value),
      Kind::Type(ref t) => (t.l, t.r),
      Kind::Sequence { init, limit, .. } => (Some(init), Some(limit)),
      Kind::Null | Kind::Int(_) | Kind::Text(_) | Kind::ArrayLit | Kind::Scope
      | Kind::Empty => (None, None),
    }
  }
}

/// The universal node.
#[derive(Clone, Debug, Default)]
pub struct Cell {
  pub kind: Kind,
  pub name: Option<Box<str>>,
  /// Numeric suffix distinguishing generated names; 0 for none.
  pub idx: u32,
  pub submode: Submode,
  pub flags: Flags,
  /// The semantic type of the cell; for type cells, the base it derives
  /// from.
  pub ty: Option<CellId>,
  /// The containing scope. Set at most once.
  pub scope: Option<CellId>,
  /// Head of the member list when this cell acts as a scope.
  pub subscope: Option<CellId>,
  /// Sibling link in the containing scope's member list. Doubles as the
  /// free-list link while the cell is `Null`.
  pub next_in_scope: Option<CellId>,
  pub read: u32,
  pub write: u32,
  pub bookmark: Bookmark,
  /// Attached instruction stream (procedure bodies, array initializers).
  pub code: Option<Code>,
}

/// The built-in cells every compile starts from.
#[derive(Clone, Copy, Debug)]
pub struct Builtins {
  pub t_undefined: CellId,
  /// The default integer type (32-bit signed range).
  pub t_int: CellId,
  /// `0..255`.
  pub t_byte: CellId,
  pub t_str: CellId,
  pub t_lbl: CellId,
  pub t_scope: CellId,
  pub t_type: CellId,
  /// The `EMPTY` cell: no value at all.
  pub empty: CellId,
  /// The 26 macro-argument cells `%A..%Z` used by rule bodies.
  pub rule_args: [CellId; 26],
}

/// The arena of all cells.
pub struct CellPool {
  chunks: Vec<Box<[Cell]>>,
  /// Head of the free list, threaded through `next_in_scope`.
  free: Option<CellId>,
  /// Interned integer constants, so equal values share one cell.
  ints: HashMap<BigInt, CellId>,
  /// Interned text constants.
  texts: HashMap<Box<str>, CellId>,
  pub builtins: Builtins,
  /// The `interrupt` base type, once the system scope defines it.
  pub interrupt: Option<CellId>,
  tmp_idx: u32,
  tmp_lbl_idx: u32,
  scope_idx: u32,
}

impl std::ops::Index<CellId> for CellPool {
  type Output = Cell;
  fn index(&self, id: CellId) -> &Cell {
    &self.chunks[id.0 as usize / CELL_BLOCK_CAPACITY][id.0 as usize % CELL_BLOCK_CAPACITY]
  }
}

impl std::ops::IndexMut<CellId> for CellPool {
  fn index_mut(&mut self, id: CellId) -> &mut Cell {
    &mut self.chunks[id.0 as usize / CELL_BLOCK_CAPACITY][id.0 as usize % CELL_BLOCK_CAPACITY]
  }
}

impl CellPool {
  pub fn new() -> Self {
    let mut pool = CellPool {
      chunks: vec![],
      free: None,
      ints: HashMap::new(),
      texts: HashMap::new(),
      builtins: Builtins {
        t_undefined: CellId(0),
        t_int: CellId(0),
        t_byte: CellId(0),
        t_str: CellId(0),
        t_lbl: CellId(0),
        t_scope: CellId(0),
        t_type: CellId(0),
        empty: CellId(0),
        rule_args: [CellId(0); 26],
      },
      interrupt: None,
      tmp_idx: 0,
      tmp_lbl_idx: 0,
      scope_idx: 0,
    };
    pool.new_block();
    let int_ty = |variant, min: i64, max: i64| {
      Kind::Type(Box::new(TypeCell {
        variant,
        range: Some((min.into(), max.into())),
        ..TypeCell::default()
      }))
    };
    let plain_ty = |variant| Kind::Type(Box::new(TypeCell { variant, ..TypeCell::default() }));
    pool.builtins.t_undefined = pool.alloc(plain_ty(TypeVariant::Undefined));
    pool.builtins.t_int = pool.alloc(int_ty(TypeVariant::Int, -2_147_483_648, 2_147_483_647));
    pool.builtins.t_byte = pool.alloc(int_ty(TypeVariant::Int, 0, 255));
    pool.builtins.t_str = pool.alloc(plain_ty(TypeVariant::String));
    pool.builtins.t_lbl = pool.alloc(plain_ty(TypeVariant::Label));
    pool.builtins.t_scope = pool.alloc(plain_ty(TypeVariant::Scope));
    pool.builtins.t_type = pool.alloc(plain_ty(TypeVariant::Type));
    pool.builtins.empty = pool.alloc(Kind::Empty);
    for (n, slot) in (0..26u32).zip("ABCDEFGHIJKLMNOPQRSTUVWXYZ".chars()) {
      let arg = pool.alloc(Kind::Var { adr: None, value: None });
      pool[arg].name = Some(format!("%{slot}").into());
      pool[arg].submode = Submode::PARAM;
      pool.builtins.rule_args[n as usize] = arg;
    }
    pool
  }

  fn new_block(&mut self) {
    let base = (self.chunks.len() * CELL_BLOCK_CAPACITY) as u32;
    let mut block = Vec::with_capacity(CELL_BLOCK_CAPACITY);
    for i in 0..CELL_BLOCK_CAPACITY as u32 {
      let next = if i + 1 < CELL_BLOCK_CAPACITY as u32 {
        Some(CellId(base + i + 1))
      } else {
        self.free
      };
      block.push(Cell { next_in_scope: next, ..Cell::default() });
    }
    self.chunks.push(block.into_boxed_slice());
    self.free = Some(CellId(base));
  }

  /// Allocate a cell of the given kind. All other fields start zeroed.
  pub fn alloc(&mut self, kind: Kind) -> CellId {
    let id = match self.free {
      Some(id) => id,
      None => {
        self.new_block();
        self.free.expect("fresh block has free cells")
      }
    };
    self.free = self[id].next_in_scope;
    self[id] = Cell { kind, ..Cell::default() };
    id
  }

  /// Allocate a cell and attach it to a scope.
  pub fn alloc_in_scope(&mut self, kind: Kind, scope: CellId) -> CellId {
    let id = self.alloc(kind);
    self.set_scope(id, scope);
    id
  }

  /// Clone a cell into a fresh slot. The copy starts detached: its scope
  /// and sibling link are cleared so invariant 1 (one scope chain per
  /// cell) holds.
  pub fn copy_cell(&mut self, id: CellId) -> CellId {
    let mut cell = self[id].clone();
    cell.scope = None;
    cell.next_in_scope = None;
    cell.subscope = None;
    let copy = self.alloc(Kind::Null);
    self[copy] = cell;
    copy
  }

  /// All live (non-`Null`) cells, in allocation order.
  pub fn live_cells(&self) -> Vec<CellId> {
    let mut out = vec![];
    for (b, chunk) in self.chunks.iter().enumerate() {
      for (i, cell) in chunk.iter().enumerate() {
        if !matches!(cell.kind, Kind::Null) {
          out.push(CellId((b * CELL_BLOCK_CAPACITY + i) as u32));
        }
      }
    }
    out
  }

  /// Attach a cell to a scope, appending it to the member list.
  /// Attaching a cell that already has a scope is a programmer error.
  pub fn set_scope(&mut self, id: CellId, scope: CellId) {
    assert!(self[id].scope.is_none(), "cell already has its scope set");
    self[id].scope = Some(scope);
    match self[scope].subscope {
      None => self[scope].subscope = Some(id),
      Some(mut sub) => {
        while let Some(next) = self[sub].next_in_scope {
          sub = next;
        }
        self[sub].next_in_scope = Some(id);
      }
    }
  }

  /// Direct members of a scope, in declaration order.
  pub fn members(&self, scope: CellId) -> Members<'_> {
    Members { pool: self, next: self[scope].subscope }
  }

  /// Find a member of `scope` by name. Case-sensitive, first match wins.
  #[must_use] pub fn find(&self, scope: CellId, name: &str) -> Option<CellId> {
    self.members(scope).find(|&m| self[m].name.as_deref() == Some(name))
  }

  /// Find a name walking the scope chain outward from `scope`.
  ///
  /// Scopes typed as procedures get one twist: the procedure's type cell
  /// is searched as well, so parameters declared on a shared procedure
  /// type are visible inside every body using it.
  #[must_use] pub fn find_in_chain(&self, scope: CellId, name: &str) -> Option<CellId> {
    let mut s = Some(scope);
    while let Some(id) = s {
      if let Some(found) = self.find(id, name) {
        return Some(found);
      }
      if let Some(ty) = self[id].ty {
        if matches!(self.type_variant(ty), TypeVariant::Proc | TypeVariant::Macro) {
          if let Some(found) = self.find(ty, name) {
            return Some(found);
          }
        }
      }
      s = self[id].scope;
    }
    None
  }

  /// The nearest enclosing procedure (or macro) scope.
  #[must_use] pub fn proc_scope(&self, scope: CellId) -> Option<CellId> {
    let mut s = Some(scope);
    while let Some(id) = s {
      if let Some(ty) = self[id].ty {
        if matches!(self.type_variant(ty), TypeVariant::Proc | TypeVariant::Macro) {
          return Some(id);
        }
      }
      s = self[id].scope;
    }
    None
  }

  // ---------------------------------------------------------------- values

  /// The interned cell for an integer constant.
  pub fn int(&mut self, n: impl Into<BigInt>) -> CellId {
    let n = n.into();
    if let Some(&id) = self.ints.get(&n) {
      return id;
    }
    let id = self.alloc(Kind::Int(n.clone()));
    self.ints.insert(n, id);
    id
  }

  /// The interned cell for a text constant.
  pub fn text(&mut self, s: &str) -> CellId {
    if let Some(&id) = self.texts.get(s) {
      return id;
    }
    let id = self.alloc(Kind::Text(s.into()));
    self.texts.insert(s.into(), id);
    id
  }

  /// The integer value of a cell, if it is (or names) an integer constant.
  #[must_use] pub fn int_value(&self, id: CellId) -> Option<&BigInt> {
    match self[id].kind {
      Kind::Int(ref n) => Some(n),
      Kind::Name { value: Some(v) } => self.int_value(v),
      Kind::Var { value: Some(v), .. } if self.cell_is_const(id) => self.int_value(v),
      _ => None,
    }
  }

  pub fn range_cell(&mut self, lo: CellId, hi: CellId) -> CellId {
    self.alloc(Kind::Range { lo, hi })
  }

  pub fn tuple(&mut self, l: CellId, r: CellId) -> CellId {
    self.alloc(Kind::Tuple { l, r })
  }

  pub fn element(&mut self, arr: CellId, index: CellId) -> CellId {
    self.alloc(Kind::Element { arr, index })
  }

  pub fn deref(&mut self, var: CellId) -> CellId {
    self.alloc(Kind::Deref { var })
  }

  pub fn byte_cell(&mut self, arr: CellId, index: CellId) -> CellId {
    self.alloc(Kind::Byte { arr, index })
  }

  pub fn op_cell(&mut self, op: Op, l: CellId, r: CellId) -> CellId {
    self.alloc(Kind::Op { op, l, r })
  }

  // ------------------------------------------------------------- variables

  /// Allocate a named variable in a scope.
  pub fn new_var(&mut self, name: &str, ty: CellId, scope: CellId) -> CellId {
    let var = self.alloc_in_scope(Kind::Var { adr: None, value: None }, scope);
    self[var].name = Some(name.into());
    self[var].ty = Some(ty);
    var
  }

  /// Allocate an anonymous temporary in a scope.
  pub fn new_tmp(&mut self, ty: CellId, scope: CellId) -> CellId {
    self.tmp_idx += 1;
    let var = self.new_var("_t", ty, scope);
    self[var].idx = self.tmp_idx;
    var
  }

  /// Allocate a named label in a scope.
  pub fn new_label(&mut self, name: &str, scope: CellId) -> CellId {
    self.new_var(name, self.builtins.t_lbl, scope)
  }

  /// Allocate a generated label (`_lbl<n>`).
  pub fn new_tmp_label(&mut self, scope: CellId) -> CellId {
    self.tmp_lbl_idx += 1;
    let lbl = self.new_label("_lbl", scope);
    self[lbl].idx = self.tmp_lbl_idx;
    lbl
  }

  /// Allocate an anonymous subscope cell (`_s<n>`).
  pub fn new_subscope(&mut self, parent: CellId) -> CellId {
    self.scope_idx += 1;
    let t_scope = self.builtins.t_scope;
    let s = self.alloc_in_scope(Kind::Scope, parent);
    self[s].name = Some("_s".into());
    self[s].idx = self.scope_idx;
    self[s].ty = Some(t_scope);
    s
  }

  /// A display name for diagnostics: the name plus its generated suffix.
  #[must_use] pub fn cell_name(&self, id: CellId) -> String {
    let cell = &self[id];
    match (&cell.name, cell.idx) {
      (Some(name), 0) => name.to_string(),
      (Some(name), idx) => format!("{name}{idx}"),
      (None, _) => match cell.kind {
        Kind::Int(ref n) => n.to_string(),
        Kind::Text(ref s) => s.to_string(),
        _ => format!("<cell {}>", id.0),
      },
    }
  }

  // ------------------------------------------------------------ predicates

  /// The variant of a type cell; `Undefined` when the cell is not a type.
  #[must_use] pub fn type_variant(&self, id: CellId) -> TypeVariant {
    match self[id].kind {
      Kind::Type(ref t) => t.variant,
      _ => TypeVariant::Undefined,
    }
  }

  /// The semantic variant of a cell's value.
  #[must_use] pub fn value_variant(&self, id: CellId) -> TypeVariant {
    match self[id].kind {
      Kind::Int(_) | Kind::Range { .. } => TypeVariant::Int,
      Kind::Text(_) => TypeVariant::String,
      Kind::Type(ref t) => t.variant,
      Kind::Var { .. } | Kind::Name { .. } => {
        match self[id].ty {
          Some(ty) => self.value_variant(ty),
          None => TypeVariant::Undefined,
        }
      }
      _ => TypeVariant::Undefined,
    }
  }

  /// A cell is a value if it directly represents a numeric, text, array
  /// or type value.
  #[must_use] pub fn cell_is_value(&self, id: CellId) -> bool {
    matches!(self[id].kind, Kind::Int(_) | Kind::Text(_) | Kind::ArrayLit | Kind::Type(_))
  }

  /// Would this cell, used as a type, admit exactly one value?
  #[must_use] pub fn type_is_const(&self, id: CellId) -> bool {
    match self[id].kind {
      Kind::Type(ref t) => t.possible_values.is_some_and(|v| self.cell_is_value(v)),
      Kind::Range { lo, hi } => lo == hi,
      Kind::Var { .. } => self[id].ty.is_some_and(|ty| self.type_is_const(ty)),
      _ => self.cell_is_value(id),
    }
  }

  /// A cell is constant if it is a value or a variable of constant type.
  #[must_use] pub fn cell_is_const(&self, id: CellId) -> bool {
    self.cell_is_value(id)
      || (matches!(self[id].kind, Kind::Var { .. } | Kind::Name { .. })
        && self[id].ty.is_some_and(|ty| self.type_is_const(ty)))
  }

  /// Whether the cell is a label variable.
  #[must_use] pub fn is_label(&self, id: CellId) -> bool {
    self[id].ty.is_some_and(|ty| self.type_variant(ty) == TypeVariant::Label)
  }

  /// Whether the cell is a procedure variable with a body or declaration.
  #[must_use] pub fn is_proc(&self, id: CellId) -> bool {
    matches!(self[id].kind, Kind::Var { .. })
      && self[id].ty.is_some_and(|ty| self.type_variant(ty) == TypeVariant::Proc)
  }

  /// Whether the procedure's type chain terminates at the `interrupt`
  /// base type.
  #[must_use] pub fn is_interrupt(&self, proc: CellId) -> bool {
    let Some(interrupt) = self.interrupt else { return false };
    let Some(mut base) = self[proc].ty else { return false };
    while let Some(up) = self[base].ty {
      base = up;
    }
    base == interrupt
  }

  /// Whether the cell is a register or stored in registers: either its
  /// own `REG` submode is set, its address chain reaches a register, or
  /// (for tuples) any part is a register.
  #[must_use] pub fn is_reg(&self, id: CellId) -> bool {
    match self[id].kind {
      Kind::Var { adr, .. } => {
        self[id].submode.contains(Submode::REG) || adr.is_some_and(|a| self.is_reg(a))
      }
      Kind::Tuple { l, r } => self.is_reg(l) || self.is_reg(r),
      _ => false,
    }
  }

  /// The register aliased by this variable, if its address chain reaches
  /// one.
  #[must_use] pub fn reg_of(&self, id: CellId) -> Option<CellId> {
    let mut cur = id;
    loop {
      if !matches!(self[cur].kind, Kind::Var { .. }) {
        return None;
      }
      if self[cur].submode.contains(Submode::REG) {
        return Some(cur);
      }
      match self[cur].kind {
        Kind::Var { adr: Some(a), .. } => cur = a,
        _ => return None,
      }
    }
  }

  /// Whether the cell occupies no runtime storage: constants, registers,
  /// macro-argument slots, and variables typed as procedures, macros,
  /// labels or scopes.
  #[must_use] pub fn is_virtual(&self, id: CellId) -> bool {
    let cell = &self[id];
    if !matches!(cell.kind, Kind::Var { .. }) {
      return true;
    }
    if self.cell_is_const(id) || self.is_reg(id) || cell.submode.contains(Submode::PARAM) {
      return true;
    }
    let Some(ty) = cell.ty else { return true };
    match self[ty].kind {
      Kind::Type(ref t) => matches!(
        t.variant,
        TypeVariant::Proc | TypeVariant::Macro | TypeVariant::Label | TypeVariant::Scope
      ) || (t.variant == TypeVariant::Type && t.possible_values.is_none()),
      Kind::Var { .. } => self.is_virtual(ty),
      Kind::Null => true,
      _ => false,
    }
  }

  /// Whether the cell has any recorded use.
  #[must_use] pub fn is_used(&self, id: CellId) -> bool {
    self[id].read > 0 || self[id].write > 0
  }

  /// The arguments of a procedure with the given argument submode, in
  /// declaration order.
  ///
  /// A call target may be a procedure variable, a variable of procedure
  /// type, or a pointer to one; the arguments always live on the
  /// procedure's type cell.
  #[must_use] pub fn proc_args(&self, proc: CellId, submode: Submode) -> Vec<CellId> {
    let mut holder = proc;
    if let Kind::Var { .. } = self[holder].kind {
      if let Some(ty) = self[holder].ty {
        match self.type_variant(ty) {
          TypeVariant::Adr => {
            if let Some(elem) = self.type_cell(ty).l {
              holder = elem;
            }
          }
          TypeVariant::Proc | TypeVariant::Macro => holder = ty,
          _ => {}
        }
      }
    }
    self.members(holder)
      .filter(|&m| {
        matches!(self[m].kind, Kind::Var { .. }) && self[m].submode.contains(submode)
      })
      .collect()
  }

  // --------------------------------------------------- structural rewrites

  /// Replace every occurrence of `from` inside a cell tree by `to`,
  /// rebuilding element/tuple/range/deref nodes as needed. Returns the
  /// (possibly new) root.
  pub fn replace_cell(&mut self, id: CellId, from: CellId, to: CellId) -> CellId {
    if id == from {
      return to;
    }
    match self[id].kind {
      Kind::Element { arr, index } => {
        let (l, r) = (self.replace_cell(arr, from, to), self.replace_cell(index, from, to));
        if (l, r) != (arr, index) { self.element(l, r) } else { id }
      }
      Kind::Tuple { l, r } => {
        let (nl, nr) = (self.replace_cell(l, from, to), self.replace_cell(r, from, to));
        if (nl, nr) != (l, r) { self.tuple(nl, nr) } else { id }
      }
      Kind::Range { lo, hi } => {
        let (nl, nr) = (self.replace_cell(lo, from, to), self.replace_cell(hi, from, to));
        if (nl, nr) != (lo, hi) { self.range_cell(nl, nr) } else { id }
      }
      Kind::Byte { arr, index } => {
        let (l, r) = (self.replace_cell(arr, from, to), self.replace_cell(index, from, to));
        if (l, r) != (arr, index) { self.byte_cell(l, r) } else { id }
      }
      Kind::Deref { var } => {
        let v = self.replace_cell(var, from, to);
        if v != var { self.deref(v) } else { id }
      }
      _ => id,
    }
  }

  /// Whether `id` uses `test` — is it, or does it reach it through an
  /// address chain, element/tuple/byte structure, or a dereference?
  #[must_use] pub fn uses_cell(&self, id: CellId, test: CellId) -> bool {
    if matches!(self[test].kind, Kind::Int(_)) {
      return false;
    }
    if id == test {
      return true;
    }
    let found = match self[id].kind {
      Kind::Deref { var } => self.uses_cell(var, test),
      Kind::Var { adr: Some(a), .. } if !matches!(self[a].kind, Kind::Int(_)) => {
        self.uses_cell(a, test)
      }
      Kind::Element { arr, index } | Kind::Byte { arr, index } => {
        self.uses_cell(arr, test) || self.uses_cell(index, test)
      }
      Kind::Tuple { l, r } | Kind::Op { l, r, .. } | Kind::Range { lo: l, hi: r } => {
        self.uses_cell(l, test) || self.uses_cell(r, test)
      }
      _ => false,
    };
    if found {
      return true;
    }
    // A write to the tested variable's address alias also counts.
    match self[test].kind {
      Kind::Var { adr: Some(a), .. } => self.uses_cell(id, a),
      _ => false,
    }
  }
}

/// Iterator over the direct members of a scope.
pub struct Members<'a> {
  pool: &'a CellPool,
  next: Option<CellId>,
}

impl Iterator for Members<'_> {
  type Item = CellId;
  fn next(&mut self) -> Option<CellId> {
    let id = self.next?;
    self.next = self.pool[id].next_in_scope;
    Some(id)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn pool_and_scope() -> (CellPool, CellId) {
    let mut pool = CellPool::new();
    let root = pool.alloc(Kind::Scope);
    (pool, root)
  }

  #[test]
  fn alloc_zeroes_everything_but_kind() {
    let (mut pool, _) = pool_and_scope();
    let id = pool.alloc(Kind::Empty);
    let cell = &pool[id];
    assert!(matches!(cell.kind, Kind::Empty));
    assert!(cell.name.is_none() && cell.scope.is_none() && cell.next_in_scope.is_none());
    assert_eq!((cell.read, cell.write), (0, 0));
  }

  #[test]
  fn free_list_spans_blocks() {
    let mut pool = CellPool::new();
    // Exhaust well past one slab; every id must stay distinct and live.
    let ids: Vec<_> = (0..2 * CELL_BLOCK_CAPACITY).map(|_| pool.alloc(Kind::Empty)).collect();
    let mut sorted = ids.clone();
    sorted.sort();
    sorted.dedup();
    assert_eq!(sorted.len(), ids.len());
  }

  #[test]
  fn scope_membership_and_lookup() {
    let (mut pool, root) = pool_and_scope();
    let byte = pool.builtins.t_byte;
    let x = pool.new_var("x", byte, root);
    let y = pool.new_var("y", byte, root);
    assert_eq!(pool.members(root).collect::<Vec<_>>(), vec![x, y]);
    assert_eq!(pool.find(root, "x"), Some(x));
    assert_eq!(pool.find(root, "z"), None);
    // Case-sensitive.
    assert_eq!(pool.find(root, "X"), None);
  }

  #[test]
  #[should_panic(expected = "already has its scope set")]
  fn reattaching_is_a_programmer_error() {
    let (mut pool, root) = pool_and_scope();
    let byte = pool.builtins.t_byte;
    let x = pool.new_var("x", byte, root);
    pool.set_scope(x, root);
  }

  #[test]
  fn proc_scope_lookup_sees_parameters_on_the_type() {
    let (mut pool, root) = pool_and_scope();
    let byte = pool.builtins.t_byte;
    let proc_ty = pool.alloc(Kind::Type(Box::new(TypeCell {
      variant: TypeVariant::Proc,
      ..TypeCell::default()
    })));
    let param = pool.new_var("n", byte, proc_ty);
    pool[param].submode = Submode::ARG_IN;
    let proc = pool.new_var("double", proc_ty, root);
    // Inside the procedure's scope chain, `n` resolves via the type cell.
    assert_eq!(pool.find_in_chain(proc, "n"), Some(param));
    assert_eq!(pool.find_in_chain(root, "n"), None);
  }

  #[test]
  fn interned_ints_share_cells() {
    let (mut pool, _) = pool_and_scope();
    assert_eq!(pool.int(14), pool.int(14));
    assert_ne!(pool.int(14), pool.int(15));
  }

  #[test]
  fn replace_rebuilds_compound_cells() {
    let (mut pool, root) = pool_and_scope();
    let byte = pool.builtins.t_byte;
    let arr = pool.new_var("arr", byte, root);
    let i = pool.new_var("i", byte, root);
    let j = pool.new_var("j", byte, root);
    let el = pool.element(arr, i);
    let replaced = pool.replace_cell(el, i, j);
    assert_ne!(replaced, el);
    assert!(matches!(pool[replaced].kind, Kind::Element { index, .. } if index == j));
    // Untouched trees come back unchanged.
    assert_eq!(pool.replace_cell(el, j, i), el);
  }

  #[test]
  fn uses_cell_walks_structure() {
    let (mut pool, root) = pool_and_scope();
    let byte = pool.builtins.t_byte;
    let arr = pool.new_var("arr", byte, root);
    let i = pool.new_var("i", byte, root);
    let el = pool.element(arr, i);
    assert!(pool.uses_cell(el, i));
    assert!(pool.uses_cell(el, arr));
    let k = pool.new_var("k", byte, root);
    assert!(!pool.uses_cell(el, k));
  }

  #[test]
  fn register_chains() {
    let (mut pool, root) = pool_and_scope();
    let byte = pool.builtins.t_byte;
    let reg = pool.new_var("x", byte, root);
    pool[reg].submode |= Submode::REG;
    let alias = pool.new_var("src", byte, root);
    pool[alias].kind = Kind::Var { adr: Some(reg), value: None };
    assert!(pool.is_reg(alias));
    assert_eq!(pool.reg_of(alias), Some(reg));
    assert!(pool.is_virtual(alias));
  }
}
