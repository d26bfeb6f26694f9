//! The rewrite-rule database and the pattern matcher.
//!
//! A rule pairs an opcode and three operand patterns with a substitution.
//! Translation rules substitute another IR sequence; emission rules
//! substitute a sequence of [`Op::Emit`] instructions carrying format
//! strings. Matching is a linear scan over the per-opcode list — the
//! first matching rule wins, so registration order expresses priority.

use if_chain::if_chain;

use crate::types::Bookmark;
use crate::types::cell::{CellId, CellPool, Kind};
use crate::types::ir::{Code, Instr, Op};

/// A macro-argument slot `%A..%Z`, numbered 1..=26.
pub type Slot = u8;

/// The capture table filled during a match and consumed by substitution
/// and by emission-string interpolation.
#[derive(Clone, Debug, Default)]
pub struct Bindings {
  slots: [Option<CellId>; 26],
}

impl Bindings {
  /// The cell bound to a slot, if any.
  #[must_use] pub fn get(&self, slot: Slot) -> Option<CellId> {
    self.slots[usize::from(slot) - 1]
  }

  /// Bind a slot, or check consistency against an earlier binding of the
  /// same slot. Returns false when the bindings disagree.
  pub fn bind(&mut self, slot: Slot, cell: CellId) -> bool {
    assert!((1..=26).contains(&slot), "macro slot out of range");
    match self.slots[usize::from(slot) - 1] {
      Some(prev) => prev == cell,
      ref mut empty @ None => {
        *empty = Some(cell);
        true
      }
    }
  }
}

/// An operand pattern with an optional capture slot for whatever it
/// matched.
#[derive(Clone, Debug, Default)]
pub struct OperandPat {
  pub pat: Pat,
  pub slot: Option<Slot>,
}

impl OperandPat {
  /// A wildcard that captures into a slot (`%A` style).
  #[must_use] pub fn arg(slot: Slot) -> Self {
    OperandPat { pat: Pat::Any, slot: Some(slot) }
  }

  #[must_use] pub fn of(pat: Pat) -> Self {
    OperandPat { pat, slot: None }
  }

  #[must_use] pub fn capturing(pat: Pat, slot: Slot) -> Self {
    OperandPat { pat, slot: Some(slot) }
  }
}

/// The shape an operand must have.
#[derive(Clone, Debug, Default)]
pub enum Pat {
  /// Matches anything, including an absent operand.
  #[default]
  Any,
  /// Matches one specific CPU register cell (or a variable aliasing it).
  Register(CellId),
  /// Matches a non-constant variable, optionally restricted to a type.
  Variable(Option<CellId>),
  /// Matches exactly this literal value.
  Value(CellId),
  /// Matches any constant.
  Const,
  /// Matches a dereference whose pointee matches the inner pattern.
  Deref(Box<OperandPat>),
  /// Matches a byte access whose pieces match recursively.
  Byte(Box<OperandPat>, Box<OperandPat>),
  /// Matches an element access; multi-index accesses are nested elements
  /// whose indexes are tuple patterns.
  Element(Box<OperandPat>, Box<OperandPat>),
  Tuple(Box<OperandPat>, Box<OperandPat>),
  Range(Box<OperandPat>, Box<OperandPat>),
}

/// One rewrite rule.
#[derive(Clone, Debug)]
pub struct Rule {
  pub op: Op,
  pub pats: [OperandPat; 3],
  /// The replacement: an IR sequence (translation) or `Emit`
  /// instructions carrying format strings (emission).
  pub to: Code,
  pub bookmark: Bookmark,
}

impl Rule {
  #[must_use] pub fn new(op: Op, pats: [OperandPat; 3], to: Code) -> Self {
    Rule { op, pats, to, bookmark: Bookmark::NONE }
  }
}

fn match_operand(
  pool: &CellPool, pat: &OperandPat, cell: Option<CellId>, b: &mut Bindings,
) -> bool {
  let matched = match (&pat.pat, cell) {
    (Pat::Any, _) => true,
    (_, None) => false,
    (&Pat::Register(reg), Some(c)) => c == reg || pool.reg_of(c) == Some(reg),
    (&Pat::Variable(ty), Some(c)) => {
      matches!(pool[c].kind, Kind::Var { .. })
        && !pool.cell_is_const(c)
        && ty.is_none_or(|ty| pool.var_match_type(c, ty))
    }
    (&Pat::Value(v), Some(c)) => {
      c == v
        || if_chain! {
          if let Some(a) = pool.int_value(c);
          if let Some(b) = pool.int_value(v);
          then { a == b } else { false }
        }
    }
    (Pat::Const, Some(c)) => pool.cell_is_const(c),
    (Pat::Deref(inner), Some(c)) => match pool[c].kind {
      Kind::Deref { var } => match_operand(pool, inner, Some(var), b),
      _ => false,
    },
    (Pat::Byte(arr, index), Some(c)) => match pool[c].kind {
      Kind::Byte { arr: a, index: i } => {
        match_operand(pool, arr, Some(a), b) && match_operand(pool, index, Some(i), b)
      }
      _ => false,
    },
    (Pat::Element(arr, index), Some(c)) => match pool[c].kind {
      Kind::Element { arr: a, index: i } => {
        match_operand(pool, arr, Some(a), b) && match_operand(pool, index, Some(i), b)
      }
      _ => false,
    },
    (Pat::Tuple(l, r), Some(c)) => match pool[c].kind {
      Kind::Tuple { l: cl, r: cr } => {
        match_operand(pool, l, Some(cl), b) && match_operand(pool, r, Some(cr), b)
      }
      _ => false,
    },
    (Pat::Range(lo, hi), Some(c)) => match pool[c].kind {
      Kind::Range { lo: clo, hi: chi } => {
        match_operand(pool, lo, Some(clo), b) && match_operand(pool, hi, Some(chi), b)
      }
      _ => false,
    },
  };
  if !matched {
    return false;
  }
  match (pat.slot, cell) {
    (Some(slot), Some(c)) => b.bind(slot, c),
    _ => true,
  }
}

/// Match one rule against one instruction, producing the capture table.
#[must_use] pub fn match_rule(pool: &CellPool, rule: &Rule, i: &Instr) -> Option<Bindings> {
  if rule.op != i.op {
    return None;
  }
  let mut b = Bindings::default();
  for (pat, cell) in rule.pats.iter().zip(i.operands()) {
    if !match_operand(pool, pat, cell, &mut b) {
      return None;
    }
  }
  Some(b)
}

/// The two rule namespaces, each a per-opcode list.
pub struct RuleSet {
  translate: Vec<Vec<Rule>>,
  emit: Vec<Vec<Rule>>,
}

impl Default for RuleSet {
  fn default() -> Self { Self::new() }
}

impl RuleSet {
  #[must_use] pub fn new() -> Self {
    RuleSet {
      translate: (0..Op::COUNT).map(|_| vec![]).collect(),
      emit: (0..Op::COUNT).map(|_| vec![]).collect(),
    }
  }

  /// Register a translation rule. Later registrations have lower
  /// priority.
  pub fn add_translate(&mut self, rule: Rule) {
    self.translate[rule.op.index()].push(rule);
  }

  /// Register an emission rule.
  pub fn add_emit(&mut self, rule: Rule) {
    self.emit[rule.op.index()].push(rule);
  }

  /// The first translation rule matching an instruction.
  #[must_use] pub fn match_translate<'a>(
    &'a self, pool: &CellPool, i: &Instr,
  ) -> Option<(&'a Rule, Bindings)> {
    self.translate[i.op.index()].iter()
      .find_map(|rule| match_rule(pool, rule, i).map(|b| (rule, b)))
  }

  /// The first emission rule matching an instruction. `Line` is special:
  /// its first registered rule is a catch-all that always matches.
  #[must_use] pub fn match_emit<'a>(
    &'a self, pool: &CellPool, i: &Instr,
  ) -> Option<(&'a Rule, Bindings)> {
    if i.op == Op::Line {
      return self.emit[Op::Line.index()].first().map(|r| (r, Bindings::default()));
    }
    self.emit[i.op.index()].iter()
      .find_map(|rule| match_rule(pool, rule, i).map(|b| (rule, b)))
  }

  /// Whether any emission rule exists for an instruction shape; used to
  /// probe whether the platform can implement a declaration.
  #[must_use] pub fn can_emit(&self, pool: &CellPool, i: &Instr) -> bool {
    self.match_emit(pool, i).is_some()
  }
}

/// The macro-argument slot a cell stands for in a rule body, if it is
/// one of the 26 argument cells.
#[must_use] pub fn rule_arg_slot(pool: &CellPool, id: CellId) -> Option<Slot> {
  pool.builtins.rule_args.iter().position(|&a| a == id)
    .map(|n| Slot::try_from(n + 1).expect("slot fits"))
}

/// Instantiate a rule-body cell: macro-argument cells are replaced by
/// their bindings, compound cells are rebuilt around the replacements.
pub fn subst_cell(pool: &mut CellPool, id: CellId, b: &Bindings) -> CellId {
  if let Some(slot) = rule_arg_slot(pool, id) {
    return b.get(slot).expect("macro slot used in rule body but never bound");
  }
  match pool[id].kind {
    Kind::Element { arr, index } => {
      let (a, i) = (subst_cell(pool, arr, b), subst_cell(pool, index, b));
      if (a, i) != (arr, index) { pool.element(a, i) } else { id }
    }
    Kind::Byte { arr, index } => {
      let (a, i) = (subst_cell(pool, arr, b), subst_cell(pool, index, b));
      if (a, i) != (arr, index) { pool.byte_cell(a, i) } else { id }
    }
    Kind::Tuple { l, r } => {
      let (nl, nr) = (subst_cell(pool, l, b), subst_cell(pool, r, b));
      if (nl, nr) != (l, r) { pool.tuple(nl, nr) } else { id }
    }
    Kind::Range { lo, hi } => {
      let (nl, nr) = (subst_cell(pool, lo, b), subst_cell(pool, hi, b));
      if (nl, nr) != (lo, hi) { pool.range_cell(nl, nr) } else { id }
    }
    Kind::Deref { var } => {
      let v = subst_cell(pool, var, b);
      if v != var { pool.deref(v) } else { id }
    }
    _ => id,
  }
}

/// Instantiate a whole rule body against a match, stamping the original
/// instruction's bookmark on the produced instructions.
pub fn instantiate(pool: &mut CellPool, rule: &Rule, matched: &Instr, b: &Bindings) -> Code {
  rule.to.iter().map(|template| {
    let mut i = Instr {
      op: template.op,
      result: template.result.map(|c| subst_cell(pool, c, b)),
      arg1: template.arg1.map(|c| subst_cell(pool, c, b)),
      arg2: template.arg2.map(|c| subst_cell(pool, c, b)),
      bookmark: matched.bookmark,
    };
    if template.op == Op::Emit {
      // Emission strings are opaque; keep them as written.
      i.arg1 = template.arg1;
    }
    i
  }).collect()
}

#[cfg(test)]
mod tests {
  use super::*;

  struct Fixture {
    pool: CellPool,
    root: CellId,
  }

  fn fixture() -> Fixture {
    let mut pool = CellPool::new();
    let root = pool.alloc(Kind::Scope);
    Fixture { pool, root }
  }

  #[test]
  fn variable_pattern_respects_types() {
    let Fixture { mut pool, root } = fixture();
    let byte = pool.builtins.t_byte;
    let word = pool.int_type(0, 40_000);
    let x = pool.new_var("x", byte, root);
    let w = pool.new_var("w", word, root);
    let rule = Rule::new(
      Op::Let,
      [OperandPat::capturing(Pat::Variable(Some(byte)), 1), OperandPat::arg(2), OperandPat::of(Pat::Any)],
      vec![],
    );
    let five = pool.int(5);
    let hit = Instr::new(Op::Let, Some(x), Some(five), None);
    let b = match_rule(&pool, &rule, &hit).expect("byte variable matches");
    assert_eq!(b.get(1), Some(x));
    assert_eq!(b.get(2), Some(five));
    let miss = Instr::new(Op::Let, Some(w), Some(five), None);
    assert!(match_rule(&pool, &rule, &miss).is_none());
  }

  #[test]
  fn slot_consistency_is_enforced() {
    let Fixture { mut pool, root } = fixture();
    let byte = pool.builtins.t_byte;
    let x = pool.new_var("x", byte, root);
    let y = pool.new_var("y", byte, root);
    // `add %A, %A, const` — result and arg1 must be the same cell.
    let rule = Rule::new(
      Op::Add,
      [OperandPat::arg(1), OperandPat::arg(1), OperandPat::of(Pat::Const)],
      vec![],
    );
    let one = pool.int(1);
    let same = Instr::new(Op::Add, Some(x), Some(x), Some(one));
    assert!(match_rule(&pool, &rule, &same).is_some());
    let different = Instr::new(Op::Add, Some(x), Some(y), Some(one));
    assert!(match_rule(&pool, &rule, &different).is_none());
  }

  #[test]
  fn element_patterns_recurse() {
    let Fixture { mut pool, root } = fixture();
    let byte = pool.builtins.t_byte;
    let dim = pool.int_type(0, 9);
    let arr_ty = pool.array_type(dim, byte);
    let arr = pool.new_var("arr", arr_ty, root);
    let i = pool.new_var("i", byte, root);
    let el = pool.element(arr, i);
    let rule = Rule::new(
      Op::Let,
      [
        OperandPat::of(Pat::Element(
          Box::new(OperandPat::arg(1)),
          Box::new(OperandPat::capturing(Pat::Variable(None), 2)),
        )),
        OperandPat::arg(3),
        OperandPat::of(Pat::Any),
      ],
      vec![],
    );
    let v = pool.int(7);
    let instr = Instr::new(Op::Let, Some(el), Some(v), None);
    let b = match_rule(&pool, &rule, &instr).expect("element matches");
    assert_eq!((b.get(1), b.get(2), b.get(3)), (Some(arr), Some(i), Some(v)));
  }

  #[test]
  fn first_match_wins() {
    let Fixture { mut pool, root } = fixture();
    let byte = pool.builtins.t_byte;
    let x = pool.new_var("x", byte, root);
    let zero = pool.int(0);
    let mut rules = RuleSet::new();
    let specific = Rule::new(
      Op::Let,
      [OperandPat::arg(1), OperandPat::of(Pat::Value(zero)), OperandPat::of(Pat::Any)],
      vec![Instr::new(Op::Debug, None, None, None)],
    );
    let general = Rule::new(
      Op::Let,
      [OperandPat::arg(1), OperandPat::arg(2), OperandPat::of(Pat::Any)],
      vec![],
    );
    rules.add_translate(specific);
    rules.add_translate(general);
    let store_zero = Instr::new(Op::Let, Some(x), Some(zero), None);
    let (rule, _) = rules.match_translate(&pool, &store_zero).expect("matches");
    assert_eq!(rule.to.len(), 1, "the earlier, more specific rule wins");
  }

  #[test]
  fn substitution_rebuilds_compound_operands() {
    let Fixture { mut pool, root } = fixture();
    let byte = pool.builtins.t_byte;
    let arr = pool.new_var("arr", byte, root);
    let i = pool.new_var("i", byte, root);
    let a1 = pool.builtins.rule_args[0];
    let a2 = pool.builtins.rule_args[1];
    let template_el = pool.element(a1, a2);
    let rule = Rule::new(
      Op::Let,
      [OperandPat::arg(1), OperandPat::arg(2), OperandPat::of(Pat::Any)],
      vec![Instr::new(Op::Let, Some(template_el), None, None)],
    );
    let mut b = Bindings::default();
    assert!(b.bind(1, arr) && b.bind(2, i));
    let matched = Instr::new(Op::Let, Some(arr), Some(i), None);
    let out = instantiate(&mut pool, &rule, &matched, &b);
    let result = out[0].result.expect("has a result");
    assert!(matches!(pool[result].kind, Kind::Element { arr: a, index: ix } if a == arr && ix == i));
  }

  #[test]
  fn register_pattern_sees_through_aliases() {
    let Fixture { mut pool, root } = fixture();
    let byte = pool.builtins.t_byte;
    let reg = pool.new_var("a", byte, root);
    pool[reg].submode |= crate::types::cell::Submode::REG;
    let alias = pool.new_var("acc", byte, root);
    pool[alias].kind = Kind::Var { adr: Some(reg), value: None };
    let rule = Rule::new(
      Op::Let,
      [OperandPat::of(Pat::Register(reg)), OperandPat::arg(1), OperandPat::of(Pat::Any)],
      vec![],
    );
    let five = pool.int(5);
    let direct = Instr::new(Op::Let, Some(reg), Some(five), None);
    let through = Instr::new(Op::Let, Some(alias), Some(five), None);
    assert!(match_rule(&pool, &rule, &direct).is_some());
    assert!(match_rule(&pool, &rule, &through).is_some());
  }
}
