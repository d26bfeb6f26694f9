//! The translation pass from abstract IR to target-legal IR.
//!
//! Abstract instructions are rewritten by repeated application of the
//! platform's translation rules: when a rule matches, the instruction is
//! replaced by the rule's substitution and the substituted instructions
//! are themselves reconsidered, so rules compose. An instruction no rule
//! matches is already target-legal and passes through. Translation is
//! deliberately non-confluent; rule order expresses priority.
//!
//! The pass also establishes the register-argument spill protocol, which
//! keeps register pressure at procedure boundaries localized so later
//! passes may freely rewrite register contents.

use std::collections::VecDeque;

use crate::rules::{RuleSet, instantiate};
use crate::types::cell::{CellId, CellPool, Kind, Submode};
use crate::types::ir::{Code, Instr, Op, code_replace_cell};

/// Rewrites allowed per instruction site before translation is declared
/// divergent. A well-formed rule database never gets close.
const TRANSLATE_FUEL: u32 = 100;

/// Translate one procedure body in place. Does nothing for bodiless
/// procedures (external declarations).
pub fn translate_proc(pool: &mut CellPool, rules: &RuleSet, proc: CellId) {
  let Some(mut code) = pool[proc].code.take() else { return };
  insert_register_argument_spills(pool, proc, &mut code);
  expand_call_sites(pool, &mut code, proc);
  let code = apply_rules(pool, rules, code);
  pool[proc].code = Some(code);
}

fn apply_rules(pool: &mut CellPool, rules: &RuleSet, code: Code) -> Code {
  let mut queue: VecDeque<(Instr, u32)> = code.into_iter().map(|i| (i, 0)).collect();
  let mut out = Vec::with_capacity(queue.len());
  while let Some((i, fuel)) = queue.pop_front() {
    if i.op == Op::Line {
      out.push(i);
      continue;
    }
    match rules.match_translate(pool, &i) {
      Some((rule, b)) => {
        assert!(fuel < TRANSLATE_FUEL, "translation rules do not terminate");
        let rule = rule.clone();
        let sub = instantiate(pool, &rule, &i, &b);
        for s in sub.into_iter().rev() {
          queue.push_front((s, fuel + 1));
        }
      }
      None => out.push(i),
    }
  }
  out
}

/// Entry/exit half of the spill protocol.
///
/// On entry, every input argument bound to a physical register is copied
/// into a fresh local and all uses within the body are redirected to the
/// local. On exit, every register output argument is reloaded from its
/// local. The optimizer removes spills that turn out to be unnecessary.
fn insert_register_argument_spills(pool: &mut CellPool, proc: CellId, code: &mut Code) {
  for submode in [Submode::ARG_IN, Submode::ARG_OUT] {
    for arg in pool.proc_args(proc, submode) {
      if !pool.is_reg(arg) {
        continue;
      }
      let ty = pool[arg].ty.expect("arguments are typed");
      let tmp = pool.new_tmp(ty, proc);
      code_replace_cell(pool, code, arg, tmp);
      if submode == Submode::ARG_IN {
        code.insert(0, Instr::new(Op::Let, Some(tmp), Some(arg), None));
      } else {
        code.push(Instr::new(Op::Let, Some(arg), Some(tmp), None));
      }
    }
  }
}

fn writes_to(pool: &CellPool, i: &Instr, cell: CellId) -> bool {
  !i.op.is_jump() && i.op != Op::Line && i.result == Some(cell)
}

/// Call-site half of the spill protocol.
///
/// Input arguments are computed into fresh temporaries and the registers
/// are loaded immediately before the `CALL`; register outputs are saved
/// into fresh temporaries immediately after it, and subsequent reads use
/// the temporary until the register is written again.
fn expand_call_sites(pool: &mut CellPool, code: &mut Code, caller: CellId) {
  let mut i = 0;
  while i < code.len() {
    if code[i].op != Op::Call {
      i += 1;
      continue;
    }
    let callee = code[i].result.expect("call has a target");

    for arg in pool.proc_args(callee, Submode::ARG_IN) {
      if !pool.is_reg(arg) {
        continue;
      }
      // Find the setup write of this argument since the last barrier and
      // redirect it through a temporary.
      let mut j = i;
      while j > 0 {
        j -= 1;
        let barrier = code[j].op == Op::Call || code[j].op == Op::Label || code[j].op.is_jump();
        if barrier {
          break;
        }
        if writes_to(pool, &code[j], arg) {
          let ty = pool[arg].ty.expect("arguments are typed");
          let tmp = pool.new_tmp(ty, caller);
          code[j].result = Some(tmp);
          for k in j + 1..i {
            let rewritten = pool.replace_cell_in_args(&code[k], arg, tmp);
            code[k] = rewritten;
          }
          code.insert(i, Instr::new(Op::Let, Some(arg), Some(tmp), None));
          i += 1;
          break;
        }
      }
    }

    for arg in pool.proc_args(callee, Submode::ARG_OUT) {
      if !pool.is_reg(arg) {
        continue;
      }
      let ty = pool[arg].ty.expect("arguments are typed");
      let tmp = pool.new_tmp(ty, caller);
      code.insert(i + 1, Instr::new(Op::Let, Some(tmp), Some(arg), None));
      let mut k = i + 2;
      while k < code.len() {
        if code[k].op == Op::Call || writes_to(pool, &code[k], arg) {
          break;
        }
        let rewritten = pool.replace_cell_in_args(&code[k], arg, tmp);
        code[k] = rewritten;
        k += 1;
      }
    }
    i += 1;
  }
}

impl CellPool {
  /// Replace a cell in the read positions of one instruction, leaving
  /// the written result slot alone.
  fn replace_cell_in_args(&mut self, i: &Instr, from: CellId, to: CellId) -> Instr {
    if i.op == Op::Line {
      return i.clone();
    }
    let mut out = i.clone();
    out.arg1 = out.arg1.map(|c| self.replace_cell(c, from, to));
    out.arg2 = out.arg2.map(|c| self.replace_cell(c, from, to));
    // Compound results (elements, tuples) read their indices.
    if let Some(r) = out.result {
      if !matches!(self[r].kind, Kind::Var { .. }) {
        out.result = Some(self.replace_cell(r, from, to));
      }
    }
    out
  }
}
