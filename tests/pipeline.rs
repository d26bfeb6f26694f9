//! End-to-end pipeline scenarios, driven through the builder API the
//! surface parser uses, against a miniature 6502-flavoured rule set
//! standing in for a platform module.

use atalan::rules::{OperandPat, Pat, Rule};
use atalan::types::cell::{CellId, Submode};
use atalan::types::ir::{Instr, Op};
use atalan::{Compiler, Options};

fn emit_rule(c: &mut Compiler, op: Op, pats: [OperandPat; 3], fmts: &[&str]) {
  let to = fmts.iter()
    .map(|fmt| {
      let text = c.pool.text(fmt);
      Instr::new(Op::Emit, None, Some(text), None)
    })
    .collect();
  c.rules.add_emit(Rule::new(op, pats, to));
}

fn any3() -> [OperandPat; 3] {
  [OperandPat::of(Pat::Any), OperandPat::of(Pat::Any), OperandPat::of(Pat::Any)]
}

/// The smallest platform that can carry the scenarios: distinct byte and
/// word stores, arithmetic, branches, and the structural directives
/// every compile emits.
fn install_platform(c: &mut Compiler) -> CellId {
  let byte = c.pool.builtins.t_byte;
  let word = c.pool.int_type(0, 65_535);

  emit_rule(
    c,
    Op::Let,
    [
      OperandPat::capturing(Pat::Variable(Some(byte)), 1),
      OperandPat::arg(2),
      OperandPat::of(Pat::Any),
    ],
    &["\tlda #%B", "\tsta.b %A"],
  );
  emit_rule(
    c,
    Op::Let,
    [
      OperandPat::capturing(Pat::Variable(Some(word)), 1),
      OperandPat::arg(2),
      OperandPat::of(Pat::Any),
    ],
    &["\tlda #%B", "\tsta.w %A"],
  );
  emit_rule(c, Op::Add, any3(), &["\tadd %0, %1, %2"]);
  emit_rule(c, Op::Mul, any3(), &["\tmul %0, %1, %2"]);
  emit_rule(c, Op::Goto, any3(), &["\tjmp %0"]);
  emit_rule(c, Op::IfGt, any3(), &["\tbgt %0, %1, %2"]);
  emit_rule(c, Op::IfNoverflow, any3(), &["\tbvc %0"]);
  emit_rule(c, Op::IfOverflow, any3(), &["\tbvs %0"]);
  emit_rule(c, Op::Call, any3(), &["\tjsr %0"]);
  emit_rule(c, Op::Label, any3(), &["%0:"]);
  emit_rule(c, Op::VarDef, any3(), &["%0 = %1"]);
  emit_rule(c, Op::Proc, any3(), &["%0 .proc"]);
  emit_rule(c, Op::EndProc, any3(), &["\t.endp"]);
  emit_rule(c, Op::Prologue, any3(), &["\t.prologue"]);
  emit_rule(c, Op::Epilogue, any3(), &["\t.epilogue"]);
  emit_rule(c, Op::CodeEnd, any3(), &["\t.end"]);
  emit_rule(c, Op::Alloc, any3(), &["%0 .ds %1"]);
  emit_rule(c, Op::Align, any3(), &["\t.align %1"]);
  emit_rule(c, Op::Org, any3(), &["\t.org %1"]);
  emit_rule(c, Op::Line, any3(), &["; %1: %2"]);

  let vh_ty = c.pool.int_type(0x80, 0xff);
  let vh = c.new_var("varheap", vh_ty);
  c.init_var_heap();
  let _ = vh;
  word
}

fn compile_to_string(c: &mut Compiler) -> String {
  let mut out = Vec::new();
  c.compile(&mut out).expect("compile succeeds");
  String::from_utf8(out).expect("asm is utf-8")
}

#[test]
fn s1_constant_expressions_fold_to_a_single_store() {
  let mut c = Compiler::new(Options::default());
  install_platform(&mut c);
  let byte = c.pool.builtins.t_byte;
  let x = c.new_var("x", byte);
  c.pool[x].submode |= Submode::OUT;

  // x = 2 + 3 * 4
  let two = c.pool.int(2);
  let three = c.pool.int(3);
  let four = c.pool.int(4);
  let product = c.expr_binary(Op::Mul, three, four);
  let sum = c.expr_binary(Op::Add, two, product);
  c.cursor.op(Op::Let, Some(x), Some(sum), None);
  c.finish_root();

  let code = c.pool[c.root].code.clone().expect("root body");
  assert!(
    code.iter().all(|i| !matches!(i.op, Op::Add | Op::Mul)),
    "no arithmetic survives constant folding"
  );
  assert_eq!(code.len(), 1);
  assert_eq!(code[0].op, Op::Let);
  assert_eq!(c.pool.int_value(code[0].arg1.expect("value")), Some(&14.into()));

  let asm = compile_to_string(&mut c);
  assert!(asm.contains("lda #14"), "emits the folded constant: {asm}");
  assert!(!asm.contains("add") && !asm.contains("mul"));
}

#[test]
fn s2_narrow_ranges_take_the_byte_store_rule() {
  let mut c = Compiler::new(Options::default());
  install_platform(&mut c);
  let digit = c.pool.int_type(0, 9);
  let i = c.new_var("i", digit);
  c.pool[i].submode |= Submode::OUT;
  assert_eq!(c.pool.type_size(digit), 1);

  let five = c.pool.int(5);
  c.cursor.op(Op::Let, Some(i), Some(five), None);
  c.finish_root();
  let asm = compile_to_string(&mut c);
  assert!(asm.contains("sta.b i"), "the 1-byte store rule wins: {asm}");
  assert!(!asm.contains("sta.w"));
}

#[test]
fn s2_wide_ranges_take_the_word_store_rule() {
  let mut c = Compiler::new(Options::default());
  install_platform(&mut c);
  let counter = c.pool.int_type(0, 1000);
  let n = c.new_var("n", counter);
  c.pool[n].submode |= Submode::OUT;
  assert_eq!(c.pool.type_size(counter), 2);

  let v = c.pool.int(500);
  c.cursor.op(Op::Let, Some(n), Some(v), None);
  c.finish_root();
  let asm = compile_to_string(&mut c);
  assert!(asm.contains("sta.w n"), "the 2-byte store rule wins: {asm}");
}

#[test]
fn s3_constant_step_one_loops_have_no_overflow_check() {
  let mut c = Compiler::new(Options::default());
  let byte = c.pool.builtins.t_byte;
  let i = c.new_var("i", byte);
  let zero = c.pool.int(0);
  let nine = c.pool.int(9);
  c.cursor.begin();
  let body = c.cursor.end();
  c.gen_for_range(i, zero, nine, None, body);
  c.finish_root();

  let code = c.pool[c.root].code.clone().expect("root body");
  let ops: Vec<Op> = code.iter().map(|x| x.op).collect();
  assert_eq!(ops, vec![Op::Let, Op::Label, Op::Add, Op::IfGt]);
  // let i,0
  assert_eq!(code[0].result, Some(i));
  assert_eq!(code[0].arg1, Some(zero));
  // add i,i,1
  assert_eq!(code[2].result, Some(i));
  assert_eq!(c.pool.int_value(code[2].arg2.expect("step")), Some(&1.into()));
  // ifgt body, 9, i — branching back, no overflow test
  assert_eq!(code[3].arg1, Some(nine));
  assert_eq!(code[3].arg2, Some(i));
  assert_eq!(code[3].result, code[1].result, "the branch targets the body label");
}

#[test]
fn s3_byte_boundary_limits_use_the_overflow_flag() {
  let mut c = Compiler::new(Options::default());
  let byte = c.pool.builtins.t_byte;
  let i = c.new_var("i", byte);
  let zero = c.pool.int(0);
  let limit = c.pool.int(255);
  let step = c.pool.int(256);
  c.cursor.begin();
  let body = c.cursor.end();
  c.gen_for_range(i, zero, limit, Some(step), body);
  c.finish_root();
  let ops: Vec<Op> = c.pool[c.root].code.clone().expect("root body")
    .iter().map(|x| x.op).collect();
  assert_eq!(ops, vec![Op::Let, Op::Label, Op::Add, Op::IfNoverflow]);
}

#[test]
fn procedures_emit_wrapped_and_called() {
  let mut c = Compiler::new(Options::default());
  install_platform(&mut c);
  let byte = c.pool.builtins.t_byte;
  let flash = c.new_proc("flash");
  let prev = c.begin_proc(flash);
  let border = c.new_var("border", byte);
  c.pool[border].submode |= Submode::OUT;
  let one = c.pool.int(1);
  c.cursor.op(Op::Let, Some(border), Some(one), None);
  c.end_proc(flash, prev);

  c.cursor.op(Op::Call, Some(flash), None, None);
  c.finish_root();
  let asm = compile_to_string(&mut c);
  assert!(asm.contains("jsr flash"), "{asm}");
  assert!(asm.contains("flash .proc"));
  assert!(asm.contains(".endp"));
  assert!(asm.contains(".end"));
  // The OUT store inside the procedure survived optimization.
  assert!(asm.contains("sta.b flash__border"));
}

#[test]
fn allocator_places_variables_and_defines_symbols() {
  let mut c = Compiler::new(Options::default());
  install_platform(&mut c);
  let byte = c.pool.builtins.t_byte;
  let x = c.new_var("x", byte);
  c.pool[x].submode |= Submode::OUT;
  let one = c.pool.int(1);
  c.cursor.op(Op::Let, Some(x), Some(one), None);
  c.finish_root();
  let asm = compile_to_string(&mut c);
  // First free byte of the 0x80..0xff variable heap.
  assert!(asm.contains("x = 128"), "{asm}");
}

#[test]
fn rule_application_is_deterministic() {
  let build = || {
    let mut c = Compiler::new(Options::default());
    install_platform(&mut c);
    let byte = c.pool.builtins.t_byte;
    let x = c.new_var("x", byte);
    c.pool[x].submode |= Submode::OUT;
    let i = c.new_var("i", byte);
    let zero = c.pool.int(0);
    let nine = c.pool.int(9);
    c.cursor.begin();
    c.cursor.op(Op::Let, Some(x), Some(i), None);
    let body = c.cursor.end();
    c.gen_for_range(i, zero, nine, None, body);
    c.finish_root();
    compile_to_string(&mut c)
  };
  let first = build();
  let second = build();
  assert!(!first.is_empty());
  assert_eq!(first, second, "identical input and rules give identical output");
}

#[test]
fn unknown_labels_fail_the_compile() {
  let mut c = Compiler::new(Options::default());
  install_platform(&mut c);
  let other = c.new_proc("other");
  let prev = c.begin_proc(other);
  let nowhere = c.pool.new_label("nowhere", other);
  c.cursor.label(nowhere);
  c.end_proc(other, prev);

  let jumper = c.new_proc("jumper");
  let prev = c.begin_proc(jumper);
  c.cursor.goto(nowhere);
  c.end_proc(jumper, prev);

  c.cursor.op(Op::Call, Some(other), None, None);
  c.cursor.op(Op::Call, Some(jumper), None, None);
  c.finish_root();

  let mut out = Vec::new();
  let err = c.compile(&mut out).expect_err("cross-procedure jump");
  assert!(matches!(err, atalan::CompileError::Failed { .. }));
  assert!(c.reporter.diags().iter().any(|d| {
    d.message.contains("Label [nowhere] is defined in other procedure")
  }));
}

#[test]
fn dead_procedures_are_not_emitted() {
  let mut c = Compiler::new(Options::default());
  install_platform(&mut c);
  let unused = c.new_proc("unused");
  let prev = c.begin_proc(unused);
  c.end_proc(unused, prev);
  c.finish_root();
  let asm = compile_to_string(&mut c);
  assert!(!asm.contains("unused .proc"));
}

#[test]
fn translation_rules_lower_before_emission() {
  let mut c = Compiler::new(Options::default());
  install_platform(&mut c);
  let byte = c.pool.builtins.t_byte;
  // The platform cannot multiply; a translation rule lowers `mul x, x, 2`
  // into an add of the value to itself.
  let a1 = c.pool.builtins.rule_args[0];
  let a2 = c.pool.builtins.rule_args[1];
  let two = c.pool.int(2);
  c.rules.add_translate(Rule::new(
    Op::Mul,
    [
      OperandPat::arg(1),
      OperandPat::arg(2),
      OperandPat::of(Pat::Value(two)),
    ],
    vec![Instr::new(Op::Add, Some(a1), Some(a2), Some(a2))],
  ));
  let x = c.new_var("x", byte);
  c.pool[x].submode |= Submode::OUT;
  c.cursor.op(Op::Mul, Some(x), Some(x), Some(two));
  c.finish_root();
  let asm = compile_to_string(&mut c);
  assert!(asm.contains("add x, x, x"), "{asm}");
  assert!(!asm.contains("mul"));
}

#[test]
fn interrupt_handlers_and_mainline_never_share_addresses() {
  let mut c = Compiler::new(Options::default());
  install_platform(&mut c);
  let byte = c.pool.builtins.t_byte;

  let interrupt = c.pool.interrupt.expect("interrupt base exists");
  let handler_ty = c.pool.derive_type(interrupt);
  let on_vbi = c.new_var("on_vbi", handler_ty);
  let prev = c.begin_proc(on_vbi);
  let t = c.new_var("t", byte);
  c.pool[t].submode |= Submode::OUT;
  let one = c.pool.int(1);
  c.cursor.op(Op::Let, Some(t), Some(one), None);
  c.end_proc(on_vbi, prev);
  // The handler is wired to the vector, not called from main.
  c.pool[on_vbi].read = 1;

  let main_proc = c.new_proc("main");
  let prev = c.begin_proc(main_proc);
  let x = c.new_var("x", byte);
  let y = c.new_var("y", byte);
  for v in [x, y] {
    c.pool[v].submode |= Submode::OUT;
  }
  c.cursor.op(Op::Let, Some(x), Some(one), None);
  c.cursor.op(Op::Let, Some(y), Some(x), None);
  c.end_proc(main_proc, prev);

  c.cursor.op(Op::Call, Some(main_proc), None, None);
  c.cursor.op(Op::Call, Some(on_vbi), None, None);
  c.finish_root();
  let _ = compile_to_string(&mut c);

  assert!(c.pool[on_vbi].flags.contains(atalan::types::cell::Flags::PROC_INTERRUPT));
  let adr_of = |c: &Compiler, v: CellId| match c.pool[v].kind {
    atalan::types::cell::Kind::Var { adr: Some(a), .. } => {
      c.pool.int_value(a).expect("placed").clone()
    }
    _ => panic!("variable was not placed"),
  };
  let t_adr = adr_of(&c, t);
  assert_ne!(t_adr, adr_of(&c, x));
  assert_ne!(t_adr, adr_of(&c, y));
}

#[test]
fn asm_output_lands_in_the_project_directory() {
  use std::io::Write as _;

  let dir = tempfile::tempdir().expect("tempdir");
  let mut c = Compiler::new(Options {
    project_dir: dir.path().to_path_buf(),
    ..Options::default()
  });
  install_platform(&mut c);
  c.register_module("game", true);
  c.register_module("sprites", false);
  // A sibling .asm next to an included module gets pulled in.
  std::fs::write(dir.path().join("sprites.asm"), "; hand-written\n").expect("write");
  emit_rule(&mut c, Op::Include, any3(), &["\ticl '%0'"]);
  c.finish_root();

  let out_path = dir.path().join("game.asm");
  let mut out = std::fs::File::create(&out_path).expect("create");
  c.compile(&mut out).expect("compile succeeds");
  out.flush().expect("flush");
  let asm = std::fs::read_to_string(&out_path).expect("read back");
  assert!(asm.contains("icl"), "{asm}");
  assert!(asm.contains("sprites.asm"));
}
