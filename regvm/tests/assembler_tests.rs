mod common;

use common::*;
use vm::{AsmErrorKind, Assembler, assemble_file, assemble_with_trace, output_path};

const PROGRAM: &str = r#"
; sums its two arguments through a helper
$stacksize 64
$native %print_int
$global total 4

%add {
    mov ra, [rbp-32]
    add ra, [rbp-24]
    ret
}

%main {
    push 30
    push 12
    call %add
    pop rb
    pop rb
    mov rc, total
    mov long [rc], ra
    mov rd, ra
    push ra
    syscall %print_int, 1
    mov ra, rd
    halt
}
"#;

#[test]
fn both_passes_agree_on_every_pc() {
    let assembly = assemble_with_trace(PROGRAM).expect("assemble");
    assert_eq!(assembly.pass_one, assembly.pass_two);
    let main: Vec<usize> = assembly
        .pass_one
        .iter()
        .filter(|mark| mark.function == "main")
        .map(|mark| mark.pc)
        .collect();
    assert_eq!(main[..3], [0, 10, 20]);
    assert_eq!(assembly.pass_one[0].line, 8);
}

#[test]
fn module_tables_follow_declaration_order() {
    let module = module(PROGRAM);
    assert_eq!(module.stack_size, 64);
    let names: Vec<&str> = module.functions.iter().map(|f| f.name.as_str()).collect();
    assert_eq!(names, vec!["print_int", "add", "main"]);
    assert!(module.functions[0].is_native());
    assert_eq!(module.globals[0].name, "total");
    assert_eq!(module.globals[0].data, vec![0, 0, 0, 0]);
}

#[test]
fn assembled_program_runs_with_the_stdlib() {
    let (mut vm, output) = load_with_stdlib(PROGRAM);
    assert_eq!(vm.run(), Ok(42));
    assert_eq!(vm.global("total"), Some(&42u32.to_le_bytes()[..]));
    assert_eq!(captured_text(&output), "42\n");
}

#[test]
fn labels_resolve_relative_to_the_next_instruction() {
    let assembly = assemble_with_trace("%main {\n jmp .end\n nop\n.end:\n halt\n}").expect("asm");
    let code = assembly.module.functions[0].code();
    assert_eq!(code[0], vm::OpCode::Jmp as u8);
    assert_eq!(i64::from_le_bytes(code[2..10].try_into().expect("imm")), 1);
}

#[test]
fn labels_may_not_cross_functions() {
    let err = assemble("%a {\n.inside:\n halt\n}\n%main {\n jmp .inside\n}").expect_err("cross");
    assert_eq!(err.line, 6);
    assert_eq!(err.kind, AsmErrorKind::CrossFunctionLabel("inside".into()));

    let err = assemble("%main {\n.x:\n nop\n.x:\n halt\n}").expect_err("duplicate");
    assert_eq!(err.line, 4);
    assert!(matches!(err.kind, AsmErrorKind::Redefinition(_)));
}

#[test]
fn undeclared_native_is_reported_with_its_line() {
    let err = assemble("%main {\n push 1\n syscall %missing, 1\n halt\n}").expect_err("native");
    assert_eq!(err.line, 3);
    assert_eq!(err.kind, AsmErrorKind::UndefinedNative("missing".into()));
    assert!(err.to_string().starts_with("line 3: "));
}

#[test]
fn undefined_symbols_are_errors() {
    for (source, kind) in [
        (
            "%main {\n call %nope\n}",
            AsmErrorKind::UndefinedFunction("nope".into()),
        ),
        (
            "%main {\n jmp .nowhere\n}",
            AsmErrorKind::UndefinedLabel("nowhere".into()),
        ),
        (
            "%main {\n mov ra, counter\n}",
            AsmErrorKind::UndefinedGlobal("counter".into()),
        ),
        (
            "%main {\n frob ra\n}",
            AsmErrorKind::UnknownMnemonic("frob".into()),
        ),
        (
            "$frob\n%main {\n halt\n}",
            AsmErrorKind::UnknownDirective("frob".into()),
        ),
    ] {
        let err = assemble(source).expect_err(source);
        assert_eq!(err.kind, kind, "{source}");
    }
}

#[test]
fn structural_errors() {
    let err = assemble("halt").expect_err("outside");
    assert_eq!(err.kind, AsmErrorKind::OutsideFunction);

    let err = assemble("%main {\n halt\n").expect_err("unclosed");
    assert_eq!(err.line, 1);
    assert_eq!(err.kind, AsmErrorKind::UnclosedFunction("main".into()));

    let err = assemble("%main {\n%inner {\n}").expect_err("nested");
    assert_eq!(err.kind, AsmErrorKind::NestedFunction("inner".into()));

    let err = assemble("%main {\n}").expect_err("empty");
    assert_eq!(err.kind, AsmErrorKind::EmptyFunction("main".into()));

    let err = assemble("%main {\n halt\n}\n%main {\n halt\n}").expect_err("twice");
    assert_eq!(err.line, 4);
    assert_eq!(err.kind, AsmErrorKind::Redefinition("main".into()));

    let err = assemble("%main {\n add ra\n}").expect_err("arity");
    assert!(matches!(err.kind, AsmErrorKind::OperandCount { expected: 2, .. }));

    let err = assemble("%main {\n syscall %main\n}").expect_err("argc");
    assert!(matches!(err.kind, AsmErrorKind::Syntax(_)));
}

#[test]
fn float_literals_need_a_float_width() {
    let err = assemble("%main {\n mov byte ra, 1.5\n}").expect_err("byte float");
    assert!(err.to_string().contains("long or word"));

    let module = module("%main {\n fadd long rf, 1\n halt\n}");
    let code = module.functions[0].code();
    let imm = u64::from_le_bytes(code[4..12].try_into().expect("imm"));
    assert_eq!(imm, 1.0f32.to_bits() as u64);
}

#[test]
fn literal_forms() {
    let module = module("%main {\n mov ra, 0x10\n mov rb, 0b11\n mov rc, 010\n mov rd, 'A'\n mov re, -0x1\n halt\n}");
    let mut vm = Vm::new();
    vm.load_module(&module).expect("load");
    vm.run().expect("run");
    assert_eq!(vm.register(Register::Ra).as_i64(), 16);
    assert_eq!(vm.register(Register::Rb).as_i64(), 3);
    assert_eq!(vm.register(Register::Rc).as_i64(), 8);
    assert_eq!(vm.register(Register::Rd).as_i64(), 65);
    assert_eq!(vm.register(Register::Re).as_i64(), -1);
}

#[test]
fn safemode_and_debugmode_set_module_flags() {
    let module = module("$safemode\n$debugmode\n%main {\n halt\n}");
    assert!(module.safe_mode());
    assert!(module.debug_mode());
    let module = Assembler::new()
        .run("%main {\n halt\n}")
        .expect("assemble")
        .module;
    assert_eq!(module.flags, 0);
    assert_eq!(module.stack_size, 128);
}

#[test]
fn assemble_file_writes_next_to_the_source() {
    let source = temp_path("prog", "asm");
    std::fs::write(&source, "%main {\n mov ra, 5\n halt\n}\n").expect("write source");
    let output = assemble_file(&source).expect("assemble file");
    assert_eq!(output, output_path(&source));
    assert_eq!(output.extension().and_then(|ext| ext.to_str()), Some("rbc"));

    let mut vm = Vm::new();
    vm.load_file(&output).expect("load");
    assert_eq!(vm.run(), Ok(5));
    let _ = std::fs::remove_file(&source);
    let _ = std::fs::remove_file(&output);
}

#[test]
fn failed_assembly_writes_nothing() {
    let source = temp_path("broken", "asm");
    std::fs::write(&source, "%main {\n syscall %nope, 0\n}\n").expect("write source");
    let err = assemble_file(&source).expect_err("undeclared native");
    assert_eq!(err.line, 2);
    assert!(!output_path(&source).exists());
    let _ = std::fs::remove_file(&source);

    let missing = temp_path("missing", "asm");
    let err = assemble_file(&missing).expect_err("missing");
    assert_eq!(err.line, 0);
    assert!(matches!(err.kind, AsmErrorKind::Io(_)));
}

#[test]
fn assemble_file_refuses_to_overwrite_a_module() {
    let source = temp_path("already", "rbc");
    let err = assemble_file(&source).expect_err("same path");
    assert!(matches!(err.kind, AsmErrorKind::Io(_)));
}

#[test]
fn oversized_globals_fail_with_a_line_number() {
    let err = assemble("%main {\n halt\n}\n$global big 0xFFFFFFFFFFFFFFF 0").expect_err("huge global");
    assert_eq!(err.line, 4);
    assert!(matches!(err.kind, AsmErrorKind::InvalidOperand(_)));
    assert!(err.to_string().contains("data segment limit"), "{err}");

    let err = assemble("$global sized -1\n%main {\n halt\n}").expect_err("negative size");
    assert_eq!(err.line, 1);
    assert!(matches!(err.kind, AsmErrorKind::InvalidOperand(_)));
}
