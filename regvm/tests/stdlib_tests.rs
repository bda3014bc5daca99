mod common;

use common::*;
use vm::StdNative;

#[test]
fn console_natives_write_to_captured_output() {
    let (mut vm, output) = load_with_stdlib(
        r#"
        $native %puts
        $native %putchar
        $native %print_int
        $native %print_float
        $global msg 16 "hello"
        %main {
            push msg
            syscall %puts, 1
            push 'x'
            syscall %putchar, 1
            push 10
            syscall %putchar, 1
            push -12
            syscall %print_int, 1
            push 2.5
            syscall %print_float, 1
            halt
        }
        "#,
    );
    assert_eq!(vm.run(), Ok(0));
    assert_eq!(captured_text(&output), "hello\nx\n-12\n2.5\n");
}

#[test]
fn printf_formats_each_conversion() {
    let (mut vm, output) = load_with_stdlib(
        r#"
        $native %printf
        $global fmt 48 "%s=%d %u %x %c %f 100%%\n"
        $global name 8 "n"
        %main {
            push fmt
            push name
            push -5
            push 7
            push 255
            push 'z'
            push 0.5
            syscall %printf, 7
            halt
        }
        "#,
    );
    let written = vm.run().expect("run");
    let text = captured_text(&output);
    assert_eq!(text, "n=-5 7 ff z 0.500000 100%\n");
    assert_eq!(written as usize, text.len());
}

#[test]
fn printf_without_enough_arguments_faults() {
    let (mut vm, output) = load_with_stdlib(
        "$native %printf\n$global fmt 8 \"%d\"\n%main {\n push fmt\n syscall %printf, 1\n halt\n}",
    );
    assert!(matches!(vm.run(), Err(VmError::Native(message)) if message.contains("%d")));
    assert_eq!(vm.fault_code(), -9);
    assert!(captured_text(&output).is_empty());
}

#[test]
fn arity_is_checked_before_dispatch() {
    let (mut vm, _) = load_with_stdlib("$native %strlen\n%main {\n call %strlen\n halt\n}");
    assert!(matches!(
        vm.run(),
        Err(VmError::Native(message)) if message.contains("strlen expects 1")
    ));
}

#[test]
fn string_and_memory_natives() {
    let (mut vm, _) = load_with_stdlib(
        r#"
        $native %strlen
        $native %strcmp
        $native %strcpy
        $native %memset
        $native %memcpy
        $global a 8 "abc"
        $global b 8 "abd"
        $global buf 8
        %main {
            push a
            syscall %strlen, 1
            mov rb, ra
            push a
            push b
            syscall %strcmp, 2
            mov rc, ra
            push buf
            push b
            syscall %strcpy, 2
            push buf
            push 'q'
            push 2
            syscall %memset, 3
            push a
            push buf
            push 1
            syscall %memcpy, 3
            mov ra, rb
            halt
        }
        "#,
    );
    assert_eq!(vm.run(), Ok(3));
    assert_eq!(vm.register(Register::Rc).as_i64(), -1);
    assert_eq!(vm.global("buf"), Some(&b"qqd\0\0\0\0\0"[..]));
    assert_eq!(vm.global("a"), Some(&b"qbc\0\0\0\0\0"[..]));
}

#[test]
fn file_round_trip_through_handles() {
    let path = temp_path("file", "txt");
    let path_text = path.display().to_string();
    let source = format!(
        r#"
        $native %fopen
        $native %fputs
        $native %fputc
        $native %fclose
        $native %fgetc
        $native %fread
        $native %feof
        $global path 256 "{path_text}"
        $global write 4 "w"
        $global read 4 "r"
        $global text 8 "data"
        $global buf 16
        %main {{
            push path
            push write
            syscall %fopen, 2
            mov rb, ra
            push text
            push rb
            syscall %fputs, 2
            push '!'
            push rb
            syscall %fputc, 2
            push rb
            syscall %fclose, 1
            push path
            push read
            syscall %fopen, 2
            mov rb, ra
            push rb
            syscall %fgetc, 1
            mov rc, ra
            push buf
            push 16
            push rb
            syscall %fread, 3
            mov rd, ra
            push rb
            syscall %feof, 1
            mov re, ra
            push rb
            syscall %fclose, 1
            mov ra, rb
            halt
        }}
        "#
    );
    let (mut vm, _) = load_with_stdlib(&source);
    assert_eq!(vm.run(), Ok(4));
    assert_eq!(vm.register(Register::Rc).as_u64(), u64::from(b'd'));
    assert_eq!(vm.register(Register::Rd).as_u64(), 4);
    assert_eq!(vm.register(Register::Re).as_u64(), 1);
    assert_eq!(&vm.global("buf").expect("buf")[..4], b"ata!");
    assert_eq!(std::fs::read_to_string(&path).expect("file"), "data!");
    let _ = std::fs::remove_file(&path);
}

#[test]
fn failed_fopen_returns_a_null_handle() {
    let missing = temp_path("absent", "txt");
    let source = format!(
        "$native %fopen\n$global path 256 \"{}\"\n$global mode 4 \"r\"\n%main {{\n push path\n push mode\n syscall %fopen, 2\n halt\n}}",
        missing.display()
    );
    let (mut vm, _) = load_with_stdlib(&source);
    assert_eq!(vm.run(), Ok(0));
}

#[test]
fn closed_handles_fault_on_use() {
    let (mut vm, _) = load_with_stdlib("$native %fgetc\n%main {\n push 99\n syscall %fgetc, 1\n halt\n}");
    assert!(matches!(vm.run(), Err(VmError::Native(message)) if message.contains("99")));
}

#[test]
fn argc_and_argv_expose_host_arguments() {
    let (mut vm, _) = load_with_stdlib(
        r#"
        $native %argc
        $native %argv
        $global buf 4
        %main {
            call %argc
            mov rb, ra
            push 1
            push buf
            push 4
            syscall %argv, 3
            mov rc, ra
            push 5
            push buf
            push 4
            syscall %argv, 3
            mov rd, ra
            mov ra, rb
            halt
        }
        "#,
    );
    vm.set_args(["prog", "second"]);
    assert_eq!(vm.run(), Ok(2));
    assert_eq!(vm.register(Register::Rc).as_u64(), 6);
    assert_eq!(vm.register(Register::Rd).as_i64(), -1);
    assert_eq!(vm.global("buf"), Some(&b"sec\0"[..]));
}

#[test]
fn every_standard_native_is_registered() {
    let (vm, _) = load_with_stdlib("%main {\n halt\n}");
    let names: Vec<&str> = vm.natives().names().collect();
    for native in StdNative::ALL {
        assert!(names.contains(&native.name()), "{}", native.name());
    }
}

#[test]
fn fread_length_is_bounded_by_the_arena() {
    let (mut vm, _) = load_with_stdlib(
        "$native %fread\n%main {\n push 0\n push 0xFFFFFFFFFFFFFFF\n push 3\n syscall %fread, 3\n halt\n}",
    );
    assert!(matches!(
        vm.run(),
        Err(VmError::OutOfBoundsAccess { address: 0, .. })
    ));
    assert_eq!(vm.fault_code(), -2);
}

#[test]
fn fclose_reports_unknown_handles() {
    let path = temp_path("close", "txt");
    let source = format!(
        "$native %fopen\n$native %fclose\n$global path 256 \"{}\"\n$global mode 4 \"w\"\n%main {{\n push path\n push mode\n syscall %fopen, 2\n mov rb, ra\n push rb\n syscall %fclose, 1\n mov rc, ra\n push rb\n syscall %fclose, 1\n halt\n}}",
        path.display()
    );
    let (mut vm, _) = load_with_stdlib(&source);
    assert_eq!(vm.run(), Ok(-1));
    assert_eq!(vm.register(Register::Rb).as_u64(), 3);
    assert_eq!(vm.register(Register::Rc).as_u64(), 0);
    let _ = std::fs::remove_file(&path);
}
