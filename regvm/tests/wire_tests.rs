mod common;

use common::*;
use vm::wire::{FLAG_SAFE_MODE, MAGIC, VERSION};
use vm::{
    FunctionEntry, GlobalEntry, ValidationError, WireError, decode_module, disassemble_module,
    encode_module, validate_module,
};

fn sample() -> Module {
    module(
        r#"
        $stacksize 256
        $safemode
        $native %puts
        $global greeting 8 "hi"
        %main {
            push greeting
            syscall %puts, 1
            halt
        }
        "#,
    )
}

#[test]
fn encoded_module_decodes_to_the_same_tables() {
    let module = sample();
    let bytes = encode_module(&module).expect("encode");
    assert_eq!(&bytes[..4], &MAGIC);
    assert_eq!(u16::from_le_bytes([bytes[4], bytes[5]]), VERSION);
    assert_eq!(u32::from_le_bytes([bytes[6], bytes[7], bytes[8], bytes[9]]), 256);
    assert_eq!(bytes[10], FLAG_SAFE_MODE);

    let decoded = decode_module(&bytes).expect("decode");
    assert_eq!(decoded, module);
    assert!(decoded.safe_mode());
    assert!(!decoded.debug_mode());
}

#[test]
fn header_errors_are_reported() {
    let bytes = encode_module(&sample()).expect("encode");

    let mut bad_magic = bytes.clone();
    bad_magic[0] = b'X';
    assert!(matches!(
        decode_module(&bad_magic),
        Err(WireError::InvalidMagic(_))
    ));

    let mut bad_version = bytes.clone();
    bad_version[4] = 9;
    assert_eq!(
        decode_module(&bad_version),
        Err(WireError::UnsupportedVersion(9))
    );

    let mut bad_flags = bytes.clone();
    bad_flags[10] = 0x80;
    assert_eq!(
        decode_module(&bad_flags),
        Err(WireError::UnsupportedFlags(0x80))
    );

    assert_eq!(
        decode_module(&bytes[..bytes.len() - 1]),
        Err(WireError::UnexpectedEof)
    );

    let mut trailing = bytes;
    trailing.push(0);
    assert_eq!(decode_module(&trailing), Err(WireError::TrailingBytes));
}

#[test]
fn table_entries_are_checked() {
    let mut module = Module::new(64);
    module.functions.push(FunctionEntry::script("main", vec![0x00]));
    module.functions.push(FunctionEntry::script("main", vec![0x00]));
    let bytes = encode_module(&module).expect("encode");
    assert_eq!(
        decode_module(&bytes),
        Err(WireError::DuplicateName("main".to_string()))
    );

    let mut module = Module::new(64);
    module.globals.push(GlobalEntry {
        name: "g".to_string(),
        data: vec![1],
    });
    module.globals.push(GlobalEntry {
        name: "g".to_string(),
        data: vec![2],
    });
    let bytes = encode_module(&module).expect("encode");
    assert!(matches!(
        decode_module(&bytes),
        Err(WireError::DuplicateName(_))
    ));
}

#[test]
fn function_indices_never_overlap() {
    let module = module(
        r#"
        $native %alpha
        %main {
            halt
        }
        $native %beta
        %helper {
            ret
        }
        "#,
    );
    let indices: Vec<i64> = ["alpha", "main", "beta", "helper"]
        .iter()
        .map(|name| module.function_index(name).expect("index"))
        .collect();
    assert_eq!(indices, vec![-1, 2, -3, 4]);
    assert_eq!(module.function_index("gamma"), None);
}

#[test]
fn validation_accepts_assembled_code() {
    validate_module(&sample()).expect("valid");
    validate_module(&module(
        "%main {\n.top:\n inc ra\n lt ra, 3\n jz .top\n call %f\n halt\n}\n%f {\n ret\n}",
    ))
    .expect("valid");
}

#[test]
fn validation_rejects_bad_bodies() {
    let mut module = Module::new(64);
    module.functions.push(FunctionEntry::script("main", vec![0x00, 0xEE]));
    assert_eq!(
        validate_module(&module),
        Err(ValidationError::InvalidOpcode {
            function: "main".to_string(),
            offset: 1,
            opcode: 0xEE,
        })
    );

    // `push` with a truncated immediate payload.
    let mut module = Module::new(64);
    module
        .functions
        .push(FunctionEntry::script("main", vec![0x02, 0x81, 0x01]));
    assert!(matches!(
        validate_module(&module),
        Err(ValidationError::MalformedOperand { offset: 0, .. })
    ));

    // `call` to table position 5 in a one-entry table.
    let mut code = vec![0x28, 0x81];
    code.extend_from_slice(&6i64.to_le_bytes());
    let mut module = Module::new(64);
    module.functions.push(FunctionEntry::script("main", code));
    assert_eq!(
        validate_module(&module),
        Err(ValidationError::InvalidCall {
            function: "main".to_string(),
            offset: 0,
            index: 6,
        })
    );

    // `jmp` into the middle of its own encoding.
    let mut code = vec![0x25, 0x81];
    code.extend_from_slice(&(-3i64).to_le_bytes());
    let mut module = Module::new(64);
    module.functions.push(FunctionEntry::script("main", code));
    assert!(matches!(
        validate_module(&module),
        Err(ValidationError::InvalidJumpTarget { target: 7, .. })
    ));
}

#[test]
fn load_bytes_matches_load_module() {
    let bytes = encode_module(&module("%main {\n mov ra, 11\n halt\n}")).expect("encode");
    let mut vm = Vm::new();
    vm.load_bytes(&bytes).expect("load");
    assert_eq!(vm.run(), Ok(11));

    let path = temp_path("load", "rbc");
    std::fs::write(&path, &bytes).expect("write module");
    let mut vm = Vm::new();
    vm.load_file(&path).expect("load file");
    assert_eq!(vm.run(), Ok(11));
    let _ = std::fs::remove_file(&path);
}

#[test]
fn disassembly_lists_tables_and_instructions() {
    let text = disassemble_module(&sample());
    assert!(text.starts_with("module stack=256 flags=0x01 functions=2 globals=1"));
    assert!(text.contains("$native %puts ; index -1"));
    assert!(text.contains("%main { ; index 2"));
    assert!(text.contains("$global greeting 8"));
    assert!(text.contains("syscall"));
}
