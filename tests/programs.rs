use std::fs;

use cinder::{
    ExitStatus, NativeRegistry, Program, RuntimeErrorKind, Signature, TranslationError, Value,
    Var, VarType, Vm, VmConfig, translate_source,
};

fn run(program: &Program, globals: &mut [Var]) -> (ExitStatus, String) {
    let mut vm = Vm::new(program, NativeRegistry::with_std(), VmConfig::default());
    let mut out = Vec::new();
    let status = vm.run(globals, &mut out).expect("run should succeed");
    (status, String::from_utf8(out).unwrap())
}

fn output_of(source: &str) -> String {
    let program = translate_source(source).expect("translation should succeed");
    run(&program, &mut []).1
}

#[test]
fn test_fibonacci_loop_and_recursion_agree() {
    let source = "
        function int fib(int n) {
            if (n < 2) { return n; }
            return fib(n - 1) + fib(n - 2);
        }
        int a = 0;
        int b = 1;
        for (i in 1..15) {
            int t = a + b;
            a = b;
            b = t;
        }
        print(a, ' ', fib(15), '\\n');
    ";
    assert_eq!(output_of(source), "610 610\n");
}

#[test]
fn test_nested_blocks_shadow_names() {
    let source = "
        int x = 1;
        {
            int x = 2;
            print(x);
            {
                double x = 3.5;
                print(x);
            }
        }
        print(x);
    ";
    assert_eq!(output_of(source), "23.51");
}

#[test]
fn test_mixed_numeric_promotion() {
    let source = "
        double d = 1;
        d += 2;
        int n = 7;
        print(d / 2, ' ', n / 2, ' ', n / 2.0);
    ";
    assert_eq!(output_of(source), "1.5 3 3.5");
}

#[test]
fn test_closure_mutation_is_shared() {
    let source = "
        function int make(int start) {
            int value = start;
            function void inc(int by) { value += by; }
            function int get() { return value; }
            inc(5);
            inc(-2);
            return get();
        }
        print(make(10), ' ', make(0));
    ";
    assert_eq!(output_of(source), "13 3");
}

#[test]
fn test_globals_in_and_out() {
    let program = translate_source(
        "int count;
         double scale;
         string label;
         count += 1;
         scale = scale * 2;
         label = 'done';",
    )
    .unwrap();

    let mut globals = vec![
        Var::new("count", 41i64),
        Var::new("scale", 1.25),
        Var::new("label", "start"),
        Var::new("unknown", 0i64),
    ];
    let (status, _) = run(&program, &mut globals);
    assert_eq!(status, ExitStatus::Stopped);
    assert_eq!(globals[0].value, Value::Int(42));
    assert_eq!(globals[1].value, Value::Double(2.5));
    assert_eq!(globals[2].value, Value::String("done".into()));
    assert_eq!(globals[3].value, Value::Int(0));
}

#[test]
fn test_custom_native() {
    let mut natives = NativeRegistry::new();
    natives.register(
        "join",
        Signature::new(VarType::String, vec![VarType::String, VarType::Int]),
        |args| {
            let s = args[0].as_str().unwrap_or_default();
            let n = args[1].as_int().unwrap_or_default();
            Ok(Some(Value::String(format!("{}#{}", s, n))))
        },
    );
    let program = translate_source(
        "function string join(string s, int n) native 'join';
         string r = join('item', 3);
         print(r);",
    )
    .unwrap();

    let mut vm = Vm::new(&program, natives, VmConfig::default());
    let mut out = Vec::new();
    vm.run(&mut [], &mut out).unwrap();
    assert_eq!(String::from_utf8(out).unwrap(), "item#3");
    assert_eq!(vm.stats().native_calls, 1);
}

#[test]
fn test_serialized_program_round_trip() {
    let source = "
        int total = 0;
        function void add(int v) { total += v; }
        for (i in 1..4) add(i * i);
        print('sum=', total);
    ";
    let program = translate_source(source).unwrap();

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("sum.cbc");
    fs::write(&path, program.to_bytes().unwrap()).unwrap();

    let loaded = Program::from_bytes(&fs::read(&path).unwrap()).unwrap();
    assert_eq!(loaded.disassemble(), program.disassemble());
    assert_eq!(run(&loaded, &mut []).1, "sum=30");
}

#[test]
fn test_corrupt_program_is_rejected() {
    let program = translate_source("print(1);").unwrap();
    let mut bytes = program.to_bytes().unwrap();
    bytes.truncate(bytes.len() / 2);
    assert!(Program::from_bytes(&bytes).is_err());
}

#[test]
fn test_translation_error_kinds() {
    let cases = [
        ("int x = ;", "syntax"),
        ("print(y);", "resolution"),
        ("int x = 'text';", "type"),
        ("function int f() { return; }", "type"),
        ("print('b' < 'a');", "type"),
    ];
    for (source, kind) in cases {
        let err = translate_source(source).expect_err(source);
        assert_eq!(err.kind(), kind, "{}: {}", source, err);
        assert!(err.span().is_some());
    }
}

#[test]
fn test_deep_nesting_is_a_syntax_error() {
    let source = format!("print({}1{});", "(".repeat(2000), ")".repeat(2000));
    let err = translate_source(&source).unwrap_err();
    assert_eq!(err.kind(), "syntax");
    assert!(err.message().contains("nesting too deep"));

    let within = format!("print({}1{});", "(".repeat(100), ")".repeat(100));
    assert_eq!(output_of(&within), "1");
}

#[test]
fn test_for_up_to_int_max_terminates() {
    let source = "
        int n = 0;
        for (i in 9223372036854775805..9223372036854775807) n += 1;
        print(n);
    ";
    assert_eq!(output_of(source), "3");
}

#[test]
fn test_syntax_error_position() {
    let err = translate_source("int a = 1;\nint b = 2\nprint(a);").unwrap_err();
    assert!(matches!(err, TranslationError::Syntax(_)));
    assert_eq!(err.span().map(|s| s.line), Some(3));
}

#[test]
fn test_runtime_error_reports_location() {
    let program = translate_source(
        "function int div(int a, int b) { return a / b; }
         print(div(1, 0));",
    )
    .unwrap();
    let mut vm = Vm::new(&program, NativeRegistry::with_std(), VmConfig::default());
    let err = vm.run(&mut [], &mut Vec::<u8>::new()).unwrap_err();

    assert_eq!(err.kind, RuntimeErrorKind::DivisionByZero);
    assert_eq!(err.function, "div");
    let text = err.to_string();
    assert!(text.starts_with("runtime error: division by zero at div+"));
    assert!(text.contains("call stack:"));
}

#[test]
fn test_runaway_recursion_is_bounded() {
    let program = translate_source("function void f() { f(); } f();").unwrap();
    let config = VmConfig {
        max_call_depth: 64,
        ..VmConfig::default()
    };
    let mut vm = Vm::new(&program, NativeRegistry::new(), config);
    let err = vm.run(&mut [], &mut Vec::<u8>::new()).unwrap_err();
    assert_eq!(err.kind, RuntimeErrorKind::CallDepthExceeded(64));
}
