use lapdec_lib::{DecompileMode, DecompileOptions, LapError, TreeDump, decompile, decompile_with_options};

fn normalize(s: &str) -> String {
    s.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .replace("( ", "(")
        .replace(" )", ")")
}

fn source(listing: &str) -> String {
    normalize(&decompile(listing).unwrap())
}

const IF_ELSE: &str = "\
0 varref a
1 goto-if-nil 1
2 constant 1
3 goto 2
4:1 constant 2
5:2 return
";

#[test]
fn increment_in_place() {
    let listing = "0 varref x\n1 constant 1\n2 plus\n3 varset x\n4 return\n";
    assert_eq!(source(listing), "(setq x (+ x 1))");
}

#[test]
fn two_way_branch_is_one_if() {
    assert_eq!(source(IF_ELSE), "(if a 1 2)");
}

#[test]
fn unresolved_label_names_the_jump() {
    match decompile("0 varref a\n1 goto-if-nil 9\n2 return\n") {
        Err(LapError::UnresolvedLabel { label, offset }) => {
            assert_eq!(label, "9");
            assert_eq!(offset, 1);
        }
        other => panic!("expected an unresolved label, got {other:?}"),
    }
}

#[test]
fn three_argument_call() {
    let listing = "0 constant foo\n1 varref a\n2 varref b\n3 varref c\n4 call 3\n5 return\n";
    assert_eq!(source(listing), "(foo a b c)");
}

#[test]
fn nested_max_is_flattened() {
    let listing = "0 varref a\n1 varref b\n2 varref c\n3 max\n4 max\n5 return\n";
    assert_eq!(source(listing), "(max a b c)");
}

#[test]
fn cond_with_tail_returns() {
    let listing = "\
0 varref a
1 goto-if-nil 1
2 constant 1
3 return
4:1 varref b
5 goto-if-nil 2
6 constant 2
7 return
8:2 constant 3
9 return
";
    assert_eq!(source(listing), "(cond (a 1) (b 2) (t 3))");
}

#[test]
fn while_loop() {
    let listing = "\
0:1 varref i
1 constant 10
2 lss
3 goto-if-nil-else-pop 2
4 varref i
5 add1
6 varset i
7 goto 1
8:2 return
";
    assert_eq!(source(listing), "(while (< i 10) (setq i (1+ i)))");
}

#[test]
fn let_binding() {
    let listing = "\
0 constant 1
1 varbind x
2 constant foo
3 varref x
4 call 1
5 unbind 1
6 return
";
    assert_eq!(source(listing), "(let ((x 1)) (foo x))");
}

#[test]
fn dolist_loop() {
    let listing = "\
0 varref lst
1 constant nil
2 varbind x
3 dup
4 varbind --dolist-tail--
5 goto-if-nil-else-pop 2
6:1 varref --dolist-tail--
7 car
8 varset x
9 constant foo
10 varref x
11 call 1
12 discard
13 varref --dolist-tail--
14 cdr
15 dup
16 varset --dolist-tail--
17 goto-if-not-nil 1
18 constant nil
19:2 unbind 2
20 return
";
    assert_eq!(source(listing), "(dolist (x lst) (foo x))");
}

#[test]
fn buffer_scoping() {
    let current = "\
0 save-current-buffer
1 constant get-buffer
2 constant \"x\"
3 call 1
4 set-buffer
5 discard
6 constant foo
7 call 0
8 unbind 1
9 return
";
    assert_eq!(source(current), "(with-current-buffer (get-buffer \"x\") (foo))");

    let temp = "\
0 constant generate-new-buffer
1 constant \"*temp*\"
2 call 1
3 varbind temp-buffer
4 save-current-buffer
5 varref temp-buffer
6 set-buffer
7 discard
8 constant ignore
9 unwind-protect
10 constant insert
11 constant \"x\"
12 call 1
13 unbind 1
14 unbind 1
15 unbind 1
16 return
";
    assert_eq!(source(temp), "(with-temp-buffer (insert \"x\"))");
}

#[test]
fn one_statement_when_is_an_if() {
    let listing = "\
0 varref a
1 goto-if-nil 1
2 constant foo
3 call 0
4 discard
5:1 constant nil
6 return
";
    assert_eq!(source(listing), "(if a (foo)) nil");
}

#[test]
fn duplicated_operand() {
    assert_eq!(source("0 varref a\n1 dup\n2 plus\n3 return\n"), "(+ a a)");
}

#[test]
fn oversized_call_is_rejected() {
    assert!(matches!(
        decompile("0 constant f\n1 call 65535\n2 return\n"),
        Err(LapError::MalformedLine { line: 2, .. })
    ));
}

#[test]
fn not_equal_and_accessors() {
    assert_eq!(source("0 varref a\n1 varref b\n2 eqlsign\n3 not\n4 return\n"), "(/= a b)");
    assert_eq!(source("0 varref x\n1 car\n2 car\n3 return\n"), "(caar x)");
}

#[test]
fn functions_are_wrapped_by_kind() {
    let listing = "\
byte code for inc:
  doc:  Increment X.
  args: (x)
  interactive: \"p\"
0\tvarref\t  x
1\tadd1\t
2\treturn\t

byte code for macro m:
  args: (a)
0\tvarref\t  a
1\treturn\t
";
    assert_eq!(
        source(listing),
        "(defun inc (x) \"Increment X.\" (interactive \"p\") (1+ x)) (defmacro m (a) a)"
    );
}

#[test]
fn nested_function_follows_its_parent() {
    let listing = "\
byte code for outer:
  args: nil
0\tconstant  <compiled-function>
  args: (y)
0\tvarref\t  y
1\tadd1\t
2\treturn\t

1\treturn\t
";
    let out = source(listing);
    assert_eq!(
        out,
        "(defun outer () #'compiled-function-0) (defun compiled-function-0 (y) (1+ y))"
    );
}

#[test]
fn failed_function_does_not_stop_the_rest() {
    let listing = "\
byte code for bad:
  args: nil
0\tvarref\t  a
1\tgoto-if-nil 9
2\treturn\t

byte code for good:
  args: nil
0\tconstant  t
1\treturn\t
";
    let out = decompile_with_options(listing, &DecompileOptions::default()).unwrap();
    assert_eq!(out.failures.len(), 1);
    assert_eq!(out.failures[0].name, "bad");
    assert!(matches!(out.failures[0].error, LapError::UnresolvedLabel { .. }));
    let text = normalize(&out.text);
    assert!(text.starts_with(";; bad: jump to unknown label 9 at offset 1"));
    assert!(text.ends_with("(defun good () t)"));
}

#[test]
fn parse_failure_carries_context() {
    let listing = "0 varref a\n1 unbind 1\n2 return\n";
    let out = decompile_with_options(listing, &DecompileOptions::default()).unwrap();
    assert_eq!(out.failures.len(), 1);
    assert!(matches!(out.failures[0].error, LapError::Parse(_)));
    assert!(out.text.contains(";; -> "));
}

#[test]
fn decompiling_is_deterministic() {
    let listings = [IF_ELSE, "0 varref a\n1 varref b\n2 varref c\n3 max\n4 max\n5 return\n"];
    let options = DecompileOptions {
        tree: TreeDump::Full,
        show_grammar: true,
        ..DecompileOptions::default()
    };
    for listing in listings {
        let first = decompile_with_options(listing, &options).unwrap().text;
        let second = decompile_with_options(listing, &options).unwrap().text;
        assert_eq!(first, second);
    }
}

#[test]
fn assembly_shows_markers() {
    let options = DecompileOptions {
        mode: DecompileMode::Assembly,
        ..DecompileOptions::default()
    };
    let out = decompile_with_options(IF_ELSE, &options).unwrap().text;
    assert!(out.contains("COME_FROM"));
    assert!(out.contains("STACK-ACCESS"));
    assert!(!out.contains("(if"));
}

#[test]
fn diagnostics_are_comments() {
    let options = DecompileOptions {
        show_blocks: true,
        show_grammar: true,
        tree: TreeDump::After,
        ..DecompileOptions::default()
    };
    let out = decompile_with_options("0 varref a\n1 varref b\n2 varref c\n3 max\n4 max\n5 return\n", &options)
        .unwrap()
        .text;
    assert!(out.contains(";; BasicBlock(range: (0, 5)"));
    assert!(out.contains("fn_body ::="));
    assert!(out.contains("(transformed by flatten)"));
    let code: Vec<&str> = out.lines().filter(|l| !l.starts_with(";;")).collect();
    assert_eq!(normalize(&code.join("\n")), "(max a b c)");
}
