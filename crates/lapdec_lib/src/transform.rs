use log::debug;

use crate::grammar::NodeKind;
use crate::tables::Opcode;
use crate::token::{Family, Instruction, Value};
use crate::tree::{Node, Tree};

pub fn transform(node: Node) -> Node {
    let Node::Tree(mut tree) = node else {
        return node;
    };
    tree.children = tree.children.into_iter().map(transform).collect();
    let node = Node::Tree(tree);
    rewrite(&node).unwrap_or(node)
}

fn rewrite(node: &Node) -> Option<Node> {
    let tree = node.as_tree()?;
    let out = match tree.kind {
        NodeKind::UnaryExpr => not_equal(tree).or_else(|| cxr(tree)),
        NodeKind::BinaryExpr => flatten(tree),
        NodeKind::VarArity(Family::Call) => defvar(tree).or_else(|| key_sequence(tree)),
        NodeKind::ExprStmt => and_statement(tree),
        NodeKind::WhenMacro => when_to_if(tree),
        NodeKind::SaveCurrentBufferForm => with_current_buffer(tree),
        NodeKind::LetFormStar => with_temp_buffer(tree),
        NodeKind::DolistMacro => dolist(tree),
        _ => None,
    }?;
    if let Node::Tree(t) = &out {
        debug!("{} rewritten to {} by {}", tree.kind, t.kind, t.transformed_by.unwrap_or("?"));
    }
    Some(out)
}

fn rewritten(kind: NodeKind, children: Vec<Node>, by: &'static str) -> Node {
    Node::Tree(Tree {
        kind,
        children,
        transformed_by: Some(by),
    })
}

fn op_token(node: &Node) -> Option<&Instruction> {
    node.child(0)?.as_token()
}

fn op_node(kind: NodeKind, op: Opcode, offset: u32) -> Node {
    Node::tree(kind, vec![Node::Token(Instruction::op(op, None, offset))])
}

fn constant(node: &Node) -> Option<&Instruction> {
    let inner = node.unwrap_expr();
    if !inner.is(NodeKind::NameExpr) {
        return None;
    }
    inner.child(0)?.as_token()
}

fn statements(body: &Node) -> &[Node] {
    let exprs = if body.is(NodeKind::Exprs) { body } else { body.child(0).unwrap_or(body) };
    exprs.children()
}

/// `(not (= a b))` to `(/= a b)`.
fn not_equal(tree: &Tree) -> Option<Node> {
    let [operand, op] = tree.children.as_slice() else {
        return None;
    };
    if !op_token(op)?.is(Opcode::Not) {
        return None;
    }
    let inner = operand.unwrap_expr().as_tree().filter(|t| t.kind == NodeKind::BinaryExpr)?;
    let [a, b, eq] = inner.children.as_slice() else {
        return None;
    };
    let eq = op_token(eq).filter(|t| t.is(Opcode::Eqlsign))?;
    let neq = op_node(NodeKind::BinaryOp, Opcode::Neqlsign, eq.offset);
    Some(rewritten(NodeKind::BinaryExpr, vec![a.clone(), b.clone(), neq], "not_equal"))
}

fn car_or_cdr(op: &Node) -> Option<char> {
    let tok = op_token(op)?;
    if tok.is(Opcode::Car) {
        Some('a')
    } else if tok.is(Opcode::Cdr) {
        Some('d')
    } else {
        None
    }
}

/// `(car (cdr x))` to `(cadr x)`, and likewise for the other three pairs.
fn cxr(tree: &Tree) -> Option<Node> {
    let [operand, op] = tree.children.as_slice() else {
        return None;
    };
    let outer = car_or_cdr(op)?;
    let inner = operand.unwrap_expr().as_tree().filter(|t| t.kind == NodeKind::UnaryExpr)?;
    let [x, inner_op] = inner.children.as_slice() else {
        return None;
    };
    let combined = match (outer, car_or_cdr(inner_op)?) {
        ('a', 'a') => Opcode::Caar,
        ('a', _) => Opcode::Cadr,
        (_, 'a') => Opcode::Cdar,
        _ => Opcode::Cddr,
    };
    let offset = op_token(op).map_or(0, |t| t.offset);
    let op = op_node(NodeKind::UnaryOp, combined, offset);
    Some(rewritten(NodeKind::UnaryExpr, vec![x.clone(), op], "cxr"))
}

fn operands(node: &Node, op: Opcode, family: Family, out: &mut Vec<Node>) {
    let inner = node.unwrap_expr();
    match inner.as_tree() {
        Some(t) if t.kind == NodeKind::BinaryExpr && t.children.get(2).and_then(op_token).is_some_and(|o| o.is(op)) => {
            operands(&t.children[0], op, family, out);
            operands(&t.children[1], op, family, out);
        }
        Some(t) if t.kind == NodeKind::VarArity(family) => out.extend(t.children.iter().cloned()),
        _ => out.push(node.clone()),
    }
}

/// Nested `max`, `min` and `nconc` applications into one n-ary form.
fn flatten(tree: &Tree) -> Option<Node> {
    let op = tree.children.get(2).and_then(op_token)?;
    let (opcode, family) = [
        (Opcode::Max, Family::Max),
        (Opcode::Min, Family::Min),
        (Opcode::Nconc, Family::Nconc),
    ]
    .into_iter()
    .find(|(opcode, _)| op.is(*opcode))?;
    let mut args = Vec::new();
    operands(&tree.children[0], opcode, family, &mut args);
    operands(&tree.children[1], opcode, family, &mut args);
    if args.len() < 3 {
        return None;
    }
    Some(rewritten(NodeKind::VarArity(family), args, "flatten"))
}

/// `(defvar NAME VALUE DOC)` compiled as a call of a one-argument lambda.
fn defvar_lambda(text: &str) -> Option<(NodeKind, String, Option<String>)> {
    let body = text.strip_prefix("(lambda (def-tmp-var) (")?.strip_suffix("))")?;
    let (head, rest) = body.split_once(' ')?;
    let (name, rest) = rest.split_once(' ')?;
    let doc = match rest.strip_prefix("def-tmp-var")?.trim() {
        "" => None,
        doc if doc.starts_with('"') && doc.ends_with('"') => Some(doc.to_string()),
        _ => return None,
    };
    let kind = match (head, doc.is_some()) {
        ("defvar", false) => NodeKind::Defvar,
        ("defvar", true) => NodeKind::DefvarDoc,
        ("defconst", false) => NodeKind::Defconst,
        ("defconst", true) => NodeKind::DefconstDoc,
        _ => return None,
    };
    Some((kind, name.to_string(), doc))
}

fn defvar(tree: &Tree) -> Option<Node> {
    let [callee, value, _call] = tree.children.as_slice() else {
        return None;
    };
    let lambda = constant(callee)?;
    let (kind, name, doc) = defvar_lambda(lambda.attr_text()?)?;
    let at = lambda.offset;
    let mut children = vec![
        Node::Token(Instruction::op(Opcode::Constant, Some(Value::Symbol(name)), at)),
        value.clone(),
    ];
    if let Some(doc) = doc {
        children.push(Node::Token(Instruction::op(Opcode::Constant, Some(Value::Str(doc)), at)));
    }
    Some(rewritten(kind, children, "defvar"))
}

const META: i64 = 134_217_728;

fn control(c: u32) -> Option<String> {
    match c {
        0 => Some("C-@".to_string()),
        27 => Some("ESC".to_string()),
        1..=26 | 28..=31 => char::from_u32(c + 96).map(|k| format!("C-{k}")),
        127 => Some("DEL".to_string()),
        _ => None,
    }
}

fn key_of_int(n: i64) -> Option<String> {
    let plain = |c: i64| -> Option<String> {
        let c = u32::try_from(c).ok()?;
        control(c).or_else(|| char::from_u32(c).filter(|k| !k.is_control()).map(String::from))
    };
    match n {
        n if (META..=META + 31).contains(&n) => match n - META {
            27 => Some("M-ESC".to_string()),
            c => control(c as u32).map(|k| format!("C-M-{}", &k[2..])),
        },
        n if (META + 33..=META + 126).contains(&n) => plain(n - META).map(|k| format!("M-{k}")),
        n => plain(n),
    }
}

/// Key description in the notation `kbd` reads.
pub fn key_description(key: &Value) -> Option<String> {
    let keys: Vec<String> = match key {
        Value::Str(s) => {
            let inner = s.strip_prefix('"')?.strip_suffix('"')?;
            inner
                .chars()
                .map(|c| control(c as u32).unwrap_or_else(|| c.to_string()))
                .collect()
        }
        Value::Symbol(v) => {
            let inner = v.strip_prefix('[')?.strip_suffix(']')?;
            inner
                .split_whitespace()
                .map(|w| match w.parse::<i64>() {
                    Ok(n) => key_of_int(n),
                    Err(_) => Some(format!("<{w}>")),
                })
                .collect::<Option<_>>()?
        }
        _ => return None,
    };
    if keys.is_empty() { None } else { Some(keys.join(" ")) }
}

/// Key arguments of key-binding calls as `(kbd "...")`.
fn key_sequence(tree: &Tree) -> Option<Node> {
    let callee = constant(tree.children.first()?)?.attr_text()?;
    let at = match (callee, tree.children.len()) {
        ("global-set-key" | "local-set-key", 4) => 1,
        ("define-key", 5) => 2,
        _ => return None,
    };
    let key = constant(&tree.children[at])?;
    let description = key_description(key.attr.as_ref()?)?;
    let text = Instruction::op(
        Opcode::Constant,
        Some(Value::Str(format!("\"{description}\""))),
        key.offset,
    );
    let mut children = tree.children.clone();
    children[at] = Node::tree(NodeKind::Expr, vec![Node::tree(NodeKind::Kbd, vec![Node::Token(text)])]);
    Some(rewritten(tree.kind, children, "kbd"))
}

/// A discarded `(and a b)` statement reads better as `(if a b)`.
fn and_statement(tree: &Tree) -> Option<Node> {
    let [expr, discard] = tree.children.as_slice() else {
        return None;
    };
    if discard.children().is_empty() {
        return None;
    }
    let and = expr.unwrap_expr().as_tree().filter(|t| t.kind == NodeKind::AndForm && t.children.len() == 5)?;
    let if_form = rewritten(NodeKind::IfForm, and.children.clone(), "and_statement");
    Some(Node::Tree(Tree {
        kind: NodeKind::ExprStmt,
        children: vec![Node::tree(NodeKind::Expr, vec![if_form]), discard.clone()],
        transformed_by: Some("and_statement"),
    }))
}

/// A `when` with a single statement is an `if` without else.
fn when_to_if(tree: &Tree) -> Option<Node> {
    let [cond, jump, body, come_froms, label] = tree.children.as_slice() else {
        return None;
    };
    let [stmt] = statements(body) else {
        return None;
    };
    let then = stmt.child(0)?.clone();
    let children = vec![
        cond.clone(),
        jump.clone(),
        then,
        Node::tree(NodeKind::OptComeFrom, come_froms.children().to_vec()),
        Node::tree(NodeKind::OptLabel, vec![label.clone()]),
    ];
    Some(rewritten(NodeKind::IfForm, children, "when_to_if"))
}

/// `(save-current-buffer (set-buffer X) ...)` to `(with-current-buffer X ...)`.
fn with_current_buffer(tree: &Tree) -> Option<Node> {
    let [save, body, unbind] = tree.children.as_slice() else {
        return None;
    };
    let (first, rest) = statements(body).split_first()?;
    let [expr, discard] = first.children() else {
        return None;
    };
    let set_buffer = expr.unwrap_expr().as_tree().filter(|t| t.kind == NodeKind::SetBuffer)?;
    let discard = discard.child(0)?;
    let [buffer, set] = set_buffer.children.as_slice() else {
        return None;
    };
    let children = vec![
        save.clone(),
        buffer.clone(),
        set.clone(),
        discard.clone(),
        Node::tree(NodeKind::Exprs, rest.to_vec()),
        unbind.clone(),
    ];
    Some(rewritten(NodeKind::WithCurrentBufferMacro, children, "with_current_buffer"))
}

fn refers_to(node: &Node, var: &str) -> bool {
    node.tokens()
        .iter()
        .any(|t| t.is(Opcode::Varref) && t.attr_text() == Some(var))
}

/// A `let` of `temp-buffer` around `with-current-buffer temp-buffer`.
fn with_temp_buffer(tree: &Tree) -> Option<Node> {
    let [varbind] = tree.children.first()?.children() else {
        return None;
    };
    let var = varbind.children().last()?.as_token()?;
    if !var.is(Opcode::Varbind) || var.attr_text() != Some("temp-buffer") {
        return None;
    }
    let (first, rest) = statements(tree.children.get(1)?).split_first()?;
    let wcb = first.child(0)?.unwrap_expr();
    if !wcb.is(NodeKind::WithCurrentBufferMacro) || !wcb.child(1).is_some_and(|b| refers_to(b, "temp-buffer")) {
        return None;
    }
    let inner = wcb.child(4)?.children();
    let mut stmts = match inner {
        [only] => match only.child(0).map(Node::unwrap_expr) {
            Some(up) if up.is(NodeKind::UnwindProtectForm) => up.child(2)?.children().to_vec(),
            _ => inner.to_vec(),
        },
        _ => inner.to_vec(),
    };
    stmts.extend(rest.iter().cloned());
    Some(rewritten(
        NodeKind::WithTempBufferMacro,
        vec![Node::tree(NodeKind::Exprs, stmts)],
        "with_temp_buffer",
    ))
}

const DOLIST_TAIL: &str = "--dolist-tail--";

/// Expanded `dolist` loops back to `(dolist (VAR LIST) BODY)`.
fn dolist(tree: &Tree) -> Option<Node> {
    let iter_set = tree.children.get(5).filter(|n| n.is(NodeKind::DolistLoopIterSet))?;
    let var = iter_set.child(2)?.clone();
    let list = tree.children.first()?.child(0)?.clone();
    let mut stmts = statements(tree.children.get(6)?).to_vec();
    // The loop ends by pushing (cdr TAIL) for the DUP VARSET that follows.
    if stmts.last().is_some_and(advances_tail) {
        stmts.pop();
    }
    Some(rewritten(
        NodeKind::Dolist,
        vec![var, list, Node::tree(NodeKind::Exprs, stmts)],
        "dolist",
    ))
}

fn advances_tail(stmt: &Node) -> bool {
    stmt.tokens()
        .first()
        .is_some_and(|t| t.is(Opcode::Varref) && t.attr_text() == Some(DOLIST_TAIL))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bb;
    use crate::grammar;
    use crate::parser;
    use crate::scanner::scan;
    use crate::token::EffectTable;

    fn parsed(listing: &str) -> Node {
        let f = scan(listing).unwrap().remove(0);
        let effects = EffectTable::default();
        let seg = bb::segment(&f.instructions, &effects).unwrap();
        let toks = bb::ingest(&seg, &effects);
        parser::parse(&toks, "fn_body", &grammar::synthesize_rules(&toks)).unwrap()
    }

    fn find(node: &Node, kind: NodeKind) -> Option<&Node> {
        if node.is(kind) {
            return Some(node);
        }
        node.children().iter().find_map(|c| find(c, kind))
    }

    fn transformed_by(node: &Node) -> Vec<&'static str> {
        let mut out: Vec<&'static str> = node.children().iter().flat_map(transformed_by).collect();
        if let Some(by) = node.as_tree().and_then(|t| t.transformed_by) {
            out.push(by);
        }
        out
    }

    #[test]
    fn not_of_equal_becomes_not_equal() {
        let tree = transform(parsed("0 varref a\n1 varref b\n2 eqlsign\n3 not\n4 return\n"));
        let bin = find(&tree, NodeKind::BinaryExpr).unwrap();
        assert_eq!(bin.at(&[2, 0]).map(Node::kind_name).as_deref(), Some("NEQLSIGN"));
        assert_eq!(transformed_by(&tree), ["not_equal"]);
    }

    #[test]
    fn car_of_cdr_becomes_cadr() {
        let tree = transform(parsed("0 varref x\n1 cdr\n2 car\n3 return\n"));
        let un = find(&tree, NodeKind::UnaryExpr).unwrap();
        assert_eq!(un.at(&[1, 0]).map(Node::kind_name).as_deref(), Some("CADR"));
        assert!(un.child(0).unwrap().unwrap_expr().is_op(Opcode::Varref));
    }

    #[test]
    fn nested_max_is_flattened_in_order() {
        let tree = transform(parsed("0 varref a\n1 varref b\n2 varref c\n3 max\n4 max\n5 return\n"));
        let max = find(&tree, NodeKind::VarArity(Family::Max)).unwrap();
        let names: Vec<&str> = max
            .children()
            .iter()
            .filter_map(|c| c.unwrap_expr().as_token()?.attr_text())
            .collect();
        assert_eq!(names, ["a", "b", "c"]);
    }

    #[test]
    fn lone_binary_max_is_kept() {
        let tree = transform(parsed("0 varref a\n1 varref b\n2 max\n3 return\n"));
        assert!(find(&tree, NodeKind::BinaryExpr).is_some());
        assert!(transformed_by(&tree).is_empty());
    }

    #[test]
    fn defvar_lambda_call() {
        let listing = "\
0 constant (lambda (def-tmp-var) (defvar foo def-tmp-var \"Foo.\"))
1 constant 5
2 call 1
3 return
";
        let tree = transform(parsed(listing));
        let def = find(&tree, NodeKind::DefvarDoc).unwrap();
        assert_eq!(def.child(0).and_then(Node::as_token).and_then(Instruction::attr_text), Some("foo"));
        assert_eq!(def.children().len(), 3);
    }

    #[test]
    fn key_descriptions() {
        assert_eq!(key_description(&Value::Str("\"\u{18}\u{6}\"".into())).as_deref(), Some("C-x C-f"));
        assert_eq!(key_description(&Value::Str("\"\u{1b}x\"".into())).as_deref(), Some("ESC x"));
        assert_eq!(
            key_description(&Value::Symbol("[134217848 f1 24]".into())).as_deref(),
            Some("M-x <f1> C-x")
        );
        assert_eq!(key_description(&Value::Symbol("[134217734]".into())).as_deref(), Some("C-M-f"));
        assert_eq!(key_description(&Value::Int(3)), None);
    }

    #[test]
    fn global_set_key_argument_is_translated() {
        let listing = "0 constant global-set-key\n1 constant \"\u{18}\u{6}\"\n2 constant find-file\n3 call 2\n4 return\n";
        let tree = transform(parsed(listing));
        let kbd = find(&tree, NodeKind::Kbd).unwrap();
        assert_eq!(kbd.child(0).and_then(Node::as_token).and_then(Instruction::attr_text), Some("\"C-x C-f\""));
    }

    const DOLIST: &str = "\
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

    const WITH_CURRENT_BUFFER: &str = "\
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

    const WITH_TEMP_BUFFER: &str = "\
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

    const WHEN: &str = "\
0 varref a
1 goto-if-nil 1
2 constant foo
3 call 0
4 discard
5:1 constant nil
6 return
";

    #[test]
    fn dolist_drops_the_tail_step() {
        let tree = transform(parsed(DOLIST));
        let dolist = find(&tree, NodeKind::Dolist).unwrap();
        let body = dolist.child(2).unwrap();
        assert_eq!(body.children().len(), 1);
        assert!(!body.tokens().iter().any(|t| t.attr_text() == Some(DOLIST_TAIL)));
        assert!(transformed_by(&tree).contains(&"dolist"));
    }

    #[test]
    fn set_buffer_statement_becomes_with_current_buffer() {
        let tree = transform(parsed(WITH_CURRENT_BUFFER));
        let wcb = find(&tree, NodeKind::WithCurrentBufferMacro).unwrap();
        assert!(wcb.child(1).unwrap().unwrap_expr().is(NodeKind::VarArity(Family::Call)));
        assert_eq!(wcb.child(4).unwrap().children().len(), 1);
        assert_eq!(transformed_by(&tree), ["with_current_buffer"]);
    }

    #[test]
    fn temp_buffer_let_becomes_with_temp_buffer() {
        let tree = transform(parsed(WITH_TEMP_BUFFER));
        let wtb = find(&tree, NodeKind::WithTempBufferMacro).unwrap();
        let body = wtb.child(0).unwrap();
        assert_eq!(body.children().len(), 1);
        assert!(find(body, NodeKind::UnwindProtectForm).is_none());
        assert!(transformed_by(&tree).contains(&"with_temp_buffer"));
    }

    #[test]
    fn single_statement_when_becomes_if() {
        let tree = transform(parsed(WHEN));
        assert!(find(&tree, NodeKind::WhenMacro).is_none());
        assert!(find(&tree, NodeKind::IfForm).is_some());
        assert_eq!(transformed_by(&tree), ["when_to_if"]);
    }

    #[test]
    fn discarded_and_becomes_if() {
        let tok = |op, attr: Option<&str>, at| Node::Token(Instruction::op(op, attr.map(|a| Value::Symbol(a.into())), at));
        let and = Node::tree(
            NodeKind::AndForm,
            vec![
                Node::tree(NodeKind::Expr, vec![tok(Opcode::Varref, Some("a"), 0)]),
                tok(Opcode::GotoIfNilElsePop, Some("1"), 1),
                Node::tree(NodeKind::Expr, vec![tok(Opcode::Varref, Some("b"), 2)]),
                Node::tree(NodeKind::OptComeFrom, vec![]),
                Node::tree(NodeKind::OptLabel, vec![]),
            ],
        );
        let stmt = Node::tree(
            NodeKind::ExprStmt,
            vec![
                Node::tree(NodeKind::Expr, vec![and]),
                Node::tree(NodeKind::OptDiscard, vec![tok(Opcode::Discard, None, 3)]),
            ],
        );
        let once = transform(stmt);
        assert!(find(&once, NodeKind::AndForm).is_none());
        assert!(find(&once, NodeKind::IfForm).is_some());
        assert_eq!(transformed_by(&once), ["and_statement", "and_statement"]);
        assert_eq!(transform(once.clone()), once);
    }

    #[test]
    fn transform_is_idempotent() {
        let listings = [
            "0 varref a\n1 varref b\n2 eqlsign\n3 not\n4 return\n",
            "0 varref a\n1 varref b\n2 varref c\n3 max\n4 max\n5 return\n",
            "0 constant global-set-key\n1 constant \"\u{18}\u{6}\"\n2 constant find-file\n3 call 2\n4 return\n",
            DOLIST,
            WITH_CURRENT_BUFFER,
            WITH_TEMP_BUFFER,
            WHEN,
        ];
        for listing in listings {
            let once = transform(parsed(listing));
            let twice = transform(once.clone());
            assert_eq!(once, twice);
            assert_eq!(transformed_by(&once), transformed_by(&twice));
        }
    }
}
