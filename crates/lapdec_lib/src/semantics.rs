//! | directive | effect |
//! |-----------|--------|
//! | `%c`      | render the child named by the next argument |
//! | `%Q`      | like `%c`, with constants unquoted |
//! | `%{attr}` | operand of the instruction child named by the next argument |
//! | `%p`      | push the child named by the next argument on the eval stack |
//! | `%S`      | pop the eval stack and render the value |
//! | `%\|`     | current indentation |
//! | `%+` `%-` | indent or dedent one level |
//! | `%.`      | indent to the current column |
//! | `%(`      | start a new line unless at one, then `(` |
//! | `%)`      | `)` and dedent |

use log::warn;

use crate::LapError;
use crate::grammar::NodeKind;
use crate::tables::{OpClass, Opcode};
use crate::token::{EffectTable, Family, Instruction, OpKind, Value};
use crate::tree::Node;

/// Text rendered where a value was expected on an empty eval stack.
pub const EMPTY_STACK: &str = "<empty-stack>";

const TAB: &str = "  ";

#[derive(Debug, Clone)]
enum StackValue {
    Text(String),
    Node(Node),
    Slot(usize),
    /// An operand of the application being rendered.
    Operand(String),
}

fn template(kind: NodeKind) -> Option<(&'static str, &'static [usize])> {
    let t: (&'static str, &'static [usize]) = match kind {
        NodeKind::NullaryExpr => ("(%c)", &[0]),
        NodeKind::TernaryExprStacked => ("(%c %S %c %c)", &[3, 1, 2]),
        NodeKind::SetExpr | NodeKind::SetExprStacked => ("(set %c %c)", &[0, 1]),
        NodeKind::SetqForm => ("%(setq %{attr} %+%c%)", &[1, 0]),
        NodeKind::SetqFormDup | NodeKind::SetqFormStacked => ("%(setq %{attr} %+%c%)", &[2, 0]),
        NodeKind::PopExpr => ("(pop %{attr})", &[0]),
        NodeKind::SetBuffer => ("(set-buffer %c)", &[0]),
        NodeKind::IfForm => ("%(if %c\n%+%+%|%c%-%)", &[0, 2]),
        NodeKind::WhenMacro => ("%(when %c\n%+%|%c%)", &[0, 2]),
        NodeKind::AndForm => ("(and %c %c)", &[0, 2]),
        NodeKind::OrForm => ("(or %c %c)", &[0, 2]),
        NodeKind::WhileForm1 => ("%(while %p%c\n%+%|%c%)", &[0, 3, 5]),
        NodeKind::WhileForm2 => ("%(while %c\n%+%|%c%)", &[2, 4]),
        NodeKind::UnwindProtectForm => ("%(unwind-protect\n%+%|%c\n%|%Q%)", &[2, 0]),
        NodeKind::SaveExcursionForm => ("%(save-excursion\n%+%|%c%)", &[1]),
        NodeKind::SaveRestrictionForm => ("%(save-restriction\n%+%|%c%)", &[1]),
        NodeKind::SaveCurrentBufferForm => ("%(save-current-buffer\n%+%|%c%)", &[1]),
        NodeKind::WithCurrentBufferMacro => ("%(with-current-buffer %c\n%+%|%c%)", &[1, 4]),
        NodeKind::WithCurrentBufferSafeMacro => ("%(and %c (%Q %c)\n%+%|%c%)", &[0, 3, 4, 11]),
        NodeKind::WithTempBufferMacro => ("%(with-temp-buffer\n%+%|%c%)", &[0]),
        NodeKind::Dolist => ("%(dolist (%{attr} %c)\n%+%|%c%)", &[0, 1, 2]),
        NodeKind::Defvar => ("(defvar %Q %c)", &[0, 1]),
        NodeKind::Defconst => ("(defconst %Q %c)", &[0, 1]),
        NodeKind::DefvarDoc => ("%(defvar %Q %c\n%+%|%c%)", &[0, 1, 2]),
        NodeKind::DefconstDoc => ("%(defconst %Q %c\n%+%|%c%)", &[0, 1, 2]),
        NodeKind::Kbd => ("(kbd %c)", &[0]),
        NodeKind::ExprReturn => ("%c", &[0]),
        NodeKind::StackedReturn
        | NodeKind::OptDiscard
        | NodeKind::OptReturn
        | NodeKind::OptLabel
        | NodeKind::OptComeFrom
        | NodeKind::OptComeFroms
        | NodeKind::ComeFroms
        | NodeKind::EndClause => ("", &[]),
        _ => return None,
    };
    Some(t)
}

fn child(node: &Node, index: Option<usize>) -> Option<&Node> {
    index.and_then(|i| node.child(i))
}

fn self_evaluating(s: &str) -> bool {
    matches!(s, "t" | "nil")
        || s.starts_with([':', '[', '?', '"'])
        || s.parse::<f64>().is_ok()
}

fn statements_of(node: &Node) -> &[Node] {
    if node.is(NodeKind::Exprs) || node.is(NodeKind::OptExprs) {
        node.children()
    } else {
        node.child(0).map_or(&[][..], Node::children)
    }
}

pub struct Renderer {
    effects: EffectTable,
    buf: String,
    /// Column at which the first line of `buf` starts.
    start_col: usize,
    indent: String,
    indent_stack: Vec<String>,
    eval_stack: Vec<StackValue>,
    slots: Vec<Option<String>>,
    noquote: bool,
    issues: Vec<String>,
}

impl Renderer {
    pub fn new(base_indent: &str) -> Self {
        Self {
            effects: EffectTable::default(),
            buf: String::new(),
            start_col: base_indent.len(),
            indent: base_indent.to_string(),
            indent_stack: Vec::new(),
            eval_stack: Vec::new(),
            slots: Vec::new(),
            noquote: false,
            issues: Vec::new(),
        }
    }

    pub fn issues(&self) -> &[String] {
        &self.issues
    }

    pub fn render(mut self, tree: &Node) -> Result<(String, Vec<String>), LapError> {
        self.node(tree)?;
        let text = format!("{}{}", " ".repeat(self.start_col), self.buf);
        Ok((text, self.issues))
    }

    fn issue(&mut self, what: String) {
        warn!("{what}");
        self.issues.push(what);
    }

    fn missing(&mut self, node: &Node, index: Option<usize>) {
        self.issue(format!("{} has no child {index:?}", node.kind_name()));
        self.write(EMPTY_STACK);
    }

    fn child(&mut self, node: &Node, index: usize) -> Result<(), LapError> {
        match node.child(index) {
            Some(c) => self.node(c),
            None => {
                self.missing(node, Some(index));
                Ok(())
            }
        }
    }

    fn write(&mut self, s: &str) {
        self.buf.push_str(s);
    }

    fn column(&self) -> usize {
        match self.buf.rfind('\n') {
            Some(i) => self.buf.len() - i - 1,
            None => self.start_col + self.buf.len(),
        }
    }

    fn newline(&mut self) {
        self.buf.push('\n');
        self.buf.push_str(&self.indent);
    }

    fn indent_more(&mut self) {
        let next = format!("{}{TAB}", self.indent);
        self.indent_stack.push(std::mem::replace(&mut self.indent, next));
    }

    fn align(&mut self) {
        let next = " ".repeat(self.column());
        self.indent_stack.push(std::mem::replace(&mut self.indent, next));
    }

    fn indent_less(&mut self) {
        match self.indent_stack.pop() {
            Some(prev) => self.indent = prev,
            None => self.issue("indentation popped below the base level".to_string()),
        }
    }

    fn open(&mut self) {
        let at_line_start = self.buf.is_empty() || self.buf.ends_with(&format!("\n{}", self.indent));
        if !at_line_start {
            self.newline();
        }
        self.write("(");
    }

    /// Render into a fresh buffer that starts at the current indentation.
    fn capture(&mut self, f: impl FnOnce(&mut Self) -> Result<(), LapError>) -> Result<String, LapError> {
        let saved = std::mem::take(&mut self.buf);
        let saved_col = std::mem::replace(&mut self.start_col, self.indent.len());
        let result = f(self);
        self.start_col = saved_col;
        let text = std::mem::replace(&mut self.buf, saved);
        result.map(|()| text)
    }

    fn node(&mut self, node: &Node) -> Result<(), LapError> {
        let tree = match node {
            Node::Token(inst) => return self.token(inst),
            Node::Tree(tree) => tree,
        };
        match tree.kind {
            NodeKind::Exprs | NodeKind::OptExprs => self.statements(tree.children.iter()),
            NodeKind::FnBody => {
                // Trailing returns may consume values the body leaves behind.
                let Some((body, tail)) = tree.children.split_first() else {
                    self.missing(node, Some(0));
                    return Ok(());
                };
                self.statements(statements_of(body).iter().chain(tail))
            }
            NodeKind::BodyStacked => {
                let rest = tree.children.get(2).map_or(&[][..], Node::children);
                self.statements(tree.children.iter().take(1).chain(rest))
            }
            NodeKind::ExprStmt => self.child(node, 0),
            NodeKind::UnaryExpr | NodeKind::UnaryExprStacked => self.unary(node),
            NodeKind::BinaryExprStacked => self.binary_stacked(node),
            NodeKind::IfElseForm => self.if_else(node),
            NodeKind::CondForm => self.cond(node),
            NodeKind::Clause | NodeKind::LabeledClause | NodeKind::LabeledFinalClause => self.clause(node),
            NodeKind::LetFormStar => self.let_star(node),
            NodeKind::Varbind => {
                let var = node.children().last().and_then(Node::as_token).and_then(Instruction::attr_text);
                let var = var.unwrap_or(EMPTY_STACK).to_string();
                self.write(&format!("({var} "));
                self.child(node, 0)?;
                self.write(")");
                Ok(())
            }
            NodeKind::LetFormStacked => self.let_stacked(node),
            NodeKind::DolistMacro | NodeKind::DolistMacroResult => self.dolist_expansion(node),
            NodeKind::BinaryExpr | NodeKind::TernaryExpr => self.application(node),
            NodeKind::VarArity(family) => self.var_arity(node, family),
            NodeKind::Body
            | NodeKind::Expr
            | NodeKind::ExprStacked
            | NodeKind::NameExpr
            | NodeKind::NullaryOp
            | NodeKind::UnaryOp
            | NodeKind::BinaryOp
            | NodeKind::TernaryOp
            | NodeKind::Condition
            | NodeKind::DolistList => tree.children.iter().try_for_each(|c| self.node(c)),
            kind => match template(kind) {
                Some((fmt, args)) => self.template(node, fmt, args),
                None => {
                    self.issue(format!("no rendering for {kind}"));
                    self.write(EMPTY_STACK);
                    Ok(())
                }
            },
        }
    }

    fn constant(&self, value: Option<&Value>) -> String {
        match value {
            None => "nil".to_string(),
            Some(Value::Int(n)) => n.to_string(),
            Some(Value::Str(s)) => s.clone(),
            Some(Value::Function(f)) if self.noquote => f.name.clone(),
            Some(Value::Function(f)) => format!("#'{}", f.name),
            Some(Value::Symbol(s)) if self.noquote || self_evaluating(s) => s.clone(),
            Some(Value::Symbol(s)) => format!("'{s}"),
        }
    }

    fn token(&mut self, inst: &Instruction) -> Result<(), LapError> {
        let op = match inst.kind {
            OpKind::Fixed(op) => op,
            OpKind::VarArity(..) => return Ok(()),
        };
        let text = match op {
            Opcode::Constant => self.constant(inst.attr.as_ref()),
            Opcode::Varref | Opcode::Varset | Opcode::Varbind => {
                inst.attr.as_ref().map(ToString::to_string).unwrap_or_default()
            }
            Opcode::Dup => self.peek()?,
            Opcode::StackRef => {
                let depth = inst.attr_int().unwrap_or(0).max(0) as usize;
                match self.eval_stack.len().checked_sub(depth + 1) {
                    Some(i) => {
                        let value = self.eval_stack[i].clone();
                        self.value_text(value, false)?
                    }
                    None => {
                        self.issue(format!("stack-ref {depth} at offset {} past the eval stack", inst.offset));
                        EMPTY_STACK.to_string()
                    }
                }
            }
            op => {
                let info = op.info();
                match info.class {
                    OpClass::Nullary | OpClass::Unary | OpClass::Binary | OpClass::Ternary | OpClass::Pseudo => {
                        if info.display.is_empty() && info.class != OpClass::Pseudo {
                            info.mnemonic.to_string()
                        } else {
                            info.display.to_string()
                        }
                    }
                    _ => String::new(),
                }
            }
        };
        self.write(&text);
        Ok(())
    }

    fn value_text(&mut self, value: StackValue, take: bool) -> Result<String, LapError> {
        match value {
            StackValue::Text(s) | StackValue::Operand(s) => Ok(s),
            StackValue::Node(n) => self.capture(|r| r.node(&n)),
            StackValue::Slot(id) => {
                let text = match self.slots.get_mut(id) {
                    Some(slot) if take => slot.take(),
                    Some(slot) => slot.clone(),
                    None => None,
                };
                Ok(text.unwrap_or_else(|| {
                    self.issue(format!("stack slot {id} read after it was consumed"));
                    EMPTY_STACK.to_string()
                }))
            }
        }
    }

    fn pop(&mut self) -> Result<String, LapError> {
        match self.eval_stack.pop() {
            Some(value) => self.value_text(value, true),
            None => {
                self.issue("value popped from an empty eval stack".to_string());
                Ok(EMPTY_STACK.to_string())
            }
        }
    }

    fn peek(&mut self) -> Result<String, LapError> {
        match self.eval_stack.last().cloned() {
            Some(value) => self.value_text(value, false),
            None => {
                self.issue("value read from an empty eval stack".to_string());
                Ok(EMPTY_STACK.to_string())
            }
        }
    }

    fn template(&mut self, node: &Node, fmt: &str, args: &[usize]) -> Result<(), LapError> {
        let mut args = args.iter().copied();
        let mut chars = fmt.chars();
        while let Some(c) = chars.next() {
            if c != '%' {
                self.buf.push(c);
                continue;
            }
            let Some(d) = chars.next() else {
                self.buf.push('%');
                break;
            };
            match d {
                'c' => {
                    let index = args.next();
                    match child(node, index) {
                        Some(c) => self.node(c)?,
                        None => self.missing(node, index),
                    }
                }
                'Q' => {
                    let index = args.next();
                    let Some(c) = child(node, index) else {
                        self.missing(node, index);
                        continue;
                    };
                    let saved = std::mem::replace(&mut self.noquote, true);
                    let result = self.node(c);
                    self.noquote = saved;
                    result?;
                }
                '{' => {
                    let name: String = chars.by_ref().take_while(|&c| c != '}').collect();
                    if name != "attr" {
                        return Err(LapError::RenderInconsistency(format!("unknown directive %{{{name}}}")));
                    }
                    let index = args.next();
                    let Some(target) = child(node, index) else {
                        self.missing(node, index);
                        continue;
                    };
                    let attr = target.first_token().and_then(|t| t.attr.as_ref()).map(ToString::to_string);
                    self.write(&attr.unwrap_or_default());
                }
                'p' => {
                    let index = args.next();
                    match child(node, index) {
                        Some(c) => self.eval_stack.push(StackValue::Node(c.clone())),
                        None => {
                            self.issue(format!("{} has no child {index:?}", node.kind_name()));
                            self.eval_stack.push(StackValue::Text(EMPTY_STACK.to_string()));
                        }
                    }
                }
                'S' => {
                    let text = self.pop()?;
                    self.write(&text);
                }
                '|' => {
                    let indent = self.indent.clone();
                    self.write(&indent);
                }
                '+' => self.indent_more(),
                '-' => self.indent_less(),
                '.' => self.align(),
                '(' => self.open(),
                ')' => {
                    self.write(")");
                    self.indent_less();
                }
                '%' => self.buf.push('%'),
                other => {
                    return Err(LapError::RenderInconsistency(format!("unknown directive %{other}")));
                }
            }
        }
        Ok(())
    }

    /// One statement per line. Statements whose value stays on the stack
    /// get a slot that a later stack access may consume.
    fn statements<'n>(&mut self, stmts: impl Iterator<Item = &'n Node>) -> Result<(), LapError> {
        let mut lines = Vec::new();
        let mut own = Vec::new();
        for stmt in stmts {
            let text = self.capture(|r| r.node(stmt))?;
            let id = self.slots.len();
            self.slots.push(Some(text));
            lines.push(id);
            if self.keeps_value(stmt) {
                self.eval_stack.push(StackValue::Slot(id));
                own.push(id);
            }
        }
        self.eval_stack.retain(|v| !matches!(v, StackValue::Slot(id) if own.contains(id)));
        let texts: Vec<String> = lines
            .into_iter()
            .filter_map(|id| self.slots[id].take())
            .filter(|t| !t.is_empty())
            .collect();
        let sep = format!("\n{}", self.indent);
        self.write(&texts.join(&sep));
        Ok(())
    }

    fn keeps_value(&self, stmt: &Node) -> bool {
        if !stmt.is(NodeKind::ExprStmt) || stmt.child(1).is_some_and(|d| !d.children().is_empty()) {
            return false;
        }
        let tokens: Vec<Instruction> = stmt.tokens().into_iter().cloned().collect();
        self.effects.net(&tokens) > 0
    }

    fn unary(&mut self, node: &Node) -> Result<(), LapError> {
        let children = node.children();
        let Some(op) = children.last() else {
            self.missing(node, None);
            return Ok(());
        };
        self.write("(");
        self.node(op)?;
        self.write(" ");
        match children.first() {
            Some(first) if children.len() == 2 && !first.is_op(Opcode::StackAccess) => self.node(first)?,
            _ => {
                let text = self.pop()?;
                self.write(&text);
            }
        }
        self.write(")");
        Ok(())
    }

    fn binary_stacked(&mut self, node: &Node) -> Result<(), LapError> {
        let children = node.children();
        let Some(op) = children.last() else {
            self.missing(node, None);
            return Ok(());
        };
        let (first, second) = if children.len() == 2 {
            // The stacked expression sits above the value it combines with.
            let second = self.capture(|r| r.node(&children[0]))?;
            (self.pop()?, second)
        } else {
            let operand = children.iter().find(|c| c.as_tree().is_some());
            let first = self.pop()?;
            let second = match operand {
                Some(operand) => self.capture(|r| r.node(operand))?,
                None => EMPTY_STACK.to_string(),
            };
            (first, second)
        };
        self.write("(");
        self.node(op)?;
        self.write(&format!(" {first} {second})"));
        Ok(())
    }

    /// A body as a single form, wrapping several statements in `progn`.
    fn progn(&mut self, body: &Node) -> Result<(), LapError> {
        if statements_of(body).len() <= 1 {
            return self.node(body);
        }
        self.write("(progn");
        self.indent_more();
        self.newline();
        self.node(body)?;
        self.write(")");
        self.indent_less();
        Ok(())
    }

    fn if_else(&mut self, node: &Node) -> Result<(), LapError> {
        self.open();
        self.write("if ");
        self.child(node, 0)?;
        self.indent_more();
        self.indent_more();
        self.newline();
        match node.child(2) {
            Some(then) => self.progn(then)?,
            None => self.missing(node, Some(2)),
        }
        self.indent_less();
        self.newline();
        self.child(node, 6)?;
        self.write(")");
        self.indent_less();
        Ok(())
    }

    fn cond(&mut self, node: &Node) -> Result<(), LapError> {
        let mut clauses = Vec::new();
        for c in node.children() {
            if c.is(NodeKind::LabeledClauses) {
                clauses.extend(c.children());
            } else if c.is(NodeKind::Clause) || c.is(NodeKind::LabeledFinalClause) {
                clauses.push(c);
            }
        }
        self.open();
        self.write("cond ");
        self.align();
        for (i, clause) in clauses.into_iter().enumerate() {
            if i > 0 {
                self.newline();
            }
            self.node(clause)?;
        }
        self.write(")");
        self.indent_less();
        Ok(())
    }

    fn clause(&mut self, node: &Node) -> Result<(), LapError> {
        let tree = node.as_tree();
        let (condition, body) = match tree.map(|t| t.kind) {
            Some(NodeKind::LabeledClause) => return self.child(node, 1),
            Some(NodeKind::LabeledFinalClause) => (1, 2),
            _ => (0, 1),
        };
        let (Some(condition), Some(body)) = (node.child(condition), node.child(body)) else {
            self.missing(node, Some(condition));
            return Ok(());
        };
        self.write("(");
        self.align();
        if condition.is(NodeKind::Condition) {
            self.child(condition, 0)?;
        } else {
            self.write("t");
        }
        let text = self.capture(|r| r.node(body))?;
        if !text.is_empty() {
            if statements_of(body).len() > 1 {
                self.newline();
            } else {
                self.write(" ");
            }
            self.write(&text);
        }
        self.write(")");
        self.indent_less();
        Ok(())
    }

    fn bindings(&mut self, binds: &[&Node]) -> Result<(), LapError> {
        self.write("(");
        self.align();
        for (i, bind) in binds.iter().enumerate() {
            if i > 0 {
                self.newline();
            }
            self.node(bind)?;
        }
        self.write(")");
        self.indent_less();
        Ok(())
    }

    fn let_star(&mut self, node: &Node) -> Result<(), LapError> {
        let Some(varlist) = node.child(0) else {
            self.missing(node, Some(0));
            return Ok(());
        };
        let binds: Vec<&Node> = varlist.children().iter().collect();
        self.open();
        self.write(if binds.len() == 1 { "let " } else { "let* " });
        self.bindings(&binds)?;
        self.indent_more();
        self.newline();
        self.child(node, 1)?;
        self.write(")");
        self.indent_less();
        Ok(())
    }

    /// A `let` whose first value stays on the stack for the body.
    fn let_stacked(&mut self, node: &Node) -> Result<(), LapError> {
        let Some(varlist) = node.child(0) else {
            self.missing(node, Some(0));
            return Ok(());
        };
        let var = varlist.child(3).and_then(Node::as_token).and_then(Instruction::attr_text);
        let var = var.unwrap_or(EMPTY_STACK).to_string();

        let mut bound = vec![(var.clone(), varlist)];
        let mut inner = varlist.child(1);
        while let Some(n) = inner.filter(|n| n.children().len() == 3) {
            let name = n.child(2).and_then(Node::as_token).and_then(Instruction::attr_text).unwrap_or(EMPTY_STACK);
            bound.push((name.to_string(), n));
            inner = n.child(1);
        }

        self.open();
        self.write(if bound.len() == 1 { "let (" } else { "let* (" });
        self.align();
        for (i, (name, value)) in bound.into_iter().enumerate() {
            if i > 0 {
                self.newline();
            }
            self.write(&format!("({name} "));
            self.child(value, 0)?;
            self.write(")");
        }
        self.write(")");
        self.indent_less();

        let depth = self.eval_stack.len();
        self.eval_stack.push(StackValue::Text(var));
        self.indent_more();
        self.newline();
        self.child(node, 1)?;
        self.write(")");
        self.indent_less();
        self.eval_stack.truncate(depth);
        Ok(())
    }

    /// A `dolist` expansion the transform left alone.
    fn dolist_expansion(&mut self, node: &Node) -> Result<(), LapError> {
        let iter_set = node.child(5).map_or(&[][..], Node::children);
        let var = iter_set.iter().rev().find_map(|c| c.as_token().filter(|t| t.is(Opcode::Varset)));
        let var = var.and_then(Instruction::attr_text).unwrap_or(EMPTY_STACK).to_string();
        self.open();
        self.write(&format!("dolist ({var} "));
        match node.child(0) {
            Some(list) => self.child(list, 0)?,
            None => self.missing(node, Some(0)),
        }
        if node.is(NodeKind::DolistMacroResult) {
            self.write(" ");
            self.child(node, 16)?;
        }
        self.write(")");
        self.indent_more();
        self.newline();
        self.child(node, 6)?;
        self.write(")");
        self.indent_less();
        Ok(())
    }

    /// Render `nodes` in stack order. Each rendered operand stays on the
    /// eval stack until the last is done, so a `dup` or `stack-ref` among
    /// them reads its neighbours.
    fn operands(&mut self, nodes: &[&Node], noquote_first: bool) -> Result<Vec<String>, LapError> {
        let mut out = Vec::with_capacity(nodes.len());
        let mut result = Ok(());
        for (i, n) in nodes.iter().enumerate() {
            let saved = std::mem::replace(&mut self.noquote, noquote_first && i == 0);
            let text = self.capture(|r| r.node(n));
            self.noquote = saved;
            match text {
                Ok(text) => {
                    self.eval_stack.push(StackValue::Operand(text.clone()));
                    out.push(text);
                }
                Err(e) => {
                    result = Err(e);
                    break;
                }
            }
        }
        for _ in 0..out.len() {
            if !matches!(self.eval_stack.last(), Some(StackValue::Operand(_))) {
                break;
            }
            self.eval_stack.pop();
        }
        result.map(|()| out)
    }

    /// `binary_expr` and `ternary_expr`: operands first, operator last.
    fn application(&mut self, node: &Node) -> Result<(), LapError> {
        let Some((op, operands)) = node.children().split_last() else {
            self.missing(node, None);
            return Ok(());
        };
        let operands: Vec<&Node> = operands.iter().collect();
        let texts = self.operands(&operands, false)?;
        self.write("(");
        self.node(op)?;
        for text in texts {
            self.write(" ");
            self.write(&text);
        }
        self.write(")");
        Ok(())
    }

    fn var_arity(&mut self, node: &Node, family: Family) -> Result<(), LapError> {
        let operands: Vec<&Node> = node.children().iter().filter(|c| c.as_tree().is_some()).collect();
        let is_call = family == Family::Call;
        let texts = self.operands(&operands, is_call)?;
        self.write("(");
        let args = match (is_call, texts.split_first()) {
            (true, Some((callee, args))) => {
                self.write(callee);
                args
            }
            (true, None) => {
                self.missing(node, Some(0));
                &[][..]
            }
            (false, _) => {
                self.write(family.display());
                &texts[..]
            }
        };
        for arg in args {
            self.write(" ");
            self.write(arg);
        }
        self.write(")");
        Ok(())
    }
}

/// Render `tree` with every line indented by at least `base_indent`.
pub fn render(tree: &Node, base_indent: &str) -> Result<String, LapError> {
    Renderer::new(base_indent).render(tree).map(|(text, _)| text)
}
