use std::collections::BTreeSet;
use std::fmt;

use log::debug;

use crate::LapError;
use crate::tables::{OPCODE_INFO, OpClass};
use crate::token::{Family, Instruction, OpKind};

macro_rules! node_kinds {
    ($($variant:ident => $name:literal,)*) => {
        /// Tag of a syntax-tree node. Everything except `VarArity` is a
        /// nonterminal of the static grammar or a product of the transform.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub enum NodeKind {
            $($variant,)*
            VarArity(Family),
        }

        impl NodeKind {
            pub fn name(&self) -> &'static str {
                match self {
                    $(NodeKind::$variant => $name,)*
                    NodeKind::VarArity(family) => family.nonterminal(),
                }
            }

            pub fn from_name(s: &str) -> Option<NodeKind> {
                match s {
                    $($name => Some(NodeKind::$variant),)*
                    _ => Family::from_nonterminal(s).map(NodeKind::VarArity),
                }
            }
        }
    };
}

node_kinds! {
    FnBody => "fn_body",
    Body => "body",
    BodyStacked => "body_stacked",
    Exprs => "exprs",
    OptExprs => "opt_exprs",
    ExprStmt => "expr_stmt",
    Expr => "expr",
    ExprStacked => "expr_stacked",
    ExprReturn => "expr_return",
    StackedReturn => "stacked_return",
    OptReturn => "opt_return",
    OptDiscard => "opt_discard",
    OptLabel => "opt_label",
    OptComeFrom => "opt_come_from",
    OptComeFroms => "opt_come_froms",
    ComeFroms => "come_froms",
    NameExpr => "name_expr",
    NullaryExpr => "nullary_expr",
    UnaryExpr => "unary_expr",
    UnaryExprStacked => "unary_expr_stacked",
    BinaryExpr => "binary_expr",
    BinaryExprStacked => "binary_expr_stacked",
    TernaryExpr => "ternary_expr",
    TernaryExprStacked => "ternary_expr_stacked",
    NullaryOp => "nullary_op",
    UnaryOp => "unary_op",
    BinaryOp => "binary_op",
    TernaryOp => "ternary_op",
    PopExpr => "pop_expr",
    SetqForm => "setq_form",
    SetqFormDup => "setq_form_dup",
    SetqFormStacked => "setq_form_stacked",
    SetExpr => "set_expr",
    SetExprStacked => "set_expr_stacked",
    SetBuffer => "set_buffer",
    IfForm => "if_form",
    IfElseForm => "if_else_form",
    WhenMacro => "when_macro",
    AndForm => "and_form",
    OrForm => "or_form",
    CondForm => "cond_form",
    Clause => "clause",
    Condition => "condition",
    EndClause => "end_clause",
    LabeledClause => "labeled_clause",
    LabeledClauses => "labeled_clauses",
    LabeledFinalClause => "labeled_final_clause",
    WhileForm1 => "while_form1",
    WhileForm2 => "while_form2",
    DolistMacro => "dolist_macro",
    DolistMacroResult => "dolist_macro_result",
    DolistList => "dolist_list",
    DolistInitVar => "dolist_init_var",
    DolistLoopIterSet => "dolist_loop_iter_set",
    DolistLoopIterSetStacking => "dolist_loop_iter_set_stacking",
    UnwindProtectForm => "unwind_protect_form",
    LetFormStar => "let_form_star",
    Varlist => "varlist",
    Varbind => "varbind",
    LetFormStacked => "let_form_stacked",
    VarlistStacked => "varlist_stacked",
    VarlistStackedInner => "varlist_stacked_inner",
    SaveExcursionForm => "save_excursion_form",
    SaveRestrictionForm => "save_restriction_form",
    SaveCurrentBufferForm => "save_current_buffer_form",
    WithCurrentBufferMacro => "with_current_buffer_macro",
    WithCurrentBufferSafeMacro => "with_current_buffer_safe_macro",
    WithTempBufferMacro => "with_temp_buffer_macro",
    Dolist => "dolist",
    Defvar => "defvar",
    DefvarDoc => "defvar_doc",
    Defconst => "defconst",
    DefconstDoc => "defconst_doc",
    Kbd => "kbd",
}

impl fmt::Display for NodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Nonterminals whose left-recursive rules are flattened into one node.
const COLLECT: &[NodeKind] = &[
    NodeKind::Exprs,
    NodeKind::OptExprs,
    NodeKind::Varlist,
    NodeKind::LabeledClauses,
    NodeKind::ComeFroms,
];

pub fn is_collected(kind: NodeKind) -> bool {
    COLLECT.contains(&kind)
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Symbol {
    Terminal(String),
    Nonterminal(NodeKind),
}

impl fmt::Display for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Symbol::Terminal(t) => f.write_str(t),
            Symbol::Nonterminal(n) => f.write_str(n.name()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GrammarRule {
    pub lhs: NodeKind,
    pub rhs: Vec<Symbol>,
}

impl GrammarRule {
    /// `lhs ::= lhs X`, the shape a collected nonterminal flattens.
    pub fn is_left_recursive_pair(&self) -> bool {
        self.rhs.len() == 2 && self.rhs[0] == Symbol::Nonterminal(self.lhs)
    }
}

impl fmt::Display for GrammarRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ::=", self.lhs)?;
        for sym in &self.rhs {
            write!(f, " {sym}")?;
        }
        Ok(())
    }
}

/// Rules are tried in the order written when more than one derivation
/// covers the same instructions.
const GRAMMAR: &str = r#"
fn_body ::= body opt_label opt_return
fn_body ::= body opt_come_froms opt_label stacked_return
fn_body ::= body opt_come_froms opt_label expr_return

# An expr_stmt is an expr whose value may go unused.
expr_stmt ::= expr opt_discard
exprs     ::= expr_stmt+
opt_exprs ::= expr_stmt*
body      ::= exprs

body_stacked ::= expr_stacked opt_discard exprs
body_stacked ::= expr_stacked

expr_stacked ::= DUP
expr_stacked ::= unary_expr_stacked
expr_stacked ::= binary_expr_stacked
expr_stacked ::= ternary_expr_stacked
expr_stacked ::= set_expr_stacked

expr ::= if_else_form
expr ::= if_form
expr ::= when_macro
expr ::= cond_form
expr ::= or_form
expr ::= and_form
expr ::= while_form1
expr ::= while_form2
expr ::= dolist_macro
expr ::= dolist_macro_result
expr ::= unwind_protect_form
expr ::= let_form_star
expr ::= let_form_stacked
expr ::= save_excursion_form
expr ::= save_restriction_form
expr ::= with_current_buffer_safe_macro
expr ::= with_current_buffer_macro
expr ::= save_current_buffer_form
expr ::= set_buffer
expr ::= setq_form
expr ::= setq_form_dup
expr ::= setq_form_stacked
expr ::= set_expr
expr ::= pop_expr
expr ::= binary_expr
expr ::= binary_expr_stacked
expr ::= ternary_expr
expr ::= unary_expr
expr ::= unary_expr_stacked
expr ::= nullary_expr
expr ::= name_expr
expr ::= VARREF
expr ::= STACK-REF
expr ::= DUP

save_excursion_form       ::= SAVE-EXCURSION body UNBIND
save_restriction_form     ::= SAVE-RESTRICTION body UNBIND
save_current_buffer_form  ::= SAVE-CURRENT-BUFFER body UNBIND
with_current_buffer_macro ::= SAVE-CURRENT-BUFFER VARREF SET-BUFFER DISCARD exprs UNBIND
with_current_buffer_safe_macro ::= VARREF NOT GOTO-IF-NOT-NIL-ELSE-POP
                                   CONSTANT VARREF CALL_1
                                   COME_FROM LABEL STACK-ACCESS
                                   NOT GOTO-IF-NIL-ELSE-POP
                                   with_current_buffer_macro
                                   opt_come_from opt_label
set_buffer ::= expr SET-BUFFER

unary_expr_stacked   ::= STACK-ACCESS unary_op
unary_expr_stacked   ::= unary_op
binary_expr_stacked  ::= expr STACK-ACCESS binary_op
binary_expr_stacked  ::= expr_stacked binary_op
binary_expr_stacked  ::= STACK-ACCESS expr binary_op
ternary_expr_stacked ::= STACK-ACCESS expr expr ternary_op

# The conditional jump sits at position 1 in each of these.
if_else_form ::= expr GOTO-IF-NIL body GOTO come_froms LABEL body come_froms LABEL
if_form      ::= expr GOTO-IF-NIL expr opt_come_from opt_label
if_form      ::= expr GOTO-IF-NOT-NIL expr opt_come_from opt_label
when_macro   ::= expr GOTO-IF-NIL body come_froms LABEL
when_macro   ::= expr GOTO-IF-NIL-ELSE-POP body come_froms LABEL
or_form      ::= expr GOTO-IF-NOT-NIL-ELSE-POP expr opt_come_from opt_label
or_form      ::= expr GOTO-IF-NOT-NIL expr GOTO-IF-NIL-ELSE-POP COME_FROM LABEL
and_form     ::= expr GOTO-IF-NIL-ELSE-POP expr opt_come_from opt_label

while_form1 ::= expr COME_FROM LABEL expr
                GOTO-IF-NIL-ELSE-POP body
                GOTO COME_FROM LABEL
while_form2 ::= COME_FROM LABEL expr
                GOTO-IF-NIL-ELSE-POP body
                GOTO COME_FROM LABEL

unwind_protect_form ::= expr UNWIND-PROTECT opt_exprs UNBIND

dolist_macro ::= dolist_list dolist_init_var
                 GOTO-IF-NIL-ELSE-POP COME_FROM LABEL
                 dolist_loop_iter_set body
                 DUP VARSET GOTO-IF-NOT-NIL
                 CONSTANT COME_FROM LABEL
                 UNBIND
dolist_macro ::= dolist_list dolist_init_var
                 GOTO-IF-NIL COME_FROM LABEL
                 dolist_loop_iter_set body
                 DUP VARSET GOTO-IF-NOT-NIL
                 COME_FROM LABEL
                 UNBIND
dolist_macro ::= dolist_list dolist_init_var
                 GOTO-IF-NIL-ELSE-POP COME_FROM LABEL
                 dolist_loop_iter_set_stacking body_stacked
                 DUP VARSET GOTO-IF-NOT-NIL
                 CONSTANT COME_FROM LABEL
                 UNBIND
dolist_macro_result ::= dolist_list dolist_init_var
                        GOTO-IF-NIL COME_FROM LABEL
                        dolist_loop_iter_set body
                        VARREF CDR DUP VARSET GOTO-IF-NOT-NIL
                        COME_FROM LABEL CONSTANT VARSET expr
                        UNBIND
dolist_loop_iter_set          ::= VARREF CAR VARSET
dolist_loop_iter_set_stacking ::= VARREF CAR DUP VARSET
dolist_init_var               ::= varbind DUP VARBIND
dolist_list                   ::= expr

name_expr    ::= CONSTANT
nullary_expr ::= nullary_op
unary_expr   ::= expr unary_op
unary_expr   ::= STACK-ACCESS unary_op
binary_expr  ::= expr expr binary_op
ternary_expr ::= expr expr expr ternary_op

pop_expr ::= VARREF DUP CDR VARSET CAR-SAFE

setq_form         ::= expr VARSET
setq_form_dup     ::= expr DUP VARSET
setq_form_stacked ::= expr_stacked DUP VARSET
set_expr          ::= expr expr SET
set_expr          ::= expr expr STACK-SET SET
set_expr_stacked  ::= expr_stacked expr SET

cond_form ::= clause labeled_clauses come_froms LABEL
cond_form ::= clause labeled_clauses labeled_final_clause LABEL
cond_form ::= clause labeled_final_clause LABEL
cond_form ::= clause labeled_clauses

labeled_clauses      ::= labeled_clause+
labeled_clause       ::= LABEL clause
labeled_final_clause ::= LABEL condition body come_froms

condition ::= expr GOTO-IF-NIL opt_come_from opt_label
condition ::= expr GOTO-IF-NIL-ELSE-POP opt_come_from opt_label

clause ::= condition body end_clause
clause ::= opt_label body end_clause

end_clause ::= GOTO COME_FROM
end_clause ::= RETURN COME_FROM
end_clause ::= RETURN
end_clause ::= stacked_return

let_form_star ::= varlist body UNBIND
let_form_star ::= varlist body
varlist       ::= varbind+
varbind       ::= expr VARBIND
varbind       ::= expr STACK-ACCESS VARBIND

let_form_stacked      ::= varlist_stacked body_stacked UNBIND
varlist_stacked       ::= expr varlist_stacked_inner DUP VARBIND
varlist_stacked_inner ::= expr varlist_stacked_inner VARBIND
varlist_stacked_inner ::=

come_froms     ::= COME_FROM+
opt_come_froms ::= come_froms?
opt_come_from  ::= COME_FROM?
opt_label      ::= LABEL?
opt_discard    ::= DISCARD?
opt_return     ::= RETURN?

stacked_return ::= STACK-ACCESS RETURN
expr_return    ::= expr RETURN
"#;

fn symbol(word: &str, line: &str) -> Result<Symbol, LapError> {
    if word.chars().any(|c| c.is_ascii_uppercase()) {
        return Ok(Symbol::Terminal(word.to_string()));
    }
    NodeKind::from_name(word)
        .map(Symbol::Nonterminal)
        .ok_or_else(|| LapError::Grammar(format!("unknown nonterminal `{word}` in `{line}`")))
}

fn parse_rules(text: &str, out: &mut Vec<GrammarRule>) -> Result<(), LapError> {
    // Join continuation lines onto the rule they belong to.
    let mut logical: Vec<String> = Vec::new();
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        match logical.last_mut() {
            Some(prev) if !line.contains("::=") => {
                prev.push(' ');
                prev.push_str(line);
            }
            _ => logical.push(line.to_string()),
        }
    }

    for line in &logical {
        let (lhs, rhs) = line
            .split_once("::=")
            .ok_or_else(|| LapError::Grammar(format!("missing `::=` in `{line}`")))?;
        let lhs = NodeKind::from_name(lhs.trim())
            .ok_or_else(|| LapError::Grammar(format!("unknown nonterminal in `{line}`")))?;
        let words: Vec<&str> = rhs.split_whitespace().collect();

        if let [word] = words.as_slice() {
            let repeat = word.chars().last().filter(|c| matches!(c, '+' | '*' | '?'));
            if let Some(suffix) = repeat {
                let item = symbol(&word[..word.len() - 1], line)?;
                let rec = GrammarRule {
                    lhs,
                    rhs: vec![Symbol::Nonterminal(lhs), item.clone()],
                };
                let empty = GrammarRule { lhs, rhs: Vec::new() };
                let single = GrammarRule { lhs, rhs: vec![item] };
                match suffix {
                    '+' => out.extend([single, rec]),
                    '*' => out.extend([rec, empty]),
                    _ => out.extend([single, empty]),
                }
                continue;
            }
        }

        let rhs = words
            .iter()
            .map(|w| symbol(w, line))
            .collect::<Result<Vec<_>, _>>()?;
        out.push(GrammarRule { lhs, rhs });
    }
    Ok(())
}

pub fn base_rules() -> Result<Vec<GrammarRule>, LapError> {
    let mut rules = Vec::new();
    parse_rules(GRAMMAR, &mut rules)?;
    for info in OPCODE_INFO {
        let lhs = match info.class {
            OpClass::Nullary => NodeKind::NullaryOp,
            OpClass::Unary => NodeKind::UnaryOp,
            OpClass::Binary => NodeKind::BinaryOp,
            OpClass::Ternary => NodeKind::TernaryOp,
            _ => continue,
        };
        rules.push(GrammarRule {
            lhs,
            rhs: vec![Symbol::Terminal(info.name.to_string())],
        });
    }
    Ok(rules)
}

/// Rules for the variable-arity instructions present in `instructions`:
/// `<family>_exprn ::= expr ... OPCODE` with one `expr` per consumed
/// operand, and `expr ::= <family>_exprn` once per family.
pub fn synthesize_rules(instructions: &[Instruction]) -> Vec<GrammarRule> {
    let mut seen: BTreeSet<(Family, u16)> = BTreeSet::new();
    let mut promoted: BTreeSet<Family> = BTreeSet::new();
    let mut rules = Vec::new();

    for inst in instructions {
        let OpKind::VarArity(family, n) = inst.kind else {
            continue;
        };
        if !seen.insert((family, n)) {
            continue;
        }
        let nt = NodeKind::VarArity(family);
        let mut rhs = vec![Symbol::Nonterminal(NodeKind::Expr); family.operands(n) as usize];
        rhs.push(Symbol::Terminal(inst.kind.name()));
        let rule = GrammarRule { lhs: nt, rhs };
        debug!("synthesized {rule}");
        rules.push(rule);

        if promoted.insert(family) {
            rules.push(GrammarRule {
                lhs: NodeKind::Expr,
                rhs: vec![Symbol::Nonterminal(nt)],
            });
        }
    }
    rules
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tables::Opcode;
    use crate::token::Value;

    #[test]
    fn static_grammar_parses() {
        let rules = base_rules().unwrap();
        assert!(rules.iter().any(|r| r.to_string() == "binary_op ::= PLUS"));
        assert!(rules.iter().any(|r| r.to_string() == "nullary_op ::= POINT"));
        assert!(rules.iter().any(|r| r.to_string() == "exprs ::= exprs expr_stmt"));
        assert!(rules.iter().any(|r| r.to_string() == "opt_label ::="));
        let while2 = rules.iter().find(|r| r.lhs == NodeKind::WhileForm2).unwrap();
        assert_eq!(while2.rhs.len(), 8);
    }

    #[test]
    fn names_round_trip() {
        for kind in [NodeKind::FnBody, NodeKind::LabeledFinalClause, NodeKind::VarArity(Family::Max)] {
            assert_eq!(NodeKind::from_name(kind.name()), Some(kind));
        }
    }

    #[test]
    fn variable_arity_rules_are_synthesized_once() {
        let call3 = Instruction::new(OpKind::VarArity(Family::Call, 3), Some(Value::Int(3)), 4);
        let list2 = Instruction::new(OpKind::VarArity(Family::List, 2), Some(Value::Int(2)), 9);
        let other = Instruction::op(Opcode::Return, None, 10);
        let rules = synthesize_rules(&[call3.clone(), list2, call3, other]);
        let text: Vec<String> = rules.iter().map(ToString::to_string).collect();
        assert_eq!(
            text,
            [
                "call_exprn ::= expr expr expr expr CALL_3",
                "expr ::= call_exprn",
                "list_exprn ::= expr expr LIST_2",
                "expr ::= list_exprn",
            ]
        );
    }
}
