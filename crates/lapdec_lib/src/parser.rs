//! Earley recognizer over instruction kinds. Checks that need only a span
//! prune completions; checks that need the children run during extraction.

use std::collections::{HashMap, HashSet};

use log::debug;
use thiserror::Error;

use crate::LapError;
use crate::grammar::{self, GrammarRule, NodeKind, Symbol};
use crate::tables::Opcode;
use crate::token::{EffectTable, Instruction};
use crate::tree::Node;

/// Splits tried per rule before the extractor gives up on it.
const MAX_CANDIDATES: usize = 64;
const MAX_STEPS: usize = 4096;

/// Instructions after which a net-positive statement may end.
const STATEMENT_END: &[Opcode] = &[
    Opcode::Return,
    Opcode::StackAccess,
    Opcode::Unbind,
    Opcode::ComeFrom,
    Opcode::Goto,
    Opcode::Label,
    Opcode::Dup,
    Opcode::GotoIfNotNil,
];

/// Instructions that may directly precede a plain assignment.
const ASSIGNMENT_PREDECESSORS: &[Opcode] = &[
    Opcode::Label,
    Opcode::ComeFrom,
    Opcode::Varset,
    Opcode::Varbind,
    Opcode::Discard,
    Opcode::Unbind,
    Opcode::Return,
    Opcode::SaveExcursion,
    Opcode::SaveRestriction,
    Opcode::SaveCurrentBuffer,
    Opcode::UnwindProtect,
];

#[derive(Debug, Clone, PartialEq, Error)]
#[error("parse error at or near `{token}' instruction at offset {offset}")]
pub struct ParseError {
    pub token: String,
    pub offset: u32,
    /// Instructions around the failure, the offending one marked with `-> `.
    pub context: Vec<String>,
}

impl ParseError {
    fn at(tokens: &[Instruction], index: usize) -> Self {
        let Some(tok) = tokens.get(index) else {
            return ParseError {
                token: "<end>".to_string(),
                offset: 0,
                context: Vec::new(),
            };
        };
        let mut start = index;
        while start > 0 && index - start < 10 && !tokens[start].is(Opcode::Label) {
            start -= 1;
        }
        let mut end = index + 1;
        while end < tokens.len() && end - index < 10 && !tokens[end].is(Opcode::Label) {
            end += 1;
        }
        let context = (start..end)
            .map(|i| {
                let mark = if i == index { "-> " } else { "   " };
                format!("{mark}{}", tokens[i])
            })
            .collect();
        ParseError {
            token: tok.name(),
            offset: tok.offset,
            context,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Sym {
    T(u32),
    N(NodeKind),
}

#[derive(Debug, Clone)]
pub struct Grammar {
    rules: Vec<GrammarRule>,
    compiled: Vec<Vec<Sym>>,
    by_lhs: HashMap<NodeKind, Vec<usize>>,
    nullable: HashSet<NodeKind>,
    terminals: HashMap<String, u32>,
}

impl Grammar {
    pub fn new(rules: impl IntoIterator<Item = GrammarRule>) -> Self {
        let mut seen = HashSet::new();
        let rules: Vec<GrammarRule> = rules.into_iter().filter(|r| seen.insert(r.clone())).collect();

        let mut terminals = HashMap::new();
        let mut by_lhs: HashMap<NodeKind, Vec<usize>> = HashMap::new();
        let mut compiled: Vec<Vec<Sym>> = Vec::with_capacity(rules.len());
        for (i, rule) in rules.iter().enumerate() {
            by_lhs.entry(rule.lhs).or_default().push(i);
            let syms: Vec<Sym> = rule
                .rhs
                .iter()
                .map(|s| match s {
                    Symbol::Nonterminal(n) => Sym::N(*n),
                    Symbol::Terminal(t) => {
                        let next = terminals.len() as u32;
                        Sym::T(*terminals.entry(t.clone()).or_insert(next))
                    }
                })
                .collect();
            compiled.push(syms);
        }

        let mut nullable = HashSet::new();
        loop {
            let before = nullable.len();
            for (rule, syms) in rules.iter().zip(&compiled) {
                let empty = syms.iter().all(|s| matches!(s, Sym::N(n) if nullable.contains(n)));
                if empty {
                    nullable.insert(rule.lhs);
                }
            }
            if nullable.len() == before {
                break;
            }
        }

        Self {
            rules,
            compiled,
            by_lhs,
            nullable,
            terminals,
        }
    }

    pub fn with_base(extra: &[GrammarRule]) -> Result<Self, LapError> {
        let mut rules = grammar::base_rules()?;
        rules.extend_from_slice(extra);
        Ok(Self::new(rules))
    }

    fn rules_for(&self, lhs: NodeKind) -> &[usize] {
        self.by_lhs.get(&lhs).map(Vec::as_slice).unwrap_or(&[])
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct Item {
    rule: usize,
    dot: usize,
    origin: usize,
}

impl Item {
    fn advance(self) -> Item {
        Item { dot: self.dot + 1, ..self }
    }
}

struct Chart {
    sets: Vec<Vec<Item>>,
    seen: Vec<HashSet<Item>>,
    completed: HashSet<(NodeKind, usize, usize)>,
    /// `(nonterminal, start)` to the ends it was completed at, longest first.
    ends: HashMap<(NodeKind, usize), Vec<usize>>,
}

impl Chart {
    fn new(n: usize) -> Self {
        Self {
            sets: vec![Vec::new(); n + 1],
            seen: vec![HashSet::new(); n + 1],
            completed: HashSet::new(),
            ends: HashMap::new(),
        }
    }

    fn add(&mut self, i: usize, item: Item) {
        if self.seen[i].insert(item) {
            self.sets[i].push(item);
        }
    }

    fn complete(&mut self, lhs: NodeKind, start: usize, end: usize) {
        if self.completed.insert((lhs, start, end)) {
            self.ends.entry((lhs, start)).or_default().push(end);
        }
    }

    fn finish(&mut self) {
        for ends in self.ends.values_mut() {
            ends.sort_unstable_by(|a, b| b.cmp(a));
        }
    }
}

struct Context<'a> {
    tokens: &'a [Instruction],
    labels: HashMap<&'a str, u32>,
    effects: &'a EffectTable,
}

impl<'a> Context<'a> {
    fn new(tokens: &'a [Instruction], effects: &'a EffectTable) -> Self {
        let labels = tokens
            .iter()
            .filter(|t| t.is(Opcode::Label))
            .filter_map(|t| Some((t.attr_text()?, t.offset)))
            .collect();
        Self { tokens, labels, effects }
    }

    fn is_at(&self, index: usize, op: Opcode) -> bool {
        self.tokens.get(index).is_some_and(|t| t.is(op))
    }

    fn jump_target(&self, jump: &Node) -> Option<u32> {
        let label = jump.as_token()?.attr_text()?;
        self.labels.get(label).copied()
    }

    fn span_invalid(&self, lhs: NodeKind, first: usize, last: usize) -> bool {
        match lhs {
            NodeKind::ExprStmt => {
                let net = self.effects.net(&self.tokens[first..last]);
                let terminated = match self.tokens.get(last) {
                    None => true,
                    Some(next) => STATEMENT_END.iter().any(|&op| next.is(op)),
                };
                !(net == 0 || (net > 0 && terminated))
            }
            NodeKind::SetqForm => {
                first > 0 && {
                    let prev = &self.tokens[first - 1];
                    !(prev.kind.is_jump() || ASSIGNMENT_PREDECESSORS.iter().any(|&op| prev.is(op)))
                }
            }
            NodeKind::UnaryExprStacked => first > 0 && !self.tokens[first - 1].is(Opcode::Varset),
            NodeKind::SaveCurrentBufferForm => {
                self.is_at(first + 1, Opcode::Varref)
                    && self.is_at(first + 2, Opcode::SetBuffer)
                    && self.is_at(first + 3, Opcode::Discard)
            }
            _ => false,
        }
    }

    fn tree_invalid(&self, lhs: NodeKind, children: &[Node], last: usize) -> bool {
        match lhs {
            NodeKind::Clause => {
                let has_condition = children.first().is_some_and(|c| c.is(NodeKind::Condition));
                let ends_with_come_from = children
                    .last()
                    .and_then(|end| end.children().last())
                    .is_some_and(|n| n.is_op(Opcode::ComeFrom));
                has_condition != ends_with_come_from
            }
            NodeKind::CondForm if children.len() == 2 => {
                let mut clauses = vec![&children[0]];
                clauses.extend(children[1].children().iter().filter_map(|lc| lc.child(1)));
                !clauses.iter().all(|clause| {
                    clause
                        .children()
                        .last()
                        .and_then(|end| end.child(0))
                        .is_some_and(|n| n.is_op(Opcode::Return) || n.is(NodeKind::StackedReturn))
                })
            }
            NodeKind::IfForm => {
                let bare_name = children.get(2).is_some_and(|then| then.unwrap_expr().is(NodeKind::NameExpr));
                bare_name || self.misaligned(children.get(1), last)
            }
            NodeKind::WhenMacro | NodeKind::AndForm | NodeKind::OrForm => self.misaligned(children.get(1), last),
            NodeKind::IfElseForm => {
                let targets = |jump: usize, label: usize| -> bool {
                    let to = children.get(jump).and_then(Node::as_token).and_then(Instruction::attr_text);
                    let at = children.get(label).and_then(Node::as_token).and_then(Instruction::attr_text);
                    to.is_some() && to == at
                };
                !(targets(1, 5) && targets(3, 8))
            }
            NodeKind::WhileForm2 => children.get(2).is_some_and(starts_stacked),
            _ => false,
        }
    }

    /// A conditional jump whose target is not where the form ends.
    fn misaligned(&self, jump: Option<&Node>, last: usize) -> bool {
        let target = jump.and_then(|j| self.jump_target(j));
        let next = self.tokens.get(last).map(|t| t.offset);
        target.is_none() || target != next
    }
}

/// Whether the leftmost path of `node` goes through a stacked form.
fn starts_stacked(node: &Node) -> bool {
    let mut node = node;
    loop {
        if node.is_op(Opcode::StackAccess) || node.kind_name().ends_with("_stacked") {
            return true;
        }
        match node.child(0) {
            Some(first) => node = first,
            None => return false,
        }
    }
}

pub struct Parser {
    grammar: Grammar,
    effects: EffectTable,
    trace: bool,
    reductions: Vec<String>,
}

impl Parser {
    pub fn new(grammar: Grammar) -> Self {
        Self {
            grammar,
            effects: EffectTable::default(),
            trace: false,
            reductions: Vec::new(),
        }
    }

    pub fn with_trace(mut self, on: bool) -> Self {
        self.trace = on;
        self
    }

    pub fn reductions(&self) -> &[String] {
        &self.reductions
    }

    pub fn parse(&mut self, tokens: &[Instruction], start: NodeKind) -> Result<Node, ParseError> {
        self.reductions.clear();
        let ctx = Context::new(tokens, &self.effects);
        let syms: Vec<Option<u32>> = tokens.iter().map(|t| self.grammar.terminals.get(&t.name()).copied()).collect();

        let chart = self.recognize(&ctx, &syms, start)?;
        let mut ex = Extractor {
            grammar: &self.grammar,
            ctx: &ctx,
            syms: &syms,
            chart: &chart,
            memo: HashMap::new(),
            active: HashSet::new(),
            rejected_at: None,
        };
        let tree = ex.build(start, 0, tokens.len()).ok_or_else(|| {
            let at = ex.rejected_at.unwrap_or(tokens.len().saturating_sub(1));
            ParseError::at(tokens, at)
        })?;
        debug!("parsed {} instructions into {}", tokens.len(), start);

        if self.trace {
            trace_reductions(&tree, &mut self.reductions);
        }
        Ok(tree)
    }

    fn recognize(&self, ctx: &Context<'_>, syms: &[Option<u32>], start: NodeKind) -> Result<Chart, ParseError> {
        let g = &self.grammar;
        let n = syms.len();
        let mut chart = Chart::new(n);
        for &rule in g.rules_for(start) {
            chart.add(0, Item { rule, dot: 0, origin: 0 });
        }

        for i in 0..=n {
            let mut k = 0;
            while k < chart.sets[i].len() {
                let item = chart.sets[i][k];
                k += 1;
                match g.compiled[item.rule].get(item.dot) {
                    Some(Sym::N(x)) => {
                        for &rule in g.rules_for(*x) {
                            chart.add(i, Item { rule, dot: 0, origin: i });
                        }
                        if g.nullable.contains(x) {
                            chart.add(i, item.advance());
                        }
                    }
                    Some(Sym::T(t)) => {
                        if i < n && syms[i] == Some(*t) {
                            chart.add(i + 1, item.advance());
                        }
                    }
                    None => {
                        let lhs = g.rules[item.rule].lhs;
                        if ctx.span_invalid(lhs, item.origin, i) {
                            continue;
                        }
                        chart.complete(lhs, item.origin, i);
                        let parents: Vec<Item> = chart.sets[item.origin]
                            .iter()
                            .filter(|p| g.compiled[p.rule].get(p.dot) == Some(&Sym::N(lhs)))
                            .copied()
                            .collect();
                        for parent in parents {
                            chart.add(i, parent.advance());
                        }
                    }
                }
            }
        }

        if !chart.completed.contains(&(start, 0, n)) {
            let furthest = (0..=n).rev().find(|&i| !chart.sets[i].is_empty()).unwrap_or(0);
            return Err(ParseError::at(ctx.tokens, furthest.min(n.saturating_sub(1))));
        }
        chart.finish();
        Ok(chart)
    }
}

struct Extractor<'a> {
    grammar: &'a Grammar,
    ctx: &'a Context<'a>,
    syms: &'a [Option<u32>],
    chart: &'a Chart,
    memo: HashMap<(NodeKind, usize, usize), Option<Node>>,
    active: HashSet<(NodeKind, usize, usize)>,
    rejected_at: Option<usize>,
}

#[derive(Default)]
struct Budget {
    steps: usize,
    candidates: usize,
}

impl Budget {
    fn spend(&mut self) -> bool {
        self.steps += 1;
        !self.exhausted()
    }

    fn exhausted(&self) -> bool {
        self.steps > MAX_STEPS || self.candidates >= MAX_CANDIDATES
    }
}

impl Extractor<'_> {
    fn build(&mut self, nt: NodeKind, first: usize, last: usize) -> Option<Node> {
        let key = (nt, first, last);
        if let Some(done) = self.memo.get(&key) {
            return done.clone();
        }
        if !self.active.insert(key) {
            return None;
        }
        let g = self.grammar;
        let mut found = None;
        for &rule in g.rules_for(nt) {
            let mut children = Vec::new();
            let mut budget = Budget::default();
            if self.split(rule, first, 0, first, last, &mut children, &mut budget) {
                found = Some(make_node(&g.rules[rule], children));
                break;
            }
            if budget.exhausted() {
                debug!(
                    "extraction budget exhausted for {} over {first}..{last} ({} steps, {} candidates)",
                    g.rules[rule], budget.steps, budget.candidates
                );
            }
        }
        self.active.remove(&key);
        self.memo.insert(key, found.clone());
        found
    }

    /// Assign spans to the symbols of `rule` from `idx` on, preferring the
    /// longest span for each symbol.
    #[allow(clippy::too_many_arguments)]
    fn split(
        &mut self,
        rule: usize,
        first: usize,
        idx: usize,
        pos: usize,
        last: usize,
        acc: &mut Vec<Node>,
        budget: &mut Budget,
    ) -> bool {
        if !budget.spend() {
            return false;
        }
        let g = self.grammar;
        let rhs = &g.compiled[rule];
        if idx == rhs.len() {
            if pos != last {
                return false;
            }
            budget.candidates += 1;
            if self.ctx.tree_invalid(g.rules[rule].lhs, acc, last) {
                self.rejected_at = Some(self.rejected_at.map_or(first, |r| r.max(first)));
                return false;
            }
            return true;
        }

        match rhs[idx] {
            Sym::T(t) => {
                if pos < last && self.syms[pos] == Some(t) {
                    acc.push(Node::Token(self.ctx.tokens[pos].clone()));
                    if self.split(rule, first, idx + 1, pos + 1, last, acc, budget) {
                        return true;
                    }
                    acc.pop();
                }
                false
            }
            Sym::N(x) => {
                let chart = self.chart;
                let mut ends: Vec<usize> = chart
                    .ends
                    .get(&(x, pos))
                    .map(|v| v.iter().copied().filter(|&e| e <= last).collect())
                    .unwrap_or_default();
                if g.nullable.contains(&x) && !ends.contains(&pos) {
                    ends.push(pos);
                }
                if idx + 1 == rhs.len() {
                    ends.retain(|&e| e == last);
                }
                for end in ends {
                    if let Some(node) = self.build(x, pos, end) {
                        acc.push(node);
                        if self.split(rule, first, idx + 1, end, last, acc, budget) {
                            return true;
                        }
                        acc.pop();
                    }
                }
                false
            }
        }
    }
}

fn make_node(rule: &GrammarRule, children: Vec<Node>) -> Node {
    if grammar::is_collected(rule.lhs) && rule.is_left_recursive_pair() {
        let mut it = children.into_iter();
        let mut flat = match it.next() {
            Some(Node::Tree(head)) => head.children,
            Some(other) => vec![other],
            None => Vec::new(),
        };
        flat.extend(it);
        return Node::tree(rule.lhs, flat);
    }
    Node::tree(rule.lhs, children)
}

fn trace_reductions(node: &Node, out: &mut Vec<String>) {
    let Some(tree) = node.as_tree() else { return };
    tree.children.iter().for_each(|c| trace_reductions(c, out));
    let tokens = node.tokens();
    let span = match (tokens.first(), tokens.last()) {
        (Some(a), Some(b)) => format!("{}-{}", a.offset, b.offset),
        _ => "empty".to_string(),
    };
    let rhs: Vec<String> = tree.children.iter().map(Node::kind_name).collect();
    out.push(format!("{span:>9} {} ::= {}", tree.kind, rhs.join(" ")));
}

pub fn parse(instructions: &[Instruction], start_symbol: &str, extra_rules: &[GrammarRule]) -> Result<Node, LapError> {
    let start = NodeKind::from_name(start_symbol)
        .ok_or_else(|| LapError::Grammar(format!("unknown start symbol `{start_symbol}`")))?;
    let mut parser = Parser::new(Grammar::with_base(extra_rules)?);
    Ok(parser.parse(instructions, start)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bb;
    use crate::scanner::scan;
    use crate::token::Value;

    fn tokens(listing: &str) -> Vec<Instruction> {
        let f = scan(listing).unwrap().remove(0);
        let effects = EffectTable::default();
        let seg = bb::segment(&f.instructions, &effects).unwrap();
        bb::ingest(&seg, &effects)
    }

    fn parse_listing(listing: &str) -> Result<Node, LapError> {
        let toks = tokens(listing);
        let extra = grammar::synthesize_rules(&toks);
        parse(&toks, "fn_body", &extra)
    }

    fn find<'a>(node: &'a Node, kind: NodeKind) -> Option<&'a Node> {
        if node.is(kind) {
            return Some(node);
        }
        node.children().iter().find_map(|c| find(c, kind))
    }

    #[test]
    fn assignment_statement() {
        let tree = parse_listing("0 varref x\n1 constant 1\n2 plus\n3 varset x\n4 return\n").unwrap();
        let setq = find(&tree, NodeKind::SetqForm).unwrap();
        assert!(setq.child(0).unwrap().unwrap_expr().is(NodeKind::BinaryExpr));
        assert_eq!(setq.child(1).and_then(Node::as_token).and_then(Instruction::attr_text), Some("x"));
    }

    #[test]
    fn if_else_from_two_branches() {
        let listing = "\
0 varref a
1 goto-if-nil 1
2 constant 1
3 goto 2
4:1 constant 2
5:2 return
";
        let tree = parse_listing(listing).unwrap();
        let form = find(&tree, NodeKind::IfElseForm).unwrap();
        assert_eq!(form.children().len(), 9);
        assert!(find(&tree, NodeKind::StackedReturn).is_some());
    }

    #[test]
    fn call_uses_synthesized_rule() {
        let listing = "0 constant foo\n1 varref a\n2 varref b\n3 varref c\n4 call 3\n5 return\n";
        let tree = parse_listing(listing).unwrap();
        let call = find(&tree, NodeKind::VarArity(crate::token::Family::Call)).unwrap();
        assert_eq!(call.children().len(), 5);
        assert_eq!(call.child(4).map(Node::kind_name).as_deref(), Some("CALL_3"));
    }

    #[test]
    fn statement_lists_are_flattened() {
        let listing = "\
0 constant 1
1 varset a
2 constant 2
3 varset b
4 constant 3
5 varset c
6 constant nil
7 return
";
        let tree = parse_listing(listing).unwrap();
        let exprs = find(&tree, NodeKind::Exprs).unwrap();
        assert_eq!(exprs.children().len(), 4);
        assert!(exprs.children().iter().all(|c| c.is(NodeKind::ExprStmt)));
    }

    #[test]
    fn tail_cond_clauses() {
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
        let tree = parse_listing(listing).unwrap();
        let cond = find(&tree, NodeKind::CondForm).unwrap();
        assert_eq!(cond.child(1).map(|c| c.children().len()), Some(2));
    }

    #[test]
    fn unparsable_stream_reports_offending_instruction() {
        let toks = vec![
            Instruction::op(Opcode::Varref, Some(Value::Symbol("a".into())), 0),
            Instruction::op(Opcode::Unbind, Some(Value::Int(1)), 1),
            Instruction::op(Opcode::Return, None, 2),
        ];
        let err = parse(&toks, "fn_body", &[]).unwrap_err();
        match err {
            LapError::Parse(e) => {
                assert_eq!(e.token, "UNBIND");
                assert_eq!(e.offset, 1);
                assert!(e.context.iter().any(|l| l.starts_with("-> ")));
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn expr_stmt_rejects_unterminated_values() {
        let toks = vec![
            Instruction::op(Opcode::Varref, Some(Value::Symbol("a".into())), 0),
            Instruction::op(Opcode::Varref, Some(Value::Symbol("b".into())), 1),
        ];
        let effects = EffectTable::default();
        let ctx = Context::new(&toks, &effects);
        assert!(ctx.span_invalid(NodeKind::ExprStmt, 0, 1));
        assert!(!ctx.span_invalid(NodeKind::ExprStmt, 1, 2));
    }

    #[test]
    fn trace_lists_reductions() {
        let toks = tokens("0 constant 5\n1 return\n");
        let mut parser = Parser::new(Grammar::with_base(&[]).unwrap()).with_trace(true);
        parser.parse(&toks, NodeKind::FnBody).unwrap();
        let last = parser.reductions().last().unwrap();
        assert!(last.ends_with("fn_body ::= body opt_label opt_return"), "{last}");
    }

    #[test]
    fn budget_runs_out_after_max_steps() {
        let mut budget = Budget::default();
        let spent = std::iter::repeat_with(|| budget.spend()).take_while(|ok| *ok).count();
        assert_eq!(spent, MAX_STEPS);
        assert!(budget.exhausted());

        let mut budget = Budget {
            candidates: MAX_CANDIDATES,
            ..Budget::default()
        };
        assert!(!budget.spend());
    }
}
