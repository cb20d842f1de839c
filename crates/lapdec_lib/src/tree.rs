use std::fmt;

use crate::grammar::NodeKind;
use crate::tables::Opcode;
use crate::token::Instruction;

#[derive(Debug, Clone, PartialEq)]
pub enum Node {
    Token(Instruction),
    Tree(Tree),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Tree {
    pub kind: NodeKind,
    pub children: Vec<Node>,
    /// Name of the rewrite that produced this node, if any.
    pub transformed_by: Option<&'static str>,
}

impl Tree {
    pub fn new(kind: NodeKind, children: Vec<Node>) -> Self {
        Self { kind, children, transformed_by: None }
    }
}

impl Node {
    pub fn tree(kind: NodeKind, children: Vec<Node>) -> Node {
        Node::Tree(Tree::new(kind, children))
    }

    pub fn kind_name(&self) -> String {
        match self {
            Node::Token(inst) => inst.name(),
            Node::Tree(t) => t.kind.name().to_string(),
        }
    }

    pub fn is(&self, kind: NodeKind) -> bool {
        matches!(self, Node::Tree(t) if t.kind == kind)
    }

    pub fn is_op(&self, op: Opcode) -> bool {
        matches!(self, Node::Token(inst) if inst.is(op))
    }

    pub fn as_tree(&self) -> Option<&Tree> {
        match self {
            Node::Tree(t) => Some(t),
            Node::Token(_) => None,
        }
    }

    pub fn as_token(&self) -> Option<&Instruction> {
        match self {
            Node::Token(inst) => Some(inst),
            Node::Tree(_) => None,
        }
    }

    pub fn children(&self) -> &[Node] {
        match self {
            Node::Tree(t) => &t.children,
            Node::Token(_) => &[],
        }
    }

    pub fn child(&self, i: usize) -> Option<&Node> {
        self.children().get(i)
    }

    pub fn at(&self, path: &[usize]) -> Option<&Node> {
        path.iter().try_fold(self, |node, &i| node.child(i))
    }

    /// Unwrap single-child `expr`/`expr_stacked` wrappers.
    pub fn unwrap_expr(&self) -> &Node {
        let mut node = self;
        while (node.is(NodeKind::Expr) || node.is(NodeKind::ExprStacked)) && node.children().len() == 1 {
            node = &node.children()[0];
        }
        node
    }

    pub fn tokens(&self) -> Vec<&Instruction> {
        let mut out = Vec::new();
        self.collect_tokens(&mut out);
        out
    }

    fn collect_tokens<'a>(&'a self, out: &mut Vec<&'a Instruction>) {
        match self {
            Node::Token(inst) => out.push(inst),
            Node::Tree(t) => t.children.iter().for_each(|c| c.collect_tokens(out)),
        }
    }

    pub fn first_token(&self) -> Option<&Instruction> {
        match self {
            Node::Token(inst) => Some(inst),
            Node::Tree(t) => t.children.iter().find_map(Node::first_token),
        }
    }

    fn write_indented(&self, f: &mut fmt::Formatter<'_>, depth: usize, index: Option<usize>) -> fmt::Result {
        let pad = "  ".repeat(depth);
        let prefix = index.map(|i| format!("{i}. ")).unwrap_or_default();
        match self {
            Node::Token(inst) => writeln!(f, "{pad}{prefix}{}", inst.to_string().trim_start()),
            Node::Tree(t) => {
                let tag = t.transformed_by.map(|by| format!(" (transformed by {by})")).unwrap_or_default();
                writeln!(f, "{pad}{prefix}{} ({}){tag}", t.kind, t.children.len())?;
                for (i, child) in t.children.iter().enumerate() {
                    child.write_indented(f, depth + 1, Some(i))?;
                }
                Ok(())
            }
        }
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.write_indented(f, 0, None)
    }
}
