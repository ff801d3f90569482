//! Abstract syntax tree.
//!
//! Nodes are a uniform shape: a kind, child nodes, an optional string
//! payload (identifiers, string literals), an optional numeric payload
//! (number literals) and the 1-based source line they started on. The
//! compiler dispatches on `AstKind`; the pretty-printer re-emits parseable
//! source so a tree can round-trip through the parser.

use std::fmt::Write as _;

use strum::{Display, IntoStaticStr};

/// Every node kind the parser produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, IntoStaticStr)]
pub enum AstKind {
    Module,
    StatList,
    Block,

    VarDecl,
    ConstDecl,
    Assign,
    If,
    While,
    /// `for x in iterable { … }` over an array or object keys.
    For,
    /// `for k, v in object { … }`.
    For2,
    /// `for i in a .. b { … }`.
    ForInt,
    Return,

    Call,
    ArgList,
    Index,
    Access,
    FuncLiteral,
    ParamDef,

    NumLiteral,
    StringLiteral,
    ArrayLiteral,
    ObjectLiteral,
    Identifier,

    Ternary,
    Or,
    And,
    BitOr,
    BitXor,
    BitAnd,
    Equal,
    NotEqual,
    LessEq,
    GreaterEq,
    Less,
    Greater,
    Shl,
    Shr,
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Pow,

    Negate,
    Not,
    BitNot,
    Len,
}

/// One AST node.
#[derive(Debug, Clone)]
pub struct AstNode {
    pub kind: AstKind,
    pub children: Vec<AstNode>,
    /// Identifier or string-literal text; empty for other kinds.
    pub text: Box<str>,
    /// Number-literal payload; zero for other kinds.
    pub number: f64,
    /// 1-based source line the node started on.
    pub line: u32,
}

impl AstNode {
    #[must_use]
    pub fn new(kind: AstKind, line: u32) -> Self {
        Self {
            kind,
            children: Vec::new(),
            text: Box::from(""),
            number: 0.0,
            line,
        }
    }

    #[must_use]
    pub fn with_children(kind: AstKind, children: Vec<AstNode>, line: u32) -> Self {
        Self {
            kind,
            children,
            text: Box::from(""),
            number: 0.0,
            line,
        }
    }

    #[must_use]
    pub fn identifier(text: &str, line: u32) -> Self {
        Self {
            kind: AstKind::Identifier,
            children: Vec::new(),
            text: Box::from(text),
            number: 0.0,
            line,
        }
    }

    #[must_use]
    pub fn number(value: f64, line: u32) -> Self {
        Self {
            kind: AstKind::NumLiteral,
            children: Vec::new(),
            text: Box::from(""),
            number: value,
            line,
        }
    }

    #[must_use]
    pub fn string(text: &str, line: u32) -> Self {
        Self {
            kind: AstKind::StringLiteral,
            children: Vec::new(),
            text: Box::from(text),
            number: 0.0,
            line,
        }
    }

    /// Structural equality: kinds, payloads and children, ignoring source
    /// lines. This is what "the same program" means for round-trip tests.
    #[must_use]
    pub fn structurally_eq(&self, other: &Self) -> bool {
        self.kind == other.kind
            && self.text == other.text
            && self.number.to_bits() == other.number.to_bits()
            && self.children.len() == other.children.len()
            && self
                .children
                .iter()
                .zip(&other.children)
                .all(|(a, b)| a.structurally_eq(b))
    }

    /// Renders the tree as an indented kind dump, for the `-A` CLI flag.
    #[must_use]
    pub fn dump(&self) -> String {
        let mut out = String::new();
        self.dump_into(&mut out, 0);
        out
    }

    fn dump_into(&self, out: &mut String, depth: usize) {
        for _ in 0..depth {
            out.push_str("  ");
        }
        out.push_str(self.kind.into());
        match self.kind {
            AstKind::Identifier | AstKind::StringLiteral => {
                let _ = write!(out, " {:?}", &*self.text);
            }
            AstKind::NumLiteral => {
                let _ = write!(out, " {}", self.number);
            }
            AstKind::FuncLiteral if self.children.len() == 3 => {
                let _ = write!(out, " {}", self.children[2].text);
            }
            _ => {}
        }
        out.push('\n');
        for child in &self.children {
            child.dump_into(out, depth + 1);
        }
    }

    /// Re-emits the tree as source text that parses back to a structurally
    /// equal tree. Expressions are fully parenthesized, which the parser
    /// strips away again.
    #[must_use]
    pub fn pretty(&self) -> String {
        let mut out = String::new();
        self.pretty_into(&mut out, 0);
        out
    }

    fn pretty_into(&self, out: &mut String, depth: usize) {
        match self.kind {
            AstKind::Module | AstKind::StatList => {
                for child in &self.children {
                    indent(out, depth);
                    child.pretty_into(out, depth);
                    out.push('\n');
                }
            }
            AstKind::Block => {
                out.push_str("{\n");
                for stat in &self.children[0].children {
                    indent(out, depth + 1);
                    stat.pretty_into(out, depth + 1);
                    out.push('\n');
                }
                indent(out, depth);
                out.push('}');
            }
            AstKind::VarDecl | AstKind::ConstDecl => {
                let kw = if self.kind == AstKind::VarDecl { "let" } else { "const" };
                let _ = write!(out, "{kw} {} = ", self.children[0].text);
                self.children[1].pretty_into(out, depth);
            }
            AstKind::Assign => {
                self.children[0].pretty_into(out, depth);
                out.push_str(" = ");
                self.children[1].pretty_into(out, depth);
            }
            AstKind::If => {
                out.push_str("if ");
                self.children[0].pretty_into(out, depth);
                out.push(' ');
                self.children[1].pretty_into(out, depth);
                if let Some(alt) = self.children.get(2) {
                    out.push_str(" else ");
                    alt.pretty_into(out, depth);
                }
            }
            AstKind::While => {
                out.push_str("while ");
                self.children[0].pretty_into(out, depth);
                out.push(' ');
                self.children[1].pretty_into(out, depth);
            }
            AstKind::For => {
                let _ = write!(out, "for {} in ", self.children[0].text);
                self.children[1].pretty_into(out, depth);
                out.push(' ');
                self.children[2].pretty_into(out, depth);
            }
            AstKind::For2 => {
                let _ = write!(out, "for {}, {} in ", self.children[0].text, self.children[1].text);
                self.children[2].pretty_into(out, depth);
                out.push(' ');
                self.children[3].pretty_into(out, depth);
            }
            AstKind::ForInt => {
                let _ = write!(out, "for {} in ", self.children[0].text);
                self.children[1].pretty_into(out, depth);
                out.push_str(" .. ");
                self.children[2].pretty_into(out, depth);
                out.push(' ');
                self.children[3].pretty_into(out, depth);
            }
            AstKind::Return => {
                out.push_str("return");
                if let Some(value) = self.children.first() {
                    out.push(' ');
                    value.pretty_into(out, depth);
                }
            }
            AstKind::Call => {
                self.children[0].pretty_into(out, depth);
                out.push('(');
                for (i, arg) in self.children[1].children.iter().enumerate() {
                    if i > 0 {
                        out.push_str(", ");
                    }
                    arg.pretty_into(out, depth);
                }
                out.push(')');
            }
            AstKind::ArgList => {}
            AstKind::Index => {
                self.children[0].pretty_into(out, depth);
                out.push('[');
                self.children[1].pretty_into(out, depth);
                out.push(']');
            }
            AstKind::Access => {
                self.children[0].pretty_into(out, depth);
                out.push('.');
                out.push_str(&self.children[1].text);
            }
            AstKind::FuncLiteral => {
                out.push_str("fn");
                if let Some(name) = self.children.get(2) {
                    let _ = write!(out, " {}", name.text);
                }
                out.push('(');
                for (i, param) in self.children[0].children.iter().enumerate() {
                    if i > 0 {
                        out.push_str(", ");
                    }
                    out.push_str(&param.text);
                }
                out.push_str(") ");
                self.children[1].pretty_into(out, depth);
            }
            AstKind::ParamDef => {}
            AstKind::NumLiteral => {
                if self.number.trunc() == self.number && self.number.abs() < 1e15 {
                    let _ = write!(out, "{}", self.number as i64);
                } else {
                    out.push_str(ryu::Buffer::new().format(self.number));
                }
            }
            AstKind::StringLiteral => {
                out.push('"');
                for c in self.text.chars() {
                    match c {
                        '"' => out.push_str("\\\""),
                        '\\' => out.push_str("\\\\"),
                        '\n' => out.push_str("\\n"),
                        '\t' => out.push_str("\\t"),
                        '\r' => out.push_str("\\r"),
                        c => out.push(c),
                    }
                }
                out.push('"');
            }
            AstKind::ArrayLiteral => {
                out.push('[');
                for (i, elem) in self.children.iter().enumerate() {
                    if i > 0 {
                        out.push_str(", ");
                    }
                    elem.pretty_into(out, depth);
                }
                out.push(']');
            }
            AstKind::ObjectLiteral => {
                out.push('{');
                for (i, pair) in self.children.iter().enumerate() {
                    if i > 0 {
                        out.push(',');
                    }
                    let _ = write!(out, " {} = ", pair.children[0].text);
                    pair.children[1].pretty_into(out, depth);
                }
                if self.children.is_empty() {
                    out.push('}');
                } else {
                    out.push_str(" }");
                }
            }
            AstKind::Identifier => out.push_str(&self.text),
            AstKind::Ternary => {
                out.push('(');
                self.children[0].pretty_into(out, depth);
                out.push_str(" ? ");
                self.children[1].pretty_into(out, depth);
                out.push_str(" : ");
                self.children[2].pretty_into(out, depth);
                out.push(')');
            }
            AstKind::Negate | AstKind::Not | AstKind::BitNot | AstKind::Len => {
                out.push('(');
                out.push_str(unary_symbol(self.kind));
                self.children[0].pretty_into(out, depth);
                out.push(')');
            }
            _ => {
                out.push('(');
                self.children[0].pretty_into(out, depth);
                let _ = write!(out, " {} ", binary_symbol(self.kind));
                self.children[1].pretty_into(out, depth);
                out.push(')');
            }
        }
    }
}

fn indent(out: &mut String, depth: usize) {
    for _ in 0..depth {
        out.push_str("  ");
    }
}

fn unary_symbol(kind: AstKind) -> &'static str {
    match kind {
        AstKind::Negate => "-",
        AstKind::Not => "!",
        AstKind::BitNot => "~",
        AstKind::Len => "#",
        _ => unreachable!("not a unary operator"),
    }
}

fn binary_symbol(kind: AstKind) -> &'static str {
    match kind {
        AstKind::Or => "||",
        AstKind::And => "&&",
        AstKind::BitOr => "|",
        AstKind::BitXor => "^",
        AstKind::BitAnd => "&",
        AstKind::Equal => "==",
        AstKind::NotEqual => "!=",
        AstKind::LessEq => "<=",
        AstKind::GreaterEq => ">=",
        AstKind::Less => "<",
        AstKind::Greater => ">",
        AstKind::Shl => "<<",
        AstKind::Shr => ">>",
        AstKind::Add => "+",
        AstKind::Sub => "-",
        AstKind::Mul => "*",
        AstKind::Div => "/",
        AstKind::Mod => "%",
        AstKind::Pow => "**",
        _ => unreachable!("not a binary operator"),
    }
}
