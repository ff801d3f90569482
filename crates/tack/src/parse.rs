//! Recursive-descent parser.
//!
//! The parser works directly on the source text with a byte cursor that
//! counts lines as it advances. Every `parse_*` method either consumes a
//! construct and returns `Ok(Some(node))`, restores the cursor and returns
//! `Ok(None)` when the construct is not present, or fails hard with a
//! `ParseError` quoting a prefix of the remaining input. Whitespace
//! (including newlines) is skipped uniformly between tokens; statement
//! terminators do not exist.

use crate::{
    ast::{AstKind, AstNode},
    error::ParseError,
};

/// Keywords are never identifiers.
const KEYWORDS: &[&str] = &["let", "const", "if", "else", "while", "for", "in", "return", "fn"];

/// Parses a whole module. Fails unless the entire input is consumed.
pub fn parse(source: &str) -> Result<AstNode, ParseError> {
    let mut parser = Parser::new(source);
    let stats = parser.parse_stat_list()?;
    parser.skip_whitespace();
    if !parser.at_end() {
        return Err(parser.error("expected end of file"));
    }
    Ok(AstNode::with_children(AstKind::Module, vec![stats], 1))
}

type Parsed = Result<Option<AstNode>, ParseError>;

#[derive(Clone, Copy)]
struct Mark {
    pos: usize,
    line: u32,
}

struct Parser<'src> {
    src: &'src str,
    pos: usize,
    line: u32,
}

impl<'src> Parser<'src> {
    fn new(src: &'src str) -> Self {
        Self { src, pos: 0, line: 1 }
    }

    // ---- cursor primitives -------------------------------------------

    fn at_end(&self) -> bool {
        self.pos >= self.src.len()
    }

    fn rest(&self) -> &'src str {
        &self.src[self.pos..]
    }

    fn mark(&self) -> Mark {
        Mark {
            pos: self.pos,
            line: self.line,
        }
    }

    fn restore(&mut self, mark: Mark) {
        self.pos = mark.pos;
        self.line = mark.line;
    }

    fn advance(&mut self, bytes: usize) {
        for b in self.src.as_bytes()[self.pos..self.pos + bytes].iter() {
            if *b == b'\n' {
                self.line += 1;
            }
        }
        self.pos += bytes;
    }

    fn skip_whitespace(&mut self) {
        while let Some(&b) = self.src.as_bytes().get(self.pos) {
            if b.is_ascii_whitespace() {
                if b == b'\n' {
                    self.line += 1;
                }
                self.pos += 1;
            } else {
                break;
            }
        }
    }

    fn error(&self, message: impl Into<String>) -> ParseError {
        ParseError {
            message: message.into(),
            line: self.line,
            remainder: self.rest().chars().take(32).collect(),
        }
    }

    /// Consumes `text` if it is next (after whitespace) and, when
    /// `excluded` is non-empty, not immediately followed by one of those
    /// bytes. The exclusion is how `=` avoids matching the head of `==`.
    fn eat_op(&mut self, text: &str, excluded: &[u8]) -> bool {
        self.skip_whitespace();
        if !self.rest().starts_with(text) {
            return false;
        }
        if let Some(&next) = self.src.as_bytes().get(self.pos + text.len()) {
            if excluded.contains(&next) {
                return false;
            }
        }
        self.advance(text.len());
        true
    }

    /// Consumes a keyword: the text must not run into identifier characters.
    fn eat_keyword(&mut self, word: &str) -> bool {
        self.skip_whitespace();
        if !self.rest().starts_with(word) {
            return false;
        }
        if let Some(&next) = self.src.as_bytes().get(self.pos + word.len()) {
            if next.is_ascii_alphanumeric() || next == b'_' {
                return false;
            }
        }
        self.advance(word.len());
        true
    }

    // ---- lexical layer -----------------------------------------------

    fn eat_identifier(&mut self) -> Option<&'src str> {
        self.skip_whitespace();
        let bytes = self.src.as_bytes();
        let first = *bytes.get(self.pos)?;
        if !(first.is_ascii_alphabetic() || first == b'_') {
            return None;
        }
        let mut end = self.pos + 1;
        while let Some(&b) = bytes.get(end) {
            if b.is_ascii_alphanumeric() || b == b'_' {
                end += 1;
            } else {
                break;
            }
        }
        let text = &self.src[self.pos..end];
        if KEYWORDS.contains(&text) {
            return None;
        }
        self.advance(end - self.pos);
        Some(text)
    }

    /// Recognizes `digits [. digits] [e|E [+|-] digits]`. The decimal
    /// point is only consumed when a digit follows, so `0 .. 9` range
    /// bounds never swallow the dots.
    fn eat_number(&mut self) -> Option<f64> {
        self.skip_whitespace();
        let bytes = self.src.as_bytes();
        let start = self.pos;
        let mut end = start;
        while bytes.get(end).is_some_and(u8::is_ascii_digit) {
            end += 1;
        }
        if end == start {
            return None;
        }
        if bytes.get(end) == Some(&b'.') && bytes.get(end + 1).is_some_and(u8::is_ascii_digit) {
            end += 1;
            while bytes.get(end).is_some_and(u8::is_ascii_digit) {
                end += 1;
            }
        }
        if matches!(bytes.get(end), Some(&(b'e' | b'E'))) {
            let mut exp_end = end + 1;
            if matches!(bytes.get(exp_end), Some(&(b'+' | b'-'))) {
                exp_end += 1;
            }
            if bytes.get(exp_end).is_some_and(u8::is_ascii_digit) {
                end = exp_end;
                while bytes.get(end).is_some_and(u8::is_ascii_digit) {
                    end += 1;
                }
            }
        }
        let value: f64 = self.src[start..end].parse().ok()?;
        self.advance(end - start);
        Some(value)
    }

    /// Double-quoted string literal with backslash escapes. A missing
    /// closing quote is a hard error.
    fn eat_string_literal(&mut self) -> Result<Option<String>, ParseError> {
        self.skip_whitespace();
        if self.src.as_bytes().get(self.pos) != Some(&b'"') {
            return Ok(None);
        }
        self.advance(1);
        let mut text = String::new();
        let mut chars = self.rest().char_indices();
        while let Some((offset, c)) = chars.next() {
            match c {
                '"' => {
                    self.advance(offset + 1);
                    return Ok(Some(text));
                }
                '\\' => match chars.next() {
                    Some((_, 'n')) => text.push('\n'),
                    Some((_, 't')) => text.push('\t'),
                    Some((_, 'r')) => text.push('\r'),
                    Some((_, '0')) => text.push('\0'),
                    Some((_, other)) => text.push(other),
                    None => break,
                },
                c => text.push(c),
            }
        }
        Err(self.error("expected closing quote '\"'"))
    }

    // ---- statements --------------------------------------------------

    fn parse_stat_list(&mut self) -> Result<AstNode, ParseError> {
        let line = self.line;
        let mut stats = Vec::new();
        while let Some(stat) = self.parse_stat()? {
            stats.push(stat);
        }
        Ok(AstNode::with_children(AstKind::StatList, stats, line))
    }

    fn parse_stat(&mut self) -> Parsed {
        if let Some(node) = self.parse_decl_stat()? {
            return Ok(Some(node));
        }
        if let Some(node) = self.parse_if_stat()? {
            return Ok(Some(node));
        }
        if let Some(node) = self.parse_while_stat()? {
            return Ok(Some(node));
        }
        if let Some(node) = self.parse_for_stat()? {
            return Ok(Some(node));
        }
        if let Some(node) = self.parse_return_stat()? {
            return Ok(Some(node));
        }
        if let Some(node) = self.parse_assign_or_exp_stat()? {
            return Ok(Some(node));
        }
        Ok(None)
    }

    fn parse_decl_stat(&mut self) -> Parsed {
        let line = self.line;
        let kind = if self.eat_keyword("let") {
            AstKind::VarDecl
        } else if self.eat_keyword("const") {
            AstKind::ConstDecl
        } else {
            return Ok(None);
        };
        let Some(name) = self.eat_identifier() else {
            return Err(self.error("expected name after declaration keyword"));
        };
        let name = AstNode::identifier(name, line);
        if !self.eat_op("=", &[b'=']) {
            return Err(self.error("expected '=' in declaration"));
        }
        let Some(value) = self.parse_exp()? else {
            return Err(self.error("expected expression after '='"));
        };
        Ok(Some(AstNode::with_children(kind, vec![name, value], line)))
    }

    fn parse_if_stat(&mut self) -> Parsed {
        let line = self.line;
        if !self.eat_keyword("if") {
            return Ok(None);
        }
        let Some(cond) = self.parse_exp()? else {
            return Err(self.error("expected condition after 'if'"));
        };
        let Some(body) = self.parse_block()? else {
            return Err(self.error("expected block after if condition"));
        };
        let mut children = vec![cond, body];
        if self.eat_keyword("else") {
            if let Some(chained) = self.parse_if_stat()? {
                children.push(chained);
            } else if let Some(alt) = self.parse_block()? {
                children.push(alt);
            } else {
                return Err(self.error("expected block or 'if' after 'else'"));
            }
        }
        Ok(Some(AstNode::with_children(AstKind::If, children, line)))
    }

    fn parse_while_stat(&mut self) -> Parsed {
        let line = self.line;
        if !self.eat_keyword("while") {
            return Ok(None);
        }
        let Some(cond) = self.parse_exp()? else {
            return Err(self.error("expected condition after 'while'"));
        };
        let Some(body) = self.parse_block()? else {
            return Err(self.error("expected block after while condition"));
        };
        Ok(Some(AstNode::with_children(AstKind::While, vec![cond, body], line)))
    }

    /// `for x in e { … }`, `for k, v in e { … }` or `for i in a .. b { … }`.
    fn parse_for_stat(&mut self) -> Parsed {
        let line = self.line;
        if !self.eat_keyword("for") {
            return Ok(None);
        }
        let Some(first) = self.eat_identifier() else {
            return Err(self.error("expected loop variable after 'for'"));
        };
        let first = AstNode::identifier(first, line);
        let second = if self.eat_op(",", &[]) {
            let Some(second) = self.eat_identifier() else {
                return Err(self.error("expected second loop variable after ','"));
            };
            Some(AstNode::identifier(second, line))
        } else {
            None
        };
        if !self.eat_keyword("in") {
            return Err(self.error("expected 'in' in for loop"));
        }
        let Some(iterable) = self.parse_exp()? else {
            return Err(self.error("expected iterable expression in for loop"));
        };
        if let Some(second) = second {
            let Some(body) = self.parse_block()? else {
                return Err(self.error("expected block after for loop header"));
            };
            return Ok(Some(AstNode::with_children(
                AstKind::For2,
                vec![first, second, iterable, body],
                line,
            )));
        }
        if self.eat_op("..", &[]) {
            let Some(bound) = self.parse_exp()? else {
                return Err(self.error("expected range end after '..'"));
            };
            let Some(body) = self.parse_block()? else {
                return Err(self.error("expected block after for loop header"));
            };
            return Ok(Some(AstNode::with_children(
                AstKind::ForInt,
                vec![first, iterable, bound, body],
                line,
            )));
        }
        let Some(body) = self.parse_block()? else {
            return Err(self.error("expected block after for loop header"));
        };
        Ok(Some(AstNode::with_children(
            AstKind::For,
            vec![first, iterable, body],
            line,
        )))
    }

    fn parse_return_stat(&mut self) -> Parsed {
        let line = self.line;
        if !self.eat_keyword("return") {
            return Ok(None);
        }
        let mut children = Vec::new();
        if let Some(value) = self.parse_exp()? {
            children.push(value);
        }
        Ok(Some(AstNode::with_children(AstKind::Return, children, line)))
    }

    fn parse_block(&mut self) -> Parsed {
        let line = self.line;
        if !self.eat_op("{", &[]) {
            return Ok(None);
        }
        let stats = self.parse_stat_list()?;
        if !self.eat_op("}", &[]) {
            return Err(self.error("expected '}' to close block"));
        }
        Ok(Some(AstNode::with_children(AstKind::Block, vec![stats], line)))
    }

    fn parse_assign_or_exp_stat(&mut self) -> Parsed {
        let line = self.line;
        let Some(exp) = self.parse_exp()? else {
            return Ok(None);
        };
        if self.eat_op("=", &[b'=']) {
            let Some(value) = self.parse_exp()? else {
                return Err(self.error("expected expression after '='"));
            };
            return Ok(Some(AstNode::with_children(AstKind::Assign, vec![exp, value], line)));
        }
        Ok(Some(exp))
    }

    // ---- expressions, lowest to highest precedence -------------------

    fn parse_exp(&mut self) -> Parsed {
        self.parse_ternary()
    }

    fn parse_ternary(&mut self) -> Parsed {
        let line = self.line;
        let Some(cond) = self.parse_or()? else {
            return Ok(None);
        };
        if !self.eat_op("?", &[]) {
            return Ok(Some(cond));
        }
        let Some(then) = self.parse_exp()? else {
            return Err(self.error("expected expression after '?'"));
        };
        if !self.eat_op(":", &[]) {
            return Err(self.error("expected ':' in ternary expression"));
        }
        let Some(alt) = self.parse_exp()? else {
            return Err(self.error("expected expression after ':'"));
        };
        Ok(Some(AstNode::with_children(
            AstKind::Ternary,
            vec![cond, then, alt],
            line,
        )))
    }

    /// Shared shape of the left-associative binary levels: parse one
    /// operand at the tighter level, then fold as long as one of `ops`
    /// matches.
    fn parse_binary_level(
        &mut self,
        ops: &[(&str, &[u8], AstKind)],
        next: fn(&mut Self) -> Parsed,
    ) -> Parsed {
        let line = self.line;
        let Some(mut lhs) = next(self)? else {
            return Ok(None);
        };
        'fold: loop {
            for &(op, excluded, kind) in ops {
                if self.eat_op(op, excluded) {
                    let Some(rhs) = next(self)? else {
                        return Err(self.error(format!("expected operand after '{op}'")));
                    };
                    lhs = AstNode::with_children(kind, vec![lhs, rhs], line);
                    continue 'fold;
                }
            }
            return Ok(Some(lhs));
        }
    }

    fn parse_or(&mut self) -> Parsed {
        self.parse_binary_level(&[("||", &[], AstKind::Or)], Self::parse_and)
    }

    fn parse_and(&mut self) -> Parsed {
        self.parse_binary_level(&[("&&", &[], AstKind::And)], Self::parse_bitop)
    }

    fn parse_bitop(&mut self) -> Parsed {
        self.parse_binary_level(
            &[
                ("|", &[b'|'], AstKind::BitOr),
                ("^", &[], AstKind::BitXor),
                ("&", &[b'&'], AstKind::BitAnd),
            ],
            Self::parse_cmp,
        )
    }

    /// Comparisons are non-associative: `a < b < c` is rejected.
    fn parse_cmp(&mut self) -> Parsed {
        const OPS: &[(&str, &[u8], AstKind)] = &[
            ("==", &[], AstKind::Equal),
            ("!=", &[], AstKind::NotEqual),
            ("<=", &[], AstKind::LessEq),
            (">=", &[], AstKind::GreaterEq),
            ("<", &[b'<'], AstKind::Less),
            (">", &[b'>'], AstKind::Greater),
        ];
        let line = self.line;
        let Some(lhs) = self.parse_shift()? else {
            return Ok(None);
        };
        for &(op, excluded, kind) in OPS {
            if self.eat_op(op, excluded) {
                let Some(rhs) = self.parse_shift()? else {
                    return Err(self.error(format!("expected operand after '{op}'")));
                };
                for &(chained, chained_excluded, _) in OPS {
                    if self.eat_op(chained, chained_excluded) {
                        return Err(self.error("comparison operators cannot be chained"));
                    }
                }
                return Ok(Some(AstNode::with_children(kind, vec![lhs, rhs], line)));
            }
        }
        Ok(Some(lhs))
    }

    fn parse_shift(&mut self) -> Parsed {
        self.parse_binary_level(
            &[("<<", &[], AstKind::Shl), (">>", &[], AstKind::Shr)],
            Self::parse_additive,
        )
    }

    fn parse_additive(&mut self) -> Parsed {
        self.parse_binary_level(
            &[("+", &[], AstKind::Add), ("-", &[], AstKind::Sub)],
            Self::parse_multiplicative,
        )
    }

    fn parse_multiplicative(&mut self) -> Parsed {
        self.parse_binary_level(
            &[
                ("*", &[b'*'], AstKind::Mul),
                ("/", &[], AstKind::Div),
                ("%", &[], AstKind::Mod),
            ],
            Self::parse_pow,
        )
    }

    /// `**` is right-associative: recurse at the same level on the right.
    fn parse_pow(&mut self) -> Parsed {
        let line = self.line;
        let Some(lhs) = self.parse_prefix()? else {
            return Ok(None);
        };
        if self.eat_op("**", &[]) {
            let Some(rhs) = self.parse_pow()? else {
                return Err(self.error("expected operand after '**'"));
            };
            return Ok(Some(AstNode::with_children(AstKind::Pow, vec![lhs, rhs], line)));
        }
        Ok(Some(lhs))
    }

    fn parse_prefix(&mut self) -> Parsed {
        let line = self.line;
        for (op, excluded, kind) in [
            ("-", &[][..], AstKind::Negate),
            ("!", &[b'='][..], AstKind::Not),
            ("~", &[][..], AstKind::BitNot),
            ("#", &[][..], AstKind::Len),
        ] {
            if self.eat_op(op, excluded) {
                let Some(operand) = self.parse_prefix()? else {
                    return Err(self.error(format!("expected operand after '{op}'")));
                };
                return Ok(Some(AstNode::with_children(kind, vec![operand], line)));
            }
        }
        self.parse_postfix()
    }

    /// A primary expression followed by any chain of calls, field
    /// accesses and index expressions.
    fn parse_postfix(&mut self) -> Parsed {
        let line = self.line;
        let Some(mut exp) = self.parse_primary()? else {
            return Ok(None);
        };
        loop {
            if self.eat_op("(", &[]) {
                let args = self.parse_arg_list()?;
                if !self.eat_op(")", &[]) {
                    return Err(self.error("expected ')' after argument list"));
                }
                exp = AstNode::with_children(AstKind::Call, vec![exp, args], line);
            } else if self.eat_op(".", &[b'.']) {
                let Some(field) = self.eat_identifier() else {
                    return Err(self.error("expected identifier after '.'"));
                };
                let field = AstNode::identifier(field, self.line);
                exp = AstNode::with_children(AstKind::Access, vec![exp, field], line);
            } else if self.eat_op("[", &[]) {
                let Some(index) = self.parse_exp()? else {
                    return Err(self.error("expected index expression after '['"));
                };
                if !self.eat_op("]", &[]) {
                    return Err(self.error("expected ']' after index expression"));
                }
                exp = AstNode::with_children(AstKind::Index, vec![exp, index], line);
            } else {
                return Ok(Some(exp));
            }
        }
    }

    fn parse_arg_list(&mut self) -> Result<AstNode, ParseError> {
        let line = self.line;
        let mut args = Vec::new();
        if let Some(first) = self.parse_exp()? {
            args.push(first);
            while self.eat_op(",", &[]) {
                let Some(arg) = self.parse_exp()? else {
                    return Err(self.error("unexpected symbol in argument list"));
                };
                args.push(arg);
            }
        }
        Ok(AstNode::with_children(AstKind::ArgList, args, line))
    }

    fn parse_primary(&mut self) -> Parsed {
        if let Some(text) = self.eat_string_literal()? {
            return Ok(Some(AstNode::string(&text, self.line)));
        }
        if let Some(node) = self.parse_array_literal()? {
            return Ok(Some(node));
        }
        if let Some(node) = self.parse_object_literal()? {
            return Ok(Some(node));
        }
        if let Some(node) = self.parse_func_literal()? {
            return Ok(Some(node));
        }
        let line = self.line;
        if let Some(value) = self.eat_number() {
            return Ok(Some(AstNode::number(value, line)));
        }
        if let Some(name) = self.eat_identifier() {
            return Ok(Some(AstNode::identifier(name, line)));
        }
        if self.eat_op("(", &[]) {
            let Some(exp) = self.parse_exp()? else {
                return Err(self.error("expected expression after '('"));
            };
            if !self.eat_op(")", &[]) {
                return Err(self.error("expected closing ')'"));
            }
            return Ok(Some(exp));
        }
        Ok(None)
    }

    fn parse_array_literal(&mut self) -> Parsed {
        let line = self.line;
        if !self.eat_op("[", &[]) {
            return Ok(None);
        }
        let mut elems = Vec::new();
        if let Some(first) = self.parse_exp()? {
            elems.push(first);
            while self.eat_op(",", &[]) {
                let Some(elem) = self.parse_exp()? else {
                    break;
                };
                elems.push(elem);
            }
        }
        if !self.eat_op("]", &[]) {
            return Err(self.error("expected ']' to close array literal"));
        }
        Ok(Some(AstNode::with_children(AstKind::ArrayLiteral, elems, line)))
    }

    /// `{ key = exp, … }`. Entries reuse the `Assign` node shape.
    fn parse_object_literal(&mut self) -> Parsed {
        let mark = self.mark();
        let line = self.line;
        if !self.eat_op("{", &[]) {
            return Ok(None);
        }
        let mut pairs = Vec::new();
        loop {
            let entry_mark = self.mark();
            let entry_line = self.line;
            let Some(key) = self.eat_identifier() else {
                break;
            };
            if !self.eat_op("=", &[b'=']) {
                // Not an object entry after all: an empty-block lookalike
                // such as `{ x }` is not an object literal.
                self.restore(entry_mark);
                if pairs.is_empty() {
                    self.restore(mark);
                    return Ok(None);
                }
                break;
            }
            let Some(value) = self.parse_exp()? else {
                return Err(self.error("expected expression after '=' in object literal"));
            };
            let key = AstNode::identifier(key, entry_line);
            pairs.push(AstNode::with_children(AstKind::Assign, vec![key, value], entry_line));
            if !self.eat_op(",", &[]) {
                break;
            }
        }
        if !self.eat_op("}", &[]) {
            self.restore(mark);
            return Ok(None);
        }
        Ok(Some(AstNode::with_children(AstKind::ObjectLiteral, pairs, line)))
    }

    /// `fn [name] ( params ) block`. A named literal additionally binds
    /// the name as a `const` in the surrounding scope (compiler's job).
    fn parse_func_literal(&mut self) -> Parsed {
        let line = self.line;
        if !self.eat_keyword("fn") {
            return Ok(None);
        }
        let name = self.eat_identifier().map(|n| AstNode::identifier(n, line));
        if !self.eat_op("(", &[]) {
            return Err(self.error("expected parameter definition after 'fn'"));
        }
        let mut params = Vec::new();
        if let Some(first) = self.eat_identifier() {
            params.push(AstNode::identifier(first, self.line));
            while self.eat_op(",", &[]) {
                let Some(param) = self.eat_identifier() else {
                    return Err(self.error("expected parameter name after ','"));
                };
                params.push(AstNode::identifier(param, self.line));
            }
        }
        if !self.eat_op(")", &[]) {
            return Err(self.error("expected ')' after parameter definition"));
        }
        let param_def = AstNode::with_children(AstKind::ParamDef, params, line);
        let Some(body) = self.parse_block()? else {
            return Err(self.error("expected block after parameter definition"));
        };
        let mut children = vec![param_def, body];
        if let Some(name) = name {
            children.push(name);
        }
        Ok(Some(AstNode::with_children(AstKind::FuncLiteral, children, line)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_ok(src: &str) -> AstNode {
        parse(src).expect("source should parse")
    }

    fn first_stat(module: &AstNode) -> &AstNode {
        &module.children[0].children[0]
    }

    #[test]
    fn precedence_shapes() {
        let module = parse_ok("let x = 1 + 2 * 3");
        let decl = first_stat(&module);
        assert_eq!(decl.kind, AstKind::VarDecl);
        let add = &decl.children[1];
        assert_eq!(add.kind, AstKind::Add);
        assert_eq!(add.children[0].kind, AstKind::NumLiteral);
        assert_eq!(add.children[1].kind, AstKind::Mul);
    }

    #[test]
    fn pow_is_right_associative() {
        let module = parse_ok("let x = 2 ** 3 ** 2");
        let pow = &first_stat(&module).children[1];
        assert_eq!(pow.kind, AstKind::Pow);
        assert_eq!(pow.children[0].kind, AstKind::NumLiteral);
        assert_eq!(pow.children[1].kind, AstKind::Pow);
    }

    #[test]
    fn comparison_chaining_is_rejected() {
        let err = parse("let x = 1 < 2 < 3").unwrap_err();
        assert!(err.message.contains("chained"), "got: {}", err.message);
    }

    #[test]
    fn assignment_does_not_eat_equality() {
        let module = parse_ok("a == b");
        assert_eq!(first_stat(&module).kind, AstKind::Equal);
    }

    #[test]
    fn postfix_chains() {
        let module = parse_ok("f(1)[2].g");
        let access = first_stat(&module);
        assert_eq!(access.kind, AstKind::Access);
        assert_eq!(access.children[0].kind, AstKind::Index);
        assert_eq!(access.children[0].children[0].kind, AstKind::Call);
    }

    #[test]
    fn for_variants() {
        assert_eq!(first_stat(&parse_ok("for v in a { }")).kind, AstKind::For);
        assert_eq!(first_stat(&parse_ok("for k, v in o { }")).kind, AstKind::For2);
        assert_eq!(first_stat(&parse_ok("for i in 0 .. 10 { }")).kind, AstKind::ForInt);
        assert_eq!(first_stat(&parse_ok("for i in 0..10 { }")).kind, AstKind::ForInt);
    }

    #[test]
    fn named_function_literal_keeps_name() {
        let module = parse_ok("let f = fn add(a, b) { return a + b }");
        let func = &first_stat(&module).children[1];
        assert_eq!(func.kind, AstKind::FuncLiteral);
        assert_eq!(func.children.len(), 3);
        assert_eq!(&*func.children[2].text, "add");
        assert_eq!(func.children[0].children.len(), 2);
    }

    #[test]
    fn object_literal_entries() {
        let module = parse_ok("let o = { a = 1, b = \"two\" }");
        let obj = &first_stat(&module).children[1];
        assert_eq!(obj.kind, AstKind::ObjectLiteral);
        assert_eq!(obj.children.len(), 2);
        assert_eq!(&*obj.children[0].children[0].text, "a");
    }

    #[test]
    fn string_escapes() {
        let module = parse_ok(r#"let s = "a\nb\"c""#);
        let lit = &first_stat(&module).children[1];
        assert_eq!(&*lit.text, "a\nb\"c");
    }

    #[test]
    fn unterminated_string_is_a_hard_error() {
        let err = parse("let s = \"oops").unwrap_err();
        assert!(err.message.contains("closing quote"));
    }

    #[test]
    fn trailing_garbage_is_rejected() {
        let err = parse("let x = 1 )").unwrap_err();
        assert!(err.message.contains("end of file"));
    }

    #[test]
    fn line_numbers_advance() {
        let module = parse_ok("let a = 1\nlet b = 2\n\nlet c = 3");
        let stats = &module.children[0].children;
        assert_eq!(stats[0].line, 1);
        assert_eq!(stats[1].line, 2);
        assert_eq!(stats[2].line, 4);
    }

    #[test]
    fn pretty_print_round_trips() {
        let sources = [
            "let x = 1 + 2 * 3",
            "const f = fn add(a, b) { return a + b ** 2 }",
            "let o = { a = 1, b = [1, 2, 3] }\no.a = o.a + 1",
            "for v in [1, 2] { print(v) }",
            "for k, v in o { print(k, v) }",
            "for i in 0 .. 10 { if i % 2 == 0 { print(i) } else { print(0 - i) } }",
            "while x < 10 { x = x + 1 }",
            "let t = x ? \"yes\" : \"no\"",
            "let n = -#a + ~b * !c",
        ];
        for src in sources {
            let first = parse(src).unwrap_or_else(|e| panic!("{src}: {e}"));
            let printed = first.pretty();
            let second = parse(&printed).unwrap_or_else(|e| panic!("{printed}: {e}"));
            assert!(
                first.structurally_eq(&second),
                "round trip changed structure for {src}\nprinted:\n{printed}"
            );
        }
    }
}
