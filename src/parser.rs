// File: src/parser.rs
//
// Recursive-descent / precedence-climbing parser. Produces the AST the
// compiler consumes; the compiler/VM/GC runtime triad is the load-bearing
// part of this crate and this module exists only to feed it.

use crate::ast::*;
use crate::chunk::Span;
use crate::lexer::{Token, TokenKind};

pub struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    pub fn new(tokens: Vec<Token>) -> Self {
        Parser { tokens, pos: 0 }
    }

    fn peek(&self) -> &TokenKind {
        self.tokens.get(self.pos).map(|t| &t.kind).unwrap_or(&TokenKind::Eof)
    }

    fn span(&self) -> Span {
        self.tokens
            .get(self.pos)
            .map(|t| Span { line: t.line, column: t.column })
            .unwrap_or_else(Span::unknown)
    }

    fn advance(&mut self) -> TokenKind {
        let tok = self.tokens.get(self.pos).map(|t| t.kind.clone()).unwrap_or(TokenKind::Eof);
        self.pos += 1;
        tok
    }

    fn is_punct(&self, c: char) -> bool {
        matches!(self.peek(), TokenKind::Punctuation(p) if *p == c)
    }

    fn is_keyword(&self, kw: &str) -> bool {
        matches!(self.peek(), TokenKind::Keyword(k) if k == kw)
    }

    fn is_operator(&self, op: &str) -> bool {
        matches!(self.peek(), TokenKind::Operator(o) if o == op)
    }

    fn eat_punct(&mut self, c: char) -> bool {
        if self.is_punct(c) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn eat_operator(&mut self, op: &str) -> bool {
        if self.is_operator(op) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn ident(&mut self) -> Option<String> {
        match self.advance() {
            TokenKind::Identifier(n) => Some(n),
            _ => None,
        }
    }

    pub fn parse(&mut self) -> Program {
        let mut statements = Vec::new();
        while !matches!(self.peek(), TokenKind::Eof) {
            if let Some(stmt) = self.parse_stmt() {
                statements.push(stmt);
            } else {
                self.advance();
            }
        }
        Program { statements }
    }

    fn parse_block(&mut self) -> Vec<Stmt> {
        let mut stmts = Vec::new();
        self.eat_punct('{');
        while !self.is_punct('}') && !matches!(self.peek(), TokenKind::Eof) {
            if let Some(s) = self.parse_stmt() {
                stmts.push(s);
            } else {
                self.advance();
            }
        }
        self.eat_punct('}');
        stmts
    }

    fn parse_decorators(&mut self) -> Vec<Expr> {
        let mut decorators = Vec::new();
        while self.is_punct('@') {
            self.advance();
            if let Some(e) = self.parse_expr() {
                decorators.push(e);
            }
        }
        decorators
    }

    fn parse_stmt(&mut self) -> Option<Stmt> {
        if self.is_punct('@') {
            let decorators = self.parse_decorators();
            let mut func = self.parse_function_lit_after_def()?;
            func.decorators = decorators;
            return Some(Stmt::FunctionDecl(func));
        }
        match self.peek().clone() {
            TokenKind::Keyword(k) if k == "let" => self.parse_let(),
            TokenKind::Keyword(k) if k == "def" => {
                let func = self.parse_function_lit_after_def()?;
                Some(Stmt::FunctionDecl(func))
            }
            TokenKind::Keyword(k) if k == "class" => self.parse_class(),
            TokenKind::Keyword(k) if k == "if" => self.parse_if(),
            TokenKind::Keyword(k) if k == "while" => self.parse_while(),
            TokenKind::Keyword(k) if k == "for" => self.parse_for(),
            TokenKind::Keyword(k) if k == "return" => self.parse_return(),
            TokenKind::Punctuation('{') => Some(Stmt::Block(self.parse_block())),
            TokenKind::Punctuation(';') => {
                self.advance();
                None
            }
            _ => {
                let span = self.span();
                let expr = self.parse_expr()?;
                self.eat_punct(';');
                let _ = span;
                Some(Stmt::Expr(expr))
            }
        }
    }

    fn parse_let(&mut self) -> Option<Stmt> {
        let span = self.span();
        self.advance(); // let
        let name = self.ident()?;
        let init = if self.eat_operator("=") { self.parse_expr() } else { None };
        self.eat_punct(';');
        Some(Stmt::VarDecl { name, init, span })
    }

    /// Parses `def name(params) { body }` (keyword already current).
    fn parse_function_lit_after_def(&mut self) -> Option<FunctionLit> {
        let span = self.span();
        self.advance(); // def
        let name = self.ident()?;
        let params = self.parse_params();
        let body = self.parse_block();
        Some(FunctionLit { name: Some(name), params, body, decorators: Vec::new(), span })
    }

    fn parse_params(&mut self) -> Vec<String> {
        let mut params = Vec::new();
        self.eat_punct('(');
        while let TokenKind::Identifier(_) = self.peek() {
            if let Some(n) = self.ident() {
                params.push(n);
            }
            if !self.eat_punct(',') {
                break;
            }
        }
        self.eat_punct(')');
        params
    }

    fn parse_class(&mut self) -> Option<Stmt> {
        let span = self.span();
        self.advance(); // class
        let name = self.ident()?;
        let superclass = if self.eat_operator("<") { self.ident() } else { None };
        self.eat_punct('{');
        let mut methods = Vec::new();
        while self.is_keyword("def") || self.is_punct('@') {
            let decorators = self.parse_decorators();
            if let Some(mut m) = self.parse_function_lit_after_def() {
                m.decorators = decorators;
                methods.push(m);
            }
        }
        self.eat_punct('}');
        Some(Stmt::ClassDecl(ClassDecl { name, superclass, methods, span }))
    }

    fn parse_if(&mut self) -> Option<Stmt> {
        let span = self.span();
        self.advance(); // if
        let cond = self.parse_expr()?;
        let then_branch = self.parse_block();
        let else_branch = if self.is_keyword("else") {
            self.advance();
            Some(self.parse_block())
        } else {
            None
        };
        Some(Stmt::If { cond, then_branch, else_branch, span })
    }

    fn parse_while(&mut self) -> Option<Stmt> {
        let span = self.span();
        self.advance(); // while
        let cond = self.parse_expr()?;
        let body = self.parse_block();
        Some(Stmt::While { cond, body, span })
    }

    fn parse_for(&mut self) -> Option<Stmt> {
        let span = self.span();
        self.advance(); // for
        self.eat_punct('(');
        let init = if self.is_punct(';') {
            None
        } else if self.is_keyword("let") {
            self.parse_let().map(Box::new)
        } else {
            let e = self.parse_expr()?;
            self.eat_punct(';');
            Some(Box::new(Stmt::Expr(e)))
        };
        if init.is_none() {
            self.eat_punct(';');
        }
        let cond = if self.is_punct(';') { None } else { self.parse_expr() };
        self.eat_punct(';');
        let step = if self.is_punct(')') { None } else { self.parse_expr() };
        self.eat_punct(')');
        let body = self.parse_block();
        Some(Stmt::For { header: ForHeader { init, cond, step }, body, span })
    }

    fn parse_return(&mut self) -> Option<Stmt> {
        let span = self.span();
        self.advance(); // return
        let value = if self.is_punct(';') || self.is_punct('}') { None } else { self.parse_expr() };
        self.eat_punct(';');
        Some(Stmt::Return { value, is_arrow: false, span })
    }

    fn parse_expr(&mut self) -> Option<Expr> {
        self.parse_assignment()
    }

    fn parse_assignment(&mut self) -> Option<Expr> {
        let span = self.span();
        let left = self.parse_or()?;
        if self.eat_operator("=") {
            let right = self.parse_assignment()?;
            return Some(Expr::Binary {
                op: BinOp::Assignment,
                left: Box::new(left),
                right: Box::new(right),
                span,
            });
        }
        Some(left)
    }

    fn parse_or(&mut self) -> Option<Expr> {
        let span = self.span();
        let mut left = self.parse_and()?;
        while self.eat_operator("||") {
            let right = self.parse_and()?;
            left = Expr::Binary { op: BinOp::Or, left: Box::new(left), right: Box::new(right), span };
        }
        Some(left)
    }

    fn parse_and(&mut self) -> Option<Expr> {
        let span = self.span();
        let mut left = self.parse_equality()?;
        while self.eat_operator("&&") {
            let right = self.parse_equality()?;
            left = Expr::Binary { op: BinOp::And, left: Box::new(left), right: Box::new(right), span };
        }
        Some(left)
    }

    fn parse_equality(&mut self) -> Option<Expr> {
        let span = self.span();
        let mut left = self.parse_comparison()?;
        while self.eat_operator("==") {
            let right = self.parse_comparison()?;
            left =
                Expr::Binary { op: BinOp::Equals, left: Box::new(left), right: Box::new(right), span };
        }
        Some(left)
    }

    fn parse_comparison(&mut self) -> Option<Expr> {
        let span = self.span();
        let mut left = self.parse_additive()?;
        loop {
            if self.eat_operator("<") {
                let right = self.parse_additive()?;
                left = Expr::Binary {
                    op: BinOp::LessThan,
                    left: Box::new(left),
                    right: Box::new(right),
                    span,
                };
            } else if self.eat_operator(">") {
                let right = self.parse_additive()?;
                left = Expr::Binary {
                    op: BinOp::GreaterThan,
                    left: Box::new(left),
                    right: Box::new(right),
                    span,
                };
            } else {
                break;
            }
        }
        Some(left)
    }

    fn parse_additive(&mut self) -> Option<Expr> {
        let span = self.span();
        let mut left = self.parse_multiplicative()?;
        loop {
            if self.eat_operator("+") {
                let right = self.parse_multiplicative()?;
                left =
                    Expr::Binary { op: BinOp::Plus, left: Box::new(left), right: Box::new(right), span };
            } else if self.eat_operator("-") {
                let right = self.parse_multiplicative()?;
                left = Expr::Binary {
                    op: BinOp::Minus,
                    left: Box::new(left),
                    right: Box::new(right),
                    span,
                };
            } else {
                break;
            }
        }
        Some(left)
    }

    fn parse_multiplicative(&mut self) -> Option<Expr> {
        let span = self.span();
        let mut left = self.parse_unary()?;
        loop {
            if self.eat_operator("*") {
                let right = self.parse_unary()?;
                left = Expr::Binary {
                    op: BinOp::Multiply,
                    left: Box::new(left),
                    right: Box::new(right),
                    span,
                };
            } else if self.eat_operator("/") {
                let right = self.parse_unary()?;
                left = Expr::Binary {
                    op: BinOp::Divide,
                    left: Box::new(left),
                    right: Box::new(right),
                    span,
                };
            } else {
                break;
            }
        }
        Some(left)
    }

    fn parse_unary(&mut self) -> Option<Expr> {
        let span = self.span();
        if self.eat_operator("-") {
            let operand = self.parse_unary()?;
            return Some(Expr::Unary { op: UnOp::Negate, operand: Box::new(operand), span });
        }
        if self.eat_operator("!") {
            let operand = self.parse_unary()?;
            return Some(Expr::Unary { op: UnOp::Not, operand: Box::new(operand), span });
        }
        self.parse_postfix()
    }

    fn parse_postfix(&mut self) -> Option<Expr> {
        let mut expr = self.parse_primary()?;
        loop {
            let span = self.span();
            if self.eat_punct('.') {
                let name = self.ident()?;
                if self.is_punct('(') {
                    let args = self.parse_args();
                    expr = Expr::Call {
                        callee: Box::new(Expr::Member { receiver: Box::new(expr), name, span }),
                        args,
                        span,
                    };
                } else {
                    expr = Expr::Member { receiver: Box::new(expr), name, span };
                }
            } else if self.is_punct('(') {
                let args = self.parse_args();
                expr = Expr::Call { callee: Box::new(expr), args, span };
            } else {
                break;
            }
        }
        Some(expr)
    }

    fn parse_args(&mut self) -> Vec<Expr> {
        let mut args = Vec::new();
        self.eat_punct('(');
        while !self.is_punct(')') && !matches!(self.peek(), TokenKind::Eof) {
            if let Some(e) = self.parse_expr() {
                args.push(e);
            }
            if !self.eat_punct(',') {
                break;
            }
        }
        self.eat_punct(')');
        args
    }

    fn parse_primary(&mut self) -> Option<Expr> {
        let span = self.span();
        match self.peek().clone() {
            TokenKind::Int(text, base) => {
                self.advance();
                Some(Expr::Int { text, base, span })
            }
            TokenKind::Float(text) => {
                self.advance();
                Some(Expr::Float { text, span })
            }
            TokenKind::Str(bytes) => {
                self.advance();
                Some(Expr::Str { bytes, span })
            }
            TokenKind::Keyword(k) if k == "true" => {
                self.advance();
                Some(Expr::Bool { value: true, span })
            }
            TokenKind::Keyword(k) if k == "false" => {
                self.advance();
                Some(Expr::Bool { value: false, span })
            }
            TokenKind::Keyword(k) if k == "null" => {
                self.advance();
                Some(Expr::Null { span })
            }
            TokenKind::Keyword(k) if k == "super" => {
                self.advance();
                self.eat_punct('.');
                let name = self.ident()?;
                Some(Expr::Super { name, span })
            }
            TokenKind::Keyword(k) if k == "def" => {
                let f = self.parse_function_lit_anonymous()?;
                Some(Expr::Function(f))
            }
            TokenKind::Identifier(name) => {
                self.advance();
                Some(Expr::Identifier { name, span })
            }
            TokenKind::Punctuation('(') => {
                self.advance();
                let inner = self.parse_expr()?;
                self.eat_punct(')');
                Some(inner)
            }
            _ => None,
        }
    }

    fn parse_function_lit_anonymous(&mut self) -> Option<FunctionLit> {
        let span = self.span();
        self.advance(); // def
        let name = if let TokenKind::Identifier(_) = self.peek() { self.ident() } else { None };
        let params = self.parse_params();
        let body = self.parse_block();
        Some(FunctionLit { name, params, body, decorators: Vec::new(), span })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lexer::tokenize;

    fn parse_source(src: &str) -> Program {
        Parser::new(tokenize(src)).parse()
    }

    #[test]
    fn parses_function_and_call() {
        let program = parse_source("def add(a,b){ return a+b } add(1,2);");
        assert_eq!(program.statements.len(), 2);
        assert!(matches!(program.statements[0], Stmt::FunctionDecl(_)));
        assert!(matches!(program.statements[1], Stmt::Expr(Expr::Call { .. })));
    }

    #[test]
    fn parses_class_with_superclass_and_method() {
        let program =
            parse_source("class B < A { def m(this){ return 1 } }");
        match &program.statements[0] {
            Stmt::ClassDecl(c) => {
                assert_eq!(c.name, "B");
                assert_eq!(c.superclass.as_deref(), Some("A"));
                assert_eq!(c.methods.len(), 1);
            }
            other => panic!("expected class decl, got {:?}", other),
        }
    }

    #[test]
    fn parses_stacked_decorators() {
        let program = parse_source("@deco(\"lol\") @deco(\"add\") def add(a,b){ return a+b }");
        match &program.statements[0] {
            Stmt::FunctionDecl(f) => assert_eq!(f.decorators.len(), 2),
            other => panic!("expected function decl, got {:?}", other),
        }
    }
}
