//! The parser
//!
//! Recursive descent with an operator-precedence ladder for
//! expressions.  The parser owns the typedef/struct/enum tables while
//! it runs (they arrive pre-seeded from header harvesting) and hands
//! them to the instruction selector afterwards.
//!
//! The one delicate spot is `(`: cast, parenthesized expression, or
//! statement expression.  The decision is made with fixed lookahead
//! and is committed: there is no backtracking, because type parsing
//! consumes tokens.

use std::fmt::Debug;

use derive_more::derive::Display;

use super::ast::*;
use super::lex::{self, Token, TokenKind};
use crate::common::Map;

#[derive(Display)]
#[display("Parse error: {}", self.0)]
pub struct ParseError(String);

impl Debug for ParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{self}")
    }
}

/// Everything the parser produces: the tree plus the tables the
/// instruction selector needs.
#[derive(Debug)]
pub struct Parsed {
    pub program: Program,
    pub types: TypeTable,
    pub funcs: Map<String, FuncSig>,
}

pub fn parse(input: &str) -> Result<Parsed, ParseError> {
    parse_with(input, TypeTable::with_builtins(), Map::new())
}

/// Parse with pre-populated tables (the normal path: the preprocessor
/// harvested headers into them already).
pub fn parse_with(
    input: &str,
    types: TypeTable,
    funcs: Map<String, FuncSig>,
) -> Result<Parsed, ParseError> {
    let toks = lex::tokenize(input).map_err(|e| ParseError(e.to_string()))?;
    let mut parser = Parser::new(toks, types, funcs);
    let program = parser.program()?;
    Ok(Parsed {
        program,
        types: parser.types,
        funcs: parser.funcs,
    })
}

struct Parser<'src> {
    toks: Vec<Token<'src>>,
    pos: usize,
    types: TypeTable,
    funcs: Map<String, FuncSig>,
    anon: u32,
}

impl<'src> Parser<'src> {
    fn new(toks: Vec<Token<'src>>, mut types: TypeTable, funcs: Map<String, FuncSig>) -> Self {
        // Signal numbers resolve as constants in expression position.
        for (name, value) in [("SIGSEGV", 11), ("SIGILL", 4), ("SIGFPE", 8), ("SIGABRT", 6)] {
            types.enums.entry(name.to_string()).or_insert(value);
        }
        Parser { toks, pos: 0, types, funcs, anon: 0 }
    }

    // ------------------------------------------------------------------
    // Token plumbing

    fn peek(&self) -> Option<Token<'src>> {
        self.toks.get(self.pos).copied()
    }

    fn kind_at(&self, n: usize) -> Option<TokenKind> {
        self.toks.get(self.pos + n).map(|t| t.kind)
    }

    fn text_at(&self, n: usize) -> &str {
        self.toks.get(self.pos + n).map(|t| t.text).unwrap_or("")
    }

    fn at(&self, kind: TokenKind) -> bool {
        self.kind_at(0) == Some(kind)
    }

    fn line(&self) -> u32 {
        self.peek().map(|t| t.line).unwrap_or(0)
    }

    fn bump(&mut self) -> Result<Token<'src>, ParseError> {
        let tok = self.peek().ok_or_else(|| self.err("more input"))?;
        self.pos += 1;
        Ok(tok)
    }

    fn eat(&mut self, kind: TokenKind) -> bool {
        if self.at(kind) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect(&mut self, kind: TokenKind) -> Result<Token<'src>, ParseError> {
        if self.at(kind) {
            self.bump()
        } else {
            Err(self.err(&format!("'{kind}'")))
        }
    }

    fn err(&self, expected: &str) -> ParseError {
        match self.peek() {
            Some(t) => ParseError(format!(
                "line {}, column {}: unexpected '{}', expected {}",
                t.line, t.col, t.text, expected
            )),
            None => ParseError(format!("unexpected end of input, expected {expected}")),
        }
    }

    // ------------------------------------------------------------------
    // Types

    /// Can a declaration start at the current token?
    fn at_type(&self) -> bool {
        use TokenKind::*;
        match self.kind_at(0) {
            Some(
                KwInt | KwChar | KwVoid | KwLong | KwShort | KwFloat | KwDouble | KwSigned
                | KwUnsigned | KwStruct | KwUnion | KwEnum | KwStatic | KwConst | KwVolatile
                | KwRegister | KwExtern,
            ) => true,
            Some(Id) => self.types.typedefs.contains_key(self.text_at(0)),
            _ => false,
        }
    }

    /// Parse a type: storage classes and qualifiers, sign/width
    /// modifiers, a base type, then pointer suffixes.  Returns the type
    /// string and whether `extern` appeared.
    fn parse_type(&mut self) -> Result<(String, bool), ParseError> {
        use TokenKind::*;
        let mut is_extern = false;
        loop {
            match self.kind_at(0) {
                Some(KwStatic | KwConst | KwVolatile | KwRegister) => {
                    self.pos += 1;
                }
                Some(KwExtern) => {
                    is_extern = true;
                    self.pos += 1;
                }
                _ => break,
            }
        }
        let mut words: Vec<&str> = vec![];
        loop {
            match self.kind_at(0) {
                Some(KwSigned) => {
                    self.pos += 1;
                    words.push("signed");
                }
                Some(KwUnsigned) => {
                    self.pos += 1;
                    words.push("unsigned");
                }
                Some(KwLong) => {
                    self.pos += 1;
                    words.push("long");
                }
                Some(KwShort) => {
                    self.pos += 1;
                    words.push("short");
                }
                _ => break,
            }
        }
        let mut base = match self.kind_at(0) {
            Some(KwInt) => {
                self.pos += 1;
                "int".to_string()
            }
            Some(KwChar) => {
                self.pos += 1;
                "char".to_string()
            }
            Some(KwFloat) => {
                self.pos += 1;
                "float".to_string()
            }
            Some(KwDouble) => {
                self.pos += 1;
                "double".to_string()
            }
            Some(KwVoid) => {
                self.pos += 1;
                "void".to_string()
            }
            Some(KwStruct | KwUnion) => self.struct_type()?,
            Some(KwEnum) => self.enum_type()?,
            Some(Id) if words.is_empty() && self.types.typedefs.contains_key(self.text_at(0)) => {
                self.bump()?.text.to_string()
            }
            _ if !words.is_empty() => {
                // Modifiers with no base: implicit int ("unsigned x").
                String::new()
            }
            _ => return Err(self.err("a type")),
        };
        if !words.is_empty() {
            if base == "int" || base.is_empty() {
                base = words.join(" ");
                if base == "signed" {
                    base = "int".to_string();
                }
            } else {
                base = format!("{} {}", words.join(" "), base);
            }
        }
        let mut ty = base;
        while self.eat(Star) {
            // Qualifiers may sit between stars: `char * const p`.
            while matches!(self.kind_at(0), Some(KwConst | KwVolatile)) {
                self.pos += 1;
            }
            ty.push('*');
        }
        Ok((ty, is_extern))
    }

    /// `struct Tag`, `struct Tag { ... }`, or `struct { ... }`.
    fn struct_type(&mut self) -> Result<String, ParseError> {
        use TokenKind::*;
        let kw = self.bump()?; // struct | union
        let keyword = if kw.kind == KwUnion { "union" } else { "struct" };
        let tag = if self.at(Id) {
            self.bump()?.text.to_string()
        } else {
            self.anon += 1;
            format!("__anon{}", self.anon)
        };
        if self.at(LBrace) {
            let raw = self.struct_body()?;
            self.types.define_struct(&tag, raw);
        }
        Ok(format!("{keyword} {tag}"))
    }

    /// `{ member; ... }`: members as raw (name, type, explicit size)
    /// triples for `TypeTable::define_struct`.
    fn struct_body(&mut self) -> Result<Vec<(String, String, i64)>, ParseError> {
        use TokenKind::*;
        self.expect(LBrace)?;
        let mut raw = vec![];
        while !self.at(RBrace) {
            let (ty, _) = self.parse_type()?;
            loop {
                let name = self.expect(Id)?.text.to_string();
                let mut explicit = 0;
                if self.eat(LBracket) {
                    let len = self.const_expr()?;
                    self.expect(RBracket)?;
                    explicit = self.types.size_of(&ty) * len.max(1);
                }
                raw.push((name, ty.clone(), explicit));
                if !self.eat(Comma) {
                    break;
                }
            }
            self.expect(Semi)?;
        }
        self.expect(RBrace)?;
        Ok(raw)
    }

    /// `enum Tag? { A, B = 3, ... }`: constants go into the enum
    /// table; the type itself is plain int.
    fn enum_type(&mut self) -> Result<String, ParseError> {
        use TokenKind::*;
        self.bump()?; // enum
        if self.at(Id) {
            self.bump()?;
        }
        if self.at(LBrace) {
            self.bump()?;
            let mut next = 0i64;
            while !self.at(RBrace) {
                let name = self.expect(Id)?.text.to_string();
                if self.eat(Assign) {
                    next = self.const_expr()?;
                }
                self.types.enums.insert(name, next);
                next += 1;
                if !self.eat(Comma) {
                    break;
                }
            }
            self.expect(RBrace)?;
        }
        Ok("int".to_string())
    }

    /// A small constant evaluator for array lengths, enum values, and
    /// case labels.
    fn const_expr(&mut self) -> Result<i64, ParseError> {
        let e = self.ternary()?;
        self.eval_const(&e)
            .ok_or_else(|| self.err("a constant expression"))
    }

    fn eval_const(&self, e: &Expr) -> Option<i64> {
        match e {
            Expr::Num(n) => Some(*n),
            Expr::Ident(name) => self.types.enums.get(name).copied(),
            Expr::Unary { op: UnOp::Neg, expr } => Some(-self.eval_const(expr)?),
            Expr::Binary { op, lhs, rhs } => {
                let (l, r) = (self.eval_const(lhs)?, self.eval_const(rhs)?);
                Some(match op {
                    BinOp::Add => l + r,
                    BinOp::Sub => l - r,
                    BinOp::Mul => l * r,
                    BinOp::Div => l.checked_div(r)?,
                    BinOp::Shl => l << r,
                    BinOp::Shr => l >> r,
                    BinOp::Or => l | r,
                    BinOp::And => l & r,
                    BinOp::Xor => l ^ r,
                    _ => return None,
                })
            }
            _ => None,
        }
    }

    // ------------------------------------------------------------------
    // Top level

    fn program(&mut self) -> Result<Program, ParseError> {
        let mut stmts = vec![];
        while self.peek().is_some() {
            if self.at(TokenKind::KwTypedef) {
                self.typedef_decl()?;
            } else {
                stmts.extend(self.external_decl()?);
            }
        }
        self.types.resolve_sizes();
        Ok(Program { stmts })
    }

    fn typedef_decl(&mut self) -> Result<(), ParseError> {
        use TokenKind::*;
        self.expect(KwTypedef)?;
        // Covers `typedef struct [Tag] { ... } Name;`, plain aliases,
        // and pointer typedefs alike: parse_type handles the body.
        let (ty, _) = self.parse_type()?;
        let name = self.expect(Id)?.text.to_string();
        self.expect(Semi)?;
        self.types.typedefs.insert(name, ty);
        Ok(())
    }

    fn external_decl(&mut self) -> Result<Vec<Stmt>, ParseError> {
        use TokenKind::*;
        let line = self.line();
        let (ty, is_extern) = self.parse_type()?;
        // `struct S { ... };` defines the type and declares nothing.
        if self.eat(Semi) {
            return Ok(vec![]);
        }
        let name = self.expect(Id)?.text.to_string();
        if self.at(LParen) {
            return self.function_rest(ty, name, line);
        }
        self.var_decls_rest(ty, name, is_extern, line)
    }

    /// Parameters, then either a body (definition) or `;` (prototype).
    fn function_rest(&mut self, ret: String, name: String, line: u32) -> Result<Vec<Stmt>, ParseError> {
        use TokenKind::*;
        self.expect(LParen)?;
        let mut params = vec![];
        let mut variadic = false;
        if !self.at(RParen) {
            loop {
                if self.at(Ellipsis) {
                    self.bump()?;
                    variadic = true;
                    // Anything after ... is ignored.
                    while !self.at(RParen) {
                        self.bump()?;
                    }
                    break;
                }
                let (pty, _) = self.parse_type()?;
                if pty == "void" && self.at(RParen) {
                    break;
                }
                let pname = if self.at(Id) {
                    self.bump()?.text.to_string()
                } else {
                    String::new()
                };
                params.push(Param { name: pname, ty: pty });
                if !self.eat(Comma) {
                    break;
                }
            }
        }
        self.expect(RParen)?;
        self.funcs.insert(
            name.clone(),
            FuncSig {
                ret: ret.clone(),
                params: params.iter().map(|p| p.ty.clone()).collect(),
                variadic,
            },
        );
        if self.eat(Semi) {
            return Ok(vec![]); // prototype
        }
        let body = self.block()?;
        Ok(vec![Stmt {
            line,
            kind: StmtKind::Func(FuncDef { name, ret, params, variadic, body }),
        }])
    }

    /// The rest of a variable declaration list, first name consumed.
    fn var_decls_rest(
        &mut self,
        ty: String,
        first: String,
        is_extern: bool,
        line: u32,
    ) -> Result<Vec<Stmt>, ParseError> {
        use TokenKind::*;
        let mut out = vec![];
        let mut name = first;
        loop {
            let mut array_len = None;
            if self.eat(LBracket) {
                array_len = Some(self.const_expr()?);
                self.expect(RBracket)?;
            }
            let init = if self.eat(Assign) {
                Some(self.initializer(&ty)?)
            } else {
                None
            };
            out.push(Stmt {
                line,
                kind: StmtKind::VarDecl(VarDecl {
                    name,
                    ty: ty.clone(),
                    array_len,
                    init,
                    is_extern,
                }),
            });
            if !self.eat(Comma) {
                break;
            }
            name = self.expect(Id)?.text.to_string();
        }
        self.expect(Semi)?;
        Ok(out)
    }

    /// `= { ... }` braces borrow the declared type; otherwise a plain
    /// assignment expression.
    fn initializer(&mut self, ty: &str) -> Result<Expr, ParseError> {
        if self.at(TokenKind::LBrace) {
            let fields = self.compound_fields()?;
            Ok(Expr::CompoundLit { ty: ty.to_string(), fields })
        } else {
            self.assignment()
        }
    }

    // ------------------------------------------------------------------
    // Statements

    fn block(&mut self) -> Result<Vec<Stmt>, ParseError> {
        use TokenKind::*;
        self.expect(LBrace)?;
        let mut stmts = vec![];
        while !self.at(RBrace) {
            stmts.push(self.stmt()?);
        }
        self.expect(RBrace)?;
        Ok(stmts)
    }

    fn body_or_single(&mut self) -> Result<Vec<Stmt>, ParseError> {
        if self.at(TokenKind::LBrace) {
            self.block()
        } else {
            Ok(vec![self.stmt()?])
        }
    }

    fn stmt(&mut self) -> Result<Stmt, ParseError> {
        use TokenKind::*;
        let line = self.line();
        let kind = match self.kind_at(0) {
            Some(LBrace) => StmtKind::Block(self.block()?),
            Some(KwIf) => {
                self.bump()?;
                self.expect(LParen)?;
                let cond = self.expr()?;
                self.expect(RParen)?;
                let then = self.body_or_single()?;
                let els = if self.eat(KwElse) {
                    self.body_or_single()?
                } else {
                    vec![]
                };
                StmtKind::If { cond, then, els }
            }
            Some(KwWhile) => {
                self.bump()?;
                self.expect(LParen)?;
                let cond = self.expr()?;
                self.expect(RParen)?;
                let body = self.body_or_single()?;
                StmtKind::While { cond, body }
            }
            Some(KwDo) => {
                self.bump()?;
                let body = self.body_or_single()?;
                self.expect(KwWhile)?;
                self.expect(LParen)?;
                let cond = self.expr()?;
                self.expect(RParen)?;
                self.expect(Semi)?;
                StmtKind::DoWhile { body, cond }
            }
            Some(KwFor) => {
                self.bump()?;
                self.expect(LParen)?;
                let init = if self.eat(Semi) {
                    None
                } else if self.at_type() {
                    let decls = self.local_decl()?;
                    Some(Box::new(decls))
                } else {
                    let e = self.expr()?;
                    self.expect(Semi)?;
                    Some(Box::new(Stmt { line, kind: StmtKind::Expr(e) }))
                };
                let cond = if self.at(Semi) { None } else { Some(self.expr()?) };
                self.expect(Semi)?;
                let step = if self.at(RParen) {
                    None
                } else {
                    let e = self.expr()?;
                    Some(Box::new(Stmt { line, kind: StmtKind::Expr(e) }))
                };
                self.expect(RParen)?;
                let body = self.body_or_single()?;
                StmtKind::For { init, cond, step, body }
            }
            Some(KwSwitch) => {
                self.bump()?;
                self.expect(LParen)?;
                let scrutinee = self.expr()?;
                self.expect(RParen)?;
                self.expect(LBrace)?;
                let mut cases = vec![];
                while !self.at(RBrace) {
                    let value = if self.eat(KwCase) {
                        let v = self.ternary()?;
                        Some(v)
                    } else {
                        self.expect(KwDefault)?;
                        None
                    };
                    self.expect(Colon)?;
                    let mut body = vec![];
                    while !matches!(self.kind_at(0), Some(KwCase | KwDefault | RBrace)) {
                        body.push(self.stmt()?);
                    }
                    cases.push(SwitchCase { value, body });
                }
                self.expect(RBrace)?;
                StmtKind::Switch { scrutinee, cases }
            }
            Some(KwBreak) => {
                self.bump()?;
                self.expect(Semi)?;
                StmtKind::Break
            }
            Some(KwContinue) => {
                self.bump()?;
                self.expect(Semi)?;
                StmtKind::Continue
            }
            Some(KwReturn) => {
                self.bump()?;
                let value = if self.at(Semi) { None } else { Some(self.expr()?) };
                self.expect(Semi)?;
                StmtKind::Return(value)
            }
            Some(KwGoto) => return Err(self.err("a statement (goto is not supported)")),
            _ if self.at_type() => return self.local_decl(),
            _ => {
                let e = self.expr()?;
                self.expect(Semi)?;
                StmtKind::Expr(e)
            }
        };
        Ok(Stmt { line, kind })
    }

    /// A local declaration statement; multiple declarators become a
    /// block of single declarations.
    fn local_decl(&mut self) -> Result<Stmt, ParseError> {
        let line = self.line();
        let (ty, is_extern) = self.parse_type()?;
        if self.eat(TokenKind::Semi) {
            // A bare struct definition in statement position.
            return Ok(Stmt { line, kind: StmtKind::Block(vec![]) });
        }
        let name = self.expect(TokenKind::Id)?.text.to_string();
        let mut decls = self.var_decls_rest(ty, name, is_extern, line)?;
        if decls.len() == 1 {
            Ok(decls.pop().unwrap())
        } else {
            Ok(Stmt { line, kind: StmtKind::Block(decls) })
        }
    }

    // ------------------------------------------------------------------
    // Expressions, lowest precedence first

    fn expr(&mut self) -> Result<Expr, ParseError> {
        self.assignment()
    }

    fn assignment(&mut self) -> Result<Expr, ParseError> {
        use TokenKind::*;
        let lhs = self.ternary()?;
        let op = match self.kind_at(0) {
            Some(Assign) => None,
            Some(PlusAssign) => Some(BinOp::Add),
            Some(MinusAssign) => Some(BinOp::Sub),
            Some(StarAssign) => Some(BinOp::Mul),
            Some(SlashAssign) => Some(BinOp::Div),
            Some(PercentAssign) => Some(BinOp::Mod),
            Some(AmpAssign) => Some(BinOp::And),
            Some(PipeAssign) => Some(BinOp::Or),
            Some(CaretAssign) => Some(BinOp::Xor),
            Some(ShlAssign) => Some(BinOp::Shl),
            Some(ShrAssign) => Some(BinOp::Shr),
            _ => return Ok(lhs),
        };
        self.bump()?;
        let value = self.assignment()?;
        Ok(Expr::Assign {
            target: Box::new(lhs),
            op,
            value: Box::new(value),
        })
    }

    fn ternary(&mut self) -> Result<Expr, ParseError> {
        let cond = self.logical_or()?;
        if !self.eat(TokenKind::Question) {
            return Ok(cond);
        }
        let then = self.expr()?;
        self.expect(TokenKind::Colon)?;
        let els = self.ternary()?;
        Ok(Expr::Ternary {
            cond: Box::new(cond),
            then: Box::new(then),
            els: Box::new(els),
        })
    }

    fn logical_or(&mut self) -> Result<Expr, ParseError> {
        let mut lhs = self.logical_and()?;
        while self.eat(TokenKind::OrOr) {
            let rhs = self.logical_and()?;
            lhs = bin(BinOp::LogOr, lhs, rhs);
        }
        Ok(lhs)
    }

    fn logical_and(&mut self) -> Result<Expr, ParseError> {
        let mut lhs = self.bit_or()?;
        while self.eat(TokenKind::AndAnd) {
            let rhs = self.bit_or()?;
            lhs = bin(BinOp::LogAnd, lhs, rhs);
        }
        Ok(lhs)
    }

    fn bit_or(&mut self) -> Result<Expr, ParseError> {
        let mut lhs = self.bit_xor()?;
        while self.eat(TokenKind::Pipe) {
            let rhs = self.bit_xor()?;
            lhs = bin(BinOp::Or, lhs, rhs);
        }
        Ok(lhs)
    }

    fn bit_xor(&mut self) -> Result<Expr, ParseError> {
        let mut lhs = self.bit_and()?;
        while self.eat(TokenKind::Caret) {
            let rhs = self.bit_and()?;
            lhs = bin(BinOp::Xor, lhs, rhs);
        }
        Ok(lhs)
    }

    fn bit_and(&mut self) -> Result<Expr, ParseError> {
        let mut lhs = self.equality()?;
        while self.eat(TokenKind::Amp) {
            let rhs = self.equality()?;
            lhs = bin(BinOp::And, lhs, rhs);
        }
        Ok(lhs)
    }

    fn equality(&mut self) -> Result<Expr, ParseError> {
        use TokenKind::*;
        let mut lhs = self.relational()?;
        loop {
            let op = match self.kind_at(0) {
                Some(EqEq) => BinOp::Eq,
                Some(Ne) => BinOp::Ne,
                _ => return Ok(lhs),
            };
            self.bump()?;
            let rhs = self.relational()?;
            lhs = bin(op, lhs, rhs);
        }
    }

    fn relational(&mut self) -> Result<Expr, ParseError> {
        use TokenKind::*;
        let mut lhs = self.shift()?;
        loop {
            let op = match self.kind_at(0) {
                Some(Lt) => BinOp::Lt,
                Some(Le) => BinOp::Le,
                Some(Gt) => BinOp::Gt,
                Some(Ge) => BinOp::Ge,
                _ => return Ok(lhs),
            };
            self.bump()?;
            let rhs = self.shift()?;
            lhs = bin(op, lhs, rhs);
        }
    }

    fn shift(&mut self) -> Result<Expr, ParseError> {
        use TokenKind::*;
        let mut lhs = self.additive()?;
        loop {
            let op = match self.kind_at(0) {
                Some(Shl) => BinOp::Shl,
                Some(Shr) => BinOp::Shr,
                _ => return Ok(lhs),
            };
            self.bump()?;
            let rhs = self.additive()?;
            lhs = bin(op, lhs, rhs);
        }
    }

    fn additive(&mut self) -> Result<Expr, ParseError> {
        use TokenKind::*;
        let mut lhs = self.multiplicative()?;
        loop {
            let op = match self.kind_at(0) {
                Some(Plus) => BinOp::Add,
                Some(Minus) => BinOp::Sub,
                _ => return Ok(lhs),
            };
            self.bump()?;
            let rhs = self.multiplicative()?;
            lhs = bin(op, lhs, rhs);
        }
    }

    fn multiplicative(&mut self) -> Result<Expr, ParseError> {
        use TokenKind::*;
        let mut lhs = self.unary()?;
        loop {
            let op = match self.kind_at(0) {
                Some(Star) => BinOp::Mul,
                Some(Slash) => BinOp::Div,
                Some(Percent) => BinOp::Mod,
                _ => return Ok(lhs),
            };
            self.bump()?;
            let rhs = self.unary()?;
            lhs = bin(op, lhs, rhs);
        }
    }

    /// Decide whether a `(` at the current position opens a cast.  One
    /// token of lookahead, no backtracking:
    ///   1. a primitive type keyword or struct/union: cast;
    ///   2. a known typedef name followed by `*` or `)`: cast;
    ///   3. anything else: parenthesized expression.
    fn cast_ahead(&self) -> bool {
        use TokenKind::*;
        if !self.at(LParen) {
            return false;
        }
        match self.kind_at(1) {
            Some(
                KwInt | KwChar | KwVoid | KwLong | KwShort | KwFloat | KwDouble | KwSigned
                | KwUnsigned | KwStruct | KwUnion | KwConst,
            ) => true,
            Some(Id) => {
                self.types.typedefs.contains_key(self.text_at(1))
                    && matches!(self.kind_at(2), Some(Star | RParen))
            }
            _ => false,
        }
    }

    fn unary(&mut self) -> Result<Expr, ParseError> {
        use TokenKind::*;
        match self.kind_at(0) {
            Some(Minus) => {
                self.bump()?;
                Ok(un(UnOp::Neg, self.unary()?))
            }
            Some(Bang) => {
                self.bump()?;
                Ok(un(UnOp::Not, self.unary()?))
            }
            Some(Tilde) => {
                self.bump()?;
                Ok(un(UnOp::BitNot, self.unary()?))
            }
            Some(Amp) => {
                self.bump()?;
                Ok(un(UnOp::AddrOf, self.unary()?))
            }
            Some(Star) => {
                self.bump()?;
                Ok(un(UnOp::Deref, self.unary()?))
            }
            Some(PlusPlus | MinusMinus) => {
                let dec = self.bump()?.kind == MinusMinus;
                let target = self.unary()?;
                Ok(Expr::IncDec { target: Box::new(target), dec, postfix: false })
            }
            Some(KwSizeof) => {
                self.bump()?;
                if self.cast_ahead() {
                    self.expect(LParen)?;
                    let (ty, _) = self.parse_type()?;
                    self.expect(RParen)?;
                    Ok(Expr::SizeofType(ty))
                } else {
                    Ok(Expr::SizeofExpr(Box::new(self.unary()?)))
                }
            }
            Some(LParen) if self.cast_ahead() => {
                // Committed: a missing ')' from here on is a hard error.
                self.expect(LParen)?;
                let (ty, _) = self.parse_type()?;
                self.expect(RParen)?;
                if self.at(LBrace) {
                    let fields = self.compound_fields()?;
                    return Ok(Expr::CompoundLit { ty, fields });
                }
                Ok(Expr::Cast { ty, expr: Box::new(self.unary()?) })
            }
            _ => self.postfix(),
        }
    }

    /// `{ .field = expr, ... }` or `{ expr, ... }`.
    fn compound_fields(&mut self) -> Result<Vec<(String, Expr)>, ParseError> {
        use TokenKind::*;
        self.expect(LBrace)?;
        let mut fields = vec![];
        while !self.at(RBrace) {
            if self.eat(Dot) {
                let name = self.expect(Id)?.text.to_string();
                self.expect(Assign)?;
                let value = self.assignment()?;
                fields.push((name, value));
            } else {
                fields.push((String::new(), self.assignment()?));
            }
            if !self.eat(Comma) {
                break;
            }
        }
        self.expect(RBrace)?;
        Ok(fields)
    }

    fn postfix(&mut self) -> Result<Expr, ParseError> {
        use TokenKind::*;
        let mut e = self.primary()?;
        loop {
            match self.kind_at(0) {
                Some(PlusPlus | MinusMinus) => {
                    let dec = self.bump()?.kind == MinusMinus;
                    e = Expr::IncDec { target: Box::new(e), dec, postfix: true };
                }
                Some(LBracket) => {
                    self.bump()?;
                    let index = self.expr()?;
                    self.expect(RBracket)?;
                    e = Expr::Index { base: Box::new(e), index: Box::new(index) };
                }
                Some(Dot) => {
                    self.bump()?;
                    let member = self.expect(Id)?.text.to_string();
                    e = Expr::Member { base: Box::new(e), member, arrow: false };
                }
                Some(Arrow) => {
                    self.bump()?;
                    let member = self.expect(Id)?.text.to_string();
                    e = Expr::Member { base: Box::new(e), member, arrow: true };
                }
                Some(LParen) => {
                    self.bump()?;
                    let mut args = vec![];
                    while !self.at(RParen) {
                        args.push(self.assignment()?);
                        if !self.eat(Comma) {
                            break;
                        }
                    }
                    self.expect(RParen)?;
                    e = Expr::Call { callee: Box::new(e), args };
                }
                _ => return Ok(e),
            }
        }
    }

    fn primary(&mut self) -> Result<Expr, ParseError> {
        use TokenKind::*;
        match self.kind_at(0) {
            Some(Num) => {
                let text = self.bump()?.text;
                Ok(number(text))
            }
            Some(Str) => {
                let text = self.bump()?.text;
                Ok(Expr::Str(lex::unescape_string(text)))
            }
            Some(Char) => {
                let text = self.bump()?.text;
                Ok(Expr::Num(lex::char_value(text)))
            }
            Some(Id) => {
                let text = self.bump()?.text;
                Ok(Expr::Ident(text.to_string()))
            }
            Some(LParen) if self.kind_at(1) == Some(LBrace) => {
                // Statement expression: ({ stmt; ...; value; })
                self.bump()?;
                let stmts = self.block()?;
                self.expect(RParen)?;
                Ok(Expr::StmtExpr(stmts))
            }
            Some(LParen) => {
                self.bump()?;
                let e = self.expr()?;
                self.expect(RParen)?;
                Ok(e)
            }
            _ => Err(self.err("an expression")),
        }
    }
}

fn bin(op: BinOp, lhs: Expr, rhs: Expr) -> Expr {
    Expr::Binary { op, lhs: Box::new(lhs), rhs: Box::new(rhs) }
}

fn un(op: UnOp, expr: Expr) -> Expr {
    Expr::Unary { op, expr: Box::new(expr) }
}

/// Decode a numeric literal lexeme.
fn number(text: &str) -> Expr {
    if let Some(hex) = text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        let digits: String = hex.chars().take_while(|c| c.is_ascii_hexdigit()).collect();
        Expr::Num(i64::from_str_radix(&digits, 16).unwrap_or(0))
    } else if text.contains('.') {
        Expr::Float(
            text.trim_end_matches(|c| matches!(c, 'f' | 'F' | 'l' | 'L'))
                .to_string(),
        )
    } else {
        let digits: String = text.chars().take_while(|c| c.is_ascii_digit()).collect();
        Expr::Num(digits.parse().unwrap_or(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_ok(src: &str) -> Parsed {
        parse(src).unwrap()
    }

    fn first_func(parsed: &Parsed) -> &FuncDef {
        parsed
            .program
            .stmts
            .iter()
            .find_map(|s| match &s.kind {
                StmtKind::Func(f) => Some(f),
                _ => None,
            })
            .expect("no function in program")
    }

    #[test]
    fn function_and_return() {
        let p = parse_ok("int main() { return 42; }");
        let f = first_func(&p);
        assert_eq!(f.name, "main");
        assert_eq!(f.ret, "int");
        assert!(matches!(
            f.body[0].kind,
            StmtKind::Return(Some(Expr::Num(42)))
        ));
    }

    #[test]
    fn precedence() {
        let p = parse_ok("int main() { return 1 + 2 * 3; }");
        let f = first_func(&p);
        let StmtKind::Return(Some(Expr::Binary { op: BinOp::Add, rhs, .. })) = &f.body[0].kind
        else {
            panic!("expected return of an addition");
        };
        assert!(matches!(**rhs, Expr::Binary { op: BinOp::Mul, .. }));
    }

    #[test]
    fn cast_vs_paren() {
        // (int)x is a cast.
        let p = parse_ok("int main() { int x; return (int)x; }");
        let f = first_func(&p);
        assert!(matches!(
            f.body[1].kind,
            StmtKind::Return(Some(Expr::Cast { .. }))
        ));

        // (x) is a parenthesized expression.
        let p = parse_ok("int main() { int x; return (x); }");
        let f = first_func(&p);
        assert!(matches!(
            f.body[1].kind,
            StmtKind::Return(Some(Expr::Ident(_)))
        ));
    }

    #[test]
    fn typedef_cast_needs_star_or_rparen() {
        // T* in parens: cast.  T alone would be ambiguous with an
        // expression, so (T)(x) is a cast but (t + 1) is arithmetic.
        let src = "typedef struct Card { int id; } Card;\n\
                   int main() { long p; return ((Card*)p)->id; }";
        let parsed = parse_ok(src);
        let f = first_func(&parsed);
        let StmtKind::Return(Some(Expr::Member { base, arrow: true, .. })) = &f.body[1].kind
        else {
            panic!("expected arrow member access");
        };
        assert!(matches!(**base, Expr::Cast { .. }));
    }

    #[test]
    fn compound_literal() {
        let src = "typedef struct P { int x; int y; } P;\n\
                   int main() { P p = (P){ .x = 1, .y = 2 }; return p.x; }";
        let parsed = parse_ok(src);
        let f = first_func(&parsed);
        let StmtKind::VarDecl(VarDecl { init: Some(Expr::CompoundLit { fields, .. }), .. }) =
            &f.body[0].kind
        else {
            panic!("expected compound-literal init");
        };
        assert_eq!(fields[0].0, "x");
        assert_eq!(fields[1].0, "y");
    }

    #[test]
    fn statement_expression() {
        let p = parse_ok("int main() { int x = ({ int a = 5; a + 1; }); return x; }");
        let f = first_func(&p);
        let StmtKind::VarDecl(VarDecl { init: Some(Expr::StmtExpr(stmts)), .. }) = &f.body[0].kind
        else {
            panic!("expected statement expression");
        };
        assert_eq!(stmts.len(), 2);
    }

    #[test]
    fn declarations_populate_tables_with_empty_program() {
        let p = parse_ok(
            "typedef struct Point { int x; int y; } Point;\n\
             typedef unsigned long word;\n\
             int add(int a, int b);\n",
        );
        assert!(p.program.stmts.is_empty());
        assert_eq!(p.types.resolve("Point"), "struct Point");
        assert_eq!(p.types.struct_def("Point").unwrap().size, 8);
        assert_eq!(p.types.resolve("word"), "unsigned long");
        assert_eq!(p.funcs["add"].params.len(), 2);
    }

    #[test]
    fn enums_and_const_arrays() {
        let p = parse_ok("enum Kind { A, B = 5, C };\nint main() { int xs[C]; return C; }");
        assert_eq!(p.types.enums["A"], 0);
        assert_eq!(p.types.enums["B"], 5);
        assert_eq!(p.types.enums["C"], 6);
        let f = first_func(&p);
        let StmtKind::VarDecl(VarDecl { array_len: Some(n), .. }) = &f.body[0].kind else {
            panic!("expected array declaration");
        };
        assert_eq!(*n, 6);
    }

    #[test]
    fn variadic_signature() {
        let p = parse_ok("int printf(char *fmt, ...);\n");
        assert!(p.funcs["printf"].variadic);
    }

    #[test]
    fn implicit_int_from_modifiers() {
        let p = parse_ok("unsigned x;\nint main() { return 0; }");
        let StmtKind::VarDecl(VarDecl { ty, .. }) = &p.program.stmts[0].kind else {
            panic!("expected global declaration");
        };
        assert_eq!(ty, "unsigned");
    }

    #[test]
    fn pointer_types() {
        let p = parse_ok("int main() { char **argv; return 0; }");
        let f = first_func(&p);
        let StmtKind::VarDecl(VarDecl { ty, .. }) = &f.body[0].kind else {
            panic!("expected declaration");
        };
        assert_eq!(ty, "char**");
    }

    #[test]
    fn syntax_error_mentions_line_and_lexeme() {
        let err = parse("int main() { return }; }").unwrap_err();
        let msg = format!("{err}");
        assert!(msg.contains("line 1"));
        assert!(msg.contains("'}'"));
    }
}
