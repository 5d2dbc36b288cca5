//! The instruction selector.
//!
//! One walk over the AST emits the linear IR stream.  The selector
//! owns the symbol tables: locals with rbp-relative slots, globals,
//! function signatures, and the string/float literal pools.  Struct
//! values are represented by their address throughout; scalar values
//! live in temps.
//!
//! ABI-sensitive orderings live here and are load-bearing:
//!   - call arguments are all evaluated to temps before any move into
//!     an argument register;
//!   - for large-struct returns the hidden-pointer `LoadAddr` into rdi
//!     is emitted after every argument move;
//!   - pre/post increment on a named variable loads, computes, and
//!     stores back.

use derive_more::Display;
use log::debug;

use super::ir::*;
use crate::common::{id, round8, Id, Map, Set};
use crate::front::ast::*;

#[derive(Display)]
pub enum SelectError {
    #[display("undefined variable '{name}' in function '{func}'")]
    UndefVar { name: String, func: String },
    #[display("unknown member '{member}' on type '{ty}' in function '{func}'")]
    UnknownMember { member: String, ty: String, func: String },
    #[display("cannot resolve type '{ty}' in function '{func}'")]
    UnknownType { ty: String, func: String },
    #[display("call to '{callee}': {got} arguments, expected {expected}")]
    Arity { callee: String, expected: usize, got: usize },
    #[display("{what} is not supported (function '{func}')")]
    Unsupported { what: String, func: String },
}

impl std::fmt::Debug for SelectError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{self}")
    }
}

type Result<T> = std::result::Result<T, SelectError>;

/// Lower a parsed program to a linear IR module.
pub fn lower(prog: &Program, types: TypeTable, funcs: Map<String, FuncSig>) -> Result<Module> {
    let mut sel = Selector::new(types, funcs);
    sel.program(prog)?;
    Ok(sel.module)
}

struct LocalVar {
    offset: i64,
    ty: String,
    size: i64,
    is_array: bool,
}

struct GlobalSlot {
    ty: String,
    size: i64,
    is_array: bool,
}

pub struct Selector {
    types: TypeTable,
    funcs: Map<String, FuncSig>,
    /// Functions with bodies in this module.
    defined: Set<String>,
    module: Module,
    locals: Map<String, LocalVar>,
    global_tys: Map<String, GlobalSlot>,
    cur_func: String,
    cur_ret: String,
    frame: i64,
    next_temp: u32,
    next_label: u32,
    next_str: u32,
    next_float: u32,
    temp_ty: TempTypes,
    breaks: Vec<Id>,
    continues: Vec<Id>,
    /// Slot holding the hidden return pointer, when the current
    /// function returns a large struct.
    hidden_ret: Option<i64>,
}

impl Selector {
    fn new(types: TypeTable, funcs: Map<String, FuncSig>) -> Self {
        Selector {
            types,
            funcs,
            defined: Set::new(),
            module: Module::default(),
            locals: Map::new(),
            global_tys: Map::new(),
            cur_func: String::new(),
            cur_ret: String::new(),
            frame: 0,
            next_temp: 0,
            next_label: 0,
            next_str: 0,
            next_float: 0,
            temp_ty: Map::new(),
            breaks: vec![],
            continues: vec![],
            hidden_ret: None,
        }
    }

    fn program(&mut self, prog: &Program) -> Result<()> {
        // Register every function and global first so bodies can refer
        // to definitions that appear later in the file.
        for stmt in &prog.stmts {
            match &stmt.kind {
                StmtKind::Func(f) => {
                    self.defined.insert(f.name.clone());
                    self.funcs.entry(f.name.clone()).or_insert_with(|| FuncSig {
                        ret: f.ret.clone(),
                        params: f.params.iter().map(|p| p.ty.clone()).collect(),
                        variadic: f.variadic,
                    });
                }
                StmtKind::VarDecl(v) => self.global_decl(v)?,
                _ => {}
            }
        }
        for stmt in &prog.stmts {
            if let StmtKind::Func(f) = &stmt.kind {
                self.function(f)?;
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Small helpers

    fn push(&mut self, i: Instr) {
        self.module.code.push(i);
    }

    fn temp(&mut self) -> Operand {
        self.next_temp += 1;
        Operand::Temp(self.next_temp)
    }

    fn new_label(&mut self) -> Id {
        self.next_label += 1;
        id(&format!(".L{}", self.next_label))
    }

    /// Reserve `size` frame bytes; returns the (negative) rbp offset.
    fn alloc_slot(&mut self, size: i64) -> i64 {
        self.frame += round8(size.max(1));
        -self.frame
    }

    fn set_ty(&mut self, op: &Operand, ty: &str) {
        if let Operand::Temp(t) = op {
            self.temp_ty.insert(*t, ty.to_string());
        }
    }

    fn ty_of(&self, op: &Operand) -> Option<String> {
        match op {
            Operand::Temp(t) => self.temp_ty.get(t).cloned(),
            Operand::Var { ty, .. } => Some(ty.clone()),
            _ => None,
        }
    }

    /// Remove one level of pointer indirection from a type string.
    fn strip_star(&self, ty: &str) -> String {
        let resolved = self.types.resolve(ty);
        let trimmed = resolved.trim_end();
        match trimmed.strip_suffix('*') {
            Some(inner) => inner.trim_end().to_string(),
            None => trimmed.to_string(),
        }
    }

    /// Width of a scalar load/store of this type (1, 2, 4, or 8).
    fn scalar_size(&self, ty: &str) -> i64 {
        self.types.size_of(ty).clamp(1, 8)
    }

    fn is_struct(&self, ty: &str) -> bool {
        let resolved = self.types.resolve(ty);
        !resolved.ends_with('*') && self.types.struct_def(&resolved).is_some()
    }

    fn err_undef(&self, name: &str) -> SelectError {
        SelectError::UndefVar { name: name.to_string(), func: self.cur_func.clone() }
    }

    fn err_unsupported(&self, what: &str) -> SelectError {
        SelectError::Unsupported { what: what.to_string(), func: self.cur_func.clone() }
    }

    fn var_operand(&self, name: &str) -> Option<Operand> {
        if let Some(local) = self.locals.get(name) {
            return Some(Operand::Var {
                name: id(name),
                offset: local.offset,
                global: false,
                ty: local.ty.clone(),
                size: local.size.clamp(1, 8),
            });
        }
        self.global_tys.get(name).map(|g| Operand::Var {
            name: id(name),
            offset: 0,
            global: true,
            ty: g.ty.clone(),
            size: g.size.clamp(1, 8),
        })
    }

    fn string_label(&mut self, s: &str) -> Id {
        self.next_str += 1;
        let label = id(&format!(".str{}", self.next_str));
        self.module.strings.push((label, s.to_string()));
        label
    }

    fn float_label(&mut self, text: &str) -> Id {
        self.next_float += 1;
        let label = id(&format!(".FC{}", self.next_float));
        self.module.floats.push((label, text.to_string()));
        label
    }

    fn eval_const(&self, e: &Expr) -> Option<i64> {
        match e {
            Expr::Num(n) => Some(*n),
            Expr::Ident(name) => self.types.enums.get(name).copied(),
            Expr::Unary { op: UnOp::Neg, expr } => Some(-self.eval_const(expr)?),
            _ => None,
        }
    }

    // ------------------------------------------------------------------
    // Globals

    fn global_decl(&mut self, v: &VarDecl) -> Result<()> {
        let elem = self.types.size_of(&v.ty);
        let size = match v.array_len {
            Some(n) => elem * n.max(1),
            None => elem.max(1),
        };
        self.global_tys.insert(
            v.name.clone(),
            GlobalSlot { ty: v.ty.clone(), size, is_array: v.array_len.is_some() },
        );
        let init = if v.is_extern {
            GlobalInit::External
        } else {
            match &v.init {
                None => GlobalInit::Zero,
                Some(Expr::Str(s)) => {
                    let label = self.string_label(s);
                    GlobalInit::Label(label)
                }
                Some(Expr::Float(text)) => {
                    let bits = if elem == 4 {
                        (text.parse::<f32>().unwrap_or(0.0).to_bits() as u64).to_le_bytes()[..4]
                            .to_vec()
                    } else {
                        text.parse::<f64>().unwrap_or(0.0).to_bits().to_le_bytes().to_vec()
                    };
                    GlobalInit::Bytes(bits)
                }
                Some(e) => match self.eval_const(e) {
                    Some(n) => GlobalInit::Int(n),
                    None => {
                        return Err(SelectError::Unsupported {
                            what: format!("non-constant initializer for global '{}'", v.name),
                            func: String::new(),
                        })
                    }
                },
            }
        };
        self.module.globals.push(GlobalVar { name: id(&v.name), size, init });
        Ok(())
    }

    // ------------------------------------------------------------------
    // Functions

    fn function(&mut self, f: &FuncDef) -> Result<()> {
        debug!("selecting {}", f.name);
        self.cur_func = f.name.clone();
        self.cur_ret = f.ret.clone();
        self.locals.clear();
        self.temp_ty.clear();
        self.frame = 0;
        self.hidden_ret = None;

        let start = self.module.code.len();
        self.push(Instr::label(id(&f.name)));

        // Large-struct return: the hidden pointer arrives in rdi and
        // shifts every user argument one register rightward.
        let ret_size = if self.is_struct(&f.ret) { self.types.size_of(&f.ret) } else { 0 };
        let mut arg_index = 0;
        if ret_size > 16 {
            let slot = self.alloc_slot(8);
            self.push(Instr::un(Op::Store, Operand::Mem(slot), Operand::Reg(Reg::Rdi)));
            self.hidden_ret = Some(slot);
            arg_index = 1;
        }

        for p in &f.params {
            if p.name.is_empty() {
                arg_index += 1;
                continue;
            }
            if arg_index < ARG_REGS.len() {
                // Stored via a Mem operand: the slot holds an ABI value
                // and must stay opaque to the register allocator.
                let slot = self.alloc_slot(8);
                self.push(Instr::un(
                    Op::Store,
                    Operand::Mem(slot),
                    Operand::Reg(ARG_REGS[arg_index]),
                ));
                self.locals.insert(
                    p.name.clone(),
                    LocalVar {
                        offset: slot,
                        ty: p.ty.clone(),
                        size: self.scalar_size(&p.ty),
                        is_array: false,
                    },
                );
            } else {
                // Caller-pushed: above the saved rbp and return address.
                let offset = 16 + 8 * (arg_index as i64 - ARG_REGS.len() as i64);
                self.locals.insert(
                    p.name.clone(),
                    LocalVar {
                        offset,
                        ty: p.ty.clone(),
                        size: self.scalar_size(&p.ty),
                        is_array: false,
                    },
                );
            }
            arg_index += 1;
        }

        for stmt in &f.body {
            self.stmt(stmt)?;
        }
        if !matches!(self.module.code.last(), Some(Instr { op: Op::Ret, .. })) {
            self.push(Instr::un(Op::Mov, Operand::Reg(Reg::Rax), Operand::imm(0)));
            self.push(Instr::nullary(Op::Ret));
        }

        let end = self.module.code.len();
        self.module.funcs.push(FuncFrame {
            name: id(&f.name),
            start,
            end,
            frame_size: self.frame,
        });
        Ok(())
    }

    // ------------------------------------------------------------------
    // Statements

    fn stmt(&mut self, s: &Stmt) -> Result<()> {
        match &s.kind {
            StmtKind::Func(_) => Err(self.err_unsupported("nested function definition")),
            StmtKind::VarDecl(v) => self.local_decl(v),
            StmtKind::Block(stmts) => {
                for s in stmts {
                    self.stmt(s)?;
                }
                Ok(())
            }
            StmtKind::If { cond, then, els } => {
                let end = self.new_label();
                let else_label = if els.is_empty() { end } else { self.new_label() };
                let c = self.expr(cond)?;
                self.push(Instr::branch(Op::Jz, c, else_label));
                for s in then {
                    self.stmt(s)?;
                }
                if !els.is_empty() {
                    self.push(Instr::jump(Op::Jmp, end));
                    self.push(Instr::label(else_label));
                    for s in els {
                        self.stmt(s)?;
                    }
                }
                self.push(Instr::label(end));
                Ok(())
            }
            StmtKind::While { cond, body } => {
                let head = self.new_label();
                let end = self.new_label();
                self.push(Instr::label(head));
                let c = self.expr(cond)?;
                self.push(Instr::branch(Op::Jz, c, end));
                self.breaks.push(end);
                self.continues.push(head);
                for s in body {
                    self.stmt(s)?;
                }
                self.breaks.pop();
                self.continues.pop();
                self.push(Instr::jump(Op::Jmp, head));
                self.push(Instr::label(end));
                Ok(())
            }
            StmtKind::DoWhile { body, cond } => {
                let head = self.new_label();
                let check = self.new_label();
                let end = self.new_label();
                self.push(Instr::label(head));
                self.breaks.push(end);
                self.continues.push(check);
                for s in body {
                    self.stmt(s)?;
                }
                self.breaks.pop();
                self.continues.pop();
                self.push(Instr::label(check));
                let c = self.expr(cond)?;
                self.push(Instr::branch(Op::Jnz, c, head));
                self.push(Instr::label(end));
                Ok(())
            }
            StmtKind::For { init, cond, step, body } => {
                if let Some(init) = init {
                    self.stmt(init)?;
                }
                let head = self.new_label();
                let stepl = self.new_label();
                let end = self.new_label();
                self.push(Instr::label(head));
                if let Some(cond) = cond {
                    let c = self.expr(cond)?;
                    self.push(Instr::branch(Op::Jz, c, end));
                }
                self.breaks.push(end);
                self.continues.push(stepl);
                for s in body {
                    self.stmt(s)?;
                }
                self.breaks.pop();
                self.continues.pop();
                self.push(Instr::label(stepl));
                if let Some(step) = step {
                    self.stmt(step)?;
                }
                self.push(Instr::jump(Op::Jmp, head));
                self.push(Instr::label(end));
                Ok(())
            }
            StmtKind::Switch { scrutinee, cases } => self.switch(scrutinee, cases),
            StmtKind::Break => match self.breaks.last() {
                Some(l) => {
                    let l = *l;
                    self.push(Instr::jump(Op::Jmp, l));
                    Ok(())
                }
                None => Err(self.err_unsupported("break outside loop or switch")),
            },
            StmtKind::Continue => match self.continues.last() {
                Some(l) => {
                    let l = *l;
                    self.push(Instr::jump(Op::Jmp, l));
                    Ok(())
                }
                None => Err(self.err_unsupported("continue outside loop")),
            },
            StmtKind::Return(value) => self.ret(value.as_ref()),
            StmtKind::Expr(e) => {
                self.expr(e)?;
                Ok(())
            }
        }
    }

    /// Evaluate the scrutinee once, compare per case, branch to the
    /// matching body; default (or the end) catches the rest.  Bodies
    /// are laid out in source order so fallthrough works.
    fn switch(&mut self, scrutinee: &Expr, cases: &[SwitchCase]) -> Result<()> {
        let end = self.new_label();
        let scrut = self.expr(scrutinee)?;
        let mut labels = Vec::with_capacity(cases.len());
        let mut default_label = None;
        for case in cases {
            let label = self.new_label();
            labels.push(label);
            match &case.value {
                Some(v) => {
                    let value = self
                        .eval_const(v)
                        .ok_or_else(|| self.err_unsupported("non-constant case label"))?;
                    let t = self.temp();
                    self.push(Instr::bin(Op::Eq, t.clone(), scrut.clone(), Operand::imm(value)));
                    self.push(Instr::branch(Op::Jnz, t, label));
                }
                None => default_label = Some(label),
            }
        }
        self.push(Instr::jump(Op::Jmp, default_label.unwrap_or(end)));
        self.breaks.push(end);
        for (case, label) in cases.iter().zip(&labels) {
            self.push(Instr::label(*label));
            for s in &case.body {
                self.stmt(s)?;
            }
        }
        self.breaks.pop();
        self.push(Instr::label(end));
        Ok(())
    }

    fn local_decl(&mut self, v: &VarDecl) -> Result<()> {
        if v.is_extern {
            return self.global_decl(v);
        }
        let elem = self.types.size_of(&v.ty);
        let (size, is_array) = match v.array_len {
            Some(n) => (elem * n.max(1), true),
            None => (elem.max(1), false),
        };
        let offset = self.alloc_slot(size);
        self.locals.insert(
            v.name.clone(),
            LocalVar { offset, ty: v.ty.clone(), size, is_array },
        );
        let Some(init) = &v.init else { return Ok(()) };
        match init {
            Expr::CompoundLit { fields, .. } if is_array => {
                for (i, (_, e)) in fields.iter().enumerate() {
                    let value = self.expr(e)?;
                    self.store_into_slot(offset + i as i64 * elem, elem.clamp(1, 8), value);
                }
                Ok(())
            }
            Expr::CompoundLit { ty, fields } if self.is_struct(ty) => {
                self.compound_init(offset, ty, fields)?;
                Ok(())
            }
            _ => {
                let value = self.expr(init)?;
                if self.is_struct(&v.ty) && self.types.size_of(&v.ty) > 8 {
                    // Struct-valued initializer: copy from the source
                    // address, 8 bytes at a time.
                    self.copy_struct_to_slot(offset, &value, self.types.size_of(&v.ty));
                    Ok(())
                } else {
                    let dst = self.var_operand(&v.name).ok_or_else(|| self.err_undef(&v.name))?;
                    self.push(Instr::un(Op::Store, dst, value));
                    Ok(())
                }
            }
        }
    }

    /// Field-by-field stores of a compound literal into a frame slot.
    fn compound_init(&mut self, slot: i64, ty: &str, fields: &[(String, Expr)]) -> Result<()> {
        let def = self.types.struct_def(ty).cloned().ok_or_else(|| SelectError::UnknownType {
            ty: ty.to_string(),
            func: self.cur_func.clone(),
        })?;
        for (i, (name, e)) in fields.iter().enumerate() {
            let member = if name.is_empty() {
                def.members.get(i)
            } else {
                def.member(name)
            };
            let Some(member) = member else {
                return Err(SelectError::UnknownMember {
                    member: name.clone(),
                    ty: ty.to_string(),
                    func: self.cur_func.clone(),
                });
            };
            let value = self.expr(e)?;
            self.store_into_slot(slot + member.offset, member.size.clamp(1, 8), value);
        }
        Ok(())
    }

    /// `*(rbp + offset) = value`, with an explicit width.
    fn store_into_slot(&mut self, offset: i64, size: i64, value: Operand) {
        let addr = self.temp();
        self.push(Instr::un(Op::LoadAddr, addr.clone(), Operand::Mem(offset)));
        self.push(Instr::un(
            Op::Store,
            Operand::Ptr { base: Box::new(addr), size },
            value,
        ));
    }

    /// Copy `size` bytes (rounded up to 8) from the address in `src`
    /// into the frame slot at `dst_offset`.
    fn copy_struct_to_slot(&mut self, dst_offset: i64, src: &Operand, size: i64) {
        let mut off = 0;
        while off < size {
            let s_addr = self.temp();
            self.push(Instr::bin(Op::Add, s_addr.clone(), src.clone(), Operand::imm(off)));
            let value = self.temp();
            self.push(Instr::un(
                Op::Load,
                value.clone(),
                Operand::Ptr { base: Box::new(s_addr), size: 8 },
            ));
            self.store_into_slot(dst_offset + off, 8, value);
            off += 8;
        }
    }

    fn ret(&mut self, value: Option<&Expr>) -> Result<()> {
        if let Some(e) = value {
            let v = self.expr(e)?;
            let ret_size = if self.is_struct(&self.cur_ret) {
                self.types.size_of(&self.cur_ret)
            } else {
                0
            };
            if ret_size > 16 {
                // Copy through the hidden pointer, then return it.
                let hidden = self.hidden_ret.expect("large-struct return without hidden slot");
                let dst = self.temp();
                self.push(Instr::un(Op::Load, dst.clone(), Operand::Mem(hidden)));
                let mut off = 0;
                while off < ret_size {
                    let s_addr = self.temp();
                    self.push(Instr::bin(Op::Add, s_addr.clone(), v.clone(), Operand::imm(off)));
                    let chunk = self.temp();
                    self.push(Instr::un(
                        Op::Load,
                        chunk.clone(),
                        Operand::Ptr { base: Box::new(s_addr), size: 8 },
                    ));
                    let d_addr = self.temp();
                    self.push(Instr::bin(Op::Add, d_addr.clone(), dst.clone(), Operand::imm(off)));
                    self.push(Instr::un(
                        Op::Store,
                        Operand::Ptr { base: Box::new(d_addr), size: 8 },
                        chunk,
                    ));
                    off += 8;
                }
                self.push(Instr::un(Op::Mov, Operand::Reg(Reg::Rax), dst));
            } else if ret_size > 8 {
                // rax:rdx carry the two halves.
                let lo = self.temp();
                self.push(Instr::un(
                    Op::Load,
                    lo.clone(),
                    Operand::Ptr { base: Box::new(v.clone()), size: 8 },
                ));
                let hi_addr = self.temp();
                self.push(Instr::bin(Op::Add, hi_addr.clone(), v, Operand::imm(8)));
                let hi = self.temp();
                self.push(Instr::un(
                    Op::Load,
                    hi.clone(),
                    Operand::Ptr { base: Box::new(hi_addr), size: 8 },
                ));
                self.push(Instr::un(Op::Mov, Operand::Reg(Reg::Rax), lo));
                self.push(Instr::un(Op::Mov, Operand::Reg(Reg::Rdx), hi));
            } else {
                self.push(Instr::un(Op::Mov, Operand::Reg(Reg::Rax), v));
            }
        }
        self.push(Instr::nullary(Op::Ret));
        Ok(())
    }

    // ------------------------------------------------------------------
    // Expressions

    fn expr(&mut self, e: &Expr) -> Result<Operand> {
        match e {
            Expr::Num(n) => Ok(Operand::imm(*n)),
            Expr::Float(text) => {
                let label = self.float_label(text);
                let t = self.temp();
                self.push(Instr::un(Op::Mov, t.clone(), Operand::Label(label)));
                self.set_ty(&t, "double");
                Ok(t)
            }
            Expr::Str(s) => {
                let label = self.string_label(s);
                let t = self.temp();
                self.push(Instr::un(Op::Mov, t.clone(), Operand::Label(label)));
                self.set_ty(&t, "char*");
                Ok(t)
            }
            Expr::Ident(name) => self.ident(name),
            Expr::Assign { target, op, value } => self.assign(target, *op, value),
            Expr::Binary { op: BinOp::LogAnd, lhs, rhs } => self.short_circuit(lhs, rhs, true),
            Expr::Binary { op: BinOp::LogOr, lhs, rhs } => self.short_circuit(lhs, rhs, false),
            Expr::Binary { op, lhs, rhs } => {
                let a = self.expr(lhs)?;
                let b = self.expr(rhs)?;
                let t = self.temp();
                self.push(Instr::bin(bin_op(*op), t.clone(), a, b));
                Ok(t)
            }
            Expr::Unary { op, expr } => self.unary(*op, expr),
            Expr::IncDec { target, dec, postfix } => self.inc_dec(target, *dec, *postfix),
            Expr::Call { callee, args } => self.call(callee, args),
            Expr::Index { base, index } => self.index_load(base, index),
            Expr::Member { base, member, arrow } => {
                let (addr, size, mty) = self.member_ref(base, member, *arrow)?;
                if self.is_struct(&mty) && self.types.size_of(&mty) > 8 {
                    // Struct-typed member: its address is the value.
                    self.set_ty(&addr, &mty);
                    return Ok(addr);
                }
                let t = self.temp();
                self.push(Instr::un(
                    Op::Load,
                    t.clone(),
                    Operand::Ptr { base: Box::new(addr), size },
                ));
                self.set_ty(&t, &mty);
                Ok(t)
            }
            Expr::Cast { ty, expr } => {
                let v = self.expr(expr)?;
                if matches!(v, Operand::Temp(_)) {
                    self.set_ty(&v, ty);
                    Ok(v)
                } else {
                    let t = self.temp();
                    self.push(Instr::un(Op::Mov, t.clone(), v));
                    self.set_ty(&t, ty);
                    Ok(t)
                }
            }
            Expr::Ternary { cond, then, els } => {
                let slot = self.alloc_slot(8);
                let else_label = self.new_label();
                let end = self.new_label();
                let c = self.expr(cond)?;
                self.push(Instr::branch(Op::Jz, c, else_label));
                let tv = self.expr(then)?;
                self.push(Instr::un(Op::Store, Operand::Mem(slot), tv));
                self.push(Instr::jump(Op::Jmp, end));
                self.push(Instr::label(else_label));
                let ev = self.expr(els)?;
                self.push(Instr::un(Op::Store, Operand::Mem(slot), ev));
                self.push(Instr::label(end));
                let t = self.temp();
                self.push(Instr::un(Op::Load, t.clone(), Operand::Mem(slot)));
                Ok(t)
            }
            Expr::CompoundLit { ty, fields } => {
                let size = self.types.size_of(ty).max(8);
                let slot = self.alloc_slot(size);
                self.compound_init(slot, ty, fields)?;
                let t = self.temp();
                self.push(Instr::un(Op::LoadAddr, t.clone(), Operand::Mem(slot)));
                self.set_ty(&t, ty);
                Ok(t)
            }
            Expr::StmtExpr(stmts) => {
                if let Some((last, init)) = stmts.split_last() {
                    for s in init {
                        self.stmt(s)?;
                    }
                    if let StmtKind::Expr(e) = &last.kind {
                        return self.expr(e);
                    }
                    self.stmt(last)?;
                }
                Ok(Operand::imm(0))
            }
            Expr::SizeofType(ty) => Ok(Operand::imm(self.types.size_of(ty))),
            Expr::SizeofExpr(e) => Ok(Operand::imm(self.size_of_expr(e))),
        }
    }

    fn ident(&mut self, name: &str) -> Result<Operand> {
        if let Some(local) = self.locals.get(name) {
            let decays = local.is_array || self.is_struct(&local.ty);
            let elem_ty = local.ty.clone();
            let var = self.var_operand(name).unwrap();
            let t = self.temp();
            if decays {
                self.push(Instr::un(Op::LoadAddr, t.clone(), var));
                let ty = if self.locals[name].is_array {
                    format!("{elem_ty}*")
                } else {
                    elem_ty
                };
                self.set_ty(&t, &ty);
            } else {
                self.push(Instr::un(Op::Load, t.clone(), var));
                self.set_ty(&t, &elem_ty);
            }
            return Ok(t);
        }
        if let Some(g) = self.global_tys.get(name) {
            let decays = g.is_array || self.is_struct(&g.ty);
            let gty = g.ty.clone();
            let var = self.var_operand(name).unwrap();
            let t = self.temp();
            if decays {
                self.push(Instr::un(Op::LoadAddr, t.clone(), var));
                let ty = if self.global_tys[name].is_array { format!("{gty}*") } else { gty };
                self.set_ty(&t, &ty);
            } else {
                self.push(Instr::un(Op::Load, t.clone(), var));
                self.set_ty(&t, &gty);
            }
            return Ok(t);
        }
        if let Some(value) = self.types.enums.get(name) {
            return Ok(Operand::imm(*value));
        }
        if self.defined.contains(name) || self.funcs.contains_key(name) {
            // A function name used as a value.
            return Ok(Operand::Label(id(name)));
        }
        Err(self.err_undef(name))
    }

    fn unary(&mut self, op: UnOp, inner: &Expr) -> Result<Operand> {
        match op {
            UnOp::Neg => {
                let v = self.expr(inner)?;
                let t = self.temp();
                self.push(Instr::un(Op::Neg, t.clone(), v));
                Ok(t)
            }
            UnOp::Not => {
                let v = self.expr(inner)?;
                let t = self.temp();
                self.push(Instr::bin(Op::Eq, t.clone(), v, Operand::imm(0)));
                Ok(t)
            }
            UnOp::BitNot => {
                let v = self.expr(inner)?;
                let t = self.temp();
                self.push(Instr::un(Op::Not, t.clone(), v));
                Ok(t)
            }
            UnOp::Deref => {
                let p = self.expr(inner)?;
                let pointee = match self.ty_of(&p) {
                    Some(ty) => self.strip_star(&ty),
                    None => String::new(),
                };
                if self.is_struct(&pointee) && self.types.size_of(&pointee) > 8 {
                    // Dereferencing to a struct value: the pointer is
                    // already the value's address.
                    self.set_ty(&p, &pointee);
                    return Ok(p);
                }
                let size = if pointee.is_empty() { 8 } else { self.scalar_size(&pointee) };
                let t = self.temp();
                self.push(Instr::un(
                    Op::Load,
                    t.clone(),
                    Operand::Ptr { base: Box::new(p), size },
                ));
                if !pointee.is_empty() {
                    self.set_ty(&t, &pointee);
                }
                Ok(t)
            }
            UnOp::AddrOf => self.addr_of(inner),
        }
    }

    fn addr_of(&mut self, inner: &Expr) -> Result<Operand> {
        match inner {
            Expr::Ident(name) => {
                let var = self.var_operand(name).ok_or_else(|| self.err_undef(name))?;
                let ty = self.ty_of(&var).unwrap_or_default();
                let t = self.temp();
                self.push(Instr::un(Op::LoadAddr, t.clone(), var));
                self.set_ty(&t, &format!("{ty}*"));
                Ok(t)
            }
            Expr::Member { base, member, arrow } => {
                let (addr, _, mty) = self.member_ref(base, member, *arrow)?;
                self.set_ty(&addr, &format!("{mty}*"));
                Ok(addr)
            }
            Expr::Index { base, index } => {
                let (place, elem_ty) = self.element_place(base, index)?;
                match place {
                    Place::At(addr) => {
                        self.set_ty(&addr, &format!("{elem_ty}*"));
                        Ok(addr)
                    }
                    Place::Element { base, offset, global, index } => {
                        // &a[i]: base address plus the scaled index.
                        let base_addr = self.temp();
                        self.push(Instr::un(
                            Op::LoadAddr,
                            base_addr.clone(),
                            Operand::Addr { name: base, offset, global },
                        ));
                        let t = self.temp();
                        self.push(Instr::bin(Op::Add, t.clone(), base_addr, *index));
                        self.set_ty(&t, &format!("{elem_ty}*"));
                        Ok(t)
                    }
                }
            }
            Expr::Unary { op: UnOp::Deref, expr } => self.expr(expr),
            _ => Err(self.err_unsupported("address-of on this expression")),
        }
    }

    /// Pre/post increment and decrement.  On a named variable this is
    /// the full load / compute / store-back sequence.
    fn inc_dec(&mut self, target: &Expr, dec: bool, postfix: bool) -> Result<Operand> {
        let op = if dec { Op::Sub } else { Op::Add };
        if let Expr::Ident(name) = target {
            let var = self.var_operand(name).ok_or_else(|| self.err_undef(name))?;
            let old = self.temp();
            self.push(Instr::un(Op::Load, old.clone(), var.clone()));
            let new = self.temp();
            self.push(Instr::bin(op, new.clone(), old.clone(), Operand::imm(1)));
            self.push(Instr::un(Op::Store, var, new.clone()));
            return Ok(if postfix { old } else { new });
        }
        // Other lvalues go through the generic assignment path.
        let old = self.expr(target)?;
        let new = self.temp();
        self.push(Instr::bin(op, new.clone(), old.clone(), Operand::imm(1)));
        self.assign_to(target, new.clone())?;
        Ok(if postfix { old } else { new })
    }

    fn assign(&mut self, target: &Expr, op: Option<BinOp>, value: &Expr) -> Result<Operand> {
        let v = match op {
            // Compound assignment desugars to target = target op value.
            Some(op) => {
                let desugared = Expr::Binary {
                    op,
                    lhs: Box::new(target.clone()),
                    rhs: Box::new(value.clone()),
                };
                self.expr(&desugared)?
            }
            None => self.expr(value)?,
        };
        self.assign_to(target, v.clone())?;
        Ok(v)
    }

    fn assign_to(&mut self, target: &Expr, value: Operand) -> Result<()> {
        match target {
            Expr::Ident(name) => {
                let var = self.var_operand(name).ok_or_else(|| self.err_undef(name))?;
                if let Operand::Var { ty, .. } = &var {
                    if self.is_struct(ty) && self.types.size_of(ty) > 8 {
                        return Err(self.err_unsupported("struct assignment"));
                    }
                }
                self.push(Instr::un(Op::Store, var, value));
                Ok(())
            }
            Expr::Index { base, index } => {
                let (place, elem_ty) = self.element_place(base, index)?;
                let size = self.scalar_size(&elem_ty);
                match place {
                    Place::At(addr) => {
                        self.push(Instr::un(
                            Op::Store,
                            Operand::Ptr { base: Box::new(addr), size },
                            value,
                        ));
                    }
                    Place::Element { base, offset, global, index } => {
                        self.push(Instr::un(
                            Op::Store,
                            Operand::Array { base, offset, global, index, size },
                            value,
                        ));
                    }
                }
                Ok(())
            }
            Expr::Member { base, member, arrow } => {
                let (addr, size, _) = self.member_ref(base, member, *arrow)?;
                self.push(Instr::un(
                    Op::Store,
                    Operand::Ptr { base: Box::new(addr), size },
                    value,
                ));
                Ok(())
            }
            Expr::Unary { op: UnOp::Deref, expr } => {
                let p = self.expr(expr)?;
                let size = match self.ty_of(&p) {
                    Some(ty) => {
                        let pointee = self.strip_star(&ty);
                        if pointee.is_empty() { 8 } else { self.scalar_size(&pointee) }
                    }
                    None => 8,
                };
                self.push(Instr::un(
                    Op::Store,
                    Operand::Ptr { base: Box::new(p), size },
                    value,
                ));
                Ok(())
            }
            Expr::Cast { expr, .. } => self.assign_to(expr, value),
            _ => Err(self.err_unsupported("assignment to this expression")),
        }
    }

    /// Short-circuit `&&` / `||`.  The result merges control flow, so
    /// it lives in an anonymous stack slot rather than a temp (temps
    /// are single-assignment).
    fn short_circuit(&mut self, lhs: &Expr, rhs: &Expr, is_and: bool) -> Result<Operand> {
        let slot = self.alloc_slot(8);
        let short = self.new_label();
        let end = self.new_label();
        let (br, short_value, full_value) =
            if is_and { (Op::Jz, 0, 1) } else { (Op::Jnz, 1, 0) };
        let a = self.expr(lhs)?;
        self.push(Instr::branch(br, a, short));
        let b = self.expr(rhs)?;
        self.push(Instr::branch(br, b, short));
        self.push(Instr::un(Op::Store, Operand::Mem(slot), Operand::imm(full_value)));
        self.push(Instr::jump(Op::Jmp, end));
        self.push(Instr::label(short));
        self.push(Instr::un(Op::Store, Operand::Mem(slot), Operand::imm(short_value)));
        self.push(Instr::label(end));
        let t = self.temp();
        self.push(Instr::un(Op::Load, t.clone(), Operand::Mem(slot)));
        Ok(t)
    }

    // ------------------------------------------------------------------
    // Member and array addressing

    /// Resolve `base.member` / `base->member` to (address temp, member
    /// size, member type).
    fn member_ref(
        &mut self,
        base: &Expr,
        member: &str,
        arrow: bool,
    ) -> Result<(Operand, i64, String)> {
        let (base_operand, base_ty) = match base {
            Expr::Ident(name) if self.var_operand(name).is_some() => {
                let var = self.var_operand(name).unwrap();
                let ty = self.ty_of(&var).unwrap_or_default();
                let t = self.temp();
                if arrow {
                    // Load the pointer value, then offset through it.
                    self.push(Instr::un(Op::Load, t.clone(), var));
                } else {
                    self.push(Instr::un(Op::LoadAddr, t.clone(), var));
                }
                (t, ty)
            }
            _ => {
                let v = self.expr(base)?;
                let ty = self.ty_of(&v).ok_or_else(|| SelectError::UnknownType {
                    ty: format!("<untyped base of .{member}>"),
                    func: self.cur_func.clone(),
                })?;
                (v, ty)
            }
        };
        let def = self.types.struct_def(&base_ty).cloned().ok_or_else(|| {
            SelectError::UnknownType { ty: base_ty.clone(), func: self.cur_func.clone() }
        })?;
        let m = def.member(member).ok_or_else(|| SelectError::UnknownMember {
            member: member.to_string(),
            ty: base_ty.clone(),
            func: self.cur_func.clone(),
        })?;
        let addr = self.temp();
        self.push(Instr::bin(Op::Add, addr.clone(), base_operand, Operand::imm(m.offset)));
        Ok((addr, m.size.clamp(1, 8), m.ty.clone()))
    }

    /// Where an element lives: either a named-array `base + index`
    /// operand or a computed address.
    fn element_place(&mut self, base: &Expr, index: &Expr) -> Result<(Place, String)> {
        // Scale the index by the element size.
        if let Expr::Ident(name) = base {
            if let Some(local) = self.locals.get(name) {
                let elem_ty = local.ty.clone();
                let is_array = local.is_array;
                let offset = local.offset;
                if is_array {
                    let elem = self.types.size_of(&elem_ty).max(1);
                    let scaled = self.scaled_index(index, elem)?;
                    return Ok((
                        Place::Element {
                            base: id(name),
                            offset,
                            global: false,
                            index: Box::new(scaled),
                        },
                        elem_ty,
                    ));
                }
            }
            if let Some(g) = self.global_tys.get(name) {
                if g.is_array {
                    let elem_ty = g.ty.clone();
                    let elem = self.types.size_of(&elem_ty).max(1);
                    let scaled = self.scaled_index(index, elem)?;
                    return Ok((
                        Place::Element {
                            base: id(name),
                            offset: 0,
                            global: true,
                            index: Box::new(scaled),
                        },
                        elem_ty,
                    ));
                }
            }
        }
        // Pointer (or computed) base: evaluate, scale, add.
        let p = self.expr(base)?;
        let elem_ty = match self.ty_of(&p) {
            Some(ty) => self.strip_star(&ty),
            None => String::new(),
        };
        let elem = if elem_ty.is_empty() { 8 } else { self.types.size_of(&elem_ty).max(1) };
        let scaled = self.scaled_index(index, elem)?;
        let addr = self.temp();
        self.push(Instr::bin(Op::Add, addr.clone(), p, scaled));
        Ok((Place::At(addr), if elem_ty.is_empty() { "long".into() } else { elem_ty }))
    }

    fn scaled_index(&mut self, index: &Expr, elem: i64) -> Result<Operand> {
        let iv = self.expr(index)?;
        if let Operand::Imm(text) = &iv {
            if let Ok(n) = text.parse::<i64>() {
                return Ok(Operand::imm(n * elem));
            }
        }
        if elem == 1 {
            return Ok(iv);
        }
        let t = self.temp();
        self.push(Instr::bin(Op::Mul, t.clone(), iv, Operand::imm(elem)));
        Ok(t)
    }

    fn index_load(&mut self, base: &Expr, index: &Expr) -> Result<Operand> {
        let (place, elem_ty) = self.element_place(base, index)?;
        if self.is_struct(&elem_ty) && self.types.size_of(&elem_ty) > 8 {
            // Element is a struct: produce its address.
            let addr = match place {
                Place::At(addr) => addr,
                Place::Element { base, offset, global, index } => {
                    let base_addr = self.temp();
                    self.push(Instr::un(
                        Op::LoadAddr,
                        base_addr.clone(),
                        Operand::Addr { name: base, offset, global },
                    ));
                    let t = self.temp();
                    self.push(Instr::bin(Op::Add, t.clone(), base_addr, *index));
                    t
                }
            };
            self.set_ty(&addr, &elem_ty);
            return Ok(addr);
        }
        let size = self.scalar_size(&elem_ty);
        let t = self.temp();
        match place {
            Place::At(addr) => {
                self.push(Instr::un(
                    Op::Load,
                    t.clone(),
                    Operand::Ptr { base: Box::new(addr), size },
                ));
            }
            Place::Element { base, offset, global, index } => {
                self.push(Instr::un(
                    Op::Load,
                    t.clone(),
                    Operand::Array { base, offset, global, index, size },
                ));
            }
        }
        self.set_ty(&t, &elem_ty);
        Ok(t)
    }

    // ------------------------------------------------------------------
    // Calls

    fn call(&mut self, callee: &Expr, args: &[Expr]) -> Result<Operand> {
        let Expr::Ident(name) = callee else {
            return Err(self.err_unsupported("call through a computed function value"));
        };
        let sig = self.funcs.get(name).cloned();
        if let Some(sig) = &sig {
            if !sig.variadic && !sig.params.is_empty() && sig.params.len() != args.len() {
                return Err(SelectError::Arity {
                    callee: name.clone(),
                    expected: sig.params.len(),
                    got: args.len(),
                });
            }
        }
        let ret_ty = sig.as_ref().map(|s| s.ret.clone()).unwrap_or_else(|| "int".to_string());
        let ret_size = if self.is_struct(&ret_ty) { self.types.size_of(&ret_ty) } else { 0 };
        let large = ret_size > 16;

        // Evaluate every argument before touching the ABI registers:
        // an argument expression may itself contain a call.
        let mut values = Vec::with_capacity(args.len());
        for a in args {
            values.push(self.expr(a)?);
        }

        let regs_avail = if large { ARG_REGS.len() - 1 } else { ARG_REGS.len() };
        let n_stack = values.len().saturating_sub(regs_avail);
        let pad = n_stack % 2 == 1;
        if pad {
            self.push(Instr { op: Op::Push, dst: None, src1: Some(Operand::imm(0)), src2: None });
        }
        for v in values[regs_avail.min(values.len())..].iter().rev() {
            self.push(Instr { op: Op::Param, dst: None, src1: Some(v.clone()), src2: None });
        }
        let shift = if large { 1 } else { 0 };
        for (i, v) in values.iter().take(regs_avail).enumerate() {
            self.push(Instr::un(Op::Mov, Operand::Reg(ARG_REGS[i + shift]), v.clone()));
        }

        // The hidden-pointer load must come after the argument moves:
        // the allocator may otherwise hand rdi to an argument temp.
        let ret_slot = if large {
            let slot = self.alloc_slot(round8(ret_size));
            self.push(Instr::un(Op::LoadAddr, Operand::Reg(Reg::Rdi), Operand::Mem(slot)));
            Some(slot)
        } else {
            None
        };

        self.push(Instr {
            op: Op::Call,
            dst: Some(Operand::Label(id(name))),
            src1: None,
            src2: None,
        });
        if n_stack > 0 || pad {
            let bytes = 8 * (n_stack as i64 + pad as i64);
            self.push(Instr::bin(
                Op::Add,
                Operand::Reg(Reg::Rsp),
                Operand::Reg(Reg::Rsp),
                Operand::imm(bytes),
            ));
        }

        if let Some(slot) = ret_slot {
            let t = self.temp();
            self.push(Instr::un(Op::LoadAddr, t.clone(), Operand::Mem(slot)));
            self.set_ty(&t, &ret_ty);
            return Ok(t);
        }
        if ret_size > 8 {
            // Two-register struct return: spill rax:rdx to a fresh slot
            // and hand its address on.
            let slot = self.alloc_slot(16);
            self.push(Instr::un(Op::Store, Operand::Mem(slot), Operand::Reg(Reg::Rax)));
            self.push(Instr::un(Op::Store, Operand::Mem(slot + 8), Operand::Reg(Reg::Rdx)));
            let t = self.temp();
            self.push(Instr::un(Op::LoadAddr, t.clone(), Operand::Mem(slot)));
            self.set_ty(&t, &ret_ty);
            return Ok(t);
        }
        let t = self.temp();
        self.push(Instr::un(Op::Mov, t.clone(), Operand::Reg(Reg::Rax)));
        self.set_ty(&t, &ret_ty);
        Ok(t)
    }

    /// Static size of an expression for `sizeof` without a type name.
    fn size_of_expr(&self, e: &Expr) -> i64 {
        match e {
            Expr::Num(_) => 4,
            Expr::Float(_) => 8,
            Expr::Str(s) => s.len() as i64 + 1,
            Expr::Ident(name) => {
                if let Some(local) = self.locals.get(name) {
                    if local.is_array {
                        return local.size;
                    }
                    return self.types.size_of(&local.ty);
                }
                if let Some(g) = self.global_tys.get(name) {
                    return g.size;
                }
                8
            }
            Expr::Unary { op: UnOp::Deref, expr } => match self.static_ty(expr) {
                Some(ty) => self.types.size_of(&self.strip_star(&ty)),
                None => 8,
            },
            Expr::Cast { ty, .. } => self.types.size_of(ty),
            _ => 8,
        }
    }

    fn static_ty(&self, e: &Expr) -> Option<String> {
        match e {
            Expr::Ident(name) => self
                .locals
                .get(name)
                .map(|l| l.ty.clone())
                .or_else(|| self.global_tys.get(name).map(|g| g.ty.clone())),
            Expr::Cast { ty, .. } => Some(ty.clone()),
            _ => None,
        }
    }
}

/// A storage location for an array element.
enum Place {
    /// Computed address held in a temp.
    At(Operand),
    /// Named base plus a byte index (the `Array` operand form).
    Element {
        base: Id,
        offset: i64,
        global: bool,
        index: Box<Operand>,
    },
}

fn bin_op(op: BinOp) -> Op {
    match op {
        BinOp::Add => Op::Add,
        BinOp::Sub => Op::Sub,
        BinOp::Mul => Op::Mul,
        BinOp::Div => Op::Div,
        BinOp::Mod => Op::Mod,
        BinOp::And => Op::And,
        BinOp::Or => Op::Or,
        BinOp::Xor => Op::Xor,
        BinOp::Shl => Op::Shl,
        BinOp::Shr => Op::Shr,
        BinOp::Eq => Op::Eq,
        BinOp::Ne => Op::Ne,
        BinOp::Lt => Op::Lt,
        BinOp::Le => Op::Le,
        BinOp::Gt => Op::Gt,
        BinOp::Ge => Op::Ge,
        BinOp::LogAnd | BinOp::LogOr => unreachable!("short-circuit ops lowered separately"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::front::parse;

    fn lower_src(src: &str) -> Module {
        let parsed = parse::parse(src).unwrap();
        lower(&parsed.program, parsed.types, parsed.funcs).unwrap()
    }

    fn func_range<'m>(m: &'m Module, name: &str) -> &'m [Instr] {
        let f = m.funcs.iter().find(|f| f.name.as_str() == name).unwrap();
        &m.code[f.start..f.end]
    }

    #[test]
    fn single_def_temps() {
        let m = lower_src(
            "int add(int a, int b) { return a + b; }\n\
             int main() { int x = add(1, 2); return x * 3; }",
        );
        let mut seen = std::collections::BTreeSet::new();
        for i in &m.code {
            if let Some(Operand::Temp(t)) = &i.dst {
                assert!(seen.insert(*t), "temp t{t} defined twice");
            }
        }
    }

    #[test]
    fn incdec_loads_and_stores_back() {
        let m = lower_src("int main() { int i = 0; i++; return i; }");
        let code = func_range(&m, "main");
        let load = code.iter().position(|i| {
            i.op == Op::Load && matches!(&i.src1, Some(Operand::Var { name, .. }) if name.as_str() == "i")
        });
        let store = code.iter().rposition(|i| {
            i.op == Op::Store && matches!(&i.dst, Some(Operand::Var { name, .. }) if name.as_str() == "i")
        });
        let (load, store) = (load.expect("no load of i"), store.expect("no store of i"));
        assert!(load < store, "increment must store back after loading");
    }

    #[test]
    fn for_loop_increment_region() {
        let m = lower_src("int main() { int sum = 0; for (int i = 0; i < 3; i++) sum += i; return sum; }");
        let code = func_range(&m, "main");
        // Somewhere in the stream: Load i, Add 1, Store i.
        let mut found_add_one = false;
        for i in code {
            if i.op == Op::Add {
                if let (Some(Operand::Imm(v)), Some(_)) = (&i.src2, &i.src1) {
                    if v == "1" {
                        found_add_one = true;
                    }
                }
            }
        }
        assert!(found_add_one, "expected an add-1 in the step region");
    }

    #[test]
    fn large_struct_call_ordering() {
        let src = "typedef struct Big { long a; long b; long c; long d; long e; int f; } Big;\n\
                   Big make(int x, int y, int z, int w, int v);\n\
                   int main() { Big b = make(1, 2, 3, 4, 5); return b.f; }";
        let m = lower_src(src);
        let code = func_range(&m, "main");
        let call = code.iter().position(|i| i.op == Op::Call).unwrap();
        let lea_rdi = code
            .iter()
            .position(|i| {
                i.op == Op::LoadAddr && matches!(i.dst, Some(Operand::Reg(Reg::Rdi)))
            })
            .expect("no hidden-pointer load");
        assert!(lea_rdi < call);
        // Every argument move into rsi..r9 precedes the rdi load.
        for (idx, i) in code.iter().enumerate() {
            if i.op == Op::Mov {
                if let Some(Operand::Reg(r)) = &i.dst {
                    if matches!(r, Reg::Rsi | Reg::Rdx | Reg::Rcx | Reg::R8 | Reg::R9) && idx < call
                    {
                        assert!(idx < lea_rdi, "arg move after hidden-pointer load");
                    }
                }
            }
        }
    }

    #[test]
    fn member_store_width_through_cast() {
        let src = "typedef struct Card { int id; char *owner; int kind; int flag; } Card;\n\
                   int main() { long arr[4]; ((Card*)arr[0])->flag = 1; return 0; }";
        let m = lower_src(src);
        let code = func_range(&m, "main");
        let store = code
            .iter()
            .find(|i| i.op == Op::Store && matches!(&i.dst, Some(Operand::Ptr { .. })))
            .expect("no pointer store");
        let Some(Operand::Ptr { size, .. }) = &store.dst else { unreachable!() };
        assert_eq!(*size, 4, "4-byte member must store 4 bytes");
    }

    #[test]
    fn short_circuit_branches() {
        let m = lower_src("int main() { int a = 1; int b = 0; return a && b; }");
        let code = func_range(&m, "main");
        assert!(code.iter().any(|i| i.op == Op::Jz));
        // The merged result comes back out of a pinned slot.
        assert!(code
            .iter()
            .any(|i| i.op == Op::Load && matches!(i.src1, Some(Operand::Mem(_)))));
    }

    #[test]
    fn string_and_float_pools() {
        let m = lower_src("int main() { char *s = \"hi\"; double d = 3.14; return 0; }");
        assert_eq!(m.strings.len(), 1);
        assert!(m.strings[0].0.as_str().starts_with(".str"));
        assert_eq!(m.floats.len(), 1);
        assert!(m.floats[0].0.as_str().starts_with(".FC"));
        assert_eq!(m.floats[0].1, "3.14");
    }

    #[test]
    fn function_name_as_value() {
        let src = "void handler(int sig);\n\
                   int signal(int sig, void *h);\n\
                   void handler(int sig) { }\n\
                   int main() { signal(SIGSEGV, handler); return 0; }";
        let m = lower_src(src);
        let code = func_range(&m, "main");
        assert!(code.iter().any(|i| {
            i.op == Op::Mov
                && matches!(&i.src1, Some(Operand::Label(l)) if l.as_str() == "handler")
        }));
        // SIGSEGV resolves to its number.
        assert!(code.iter().any(|i| {
            i.op == Op::Mov && matches!(&i.src1, Some(Operand::Imm(v)) if v == "11")
        }));
    }

    #[test]
    fn undefined_variable_is_fatal() {
        let parsed = parse::parse("int main() { return nope; }").unwrap();
        let err = lower(&parsed.program, parsed.types, parsed.funcs).unwrap_err();
        assert!(matches!(err, SelectError::UndefVar { .. }));
        assert!(format!("{err}").contains("main"));
    }

    #[test]
    fn switch_compares_scrutinee_once_per_case() {
        let m = lower_src(
            "int main() { int x = 2; switch (x) { case 1: return 10; case 2: return 20; default: return 0; } }",
        );
        let code = func_range(&m, "main");
        let eqs = code.iter().filter(|i| i.op == Op::Eq).count();
        assert_eq!(eqs, 2);
    }

    #[test]
    fn frame_offsets_are_negative() {
        let m = lower_src("int main() { int a = 1; int b = 2; return a + b; }");
        for i in &m.code {
            if let Some(Operand::Var { offset, global: false, .. }) = &i.dst {
                assert!(*offset < 0);
            }
        }
        assert!(m.funcs[0].frame_size >= 16);
    }
}
