//! The abstract syntax tree and the type tables that travel with it.
//!
//! Types are carried as plain strings (`"int"`, `"struct Point"`,
//! `"char**"`); pointer depth is the number of trailing `*`s.  That is
//! deliberately not a type system: the few places that need type
//! information (member access, sizeof, casts) resolve the string
//! against the tables below on demand.

use crate::common::Map;

#[derive(Debug, Clone)]
pub struct Program {
    pub stmts: Vec<Stmt>,
}

/// A statement, tagged with the source line it started on.
#[derive(Debug, Clone)]
pub struct Stmt {
    pub line: u32,
    pub kind: StmtKind,
}

#[derive(Debug, Clone)]
pub enum StmtKind {
    Func(FuncDef),
    VarDecl(VarDecl),
    Block(Vec<Stmt>),
    If {
        cond: Expr,
        then: Vec<Stmt>,
        els: Vec<Stmt>,
    },
    While {
        cond: Expr,
        body: Vec<Stmt>,
    },
    DoWhile {
        body: Vec<Stmt>,
        cond: Expr,
    },
    For {
        init: Option<Box<Stmt>>,
        cond: Option<Expr>,
        step: Option<Box<Stmt>>,
        body: Vec<Stmt>,
    },
    Switch {
        scrutinee: Expr,
        cases: Vec<SwitchCase>,
    },
    Break,
    Continue,
    Return(Option<Expr>),
    Expr(Expr),
}

/// One `case value:` arm (or `default:` when `value` is `None`).
#[derive(Debug, Clone)]
pub struct SwitchCase {
    pub value: Option<Expr>,
    pub body: Vec<Stmt>,
}

#[derive(Debug, Clone)]
pub struct FuncDef {
    pub name: String,
    pub ret: String,
    pub params: Vec<Param>,
    pub variadic: bool,
    pub body: Vec<Stmt>,
}

#[derive(Debug, Clone)]
pub struct Param {
    pub name: String,
    pub ty: String,
}

#[derive(Debug, Clone)]
pub struct VarDecl {
    pub name: String,
    pub ty: String,
    /// `Some(n)` for `T name[n]`.
    pub array_len: Option<i64>,
    pub init: Option<Expr>,
    pub is_extern: bool,
}

#[derive(Debug, Clone)]
pub enum Expr {
    Num(i64),
    /// Floating literal, kept as source text until pooled.
    Float(String),
    Str(String),
    Ident(String),
    Assign {
        target: Box<Expr>,
        /// `Some(op)` for compound forms (`+=` etc.), which desugar to
        /// `target = target op value`.
        op: Option<BinOp>,
        value: Box<Expr>,
    },
    Binary {
        op: BinOp,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },
    Unary {
        op: UnOp,
        expr: Box<Expr>,
    },
    IncDec {
        target: Box<Expr>,
        dec: bool,
        postfix: bool,
    },
    Call {
        callee: Box<Expr>,
        args: Vec<Expr>,
    },
    Index {
        base: Box<Expr>,
        index: Box<Expr>,
    },
    Member {
        base: Box<Expr>,
        member: String,
        arrow: bool,
    },
    Cast {
        ty: String,
        expr: Box<Expr>,
    },
    Ternary {
        cond: Box<Expr>,
        then: Box<Expr>,
        els: Box<Expr>,
    },
    /// `(T){ .a = x, 1 }`; positional fields carry an empty name.
    CompoundLit {
        ty: String,
        fields: Vec<(String, Expr)>,
    },
    /// GNU statement expression `({ ... })`.
    StmtExpr(Vec<Stmt>),
    SizeofType(String),
    SizeofExpr(Box<Expr>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    And,
    Or,
    Xor,
    Shl,
    Shr,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    LogAnd,
    LogOr,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnOp {
    Neg,
    /// Logical `!`.
    Not,
    /// Bitwise `~`.
    BitNot,
    Deref,
    AddrOf,
}

/// One struct member with its computed layout.
#[derive(Debug, Clone)]
pub struct StructMember {
    pub name: String,
    pub ty: String,
    pub offset: i64,
    pub size: i64,
}

#[derive(Debug, Clone)]
pub struct StructDef {
    pub members: Vec<StructMember>,
    pub size: i64,
}

impl StructDef {
    pub fn member(&self, name: &str) -> Option<&StructMember> {
        self.members.iter().find(|m| m.name == name)
    }
}

/// A function signature as harvested from headers or parsed from source.
#[derive(Debug, Clone)]
pub struct FuncSig {
    pub ret: String,
    pub params: Vec<String>,
    pub variadic: bool,
}

/// Iteration bound for typedef chains and struct-size fixed points;
/// cycles give up and fall back to pointer size.
const RESOLVE_CAP: usize = 10;

/// Typedef, struct, and enum tables.  Populated by header harvesting
/// and extended by the parser; the instruction selector consumes them.
#[derive(Debug, Clone, Default)]
pub struct TypeTable {
    /// alias -> canonical type string, e.g. `Texture2D -> struct Texture`.
    pub typedefs: Map<String, String>,
    /// struct tag (or typedef name) -> layout.
    pub structs: Map<String, StructDef>,
    /// enum constant -> value.
    pub enums: Map<String, i64>,
}

impl TypeTable {
    /// A table pre-seeded with the stdint / POSIX aliases the built-in
    /// headers would otherwise have to supply.
    pub fn with_builtins() -> Self {
        let mut t = TypeTable::default();
        for (alias, base) in [
            ("int8_t", "char"),
            ("int16_t", "short"),
            ("int32_t", "int"),
            ("int64_t", "long"),
            ("uint8_t", "unsigned char"),
            ("uint16_t", "unsigned short"),
            ("uint32_t", "unsigned int"),
            ("uint64_t", "unsigned long"),
            ("intptr_t", "long"),
            ("uintptr_t", "unsigned long"),
            ("size_t", "unsigned long"),
            ("ssize_t", "long"),
            ("ptrdiff_t", "long"),
            ("off_t", "long"),
        ] {
            t.typedefs.insert(alias.into(), base.into());
        }
        t
    }

    /// Follow typedef aliases to a canonical type string.  Pointer
    /// suffixes on the alias are preserved: `LevelPtr` defined as
    /// `Level*` resolves through `Level`.
    pub fn resolve(&self, ty: &str) -> String {
        let mut cur = ty.trim().to_string();
        for _ in 0..RESOLVE_CAP {
            let (base, stars) = split_pointer(&cur);
            match self.typedefs.get(base) {
                Some(next) => cur = format!("{}{}", next, "*".repeat(stars)),
                None => break,
            }
        }
        cur
    }

    /// Size of a primitive type name, if it is one.
    pub fn primitive_size(ty: &str) -> Option<i64> {
        let stripped = ty
            .trim()
            .trim_start_matches("unsigned ")
            .trim_start_matches("signed ")
            .trim();
        Some(match stripped {
            "char" => 1,
            "short" | "short int" => 2,
            "int" | "unsigned" | "signed" => 4,
            "long" | "long int" | "long long" | "long long int" => 8,
            "float" => 4,
            "double" => 8,
            "void" => 0,
            _ => return None,
        })
    }

    /// Byte size of an arbitrary type string.  Pointers are 8 bytes;
    /// unknown types default to pointer size.
    pub fn size_of(&self, ty: &str) -> i64 {
        let resolved = self.resolve(ty);
        let (base, stars) = split_pointer(&resolved);
        if stars > 0 {
            return 8;
        }
        if let Some(sz) = Self::primitive_size(base) {
            return sz;
        }
        if let Some(def) = self.struct_def(base) {
            return def.size;
        }
        if base.starts_with("enum") || self.enums.contains_key(base) {
            return 4;
        }
        8
    }

    /// Look up the struct definition behind a type string: resolve
    /// typedefs, strip pointer suffixes, strip a `struct ` / `union `
    /// prefix, then consult the struct table.
    pub fn struct_def(&self, ty: &str) -> Option<&StructDef> {
        let resolved = self.resolve(ty);
        let (base, _) = split_pointer(&resolved);
        let tag = base
            .trim()
            .strip_prefix("struct ")
            .or_else(|| base.trim().strip_prefix("union "))
            .unwrap_or(base.trim());
        self.structs.get(tag)
    }

    /// Register a struct from raw `(name, type, explicit size)` member
    /// triples, computing packed offsets.  A `size` of 0 means "look the
    /// type up"; unresolved struct members start at 0 and are fixed up
    /// by [`TypeTable::resolve_sizes`].
    pub fn define_struct(&mut self, tag: &str, raw: Vec<(String, String, i64)>) {
        let mut members = Vec::with_capacity(raw.len());
        let mut offset = 0;
        for (name, ty, explicit) in raw {
            let size = if explicit > 0 { explicit } else { self.member_size(&ty) };
            members.push(StructMember { name, ty, offset, size });
            offset += size;
        }
        self.structs.insert(tag.to_string(), StructDef { members, size: offset });
    }

    fn member_size(&self, ty: &str) -> i64 {
        let resolved = self.resolve(ty);
        let (base, stars) = split_pointer(&resolved);
        if stars > 0 {
            return 8;
        }
        if let Some(sz) = Self::primitive_size(base) {
            return sz;
        }
        if let Some(def) = self.struct_def(base) {
            return def.size;
        }
        // Not resolvable yet; resolve_sizes revisits it.
        0
    }

    /// Iterate struct sizing to a fixed point so struct-typed members
    /// defined later (or mutually recursive via pointers) settle.
    /// Members that never resolve are treated as pointer-sized.
    pub fn resolve_sizes(&mut self) {
        for round in 0..RESOLVE_CAP {
            let mut changed = false;
            let tags: Vec<String> = self.structs.keys().cloned().collect();
            for tag in tags {
                let raw: Vec<(String, String, i64)> = self.structs[&tag]
                    .members
                    .iter()
                    .map(|m| (m.name.clone(), m.ty.clone(), 0))
                    .collect();
                let mut members = Vec::with_capacity(raw.len());
                let mut offset = 0;
                for (name, ty, _) in raw {
                    let mut size = self.member_size(&ty);
                    if size == 0 && round == RESOLVE_CAP - 1 {
                        size = 8;
                    }
                    members.push(StructMember { name, ty, offset, size });
                    offset += size;
                }
                let def = self.structs.get_mut(&tag).unwrap();
                if def.size != offset
                    || def.members.iter().zip(&members).any(|(a, b)| a.size != b.size)
                {
                    changed = true;
                    *def = StructDef { members, size: offset };
                }
            }
            if !changed {
                break;
            }
        }
    }
}

/// Split a type string into its base and its pointer depth.  Pointer
/// markers only ever appear as a trailing run in our type strings.
pub fn split_pointer(ty: &str) -> (&str, usize) {
    let trimmed = ty.trim();
    let base = trimmed.trim_end_matches(|c: char| c == '*' || c.is_whitespace());
    let stars = trimmed[base.len()..].chars().filter(|c| *c == '*').count();
    (base, stars)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_pointer_depths() {
        assert_eq!(split_pointer("int"), ("int", 0));
        assert_eq!(split_pointer("int*"), ("int", 1));
        assert_eq!(split_pointer("char **"), ("char", 2));
        assert_eq!(split_pointer("struct Point *"), ("struct Point", 1));
    }

    #[test]
    fn primitive_sizes() {
        assert_eq!(TypeTable::primitive_size("char"), Some(1));
        assert_eq!(TypeTable::primitive_size("short"), Some(2));
        assert_eq!(TypeTable::primitive_size("int"), Some(4));
        assert_eq!(TypeTable::primitive_size("long"), Some(8));
        assert_eq!(TypeTable::primitive_size("unsigned long"), Some(8));
        assert_eq!(TypeTable::primitive_size("double"), Some(8));
        assert_eq!(TypeTable::primitive_size("void"), Some(0));
        assert_eq!(TypeTable::primitive_size("struct S"), None);
    }

    #[test]
    fn typedef_resolution_keeps_pointers() {
        let mut t = TypeTable::default();
        t.typedefs.insert("Texture2D".into(), "struct Texture".into());
        assert_eq!(t.resolve("Texture2D"), "struct Texture");
        assert_eq!(t.resolve("Texture2D*"), "struct Texture*");
    }

    #[test]
    fn builtin_aliases() {
        let t = TypeTable::with_builtins();
        assert_eq!(t.size_of("uint8_t"), 1);
        assert_eq!(t.size_of("size_t"), 8);
        assert_eq!(t.size_of("int32_t*"), 8);
    }

    #[test]
    fn packed_struct_layout() {
        let mut t = TypeTable::default();
        t.define_struct(
            "Card",
            vec![
                ("id".into(), "int".into(), 0),
                ("owner".into(), "char*".into(), 0),
                ("kind".into(), "int".into(), 0),
                ("flag".into(), "int".into(), 0),
            ],
        );
        let def = t.struct_def("struct Card").unwrap();
        assert_eq!(def.member("flag").unwrap().offset, 16);
        assert_eq!(def.member("flag").unwrap().size, 4);
        assert_eq!(def.size, 20);
    }

    #[test]
    fn struct_member_fixed_point() {
        let mut t = TypeTable::default();
        // Inner defined after outer references it.
        t.define_struct(
            "Outer",
            vec![("a".into(), "struct Inner".into(), 0), ("b".into(), "int".into(), 0)],
        );
        t.define_struct(
            "Inner",
            vec![("x".into(), "long".into(), 0), ("y".into(), "long".into(), 0)],
        );
        t.resolve_sizes();
        let outer = t.struct_def("struct Outer").unwrap();
        assert_eq!(outer.size, 20);
        assert_eq!(outer.member("b").unwrap().offset, 16);
    }

    #[test]
    fn self_referential_struct_via_pointer() {
        let mut t = TypeTable::default();
        t.define_struct(
            "Node",
            vec![("value".into(), "int".into(), 0), ("next".into(), "struct Node*".into(), 0)],
        );
        t.resolve_sizes();
        assert_eq!(t.struct_def("struct Node").unwrap().size, 12);
    }
}
