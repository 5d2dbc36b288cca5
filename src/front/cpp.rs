//! The preprocessor.
//!
//! Produces a flat expanded text stream and, as a side effect, mines
//! every included header for typedefs, struct layouts, and function
//! signatures (the "harvesting" pass) so later phases can resolve
//! types without parsing the headers properly.

use std::path::{Path, PathBuf};
use std::sync::RwLock;

use derive_more::Display;
use log::debug;
use regex::Regex;

use super::ast::{FuncSig, TypeTable};
use crate::common::{Map, Set};

#[derive(Display)]
pub enum CppError {
    #[display("include not found: '{file}' (line {line})")]
    IncludeNotFound { file: String, line: u32 },
    #[display("malformed directive at line {line}: {what}")]
    Malformed { what: String, line: u32 },
    #[display("cannot read {path}: {err}")]
    Io { path: String, err: std::io::Error },
}

impl std::fmt::Debug for CppError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{self}")
    }
}

enum Macro {
    Object(String),
    Function { params: Vec<String>, body: String },
}

/// One conditional-compilation frame.
struct Cond {
    active: bool,
    taken: bool,
}

pub struct Preprocessor {
    /// Expansion helpers hold read guards while a `#define` seen
    /// mid-stream takes the write guard.
    defines: RwLock<Map<String, Macro>>,
    include_dirs: Vec<PathBuf>,
    /// Absolute paths already spliced in; repeat includes are dropped.
    processed: Set<PathBuf>,
    cond: Vec<Cond>,
    types: TypeTable,
    funcs: Map<String, FuncSig>,
    re_typedef_struct: Regex,
    re_struct_name: Regex,
    re_member: Regex,
    re_typedef: Regex,
    re_fn_decl: Regex,
    re_param: Regex,
}

impl Preprocessor {
    pub fn new(include_dirs: Vec<PathBuf>) -> Self {
        let mut defines = Map::new();
        // POSIX signal numbers, so signal(SIGSEGV, h) works without
        // a real <signal.h>.
        for (name, value) in [("SIGSEGV", "11"), ("SIGILL", "4"), ("SIGFPE", "8"), ("SIGABRT", "6")]
        {
            defines.insert(name.to_string(), Macro::Object(value.to_string()));
        }
        Preprocessor {
            defines: RwLock::new(defines),
            include_dirs,
            processed: Set::new(),
            cond: vec![],
            types: TypeTable::with_builtins(),
            funcs: Map::new(),
            re_typedef_struct: Regex::new(r"typedef\s+(struct|union)(\s+[A-Za-z_]\w*)?\s*\{")
                .unwrap(),
            re_struct_name: Regex::new(r"\A\s*([A-Za-z_]\w*)\s*;").unwrap(),
            re_member: Regex::new(
                r"\A((?:unsigned\s+|signed\s+|const\s+|struct\s+|union\s+)*[A-Za-z_]\w*)\s*(\**)\s*([A-Za-z_]\w*)\s*(?:\[\s*(\d+)\s*\])?\z",
            )
            .unwrap(),
            re_typedef: Regex::new(
                r"typedef\s+((?:unsigned\s+|signed\s+|const\s+)*[A-Za-z_]\w*(?:\s+int)?)\s*(\**)\s*([A-Za-z_]\w*)\s*;",
            )
            .unwrap(),
            re_fn_decl: Regex::new(
                r"(?m)^\s*(?:extern\s+)?((?:unsigned\s+|signed\s+|const\s+|struct\s+|union\s+)*[A-Za-z_]\w*)\s*(\**)\s*([A-Za-z_]\w*)\s*\(([^()]*)\)\s*;\s*$",
            )
            .unwrap(),
            re_param: Regex::new(
                r"\A\s*(?:const\s+)?((?:unsigned\s+|signed\s+|struct\s+|union\s+)*[A-Za-z_]\w*)\s*(\**)\s*(?:[A-Za-z_]\w*)?\s*\z",
            )
            .unwrap(),
        }
    }

    /// Hand the harvested tables forward to the parser.
    pub fn into_tables(self) -> (TypeTable, Map<String, FuncSig>) {
        (self.types, self.funcs)
    }

    pub fn preprocess_file(&mut self, path: &Path) -> Result<String, CppError> {
        let src = read(path)?;
        let dir = path.parent().unwrap_or(Path::new(".")).to_path_buf();
        self.preprocess(&src, &dir)
    }

    /// Expand `src`, resolving includes relative to `dir`.
    pub fn preprocess(&mut self, src: &str, dir: &Path) -> Result<String, CppError> {
        let out = self.process(src, dir)?;
        self.types.resolve_sizes();
        Ok(out)
    }

    fn process(&mut self, src: &str, dir: &Path) -> Result<String, CppError> {
        // Fold line continuations before anything else.
        let src = src.replace("\\\r\n", " ").replace("\\\n", " ");
        let mut out = String::with_capacity(src.len());
        for (idx, raw) in src.lines().enumerate() {
            let line = idx as u32 + 1;
            let trimmed = raw.trim_start();
            if let Some(rest) = trimmed.strip_prefix('#') {
                self.directive(rest.trim_start(), dir, line, &mut out)?;
            } else if self.active() {
                out.push_str(&self.expand(raw));
                out.push('\n');
            } else {
                out.push('\n');
            }
        }
        Ok(out)
    }

    fn active(&self) -> bool {
        self.cond.iter().all(|c| c.active)
    }

    fn parent_active(&self) -> bool {
        self.cond[..self.cond.len() - 1].iter().all(|c| c.active)
    }

    fn directive(
        &mut self,
        rest: &str,
        dir: &Path,
        line: u32,
        out: &mut String,
    ) -> Result<(), CppError> {
        let (name, arg) = match rest.find(char::is_whitespace) {
            Some(i) => (&rest[..i], rest[i..].trim()),
            None => (rest, ""),
        };
        match name {
            "ifdef" | "ifndef" => {
                let defined = self.defines.read().unwrap().contains_key(arg);
                let hit = if name == "ifdef" { defined } else { !defined };
                let active = self.active() && hit;
                self.cond.push(Cond { active, taken: active });
                out.push('\n');
            }
            "if" => {
                let active = self.active() && self.eval_cond(arg);
                self.cond.push(Cond { active, taken: active });
                out.push('\n');
            }
            "elif" => {
                if self.cond.is_empty() {
                    return Err(CppError::Malformed { what: "#elif without #if".into(), line });
                }
                let parent = self.parent_active();
                let taken = self.cond.last().unwrap().taken;
                let active = parent && !taken && self.eval_cond(arg);
                let top = self.cond.last_mut().unwrap();
                top.active = active;
                top.taken |= active;
                out.push('\n');
            }
            "else" => {
                if self.cond.is_empty() {
                    return Err(CppError::Malformed { what: "#else without #if".into(), line });
                }
                let parent = self.parent_active();
                let top = self.cond.last_mut().unwrap();
                top.active = parent && !top.taken;
                top.taken = true;
                out.push('\n');
            }
            "endif" => {
                if self.cond.pop().is_none() {
                    return Err(CppError::Malformed { what: "#endif without #if".into(), line });
                }
                out.push('\n');
            }
            _ if !self.active() => out.push('\n'),
            "include" => self.include(arg, dir, line, out)?,
            "define" => {
                self.define(arg, line)?;
                out.push('\n');
            }
            "undef" => {
                self.defines.write().unwrap().remove(arg);
                out.push('\n');
            }
            "pragma" => out.push('\n'),
            "error" => {
                return Err(CppError::Malformed { what: format!("#error {arg}"), line });
            }
            other => {
                return Err(CppError::Malformed { what: format!("unknown directive #{other}"), line });
            }
        }
        Ok(())
    }

    fn define(&mut self, arg: &str, line: u32) -> Result<(), CppError> {
        let name_end = arg
            .find(|c: char| !(c.is_alphanumeric() || c == '_'))
            .unwrap_or(arg.len());
        if name_end == 0 {
            return Err(CppError::Malformed { what: format!("#define {arg}"), line });
        }
        let name = &arg[..name_end];
        let rest = &arg[name_end..];
        // Function-like only when '(' hugs the name.
        if let Some(params_rest) = rest.strip_prefix('(') {
            let close = params_rest.find(')').ok_or_else(|| CppError::Malformed {
                what: format!("#define {name}: missing ')'"),
                line,
            })?;
            let params = params_rest[..close]
                .split(',')
                .map(|p| p.trim().to_string())
                .filter(|p| !p.is_empty())
                .collect();
            let body = params_rest[close + 1..].trim().to_string();
            self.defines
                .write()
                .unwrap()
                .insert(name.to_string(), Macro::Function { params, body });
        } else {
            self.defines
                .write()
                .unwrap()
                .insert(name.to_string(), Macro::Object(rest.trim().to_string()));
        }
        Ok(())
    }

    fn include(
        &mut self,
        arg: &str,
        dir: &Path,
        line: u32,
        out: &mut String,
    ) -> Result<(), CppError> {
        let (name, system) = if let Some(inner) = arg.strip_prefix('<') {
            (inner.trim_end_matches('>'), true)
        } else if let Some(inner) = arg.strip_prefix('"') {
            (inner.trim_end_matches('"'), false)
        } else {
            return Err(CppError::Malformed { what: format!("#include {arg}"), line });
        };

        let resolved = self.resolve_include(name, dir);
        let path = match resolved {
            Some(p) => p,
            None if system => {
                // Standard headers are covered by the built-in tables.
                out.push_str(&format!("/* <{name}> */\n"));
                return Ok(());
            }
            None => return Err(CppError::IncludeNotFound { file: name.to_string(), line }),
        };

        let canon = path.canonicalize().unwrap_or_else(|_| path.clone());
        if !self.processed.insert(canon) {
            out.push('\n');
            return Ok(());
        }
        debug!("including {}", path.display());
        let src = read(&path)?;
        // Mine types and signatures from the raw text first.
        self.harvest(&src);
        let sub_dir = path.parent().unwrap_or(Path::new(".")).to_path_buf();
        let expanded = self.process(&src, &sub_dir)?;
        out.push_str(&expanded);
        Ok(())
    }

    fn resolve_include(&self, name: &str, dir: &Path) -> Option<PathBuf> {
        let as_path = Path::new(name);
        if as_path.is_absolute() {
            return as_path.exists().then(|| as_path.to_path_buf());
        }
        let local = dir.join(name);
        if local.exists() {
            return Some(local);
        }
        self.include_dirs
            .iter()
            .map(|d| d.join(name))
            .find(|p| p.exists())
    }

    /// Evaluate a `#if` / `#elif` expression.  Supported forms:
    /// `defined(X)`, `!defined(X)`, integer literals, and macros
    /// defined to integer literals.  Anything else is false.
    fn eval_cond(&self, expr: &str) -> bool {
        let expr = expr.trim();
        if let Some(rest) = expr.strip_prefix('!') {
            return !self.eval_cond(rest);
        }
        if let Some(rest) = expr.strip_prefix("defined") {
            let name = rest.trim().trim_start_matches('(').trim_end_matches(')').trim();
            return self.defines.read().unwrap().contains_key(name);
        }
        if let Ok(v) = expr.parse::<i64>() {
            return v != 0;
        }
        if let Some(Macro::Object(body)) = self.defines.read().unwrap().get(expr) {
            if let Ok(v) = body.trim().parse::<i64>() {
                return v != 0;
            }
        }
        false
    }

    /// Expand macros in one line.  Identifiers are matched whole;
    /// replacement text is rescanned from its start.  String and
    /// character literals are left alone.
    fn expand(&self, line: &str) -> String {
        let mut text = line.to_string();
        let mut i = 0;
        while i < text.len() {
            let bytes = text.as_bytes();
            let c = bytes[i];
            if c == b'"' || c == b'\'' {
                i += skip_quoted(&text[i..], c);
                continue;
            }
            if !(c.is_ascii_alphabetic() || c == b'_') {
                i += 1;
                continue;
            }
            let start = i;
            let mut end = i;
            while end < bytes.len()
                && (bytes[end].is_ascii_alphanumeric() || bytes[end] == b'_')
            {
                end += 1;
            }
            let word = text[start..end].to_string();
            let guard = self.defines.read().unwrap();
            match guard.get(&word) {
                Some(Macro::Object(body)) => {
                    let body = body.clone();
                    drop(guard);
                    text.replace_range(start..end, &body);
                    i = start;
                }
                Some(Macro::Function { params, body }) => {
                    let params = params.clone();
                    let body = body.clone();
                    drop(guard);
                    // Invocation requires a '(' after optional spaces.
                    let mut j = end;
                    while j < text.len() && text.as_bytes()[j] == b' ' {
                        j += 1;
                    }
                    if j >= text.len() || text.as_bytes()[j] != b'(' {
                        i = end;
                        continue;
                    }
                    match parse_args(&text[j..]) {
                        Some((args, consumed)) => {
                            let mut subst = Map::new();
                            for (p, a) in params.iter().zip(args.iter()) {
                                subst.insert(p.clone(), a.trim().to_string());
                            }
                            let repl = replace_idents(&body, &subst);
                            text.replace_range(start..j + consumed, &repl);
                            i = start;
                        }
                        None => i = end,
                    }
                }
                None => {
                    drop(guard);
                    i = end;
                }
            }
        }
        text
    }

    /// The harvesting pass: scan raw header text for `typedef struct`,
    /// plain `typedef`, and function-declaration forms.  Bodies that do
    /// not match are skipped silently; the parser may understand them.
    fn harvest(&mut self, src: &str) {
        self.harvest_typedef_structs(src);
        for cap in self.re_typedef.captures_iter(src) {
            let base = cap[1].trim().to_string();
            if matches!(base.as_str(), "struct" | "union" | "enum") {
                continue;
            }
            let alias = format!("{}{}", base, &cap[2]);
            self.types.typedefs.insert(cap[3].to_string(), alias);
        }
        let fn_caps: Vec<(String, String, String, String)> = self
            .re_fn_decl
            .captures_iter(src)
            .map(|cap| {
                (cap[1].trim().to_string(), cap[2].to_string(), cap[3].to_string(), cap[4].to_string())
            })
            .collect();
        for (base, stars, fname, params) in fn_caps {
            if matches!(base.as_str(), "typedef" | "return" | "else") {
                continue;
            }
            let ret = format!("{base}{stars}");
            let mut sig = FuncSig { ret, params: vec![], variadic: false };
            let plist = params.trim();
            if !(plist.is_empty() || plist == "void") {
                let mut ok = true;
                for p in plist.split(',') {
                    if p.trim() == "..." {
                        sig.variadic = true;
                        continue;
                    }
                    match self.re_param.captures(p) {
                        Some(pc) => sig.params.push(format!("{}{}", pc[1].trim(), &pc[2])),
                        None => {
                            ok = false;
                            break;
                        }
                    }
                }
                if !ok {
                    continue;
                }
            }
            debug!("harvested signature: {fname}");
            self.funcs.insert(fname, sig);
        }
    }

    fn harvest_typedef_structs(&mut self, src: &str) {
        let caps: Vec<(usize, Option<String>)> = self
            .re_typedef_struct
            .captures_iter(src)
            .map(|cap| {
                let open = cap.get(0).unwrap().end() - 1;
                let tag = cap.get(2).map(|m| m.as_str().trim().to_string());
                (open, tag)
            })
            .collect();
        for (open, tag) in caps {
            let Some(close) = match_brace(src, open) else { continue };
            let body = &src[open + 1..close];
            let Some(name_cap) = self.re_struct_name.captures(&src[close + 1..]) else {
                continue;
            };
            let name = name_cap[1].to_string();
            let mut raw = vec![];
            let mut ok = true;
            for entry in body.split(';') {
                let entry = entry.trim();
                if entry.is_empty() {
                    continue;
                }
                match self.re_member.captures(entry) {
                    Some(mc) => {
                        let ty = format!("{}{}", mc[1].trim(), &mc[2]);
                        let explicit = match mc.get(4) {
                            Some(n) => {
                                let len: i64 = n.as_str().parse().unwrap_or(1);
                                self.types.size_of(&ty) * len
                            }
                            None => 0,
                        };
                        raw.push((mc[3].to_string(), ty, explicit));
                    }
                    None => {
                        // Unmined member form (function pointer, bit-field);
                        // skip the whole struct silently.
                        ok = false;
                        break;
                    }
                }
            }
            if !ok {
                continue;
            }
            let tag_key = tag.clone().unwrap_or_else(|| name.clone());
            self.types.define_struct(&tag_key, raw.clone());
            if tag.is_some() && tag_key != name {
                self.types.define_struct(&name, raw);
            }
            self.types
                .typedefs
                .insert(name.clone(), format!("struct {tag_key}"));
            debug!("harvested struct {tag_key} ({name})");
        }
    }
}

fn read(path: &Path) -> Result<String, CppError> {
    std::fs::read_to_string(path).map_err(|err| CppError::Io {
        path: path.display().to_string(),
        err,
    })
}

/// Byte length of a quoted literal starting at the head of `s`.
fn skip_quoted(s: &str, quote: u8) -> usize {
    let bytes = s.as_bytes();
    let mut i = 1;
    while i < bytes.len() {
        match bytes[i] {
            b'\\' => i += 2,
            b if b == quote => return i + 1,
            _ => i += 1,
        }
    }
    s.len()
}

/// Find the `}` matching the `{` at `open`.
fn match_brace(s: &str, open: usize) -> Option<usize> {
    let mut depth = 0;
    for (i, b) in s.bytes().enumerate().skip(open) {
        match b {
            b'{' => depth += 1,
            b'}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(i);
                }
            }
            _ => {}
        }
    }
    None
}

/// Parse a parenthesized, comma-separated argument list starting at the
/// `(` heading `s`.  Returns the arguments and the number of bytes
/// consumed (including both parens).  Nested parens and quoted commas
/// stay intact.
fn parse_args(s: &str) -> Option<(Vec<String>, usize)> {
    let bytes = s.as_bytes();
    let mut depth = 0;
    let mut args = vec![];
    let mut cur = String::new();
    let mut i = 0;
    while i < bytes.len() {
        let b = bytes[i];
        match b {
            b'"' | b'\'' => {
                let len = skip_quoted(&s[i..], b);
                cur.push_str(&s[i..i + len]);
                i += len;
                continue;
            }
            b'(' => {
                depth += 1;
                if depth > 1 {
                    cur.push('(');
                }
            }
            b')' => {
                depth -= 1;
                if depth == 0 {
                    if !cur.trim().is_empty() || !args.is_empty() {
                        args.push(cur);
                    }
                    return Some((args, i + 1));
                }
                cur.push(')');
            }
            b',' if depth == 1 => {
                args.push(std::mem::take(&mut cur));
            }
            _ => cur.push(b as char),
        }
        i += 1;
    }
    None
}

/// Replace whole-identifier occurrences per the substitution map.
fn replace_idents(body: &str, subst: &Map<String, String>) -> String {
    let bytes = body.as_bytes();
    let mut out = String::with_capacity(body.len());
    let mut i = 0;
    while i < bytes.len() {
        let c = bytes[i];
        if c == b'"' || c == b'\'' {
            let len = skip_quoted(&body[i..], c);
            out.push_str(&body[i..i + len]);
            i += len;
            continue;
        }
        if c.is_ascii_alphabetic() || c == b'_' {
            let start = i;
            while i < bytes.len() && (bytes[i].is_ascii_alphanumeric() || bytes[i] == b'_') {
                i += 1;
            }
            let word = &body[start..i];
            match subst.get(word) {
                Some(repl) => out.push_str(repl),
                None => out.push_str(word),
            }
            continue;
        }
        out.push(c as char);
        i += 1;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pp(src: &str) -> String {
        let mut cpp = Preprocessor::new(vec![]);
        cpp.preprocess(src, Path::new(".")).unwrap()
    }

    #[test]
    fn object_macro_whole_word_only() {
        let out = pp("#define N 10\nint x = N; int y = NN;\n");
        assert!(out.contains("int x = 10;"));
        assert!(out.contains("int y = NN;"));
    }

    #[test]
    fn function_macro_balanced_args() {
        let out = pp("#define MAX(a, b) ((a) > (b) ? (a) : (b))\nint m = MAX(f(1, 2), 3);\n");
        assert!(out.contains("((f(1, 2)) > (3) ? (f(1, 2)) : (3))"));
    }

    #[test]
    fn rescan_expands_nested_macros() {
        let out = pp("#define A B\n#define B 42\nint x = A;\n");
        assert!(out.contains("int x = 42;"));
    }

    #[test]
    fn conditional_stack() {
        let out = pp("#define YES 1\n#if YES\nint a;\n#else\nint b;\n#endif\n");
        assert!(out.contains("int a;"));
        assert!(!out.contains("int b;"));
    }

    #[test]
    fn elif_only_after_untaken() {
        let out = pp("#if 0\nint a;\n#elif 1\nint b;\n#elif 1\nint c;\n#else\nint d;\n#endif\n");
        assert!(!out.contains("int a;"));
        assert!(out.contains("int b;"));
        assert!(!out.contains("int c;"));
        assert!(!out.contains("int d;"));
    }

    #[test]
    fn defined_operator() {
        let out = pp("#define X\n#if defined(X)\nint a;\n#endif\n#if !defined(Y)\nint b;\n#endif\n");
        assert!(out.contains("int a;"));
        assert!(out.contains("int b;"));
    }

    #[test]
    fn unknown_condition_is_false() {
        let out = pp("#if SOME_UNKNOWN\nint a;\n#endif\nint b;\n");
        assert!(!out.contains("int a;"));
        assert!(out.contains("int b;"));
    }

    #[test]
    fn missing_system_header_is_skipped() {
        let out = pp("#include <stdio.h>\nint main() { return 0; }\n");
        assert!(out.contains("/* <stdio.h> */"));
    }

    #[test]
    fn missing_local_header_is_fatal() {
        let mut cpp = Preprocessor::new(vec![]);
        let err = cpp.preprocess("#include \"nope.h\"\n", Path::new(".")).unwrap_err();
        assert!(matches!(err, CppError::IncludeNotFound { .. }));
    }

    #[test]
    fn harvest_typedef_struct() {
        let mut cpp = Preprocessor::new(vec![]);
        cpp.harvest(
            "typedef struct Texture {\n  unsigned int id;\n  int width;\n  int height;\n} Texture2D;\n",
        );
        cpp.types.resolve_sizes();
        assert_eq!(cpp.types.resolve("Texture2D"), "struct Texture");
        let def = cpp.types.struct_def("Texture2D").unwrap();
        assert_eq!(def.size, 12);
        assert_eq!(def.member("height").unwrap().offset, 8);
    }

    #[test]
    fn harvest_plain_typedef_and_signature() {
        let mut cpp = Preprocessor::new(vec![]);
        cpp.harvest("typedef unsigned long word_t;\nint puts(const char *s);\nvoid exit(int code);\n");
        assert_eq!(cpp.types.resolve("word_t"), "unsigned long");
        let sig = &cpp.funcs["puts"];
        assert_eq!(sig.ret, "int");
        assert_eq!(sig.params, vec!["char*".to_string()]);
        assert_eq!(cpp.funcs["exit"].params, vec!["int".to_string()]);
    }

    #[test]
    fn signal_constants_seeded() {
        let cpp = Preprocessor::new(vec![]);
        assert!(cpp.eval_cond("defined(SIGSEGV)"));
        assert!(cpp.eval_cond("SIGSEGV"));
    }
}
