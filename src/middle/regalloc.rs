//! Register allocation.
//!
//! Two interchangeable strategies over the same IR stream: graph
//! coloring (default) and linear scan.  Both compute live intervals in
//! one pass, assign each temp a register or a spill slot, and rewrite
//! the operands in place; `Reg` and `Mem` operands placed by the
//! selector bypass allocation entirely.
//!
//! Generated functions preserve nothing but rbp, so no register
//! survives a call.  Temps whose interval crosses a `Call` are
//! therefore sent straight to stack slots; everything else competes
//! for the 14 usable registers.

use derive_more::Display;
use log::debug;

use super::ir::*;
use crate::common::Map;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Strategy {
    Coloring,
    LinearScan,
}

#[derive(Display)]
#[display("register allocation error: {}", self.0)]
pub struct RegAllocError(String);

impl std::fmt::Debug for RegAllocError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{self}")
    }
}

#[derive(Clone, Copy, Debug)]
struct Interval {
    start: usize,
    end: usize,
}

impl Interval {
    fn len(&self) -> usize {
        self.end - self.start
    }

    fn overlaps(&self, other: &Interval) -> bool {
        self.start <= other.end && other.start <= self.end
    }
}

/// Where a temp ends up.
#[derive(Clone, Copy, Debug)]
enum Loc {
    Reg(Reg),
    Slot(i64),
}

/// Allocate registers for every function in the module, rewriting
/// `Temp` operands to `Reg` or `Mem` and growing frames by the spill
/// slots they needed.
pub fn allocate(module: &mut Module, strategy: Strategy) -> Result<(), RegAllocError> {
    for f in &mut module.funcs {
        let code = &mut module.code[f.start..f.end];
        allocate_func(code, f, strategy)?;
    }
    Ok(())
}

fn allocate_func(
    code: &mut [Instr],
    frame: &mut FuncFrame,
    strategy: Strategy,
) -> Result<(), RegAllocError> {
    // Live intervals: first and last instruction index per temp.
    let mut intervals: Map<u32, Interval> = Map::new();
    let mut calls = vec![];
    for (idx, instr) in code.iter().enumerate() {
        if instr.op == Op::Call {
            calls.push(idx);
        }
        for_each_temp(instr, &mut |t| {
            intervals
                .entry(t)
                .and_modify(|iv| iv.end = idx)
                .or_insert(Interval { start: idx, end: idx });
        });
    }

    let mut loc: Map<u32, Loc> = Map::new();
    let mut spill = |frame: &mut FuncFrame| -> Result<i64, RegAllocError> {
        frame.frame_size += 8;
        if frame.frame_size > i32::MAX as i64 {
            return Err(RegAllocError(format!(
                "frame of '{}' exceeds the addressable range",
                frame.name
            )));
        }
        Ok(-frame.frame_size)
    };

    // No register survives a call here; call-crossing temps go to the
    // stack up front.
    for (t, iv) in &intervals {
        if calls.iter().any(|c| iv.start < *c && *c < iv.end) {
            loc.insert(*t, Loc::Slot(spill(frame)?));
        }
    }

    let pending: Vec<(u32, Interval)> = intervals
        .iter()
        .filter(|(t, _)| !loc.contains_key(*t))
        .map(|(t, iv)| (*t, *iv))
        .collect();

    match strategy {
        Strategy::Coloring => color(&pending, &mut loc, frame, &mut spill)?,
        Strategy::LinearScan => linear_scan(&pending, &mut loc, frame, &mut spill)?,
    }

    debug!(
        "{}: {} temps, {} spilled",
        frame.name,
        intervals.len(),
        loc.values().filter(|l| matches!(l, Loc::Slot(_))).count()
    );

    for instr in code.iter_mut() {
        rewrite(instr, &loc);
    }
    Ok(())
}

/// Greedy graph coloring: order nodes by descending interference
/// degree (ties by descending interval length), give each the first
/// register no overlapping neighbor took, spill when none fits.
fn color(
    pending: &[(u32, Interval)],
    loc: &mut Map<u32, Loc>,
    frame: &mut FuncFrame,
    spill: &mut impl FnMut(&mut FuncFrame) -> Result<i64, RegAllocError>,
) -> Result<(), RegAllocError> {
    let degree = |t: u32, iv: &Interval| {
        pending
            .iter()
            .filter(|(o, oiv)| *o != t && iv.overlaps(oiv))
            .count()
    };
    let mut order: Vec<(u32, Interval, usize)> =
        pending.iter().map(|(t, iv)| (*t, *iv, degree(*t, iv))).collect();
    order.sort_by(|a, b| b.2.cmp(&a.2).then(b.1.len().cmp(&a.1.len())).then(a.0.cmp(&b.0)));

    for (t, iv, _) in &order {
        let mut used = vec![];
        for (o, oiv, _) in &order {
            if o != t && iv.overlaps(oiv) {
                if let Some(Loc::Reg(r)) = loc.get(o) {
                    used.push(*r);
                }
            }
        }
        match ALLOC_ORDER.iter().find(|r| !used.contains(r)) {
            Some(r) => {
                loc.insert(*t, Loc::Reg(*r));
            }
            None => {
                loc.insert(*t, Loc::Slot(spill(frame)?));
            }
        }
    }
    Ok(())
}

/// Classic linear scan: intervals sorted by start, an active list
/// sorted by end, spill the longer-living of the current interval and
/// the furthest-ending active one when the pool runs dry.
fn linear_scan(
    pending: &[(u32, Interval)],
    loc: &mut Map<u32, Loc>,
    frame: &mut FuncFrame,
    spill: &mut impl FnMut(&mut FuncFrame) -> Result<i64, RegAllocError>,
) -> Result<(), RegAllocError> {
    let mut by_start: Vec<(u32, Interval)> = pending.to_vec();
    by_start.sort_by_key(|(t, iv)| (iv.start, *t));

    let mut free: Vec<Reg> = ALLOC_ORDER.to_vec();
    // (end, temp, register), kept sorted by end.
    let mut active: Vec<(usize, u32, Reg)> = vec![];

    for (t, iv) in by_start {
        while let Some((end, _, r)) = active.first().copied() {
            if end >= iv.start {
                break;
            }
            active.remove(0);
            free.push(r);
        }
        if let Some(r) = (!free.is_empty()).then(|| free.remove(0)) {
            loc.insert(t, Loc::Reg(r));
            active.push((iv.end, t, r));
            active.sort_by_key(|(end, t, _)| (*end, *t));
            continue;
        }
        match active.last().copied() {
            Some((furthest_end, victim, r)) if furthest_end > iv.end => {
                // The active interval lives longer: it takes the slot.
                loc.insert(victim, Loc::Slot(spill(frame)?));
                active.pop();
                loc.insert(t, Loc::Reg(r));
                active.push((iv.end, t, r));
                active.sort_by_key(|(end, t, _)| (*end, *t));
            }
            _ => {
                loc.insert(t, Loc::Slot(spill(frame)?));
            }
        }
    }
    Ok(())
}

/// Visit every temp id an instruction references, including those
/// nested in `Ptr` bases and `Array` indices.
fn for_each_temp(instr: &Instr, f: &mut impl FnMut(u32)) {
    for operand in [&instr.dst, &instr.src1, &instr.src2].into_iter().flatten() {
        visit_operand(operand, f);
    }
}

fn visit_operand(operand: &Operand, f: &mut impl FnMut(u32)) {
    match operand {
        Operand::Temp(t) => f(*t),
        Operand::Ptr { base, .. } => visit_operand(base, f),
        Operand::Array { index, .. } => visit_operand(index, f),
        _ => {}
    }
}

fn rewrite(instr: &mut Instr, loc: &Map<u32, Loc>) {
    for operand in [&mut instr.dst, &mut instr.src1, &mut instr.src2]
        .into_iter()
        .flatten()
    {
        rewrite_operand(operand, loc);
    }
}

fn rewrite_operand(operand: &mut Operand, loc: &Map<u32, Loc>) {
    match operand {
        Operand::Temp(t) => {
            if let Some(l) = loc.get(t) {
                *operand = match l {
                    Loc::Reg(r) => Operand::Reg(*r),
                    Loc::Slot(off) => Operand::Mem(*off),
                };
            }
        }
        Operand::Ptr { base, .. } => rewrite_operand(base, loc),
        Operand::Array { index, .. } => rewrite_operand(index, loc),
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::front::parse;
    use crate::middle::select;

    fn allocated(src: &str, strategy: Strategy) -> Module {
        let parsed = parse::parse(src).unwrap();
        let mut module =
            select::lower(&parsed.program, parsed.types, parsed.funcs).unwrap();
        allocate(&mut module, strategy).unwrap();
        module
    }

    fn no_temps_left(m: &Module) {
        for i in &m.code {
            for_each_temp(i, &mut |t| panic!("temp t{t} survived allocation in {i}"));
        }
    }

    #[test]
    fn coloring_rewrites_every_temp() {
        let m = allocated(
            "int main() { int a = 1; int b = 2; int c = a + b; return c * a; }",
            Strategy::Coloring,
        );
        no_temps_left(&m);
    }

    #[test]
    fn linear_scan_rewrites_every_temp() {
        let m = allocated(
            "int main() { int a = 1; int b = 2; int c = a + b; return c * a; }",
            Strategy::LinearScan,
        );
        no_temps_left(&m);
    }

    #[test]
    fn call_crossing_temps_get_slots() {
        let src = "int f(int x) { return x; }\n\
                   int main() { int n = 3; return n * f(n - 1); }";
        let m = allocated(src, Strategy::Coloring);
        no_temps_left(&m);
        // The temp holding n across the call must be rbp-relative.
        let main = m.funcs.iter().find(|f| f.name.as_str() == "main").unwrap();
        let code = &m.code[main.start..main.end];
        let call = code.iter().position(|i| i.op == Op::Call).unwrap();
        let mul = code.iter().position(|i| i.op == Op::Mul).unwrap();
        assert!(call < mul);
        let mul_instr = &code[mul];
        let crossing_operand_is_mem = matches!(mul_instr.src1, Some(Operand::Mem(_)))
            || matches!(mul_instr.src2, Some(Operand::Mem(_)));
        assert!(
            crossing_operand_is_mem,
            "a value live across the call must be in memory: {mul_instr}"
        );
    }

    #[test]
    fn spill_under_pressure() {
        // More simultaneously-live values than registers.
        let mut body = String::new();
        for i in 0..20 {
            body.push_str(&format!("int v{i} = {i};\n"));
        }
        body.push_str("return ");
        let sum = (0..20).map(|i| format!("v{i}")).collect::<Vec<_>>().join(" + ");
        body.push_str(&sum);
        body.push(';');
        let src = format!("int main() {{ {body} }}");

        for strategy in [Strategy::Coloring, Strategy::LinearScan] {
            let m = allocated(&src, strategy);
            no_temps_left(&m);
        }
    }

    #[test]
    fn frames_grow_by_spills_only() {
        let m = allocated("int main() { return 1 + 2; }", Strategy::Coloring);
        // Nothing crosses a call and pressure is trivial: frame stays
        // as the selector left it.
        assert_eq!(m.funcs[0].frame_size, 0);
    }
}
