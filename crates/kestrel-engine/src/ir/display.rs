//! IR pretty-printer
//!
//! Renders functions in a compact textual form for diagnostics and tests:
//!
//! ```text
//! fun f(2 params, 8 slots)
//! b0 entry:
//!   v6 = add_i32 v3, v4
//!   if_true v7 => b1, b2
//! ```

use std::fmt;

use super::instr::{IRArg, IRBlock, IRConst, IRFunction, IRInstr};

impl fmt::Display for IRConst {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IRConst::Int32(i) => write!(f, "{}", i),
            IRConst::Float64(x) => write!(f, "{:?}", x),
            IRConst::True => write!(f, "true"),
            IRConst::False => write!(f, "false"),
            IRConst::Null => write!(f, "null"),
            IRConst::Undef => write!(f, "undef"),
            IRConst::Str(s) => write!(f, "{:?}", s),
            IRConst::Fun(id) => write!(f, "fun#{}", id.0),
            IRConst::Link(l) => match l.get() {
                Some(idx) => write!(f, "link[{}]", idx),
                None => write!(f, "link[?]"),
            },
        }
    }
}

impl fmt::Display for IRArg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IRArg::Val(v) => write!(f, "{}", v),
            IRArg::Const(c) => write!(f, "{}", c),
        }
    }
}

impl fmt::Display for IRInstr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(out) = self.out {
            write!(f, "{} = ", out)?;
        }
        write!(f, "{}", self.op)?;
        for (i, arg) in self.args.iter().enumerate() {
            if i == 0 {
                write!(f, " {}", arg)?;
            } else {
                write!(f, ", {}", arg)?;
            }
        }
        match (self.targets[0], self.targets[1]) {
            (Some(t0), Some(t1)) => write!(f, " => {}, {}", t0, t1)?,
            (Some(t0), None) => write!(f, " => {}", t0)?,
            _ => {}
        }
        Ok(())
    }
}

impl fmt::Display for IRBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.name {
            Some(name) => writeln!(f, "{} {}:", self.id, name)?,
            None => writeln!(f, "{}:", self.id)?,
        }
        for instr in &self.instrs {
            writeln!(f, "  {}", instr)?;
        }
        Ok(())
    }
}

impl fmt::Display for IRFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "fun {}({} params, {} slots)",
            self.name, self.num_params, self.num_locals
        )?;
        for block in &self.blocks {
            write!(f, "{}", block)?;
        }
        Ok(())
    }
}
