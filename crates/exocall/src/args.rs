//! # Argument Marshaling
//!
//! Packs an ordered list of scalar arguments into the fixed-size call
//! descriptor the transport expects.
//!
//! This is bit placement, not type conversion. Each argument's raw bits are
//! written into a 64-bit cell and the callee reinterprets the cell according
//! to its own signature. If the caller marshals an `i32` where the callee
//! reads an `i64`, the callee sees a zero-extended value; nothing here can
//! detect that.
//!
//! Cells are laid out the way a little-endian store through a narrower
//! pointer would leave them: 32-bit values occupy the low four bytes of an
//! otherwise zeroed cell.

use std::any::Any;

use crate::error::Error;
use crate::error::Result;
use crate::handles::EngineAddr;

/// Capacity of a call descriptor.
pub const MAX_ARGS: usize = 8;

/// A scalar argument with an explicit encoding.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Arg {
    I64(i64),
    U64(u64),
    I32(i32),
    F64(f64),
    F32(f32),
}

impl Arg {
    /// Returns the raw cell contents for this argument.
    pub fn cell(self) -> u64 {
        match self {
            Self::I64(v) => v as u64,
            Self::U64(v) => v,
            Self::I32(v) => v as u32 as u64,
            Self::F64(v) => v.to_bits(),
            Self::F32(v) => v.to_bits() as u64,
        }
    }

    /// Extracts an argument from a dynamically typed value.
    ///
    /// Extraction is attempted in a fixed priority: `i64`, `i32`, `f64`,
    /// `f32`, then `u64`. The first one that succeeds decides the encoding.
    pub fn probe(value: &dyn Any) -> Option<Arg> {
        if let Some(v) = value.downcast_ref::<i64>() {
            return Some(Self::I64(*v));
        }
        if let Some(v) = value.downcast_ref::<i32>() {
            return Some(Self::I32(*v));
        }
        if let Some(v) = value.downcast_ref::<f64>() {
            return Some(Self::F64(*v));
        }
        if let Some(v) = value.downcast_ref::<f32>() {
            return Some(Self::F32(*v));
        }
        if let Some(v) = value.downcast_ref::<u64>() {
            return Some(Self::U64(*v));
        }
        if let Some(addr) = value.downcast_ref::<EngineAddr>() {
            return Some(Self::U64(addr.0));
        }
        None
    }
}

impl From<i64> for Arg {
    fn from(v: i64) -> Self {
        Self::I64(v)
    }
}

impl From<u64> for Arg {
    fn from(v: u64) -> Self {
        Self::U64(v)
    }
}

impl From<i32> for Arg {
    fn from(v: i32) -> Self {
        Self::I32(v)
    }
}

impl From<f64> for Arg {
    fn from(v: f64) -> Self {
        Self::F64(v)
    }
}

impl From<f32> for Arg {
    fn from(v: f32) -> Self {
        Self::F32(v)
    }
}

impl From<EngineAddr> for Arg {
    fn from(addr: EngineAddr) -> Self {
        Self::U64(addr.0)
    }
}

/// A marshaled call descriptor: up to [`MAX_ARGS`] raw cells.
///
/// Built fresh for each call and consumed by submission.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CallArgs {
    cells: [u64; MAX_ARGS],
    len: usize,
}

impl CallArgs {
    /// Marshals explicitly typed arguments.
    ///
    /// Fails with [`Error::TooManyArguments`] before touching any value if
    /// more than [`MAX_ARGS`] are given.
    pub fn new(args: &[Arg]) -> Result<Self> {
        if args.len() > MAX_ARGS {
            return Err(Error::TooManyArguments { count: args.len() });
        }

        let mut cells = [0u64; MAX_ARGS];
        for (cell, arg) in cells.iter_mut().zip(args) {
            *cell = arg.cell();
        }

        Ok(Self { cells, len: args.len() })
    }

    /// Marshals dynamically typed arguments, probing each with [`Arg::probe`].
    ///
    /// Fails with [`Error::ArgumentType`] naming the first value that has no
    /// supported interpretation.
    pub fn from_dynamic(values: &[&dyn Any]) -> Result<Self> {
        if values.len() > MAX_ARGS {
            return Err(Error::TooManyArguments { count: values.len() });
        }

        let mut args = Vec::with_capacity(values.len());
        for (position, value) in values.iter().enumerate() {
            let arg = Arg::probe(*value).ok_or(Error::ArgumentType { position })?;
            args.push(arg);
        }

        Self::new(&args)
    }

    /// Number of arguments in the descriptor.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The occupied cells, in argument order.
    pub fn cells(&self) -> &[u64] {
        &self.cells[..self.len]
    }

    /// All cells including unused trailing ones, which are always zero.
    pub fn raw(&self) -> &[u64; MAX_ARGS] {
        &self.cells
    }

    /// Raw cell at `index`, if that argument was given.
    pub fn get(&self, index: usize) -> Option<u64> {
        self.cells().get(index).copied()
    }

    // Callee-side views. Each reinterprets a cell the way a function with
    // the matching parameter type would.

    pub fn i64(&self, index: usize) -> Option<i64> {
        self.get(index).map(|c| c as i64)
    }

    pub fn u64(&self, index: usize) -> Option<u64> {
        self.get(index)
    }

    pub fn i32(&self, index: usize) -> Option<i32> {
        self.get(index).map(|c| c as u32 as i32)
    }

    pub fn f64(&self, index: usize) -> Option<f64> {
        self.get(index).map(f64::from_bits)
    }

    pub fn f32(&self, index: usize) -> Option<f32> {
        self.get(index).map(|c| f32::from_bits(c as u32))
    }

    pub fn addr(&self, index: usize) -> Option<EngineAddr> {
        self.get(index).map(EngineAddr)
    }
}
