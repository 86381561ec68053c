//! # Element Types
//!
//! Node evaluation is written once, generic over the element type stored in
//! each buffer slot:
//!
//! - `f64` gives numeric evaluation
//! - [`SxElem`] gives symbolic evaluation: the same algorithm run over
//!   scalar expression trees, so the result of evaluating a graph is a set
//!   of formulas rather than numbers
//!
//! The [`Scalar`] trait is the contract both satisfy.

use std::fmt;
use std::ops::{Add, Mul, Neg, Sub};
use std::rc::Rc;

use num_traits::{One, Zero};

/// Element type of an evaluation buffer.
pub trait Scalar:
    Clone
    + fmt::Debug
    + Zero
    + One
    + Add<Output = Self>
    + Sub<Output = Self>
    + Mul<Output = Self>
    + Neg<Output = Self>
    + From<f64>
{
    /// Elementwise maximum, used by max reductions.
    fn fmax(self, other: Self) -> Self;
}

impl Scalar for f64 {
    fn fmax(self, other: Self) -> Self {
        f64::max(self, other)
    }
}

/// Symbolic scalar: a shared, immutable expression tree.
#[derive(Clone)]
pub struct SxElem(Rc<SxNode>);

/// One node of a scalar expression tree.
#[derive(Debug)]
pub enum SxNode {
    Const(f64),
    Sym(String),
    Add(SxElem, SxElem),
    Sub(SxElem, SxElem),
    Mul(SxElem, SxElem),
    Neg(SxElem),
    Max(SxElem, SxElem),
}

impl SxElem {
    /// A free symbol.
    pub fn sym(name: impl Into<String>) -> Self {
        SxElem(Rc::new(SxNode::Sym(name.into())))
    }

    pub fn constant(value: f64) -> Self {
        SxElem(Rc::new(SxNode::Const(value)))
    }

    pub fn node(&self) -> &SxNode {
        &self.0
    }

    /// The value if this is a constant leaf.
    pub fn as_constant(&self) -> Option<f64> {
        match *self.0 {
            SxNode::Const(v) => Some(v),
            _ => None,
        }
    }

    /// True if both handles share one tree node.
    pub fn is_same(&self, other: &SxElem) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }

    /// Evaluate numerically, resolving symbols through `lookup`.
    ///
    /// Returns `None` if a symbol is not bound.
    pub fn evaluate(&self, lookup: &dyn Fn(&str) -> Option<f64>) -> Option<f64> {
        Some(match self.node() {
            SxNode::Const(v) => *v,
            SxNode::Sym(name) => lookup(name)?,
            SxNode::Add(a, b) => a.evaluate(lookup)? + b.evaluate(lookup)?,
            SxNode::Sub(a, b) => a.evaluate(lookup)? - b.evaluate(lookup)?,
            SxNode::Mul(a, b) => a.evaluate(lookup)? * b.evaluate(lookup)?,
            SxNode::Neg(a) => -a.evaluate(lookup)?,
            SxNode::Max(a, b) => a.evaluate(lookup)?.max(b.evaluate(lookup)?),
        })
    }

    fn binary(node: SxNode) -> Self {
        SxElem(Rc::new(node))
    }
}

impl From<f64> for SxElem {
    fn from(value: f64) -> Self {
        SxElem::constant(value)
    }
}

impl Zero for SxElem {
    fn zero() -> Self {
        SxElem::constant(0.0)
    }

    fn is_zero(&self) -> bool {
        self.as_constant() == Some(0.0)
    }
}

impl One for SxElem {
    fn one() -> Self {
        SxElem::constant(1.0)
    }
}

impl Add for SxElem {
    type Output = SxElem;

    fn add(self, rhs: SxElem) -> SxElem {
        match (self.as_constant(), rhs.as_constant()) {
            (Some(a), Some(b)) => SxElem::constant(a + b),
            (Some(a), _) if a == 0.0 => rhs,
            (_, Some(b)) if b == 0.0 => self,
            _ => SxElem::binary(SxNode::Add(self, rhs)),
        }
    }
}

impl Sub for SxElem {
    type Output = SxElem;

    fn sub(self, rhs: SxElem) -> SxElem {
        match (self.as_constant(), rhs.as_constant()) {
            (Some(a), Some(b)) => SxElem::constant(a - b),
            (_, Some(b)) if b == 0.0 => self,
            (Some(a), _) if a == 0.0 => -rhs,
            _ => SxElem::binary(SxNode::Sub(self, rhs)),
        }
    }
}

impl Mul for SxElem {
    type Output = SxElem;

    fn mul(self, rhs: SxElem) -> SxElem {
        match (self.as_constant(), rhs.as_constant()) {
            (Some(a), Some(b)) => SxElem::constant(a * b),
            (Some(a), _) if a == 0.0 => SxElem::zero(),
            (_, Some(b)) if b == 0.0 => SxElem::zero(),
            (Some(a), _) if a == 1.0 => rhs,
            (_, Some(b)) if b == 1.0 => self,
            _ => SxElem::binary(SxNode::Mul(self, rhs)),
        }
    }
}

impl Neg for SxElem {
    type Output = SxElem;

    fn neg(self) -> SxElem {
        match self.node() {
            SxNode::Const(v) => SxElem::constant(-v),
            SxNode::Neg(inner) => inner.clone(),
            _ => SxElem::binary(SxNode::Neg(self)),
        }
    }
}

impl Scalar for SxElem {
    fn fmax(self, other: Self) -> Self {
        match (self.as_constant(), other.as_constant()) {
            (Some(a), Some(b)) => SxElem::constant(a.max(b)),
            _ => SxElem::binary(SxNode::Max(self, other)),
        }
    }
}

impl fmt::Display for SxElem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.node() {
            SxNode::Const(v) => write!(f, "{v}"),
            SxNode::Sym(name) => write!(f, "{name}"),
            SxNode::Add(a, b) => write!(f, "({a}+{b})"),
            SxNode::Sub(a, b) => write!(f, "({a}-{b})"),
            SxNode::Mul(a, b) => write!(f, "({a}*{b})"),
            SxNode::Neg(a) => write!(f, "(-{a})"),
            SxNode::Max(a, b) => write!(f, "fmax({a},{b})"),
        }
    }
}

impl fmt::Debug for SxElem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SxElem({self})")
    }
}
