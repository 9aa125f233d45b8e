//! Kernel math functions behind one generic entry point per arity.

/// One-argument math functions.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum UnaryOp {
    Abs,
    Acos,
    Asin,
    Atan,
    Cbrt,
    Ceil,
    Cos,
    Exp,
    Floor,
    Log,
    Round,
    Rsqrt,
    Sin,
    Sqrt,
    Tan,
    Trunc,
}

/// Two-argument math functions.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BinaryOp {
    Atan2,
    /// Remainder with the sign of the dividend (C `fmod`).
    Fmod,
    Max,
    Min,
    Pow,
    /// IEEE remainder: `x - n * y` with `n` the quotient rounded to even.
    Remainder,
}

/// Floating-point element types usable with the math capability.
pub trait Real: Copy + PartialOrd + Send + Sync + 'static {
    fn unary(op: UnaryOp, x: Self) -> Self;
    fn binary(op: BinaryOp, x: Self, y: Self) -> Self;
    fn sincos(x: Self) -> (Self, Self);
}

macro_rules! impl_real {
    ($($t:ty),*) => {$(
        impl Real for $t {
            fn unary(op: UnaryOp, x: Self) -> Self {
                match op {
                    UnaryOp::Abs => x.abs(),
                    UnaryOp::Acos => x.acos(),
                    UnaryOp::Asin => x.asin(),
                    UnaryOp::Atan => x.atan(),
                    UnaryOp::Cbrt => x.cbrt(),
                    UnaryOp::Ceil => x.ceil(),
                    UnaryOp::Cos => x.cos(),
                    UnaryOp::Exp => x.exp(),
                    UnaryOp::Floor => x.floor(),
                    UnaryOp::Log => x.ln(),
                    UnaryOp::Round => x.round(),
                    UnaryOp::Rsqrt => x.sqrt().recip(),
                    UnaryOp::Sin => x.sin(),
                    UnaryOp::Sqrt => x.sqrt(),
                    UnaryOp::Tan => x.tan(),
                    UnaryOp::Trunc => x.trunc(),
                }
            }

            fn binary(op: BinaryOp, x: Self, y: Self) -> Self {
                match op {
                    BinaryOp::Atan2 => x.atan2(y),
                    BinaryOp::Fmod => x % y,
                    BinaryOp::Max => x.max(y),
                    BinaryOp::Min => x.min(y),
                    BinaryOp::Pow => x.powf(y),
                    BinaryOp::Remainder => x - (x / y).round_ties_even() * y,
                }
            }

            fn sincos(x: Self) -> (Self, Self) {
                x.sin_cos()
            }
        }
    )*};
}

impl_real!(f32, f64);
