use ndarray::ScalarOperand;
use num_traits::{Float, FromPrimitive, ToPrimitive};
use std::fmt::Debug;
use std::iter::Sum;
use std::ops::{AddAssign, MulAssign};

/// Bundle of numeric bounds shared by every generic routine in the crate.
pub trait FloatOps:
    Float
    + FromPrimitive
    + ToPrimitive
    + ScalarOperand
    + Send
    + Sync
    + Sum
    + AddAssign
    + MulAssign
    + Debug
    + 'static
{
}

impl<T> FloatOps for T where
    T: Float
        + FromPrimitive
        + ToPrimitive
        + ScalarOperand
        + Send
        + Sync
        + Sum
        + AddAssign
        + MulAssign
        + Debug
        + 'static
{
}
