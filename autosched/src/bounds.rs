use serde::{Deserialize, Serialize};
use std::fmt;
use std::rc::Rc;

/// A closed integer interval, plus whether its extent is known at compile time.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Deserialize, Serialize)]
#[cfg_attr(test, derive(proptest_derive::Arbitrary))]
pub struct Span {
    min: i64,
    max: i64,
    constant_extent: bool,
}

impl Span {
    pub fn new(min: i64, max: i64, constant_extent: bool) -> Self {
        Span {
            min,
            max,
            constant_extent,
        }
    }

    /// The identity for [Span::union_with].
    pub fn empty() -> Self {
        Span::new(i64::MAX, i64::MIN, true)
    }

    pub fn min(&self) -> i64 {
        self.min
    }

    pub fn max(&self) -> i64 {
        self.max
    }

    pub fn constant_extent(&self) -> bool {
        self.constant_extent
    }

    pub fn extent(&self) -> i64 {
        self.max - self.min + 1
    }

    pub fn union_with(&mut self, other: &Span) {
        self.min = self.min.min(other.min);
        self.max = self.max.max(other.max);
        self.constant_extent = self.constant_extent && other.constant_extent;
    }

    pub fn set_extent(&mut self, extent: i64) {
        self.max = self.min + extent - 1;
    }

    pub fn translate(&mut self, offset: i64) {
        self.min += offset;
        self.max += offset;
    }
}

impl fmt::Display for Span {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {}]", self.min, self.max)?;
        if self.constant_extent {
            write!(f, "c")?;
        }
        Ok(())
    }
}

/// The region of a node required and computed at some loop, and the
/// concrete loop bounds of each of its stages over that region.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BoundContents {
    pub region_required: Vec<Span>,
    pub region_computed: Vec<Span>,
    /// Indexed by stage, then by loop (innermost first).
    pub loops: Vec<Vec<Span>>,
}

pub type Bound = Rc<BoundContents>;

impl BoundContents {
    pub fn loops(&self, stage: usize, i: usize) -> &Span {
        &self.loops[stage][i]
    }

    pub fn loops_mut(&mut self, stage: usize, i: usize) -> &mut Span {
        &mut self.loops[stage][i]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_empty_is_union_identity() {
        let mut s = Span::empty();
        s.union_with(&Span::new(3, 9, true));
        assert_eq!(s, Span::new(3, 9, true));
    }

    #[test]
    fn test_union_loses_constant_extent() {
        let mut s = Span::new(0, 3, true);
        s.union_with(&Span::new(2, 7, false));
        assert_eq!(s, Span::new(0, 7, false));
    }

    proptest! {
        #[test]
        fn test_set_extent_then_translate_preserves_extent(
            min in -1000i64..1000, extent in 1i64..1000, shift in -1000i64..1000
        ) {
            let mut s = Span::new(min, min, true);
            s.set_extent(extent);
            s.translate(shift);
            prop_assert_eq!(s.extent(), extent);
            prop_assert_eq!(s.min(), min + shift);
        }
    }
}
