use std::collections::BTreeSet;

use derive_more::Display;
use itertools::Itertools;
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GridError {
    #[error("invalid core range for start coord: {0}, end coord: {1}")]
    InvalidRange(CoreCoord, CoreCoord),
    #[error("core ranges {0} and {1} overlap")]
    Overlap(CoreRange, CoreRange),
    #[error("core grid {0} has zero area")]
    ZeroArea(CoreCoord),
    #[error("target number of cores {0} is greater than total number of cores {1}")]
    TooManyCores(u32, u64),
    #[error("core range from {0} to {1} holds more than {max} cores", max = u32::MAX)]
    TooLarge(CoreCoord, CoreCoord),
    #[error("core range set holds more than {max} cores", max = u32::MAX)]
    SetTooLarge,
}

/// A logical coordinate on the core grid.
///
/// Ordered with `x` major and `y` minor.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Display)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[display("(x={x},y={y})")]
pub struct CoreCoord {
    pub x: u32,
    pub y: u32,
}

impl CoreCoord {
    #[inline]
    pub const fn new(x: u32, y: u32) -> Self {
        Self { x, y }
    }

    /// Number of cores in a grid of this size.
    #[inline]
    pub const fn area(self) -> u64 {
        self.x as u64 * self.y as u64
    }
}

impl From<(u32, u32)> for CoreCoord {
    #[inline]
    fn from((x, y): (u32, u32)) -> Self {
        Self { x, y }
    }
}

/// An axis-aligned, inclusive rectangle of cores.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Display)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(
    feature = "serde",
    serde(try_from = "(CoreCoord, CoreCoord)", into = "(CoreCoord, CoreCoord)")
)]
#[display("[{start} - {end}]")]
pub struct CoreRange {
    start: CoreCoord,
    end: CoreCoord,
}

impl CoreRange {
    /// Creates a range spanning `start` to `end`, both inclusive.
    ///
    /// Fails if `end` lies before `start` on either axis, or if the range holds more than
    /// `u32::MAX` cores. The endpoints are never swapped.
    #[inline]
    pub fn new(start: impl Into<CoreCoord>, end: impl Into<CoreCoord>) -> Result<Self, GridError> {
        let start = start.into();
        let end = end.into();
        if end.x < start.x || end.y < start.y {
            return Err(GridError::InvalidRange(start, end));
        }
        let width = u64::from(end.x - start.x) + 1;
        let height = u64::from(end.y - start.y) + 1;
        match width.checked_mul(height) {
            Some(size) if size <= u64::from(u32::MAX) => Ok(Self { start, end }),
            _ => Err(GridError::TooLarge(start, end)),
        }
    }

    /// A range covering a single core.
    #[inline]
    pub fn single(coord: impl Into<CoreCoord>) -> Self {
        let coord = coord.into();
        Self {
            start: coord,
            end: coord,
        }
    }

    #[inline]
    pub fn start(&self) -> CoreCoord {
        self.start
    }

    #[inline]
    pub fn end(&self) -> CoreCoord {
        self.end
    }

    /// Width and height of the range.
    ///
    /// Cannot overflow: a range never holds more than `u32::MAX` cores.
    #[inline]
    pub fn grid_size(&self) -> CoreCoord {
        CoreCoord {
            x: self.end.x - self.start.x + 1,
            y: self.end.y - self.start.y + 1,
        }
    }

    /// Number of cores in the range.
    #[inline]
    pub fn size(&self) -> u32 {
        let CoreCoord { x, y } = self.grid_size();
        x * y
    }

    #[inline]
    pub fn contains(&self, coord: CoreCoord) -> bool {
        (self.start.x..=self.end.x).contains(&coord.x)
            && (self.start.y..=self.end.y).contains(&coord.y)
    }

    /// Returns `true` if `other` is fully nested in `self`.
    #[inline]
    pub fn contains_range(&self, other: &CoreRange) -> bool {
        self.contains(other.start) && self.contains(other.end)
    }

    #[inline]
    pub fn intersects(&self, other: &CoreRange) -> bool {
        self.intersection(other).is_some()
    }

    pub fn intersection(&self, other: &CoreRange) -> Option<CoreRange> {
        let start = CoreCoord {
            x: self.start.x.max(other.start.x),
            y: self.start.y.max(other.start.y),
        };
        let end = CoreCoord {
            x: self.end.x.min(other.end.x),
            y: self.end.y.min(other.end.y),
        };
        CoreRange::new(start, end).ok()
    }

    /// Returns `true` if the two ranges touch along an edge without a gap and without overlapping.
    pub fn adjacent(&self, other: &CoreRange) -> bool {
        let x1 = self.start.x.max(other.start.x);
        let y1 = self.start.y.max(other.start.y);
        let x2 = self.end.x.min(other.end.x);
        let y2 = self.end.y.min(other.end.y);
        (x2.checked_add(1) == Some(x1) && y1 <= y2) || (y2.checked_add(1) == Some(y1) && x1 <= x2)
    }

    /// Returns the union of the two ranges if that union is itself a rectangle.
    pub fn merge(&self, other: &CoreRange) -> Option<CoreRange> {
        if self.contains_range(other) {
            return Some(*self);
        }
        if other.contains_range(self) {
            return Some(*other);
        }
        let same_columns = self.start.x == other.start.x && self.end.x == other.end.x;
        let same_rows = self.start.y == other.start.y && self.end.y == other.end.y;
        if (same_columns || same_rows) && (self.adjacent(other) || self.intersects(other)) {
            let start = self.start.min(other.start);
            let end = self.end.max(other.end);
            return CoreRange::new(start, end).ok();
        }
        None
    }

    /// Iterates over the cores of the range in raster order.
    ///
    /// Row-wise traversal walks each row left to right, then advances rows top to bottom.
    /// Otherwise each column is walked top to bottom, then columns advance left to right.
    pub fn cores(&self, row_wise: bool) -> impl Iterator<Item = CoreCoord> + use<> {
        let (start, end) = (self.start, self.end);
        let cores: Box<dyn Iterator<Item = CoreCoord>> = match row_wise {
            true => Box::new(
                itertools::iproduct!(start.y..=end.y, start.x..=end.x)
                    .map(|(y, x)| CoreCoord { x, y }),
            ),
            false => Box::new(
                itertools::iproduct!(start.x..=end.x, start.y..=end.y)
                    .map(|(x, y)| CoreCoord { x, y }),
            ),
        };
        cores
    }
}

impl TryFrom<(CoreCoord, CoreCoord)> for CoreRange {
    type Error = GridError;

    #[inline]
    fn try_from((start, end): (CoreCoord, CoreCoord)) -> Result<Self, Self::Error> {
        Self::new(start, end)
    }
}

impl From<CoreRange> for (CoreCoord, CoreCoord) {
    #[inline]
    fn from(value: CoreRange) -> Self {
        (value.start, value.end)
    }
}

impl From<CoreCoord> for CoreRange {
    #[inline]
    fn from(value: CoreCoord) -> Self {
        Self::single(value)
    }
}

/// A set of pairwise non-overlapping core ranges, kept in canonical sorted order.
#[derive(Debug, Default, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Display)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(try_from = "Vec<CoreRange>", into = "Vec<CoreRange>"))]
#[display("{{{}}}", _0.iter().format(", "))]
pub struct CoreRangeSet(BTreeSet<CoreRange>);

impl CoreRangeSet {
    /// Creates a set from ranges. Fails if any two of them overlap, or if the set holds more than
    /// `u32::MAX` cores.
    pub fn new(ranges: impl IntoIterator<Item = CoreRange>) -> Result<Self, GridError> {
        let ranges: BTreeSet<_> = ranges.into_iter().collect();
        if let Some((x, y)) = ranges
            .iter()
            .tuple_combinations()
            .find(|(x, y)| x.intersects(y))
        {
            return Err(GridError::Overlap(*x, *y));
        }
        ranges
            .iter()
            .try_fold(0u32, |total, range| total.checked_add(range.size()))
            .ok_or(GridError::SetTooLarge)?;
        Ok(Self(ranges))
    }

    #[inline]
    pub fn empty() -> Self {
        Self::default()
    }

    #[inline]
    pub fn ranges(&self) -> &BTreeSet<CoreRange> {
        &self.0
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Total number of cores in all ranges. Bounded by `u32::MAX` on construction.
    #[inline]
    pub fn num_cores(&self) -> u32 {
        self.0.iter().map(CoreRange::size).sum()
    }

    #[inline]
    pub fn contains(&self, coord: CoreCoord) -> bool {
        self.0.iter().any(|range| range.contains(coord))
    }

    /// Returns `true` if `range` is fully nested in one of the ranges.
    #[inline]
    pub fn contains_range(&self, range: &CoreRange) -> bool {
        self.0.iter().any(|x| x.contains_range(range))
    }

    #[inline]
    pub fn intersects(&self, other: &CoreRangeSet) -> bool {
        itertools::iproduct!(self.0.iter(), other.0.iter()).any(|(x, y)| x.intersects(y))
    }

    /// The smallest range covering every core of the set.
    pub fn bounding_box(&self) -> Option<CoreRange> {
        let start = CoreCoord {
            x: self.0.iter().map(|range| range.start.x).min()?,
            y: self.0.iter().map(|range| range.start.y).min()?,
        };
        let end = CoreCoord {
            x: self.0.iter().map(|range| range.end.x).max()?,
            y: self.0.iter().map(|range| range.end.y).max()?,
        };
        CoreRange::new(start, end).ok()
    }

    /// Coalesces adjacent ranges into larger rectangles where possible.
    pub fn merge(&self) -> Self {
        let mut ranges = self.0.iter().copied().collect_vec();
        'outer: loop {
            for (i, j) in (0..ranges.len()).tuple_combinations() {
                if let Some(merged) = ranges[i].merge(&ranges[j]) {
                    ranges.swap_remove(j);
                    ranges[i] = merged;
                    continue 'outer;
                }
            }
            break;
        }
        Self(ranges.into_iter().collect())
    }

    /// Cores of the set: ranges in canonical order, each traversed in raster order.
    pub fn cores(&self, row_wise: bool) -> impl Iterator<Item = CoreCoord> + '_ {
        self.0.iter().flat_map(move |range| range.cores(row_wise))
    }
}

impl From<CoreRange> for CoreRangeSet {
    #[inline]
    fn from(value: CoreRange) -> Self {
        Self([value].into())
    }
}

impl TryFrom<Vec<CoreRange>> for CoreRangeSet {
    type Error = GridError;

    #[inline]
    fn try_from(value: Vec<CoreRange>) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<CoreRangeSet> for Vec<CoreRange> {
    #[inline]
    fn from(value: CoreRangeSet) -> Self {
        value.0.into_iter().collect()
    }
}

#[cfg(test)]
mod tests {
    use std::error::Error;

    use itertools::Itertools;

    use super::{CoreCoord, CoreRange, CoreRangeSet, GridError};

    #[test]
    fn test_coord_order() {
        let a = CoreCoord::new(0, 5);
        let b = CoreCoord::new(1, 0);
        let c = CoreCoord::new(1, 2);
        assert!(a < b);
        assert!(b < c);
        assert_eq!([c, a, b].into_iter().sorted().collect_vec(), vec![a, b, c]);
    }

    #[test]
    fn test_invalid_range() {
        let err = CoreRange::new((2, 0), (1, 3)).unwrap_err();
        assert_eq!(
            err,
            GridError::InvalidRange(CoreCoord::new(2, 0), CoreCoord::new(1, 3))
        );
        assert!(CoreRange::new((0, 4), (3, 3)).is_err());
        assert_eq!(
            err.to_string(),
            "invalid core range for start coord: (x=2,y=0), end coord: (x=1,y=3)"
        );
    }

    #[test]
    fn test_range_queries() -> Result<(), Box<dyn Error>> {
        let range = CoreRange::new((1, 2), (3, 5))?;
        assert_eq!(range.grid_size(), CoreCoord::new(3, 4));
        assert_eq!(range.size(), 12);
        assert!(range.contains(CoreCoord::new(1, 2)));
        assert!(range.contains(CoreCoord::new(3, 5)));
        assert!(!range.contains(CoreCoord::new(0, 2)));
        assert!(!range.contains(CoreCoord::new(3, 6)));

        let inner = CoreRange::new((2, 3), (3, 4))?;
        assert!(range.contains_range(&inner));
        assert!(!inner.contains_range(&range));
        assert_eq!(range.to_string(), "[(x=1,y=2) - (x=3,y=5)]");
        Ok(())
    }

    #[test]
    fn test_adjacent_and_merge() -> Result<(), Box<dyn Error>> {
        let left = CoreRange::new((0, 0), (1, 3))?;
        let right = CoreRange::new((2, 0), (2, 3))?;
        let below = CoreRange::new((0, 4), (1, 4))?;
        let apart = CoreRange::new((4, 0), (4, 3))?;

        assert!(left.adjacent(&right));
        assert!(left.adjacent(&below));
        assert!(!left.adjacent(&apart));
        assert!(!right.adjacent(&below));

        assert_eq!(left.merge(&right), Some(CoreRange::new((0, 0), (2, 3))?));
        assert_eq!(left.merge(&below), Some(CoreRange::new((0, 0), (1, 4))?));
        assert_eq!(right.merge(&below), None);
        assert_eq!(left.merge(&apart), None);
        Ok(())
    }

    #[test]
    fn test_range_too_large() -> Result<(), Box<dyn Error>> {
        let row = CoreRange::new((0, 0), (u32::MAX - 1, 0))?;
        assert_eq!(row.size(), u32::MAX);
        assert_eq!(row.grid_size(), CoreCoord::new(u32::MAX, 1));

        assert_eq!(
            CoreRange::new((0, 0), (u32::MAX, 0)),
            Err(GridError::TooLarge(CoreCoord::new(0, 0), CoreCoord::new(u32::MAX, 0)))
        );
        assert!(CoreRange::new((0, 0), (u32::MAX, u32::MAX)).is_err());
        assert!(CoreRange::new((0, 0), (65535, 65535)).is_err());

        // the union would not fit, so the halves stay apart
        let left = CoreRange::new((0, 0), (u32::MAX / 2, 0))?;
        let right = CoreRange::new((u32::MAX / 2 + 1, 0), (u32::MAX, 0))?;
        assert!(left.adjacent(&right));
        assert_eq!(left.merge(&right), None);
        assert_eq!(CoreRangeSet::new([left, right]), Err(GridError::SetTooLarge));
        Ok(())
    }

    #[test]
    fn test_grid_area() {
        assert_eq!(CoreCoord::new(8, 8).area(), 64);
        assert_eq!(CoreCoord::new(65536, 65536).area(), 1 << 32);
        assert_eq!(CoreCoord::new(u32::MAX, u32::MAX).area(), u64::from(u32::MAX).pow(2));
    }

    #[test]
    fn test_range_cores() -> Result<(), Box<dyn Error>> {
        let range = CoreRange::new((0, 0), (1, 1))?;
        let row = range.cores(true).map(|c| (c.x, c.y)).collect_vec();
        let col = range.cores(false).map(|c| (c.x, c.y)).collect_vec();
        assert_eq!(row, vec![(0, 0), (1, 0), (0, 1), (1, 1)]);
        assert_eq!(col, vec![(0, 0), (0, 1), (1, 0), (1, 1)]);
        Ok(())
    }

    #[test]
    fn test_set() -> Result<(), Box<dyn Error>> {
        let a = CoreRange::new((0, 0), (1, 3))?;
        let b = CoreRange::new((2, 0), (2, 0))?;
        let set = CoreRangeSet::new([b, a])?;
        assert_eq!(set.len(), 2);
        assert_eq!(set.num_cores(), 9);
        assert_eq!(set.ranges().iter().next(), Some(&a));
        assert!(set.contains(CoreCoord::new(2, 0)));
        assert!(!set.contains(CoreCoord::new(2, 1)));
        assert_eq!(set.bounding_box(), Some(CoreRange::new((0, 0), (2, 3))?));
        assert_eq!(
            set.to_string(),
            "{[(x=0,y=0) - (x=1,y=3)], [(x=2,y=0) - (x=2,y=0)]}"
        );
        assert_eq!(CoreRangeSet::empty().to_string(), "{}");
        assert_eq!(CoreRangeSet::empty().bounding_box(), None);
        Ok(())
    }

    #[test]
    fn test_set_overlap() -> Result<(), Box<dyn Error>> {
        let a = CoreRange::new((0, 0), (2, 2))?;
        let b = CoreRange::new((2, 2), (3, 3))?;
        match CoreRangeSet::new([a, b]) {
            Err(GridError::Overlap(x, y)) => assert_eq!((x, y), (a, b)),
            other => panic!("expected overlap error, got {other:?}"),
        }
        Ok(())
    }

    #[test]
    fn test_set_merge() -> Result<(), Box<dyn Error>> {
        let set = CoreRangeSet::new([
            CoreRange::new((0, 0), (3, 0))?,
            CoreRange::new((0, 1), (3, 1))?,
            CoreRange::new((0, 2), (1, 2))?,
            CoreRange::new((2, 2), (3, 2))?,
        ])?;
        let merged = set.merge();
        assert_eq!(merged, CoreRange::new((0, 0), (3, 2))?.into());
        assert_eq!(merged.num_cores(), set.num_cores());
        Ok(())
    }

    #[cfg(feature = "serde")]
    #[test]
    fn test_serde() -> Result<(), Box<dyn Error>> {
        let set = CoreRangeSet::new([CoreRange::new((0, 0), (1, 1))?])?;
        let json = serde_json::to_string(&set)?;
        assert_eq!(serde_json::from_str::<CoreRangeSet>(&json)?, set);

        let inverted = r#"[[{"x":2,"y":0},{"x":1,"y":0}]]"#;
        assert!(serde_json::from_str::<CoreRangeSet>(inverted).is_err());
        Ok(())
    }
}
