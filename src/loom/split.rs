use itertools::Itertools;
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use super::grid::{CoreCoord, CoreRange, CoreRangeSet, GridError};

/// The result of spreading a number of work units over a core grid.
///
/// The first `group_1.num_cores()` cores in raster order each take `units_per_core_group_1` units,
/// the rest of `all_cores` take `units_per_core_group_2`.
#[derive(Debug, Default, Clone, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct WorkSplit {
    /// Size of the grid the split was computed for.
    pub grid: CoreCoord,
    /// Raster order of the fill.
    pub row_wise: bool,
    pub target_num_cores: u32,
    pub all_cores: CoreRangeSet,
    pub group_1: CoreRangeSet,
    pub group_2: CoreRangeSet,
    pub units_per_core_group_1: u32,
    pub units_per_core_group_2: u32,
}

impl WorkSplit {
    /// Number of units assigned to the core at raster position `index`.
    pub fn units_for(&self, index: u32) -> u32 {
        match index {
            x if x < self.group_1.num_cores() => self.units_per_core_group_1,
            x if x < self.target_num_cores => self.units_per_core_group_2,
            _ => 0,
        }
    }

    /// Total number of units covered by the split.
    pub fn num_units(&self) -> u32 {
        self.group_1.num_cores() * self.units_per_core_group_1
            + self.group_2.num_cores() * self.units_per_core_group_2
    }

    /// Iterates over the participating cores in raster order, with the units each one takes.
    pub fn cores(&self) -> impl Iterator<Item = (CoreCoord, u32)> + '_ {
        (0..self.target_num_cores).map(|index| {
            let core = raster_coord(index, self.grid, self.row_wise);
            (core, self.units_for(index))
        })
    }
}

/// Swaps the axes when filling column by column, so the fill axis is always `x`.
#[inline]
fn orient(coord: CoreCoord, row_wise: bool) -> CoreCoord {
    match row_wise {
        true => coord,
        false => CoreCoord::new(coord.y, coord.x),
    }
}

#[inline]
fn orient_range(range: CoreRange, row_wise: bool) -> Result<CoreRange, GridError> {
    CoreRange::new(orient(range.start(), row_wise), orient(range.end(), row_wise))
}

#[inline]
fn orient_set(
    ranges: impl IntoIterator<Item = CoreRange>,
    row_wise: bool,
) -> Result<CoreRangeSet, GridError> {
    let ranges = ranges
        .into_iter()
        .map(|range| orient_range(range, row_wise))
        .collect::<Result<Vec<_>, _>>()?;
    CoreRangeSet::new(ranges)
}

/// Coordinate of the core at raster position `index`.
#[inline]
fn raster_coord(index: u32, grid: CoreCoord, row_wise: bool) -> CoreCoord {
    match row_wise {
        true => CoreCoord::new(index % grid.x, index / grid.x),
        false => CoreCoord::new(index / grid.y, index % grid.y),
    }
}

fn check_capacity(num_cores: u32, grid: CoreCoord) -> Result<(), GridError> {
    match grid.area() {
        0 => Err(GridError::ZeroArea(grid)),
        capacity if u64::from(num_cores) > capacity => {
            Err(GridError::TooManyCores(num_cores, capacity))
        }
        _ => Ok(()),
    }
}

/// Covers the first `target_num_cores` cores of `grid` in raster order with at most two ranges:
/// a block of complete rows (or columns) and a partial row (or column) after it.
pub fn num_cores_to_corerange_set(
    target_num_cores: u32,
    grid: CoreCoord,
    row_wise: bool,
) -> Result<CoreRangeSet, GridError> {
    check_capacity(target_num_cores, grid)?;
    if target_num_cores == 0 {
        return Ok(CoreRangeSet::empty());
    }

    let fill = orient(grid, row_wise);
    let ranges = match target_num_cores > fill.x {
        true => {
            let rows = target_num_cores / fill.x;
            let stick = target_num_cores % fill.x;
            let block = CoreRange::new((0, 0), (fill.x - 1, rows - 1))?;
            let leftover = match stick {
                0 => None,
                stick => Some(CoreRange::new((0, rows), (stick - 1, rows))?),
            };
            std::iter::once(block).chain(leftover).collect_vec()
        }
        false => vec![CoreRange::new((0, 0), (target_num_cores - 1, 0))?],
    };
    orient_set(ranges, row_wise)
}

/// Splits `units` of work over the cores of `grid` as evenly as possible.
///
/// At most `min(units, grid.x * grid.y)` cores are used. When the units do not divide evenly,
/// the first cores in raster order take one unit more than the rest.
pub fn split_work_to_cores(
    grid: CoreCoord,
    units: u32,
    row_wise: bool,
) -> Result<WorkSplit, GridError> {
    let capacity = grid.area();
    if capacity == 0 {
        return Err(GridError::ZeroArea(grid));
    }
    if units == 0 {
        return Ok(WorkSplit {
            grid,
            row_wise,
            ..Default::default()
        });
    }

    // never more cores than units, so the count fits back into `u32`
    let target_num_cores = u64::from(units).min(capacity) as u32;
    let all_cores = num_cores_to_corerange_set(target_num_cores, grid, row_wise)?;

    let base = units / target_num_cores;
    let extra = units % target_num_cores;

    if extra == 0 {
        log::trace!("split {units} units evenly over {all_cores}: {base} per core");
        return Ok(WorkSplit {
            grid,
            row_wise,
            target_num_cores,
            group_1: all_cores.clone(),
            all_cores,
            group_2: CoreRangeSet::empty(),
            units_per_core_group_1: base,
            units_per_core_group_2: 0,
        });
    }

    let group_1 = num_cores_to_corerange_set(extra, grid, row_wise)?;

    // work in fill space: the last core of each group in raster order
    let fill = orient(grid, row_wise);
    let last_1 = orient(raster_coord(extra - 1, grid, row_wise), row_wise);
    let last_all = orient(raster_coord(target_num_cores - 1, grid, row_wise), row_wise);

    let ranges = if last_1.y == last_all.y && last_1.x != last_all.x {
        // only the last row is shared between the groups
        vec![CoreRange::new((last_1.x + 1, last_1.y), last_all)?]
    } else {
        let mut ranges = vec![];
        if last_1.x != fill.x - 1 {
            // rest of a row in the middle
            ranges.push(CoreRange::new((last_1.x + 1, last_1.y), (fill.x - 1, last_1.y))?);
        }
        ranges.push(CoreRange::new((0, last_1.y + 1), last_all)?);
        ranges
    };
    let group_2 = orient_set(ranges, row_wise)?;

    log::trace!(
        "split {units} units over {all_cores}: {} on {group_1}, {base} on {group_2}",
        base + 1
    );

    Ok(WorkSplit {
        grid,
        row_wise,
        target_num_cores,
        all_cores,
        group_1,
        group_2,
        units_per_core_group_1: base + 1,
        units_per_core_group_2: base,
    })
}

/// Largest divisor of `value` not greater than `max`.
pub fn find_max_block_size(value: u32, max: u32) -> u32 {
    (1..=max).rev().find(|x| value % x == 0).unwrap_or(1)
}

/// Largest divisor of `value` not greater than `max`, never picking 5 or 7.
pub fn find_max_divisor(value: u32, max: u32) -> u32 {
    (1..=max)
        .rev()
        .filter(|&x| x != 5 && x != 7)
        .find(|x| value % x == 0)
        .unwrap_or(1)
}

/// Picks the largest core count in `2..=max_cores` that divides `num_tiles`, falling back to 1.
///
/// With `request_even`, the count is rounded down to an even number (but never below 1).
/// Returns the number of cores and the number of tiles each core takes, rounded up.
pub fn max_cores_dividing_tiles(num_tiles: u32, max_cores: u32, request_even: bool) -> (u32, u32) {
    let num_cores = (2..=max_cores)
        .rev()
        .find(|x| num_tiles % x == 0)
        .unwrap_or(1);
    let num_cores = match request_even {
        true => (num_cores - num_cores % 2).max(1),
        false => num_cores,
    };
    (num_cores, num_tiles.div_ceil(num_cores))
}

/// The first `num_cores` coordinates of `grid` in raster order.
pub fn grid_to_cores(
    num_cores: u32,
    grid: CoreCoord,
    row_wise: bool,
) -> Result<Vec<CoreCoord>, GridError> {
    check_capacity(num_cores, grid)?;
    Ok((0..num_cores)
        .map(|index| raster_coord(index, grid, row_wise))
        .collect())
}

/// Cores of `set`, range by range, each range traversed in raster order.
/// Stops after `limit` cores if given.
pub fn corerange_to_cores(
    set: &CoreRangeSet,
    limit: Option<u32>,
    row_wise: bool,
) -> Vec<CoreCoord> {
    let limit = limit.map_or(usize::MAX, |x| x as usize);
    set.cores(row_wise).take(limit).collect()
}
