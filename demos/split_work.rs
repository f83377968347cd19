//! Prints how a number of work units is spread over a core grid.
//!
//! ```text
//! cargo run --example split_work -- -c 4 4 -n 20 [-r]
//! ```

use std::error::Error;

use mosaic::loom::{grid::CoreCoord, split::split_work_to_cores};

const USAGE: &str = "usage: split_work -c <x> <y> -n <units> [-r]";

fn next_u32(args: &mut impl Iterator<Item = String>) -> Result<u32, Box<dyn Error>> {
    let arg = args.next().ok_or(USAGE)?;
    Ok(arg.parse()?)
}

fn main() -> Result<(), Box<dyn Error>> {
    let mut grid = CoreCoord::new(8, 8);
    let mut units = 64;
    let mut row_wise = false;

    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "-c" => grid = CoreCoord::new(next_u32(&mut args)?, next_u32(&mut args)?),
            "-n" => units = next_u32(&mut args)?,
            "-r" => row_wise = true,
            _ => return Err(USAGE.into()),
        }
    }

    let split = split_work_to_cores(grid, units, row_wise)?;
    println!("grid: {grid}, units: {units}, row wise: {row_wise}");
    println!("cores: {} {}", split.target_num_cores, split.all_cores);
    println!("group 1: {} x {}", split.group_1, split.units_per_core_group_1);
    println!("group 2: {} x {}", split.group_2, split.units_per_core_group_2);

    for y in 0..grid.y {
        let row = (0..grid.x)
            .map(|x| {
                let core = CoreCoord::new(x, y);
                match split.cores().find(|&(c, _)| c == core) {
                    Some((_, units)) => format!("{units:>4}"),
                    None => format!("{:>4}", "."),
                }
            })
            .collect::<String>();
        println!("{row}");
    }

    #[cfg(feature = "serde")]
    println!("{}", serde_json::to_string_pretty(&split)?);

    Ok(())
}
