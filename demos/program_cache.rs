//! Launches a few operations twice and shows what the program cache keeps.

use std::error::Error;

use mosaic::{
    hal::frontend::TensorOps,
    loom::{
        device::{Device, SimDeviceBuilder},
        dispatch::{DispatchConfig, DispatcherBuilder},
        num::DataType,
        tensor::{BufferType, Layout, MemoryConfig, TensorSpec},
    },
};

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), Box<dyn Error>> {
    #[cfg(feature = "trace")]
    {
        use tracing_subscriber::layer::SubscriberExt;
        tracing::subscriber::set_global_default(
            tracing_subscriber::registry().with(tracing_tracy::TracyLayer::default()),
        )?;
    }

    let device = SimDeviceBuilder::new((8, 8)).build().await;
    let config = DispatchConfig {
        program_cache: true,
        history: true,
        ..DispatchConfig::from_env()
    };
    let mut dispatcher = DispatcherBuilder::new(device.clone()).config(config).build();

    let spec = TensorSpec::new([4, 256, 512], DataType::BFloat16, Layout::Tile);
    let weight = device.allocate(&TensorSpec::new([512, 256], DataType::BFloat16, Layout::Tile))?;
    for _ in 0..2 {
        let x = device.allocate(&spec)?;
        let y = dispatcher.typecast(&x, DataType::BFloat8B)?;
        let z = dispatcher.copy(&y, MemoryConfig::interleaved(BufferType::L1))?;
        let w = dispatcher.matmul(&x, &weight)?;
        for tensor in [x, y, z, w] {
            device.deallocate(&tensor)?;
        }
    }

    for record in dispatcher.history() {
        let hit = if record.hit { "hit" } else { "miss" };
        println!("#{:<4} {:<20} {} {hit}", record.id, record.name, record.hash);
    }
    println!("{:?}", dispatcher.stats());
    println!("cached programs: {}", dispatcher.num_program_cache_entries());

    let launches = device.finish().await?;
    for launch in &launches {
        let cores = launch.program.cores();
        let num_kernels = launch.program.kernels().len();
        println!("{num_kernels} kernels on {} cores: {cores}", cores.num_cores());
    }
    Ok(())
}
