use std::borrow::Cow;

use derive_more::{Deref, Display};
use itertools::{Either, Itertools};
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use super::{
    cache::{CacheError, ProgramCache},
    device::{Device, DeviceId, DispatchMode},
    hash::ProgramHash,
    ops::{DeviceOperation, FactoryContext, OpError, OpOutput, ProgramFactories, TensorArgs},
    tensor::{Storage, StorageKind, Tensor, TensorError, TensorSpec},
};

#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Hash, Deref)]
pub struct OperationId(uid::Id<OperationId>);

impl OperationId {
    #[inline]
    pub fn new() -> Self {
        Self(uid::Id::new())
    }
}

impl Default for OperationId {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct TensorRecord {
    pub spec: TensorSpec,
    pub storage: StorageKind,
    pub address: Option<u32>,
}

impl From<&Tensor> for TensorRecord {
    fn from(tensor: &Tensor) -> Self {
        Self {
            spec: tensor.spec().clone(),
            storage: tensor.storage().kind(),
            address: tensor.address().ok(),
        }
    }
}

/// An entry of the operation history.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct OperationRecord {
    pub id: usize,
    pub name: Cow<'static, str>,
    pub hash: ProgramHash,
    /// Whether a cached program was reused.
    pub hit: bool,
    pub attributes: String,
    pub tensors: Vec<TensorRecord>,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct DispatchStats {
    /// Launches that patched a cached program.
    pub hits: usize,
    /// Launches that built and cached a program.
    pub misses: usize,
    /// Launches that built a program while the cache was disabled.
    pub uncached: usize,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct DispatchConfig {
    /// Whether built programs are cached and reused. Off by default.
    pub program_cache: bool,
    pub mode: DispatchMode,
    /// Whether launched operations are recorded.
    pub history: bool,
}

impl DispatchConfig {
    pub const HISTORY_ENV: &'static str = "MOSAIC_OPERATION_HISTORY";

    /// Reads the dispatch mode and the history switch from the environment.
    pub fn from_env() -> Self {
        let history = std::env::var(Self::HISTORY_ENV).is_ok_and(|x| !x.is_empty() && x != "0");
        Self {
            program_cache: false,
            mode: DispatchMode::from_env(),
            history,
        }
    }
}

/// Anything that can launch device operations.
pub trait Launch {
    fn launch<Op: DeviceOperation>(
        &mut self,
        attributes: &Op::Attributes,
        args: &Op::TensorArgs,
    ) -> Result<Op::Output, OpError>;
}

/// Launches operations on one device, caching their programs.
#[derive(Debug)]
pub struct Dispatcher<D> {
    device: D,
    cache: ProgramCache,
    config: DispatchConfig,
    history: Vec<OperationRecord>,
    stats: DispatchStats,
}

#[derive(Debug, Clone)]
pub struct DispatcherBuilder<D> {
    pub device: D,
    pub config: DispatchConfig,
}

impl<D: Device> DispatcherBuilder<D> {
    pub fn new(device: D) -> Self {
        Self {
            device,
            config: Default::default(),
        }
    }

    pub fn config(mut self, config: DispatchConfig) -> Self {
        self.config = config;
        self
    }

    pub fn program_cache(mut self, enabled: bool) -> Self {
        self.config.program_cache = enabled;
        self
    }

    pub fn mode(mut self, mode: DispatchMode) -> Self {
        self.config.mode = mode;
        self
    }

    pub fn history(mut self, enabled: bool) -> Self {
        self.config.history = enabled;
        self
    }

    pub fn build(self) -> Dispatcher<D> {
        let cache = ProgramCache::new(self.config.program_cache);
        Dispatcher {
            device: self.device,
            cache,
            config: self.config,
            history: vec![],
            stats: Default::default(),
        }
    }
}

impl<D: Device> Dispatcher<D> {
    #[inline]
    pub fn device(&self) -> &D {
        &self.device
    }

    #[inline]
    pub fn config(&self) -> &DispatchConfig {
        &self.config
    }

    #[inline]
    pub fn cache(&self) -> &ProgramCache {
        &self.cache
    }

    #[inline]
    pub fn stats(&self) -> DispatchStats {
        self.stats
    }

    #[inline]
    pub fn history(&self) -> &[OperationRecord] {
        &self.history
    }

    pub fn clear_history(&mut self) {
        self.history.clear();
    }

    pub fn enable_program_cache(&mut self) {
        self.config.program_cache = true;
        self.cache.enable();
    }

    pub fn disable_and_clear_program_cache(&mut self) {
        self.config.program_cache = false;
        self.cache.disable_and_clear();
    }

    #[inline]
    pub fn num_program_cache_entries(&self) -> usize {
        self.cache.num_entries()
    }

    fn log_operation<Op: DeviceOperation>(
        &self,
        id: OperationId,
        hash: ProgramHash,
        hit: bool,
        attributes: &Op::Attributes,
        args: &Op::TensorArgs,
    ) {
        if !log::log_enabled!(log::Level::Debug) {
            return;
        }
        let name = Op::name();
        let cache = match (self.cache.is_enabled(), hit) {
            (false, _) => "disabled",
            (true, true) => "hit",
            (true, false) => "miss",
        };
        log::debug!("launch {name} #{id} on device {}: program {hash} ({cache})", self.device.id());
        log::debug!("  attributes: {attributes:?}");
        for (index, tensor) in args.tensors().into_iter().enumerate() {
            let spec = tensor.spec();
            let address = tensor.address().map_or("-".into(), |x| format!("{x:#x}"));
            log::debug!(
                "  tensor {index}: {} {} {:?} {} at {address}",
                spec.shape,
                spec.data_type,
                spec.layout,
                spec.memory.buffer
            );
        }
    }

    /// Warns about tensor arguments whose device buffers are gone.
    fn check_allocated<Op: DeviceOperation>(&self, args: &Op::TensorArgs) {
        let name = Op::name();
        for (index, tensor) in args.tensors().into_iter().enumerate() {
            if let Storage::Device(buffer) = tensor.storage() {
                if !self.device.is_allocated(buffer) {
                    log::warn!(
                        "{name}: tensor {index} at {:#x} on device {} is not allocated",
                        buffer.address,
                        buffer.device
                    );
                }
            }
        }
    }

    /// Frees the device buffers of outputs that will never be handed out.
    fn release<Op: DeviceOperation>(&self, output: &Op::Output) {
        for tensor in output.tensors() {
            if let Err(err) = self.device.deallocate(tensor) {
                log::warn!("failed to release output of {}: {err}", Op::name());
            }
        }
    }

    /// Builds or patches the program for already allocated outputs and enqueues it.
    fn enqueue_program<Op: DeviceOperation>(
        &mut self,
        hash: ProgramHash,
        hit: bool,
        attributes: &Op::Attributes,
        args: &Op::TensorArgs,
        output: &Op::Output,
    ) -> Result<(), OpError> {
        let mode = self.config.mode;
        match (self.cache.is_enabled(), hit) {
            (true, true) => {
                let entry = self.cache.get_mut(hash)?;
                let index = entry.factory_index();
                let factory = <Op::Factory as ProgramFactories<Op>>::from_index(index)
                    .ok_or(CacheError::FactoryIndex { hash, index })?;
                factory.override_runtime_arguments(entry, attributes, args, output)?;
                self.device.enqueue(entry.program(), mode)?;
                self.stats.hits += 1;
            }
            (true, false) => {
                let factory = Op::select_program_factory(attributes, args);
                log::debug!("build program {hash} with {factory:?}");
                let context = FactoryContext {
                    device: self.device.id(),
                    grid_size: self.device.grid_size(),
                };
                let entry = factory.create(&context, attributes, args, output)?;
                self.cache.insert(hash, entry)?;
                let entry = self.cache.get(hash)?;
                self.device.enqueue(entry.program(), mode)?;
                self.stats.misses += 1;
            }
            (false, _) => {
                let factory = Op::select_program_factory(attributes, args);
                let context = FactoryContext {
                    device: self.device.id(),
                    grid_size: self.device.grid_size(),
                };
                let entry = factory.create(&context, attributes, args, output)?;
                self.device.enqueue(entry.program(), mode)?;
                self.stats.uncached += 1;
            }
        }
        Ok(())
    }

    /// Launches an operation on this dispatcher's device.
    ///
    /// The program is looked up by the structural hash of the operation. A cached program is
    /// patched for the current buffers after the operation's cheap validation, otherwise it is
    /// built after full validation and, if caching is enabled, stored for later launches.
    #[cfg_attr(feature = "trace", tracing::instrument(skip_all))]
    pub fn launch<Op: DeviceOperation>(
        &mut self,
        attributes: &Op::Attributes,
        args: &Op::TensorArgs,
    ) -> Result<Op::Output, OpError> {
        let id = OperationId::new();
        let hash = Op::compute_program_hash(attributes, args);
        let hit = self.cache.contains(hash);

        self.log_operation::<Op>(id, hash, hit, attributes, args);
        self.check_allocated::<Op>(args);

        match hit {
            true => Op::validate_on_program_cache_hit(attributes, args).map_err(|err| {
                OpError::StaleProgram {
                    hash,
                    source: Box::new(err),
                }
            })?,
            false => Op::validate_on_program_cache_miss(attributes, args)?,
        }

        let output = Op::create_output_tensors(attributes, args, &self.device)?;
        if let Err(err) = self.enqueue_program::<Op>(hash, hit, attributes, args, &output) {
            self.release::<Op>(&output);
            return Err(err);
        }

        if self.config.history {
            self.history.push(OperationRecord {
                id: id.get(),
                name: Op::name(),
                hash,
                hit,
                attributes: format!("{attributes:?}"),
                tensors: args.tensors().into_iter().map_into().collect(),
            });
        }
        Ok(output)
    }
}

impl<D: Device> Launch for Dispatcher<D> {
    #[inline]
    fn launch<Op: DeviceOperation>(
        &mut self,
        attributes: &Op::Attributes,
        args: &Op::TensorArgs,
    ) -> Result<Op::Output, OpError> {
        Dispatcher::launch::<Op>(self, attributes, args)
    }
}

/// Several devices, each with its own dispatcher and program cache.
#[derive(Debug)]
pub struct Mesh<D> {
    dispatchers: Vec<Dispatcher<D>>,
    parallel: bool,
}

impl<D: Device> Mesh<D> {
    pub fn new(dispatchers: impl IntoIterator<Item = Dispatcher<D>>) -> Self {
        Self {
            dispatchers: dispatchers.into_iter().collect(),
            parallel: false,
        }
    }

    /// Launches the shards of an operation concurrently. Needs the `rayon` feature.
    pub fn parallel(mut self, parallel: bool) -> Self {
        self.parallel = parallel;
        self
    }

    #[inline]
    pub fn dispatchers(&self) -> &[Dispatcher<D>] {
        &self.dispatchers
    }

    pub fn dispatcher(&self, device: DeviceId) -> Result<&Dispatcher<D>, OpError> {
        self.dispatchers
            .iter()
            .find(|x| x.device.id() == device)
            .ok_or(OpError::UnknownDevice(device))
    }

    pub fn dispatcher_mut(&mut self, device: DeviceId) -> Result<&mut Dispatcher<D>, OpError> {
        self.dispatchers
            .iter_mut()
            .find(|x| x.device.id() == device)
            .ok_or(OpError::UnknownDevice(device))
    }

    pub fn enable_program_cache(&mut self) {
        self.dispatchers
            .iter_mut()
            .for_each(Dispatcher::enable_program_cache);
    }

    pub fn disable_and_clear_program_cache(&mut self) {
        self.dispatchers
            .iter_mut()
            .for_each(Dispatcher::disable_and_clear_program_cache);
    }

    /// Launches an operation where its tensors live.
    ///
    /// The storage of the first tensor argument decides: a single-device operation runs on that
    /// device, a multi-device one runs once per shard on each device and its outputs are combined.
    /// Every shard is launched even if one fails; on failure the outputs of the others are freed.
    #[cfg_attr(feature = "trace", tracing::instrument(skip_all))]
    pub fn run<Op: DeviceOperation>(
        &mut self,
        attributes: &Op::Attributes,
        args: &Op::TensorArgs,
    ) -> Result<Op::Output, OpError> {
        let tensors = args.tensors();
        let first = tensors.first().ok_or(OpError::NoTensors)?;
        let devices = match first.storage() {
            Storage::Host => return Err(TensorError::Storage(StorageKind::Host).into()),
            Storage::Device(buffer) => {
                let device = buffer.device;
                return self.dispatcher_mut(device)?.launch::<Op>(attributes, args);
            }
            Storage::MultiDevice(_) => first.devices(),
        };

        if let Some(&device) = devices
            .iter()
            .find(|&&device| self.dispatcher(device).is_err())
        {
            return Err(OpError::UnknownDevice(device));
        }

        let mut jobs = self
            .dispatchers
            .iter_mut()
            .filter_map(|dispatcher| {
                let id = dispatcher.device.id();
                devices.iter().position(|&x| x == id).map(|index| (index, dispatcher))
            })
            .collect_vec();
        jobs.sort_by_key(|(index, _)| *index);

        let jobs = jobs
            .into_iter()
            .map(|(index, dispatcher)| {
                let device = devices[index];
                let args = args.map_tensors(&mut |tensor| tensor.shard(device))?;
                Ok((dispatcher, args))
            })
            .collect::<Result<Vec<_>, OpError>>()?;

        let results = launch_shards::<D, Op>(jobs, attributes, self.parallel);
        let (shards, errors): (Vec<_>, Vec<_>) =
            results.into_iter().partition_map(|(dispatcher, result)| match result {
                Ok(output) => Either::Left((dispatcher, output)),
                Err(err) => Either::Right(err),
            });

        let output = match errors.into_iter().next() {
            Some(err) => Err(err),
            None => {
                let outputs = shards.iter().map(|(_, output)| output.clone()).collect();
                <Op::Output as OpOutput>::from_shards(outputs).map_err(OpError::from)
            }
        };
        if output.is_err() {
            for (dispatcher, output) in &shards {
                dispatcher.release::<Op>(output);
            }
        }
        output
    }
}

type ShardResult<'a, D, Op> = (
    &'a mut Dispatcher<D>,
    Result<<Op as DeviceOperation>::Output, OpError>,
);

#[cfg(feature = "rayon")]
fn launch_shards<'a, D: Device, Op: DeviceOperation>(
    jobs: Vec<(&'a mut Dispatcher<D>, Op::TensorArgs)>,
    attributes: &Op::Attributes,
    parallel: bool,
) -> Vec<ShardResult<'a, D, Op>> {
    use rayon::prelude::*;
    match parallel {
        true => jobs
            .into_par_iter()
            .map(|(dispatcher, args)| {
                let output = dispatcher.launch::<Op>(attributes, &args);
                (dispatcher, output)
            })
            .collect(),
        false => jobs
            .into_iter()
            .map(|(dispatcher, args)| {
                let output = dispatcher.launch::<Op>(attributes, &args);
                (dispatcher, output)
            })
            .collect(),
    }
}

#[cfg(not(feature = "rayon"))]
fn launch_shards<'a, D: Device, Op: DeviceOperation>(
    jobs: Vec<(&'a mut Dispatcher<D>, Op::TensorArgs)>,
    attributes: &Op::Attributes,
    _parallel: bool,
) -> Vec<ShardResult<'a, D, Op>> {
    jobs.into_iter()
        .map(|(dispatcher, args)| {
            let output = dispatcher.launch::<Op>(attributes, &args);
            (dispatcher, output)
        })
        .collect()
}

impl<D: Device> Launch for Mesh<D> {
    #[inline]
    fn launch<Op: DeviceOperation>(
        &mut self,
        attributes: &Op::Attributes,
        args: &Op::TensorArgs,
    ) -> Result<Op::Output, OpError> {
        self.run::<Op>(attributes, args)
    }
}
