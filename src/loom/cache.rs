use std::any::Any;

use rustc_hash::FxHashMap as HashMap;
use thiserror::Error;

use super::{hash::ProgramHash, program::Program};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CacheError {
    #[error("program {0} is not in the cache")]
    Missing(ProgramHash),
    #[error("program {0} is already in the cache")]
    Duplicate(ProgramHash),
    #[error("cached shared state is not of type {0}")]
    Type(&'static str),
    #[error("program {hash} was built by unknown factory {index}")]
    FactoryIndex { hash: ProgramHash, index: usize },
}

/// A program together with the shared state its factory needs to patch it later.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedProgram<S> {
    pub program: Program,
    pub shared: S,
}

impl<S> CachedProgram<S> {
    #[inline]
    pub fn new(program: Program, shared: S) -> Self {
        Self { program, shared }
    }
}

/// Mutable view into a cache entry with its shared state recovered.
#[derive(Debug)]
pub struct CachedProgramMut<'a, S> {
    pub program: &'a mut Program,
    pub shared: &'a mut S,
}

pub struct CacheEntry {
    program: Program,
    shared: Box<dyn Any + Send + Sync>,
    factory_index: usize,
}

impl std::fmt::Debug for CacheEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheEntry")
            .field("program", &self.program)
            .field("factory_index", &self.factory_index)
            .finish_non_exhaustive()
    }
}

impl CacheEntry {
    pub fn new<S: Send + Sync + 'static>(cached: CachedProgram<S>, factory_index: usize) -> Self {
        let CachedProgram { program, shared } = cached;
        let shared = Box::new(shared);
        Self {
            program,
            shared,
            factory_index,
        }
    }

    #[inline]
    pub fn program(&self) -> &Program {
        &self.program
    }

    #[inline]
    pub fn program_mut(&mut self) -> &mut Program {
        &mut self.program
    }

    /// Index of the program factory variant that built this entry.
    #[inline]
    pub fn factory_index(&self) -> usize {
        self.factory_index
    }

    pub fn downcast_mut<S: 'static>(&mut self) -> Result<CachedProgramMut<'_, S>, CacheError> {
        let shared = self
            .shared
            .downcast_mut::<S>()
            .ok_or(CacheError::Type(std::any::type_name::<S>()))?;
        let program = &mut self.program;
        Ok(CachedProgramMut { program, shared })
    }
}

/// Built programs keyed by their structural hash, owned by one device's dispatcher.
///
/// Disabled by default. While disabled, nothing is inserted and lookups see nothing.
#[derive(Debug, Default)]
pub struct ProgramCache {
    entries: HashMap<ProgramHash, CacheEntry>,
    enabled: bool,
}

impl ProgramCache {
    pub fn new(enabled: bool) -> Self {
        Self {
            entries: Default::default(),
            enabled,
        }
    }

    #[inline]
    pub fn enable(&mut self) {
        self.enabled = true;
    }

    /// Stops using the cache, keeping its entries for when it is enabled again.
    #[inline]
    pub fn disable(&mut self) {
        self.enabled = false;
    }

    pub fn disable_and_clear(&mut self) {
        self.enabled = false;
        self.entries.clear();
    }

    #[inline]
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    #[inline]
    pub fn contains(&self, hash: ProgramHash) -> bool {
        self.enabled && self.entries.contains_key(&hash)
    }

    pub fn insert(&mut self, hash: ProgramHash, entry: CacheEntry) -> Result<(), CacheError> {
        if self.entries.contains_key(&hash) {
            return Err(CacheError::Duplicate(hash));
        }
        if self.enabled {
            self.entries.insert(hash, entry);
        }
        Ok(())
    }

    pub fn get(&self, hash: ProgramHash) -> Result<&CacheEntry, CacheError> {
        match self.enabled {
            true => self.entries.get(&hash).ok_or(CacheError::Missing(hash)),
            false => Err(CacheError::Missing(hash)),
        }
    }

    pub fn get_mut(&mut self, hash: ProgramHash) -> Result<&mut CacheEntry, CacheError> {
        match self.enabled {
            true => self.entries.get_mut(&hash).ok_or(CacheError::Missing(hash)),
            false => Err(CacheError::Missing(hash)),
        }
    }

    #[inline]
    pub fn num_entries(&self) -> usize {
        self.entries.len()
    }
}

#[cfg(test)]
mod tests {
    use std::error::Error;

    use super::{CacheEntry, CacheError, CachedProgram, ProgramCache};
    use crate::loom::{hash::ProgramHash, program::Program};

    #[derive(Debug, PartialEq)]
    struct Shared {
        handle: usize,
    }

    fn entry(handle: usize) -> CacheEntry {
        CacheEntry::new(CachedProgram::new(Program::new(), Shared { handle }), 1)
    }

    #[test]
    fn test_insert_once() -> Result<(), Box<dyn Error>> {
        let hash = ProgramHash::from(42);
        let mut cache = ProgramCache::new(true);
        assert!(!cache.contains(hash));
        assert_eq!(cache.get(hash).err(), Some(CacheError::Missing(hash)));

        cache.insert(hash, entry(0))?;
        assert!(cache.contains(hash));
        assert_eq!(cache.num_entries(), 1);
        assert_eq!(cache.insert(hash, entry(1)), Err(CacheError::Duplicate(hash)));
        assert_eq!(cache.num_entries(), 1);

        let entry = cache.get_mut(hash)?;
        assert_eq!(entry.factory_index(), 1);
        let cached = entry.downcast_mut::<Shared>()?;
        assert_eq!(cached.shared, &mut Shared { handle: 0 });
        cached.shared.handle = 7;
        assert_eq!(cache.get_mut(hash)?.downcast_mut::<Shared>()?.shared.handle, 7);
        Ok(())
    }

    #[test]
    fn test_downcast_mismatch() -> Result<(), Box<dyn Error>> {
        let hash = ProgramHash::from(1);
        let mut cache = ProgramCache::new(true);
        cache.insert(hash, entry(0))?;
        assert!(matches!(
            cache.get_mut(hash)?.downcast_mut::<u32>(),
            Err(CacheError::Type(_))
        ));
        Ok(())
    }

    #[test]
    fn test_disable() -> Result<(), Box<dyn Error>> {
        let hash = ProgramHash::from(3);
        let mut cache = ProgramCache::default();
        assert!(!cache.is_enabled());
        cache.insert(hash, entry(0))?;
        assert_eq!(cache.num_entries(), 0);

        cache.enable();
        cache.insert(hash, entry(0))?;
        cache.disable();
        assert!(!cache.contains(hash));
        assert_eq!(cache.num_entries(), 1);

        cache.enable();
        assert!(cache.contains(hash));
        cache.disable_and_clear();
        assert_eq!(cache.num_entries(), 0);
        assert!(!cache.is_enabled());
        Ok(())
    }
}
