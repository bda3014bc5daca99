use std::collections::HashMap;
use std::sync::Arc;

use super::{Slot, Vm, VmResult};

/// A host callback reachable from bytecode through `syscall` or a negative `call` index.
///
/// `args` holds the popped arguments in push order, so `args.len()` is the argument count. The
/// value left in `ret` is copied into the accumulator when the call returns. Arena access goes
/// through [`Vm::memory`], [`Vm::memory_mut`] and [`Vm::read_c_str`]; the borrows they hand out end
/// with the call.
pub trait Native: Send + Sync {
    fn call(&self, vm: &mut Vm, args: &[Slot], ret: &mut Slot) -> VmResult<()>;
}

pub type StaticNative = fn(&mut Vm, &[Slot], &mut Slot) -> VmResult<()>;

impl<F> Native for F
where
    F: Fn(&mut Vm, &[Slot], &mut Slot) -> VmResult<()> + Send + Sync,
{
    fn call(&self, vm: &mut Vm, args: &[Slot], ret: &mut Slot) -> VmResult<()> {
        self(vm, args, ret)
    }
}

/// One `{name, callback}` registration pair.
#[derive(Clone)]
pub struct NativeInfo {
    pub name: String,
    pub function: Arc<dyn Native>,
}

impl NativeInfo {
    pub fn new<F>(name: impl Into<String>, function: F) -> Self
    where
        F: Fn(&mut Vm, &[Slot], &mut Slot) -> VmResult<()> + Send + Sync + 'static,
    {
        Self::from_native(name, function)
    }

    pub fn from_native(name: impl Into<String>, native: impl Native + 'static) -> Self {
        Self {
            name: name.into(),
            function: Arc::new(native),
        }
    }

    pub fn from_static(name: impl Into<String>, function: StaticNative) -> Self {
        Self::new(name, function)
    }
}

impl std::fmt::Debug for NativeInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NativeInfo").field("name", &self.name).finish()
    }
}

#[derive(Clone, Default)]
pub struct NativeRegistry {
    entries: Vec<NativeInfo>,
    by_name: HashMap<String, usize>,
}

impl NativeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registering an existing name replaces its callback and keeps its slot.
    pub fn register(&mut self, native: NativeInfo) -> usize {
        if let Some(&slot) = self.by_name.get(&native.name) {
            self.entries[slot] = native;
            return slot;
        }
        let slot = self.entries.len();
        self.by_name.insert(native.name.clone(), slot);
        self.entries.push(native);
        slot
    }

    pub fn slot(&self, name: &str) -> Option<usize> {
        self.by_name.get(name).copied()
    }

    pub fn get(&self, slot: usize) -> Option<&Arc<dyn Native>> {
        self.entries.get(slot).map(|entry| &entry.function)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|entry| entry.name.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn zero(_vm: &mut Vm, _args: &[Slot], ret: &mut Slot) -> VmResult<()> {
        *ret = Slot::ZERO;
        Ok(())
    }

    #[test]
    fn reregistering_replaces_in_place() {
        let mut registry = NativeRegistry::new();
        let first = registry.register(NativeInfo::from_static("zero", zero));
        let other = registry.register(NativeInfo::new("one", |_vm, _args, ret| {
            *ret = Slot::from_i64(1);
            Ok(())
        }));
        let again = registry.register(NativeInfo::from_static("zero", zero));
        assert_eq!(first, again);
        assert_ne!(first, other);
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.slot("one"), Some(other));
        assert_eq!(registry.slot("missing"), None);
        assert_eq!(registry.names().collect::<Vec<_>>(), vec!["zero", "one"]);
    }
}
