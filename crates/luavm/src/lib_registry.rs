// Library registration: groups of natives installed as globals or as
// global library tables

use crate::lua_value::{CFunction, LuaValue};
use crate::lua_vm::{LuaResult, LuaVM};
use crate::stdlib;

/// Creates a value when the module loads
pub type ValueInitializer = fn(&mut LuaVM) -> LuaValue;

pub enum LibraryEntry {
    Function(CFunction),
    Value(ValueInitializer),
}

/// Named group of library entries. `_G` entries become globals; any other
/// module becomes a global table holding its entries.
pub struct LibraryModule {
    pub name: &'static str,
    pub entries: Vec<(&'static str, LibraryEntry)>,
}

impl LibraryModule {
    pub const fn new(name: &'static str) -> Self {
        Self {
            name,
            entries: Vec::new(),
        }
    }

    pub fn with_function(mut self, name: &'static str, func: CFunction) -> Self {
        self.entries.push((name, LibraryEntry::Function(func)));
        self
    }

    pub fn with_value(mut self, name: &'static str, value_init: ValueInitializer) -> Self {
        self.entries.push((name, LibraryEntry::Value(value_init)));
        self
    }
}

/// Builds a `LibraryModule` from `"name" => function` pairs
#[macro_export]
macro_rules! lib_module {
    ($name:expr, {
        $($item_name:literal => $item:expr),* $(,)?
    }) => {
        $crate::lib_registry::LibraryModule::new($name)
            $(.with_function($item_name, $item))*
    };
}

pub struct LibraryRegistry {
    modules: Vec<LibraryModule>,
}

impl LibraryRegistry {
    pub fn new() -> Self {
        Self {
            modules: Vec::new(),
        }
    }

    pub fn register(&mut self, module: LibraryModule) {
        self.modules.push(module);
    }

    /// Load every registered module, in registration order
    pub fn load_all(&self, vm: &mut LuaVM) -> LuaResult<()> {
        for module in &self.modules {
            self.load_module(vm, module)?;
        }
        Ok(())
    }

    pub fn load_module(&self, vm: &mut LuaVM, module: &LibraryModule) -> LuaResult<()> {
        let target = if module.name == "_G" {
            vm.globals()
        } else {
            let count = module.entries.len();
            vm.create_table(0, count)
        };
        for (name, entry) in &module.entries {
            let value = match entry {
                LibraryEntry::Function(func) => LuaValue::cfunction(*func),
                LibraryEntry::Value(value_init) => value_init(vm),
            };
            let key = vm.create_string(name);
            vm.raw_set(&target, key, value)?;
        }
        if module.name != "_G" {
            vm.set_global(module.name, target);
        }
        tracing::debug!(module = module.name, entries = module.entries.len(), "library loaded");
        Ok(())
    }

    pub fn get_module(&self, name: &str) -> Option<&LibraryModule> {
        self.modules.iter().find(|m| m.name == name)
    }
}

impl Default for LibraryRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Registry with the base and coroutine libraries
pub fn create_standard_registry() -> LibraryRegistry {
    let mut registry = LibraryRegistry::new();
    registry.register(stdlib::basic::create_basic_lib());
    registry.register(stdlib::coroutine::create_coroutine_lib());
    registry
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lua_vm::SafeOption;

    fn answer(vm: &mut LuaVM) -> LuaResult<usize> {
        vm.push_value(LuaValue::Integer(42))?;
        Ok(1)
    }

    #[test]
    fn test_module_becomes_global_table() {
        let mut vm = LuaVM::new(SafeOption::default());
        let mut registry = LibraryRegistry::new();
        registry.register(
            crate::lib_module!("demo", {
                "answer" => answer,
            })
            .with_value("name", |vm| vm.create_string("demo")),
        );
        registry.load_all(&mut vm).unwrap();
        let results = vm.execute("return demo.answer(), demo.name").unwrap();
        assert_eq!(results[0], LuaValue::Integer(42));
        assert_eq!(vm.value_str(&results[1]), Some("demo"));
        assert!(registry.get_module("demo").is_some());
        assert!(registry.get_module("missing").is_none());
    }

    #[test]
    fn test_global_module_entries_are_globals() {
        let mut vm = LuaVM::new(SafeOption::default());
        let mut registry = LibraryRegistry::new();
        registry.register(LibraryModule::new("_G").with_function("answer", answer));
        registry.load_all(&mut vm).unwrap();
        assert!(vm.get_global("_G").is_nil());
        let results = vm.execute("return answer()").unwrap();
        assert_eq!(results, vec![LuaValue::Integer(42)]);
    }
}
