// Host libraries: the base functions and the coroutine table

pub mod basic;
pub mod coroutine;

use crate::lib_registry;
use crate::lua_vm::{LuaResult, LuaVM};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stdlib {
    Basic,
    Coroutine,

    All,
}

impl LuaVM {
    /// Install a library into the globals
    pub fn open_stdlib(&mut self, lib: Stdlib) -> LuaResult<()> {
        let registry = lib_registry::create_standard_registry();
        match lib {
            Stdlib::All => registry.load_all(self)?,
            Stdlib::Basic => {
                if let Some(module) = registry.get_module("_G") {
                    registry.load_module(self, module)?;
                }
            }
            Stdlib::Coroutine => {
                if let Some(module) = registry.get_module("coroutine") {
                    registry.load_module(self, module)?;
                }
            }
        }
        Ok(())
    }
}
