pub mod test_closures;
pub mod test_coroutine;
pub mod test_dump;
pub mod test_errors;
pub mod test_gc;
pub mod test_host_api;
pub mod test_operators;
pub mod test_syntax;
