pub(crate) mod manager;
pub(crate) mod ports;
pub(crate) mod process;
pub(crate) mod tunnel;

#[cfg(all(test, unix))]
pub(crate) mod testing;
