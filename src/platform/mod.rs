//! Platform-dependent primitives: the cooperative-task runtime shim and, on
//! `wasm-web` targets, the browser IndexedDB bindings used by `blob_store`.

pub mod runtime;

#[cfg(feature = "wasm-web")]
pub mod browser;
