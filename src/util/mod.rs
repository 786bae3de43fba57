//! Internal helpers shared by the cache, the phase bodies and the bindings.

pub mod extract;
pub mod fs;
pub mod hash;
