// src/codecs/mod.rs
//
// Safe wrappers over codec FFI.

pub mod avif_safe;
