//! veriface-store: filesystem descriptor store.
//!
//! Layout: `<root>/<identity>/<uuid>.json` metadata next to the payload,
//! `<uuid>.f32` (little-endian descriptor) or `<uuid>.jpg` (face crop).

pub mod fs;

pub use fs::FsDescriptorStore;
