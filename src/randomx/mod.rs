//! Cache-based hashing used on odd heights.
//!
//! [`RxCacheManager`] keeps two seed generations alive over any
//! [`RxBackend`]. The pure-Rust [`SoftBackend`] is always available; the
//! `randomx` feature adds [`NativeBackend`] on top of the RandomX library.

pub mod backend;
pub mod manager;
#[cfg(feature = "randomx")]
pub mod native;
pub mod soft;

pub use backend::RxBackend;
pub use manager::{
    GenerationInfo, GenerationRole, GenerationState, HashPath, RxCacheManager, RxStatsSnapshot,
};
#[cfg(feature = "randomx")]
pub use native::NativeBackend;
pub use soft::{SoftBackend, SoftRxParams};
