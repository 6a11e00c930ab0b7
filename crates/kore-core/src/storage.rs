//! Identities for raw allocations and the logical objects built over them.
//!
//! A [`BufferHandle`] names one physical allocation made by an
//! [`Accelerator`](crate::Accelerator); it changes every time bytes move.
//! A [`StorageId`] is the stable logical identity of a shard or buffer and
//! survives relocation. A [`ViewId`] names a non-owning view over a storage.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

macro_rules! id_type {
    ($(#[$meta:meta])* $name:ident, $prefix:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(u64);

        impl $name {
            /// Wrap a raw id value.
            pub const fn from_raw(raw: u64) -> Self {
                Self(raw)
            }

            /// The raw id value.
            pub const fn raw(&self) -> u64 {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!($prefix, "#{}"), self.0)
            }
        }
    };
}

id_type!(
    /// Handle to one physical allocation on some device.
    BufferHandle,
    "buf"
);
id_type!(
    /// Stable identity of a storage across relocations.
    StorageId,
    "storage"
);
id_type!(
    /// Identity of a view over a storage.
    ViewId,
    "view"
);

/// Monotonic id source. Ids from one generator are never reused.
#[derive(Debug)]
pub struct IdGen(AtomicU64);

impl IdGen {
    pub const fn new() -> Self {
        Self(AtomicU64::new(1))
    }

    pub fn next_raw(&self) -> u64 {
        self.0.fetch_add(1, Ordering::Relaxed)
    }
}

impl Default for IdGen {
    fn default() -> Self {
        Self::new()
    }
}
