mod file;
mod fs_utils;
mod lock;
mod memory;
mod store;

pub use file::FileStateStore;
pub use fs_utils::{atomic_write, remove_file_if_exists};
pub use lock::{process_alive, HostLock, LockOwner, LockStatus};
pub use memory::MemoryStateStore;
pub use store::StateStore;

#[cfg(test)]
mod tests;
