//! Kernel change notifications and the loop that applies them to the tree.

mod fanotify;
mod source;
mod watcher;

pub use watcher::{MountWatcher, WatchError};
