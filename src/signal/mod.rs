//! The change signal: one store key whose every write means "policy changed, reload".

mod publish;
mod update;

pub use publish::{ChangeSignal, PublishStrategy};
pub use update::{PolicyChange, UpdateType};
