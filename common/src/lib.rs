pub mod call_metadata;
pub mod entity;
pub mod error;
pub mod holder;
pub mod job;
pub mod retry;
pub mod task;

pub use call_metadata::*;
pub use entity::*;
pub use error::*;
pub use holder::*;
pub use job::*;
pub use retry::*;
pub use task::*;
