pub mod exec;
pub mod timeline;

pub use exec::{ExecStore, MemoryExecStore, RedisExecStore};
pub use timeline::{Event, MemoryTimeline, RedisTimeline, Timeline};
