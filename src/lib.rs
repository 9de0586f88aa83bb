pub mod builtin;
pub mod db;
pub mod engine;
pub mod exec;
pub mod graph;
pub mod parse;
pub mod progress;
pub mod rules;
pub mod vars;
pub mod watch;
pub mod worker;
pub mod world;

// Re-exports for convenience
pub use db::CacheDb;
pub use db::in_memory::InMemoryCache;
pub use engine::EngineOptions;
pub use exec::{ExecConfig, Executor, TaskRunner};
pub use graph::{NodeId, TargetGraph};
pub use rules::RuleSet;
pub use vars::VarStore;
pub use world::{LocalWorld, World};
