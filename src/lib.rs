pub mod alignment;
pub mod bootstrap;
pub mod candidates;
pub mod checkpoint;
pub mod config;
pub mod consts;
pub mod error;
pub mod job;
pub mod optimizer;
pub mod oracle;
pub mod stop_rule;
pub mod sync;
pub mod topology;
