//! Line-oriented console driving the job registry.

pub mod console;

pub use console::{Console, ConsoleCommand, Reply, Target, parse_line};
