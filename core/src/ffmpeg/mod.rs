//! Everything needed to turn a [`RenditionConfig`](crate::model::RenditionConfig)
//! into a runnable `ffmpeg` invocation and to read progress back out of it.

pub mod command;
pub mod input;
pub mod log_parser;

pub use command::build_command;
pub use log_parser::LogParser;
