pub mod duration;

pub use duration::{format_duration, parse_duration, parse_duration_or_seconds};
