#![forbid(unsafe_code)]

pub mod attempts;
pub mod model;
pub mod status;
pub mod time;

pub use time::Clock;
