pub mod logging;
pub mod markers;
