pub mod fallback;
pub mod insight;
pub mod status;
pub mod telemetry;
pub mod usage;
