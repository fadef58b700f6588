pub mod analysis_backend;
pub mod catalog;
pub mod dispatch;
pub mod notifications;
pub mod pipeline;
pub mod scheduler;
pub mod timeseries;
