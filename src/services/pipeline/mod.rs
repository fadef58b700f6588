mod fanout;
mod handler;
mod sensor;

pub use fanout::{FanOutSummary, ProfileFanOut};
pub use handler::MonitorHandler;
pub use sensor::{summarize_readings, AnalysisPipeline, SensorOutcome};
