use crate::models::ProfileKind;
use clap::{Parser, ValueEnum};

#[derive(Parser, Debug, Clone)]
#[command(
    name = "sensor-monitor",
    version,
    about = "Scheduled sensor analysis worker and scheduler"
)]
pub struct Args {
    #[arg(long, value_enum, default_value_t = Role::All)]
    pub role: Role,
    /// Enqueue one run of this profile now and exit.
    #[arg(long)]
    pub run_profile: Option<ProfileKind>,
    /// Execute the `--run-profile` run in-process instead of through the durable queue.
    #[arg(long, default_value_t = false, requires = "run_profile")]
    pub inline: bool,
    #[arg(long, default_value_t = false)]
    pub ensure_schema: bool,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    All,
    Worker,
    Scheduler,
}

impl Role {
    pub fn runs_worker(&self) -> bool {
        matches!(self, Role::All | Role::Worker)
    }

    pub fn runs_scheduler(&self) -> bool {
        matches!(self, Role::All | Role::Scheduler)
    }
}
