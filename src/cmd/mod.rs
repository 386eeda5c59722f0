mod config;
mod run;
mod state;

pub use config::cmd_config;
pub use run::cmd_run;
pub use state::{cmd_recover, cmd_status};
