//! CLI command implementations.
//!
//! | Module     | Commands handled              |
//! |------------|-------------------------------|
//! | `run`      | `Run`                         |
//! | `control`  | `Stop`, `Shutdown`            |
//! | `status`   | `Status`                      |
//! | `board`    | `Board`                       |
//! | `records`  | `Bounces`, `Holds`            |
//! | `config`   | `Config`                      |

pub mod board;
pub mod config;
pub mod control;
pub mod records;
pub mod run;
pub mod status;

pub use board::cmd_board;
pub use config::cmd_config;
pub use control::{cmd_shutdown, cmd_stop};
pub use records::{cmd_bounces, cmd_holds};
pub use run::cmd_run;
pub use status::cmd_status;

use std::path::Path;

use anyhow::Result;
use devloop::config::{DevloopConfig, Paths};

/// Config with environment overrides applied, and the layout it implies.
pub fn load(project_dir: &Path) -> Result<(DevloopConfig, Paths)> {
    let defaults = Paths::new(project_dir, &Default::default());
    let mut config = DevloopConfig::load_or_default(&defaults.state_dir)?;
    config.apply_env();
    let paths = Paths::new(project_dir, &config.workspace);
    Ok((config, paths))
}
