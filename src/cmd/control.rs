//! `devloop stop` and `devloop shutdown`: drop a marker for the running
//! supervisor to pick up on its next tick.

use std::path::Path;

use anyhow::Result;
use devloop::control::{ControlMarkers, ControlRequest};

fn request(project_dir: &Path, request: ControlRequest) -> Result<()> {
    let (_, paths) = super::load(project_dir)?;
    let markers = ControlMarkers::new(paths.stop_marker, paths.shutdown_marker);
    let path = markers.request(request)?;
    println!("Wrote {}", path.display());
    Ok(())
}

pub fn cmd_stop(project_dir: &Path) -> Result<()> {
    request(project_dir, ControlRequest::Stop)?;
    println!("The scheduler will kill all loops and agents on its next tick.");
    Ok(())
}

pub fn cmd_shutdown(project_dir: &Path) -> Result<()> {
    request(project_dir, ControlRequest::Shutdown)?;
    println!("The scheduler will stop dispatching and exit once live agents finish.");
    Ok(())
}
