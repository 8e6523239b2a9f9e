//! visiond - inventory vision command line
//!
//! Analyzes stored photos and videos, records human review and sweeps
//! detections orphaned by interrupted runs. See `visiond --help`.

use anyhow::Result;

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    inventory_vision::cli::run()
}
