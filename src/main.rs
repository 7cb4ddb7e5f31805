use anyhow::Result;
use log::{error, warn, LevelFilter};

use plc_link::cli::commands::failure_hint;
use plc_link::cli::{build_cli, handle_subcommands};

fn init_logging(verbose: bool) {
    let mut builder = env_logger::Builder::new();
    builder.filter_level(if verbose { LevelFilter::Debug } else { LevelFilter::Info });
    if let Ok(filters) = std::env::var("RUST_LOG") {
        builder.parse_filters(&filters);
    }
    builder.init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let matches = build_cli().get_matches();
    init_logging(matches.get_flag("verbose"));

    match handle_subcommands(&matches).await {
        Ok(true) => Ok(()),
        Ok(false) => {
            build_cli().print_help()?;
            Ok(())
        }
        Err(e) => {
            error!("❌ {:#}", e);
            if let Some(hint) = failure_hint(&e) {
                warn!("💡 {}", hint);
            }
            Err(e)
        }
    }
}
