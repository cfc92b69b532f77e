use anyhow::Result;
use tracing::{error, info};

use crawler_queue::cli;
use crawler_queue::utils::init_logging;

#[tokio::main]
async fn main() -> Result<()> {
    // Parse command line arguments
    let args = cli::parse_args();

    init_logging(args.verbose, args.log_file())?;
    info!("Starting crawler-queue v{}", env!("CARGO_PKG_VERSION"));

    match cli::process_command(args).await {
        Ok(_) => {
            info!("Command completed successfully");
            Ok(())
        }
        Err(e) => {
            error!("Command failed: {:#}", e);
            Err(e)
        }
    }
}
