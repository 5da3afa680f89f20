mod cli;
mod terminal;
mod web;

use anyhow::Result;
use cli::{Args, Command};
use tracing_subscriber::EnvFilter;
use web::server::{run_server, AppState};

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables from .env if present
    dotenvy::dotenv().ok();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let args = Args::parse_args();

    match &args.command {
        Command::Search(search) => terminal::run_search(&args, search).await?,
        Command::Serve(serve) => {
            let state = AppState {
                search_config: args.search_config()?,
                model_config: args.model_config(),
            };
            run_server(serve.host, serve.port, state).await?;
        }
    }

    Ok(())
}
