use std::process::ExitCode;

mod api;
mod backends;
mod cli;
mod config;
mod error;
mod executor;
mod facade;
mod registry;
mod store;
mod triage;

pub use config::Config;
pub use error::AppError;

#[tokio::main]
async fn main() -> ExitCode {
    cli::run().await
}
