use clap::Parser;
use helm_commander::error::Error;
use tracing_subscriber::EnvFilter;

use crate::cli_utils::output::OutputFormat;

pub(crate) mod cli_utils;
pub mod console_logger;

#[derive(Parser, Debug)]
#[clap(
    name = "helm-commander",
    version,
    about = "Inspect Helm v3 releases straight from cluster storage"
)]
struct CliArgs {
    #[clap(subcommand)]
    operations: cli_utils::Operations,

    #[clap(flatten)]
    ctx: cli_utils::K8sCtxArgs,

    /// Output format.
    #[clap(global = true, long, short = 'o', value_enum, default_value = "table")]
    output: OutputFormat,

    /// Deadline for the whole invocation.
    #[clap(global = true, long, default_value = "60s")]
    timeout: humantime::Duration,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli_args = CliArgs::parse();
    std::process::exit(cli_args.execute().await);
}

impl CliArgs {
    async fn execute(self) -> i32 {
        let CliArgs {
            operations,
            ctx,
            output,
            timeout,
        } = self;

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                console_logger::error("Interrupted", "aborting");
                2
            }
            _ = tokio::time::sleep(*timeout) => {
                let deadline = Error::deadline(timeout.as_secs());
                console_logger::error("Partial result", &deadline.to_string());
                exit_code_for(&deadline.into())
            }
            result = operations.execute(&ctx, output) => match result {
                Ok(exit_code) => exit_code,
                Err(error) => {
                    console_logger::error("Error", &format!("{error:#}"));
                    exit_code_for(&error)
                }
            }
        }
    }
}

/// Exit code contract: 0 success, 1 partial, 2 invocation error, 3 access
/// denied or cluster unreachable. Clap itself exits 2 on bad arguments.
fn exit_code_for(error: &anyhow::Error) -> i32 {
    match error.downcast_ref::<Error>() {
        Some(
            Error::ClusterUnreachable { .. }
            | Error::KubeconfigLoad { .. }
            | Error::KubeconfigInfer { .. }
            | Error::K8sClientGeneration { .. }
            | Error::AccessDenied { .. },
        ) => 3,
        Some(Error::DeadlineExceeded { .. }) => 1,
        _ => 2,
    }
}
