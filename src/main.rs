#![deny(warnings)]
#![deny(clippy::unwrap_used)]

//! One-shot command runner.
//!
//! Joins its arguments into a single shell command and executes it
//! locally, or — when `REXEC_TARGET` names a `user@host[:port]` — on
//! that host over SSH. The child's output streams to this process's
//! stdout/stderr and its exit code becomes the process exit code.
//!
//! Environment variables:
//!
//! * `REXEC_TARGET` — remote target; unset means local execution
//! * `REXEC_IDENTITY` — private key file offered during authentication
//! * `REXEC_FORWARD_LOCAL` / `REXEC_FORWARD_REMOTE` — port-forward specs
//!   (`lport:rhost:rport` / `rport:lhost:lport`) registered before the
//!   command runs
//! * `REXEC_COMMAND_TIMEOUT`, `REXEC_ASKPASS`, … — see [`rexec::config`]

use dotenv::dotenv;
use tokio::io::AsyncWriteExt;
use tracing::info;

use rexec::{ExecContext, ExecTarget, LocalExec, RemoteExec};

const TARGET_ENV_VAR: &str = "REXEC_TARGET";
const IDENTITY_ENV_VAR: &str = "REXEC_IDENTITY";
#[cfg(feature = "port_forward")]
const FORWARD_LOCAL_ENV_VAR: &str = "REXEC_FORWARD_LOCAL";
#[cfg(feature = "port_forward")]
const FORWARD_REMOTE_ENV_VAR: &str = "REXEC_FORWARD_REMOTE";

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv().ok();

    // Initialize logging with proper tracing default
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("info".parse().expect("valid directive")),
        )
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    if args.is_empty() {
        eprintln!("usage: rexec <command> [args...]");
        eprintln!(
            "       set {} to user@host[:port] for remote execution",
            TARGET_ENV_VAR
        );
        std::process::exit(2);
    }
    let command = args.join(" ");

    let ctx = ExecContext::from_env();
    let mut out = tokio::io::stdout();
    let mut err = tokio::io::stderr();

    let code = match std::env::var(TARGET_ENV_VAR) {
        Ok(target) => {
            let key = target.parse()?;
            info!("Executing on {}: {}", key, command);
            let mut exec = RemoteExec::new(ctx, key);

            if let Ok(identity) = std::env::var(IDENTITY_ENV_VAR) {
                exec.add_identity(&identity).await;
            }
            #[cfg(feature = "port_forward")]
            {
                if let Ok(spec) = std::env::var(FORWARD_LOCAL_ENV_VAR) {
                    exec.set_port_forwarding_local(&spec).await?;
                }
                if let Ok(spec) = std::env::var(FORWARD_REMOTE_ENV_VAR) {
                    exec.set_port_forwarding_remote(&spec).await?;
                }
            }

            let code = exec.execute_cmd(&command, &mut out, &mut err, None).await?;
            exec.close_connection().await;
            code
        }
        Err(_) => {
            info!("Executing locally: {}", command);
            let mut exec = LocalExec::new(ctx);
            exec.execute_cmd(&command, &mut out, &mut err, None).await?
        }
    };

    out.flush().await?;
    err.flush().await?;
    std::process::exit(code);
}
