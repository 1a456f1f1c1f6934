use std::path::PathBuf;
use std::process::ExitCode;

use drydock_core::AppContext;
use drydock_core::DrydockErr;
use drydock_core::replay;
use drydock_core::replay::ReplayOptions;
use drydock_core::session::OpenMode;
use drydock_core::session::Store;
use drydock_protocol::SessionState;
use drydock_rpc_server::run_main;

/// Exit codes of the CLI wrapper: 0 success (or terminal success state),
/// 1 operational error, 2 invalid input, 10 session denied, 11 session
/// expired, 12 replay failed.
const EXIT_OK: u8 = 0;
const EXIT_OPERATIONAL: u8 = 1;
const EXIT_INVALID_INPUT: u8 = 2;
const EXIT_DENIED: u8 = 10;
const EXIT_EXPIRED: u8 = 11;
const EXIT_REPLAY_FAILED: u8 = 12;

#[derive(Debug)]
enum Invocation {
    Serve,
    Version,
    /// Replay an approved session and exit; this is what the remote
    /// executor invokes on the target host.
    ExecuteSession {
        session_id: String,
        session_root: Option<PathBuf>,
    },
}

fn parse_args(args: &[String]) -> Result<Invocation, String> {
    let mut session_id = None;
    let mut session_root = None;
    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--version" => return Ok(Invocation::Version),
            "--execute-session" => {
                session_id = Some(
                    iter.next()
                        .ok_or("--execute-session requires a session id")?
                        .clone(),
                );
            }
            "--session-root" => {
                session_root = Some(PathBuf::from(
                    iter.next().ok_or("--session-root requires a path")?,
                ));
            }
            other => return Err(format!("unknown argument {other:?}")),
        }
    }
    match session_id {
        Some(session_id) => Ok(Invocation::ExecuteSession {
            session_id,
            session_root,
        }),
        None if session_root.is_some() => {
            Err("--session-root only makes sense with --execute-session".to_string())
        }
        None => Ok(Invocation::Serve),
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let invocation = match parse_args(&args) {
        Ok(invocation) => invocation,
        Err(message) => {
            tracing::error!("{message}");
            return ExitCode::from(EXIT_INVALID_INPUT);
        }
    };

    match invocation {
        Invocation::Version => {
            // The one place stdout carries something other than JSON-RPC.
            #[allow(clippy::print_stdout)]
            {
                println!("drydock-rpc-server {}", env!("CARGO_PKG_VERSION"));
            }
            ExitCode::from(EXIT_OK)
        }
        Invocation::Serve => {
            let ctx = match AppContext::load() {
                Ok(ctx) => ctx,
                Err(e) => {
                    tracing::error!("failed to load configuration: {e}");
                    return ExitCode::from(exit_code_for(&e));
                }
            };
            match run_main(ctx).await {
                Ok(()) => ExitCode::from(EXIT_OK),
                Err(e) => {
                    tracing::error!("server failed: {e}");
                    ExitCode::from(EXIT_OPERATIONAL)
                }
            }
        }
        Invocation::ExecuteSession {
            session_id,
            session_root,
        } => match execute_session(&session_id, session_root).await {
            Ok(state) => ExitCode::from(match state {
                SessionState::Executed => EXIT_OK,
                SessionState::Failed => EXIT_REPLAY_FAILED,
                _ => EXIT_OPERATIONAL,
            }),
            Err(e) => {
                tracing::error!("execute-session failed: {e}");
                ExitCode::from(exit_code_for(&e))
            }
        },
    }
}

async fn execute_session(
    session_id: &str,
    session_root: Option<PathBuf>,
) -> Result<SessionState, DrydockErr> {
    let mut ctx = AppContext::load()?;
    if let Some(root) = session_root {
        ctx.session_root = root;
    }
    let store = Store::from_ctx(&ctx);
    let mut session = store.open(session_id, OpenMode::Mutate)?;
    match session.state()? {
        SessionState::Approved => {}
        SessionState::Expired => return Err(DrydockErr::Expired(session_id.to_string())),
        SessionState::Denied => {
            return Err(DrydockErr::Denied(format!(
                "session {session_id} was denied"
            )));
        }
        other => {
            return Err(DrydockErr::InvalidInput(format!(
                "session {session_id} is {other}, not approved"
            )));
        }
    }
    let table = replay::replay_table(&ctx)?;
    replay::execute(
        &mut session,
        &table,
        &ReplayOptions {
            op_timeout: ctx.replay_op_timeout,
        },
    )
    .await
}

fn exit_code_for(e: &DrydockErr) -> u8 {
    match e {
        DrydockErr::InvalidInput(_) | DrydockErr::NotFound(_) => EXIT_INVALID_INPUT,
        DrydockErr::Denied(_) => EXIT_DENIED,
        DrydockErr::Expired(_) => EXIT_EXPIRED,
        _ => EXIT_OPERATIONAL,
    }
}
