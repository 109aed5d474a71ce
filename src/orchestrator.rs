//! Top-level control flow of a test run
//!
//! start backend -> start command server -> start test runner -> command
//! loop -> ordered shutdown -> asset extraction -> exit code.
//!
//! The children are always torn down on the way out, whichever way the run
//! ends, and the last line on stdout is `"<pid>: EXIT <code>"`.

use std::path::PathBuf;
use std::sync::Arc;

use crate::common::{config::Config, Result};
use crate::runner::{assets, run_loop, CommandHandler};
use crate::session::Session;
use crate::supervisor::shutdown::{self, ShutdownToken};
use crate::supervisor::Supervisor;

/// Stop reason used by the final teardown
const TEARDOWN_REASON: &str = "test execution ended through exception";

/// Stop reason used when a second signal forces termination
const SIGNAL_REASON: &str = "received signal";

/// Inputs of a run
#[derive(Debug, Clone)]
pub struct Options {
    pub config: Option<PathBuf>,
    pub workdir: PathBuf,
    pub overrides: Vec<(String, String)>,
}

/// Execute a complete run and return the process exit code
pub async fn execute(options: Options) -> i32 {
    let config = match Config::load(options.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            tracing::error!("{}", e);
            return finish(1);
        }
    };

    let token = Arc::new(ShutdownToken::new());
    if let Err(e) = shutdown::listen_for_signals(token.clone()) {
        tracing::warn!("unable to install signal handlers: {}", e);
    }

    let mut session = Session::new(&options.workdir);
    let mut supervisor = Supervisor::new(&config);

    let outcome = tokio::select! {
        biased;
        _ = token.forced() => None,
        result = run(&config, &options, &mut session, &mut supervisor, &token) => Some(result),
    };

    let Some(result) = outcome else {
        tracing::warn!("terminating all processes immediately");
        supervisor.kill_all(SIGNAL_REASON).await;
        return finish(1);
    };

    let return_code = match result {
        Ok(()) => session.return_code,
        Err(e) => {
            tracing::error!("{}", e);
            1
        }
    };

    supervisor.teardown(TEARDOWN_REASON).await;
    finish(return_code)
}

/// Print the exit summary
fn finish(return_code: i32) -> i32 {
    println!("{}: EXIT {}", std::process::id(), return_code);
    return_code
}

async fn run(
    config: &Config,
    options: &Options,
    session: &mut Session,
    supervisor: &mut Supervisor,
    token: &ShutdownToken,
) -> Result<()> {
    session.load(&options.overrides)?;
    session.save()?;
    let env = session.child_env();

    let backend = session.backend_name(config);
    supervisor.start_backend(config, &backend, &env).await?;
    let base_port = session.base_port(config)?;
    supervisor.start_command_server(config, base_port, session.job_token(), &env)?;
    supervisor.start_autotest(config, &env)?;

    session.write_pid_file()?;
    session.return_code = 0;

    let mut handler = CommandHandler::new();
    let exit = {
        let (mut endpoints, exits) = supervisor.loop_parts()?;
        run_loop(&mut handler, &mut endpoints, exits, token).await
    };
    tracing::info!(?exit, "command loop finished");
    if exit.is_failure() {
        session.return_code = 1;
    }

    token.begin_shutdown();
    handler.stop_processing();

    let clean_shutdown = supervisor.handle_shutdown(&mut session.return_code).await;

    if let Err(e) = session.reload().and_then(|()| session.save()) {
        tracing::warn!("unable to update {}: {}", session.vars_path().display(), e);
    }

    if session.return_code == 0 {
        if let Some(backend) = supervisor.backend_mut() {
            session.return_code = assets::handle_generated_assets(
                backend,
                session.vars(),
                handler.test_completed(),
                clean_shutdown,
            )
            .await;
        }
    }

    tracing::info!(return_code = session.return_code, "test run finished");
    Ok(())
}
