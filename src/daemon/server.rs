//! Daemon Server (C6): two Unix-socket accept loops wired to the rule
//! engine, approval manager, and event bus.

use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::mpsc;

use crate::approval::{ApprovalManager, MemoryKey, SessionMemory};
use crate::config::Config;
use crate::context::{CommandContext, GitStateCache};
use crate::daemon::protocol::{
    read_line, write_message, DaemonRequest, DaemonResponse, MonitorCommand, MonitorCommandType,
    MonitorEventFrame, MonitorResponse, RequestType,
};
use crate::error::Result;
use crate::events::{Event, EventBus, EventPublisher};
use crate::rules::{load_rules, ConditionCache, RuleCache, RuleEvaluator};

pub struct DaemonState {
    config: Config,
    rule_cache: RuleCache,
    condition_cache: ConditionCache,
    git_cache: GitStateCache,
    events: EventPublisher,
    approvals: ApprovalManager,
    session_memory: SessionMemory,
    started_at: Instant,
    commands_processed: AtomicU64,
    active_monitors: AtomicU64,
    enabled: AtomicBool,
}

impl DaemonState {
    pub fn new(config: Config) -> Arc<Self> {
        let events: EventPublisher = Arc::new(EventBus::new());
        let approvals = ApprovalManager::new(events.clone());
        let memory_ttl = Duration::from_secs(config.approval_memory_ttl_seconds);
        Arc::new(Self {
            config,
            rule_cache: RuleCache::default(),
            condition_cache: ConditionCache::default(),
            git_cache: GitStateCache::default(),
            events,
            approvals,
            session_memory: SessionMemory::new(memory_ttl),
            started_at: Instant::now(),
            commands_processed: AtomicU64::new(0),
            active_monitors: AtomicU64::new(0),
            enabled: AtomicBool::new(true),
        })
    }

    fn uptime_seconds(&self) -> f64 {
        self.started_at.elapsed().as_secs_f64()
    }
}

/// Binds both sockets with 0600 permissions and runs both accept loops
/// until a termination signal arrives.
pub async fn run(config: Config) -> Result<()> {
    crate::daemon::lifecycle::cleanup_on_start().await?;

    let state = DaemonState::new(config);
    let request_path = crate::paths::request_socket_path();
    let monitor_path = crate::paths::monitor_socket_path();

    let request_listener = bind_private(&request_path)?;
    let monitor_listener = bind_private(&monitor_path)?;

    crate::daemon::lifecycle::write_pid(&crate::paths::pid_path())?;
    tracing::info!(request = %request_path.display(), monitor = %monitor_path.display(), "daemon listening");
    state.events.publish(Event::daemon_status("started", 0.0, 0, 0)).await;

    let request_state = state.clone();
    let request_task = tokio::spawn(async move {
        accept_requests(request_listener, request_state).await;
    });

    let monitor_state = state.clone();
    let monitor_task = tokio::spawn(async move {
        accept_monitors(monitor_listener, monitor_state).await;
    });

    wait_for_shutdown().await;
    tracing::info!("shutdown signal received, stopping");

    state
        .events
        .publish(Event::daemon_status(
            "stopping",
            state.uptime_seconds(),
            state.commands_processed.load(Ordering::Relaxed),
            state.active_monitors.load(Ordering::Relaxed) as usize,
        ))
        .await;

    request_task.abort();
    monitor_task.abort();
    let _ = std::fs::remove_file(&request_path);
    let _ = std::fs::remove_file(&monitor_path);
    crate::daemon::lifecycle::remove_pid(&crate::paths::pid_path());

    Ok(())
}

fn bind_private(path: &PathBuf) -> Result<UnixListener> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let _ = std::fs::remove_file(path);
    let listener = UnixListener::bind(path)?;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
    Ok(listener)
}

#[cfg(unix)]
async fn wait_for_shutdown() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut term = signal(SignalKind::terminate()).expect("install SIGTERM handler");
    let mut int = signal(SignalKind::interrupt()).expect("install SIGINT handler");
    tokio::select! {
        _ = term.recv() => {}
        _ = int.recv() => {}
    }
}

async fn accept_requests(listener: UnixListener, state: Arc<DaemonState>) {
    loop {
        match listener.accept().await {
            Ok((stream, _addr)) => {
                let state = state.clone();
                tokio::spawn(async move {
                    if let Err(e) = handle_request_connection(stream, state).await {
                        tracing::warn!(error = %e, "request connection ended with error");
                    }
                });
            }
            Err(e) => tracing::warn!(error = %e, "failed to accept request connection"),
        }
    }
}

async fn handle_request_connection(stream: UnixStream, state: Arc<DaemonState>) -> Result<()> {
    let client_pid = peer_pid(&stream);
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);

    let line = read_line(&mut reader).await?;
    let request: DaemonRequest = match serde_json::from_str(&line) {
        Ok(r) => r,
        Err(e) => {
            write_message(&mut write_half, &DaemonResponse::error(&e.to_string())).await?;
            return Ok(());
        }
    };

    let response = match request.kind {
        RequestType::Ping => DaemonResponse::ok(),
        RequestType::Status => DaemonResponse::status(format!(
            "uptime={:.1}s commands={} pending_approvals={}",
            state.uptime_seconds(),
            state.commands_processed.load(Ordering::Relaxed),
            state.approvals.pending_count().await
        )),
        RequestType::Evaluate => evaluate_request(&request, &state, &mut write_half, client_pid).await,
    };

    write_message(&mut write_half, &response).await
}

fn peer_pid(stream: &UnixStream) -> Option<u32> {
    stream.peer_cred().ok().and_then(|c| c.pid()).map(|p| p as u32)
}

async fn evaluate_request(
    request: &DaemonRequest,
    state: &Arc<DaemonState>,
    write_half: &mut (impl AsyncWriteExt + Unpin),
    client_pid: Option<u32>,
) -> DaemonResponse {
    let Some(command) = request.command.as_deref() else {
        return DaemonResponse::error("evaluate request missing `command`");
    };

    state.commands_processed.fetch_add(1, Ordering::Relaxed);

    let working_dir = request
        .working_dir
        .clone()
        .map(std::path::PathBuf::from)
        .unwrap_or_else(|| std::env::current_dir().unwrap_or_default());

    state
        .events
        .publish(Event::command_received(
            command,
            &working_dir.to_string_lossy(),
            client_pid,
        ))
        .await;

    if !state.enabled.load(Ordering::Relaxed) {
        return DaemonResponse::allow();
    }

    let ctx = CommandContext::from_command(
        command,
        working_dir.clone(),
        request.env.clone(),
        request.execution_context,
        &state.git_cache,
    );

    let rules = match state.rule_cache.get_or_load(&working_dir, load_rules) {
        Ok(rules) => rules,
        Err(e) => return DaemonResponse::error(&e.to_string()),
    };
    let evaluator = RuleEvaluator::new(rules);

    state
        .events
        .publish(Event::evaluation_started(command, evaluator.rule_count()))
        .await;

    let (outcome, elapsed) =
        crate::rules::engine::evaluate_with_budget(&evaluator, &ctx, &state.condition_cache);
    if elapsed.as_millis() as u64 > state.config.condition_timeout_ms {
        tracing::warn!(
            command,
            elapsed_ms = elapsed.as_millis(),
            budget_ms = state.config.condition_timeout_ms,
            "evaluation exceeded condition_timeout_ms"
        );
    }

    state
        .events
        .publish(Event::evaluation_completed(
            command,
            &format!("{:?}", outcome.action),
            outcome.rule_name.as_deref(),
            outcome.message.as_deref(),
        ))
        .await;

    use crate::rules::Action;
    match outcome.action {
        Action::Allow => DaemonResponse::allow(),
        Action::Redirect => {
            let redirect_to = outcome.redirect_to.unwrap_or_default();
            let rendered = redirect_to.replace("$ARGS", &ctx.args().join(" "));
            DaemonResponse::redirect(
                &rendered,
                outcome.rule_name.as_deref().unwrap_or(""),
                outcome.message.as_deref().unwrap_or(""),
            )
        }
        Action::Deny => {
            DaemonResponse::deny_with_override(
                outcome.message.as_deref().unwrap_or("denied by policy"),
                outcome.rule_name.as_deref().unwrap_or(""),
                outcome.allow_override,
            )
        }
        Action::RequireApproval => {
            handle_require_approval(outcome, &ctx, state, write_half, client_pid).await
        }
    }
}

async fn handle_require_approval(
    outcome: crate::rules::EvaluationOutcome,
    ctx: &CommandContext,
    state: &Arc<DaemonState>,
    write_half: &mut (impl AsyncWriteExt + Unpin),
    client_pid: Option<u32>,
) -> DaemonResponse {
    let rule_name = outcome.rule_name.clone().unwrap_or_default();
    let reason = outcome.message.clone().unwrap_or_default();
    let key = MemoryKey::new(rule_name.clone(), ctx.base_command().to_string());

    if state.session_memory.is_pre_approved(&key) {
        return DaemonResponse::allow();
    }
    if state.session_memory.is_pre_denied(&key) {
        return DaemonResponse::deny(&reason, &rule_name);
    }

    let approval_id = uuid::Uuid::new_v4().to_string();
    let intermediate =
        DaemonResponse::waiting_for_approval(&ctx.raw_command, &rule_name, &reason, &approval_id);
    let _ = write_message(write_half, &intermediate).await;

    let timeout = Duration::from_secs_f64(state.config.approval_timeout_seconds);
    let (_, result) = state
        .approvals
        .request_approval_with_id(
            approval_id,
            &ctx.raw_command,
            &rule_name,
            &reason,
            timeout,
            Some(ctx.working_dir.to_string_lossy().to_string()),
            client_pid,
        )
        .await;

    if result.remember() {
        if result.approved() {
            state.session_memory.remember_approval(key);
        } else {
            state.session_memory.remember_denial(key);
        }
    }

    if result.approved() {
        DaemonResponse::allow()
    } else {
        DaemonResponse::deny(&reason, &rule_name)
    }
}

// Monitor socket -------------------------------------------------------

async fn accept_monitors(listener: UnixListener, state: Arc<DaemonState>) {
    loop {
        match listener.accept().await {
            Ok((stream, _addr)) => {
                let state = state.clone();
                tokio::spawn(async move {
                    if let Err(e) = handle_monitor_connection(stream, state).await {
                        tracing::warn!(error = %e, "monitor connection ended with error");
                    }
                });
            }
            Err(e) => tracing::warn!(error = %e, "failed to accept monitor connection"),
        }
    }
}

async fn handle_monitor_connection(stream: UnixStream, state: Arc<DaemonState>) -> Result<()> {
    state.active_monitors.fetch_add(1, Ordering::Relaxed);
    let result = serve_monitor_connection(stream, state.clone()).await;
    state.active_monitors.fetch_sub(1, Ordering::Relaxed);
    result
}

async fn serve_monitor_connection(stream: UnixStream, state: Arc<DaemonState>) -> Result<()> {
    let (read_half, write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);

    let (tx, mut rx) = mpsc::unbounded_channel::<MonitorEventFrame>();
    let sub_id = state
        .events
        .subscribe(move |event| tx.send(MonitorEventFrame::new(event)).is_ok())
        .await;

    let writer = Arc::new(tokio::sync::Mutex::new(write_half));
    let pump_writer = writer.clone();
    let pump_task = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            let mut w = pump_writer.lock().await;
            if write_message(&mut *w, &frame).await.is_err() {
                break;
            }
        }
    });

    {
        let mut w = writer.lock().await;
        let _ = write_message(&mut *w, &MonitorResponse::ok("connected")).await;
    }

    loop {
        let line = match read_line(&mut reader).await {
            Ok(l) => l,
            Err(_) => break,
        };
        let command: MonitorCommand = match serde_json::from_str(&line) {
            Ok(c) => c,
            Err(e) => {
                let mut w = writer.lock().await;
                let _ = write_message(&mut *w, &MonitorResponse::err(e.to_string())).await;
                continue;
            }
        };

        let response = dispatch_monitor_command(&command, &state).await;
        let mut w = writer.lock().await;
        if write_message(&mut *w, &response).await.is_err() {
            break;
        }
    }

    state.events.unsubscribe(sub_id).await;
    pump_task.abort();
    Ok(())
}

async fn dispatch_monitor_command(command: &MonitorCommand, state: &Arc<DaemonState>) -> MonitorResponse {
    match command.kind {
        MonitorCommandType::Subscribe => MonitorResponse::ok("subscribed"),
        MonitorCommandType::Unsubscribe => MonitorResponse::ok("unsubscribed"),
        MonitorCommandType::Ping => MonitorResponse::ok("pong"),
        MonitorCommandType::Approve => match &command.approval_id {
            Some(id) if state.approvals.approve(id, command.remember).await => {
                MonitorResponse::ok("approved")
            }
            Some(id) => MonitorResponse::err(format!("no pending approval with id {id}")),
            None => MonitorResponse::err("approve requires approval_id"),
        },
        MonitorCommandType::Deny => match &command.approval_id {
            Some(id)
                if state
                    .approvals
                    .deny(id, command.reason.clone(), command.remember)
                    .await =>
            {
                MonitorResponse::ok("denied")
            }
            Some(id) => MonitorResponse::err(format!("no pending approval with id {id}")),
            None => MonitorResponse::err("deny requires approval_id"),
        },
        MonitorCommandType::SetEnabled => match command.enabled {
            Some(enabled) => {
                state.enabled.store(enabled, Ordering::Relaxed);
                MonitorResponse::ok(format!("enabled={enabled}"))
            }
            None => MonitorResponse::err("set_enabled requires `enabled`"),
        },
        MonitorCommandType::ReloadRules => {
            state.rule_cache.invalidate_all();
            MonitorResponse::ok("rule cache invalidated")
        }
        MonitorCommandType::GetStatus => MonitorResponse::ok(format!(
            "uptime={:.1}s commands={} enabled={}",
            state.uptime_seconds(),
            state.commands_processed.load(Ordering::Relaxed),
            state.enabled.load(Ordering::Relaxed)
        )),
    }
}
