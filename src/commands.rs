use crate::cli::{AutoscaleArgs, Cli, Commands, ScaleArgs, SignArgs, VmsArgs, WaitArgs};
use std::path::Path;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use vdcfleet::autoscale::{Autoscaler, HaproxyStats, LoadSource, StaticLoad};
use vdcfleet::client::{ApiError, CloudApi, CloudPoller, VdcClient, VmFilter};
use vdcfleet::config::Config;
use vdcfleet::fleet::{CloudFleetActions, LifecycleState, ReconcileOutcome, Reconciler};
use vdcfleet::observability::{self, Metrics};
use vdcfleet::signer::{Params, RequestSigner};
use vdcfleet::tracker::{OperationResult, OperationTracker};

pub type AnyError = Box<dyn std::error::Error + Send + Sync + 'static>;

pub async fn run(cli: Cli) -> Result<(), AnyError> {
    let tracing = observability::init_tracing("info");
    let config = Config::load_with(cli.config)?;
    if let Err(e) = tracing.apply_filter(&config.telemetry.log_filter) {
        warn!(error = %e, "Keeping the default log filter");
    }

    let metrics = Arc::new(Metrics::new());

    let result = match cli.command {
        Commands::Sign(args) => sign(&config, args).await,
        Commands::Vms(args) => vms(&config, args).await,
        Commands::Wait(args) => wait(&config, args, &metrics).await,
        Commands::Scale(args) => scale(&config, args, &metrics).await,
        Commands::Autoscale(args) => autoscale(&config, args, &metrics).await,
    };

    let snapshot = metrics.snapshot();
    tracing::debug!(?snapshot, "Final counters");

    result
}

fn build_client(config: &Config) -> Result<VdcClient, AnyError> {
    let signer = config.request_signer()?;
    Ok(VdcClient::new(
        signer,
        config.http_config(),
        config.api.region.clone(),
    )?)
}

async fn sign(config: &Config, args: SignArgs) -> Result<(), AnyError> {
    let arguments: serde_json::Value = serde_json::from_str(&args.arguments)
        .map_err(|e| format!("--arguments is not valid JSON: {}", e))?;
    let object = arguments
        .as_object()
        .ok_or("--arguments must be a JSON object")?;

    let mut params = Params::from_json(object)?;
    if let Some(region) = &config.api.region {
        if params.get("region").is_none() {
            params.insert("region", region);
        }
    }

    let mut options = config.sign_options();
    if let Some(expires) = args.expires {
        options.expiry = Some(expires.as_duration());
    }

    let signer = RequestSigner::new(config.credential()?, options);
    let signed = signer.sign(&args.command, &params)?;

    println!("Calculated VDC signature: {}", signed.signature);
    match &signed.expires {
        Some(expires) => println!("Runnable URL (expires at {}):\n{}", expires, signed.url()),
        None => println!("Runnable URL:\n{}", signed.url()),
    }

    if !args.execute {
        return Ok(());
    }

    let method = args.method.unwrap_or(config.api.method);
    let client = VdcClient::new(signer, config.http_config(), config.api.region.clone())?;

    match client.execute(&signed, method).await {
        Ok(body) => {
            let rendered = serde_json::from_str::<serde_json::Value>(&body)
                .and_then(|v| serde_json::to_string_pretty(&v))
                .unwrap_or(body);
            match &args.outfile {
                Some(path) => write_response(path, &rendered)?,
                None => println!("Response:\n{}", rendered),
            }
            Ok(())
        }
        Err(ApiError::Http {
            status,
            description,
        }) => {
            println!("HTTP Error: {}", status);
            println!("{}", description);
            Err(format!("{} failed with HTTP {}", args.command, status).into())
        }
        Err(e) => Err(e.into()),
    }
}

fn write_response(path: &Path, body: &str) -> Result<(), AnyError> {
    std::fs::write(path, body)?;
    println!("Response written to {}", path.display());
    Ok(())
}

async fn vms(config: &Config, args: VmsArgs) -> Result<(), AnyError> {
    let client = build_client(config)?;
    let vms = client.list_virtual_machines(&VmFilter::all()).await?;

    let prefix = args
        .prefix
        .unwrap_or_else(|| config.autoscale.name_prefix.clone());
    let member_prefix = format!("{}-", prefix);

    println!(
        "{:<24} {:<12} {:<12} {:<38} {}",
        "NAME", "STATE", "LIFECYCLE", "ID", "CREATED"
    );
    for vm in vms
        .iter()
        .filter(|vm| args.all || vm.name.starts_with(&member_prefix))
    {
        let created = vm
            .created_at()
            .map(|t| t.to_rfc3339())
            .unwrap_or_else(|| "NA".to_string());
        println!(
            "{:<24} {:<12} {:<12} {:<38} {}",
            vm.name,
            vm.state,
            LifecycleState::from_provider(&vm.state),
            vm.id,
            created
        );
    }

    Ok(())
}

async fn wait(config: &Config, args: WaitArgs, metrics: &Arc<Metrics>) -> Result<(), AnyError> {
    let cloud = Arc::new(build_client(config)?);

    let mut tracker_config = config.tracker_config();
    if let Some(timeout) = args.timeout {
        tracker_config.timeout = timeout.as_duration();
    }

    let cancel = CancellationToken::new();
    let tracker = OperationTracker::new(CloudPoller::new(cloud), tracker_config)
        .with_cancellation(cancel.clone())
        .with_metrics(Arc::clone(metrics));

    let watcher = tokio::spawn(cancel_on_shutdown(cancel));
    let results = tracker
        .await_jobs(args.job_ids, |progress| {
            info!(
                sweep = progress.sweep,
                pending = progress.pending,
                "Waiting for jobs"
            )
        })
        .await;
    watcher.abort();

    let results = results?;
    let mut incomplete = 0;
    for (job_id, result) in &results {
        match result {
            OperationResult::Succeeded(_) => println!("{}: succeeded", job_id),
            OperationResult::Failed(reason) => {
                incomplete += 1;
                println!("{}: failed: {}", job_id, reason);
            }
            OperationResult::TimedOut { elapsed } => {
                incomplete += 1;
                println!("{}: timed out after {}s", job_id, elapsed.as_secs());
            }
        }
    }

    if incomplete > 0 {
        return Err(format!("{} of {} job(s) did not succeed", incomplete, results.len()).into());
    }
    Ok(())
}

async fn scale(config: &Config, args: ScaleArgs, metrics: &Arc<Metrics>) -> Result<(), AnyError> {
    let load = args.load.unwrap_or_default();
    let autoscaler = build_autoscaler(config, StaticLoad::new(load), metrics)?;

    let target = match args.target {
        Some(target) => target,
        None => autoscaler.policy().target_for_load(load),
    };

    let watcher = tokio::spawn(cancel_on_shutdown(autoscaler.cancellation_token().clone()));
    let outcome = autoscaler.reconcile_to(target).await;
    watcher.abort();

    let outcome = outcome?;
    print_outcome(&outcome);

    if !outcome.report.is_complete() {
        return Err("not every fleet change completed".into());
    }
    Ok(())
}

async fn autoscale(
    config: &Config,
    args: AutoscaleArgs,
    metrics: &Arc<Metrics>,
) -> Result<(), AnyError> {
    if !config.autoscale.enabled {
        return Err("autoscaling is disabled (set autoscale.enabled = true)".into());
    }

    let load_config = &config.autoscale.load;
    let stats_url = load_config
        .stats_url
        .as_deref()
        .ok_or("autoscale.load.stats_url is not set")?;
    let mut stats = HaproxyStats::new(stats_url, &load_config.frontend)?;
    if let Some(user) = &load_config.username {
        stats = stats.with_basic_auth(user, load_config.password.clone().unwrap_or_default());
    }

    let autoscaler = build_autoscaler(config, stats, metrics)?
        .with_period(config.autoscale.period.as_duration());

    if args.once {
        let report = autoscaler.run_once().await?;
        println!("Load {} -> target {}", report.load, report.target);
        print_outcome(&report.outcome);
        return Ok(());
    }

    let watcher = tokio::spawn(cancel_on_shutdown(autoscaler.cancellation_token().clone()));
    autoscaler.run().await;
    watcher.abort();

    Ok(())
}

fn build_autoscaler<L: LoadSource>(
    config: &Config,
    load: L,
    metrics: &Arc<Metrics>,
) -> Result<Autoscaler<VdcClient, L>, AnyError> {
    let cloud = Arc::new(build_client(config)?);
    let template = config.deploy_template()?;

    let actions = CloudFleetActions::new(Arc::clone(&cloud), template)
        .with_expunge(config.autoscale.expunge);
    let reconciler = Reconciler::new(config.name_policy()).with_metrics(Arc::clone(metrics));
    let tracker = OperationTracker::new(CloudPoller::new(Arc::clone(&cloud)), config.tracker_config())
        .with_metrics(Arc::clone(metrics));

    Ok(Autoscaler::new(
        cloud,
        load,
        config.scaling_policy()?,
        reconciler,
        actions,
        tracker,
    ))
}

fn print_outcome(outcome: &ReconcileOutcome) {
    let report = &outcome.report;
    println!(
        "Fleet: {} counted member(s), target {} (delta {})",
        outcome.fleet.counted(),
        report.target,
        report.delta
    );
    for change in &report.changes {
        println!(
            "  {:?} {}: {:?}{}",
            change.kind,
            change.name,
            change.outcome,
            change
                .job_id
                .as_deref()
                .map(|id| format!(" (job {})", id))
                .unwrap_or_default()
        );
    }
    for member in outcome.fleet.iter() {
        println!("  {:<24} {:<12} {}", member.name, member.state, member.id);
    }
}

async fn cancel_on_shutdown(token: CancellationToken) {
    shutdown_signal().await;
    token.cancel();
}

async fn shutdown_signal() {
    // Wait for Ctrl+C
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("Shutdown signal received, cancelling");
}
