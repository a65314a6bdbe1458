use crate::{
    cli::args::Cli,
    config::{load_targets_file, resolve_options, PipelineLoader},
    core::{scheduler::Orchestrator, scope::Scope, state::RunState},
    organizers::layout,
    reporters::{log::RunLog, summary},
    skills::SkillRegistry,
    ui::{printer, progress::ProgressManager},
    utils::{logging, time},
};
use anyhow::Result;

pub async fn run(cli: Cli) -> Result<()> {
    let level = logging::level_from_cli(&cli);
    logging::init(level)?;

    // Configuration errors surface here, before any run directory exists.
    let pipeline = PipelineLoader::load(&cli.pipeline)?;
    let options = resolve_options(&cli, &pipeline)?;

    let mut raw_targets = cli.targets.clone();
    if let Some(path) = &cli.targets_file {
        raw_targets.extend(load_targets_file(path)?);
    }

    let scope = match &options.scope_file {
        Some(path) => Scope::load(path)?,
        None => Scope::default(),
    };
    if scope.is_unrestricted() {
        tracing::warn!("No scope entries loaded; every target is in scope");
    } else {
        tracing::info!("Scope restricted to {} entries", scope.entries().len());
    }

    let registry = SkillRegistry::from_pipeline(&pipeline, Some(cli.skills_dir.as_path()))?;
    let stages = registry.resolve_stages(&pipeline)?;

    let run_ts = time::run_ts(chrono::Utc::now());
    let dirs = layout::prepare_run_dirs(&cli.runs_dir, &time::new_run_id(&run_ts))?;
    tracing::info!("Run ID: {}", dirs.run_id);

    let mut log = RunLog::create(&dirs.log_file, options.echo_stdout)?;
    let progress = ProgressManager::new();
    progress.update(&format!("Running pipeline {}", pipeline.name));

    let state = RunState::new(
        &dirs.run_id,
        &pipeline.name,
        pipeline.stages.iter().map(|s| (s.name.as_str(), s.destructive)),
    );
    let mut orchestrator = Orchestrator::new(
        &options,
        &scope,
        &mut log,
        &progress,
        &dirs.evidence,
        &run_ts,
        state,
    );
    let result = orchestrator.run(&stages, &raw_targets).await;
    tracing::info!("Finished with {} targets", orchestrator.targets().len());
    let state = orchestrator.into_state();

    match &result {
        Ok(()) => progress.finish("Pipeline complete"),
        Err(_) => progress.abandon(),
    }

    summary::write_json_summary(&state, &dirs)?;
    printer::print_summary(&state, &dirs);
    tracing::info!("{} records in {:?}", log.count(), log.path());

    result?;
    Ok(())
}
