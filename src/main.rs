use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio_util::sync::CancellationToken;

use oj_engine::config::{CliArgs, Config};
use oj_engine::judge::{Judge, JudgeOptions};
use oj_engine::language::LanguageRegistry;
use oj_engine::routes::JudgeRequest;
use oj_engine::sandbox::create_executor;
use oj_engine::web_server::build_server;

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init_from_env(env_logger::Env::new().default_filter_or("info"));

    let cli = CliArgs::parse();
    let Config {
        server: server_config,
        judge: judge_config,
        executor: executor_config,
        profiles,
        languages,
    } = cli.to_config().context("Failed to load configuration")?;

    let registry = LanguageRegistry::from_config(&languages, &profiles)?;
    let executor = create_executor(&executor_config, &judge_config)?;
    let options = JudgeOptions::from_config(&judge_config)?;
    let judge = Judge::new(Arc::new(registry), executor, options);

    if let Some(path) = &cli.judge_path {
        let file = std::fs::File::open(path).with_context(|| format!("Failed to open {path}"))?;
        let request: JudgeRequest = serde_json::from_reader(std::io::BufReader::new(file))
            .with_context(|| format!("Failed to parse submission {path}"))?;

        let result = judge
            .judge(
                &request.question,
                &request.language,
                &request.source_code,
                request.submission_type,
                &CancellationToken::new(),
            )
            .await?;
        println!("{}", serde_json::to_string_pretty(&result)?);
        return Ok(());
    }

    if let Err(e) = judge.health_check().await {
        log::warn!("{} backend is not healthy yet: {e}", judge.backend());
    }

    let server = build_server(
        server_config,
        judge,
        judge_config.max_concurrent_submissions,
    )
    .context("Failed to build server")?;

    let server_handle = server.handle();
    let server_task = actix_web::rt::spawn(server);

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            log::info!("Ctrl-c received, shutting down...");
        }
        res_server = server_task => {
            log::error!("Server terminated unexpectedly: {:?}", res_server);
        }
    }

    server_handle.stop(true).await;

    log::info!("Shutdown complete");
    Ok(())
}
