use std::{process, sync::Arc};

use prerender_cache::{
    cache::{BackendConfig, CacheConfig, CacheGateway, CacheKey, PrerenderHooks, build_backend},
    config,
    infra::{
        error::AppError,
        http::{self, AppState},
        render::UpstreamRenderer,
        telemetry,
    },
};
use tracing::{Dispatch, Level, dispatcher, error, info};
use tracing_subscriber::fmt as tracing_fmt;

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        report_application_error(&error);
        process::exit(1);
    }
}

fn report_application_error(error: &AppError) {
    if dispatcher::has_been_set() {
        error!(error = %error, "application error");
        return;
    }

    let subscriber = tracing_fmt().with_max_level(Level::ERROR).finish();
    let dispatch = Dispatch::new(subscriber);
    dispatcher::with_default(&dispatch, || {
        error!(error = %error, "application error");
    });
}

async fn run() -> Result<(), AppError> {
    let (cli_args, settings) = config::load_with_cli()?;

    let command = cli_args
        .command
        .unwrap_or(config::Command::Serve(Box::<config::ServeArgs>::default()));

    match command {
        config::Command::Serve(_) => {
            telemetry::init(&settings.logging)?;
            run_serve(settings).await
        }
        config::Command::Locate(args) => run_locate(&settings, &args),
    }
}

async fn run_serve(settings: config::Settings) -> Result<(), AppError> {
    let cache_config = CacheConfig::from(&settings.cache);
    let backend = build_backend(&cache_config).await;
    let gateway = CacheGateway::from_config(backend, &cache_config);
    let hooks = PrerenderHooks::new(gateway, cache_config.ttl);
    let renderer = UpstreamRenderer::from_settings(&settings.renderer)?;

    info!(
        backend = %cache_config.backend.kind(),
        ttl_ms = settings.cache.ttl_ms.get(),
        renderer = %settings.renderer.url,
        "Starting prerender cache"
    );

    let router = http::build_router(AppState {
        hooks,
        renderer: Arc::new(renderer),
    });

    http::serve(
        router,
        settings.server.addr,
        settings.server.graceful_shutdown,
    )
    .await?;

    info!("Server stopped");
    Ok(())
}

fn run_locate(settings: &config::Settings, args: &config::LocateArgs) -> Result<(), AppError> {
    let key = CacheKey::derive(&args.url)?;

    println!("url:    {}", args.url);
    println!("key:    {}", key.digest());
    println!("shard:  {}", key.shard());
    println!("host:   {}", key.host());
    match &settings.cache.backend {
        BackendConfig::Disk { base_dir } => {
            println!("path:   {}", key.disk_path(base_dir).display());
        }
        BackendConfig::ObjectStore(store) => {
            println!(
                "object: s3://{}/{}",
                store.bucket,
                key.object_key(&store.prefix)
            );
        }
    }
    Ok(())
}
