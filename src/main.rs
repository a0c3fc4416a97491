use std::{path::PathBuf, time::Duration};

use ::tracing::error;
use clap::Parser;
use service::Service;

mod admin_client;
mod callbacks;
mod config;
mod error;
mod gc;
mod handlers;
mod heartbeat;
mod http_objects;
mod joblog;
mod routes;
mod service;
mod tracing;
use handlers::HandlerRegistry;
use tracing::setup_tracing;
mod workers;

#[cfg(test)]
mod testing;

#[derive(Parser)]
#[command(version, about, long_about = None)]
struct Cli {
    #[arg(short, long, value_name = "config file", help = "Path to config file")]
    config: Option<PathBuf>,

    #[arg(
        long,
        value_name = "path",
        help = "Write a default config file to this path and exit"
    )]
    init_config: Option<PathBuf>,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    if let Some(path) = cli.init_config {
        println!("Initializing config file at: {:?}", path);
        config::ExecutorConfig::generate(&path).unwrap();
        return;
    }
    let config = match cli.config {
        Some(path) => config::ExecutorConfig::load(path.to_str()).unwrap(),
        None => config::ExecutorConfig::default(),
    };

    setup_tracing(&config);

    let service = match Service::new(config) {
        Ok(service) => service,
        Err(err) => {
            error!("error creating executor service: {:?}", err);
            return;
        }
    };
    register_demo_handlers(&service.handlers);

    if let Err(err) = service.start().await {
        error!("error starting executor service: {:?}", err);
    }
}

/// Sample handlers kept around so a fresh deployment has something to
/// trigger.
fn register_demo_handlers(handlers: &HandlerRegistry) {
    handlers.register_fn("demoTask", |ctx| async move {
        ctx.log(&format!("demoTask begin, params: {}", ctx.params))
            .await;
        for step in 1..=5 {
            if ctx.is_cancelled() {
                ctx.log("demoTask observed a stop request, ending early")
                    .await;
                return Ok(());
            }
            ctx.log(&format!("demoTask step {}", step)).await;
            tokio::time::sleep(Duration::from_millis(500)).await;
        }
        ctx.log("demoTask done").await;
        Ok(())
    });
}
