use server_core::{spawn_workers, AppConfig, Result, Runtime};
use tracing_subscriber::EnvFilter;

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let path = std::env::args().nth(1).unwrap_or_else(|| "config.yaml".to_string());
    let text = std::fs::read_to_string(&path)?;
    let config = AppConfig::from_yaml(&text)?;
    let workers = config.worker_threads;
    if let Some(pid_file) = &config.pid_file {
        std::fs::write(pid_file, format!("{}\n", std::process::id()))?;
    }

    let rt = Runtime::build(config)?;
    for handle in spawn_workers(&rt, workers) {
        match handle.join() {
            Ok(result) => result?,
            Err(_) => {
                return Err(server_core::ServerError::Config(
                    "worker thread panicked".into(),
                ))
            }
        }
    }
    Ok(())
}
