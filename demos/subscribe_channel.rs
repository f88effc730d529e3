use std::env;
use std::error::Error;

use redis_subscriber::{Subscriber, SubscriberConfig, SubscriberStatus};
use secrecy::SecretString;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

fn config_from_env() -> SubscriberConfig {
    let channel = env::var("REDIS_CHANNEL").unwrap_or_else(|_| "__anycable__".to_string());
    let mut config = match env::var("REDIS_SENTINELS") {
        Ok(sentinels) if !sentinels.trim().is_empty() => {
            let master_name =
                env::var("REDIS_SENTINEL_MASTER").unwrap_or_else(|_| "mymaster".to_string());
            SubscriberConfig::sentinel(sentinels, master_name, channel)
        }
        _ => {
            let url =
                env::var("REDIS_URL").unwrap_or_else(|_| "redis://localhost:6379/5".to_string());
            SubscriberConfig::direct(url, channel)
        }
    };
    if let Ok(password) = env::var("REDIS_PASSWORD") {
        config = config.with_password(SecretString::new(password));
    }
    config
}

fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async {
        let mut subscriber = Subscriber::new(config_from_env(), |payload: Vec<u8>| {
            println!("{}", String::from_utf8_lossy(&payload));
        });
        let mut statuses = subscriber.status_channel();
        tokio::spawn(async move {
            while let Some(status) = statuses.recv().await {
                if let SubscriberStatus::RetryScheduled { attempt, delay } = status {
                    eprintln!("retry {attempt} in {delay:?}");
                }
            }
        });

        let cancel = CancellationToken::new();
        let on_ctrl_c = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                on_ctrl_c.cancel();
            }
        });

        subscriber.run(cancel).await?;
        Ok::<(), Box<dyn Error>>(())
    })
}
