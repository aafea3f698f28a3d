use std::sync::Arc;

use radar_core::{Settings, SettingsPatch};
use radar_storage::{Repository, TokenBucket};
use tokio::sync::{watch, Mutex};
use tracing::info;

use crate::EngineError;

/// Explicitly shared runtime settings. Consumers snapshot with [`current`]
/// and never see a value change underneath them.
///
/// [`current`]: SettingsHandle::current
#[derive(Clone)]
pub struct SettingsHandle {
    repo: Arc<dyn Repository>,
    tx: Arc<watch::Sender<Settings>>,
    limiter: Arc<TokenBucket>,
    write_lock: Arc<Mutex<()>>,
}

impl SettingsHandle {
    /// Loads stored settings, persisting defaults on first start.
    pub async fn load(repo: Arc<dyn Repository>) -> Result<Self, EngineError> {
        let settings = match repo.load_settings().await? {
            Some(stored) => {
                stored.validate()?;
                stored
            }
            None => {
                let defaults = Settings::default();
                repo.save_settings(&defaults).await?;
                defaults
            }
        };
        Ok(Self::with_settings(repo, settings))
    }

    pub fn with_settings(repo: Arc<dyn Repository>, settings: Settings) -> Self {
        let (tx, _rx) = watch::channel(settings);
        Self {
            repo,
            tx: Arc::new(tx),
            limiter: Arc::new(TokenBucket::new(settings.rate_limit_per_sec)),
            write_lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn current(&self) -> Settings {
        *self.tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<Settings> {
        self.tx.subscribe()
    }

    /// Global outbound limiter, shared by every run in the process.
    pub fn limiter(&self) -> Arc<TokenBucket> {
        Arc::clone(&self.limiter)
    }

    /// Validates, persists, then publishes.
    pub async fn update(&self, patch: SettingsPatch) -> Result<Settings, EngineError> {
        let _guard = self.write_lock.lock().await;
        let next = patch.apply(self.current())?;
        self.repo.save_settings(&next).await?;
        self.limiter.set_rate(next.rate_limit_per_sec).await;
        self.tx.send_replace(next);
        info!(
            rate_limit_per_sec = next.rate_limit_per_sec,
            retry_times = next.retry_times,
            timeout_seconds = next.timeout_seconds,
            alert_consecutive_failures = next.alert_consecutive_failures,
            "settings updated"
        );
        Ok(next)
    }
}
