pub mod cli;
pub mod logging;
pub mod proxy;
pub mod settings;
pub mod util;

use std::sync::Arc;

use anyhow::Result;
use tracing::info;

use crate::proxy::{AppContext, recorder::Recorder};
use crate::settings::Settings;

pub async fn run(settings: Settings) -> Result<()> {
    let settings = Arc::new(settings);

    let recorder = if settings.pass_through {
        info!("pass-through mode enabled; responses will not be recorded or replayed");
        None
    } else {
        let recorder = Recorder::open(settings.cache_dir.clone()).await?;
        info!(cache_dir = %settings.cache_dir.display(), "recording responses");
        Some(Arc::new(recorder))
    };

    let app = AppContext::new(settings, recorder);
    proxy::run(app).await
}
