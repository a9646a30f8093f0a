pub mod codec;
pub mod listener;
pub mod pipeline;
pub mod recorder;
pub mod upstream;

use std::sync::Arc;

use anyhow::Result;

use crate::settings::Settings;
use recorder::Recorder;

/// Shared state handed to every connection task. The recorder is `None` in
/// pass-through mode, which disables both replay and recording while leaving
/// forwarding untouched.
#[derive(Clone)]
pub struct AppContext {
    pub settings: Arc<Settings>,
    pub recorder: Option<Arc<Recorder>>,
}

impl AppContext {
    pub fn new(settings: Arc<Settings>, recorder: Option<Arc<Recorder>>) -> Self {
        Self { settings, recorder }
    }
}

pub async fn run(app: AppContext) -> Result<()> {
    listener::start_listener(app).await
}
