//! Chromium-backed execution contexts.
//!
//! Each pooled session gets its own headless Chromium, launched with a
//! dedicated `user_data_dir` so cookies and storage never cross sessions.

use chromiumoxide::browser::{Browser, BrowserConfig};
use chromiumoxide::Page;
use futures_util::StreamExt;
use std::path::Path;
use tokio::sync::Mutex;
use tracing::warn;
use webscout_core::{ContextFactory, Error, ExecutionContext, Result};

pub struct BrowserContext {
    // Held only for the brief CDP calls that need `&mut Browser`
    // (new target, close); page work itself never touches this lock.
    browser: Mutex<Browser>,
    handler: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl BrowserContext {
    pub async fn launch(storage_dir: &Path) -> Result<Self> {
        let config = BrowserConfig::builder()
            .user_data_dir(storage_dir)
            .no_sandbox()
            .build()
            .map_err(Error::Browser)?;
        let (browser, mut handler) = Browser::launch(config)
            .await
            .map_err(|e| Error::Browser(format!("launching chromium: {e}")))?;

        // Drive CDP events until the connection goes away.
        let task = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if event.is_err() {
                    break;
                }
            }
        });

        Ok(Self {
            browser: Mutex::new(browser),
            handler: Mutex::new(Some(task)),
        })
    }

    /// Open a fresh page in this context. The caller owns the page and closes
    /// it when done.
    pub async fn new_page(&self) -> Result<Page> {
        self.browser
            .lock()
            .await
            .new_page("about:blank")
            .await
            .map_err(|e| Error::Browser(format!("opening page: {e}")))
    }
}

#[async_trait::async_trait]
impl ExecutionContext for BrowserContext {
    async fn close(&self) -> Result<()> {
        let mut browser = self.browser.lock().await;
        let closed = browser.close().await;
        if let Err(e) = browser.wait().await {
            warn!(error = %e, "waiting for chromium exit");
        }
        if let Some(task) = self.handler.lock().await.take() {
            task.abort();
        }
        closed
            .map(|_| ())
            .map_err(|e| Error::Browser(format!("closing chromium: {e}")))
    }
}

pub struct ChromiumFactory;

#[async_trait::async_trait]
impl ContextFactory for ChromiumFactory {
    type Ctx = BrowserContext;

    async fn create(&self, storage_dir: &Path) -> Result<BrowserContext> {
        BrowserContext::launch(storage_dir).await
    }
}
