//! In-memory browser engine for deterministic tests.
//!
//! [`FakeEngine`] is `Clone`; every clone shares one call log, so a test can
//! hand one clone to the harness and inspect another.

use crate::browser::{BrowserEngine, BrowserError, BrowsingContext, Page};
use async_trait::async_trait;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Recorded engine activity.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EngineLog {
    pub launches: usize,
    pub closes: usize,
    pub contexts_opened: usize,
    pub contexts_closed: usize,
    pub pages_opened: usize,
    pub pages_closed: usize,
    pub screenshots: usize,
    /// Every URL passed to `goto`, in order.
    pub navigations: Vec<String>,
}

impl EngineLog {
    /// Contexts opened but not yet closed.
    pub fn open_contexts(&self) -> usize {
        self.contexts_opened - self.contexts_closed
    }
}

#[derive(Debug, Default)]
struct FakeState {
    log: EngineLog,
    running: bool,
    fail_launch: bool,
    fail_page_open: bool,
    fail_context_close: bool,
    hang_screenshot: bool,
}

/// Scriptable [`BrowserEngine`] that never touches a real browser.
#[derive(Debug, Clone, Default)]
pub struct FakeEngine {
    state: Arc<Mutex<FakeState>>,
}

/// Bytes returned by fake screenshots (PNG signature only).
pub const FAKE_PNG: &[u8] = &[0x89, b'P', b'N', b'G', 0x0d, 0x0a, 0x1a, 0x0a];

impl FakeEngine {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Makes `launch` fail.
    pub fn failing_launch(self) -> Self {
        self.state().fail_launch = true;
        self
    }

    /// Makes every `open_page` fail after the context is created.
    pub fn failing_page_open(self) -> Self {
        self.state().fail_page_open = true;
        self
    }

    /// Makes every context `close` report an error (the context still counts as closed).
    pub fn failing_context_close(self) -> Self {
        self.state().fail_context_close = true;
        self
    }

    /// Makes every `screenshot_png` wait forever without answering.
    pub fn hanging_screenshot(self) -> Self {
        self.state().hang_screenshot = true;
        self
    }

    /// Snapshot of the call log.
    pub fn log(&self) -> EngineLog {
        self.state().log.clone()
    }

    pub fn is_running(&self) -> bool {
        self.state().running
    }
}

#[async_trait]
impl BrowserEngine for FakeEngine {
    async fn launch(&mut self) -> Result<(), BrowserError> {
        let mut state = self.state();
        if state.fail_launch {
            return Err(BrowserError::Launch("fake engine refused to launch".to_string()));
        }
        state.log.launches += 1;
        state.running = true;
        Ok(())
    }

    async fn new_context(&self) -> Result<Box<dyn BrowsingContext>, BrowserError> {
        let mut state = self.state();
        if !state.running {
            return Err(BrowserError::NotRunning);
        }
        state.log.contexts_opened += 1;
        Ok(Box::new(FakeContext {
            engine: self.clone(),
            open: true,
        }))
    }

    async fn close(&mut self) -> Result<(), BrowserError> {
        let mut state = self.state();
        if state.running {
            state.log.closes += 1;
        }
        state.running = false;
        Ok(())
    }
}

struct FakeContext {
    engine: FakeEngine,
    open: bool,
}

#[async_trait]
impl BrowsingContext for FakeContext {
    async fn open_page(&mut self) -> Result<Box<dyn Page>, BrowserError> {
        let mut state = self.engine.state();
        if state.fail_page_open {
            return Err(BrowserError::Page("fake page refused to open".to_string()));
        }
        state.log.pages_opened += 1;
        Ok(Box::new(FakePage {
            engine: self.engine.clone(),
            url: Mutex::new("about:blank".to_string()),
            open: true,
        }))
    }

    async fn close(&mut self) -> Result<(), BrowserError> {
        if !self.open {
            return Ok(());
        }
        self.open = false;
        let mut state = self.engine.state();
        state.log.contexts_closed += 1;
        if state.fail_context_close {
            return Err(BrowserError::Close {
                what: "browsing context",
                message: "fake close failure".to_string(),
            });
        }
        Ok(())
    }
}

struct FakePage {
    engine: FakeEngine,
    url: Mutex<String>,
    open: bool,
}

#[async_trait]
impl Page for FakePage {
    async fn goto(&self, url: &str) -> Result<(), BrowserError> {
        self.engine.state().log.navigations.push(url.to_string());
        *self.url.lock().unwrap_or_else(PoisonError::into_inner) = url.to_string();
        Ok(())
    }

    async fn current_url(&self) -> Result<String, BrowserError> {
        Ok(self
            .url
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone())
    }

    async fn screenshot_png(&self) -> Result<Vec<u8>, BrowserError> {
        let hang = {
            let mut state = self.engine.state();
            state.log.screenshots += 1;
            state.hang_screenshot
        };
        if hang {
            std::future::pending::<()>().await;
        }
        Ok(FAKE_PNG.to_vec())
    }

    async fn close(&mut self) -> Result<(), BrowserError> {
        if self.open {
            self.open = false;
            self.engine.state().log.pages_closed += 1;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_fake_engine_tracks_lifecycle() {
        let mut engine = FakeEngine::new();
        let observer = engine.clone();
        engine.launch().await.unwrap();

        let mut context = engine.new_context().await.unwrap();
        let mut page = context.open_page().await.unwrap();
        page.goto("http://localhost:3000/").await.unwrap();
        assert_eq!(page.current_url().await.unwrap(), "http://localhost:3000/");
        assert_eq!(observer.log().open_contexts(), 1);

        page.close().await.unwrap();
        context.close().await.unwrap();
        context.close().await.unwrap();
        engine.close().await.unwrap();

        let log = observer.log();
        assert_eq!(log.contexts_closed, 1);
        assert_eq!(log.pages_closed, 1);
        assert_eq!(log.navigations, vec!["http://localhost:3000/".to_string()]);
        assert!(!observer.is_running());
    }

    #[tokio::test]
    async fn test_context_requires_running_engine() {
        let engine = FakeEngine::new();
        assert!(matches!(
            engine.new_context().await.err(),
            Some(BrowserError::NotRunning)
        ));
    }
}
