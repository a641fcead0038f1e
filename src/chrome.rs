//! Chromium engine over the DevTools protocol (`headless_chrome`).

use std::ffi::OsStr;
use std::fmt::Display;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use headless_chrome::protocol::cdp::Page;
use headless_chrome::types::PrintToPdfOptions;
use headless_chrome::{Browser, LaunchOptions, Tab};

use crate::engine::{
    Engine, EngineProcess, LaunchSpec, PrintParams, Surface, SurfaceError, SurfaceErrorKind,
};

// The DevTools connection is dropped after this much inactivity. Pooled
// sessions sit idle between reports, so keep it long.
const IDLE_BROWSER_TIMEOUT: Duration = Duration::from_secs(24 * 60 * 60);

const WAIT_FOR_LOAD_JS: &str = r#"new Promise(resolve => {
    if (document.readyState === 'complete') { resolve(true); return; }
    window.addEventListener('load', () => resolve(true), { once: true });
})"#;

// `LaunchOptions::sandbox(false)` adds these itself.
const SANDBOX_SWITCHES: [&str; 2] = ["--no-sandbox", "--disable-setuid-sandbox"];

/// Launches headless Chromium processes.
#[derive(Debug, Clone, Copy, Default)]
pub struct ChromeEngine;

impl Engine for ChromeEngine {
    fn name(&self) -> &str {
        "chromium"
    }

    fn launch(&self, spec: &LaunchSpec) -> Result<Box<dyn EngineProcess>, String> {
        let options = LaunchOptions::default_builder()
            .headless(true)
            .sandbox(spec.sandbox)
            .path(spec.executable.clone())
            .args(extra_args(spec))
            .idle_browser_timeout(IDLE_BROWSER_TIMEOUT)
            .build()
            .map_err(|e| format!("invalid launch options: {e}"))?;

        let browser = Browser::new(options).map_err(|e| e.to_string())?;
        let pid = browser.get_process_id();
        log::info!(
            "launched chromium (pid {}) from {}",
            pid.map_or_else(|| "?".to_string(), |p| p.to_string()),
            spec.executable
                .as_ref()
                .map_or_else(|| "system path".to_string(), |p| p.display().to_string())
        );

        Ok(Box::new(ChromeProcess {
            browser: Mutex::new(Some(browser)),
            pid,
            call_timeout: spec.call_timeout,
        }))
    }
}

/// Configured switches, minus the ones the sandbox setting owns.
fn extra_args(spec: &LaunchSpec) -> Vec<&OsStr> {
    spec.args
        .iter()
        .map(String::as_str)
        .filter(|arg| !SANDBOX_SWITCHES.contains(arg))
        .map(OsStr::new)
        .collect()
}

/// A running Chromium. Dropping the last `Browser` handle kills the process.
struct ChromeProcess {
    browser: Mutex<Option<Browser>>,
    pid: Option<u32>,
    call_timeout: Duration,
}

impl ChromeProcess {
    fn browser(&self) -> Option<Browser> {
        self.browser
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl EngineProcess for ChromeProcess {
    fn open_surface(&self) -> Result<Arc<dyn Surface>, SurfaceError> {
        let browser = self.browser().ok_or_else(|| {
            SurfaceError::new(SurfaceErrorKind::Disconnected, "browser has been terminated")
        })?;
        let tab = browser.new_tab().map_err(classify)?;
        tab.set_default_timeout(self.call_timeout);
        Ok(Arc::new(ChromeSurface {
            tab,
            closed: AtomicBool::new(false),
        }))
    }

    fn process_id(&self) -> Option<u32> {
        self.pid
    }

    fn is_alive(&self) -> bool {
        self.browser().is_some_and(|b| b.get_version().is_ok())
    }

    fn terminate(&self) {
        let browser = self
            .browser
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if browser.is_some() {
            log::debug!("terminating chromium (pid {:?})", self.pid);
        }
        drop(browser);
    }
}

struct ChromeSurface {
    tab: Arc<Tab>,
    closed: AtomicBool,
}

impl ChromeSurface {
    fn ensure_open(&self) -> Result<(), SurfaceError> {
        if self.closed.load(Ordering::SeqCst) {
            Err(SurfaceError::closed())
        } else {
            Ok(())
        }
    }

    // A call that fails because the page was closed underneath it reports
    // `Closed`, whatever the transport said.
    fn failure(&self, err: impl Display) -> SurfaceError {
        if self.closed.load(Ordering::SeqCst) {
            SurfaceError::closed()
        } else {
            classify(err)
        }
    }
}

impl Surface for ChromeSurface {
    fn set_content(&self, html: &str) -> Result<(), SurfaceError> {
        self.ensure_open()?;
        self.tab
            .call_method(Page::SetDocumentContent {
                frame_id: self.tab.get_target_id().clone(),
                html: html.to_string(),
            })
            .map_err(|e| self.failure(e))?;
        self.tab
            .evaluate(WAIT_FOR_LOAD_JS, true)
            .map_err(|e| self.failure(e))?;
        Ok(())
    }

    fn wait_for_fonts(&self, timeout: Duration) -> Result<(), SurfaceError> {
        self.ensure_open()?;
        let script = format!(
            "Promise.race([document.fonts.ready.then(() => 'loaded'), \
             new Promise(r => setTimeout(() => r('timeout'), {}))])",
            timeout.as_millis()
        );
        let result = self
            .tab
            .evaluate(&script, true)
            .map_err(|e| self.failure(e))?;
        match result.value.as_ref().and_then(|v| v.as_str()) {
            Some("loaded") => Ok(()),
            Some("timeout") => Err(SurfaceError::new(
                SurfaceErrorKind::Timeout,
                format!("fonts not ready after {timeout:?}"),
            )),
            other => Err(SurfaceError::new(
                SurfaceErrorKind::Other,
                format!("unexpected font readiness result: {other:?}"),
            )),
        }
    }

    fn print_pdf(&self, params: &PrintParams) -> Result<Vec<u8>, SurfaceError> {
        self.ensure_open()?;
        let [top, right, bottom, left] = params.margins;
        let options = PrintToPdfOptions {
            landscape: Some(params.landscape),
            display_header_footer: Some(params.display_header_footer),
            print_background: Some(params.print_background),
            paper_width: Some(params.paper_width),
            paper_height: Some(params.paper_height),
            margin_top: Some(top),
            margin_right: Some(right),
            margin_bottom: Some(bottom),
            margin_left: Some(left),
            header_template: params.header_template.clone(),
            footer_template: params.footer_template.clone(),
            ..Default::default()
        };
        self.tab
            .print_to_pdf(Some(options))
            .map_err(|e| self.failure(e))
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Err(e) = self.tab.close(false) {
            log::debug!("closing tab: {e}");
        }
    }
}

/// Map a DevTools error message onto a [`SurfaceErrorKind`].
pub(crate) fn classify(err: impl Display) -> SurfaceError {
    let message = err.to_string();
    let lower = message.to_ascii_lowercase();
    let kind = if lower.contains("timed out") || lower.contains("timeout") || lower.contains("never came") {
        SurfaceErrorKind::Timeout
    } else if lower.contains("connection is closed")
        || lower.contains("disconnected")
        || lower.contains("crashed")
        || lower.contains("no such process")
    {
        SurfaceErrorKind::Disconnected
    } else if lower.contains("target closed") || lower.contains("no target with given id") {
        SurfaceErrorKind::Closed
    } else {
        SurfaceErrorKind::Other
    };
    SurfaceError { kind, message }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_transport_messages() {
        assert_eq!(
            classify("The event waited for never came").kind,
            SurfaceErrorKind::Timeout
        );
        assert_eq!(
            classify("Unable to make method calls because underlying connection is closed").kind,
            SurfaceErrorKind::Disconnected
        );
        assert_eq!(classify("No target with given id found").kind, SurfaceErrorKind::Closed);
        assert_eq!(classify("Printing failed").kind, SurfaceErrorKind::Other);
    }

    #[test]
    fn sandbox_switches_left_to_launch_options() {
        let spec = LaunchSpec {
            args: vec![
                "--no-sandbox".into(),
                "--font-render-hinting=none".into(),
                "--disable-setuid-sandbox".into(),
            ],
            ..LaunchSpec::default()
        };
        assert_eq!(extra_args(&spec), [OsStr::new("--font-render-hinting=none")]);
        assert!(extra_args(&LaunchSpec::default()).is_empty());
    }
}
