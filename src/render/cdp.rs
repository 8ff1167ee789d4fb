//! Headless Chromium driven over the DevTools protocol.
//!
//! The browser is started with `--remote-debugging-port=0`; the websocket
//! address is read from its stderr. All page work goes through one flattened
//! target session: navigate, wait for `Page.loadEventFired`, inject the
//! e-ink stylesheet, then `Page.captureScreenshot` on demand.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::TcpStream;
use tokio::process::{Child, ChildStderr, Command};
use tokio::time::timeout;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use uuid::Uuid;

use crate::error::RenderError;

use super::{BrowserLauncher, BrowserProcess};

const ENABLE_LOGS: bool = true;

use crate::{log_debug, log_warn};

const DEVTOOLS_BANNER: &str = "DevTools listening on ";
const MAX_QUEUED_EVENTS: usize = 64;

/// Flags tuned for a Pi Zero 2 W class board.
pub const CHROME_ARGS: &[&str] = &[
    "--headless=new",
    "--disable-gpu",
    "--no-sandbox",
    "--disable-dev-shm-usage",
    "--disable-extensions",
    "--disable-plugins",
    "--disable-background-networking",
    "--disable-renderer-backgrounding",
    "--disable-background-timer-throttling",
    "--disable-features=Translate,BackForwardCache,AcceptCHFrame,MediaRouter,OptimizationHints,PaintHolding",
    "--hide-scrollbars",
    "--mute-audio",
    "--no-first-run",
    "--no-default-browser-check",
    "--disable-software-rasterizer",
    "--disk-cache-size=0",
    "--memory-pressure-off",
];

/// Animations cause tearing between frames; media never renders on e-ink.
const EINK_PAGE_SCRIPT: &str = r#"(() => {
  const style = document.createElement('style');
  style.textContent = `
    * { animation: none !important; transition: none !important;
        animation-duration: 0s !important; transition-duration: 0s !important; }
    video, audio { display: none !important; }
  `;
  document.head.appendChild(style);
  window.scrollTo(0, 0);
  document.body.style.zoom = '100%';
  return true;
})()"#;

/// Candidate clock readings, most specific first.
const CLOCK_TEXT_SCRIPT: &str = r#"(() => {
  const texts = [];
  for (const selector of ['.time', '.clock']) {
    for (const el of document.querySelectorAll(selector)) {
      const text = (el.textContent || '').trim();
      if (text) texts.push(text);
    }
  }
  if (document.body) texts.push(document.body.innerText || '');
  return texts;
})()"#;

#[derive(Debug, Clone)]
pub struct ChromiumLauncher {
    pub browser_bin: String,
    pub width: u32,
    pub height: u32,
    /// Reused profile directory; a throwaway one is created per launch when unset.
    pub profile_dir: Option<PathBuf>,
    /// Parent of throwaway profiles.
    pub scratch_dir: PathBuf,
    /// Budget for the DevTools handshake through the first page load.
    pub startup_timeout: Duration,
}

impl ChromiumLauncher {
    pub fn new(browser_bin: impl Into<String>, width: u32, height: u32) -> Self {
        Self {
            browser_bin: browser_bin.into(),
            width,
            height,
            profile_dir: None,
            scratch_dir: std::env::temp_dir(),
            startup_timeout: Duration::from_secs(30),
        }
    }

    pub fn with_profile_dir(mut self, dir: PathBuf) -> Self {
        self.profile_dir = Some(dir);
        self
    }

    pub fn with_scratch_dir(mut self, dir: PathBuf) -> Self {
        self.scratch_dir = dir;
        self
    }

    pub fn with_startup_timeout(mut self, startup_timeout: Duration) -> Self {
        self.startup_timeout = startup_timeout;
        self
    }

    /// Everything between spawn and a loaded, styled page.
    async fn handshake(&self, stderr: ChildStderr, url: &str) -> Result<(CdpClient, String), RenderError> {
        let ws_url = wait_for_devtools(stderr).await?;
        log_debug!("devtools endpoint {ws_url}");

        let (ws, _) = connect_async(ws_url.as_str())
            .await
            .map_err(|err| RenderError::Protocol(format!("connect: {err}")))?;
        let mut client = CdpClient::new(ws);

        let session_id = client.attach_page().await?;
        client
            .call(
                "Emulation.setDeviceMetricsOverride",
                json!({
                    "width": self.width,
                    "height": self.height,
                    "deviceScaleFactor": 1,
                    "mobile": false,
                }),
                Some(&session_id),
            )
            .await?;
        client.call("Page.enable", json!({}), Some(&session_id)).await?;

        let navigation = client
            .call("Page.navigate", json!({ "url": url }), Some(&session_id))
            .await?;
        if let Some(error) = navigation.get("errorText").and_then(Value::as_str) {
            return Err(RenderError::Launch(format!("navigation to {url} failed: {error}")));
        }
        client
            .wait_event("Page.loadEventFired", Some(&session_id))
            .await?;

        if let Err(err) = client
            .call(
                "Runtime.evaluate",
                json!({ "expression": EINK_PAGE_SCRIPT }),
                Some(&session_id),
            )
            .await
        {
            log_warn!("failed to optimise page for e-ink: {err}");
        }
        Ok((client, session_id))
    }
}

#[async_trait]
impl BrowserLauncher for ChromiumLauncher {
    async fn launch(&self, url: &str) -> Result<Box<dyn BrowserProcess>, RenderError> {
        let (profile_dir, throwaway) = match &self.profile_dir {
            Some(dir) => (dir.clone(), false),
            None => (
                self.scratch_dir
                    .join(format!("pi-dashboard-chromium-{}", Uuid::new_v4())),
                true,
            ),
        };
        std::fs::create_dir_all(&profile_dir)
            .map_err(|err| RenderError::Launch(format!("profile dir: {err}")))?;
        let scratch_profile = throwaway.then_some(profile_dir.clone());

        let spawned = Command::new(&self.browser_bin)
            .args(CHROME_ARGS)
            .arg("--remote-debugging-port=0")
            .arg(format!("--window-size={},{}", self.width, self.height))
            .arg(format!("--user-data-dir={}", profile_dir.display()))
            .arg("about:blank")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn();
        let mut child = match spawned {
            Ok(child) => child,
            Err(err) => {
                if let Some(dir) = scratch_profile {
                    let _ = tokio::fs::remove_dir_all(dir).await;
                }
                return Err(RenderError::Launch(format!("{}: {err}", self.browser_bin)));
            }
        };

        let stderr = child.stderr.take();
        let mut guard = LaunchGuard {
            child: Some(child),
            scratch_profile,
        };
        let handshake = match stderr {
            Some(stderr) => timeout(self.startup_timeout, self.handshake(stderr, url)).await,
            None => Ok(Err(RenderError::Launch("stderr not captured".into()))),
        };
        let failure = match handshake {
            Ok(Ok((client, session_id))) => match guard.child.take() {
                Some(child) => {
                    return Ok(Box::new(ChromiumProcess {
                        child,
                        client,
                        session_id,
                        profile_dir: guard.scratch_profile.take(),
                    }))
                }
                None => RenderError::ProcessCrashed("browser handle released early".into()),
            },
            Ok(Err(err)) => err,
            Err(_) => RenderError::StartupTimeout(self.startup_timeout),
        };
        log_warn!("browser launch abandoned: {failure}");
        guard.kill().await;
        Err(failure)
    }
}

/// Owns a browser until its handshake succeeds. A launch that fails is
/// killed and reaped in place; one whose future is dropped part way is
/// killed immediately and reaped in the background.
struct LaunchGuard {
    child: Option<Child>,
    scratch_profile: Option<PathBuf>,
}

impl LaunchGuard {
    async fn kill(&mut self) {
        if let Some(child) = self.child.as_mut() {
            if let Err(err) = child.kill().await {
                log_warn!("failed to kill browser: {err}");
            }
        }
        self.child = None;
        if let Some(dir) = self.scratch_profile.take() {
            let _ = tokio::fs::remove_dir_all(dir).await;
        }
    }
}

impl Drop for LaunchGuard {
    fn drop(&mut self) {
        let child = self.child.take();
        let profile = self.scratch_profile.take();
        if child.is_none() && profile.is_none() {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        runtime.spawn(async move {
            if let Some(mut child) = child {
                let _ = child.kill().await;
            }
            if let Some(dir) = profile {
                let _ = tokio::fs::remove_dir_all(dir).await;
            }
        });
    }
}

pub struct ChromiumProcess {
    child: Child,
    client: CdpClient,
    session_id: String,
    profile_dir: Option<PathBuf>,
}

#[async_trait]
impl BrowserProcess for ChromiumProcess {
    fn pid(&self) -> Option<u32> {
        self.child.id()
    }

    async fn screenshot(&mut self) -> Result<Vec<u8>, RenderError> {
        if let Ok(Some(status)) = self.child.try_wait() {
            return Err(RenderError::ProcessCrashed(format!("browser exited with {status}")));
        }

        let result = self
            .client
            .call(
                "Page.captureScreenshot",
                json!({ "format": "png", "fromSurface": true }),
                Some(&self.session_id),
            )
            .await?;
        let data = result
            .get("data")
            .and_then(Value::as_str)
            .ok_or_else(|| RenderError::Protocol("screenshot without data".into()))?;
        STANDARD
            .decode(data)
            .map_err(|err| RenderError::Decode(err.to_string()))
    }

    async fn clock_text(&mut self) -> Result<Vec<String>, RenderError> {
        let result = self
            .client
            .call(
                "Runtime.evaluate",
                json!({ "expression": CLOCK_TEXT_SCRIPT, "returnByValue": true }),
                Some(&self.session_id),
            )
            .await?;
        if let Some(details) = result.get("exceptionDetails") {
            return Err(RenderError::Protocol(format!("clock text script: {details}")));
        }
        Ok(evaluated_strings(&result))
    }

    async fn terminate(&mut self) {
        let _ = self.client.ws.close(None).await;
        if let Err(err) = self.child.kill().await {
            log_warn!("failed to kill browser: {err}");
        }
        if let Some(dir) = self.profile_dir.take() {
            let _ = tokio::fs::remove_dir_all(dir).await;
        }
    }
}

/// Read stderr until Chromium prints its websocket address, then keep
/// draining it in the background so the pipe never fills up.
async fn wait_for_devtools(stderr: ChildStderr) -> Result<String, RenderError> {
    let mut lines = BufReader::new(stderr).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                if let Some(url) = devtools_url(&line) {
                    let url = url.to_string();
                    tokio::spawn(async move {
                        while let Ok(Some(line)) = lines.next_line().await {
                            log::trace!("chromium: {line}");
                        }
                    });
                    return Ok(url);
                }
            }
            Ok(None) => {
                return Err(RenderError::Launch(
                    "browser exited before DevTools became available".into(),
                ))
            }
            Err(err) => return Err(RenderError::Launch(err.to_string())),
        }
    }
}

fn devtools_url(line: &str) -> Option<&str> {
    let start = line.find(DEVTOOLS_BANNER)? + DEVTOOLS_BANNER.len();
    let url = line[start..].trim();
    url.starts_with("ws://").then_some(url)
}

/// String items of a `returnByValue` array result.
fn evaluated_strings(result: &Value) -> Vec<String> {
    result
        .pointer("/result/value")
        .and_then(Value::as_array)
        .map(|values| {
            values
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

fn command_frame(id: u64, method: &str, params: Value, session_id: Option<&str>) -> Value {
    let mut frame = json!({ "id": id, "method": method, "params": params });
    if let Some(session_id) = session_id {
        frame["sessionId"] = Value::String(session_id.to_string());
    }
    frame
}

type DevtoolsSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

struct CdpClient {
    ws: DevtoolsSocket,
    next_id: u64,
    events: VecDeque<Value>,
}

impl CdpClient {
    fn new(ws: DevtoolsSocket) -> Self {
        Self {
            ws,
            next_id: 1,
            events: VecDeque::new(),
        }
    }

    async fn attach_page(&mut self) -> Result<String, RenderError> {
        let targets = self.call("Target.getTargets", json!({}), None).await?;
        let existing = targets
            .get("targetInfos")
            .and_then(Value::as_array)
            .and_then(|infos| {
                infos
                    .iter()
                    .find(|info| info.get("type").and_then(Value::as_str) == Some("page"))
            })
            .and_then(|info| info.get("targetId"))
            .and_then(Value::as_str)
            .map(str::to_string);

        let target_id = match existing {
            Some(id) => id,
            None => self
                .call("Target.createTarget", json!({ "url": "about:blank" }), None)
                .await?
                .get("targetId")
                .and_then(Value::as_str)
                .map(str::to_string)
                .ok_or_else(|| RenderError::Protocol("createTarget without targetId".into()))?,
        };

        self.call(
            "Target.attachToTarget",
            json!({ "targetId": target_id, "flatten": true }),
            None,
        )
        .await?
        .get("sessionId")
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| RenderError::Protocol("attachToTarget without sessionId".into()))
    }

    async fn call(
        &mut self,
        method: &str,
        params: Value,
        session_id: Option<&str>,
    ) -> Result<Value, RenderError> {
        let id = self.next_id;
        self.next_id += 1;

        let frame = command_frame(id, method, params, session_id);
        self.ws
            .send(Message::Text(frame.to_string()))
            .await
            .map_err(|err| RenderError::ProcessCrashed(format!("devtools send: {err}")))?;

        loop {
            let message = self.next_message().await?;
            if message.get("id").and_then(Value::as_u64) == Some(id) {
                if let Some(error) = message.get("error") {
                    return Err(RenderError::Protocol(format!("{method}: {error}")));
                }
                return Ok(message.get("result").cloned().unwrap_or(Value::Null));
            }
            // Late replies to abandoned calls are dropped; events are kept.
            if message.get("method").is_some() {
                self.queue_event(message);
            }
        }
    }

    async fn wait_event(
        &mut self,
        method: &str,
        session_id: Option<&str>,
    ) -> Result<Value, RenderError> {
        let matches = |event: &Value| {
            event.get("method").and_then(Value::as_str) == Some(method)
                && event.get("sessionId").and_then(Value::as_str) == session_id
        };

        if let Some(pos) = self.events.iter().position(|event| matches(event)) {
            return Ok(self.events.remove(pos).unwrap_or(Value::Null));
        }
        loop {
            let message = self.next_message().await?;
            if matches(&message) {
                return Ok(message);
            }
            if message.get("method").is_some() {
                self.queue_event(message);
            }
        }
    }

    fn queue_event(&mut self, event: Value) {
        if self.events.len() >= MAX_QUEUED_EVENTS {
            self.events.pop_front();
        }
        self.events.push_back(event);
    }

    async fn next_message(&mut self) -> Result<Value, RenderError> {
        loop {
            match self.ws.next().await {
                Some(Ok(Message::Text(text))) => {
                    return serde_json::from_str(&text)
                        .map_err(|err| RenderError::Protocol(err.to_string()));
                }
                Some(Ok(Message::Close(_))) | None => {
                    return Err(RenderError::ProcessCrashed(
                        "devtools connection closed".into(),
                    ))
                }
                Some(Ok(_)) => continue,
                Some(Err(err)) => return Err(RenderError::ProcessCrashed(err.to_string())),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_devtools_url_is_parsed_from_banner() {
        let line = "DevTools listening on ws://127.0.0.1:38041/devtools/browser/4c1e-aa";
        assert_eq!(
            devtools_url(line),
            Some("ws://127.0.0.1:38041/devtools/browser/4c1e-aa")
        );
        assert_eq!(devtools_url("[0101/000000.000:ERROR:gpu] nothing"), None);
        assert_eq!(devtools_url("DevTools listening on http://nope"), None);
    }

    #[test]
    fn test_command_frame_carries_session() {
        let frame = command_frame(7, "Page.navigate", json!({ "url": "about:blank" }), Some("S1"));
        assert_eq!(frame["id"], 7);
        assert_eq!(frame["method"], "Page.navigate");
        assert_eq!(frame["sessionId"], "S1");

        let browser_level = command_frame(8, "Target.getTargets", json!({}), None);
        assert!(browser_level.get("sessionId").is_none());
    }

    #[cfg(target_os = "linux")]
    fn fake_chromium(dir: &std::path::Path, body: &str) -> String {
        use std::os::unix::fs::PermissionsExt;
        let path = dir.join("fake-chromium.sh");
        std::fs::write(&path, format!("#!/bin/sh\necho $$ > {}\n{body}\n", dir.join("browser.pid").display()))
            .unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path.display().to_string()
    }

    #[cfg(target_os = "linux")]
    async fn failed_launch(launcher: &ChromiumLauncher) -> RenderError {
        match launcher.launch("about:blank").await {
            Ok(_) => panic!("launch should have failed"),
            Err(err) => err,
        }
    }

    #[cfg(target_os = "linux")]
    fn assert_reaped(dir: &std::path::Path, scratch: &std::path::Path) {
        let pid = std::fs::read_to_string(dir.join("browser.pid")).unwrap();
        assert!(!std::path::Path::new("/proc").join(pid.trim()).exists());
        assert_eq!(std::fs::read_dir(scratch).unwrap().count(), 0);
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_silent_browser_is_reaped_after_startup_timeout() {
        let dir = tempfile::TempDir::new().unwrap();
        let scratch = dir.path().join("scratch");
        std::fs::create_dir(&scratch).unwrap();
        let launcher = ChromiumLauncher::new(fake_chromium(dir.path(), "exec sleep 30"), 16, 8)
            .with_scratch_dir(scratch.clone())
            .with_startup_timeout(Duration::from_millis(300));

        let err = failed_launch(&launcher).await;
        assert_eq!(err, RenderError::StartupTimeout(Duration::from_millis(300)));
        assert_reaped(dir.path(), &scratch);
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_unreachable_devtools_is_reaped() {
        let dir = tempfile::TempDir::new().unwrap();
        let scratch = dir.path().join("scratch");
        std::fs::create_dir(&scratch).unwrap();
        let body = "echo 'DevTools listening on ws://127.0.0.1:1/devtools/browser/gone' >&2\nexec sleep 30";
        let launcher = ChromiumLauncher::new(fake_chromium(dir.path(), body), 16, 8)
            .with_scratch_dir(scratch.clone())
            .with_startup_timeout(Duration::from_secs(10));

        let err = failed_launch(&launcher).await;
        assert_eq!(err.kind(), "protocol");
        assert_reaped(dir.path(), &scratch);
    }

    #[test]
    fn test_evaluated_strings_reads_array_value() {
        let result = json!({ "result": { "type": "object", "value": ["9:41 AM", 3, "Mon"] } });
        assert_eq!(evaluated_strings(&result), vec!["9:41 AM", "Mon"]);
        assert!(evaluated_strings(&json!({ "result": { "type": "undefined" } })).is_empty());
    }

    #[test]
    fn test_default_flags_are_headless() {
        assert!(CHROME_ARGS.contains(&"--headless=new"));
        assert!(CHROME_ARGS.contains(&"--disable-dev-shm-usage"));
    }
}
