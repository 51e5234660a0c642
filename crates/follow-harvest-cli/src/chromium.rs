//! Chromium-backed render surface using chromiumoxide.
//!
//! All page access goes through small scripts evaluated in the main world.
//! A bootstrap installs `window.__fharvest` once per document: fragment
//! token stamping, the scroll container probe, a mutation counter and a
//! fetch/XHR hook that buffers following-timeline responses. Two background
//! tasks poll the page: one turns the mutation counter into change
//! notifications, the other drains buffered payloads into a sink.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chromiumoxide::browser::{Browser, BrowserConfig};
use chromiumoxide::cdp::browser_protocol::page::AddScriptToEvaluateOnNewDocumentParams;
use chromiumoxide::page::Page;
use futures::StreamExt;
use serde::de::DeserializeOwned;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use follow_harvest::{ControlQuery, Fragment, PayloadSink, RenderSurface, ScrollMetrics};

const FRAME: Duration = Duration::from_millis(16);
const CHANGE_POLL: Duration = Duration::from_millis(100);
const PAYLOAD_POLL: Duration = Duration::from_millis(250);

const BOOTSTRAP: &str = r#"
if (!window.__fharvest) {
  window.__fharvest = (function () {
    const fh = { seq: 0, dirty: 0, observer: null, payloads: [] };
    const FOLLOWING_QUERY = /\/graphql\/[^/]+\/Following\b/;

    fh.container = function () {
      return document.querySelector('[aria-label^="Timeline: Following"]')
        || document.querySelector('section[aria-labelledby^="accessible-list"]')
        || document.querySelector('[data-testid="primaryColumn"]')
        || document.scrollingElement;
    };
    fh.scroller = function () {
      let n = fh.container();
      while (n && n !== document.body && n !== document.documentElement) {
        const oy = getComputedStyle(n).overflowY;
        if ((oy === 'auto' || oy === 'scroll') && n.scrollHeight > n.clientHeight) return n;
        n = n.parentElement;
      }
      return document.scrollingElement || document.documentElement;
    };
    fh.cells = function () {
      return Array.from(document.querySelectorAll('[data-testid="UserCell"]'));
    };
    fh.fragments = function () {
      return fh.cells().map(function (el) {
        const key = Array.from(el.querySelectorAll('a[href]'))
          .map(function (a) { return a.getAttribute('href'); }).join(' ');
        if (!el.dataset.fharvestToken || el.dataset.fharvestKey !== key) {
          el.dataset.fharvestToken = String(++fh.seq);
          el.dataset.fharvestKey = key;
        }
        return { token: Number(el.dataset.fharvestToken), html: el.outerHTML };
      });
    };
    fh.observe = function () {
      if (fh.observer) return;
      const c = fh.container();
      const target = (!c || c === document.scrollingElement) ? document.body : c;
      fh.observer = new MutationObserver(function () { fh.dirty++; });
      fh.observer.observe(target, { childList: true, subtree: true });
    };
    fh.unobserve = function () {
      if (fh.observer) { fh.observer.disconnect(); fh.observer = null; }
      fh.dirty = 0;
    };
    fh.takeDirty = function () { const n = fh.dirty; fh.dirty = 0; return n; };
    fh.activate = function (scope, selector, label) {
      const root = scope === null
        ? document
        : document.querySelector('[data-fharvest-token="' + scope + '"]');
      if (!root) return false;
      const re = label === null ? null : new RegExp(label, 'i');
      const el = Array.from(root.querySelectorAll(selector))
        .find(function (e) { return !re || re.test(e.textContent || ''); });
      if (!el) return false;
      el.click();
      return true;
    };

    const keep = function (url, text) {
      if (FOLLOWING_QUERY.test(url) && typeof text === 'string') fh.payloads.push(text);
    };
    const origFetch = window.fetch;
    if (origFetch) {
      window.fetch = function () {
        const p = origFetch.apply(this, arguments);
        p.then(function (r) {
          if (FOLLOWING_QUERY.test(r.url)) {
            r.clone().text().then(function (t) { keep(r.url, t); }).catch(function () {});
          }
        }).catch(function () {});
        return p;
      };
    }
    const origOpen = XMLHttpRequest.prototype.open;
    XMLHttpRequest.prototype.open = function (method, url) {
      this.addEventListener('load', function () {
        try { keep(String(url), this.responseText); } catch (e) {}
      });
      return origOpen.apply(this, arguments);
    };
    return fh;
  })();
}
"#;

/// Find the Chromium binary path.
pub fn find_chromium() -> Option<PathBuf> {
    // 1. FHARVEST_CHROMIUM_PATH env
    if let Ok(p) = std::env::var("FHARVEST_CHROMIUM_PATH") {
        let path = PathBuf::from(&p);
        if path.exists() {
            return Some(path);
        }
    }

    // 2. System PATH
    for name in ["google-chrome", "google-chrome-stable", "chromium", "chromium-browser"] {
        if let Ok(path) = which::which(name) {
            return Some(path);
        }
    }

    // 3. Common install locations
    let common: &[&str] = if cfg!(target_os = "macos") {
        &[
            "/Applications/Google Chrome.app/Contents/MacOS/Google Chrome",
            "/Applications/Chromium.app/Contents/MacOS/Chromium",
        ]
    } else if cfg!(target_os = "windows") {
        &[
            r"C:\Program Files\Google\Chrome\Application\chrome.exe",
            r"C:\Program Files (x86)\Google\Chrome\Application\chrome.exe",
        ]
    } else {
        &["/usr/bin/google-chrome", "/usr/bin/chromium", "/snap/bin/chromium"]
    };
    common.iter().map(PathBuf::from).find(|p| p.exists())
}

/// How to reach a browser.
#[derive(Debug, Clone, Default)]
pub struct BrowserOptions {
    /// DevTools websocket URL of a running browser. Launches one if unset.
    pub connect: Option<String>,
    pub chromium_path: Option<PathBuf>,
    /// Profile directory for a launched browser, so a login persists.
    pub user_data_dir: Option<PathBuf>,
    /// Navigate here after attaching.
    pub start_url: Option<String>,
}

/// A [`RenderSurface`] over one Chromium tab.
pub struct ChromiumSurface {
    _browser: Browser,
    page: Page,
    handler_task: JoinHandle<()>,
    watch_task: Mutex<Option<JoinHandle<()>>>,
    pump_task: Mutex<Option<JoinHandle<()>>>,
}

impl ChromiumSurface {
    /// Connect to or launch a browser and pick the tab to drive: an open
    /// following view if there is one, else the first tab, else a new one.
    pub async fn attach(opts: &BrowserOptions) -> Result<Self> {
        let (mut browser, mut handler) = match &opts.connect {
            Some(ws) => Browser::connect(ws.clone())
                .await
                .with_context(|| format!("failed to connect to {ws}"))?,
            None => {
                let chrome_path = opts
                    .chromium_path
                    .clone()
                    .or_else(find_chromium)
                    .context("Chromium not found. Set FHARVEST_CHROMIUM_PATH or pass --connect.")?;
                let mut builder = BrowserConfig::builder()
                    .chrome_executable(chrome_path)
                    .with_head()
                    .arg("--disable-blink-features=AutomationControlled")
                    .arg("--no-first-run");
                if let Some(dir) = &opts.user_data_dir {
                    std::fs::create_dir_all(dir)
                        .with_context(|| format!("failed to create {}", dir.display()))?;
                    builder = builder.user_data_dir(dir);
                }
                let config = builder
                    .build()
                    .map_err(|e| anyhow!("failed to build browser config: {e}"))?;
                Browser::launch(config)
                    .await
                    .context("failed to launch Chromium")?
            }
        };

        let handler_task = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                let _ = event;
            }
        });

        if let Err(e) = browser.fetch_targets().await {
            tracing::debug!("target discovery failed: {e}");
        }
        let page = match pick_page(&browser).await {
            Some(page) => page,
            None => browser
                .new_page("about:blank")
                .await
                .context("failed to create new page")?,
        };

        if let Err(e) = page
            .evaluate_on_new_document(AddScriptToEvaluateOnNewDocumentParams::new(BOOTSTRAP))
            .await
        {
            tracing::warn!("could not register bootstrap for new documents: {e}");
        }

        if let Some(url) = &opts.start_url {
            tracing::info!("navigating to {url}");
            page.goto(url.as_str())
                .await
                .with_context(|| format!("navigation to {url} failed"))?;
            let _ = page.wait_for_navigation().await;
        }

        Ok(Self {
            _browser: browser,
            page,
            handler_task,
            watch_task: Mutex::new(None),
            pump_task: Mutex::new(None),
        })
    }

    /// Forward intercepted following-timeline responses into `sink` until
    /// the receiver is dropped.
    pub fn forward_payloads(&self, sink: PayloadSink) {
        let page = self.page.clone();
        let task = tokio::spawn(async move {
            let mut tick = tokio::time::interval(PAYLOAD_POLL);
            loop {
                tick.tick().await;
                let bodies: Vec<String> = match eval(&page, "return fh.payloads.splice(0);").await {
                    Ok(bodies) => bodies,
                    Err(e) => {
                        tracing::trace!("payload poll failed: {e:#}");
                        continue;
                    }
                };
                for body in bodies {
                    if sink.send(body).is_err() {
                        return;
                    }
                }
            }
        });
        replace_task(&self.pump_task, Some(task));
    }

    async fn eval<T: DeserializeOwned>(&self, body: &str) -> Result<T> {
        eval(&self.page, body).await
    }
}

impl Drop for ChromiumSurface {
    fn drop(&mut self) {
        replace_task(&self.watch_task, None);
        replace_task(&self.pump_task, None);
        self.handler_task.abort();
    }
}

#[async_trait]
impl RenderSurface for ChromiumSurface {
    async fn current_path(&self) -> Result<String> {
        self.eval("return location.pathname;").await
    }

    async fn locate_scroller(&self) -> Result<bool> {
        self.eval("return !!fh.container();").await
    }

    async fn fragments(&self) -> Result<Vec<Fragment>> {
        self.eval("return fh.fragments();").await
    }

    async fn scroll_metrics(&self) -> Result<ScrollMetrics> {
        self.eval("const s = fh.scroller(); return { top: s.scrollTop, height: s.scrollHeight };")
            .await
    }

    async fn scroll_by(&self, px: f64, duration: Duration) -> Result<()> {
        let frames = (duration.as_millis() / FRAME.as_millis()).max(1) as u32;
        let per_frame = px / f64::from(frames);
        let script = format!("fh.scroller().scrollTop += {per_frame}; return true;");
        let mut tick = tokio::time::interval(FRAME);
        for _ in 0..frames {
            tick.tick().await;
            let _: bool = self.eval(&script).await?;
        }
        Ok(())
    }

    async fn reveal_last_fragment(&self) -> Result<()> {
        let _: bool = self
            .eval(
                "const c = fh.cells().pop(); \
                 if (c) c.scrollIntoView({ block: 'end' }); return !!c;",
            )
            .await?;
        Ok(())
    }

    async fn dispatch_wheel(&self, delta_y: f64) -> Result<()> {
        let script = format!(
            "fh.scroller().dispatchEvent(new WheelEvent('wheel', \
             {{ deltaY: {delta_y}, bubbles: true, cancelable: true }})); return true;"
        );
        let _: bool = self.eval(&script).await?;
        Ok(())
    }

    async fn dispatch_page_down(&self) -> Result<()> {
        let _: bool = self
            .eval(
                "const t = document.activeElement || document.body; \
                 for (const type of ['keydown', 'keyup']) { \
                   t.dispatchEvent(new KeyboardEvent(type, { key: 'PageDown', code: 'PageDown', \
                     keyCode: 34, which: 34, bubbles: true, cancelable: true })); \
                 } return true;",
            )
            .await?;
        Ok(())
    }

    async fn activate(&self, query: &ControlQuery) -> Result<bool> {
        let scope = query
            .scope
            .map(|t| t.0.to_string())
            .unwrap_or_else(|| "null".to_string());
        let selector = serde_json::to_string(&query.selector)?;
        let label = serde_json::to_string(&query.label)?;
        self.eval(&format!("return fh.activate({scope}, {selector}, {label});"))
            .await
    }

    async fn watch_changes(&self) -> Result<mpsc::UnboundedReceiver<()>> {
        let _: bool = self.eval("fh.observe(); return true;").await?;
        let (tx, rx) = mpsc::unbounded_channel();
        let page = self.page.clone();
        let task = tokio::spawn(async move {
            let mut tick = tokio::time::interval(CHANGE_POLL);
            loop {
                tick.tick().await;
                match eval::<u64>(&page, "return fh.takeDirty();").await {
                    Ok(0) => {}
                    Ok(_) => {
                        if tx.send(()).is_err() {
                            return;
                        }
                    }
                    Err(e) => tracing::trace!("change poll failed: {e:#}"),
                }
            }
        });
        replace_task(&self.watch_task, Some(task));
        Ok(rx)
    }

    async fn unwatch_changes(&self) -> Result<()> {
        replace_task(&self.watch_task, None);
        let _: bool = self.eval("fh.unobserve(); return true;").await?;
        Ok(())
    }
}

/// Evaluate `body` as a function of the bootstrapped helper object.
async fn eval<T: DeserializeOwned>(page: &Page, body: &str) -> Result<T> {
    let script = format!("{BOOTSTRAP}\n(function (fh) {{ {body} }})(window.__fharvest)");
    let result = page
        .evaluate(script.as_str())
        .await
        .context("JS execution failed")?;
    result
        .into_value()
        .map_err(|e| anyhow!("failed to convert JS result: {e:?}"))
}

/// Tab showing a following list, else the first tab.
async fn pick_page(browser: &Browser) -> Option<Page> {
    let pages = browser.pages().await.ok()?;
    let mut first = None;
    for page in pages {
        let url = page.url().await.ok().flatten().unwrap_or_default();
        if url.contains("/following") {
            return Some(page);
        }
        first.get_or_insert(page);
    }
    first
}

fn replace_task(slot: &Mutex<Option<JoinHandle<()>>>, next: Option<JoinHandle<()>>) {
    let mut guard = match slot.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    };
    if let Some(old) = guard.take() {
        old.abort();
    }
    *guard = next;
}
