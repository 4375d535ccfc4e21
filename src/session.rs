//! Import session: owns the HTTP agent and the set of active downloads.
//!
//! Each pulled URL runs on its own worker thread; workers post exactly one
//! terminal event into the session's mailbox. `run` drains the mailbox; the
//! first terminal event fires the completion hook (or ends the loop when no
//! hook is installed), later events only retire their workers.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use anyhow::{Context, Result};

use crate::download::Download;
use crate::error::ImportError;
use crate::{http_url_is_valid, validate_machine_name};

/// Completion hook: invoked once, at the first terminal event, with the URL
/// and its result.
pub type OnFinished = Box<dyn FnMut(&str, &Result<()>) + Send>;

struct Completion {
    url: String,
    result: Result<()>,
}

struct Worker {
    cancelled: Arc<AtomicBool>,
    thread: JoinHandle<()>,
}

pub struct ImportSession {
    image_root: PathBuf,
    agent: ureq::Agent,
    downloads: HashMap<String, Worker>,
    events_tx: Sender<Completion>,
    events_rx: Receiver<Completion>,
    on_finished: Option<OnFinished>,
    finished: bool,
    verbose: bool,
}

impl ImportSession {
    pub fn new(image_root: PathBuf, verbose: bool) -> Result<Self> {
        let (events_tx, events_rx) = mpsc::channel();
        Ok(Self {
            image_root,
            agent: build_http_agent(verbose)?,
            downloads: HashMap::new(),
            events_tx,
            events_rx,
            on_finished: None,
            finished: false,
            verbose,
        })
    }

    /// Install the completion hook. Without one, `run` ends at the first
    /// terminal event and returns its result.
    pub fn on_finished(&mut self, hook: OnFinished) {
        self.on_finished = Some(hook);
    }

    /// Start downloading `url`. With `local` set, a writable copy named
    /// `<local>.raw` is produced on success; `force_local` replaces an
    /// existing one.
    pub fn pull(&mut self, url: &str, local: Option<&str>, force_local: bool) -> Result<()> {
        if !http_url_is_valid(url) {
            return Err(ImportError::InvalidUrl(url.to_string()).into());
        }
        if let Some(local) = local {
            validate_machine_name(local)
                .map_err(|e| ImportError::InvalidMachineName(format!("{local}: {e}")))?;
        }
        if self.downloads.contains_key(url) {
            return Err(ImportError::AlreadyExists(url.to_string()).into());
        }

        let cancelled = Arc::new(AtomicBool::new(false));
        let download = Download::new(
            url.to_string(),
            local.map(str::to_string),
            force_local,
            self.image_root.clone(),
            self.verbose,
            Arc::clone(&cancelled),
        );

        let agent = self.agent.clone();
        let tx = self.events_tx.clone();
        let event_url = url.to_string();
        let thread = thread::Builder::new()
            .name("imgpull-download".to_string())
            .spawn(move || {
                let mut download = download;
                let result = download.run(&agent);
                // The temp file must be gone before the completion is
                // observable.
                drop(download);
                let _ = tx.send(Completion {
                    url: event_url,
                    result,
                });
            })
            .context("failed to spawn download thread")?;

        self.downloads.insert(url.to_string(), Worker { cancelled, thread });
        Ok(())
    }

    /// Stop downloading `url`. Returns whether a download was removed. The
    /// worker is joined, so no completion event for it outlives this call.
    pub fn cancel(&mut self, url: &str) -> bool {
        let Some(worker) = self.downloads.remove(url) else {
            return false;
        };
        worker.cancelled.store(true, Ordering::Relaxed);
        let _ = worker.thread.join();
        true
    }

    /// Drive the session until its downloads are done.
    ///
    /// The first terminal event fires the completion hook if one is
    /// installed; without one, `run` returns that event's result right away,
    /// the way an event loop exits with a code. Events for cancelled
    /// downloads are dropped.
    pub fn run(&mut self) -> Result<()> {
        while !self.downloads.is_empty() {
            let event = self
                .events_rx
                .recv()
                .context("download workers vanished")?;

            let Some(worker) = self.downloads.remove(&event.url) else {
                // Cancelled after posting its event.
                continue;
            };
            let _ = worker.thread.join();

            if !self.finished {
                self.finished = true;
                match self.on_finished.take() {
                    Some(mut hook) => hook(&event.url, &event.result),
                    None => return event.result,
                }
            }
        }
        Ok(())
    }
}

impl Drop for ImportSession {
    fn drop(&mut self) {
        let urls: Vec<String> = self.downloads.keys().cloned().collect();
        for url in urls {
            self.cancel(&url);
        }
    }
}

/// Resolve the proxy URI from the environment.
///
/// Checks (in order): `https_proxy`, `HTTPS_PROXY`, `http_proxy`,
/// `HTTP_PROXY`, `all_proxy`, `ALL_PROXY`. First non-empty value wins.
fn proxy_from_env() -> Option<String> {
    for var in [
        "https_proxy",
        "HTTPS_PROXY",
        "http_proxy",
        "HTTP_PROXY",
        "all_proxy",
        "ALL_PROXY",
    ] {
        if let Ok(val) = std::env::var(var) {
            if !val.is_empty() {
                return Some(val);
            }
        }
    }
    None
}

/// Build a ureq agent, configuring proxy from the environment if available.
/// Status codes are handed back untranslated so the download can treat 304
/// and the 2xx range itself.
fn build_http_agent(verbose: bool) -> Result<ureq::Agent> {
    let mut config = ureq::Agent::config_builder().http_status_as_error(false);
    if let Some(proxy_uri) = proxy_from_env() {
        if verbose {
            eprintln!("using proxy: {proxy_uri}");
        }
        let proxy = ureq::Proxy::new(&proxy_uri)
            .with_context(|| format!("invalid proxy URI: {proxy_uri}"))?;
        config = config.proxy(Some(proxy));
    }
    Ok(config.build().into())
}
