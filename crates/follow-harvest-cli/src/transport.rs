//! Stdio transport: reads requests from stdin, writes responses and events
//! to stdout.
//!
//! `ping` and `ingest_payload` are answered from the reader loop so they
//! stay responsive during a crawl. Loads and batches are queued to a single
//! worker that owns the harvester and runs them in arrival order.

use anyhow::Result;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::{broadcast, mpsc};

use follow_harvest::{is_following_view, FollowingHarvester, MemberIdentity, PayloadSink, RenderSurface};

use crate::protocol::{
    self, format_error, format_event, format_response, IngestParams, LoadParams, Method,
    UnfollowParams, E_INVALID_PARAMS, E_INVALID_REQUEST,
};

const PING_TIMEOUT: Duration = Duration::from_secs(2);

enum Job {
    Load { id: String, params: LoadParams },
    Unfollow { id: String, identities: Vec<MemberIdentity> },
}

pub struct StdioTransport {
    harvester: FollowingHarvester,
    surface: Arc<dyn RenderSurface>,
}

impl StdioTransport {
    /// `surface` must be the one `harvester` drives; it is probed directly
    /// for `ping`.
    pub fn new(harvester: FollowingHarvester, surface: Arc<dyn RenderSurface>) -> Self {
        Self { harvester, surface }
    }

    /// Run the transport loop over the process's stdin and stdout.
    pub async fn run(self) -> Result<()> {
        let reader = BufReader::new(tokio::io::stdin());
        self.serve(reader, tokio::io::stdout()).await?;
        Ok(())
    }

    /// Serve until `reader` reaches EOF and queued work has drained. Returns
    /// the writer.
    pub async fn serve<R, W>(self, mut reader: R, writer: W) -> Result<W>
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let Self { harvester, surface } = self;
        let (out_tx, out_rx) = mpsc::unbounded_channel::<String>();
        let payloads = harvester.payload_sink();

        let writer_task = tokio::spawn(write_lines(writer, out_rx));
        let events_task = tokio::spawn(forward_events(harvester.subscribe(), out_tx.clone()));
        let (job_tx, job_rx) = mpsc::unbounded_channel::<Job>();
        let worker = tokio::spawn(run_jobs(harvester, job_rx, out_tx.clone()));

        tracing::info!("Stdio transport started");
        let mut line = String::new();
        loop {
            line.clear();
            if reader.read_line(&mut line).await? == 0 {
                tracing::info!("EOF on stdin, shutting down");
                break;
            }
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            if let Some(reply) = dispatch(trimmed, surface.as_ref(), &payloads, &job_tx).await {
                let _ = out_tx.send(reply);
            }
        }

        drop(job_tx);
        drop(out_tx);
        worker.await?;
        events_task.await?;
        let writer = writer_task.await??;
        Ok(writer)
    }
}

/// Answer a line immediately, or queue it and return `None`.
async fn dispatch(
    line: &str,
    surface: &dyn RenderSurface,
    payloads: &PayloadSink,
    jobs: &mpsc::UnboundedSender<Job>,
) -> Option<String> {
    let req = match protocol::parse_request(line) {
        Ok(req) => req,
        Err(e) => {
            tracing::warn!("Parse error: {e}");
            return Some(format_error(
                &protocol::request_id(line),
                E_INVALID_REQUEST,
                &e.to_string(),
            ));
        }
    };

    match req.method {
        Method::Ping => {
            let following = match tokio::time::timeout(PING_TIMEOUT, surface.current_path()).await {
                Ok(Ok(path)) => is_following_view(&path),
                _ => false,
            };
            Some(format_response(&req.id, json!({ "ok": true, "following": following })))
        }
        Method::IngestPayload => match protocol::params::<IngestParams>(&req) {
            Ok(p) => {
                let _ = payloads.send(p.text);
                Some(format_response(&req.id, json!({})))
            }
            Err(e) => Some(format_error(&req.id, E_INVALID_PARAMS, &e.to_string())),
        },
        Method::LoadFollowing => match protocol::params::<LoadParams>(&req) {
            Ok(params) => {
                let _ = jobs.send(Job::Load { id: req.id, params });
                None
            }
            Err(e) => Some(format_error(&req.id, E_INVALID_PARAMS, &e.to_string())),
        },
        Method::UnfollowUsers => match protocol::params::<UnfollowParams>(&req) {
            Ok(p) => {
                let _ = jobs.send(Job::Unfollow {
                    id: req.id,
                    identities: p.identities,
                });
                None
            }
            Err(e) => Some(format_error(&req.id, E_INVALID_PARAMS, &e.to_string())),
        },
    }
}

async fn run_jobs(
    mut harvester: FollowingHarvester,
    mut jobs: mpsc::UnboundedReceiver<Job>,
    out: mpsc::UnboundedSender<String>,
) {
    while let Some(job) = jobs.recv().await {
        let reply = match job {
            Job::Load { id, params } => {
                match harvester.load_following(params.limit, params.resume).await {
                    Ok(records) => format_response(&id, json!(records)),
                    Err(e) => {
                        tracing::warn!("load_following failed: {e}");
                        format_error(&id, e.code(), &e.to_string())
                    }
                }
            }
            Job::Unfollow { id, identities } => {
                let outcome = harvester.unfollow_users(&identities).await;
                format_response(&id, json!(outcome))
            }
        };
        if out.send(reply).is_err() {
            break;
        }
    }
}

async fn forward_events(
    mut events: broadcast::Receiver<follow_harvest::HarvestEvent>,
    out: mpsc::UnboundedSender<String>,
) {
    loop {
        match events.recv().await {
            Ok(event) => {
                if out.send(format_event(&event)).is_err() {
                    break;
                }
            }
            Err(broadcast::error::RecvError::Lagged(n)) => {
                tracing::warn!("event forwarder lagged, {n} events dropped");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

async fn write_lines<W>(mut writer: W, mut lines: mpsc::UnboundedReceiver<String>) -> Result<W>
where
    W: AsyncWrite + Unpin,
{
    while let Some(line) = lines.recv().await {
        writer.write_all(line.as_bytes()).await?;
        writer.flush().await?;
    }
    Ok(writer)
}
