//! JSON-over-TCP control server
//!
//! One request per line, one response per line. Malformed requests get an
//! error response on the same connection; handler errors never tear the
//! connection down.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use log::{info, warn};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};

use crate::config::ProgramFormat;
use crate::control::{API_VERSION, ChannelManager};
use crate::engine::PlayoutStatus;
use crate::stop::StopSignal;

#[derive(Debug, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Request {
    StartChannel {
        channel_id: String,
        #[serde(default)]
        plan_handle: Option<String>,
        port: u16,
        #[serde(default)]
        program_format: Option<ProgramFormat>,
    },
    LoadPreview {
        channel_id: String,
        asset_path: PathBuf,
        #[serde(default)]
        start_offset_ms: i64,
        hard_stop_time_ms: i64,
        target_boundary_time_ms: i64,
        planned_frame_count: u64,
    },
    SwitchToLive {
        channel_id: String,
    },
    UpdatePlan {
        channel_id: String,
        plan_handle: String,
    },
    StopChannel {
        channel_id: String,
    },
    GetVersion,
    GetStatus {
        channel_id: String,
    },
}

#[derive(Debug, Default, Serialize)]
pub struct Response {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub shadow_decode_started: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pts_contiguous: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub live_start_pts_us: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_version: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<PlayoutStatus>,
}

impl Response {
    fn ok() -> Self {
        Self {
            success: true,
            ..Default::default()
        }
    }

    fn error(message: impl std::fmt::Display) -> Self {
        Self {
            success: false,
            error_message: Some(message.to_string()),
            ..Default::default()
        }
    }
}

/// Dispatch one request against the manager.
pub fn handle(manager: &ChannelManager, request: Request) -> Response {
    match request {
        Request::StartChannel {
            channel_id,
            plan_handle,
            port,
            program_format,
        } => {
            let format = program_format.unwrap_or_default();
            match manager.start_channel(&channel_id, plan_handle, port, format) {
                Ok(()) => Response::ok(),
                Err(e) => Response::error(e),
            }
        }
        Request::LoadPreview {
            channel_id,
            asset_path,
            start_offset_ms,
            hard_stop_time_ms,
            target_boundary_time_ms,
            planned_frame_count,
        } => match manager.load_preview(
            &channel_id,
            asset_path,
            start_offset_ms,
            hard_stop_time_ms,
            target_boundary_time_ms,
            planned_frame_count,
        ) {
            Ok(outcome) => Response {
                success: true,
                shadow_decode_started: Some(outcome.shadow_decode_started),
                ..Default::default()
            },
            Err(e) => Response::error(e),
        },
        Request::SwitchToLive { channel_id } => match manager.switch_to_live(&channel_id) {
            Ok(outcome) => Response {
                success: true,
                pts_contiguous: Some(outcome.pts_contiguous),
                live_start_pts_us: Some(outcome.live_start_pts_us),
                ..Default::default()
            },
            Err(e) => Response::error(e),
        },
        Request::UpdatePlan {
            channel_id,
            plan_handle,
        } => match manager.update_plan(&channel_id, plan_handle) {
            Ok(()) => Response::ok(),
            Err(e) => Response::error(e),
        },
        Request::StopChannel { channel_id } => match manager.stop_channel(&channel_id) {
            Ok(()) => Response::ok(),
            Err(e) => Response::error(e),
        },
        Request::GetVersion => Response {
            success: true,
            api_version: Some(API_VERSION),
            ..Default::default()
        },
        Request::GetStatus { channel_id } => match manager.status(&channel_id) {
            Ok(status) => Response {
                success: true,
                status: Some(status),
                ..Default::default()
            },
            Err(e) => Response::error(e),
        },
    }
}

/// Accept control connections until the stop signal.
pub async fn serve(
    listener: TcpListener,
    manager: Arc<ChannelManager>,
    stop: StopSignal,
) -> Result<()> {
    info!("control: listening on {}", listener.local_addr()?);
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, addr) = accepted?;
                info!("control: connection from {}", addr);
                let manager = Arc::clone(&manager);
                stop.spawn(async move {
                    if let Err(e) = serve_connection(stream, manager).await {
                        warn!("control: connection error: {:#}", e);
                    }
                });
            }
            _ = stop.wait() => {
                info!("control: shutting down");
                return Ok(());
            }
        }
    }
}

async fn serve_connection(stream: TcpStream, manager: Arc<ChannelManager>) -> Result<()> {
    let (read_half, mut write_half) = stream.into_split();
    let mut lines = BufReader::new(read_half).lines();

    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let response = match serde_json::from_str::<Request>(&line) {
            Ok(request) => handle(&manager, request),
            Err(e) => Response::error(format!("invalid request: {}", e)),
        };
        let mut payload = serde_json::to_vec(&response)?;
        payload.push(b'\n');
        write_half.write_all(&payload).await?;
    }
    Ok(())
}
