//! Status command.

use crate::control::api::{CtrlClient, CtrlRequest, CtrlResponse};
use anyhow::{bail, Result};
use clap::Args;

/// Show node status over the control endpoint.
#[derive(Args, Debug)]
pub struct StatusArgs {
    /// Control endpoint to query.
    #[arg(long, default_value = "127.0.0.1:6623")]
    pub endpoint: String,

    /// Restrict output to one area.
    #[arg(long)]
    pub area: Option<String>,
}

/// Run the status command.
pub async fn run_status(args: StatusArgs) -> Result<()> {
    let mut client = CtrlClient::connect(&args.endpoint).await?;

    let areas = match client.call(&CtrlRequest::Areas).await? {
        CtrlResponse::Areas(areas) => areas,
        CtrlResponse::Error { kind, message } => bail!("{kind}: {message}"),
        other => bail!("unexpected response: {other:?}"),
    };
    let areas: Vec<String> = match args.area {
        Some(area) => areas.into_iter().filter(|a| *a == area).collect(),
        None => areas,
    };
    if areas.is_empty() {
        bail!("no matching areas");
    }

    for area in areas {
        println!("area {area}");

        match client
            .call(&CtrlRequest::PeerDump { area: area.clone() })
            .await?
        {
            CtrlResponse::Peers(peers) => {
                for peer in peers {
                    let addr = if peer.addr.is_empty() {
                        "(inbound)".to_string()
                    } else {
                        peer.addr
                    };
                    println!("  peer {:<24} {:<12} {}", peer.peer_id, peer.state, addr);
                }
            }
            CtrlResponse::Error { kind, message } => bail!("{kind}: {message}"),
            other => bail!("unexpected response: {other:?}"),
        }

        match client
            .call(&CtrlRequest::Counters { area: area.clone() })
            .await?
        {
            CtrlResponse::Counters(counters) => {
                println!(
                    "  updates: {} full, {} ttl; rejected: {} stale, {} bad-ttl, {} filtered",
                    counters.val_updates,
                    counters.ttl_updates,
                    counters.rejected_stale,
                    counters.rejected_bad_ttl,
                    counters.rejected_filtered,
                );
                println!(
                    "  floods: {} sent, {} suppressed; full-syncs: {} done, {} timed out; expired keys: {}",
                    counters.floods_sent,
                    counters.floods_suppressed,
                    counters.full_syncs_completed,
                    counters.full_sync_timeouts,
                    counters.expired_keys,
                );
            }
            CtrlResponse::Error { kind, message } => bail!("{kind}: {message}"),
            other => bail!("unexpected response: {other:?}"),
        }
    }
    Ok(())
}
