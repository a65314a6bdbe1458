use anyhow::Result;
use async_trait::async_trait;
use serde_json::json;
use std::collections::BTreeSet;
use std::net::IpAddr;

use crate::executors::{Emitter, SkillContext, SkillHandler};

pub const ID: &str = "builtin/dns-resolve";

/// Resolves the target host and reports its addresses as an asset.
#[derive(Debug, Default, Clone, Copy)]
pub struct DnsResolve;

#[async_trait]
impl SkillHandler for DnsResolve {
    async fn run(&self, ctx: SkillContext, emit: Emitter) -> Result<()> {
        let host = ctx.target.host.clone();

        if host.contains('/') {
            emit.emit(json!({
                "type": "note",
                "evidence": format!("{} is a network range; nothing to resolve", host),
            }))
            .await?;
            return Ok(());
        }

        let addrs = match tokio::net::lookup_host((host.as_str(), 0)).await {
            Ok(addrs) => addrs,
            Err(e) => {
                tracing::debug!("Resolution of {} failed: {}", host, e);
                emit.emit(json!({
                    "type": "note",
                    "evidence": format!("{} did not resolve: {}", host, e),
                    "data": {"host": host},
                }))
                .await?;
                return Ok(());
            }
        };

        let mut v4 = BTreeSet::new();
        let mut v6 = BTreeSet::new();
        for addr in addrs {
            match addr.ip() {
                IpAddr::V4(ip) => v4.insert(ip.to_string()),
                IpAddr::V6(ip) => v6.insert(ip.to_string()),
            };
        }

        let hostnames: Vec<&str> = if host.parse::<IpAddr>().is_ok() {
            Vec::new()
        } else {
            vec![host.as_str()]
        };

        emit.emit(json!({
            "type": "asset",
            "target": ctx.target.normalized_target,
            "evidence": v4.iter().chain(v6.iter()).cloned().collect::<Vec<_>>(),
            "data": {
                "ip": v4,
                "ipv6": v6,
                "hostnames": hostnames,
            },
        }))
        .await?;
        Ok(())
    }
}
