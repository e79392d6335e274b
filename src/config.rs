use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;
use tracing::info;

#[derive(Debug, Clone, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub bind: BindConfig,
    #[serde(default)]
    pub dispatcher: DispatcherConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub ecs: EcsConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BindConfig {
    /// 监听地址，UDP 与 TCP 共用。缺省 127.0.0.1:5301。
    #[serde(default = "default_bind_addr")]
    pub addr: String,
}

impl Default for BindConfig {
    fn default() -> Self {
        Self {
            addr: default_bind_addr(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct DispatcherConfig {
    /// 最大并发查询数，0 表示使用内置缺省值。
    #[serde(default)]
    pub max_concurrent_queries: usize,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct ServerConfig {
    #[serde(default)]
    pub local: Option<LocalConfig>,
    #[serde(default)]
    pub remote: Option<RemoteConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LocalConfig {
    /// 本地上游地址，如 223.5.5.5:53。
    pub addr: String,
    #[serde(default)]
    pub protocol: Protocol,
    /// 拒绝非常规查询（非单问题 IN A/AAAA）。
    #[serde(default)]
    pub deny_unusual_types: bool,
    /// 拒绝不含 A/AAAA 记录的结果。
    #[serde(default)]
    pub deny_result_without_ip: bool,
    /// 对结果中的 CNAME 目标应用域名策略。
    #[serde(default)]
    pub check_cname: bool,
    /// IP 策略串，如 accept:chn.list|deny_all。
    #[serde(default)]
    pub ip_policies: String,
    /// 域名策略串，如 force:forced.list|accept:direct.list。
    #[serde(default)]
    pub domain_policies: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RemoteConfig {
    /// 远程上游地址，如 8.8.8.8:53。
    pub addr: String,
    #[serde(default)]
    pub protocol: Protocol,
    /// 远程查询延迟启动毫秒数，给本地上游让出先发窗口。
    #[serde(default)]
    pub delay_start_ms: u64,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct EcsConfig {
    /// 注入本地查询的 ECS 子网，ip/prefix 记法。
    #[serde(default)]
    pub local: Option<String>,
    /// 注入远程查询的 ECS 子网。
    #[serde(default)]
    pub remote: Option<String>,
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    #[default]
    Udp,
    Tcp,
}

fn default_bind_addr() -> String {
    "127.0.0.1:5301".to_string()
}

pub fn load_config(path: &Path) -> Result<Config> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("read config file: {}", path.display()))?;
    let cfg: Config = serde_json::from_str(&raw)
        .with_context(|| format!("parse config file: {}", path.display()))?;
    info!(path = %path.display(), "config loaded");
    Ok(cfg)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn minimal_config_fills_defaults() {
        let raw = json!({
            "server": { "remote": { "addr": "8.8.8.8:53" } }
        });
        let cfg: Config = serde_json::from_value(raw).expect("parse config");
        assert_eq!(cfg.bind.addr, "127.0.0.1:5301");
        assert_eq!(cfg.dispatcher.max_concurrent_queries, 0);
        assert!(cfg.server.local.is_none());
        let remote = cfg.server.remote.expect("remote");
        assert_eq!(remote.protocol, Protocol::Udp);
        assert_eq!(remote.delay_start_ms, 0);
        assert!(cfg.ecs.local.is_none());
    }

    #[test]
    fn full_config_parses_every_field() {
        let raw = json!({
            "bind": { "addr": "0.0.0.0:53" },
            "dispatcher": { "max_concurrent_queries": 300 },
            "server": {
                "local": {
                    "addr": "223.5.5.5:53",
                    "protocol": "udp",
                    "deny_unusual_types": true,
                    "deny_result_without_ip": true,
                    "check_cname": true,
                    "ip_policies": "accept:chn.list|deny_all",
                    "domain_policies": "force:forced.list"
                },
                "remote": {
                    "addr": "8.8.8.8:53",
                    "protocol": "tcp",
                    "delay_start_ms": 50
                }
            },
            "ecs": { "local": "1.2.4.0/24", "remote": "12.34.56.0/24" }
        });
        let cfg: Config = serde_json::from_value(raw).expect("parse config");
        assert_eq!(cfg.bind.addr, "0.0.0.0:53");
        assert_eq!(cfg.dispatcher.max_concurrent_queries, 300);
        let local = cfg.server.local.expect("local");
        assert!(local.deny_unusual_types);
        assert!(local.deny_result_without_ip);
        assert!(local.check_cname);
        assert_eq!(local.ip_policies, "accept:chn.list|deny_all");
        assert_eq!(local.domain_policies, "force:forced.list");
        let remote = cfg.server.remote.expect("remote");
        assert_eq!(remote.protocol, Protocol::Tcp);
        assert_eq!(remote.delay_start_ms, 50);
        assert_eq!(cfg.ecs.local.as_deref(), Some("1.2.4.0/24"));
        assert_eq!(cfg.ecs.remote.as_deref(), Some("12.34.56.0/24"));
    }

    #[test]
    fn unknown_protocol_is_rejected() {
        let raw = json!({
            "server": { "remote": { "addr": "8.8.8.8:53", "protocol": "doh" } }
        });
        assert!(serde_json::from_value::<Config>(raw).is_err());
    }

    #[test]
    fn local_section_requires_addr() {
        let raw = json!({
            "server": { "local": { "protocol": "udp" } }
        });
        assert!(serde_json::from_value::<Config>(raw).is_err());
    }
}
