//! # Environment Configuration
//!
//! Runtime options are taken from the process environment at context
//! initialisation, using the variable names the route manager ecosystem
//! expects. Everything has a sensible default; nothing here is required.
//!
//! | Variable | Effect |
//! |----------|--------|
//! | `RMR_BIND_IF` | interface/IP to bind the listen socket (default 0.0.0.0) |
//! | `RMR_RTG_SVC` | `host:port` of the route manager; a bare integer < 1 selects static-file mode |
//! | `RMR_SEED_RT` | path of a seed route table, polled every 60 s in static mode |
//! | `RMR_SRC_ID` | overrides the source identity written into headers |
//! | `RMR_SRC_NAMEONLY` | "1" omits the IP from outgoing identity fields |
//! | `RMR_VCTL_FILE` | file holding a single integer verbosity level |
//! | `RMR_WARNINGS` | "1" enables non-fatal send-path warnings |
//! | `RMR_CTL_PORT` | port for the collector's private context |
//! | `RMR_RTREQ_FREQ` | seconds between route table requests |

use std::env;
use std::path::PathBuf;

pub(crate) const ENV_BIND_IF: &str = "RMR_BIND_IF";
pub(crate) const ENV_RTG_SVC: &str = "RMR_RTG_SVC";
pub(crate) const ENV_SEED_RT: &str = "RMR_SEED_RT";
pub(crate) const ENV_SRC_ID: &str = "RMR_SRC_ID";
pub(crate) const ENV_NAME_ONLY: &str = "RMR_SRC_NAMEONLY";
pub(crate) const ENV_VCTL_FILE: &str = "RMR_VCTL_FILE";
pub(crate) const ENV_WARNINGS: &str = "RMR_WARNINGS";
pub(crate) const ENV_CTL_PORT: &str = "RMR_CTL_PORT";
// The environment list in the original carried a misspelled RMR_RTREQ_FREA
// alongside this one; only the correctly spelled name is honoured here.
pub(crate) const ENV_RTREQ_FREQ: &str = "RMR_RTREQ_FREQ";

/// Default application listen port.
pub const DEF_COMM_PORT: u16 = 4560;
/// Default port for the collector's private context.
pub const DEF_CTL_PORT: u16 = 4561;
/// Default route manager target in dynamic mode.
pub const DEF_RTG_SVC: &str = "routemgr:4561";
/// Default seconds between table requests to the route manager.
pub const DEF_RTREQ_FREQ: u64 = 60;
/// Seconds between static seed-file polls.
pub const STATIC_POLL_SECS: u64 = 60;

/// Resolved configuration snapshot taken at `Context::init` time.
#[derive(Debug, Clone)]
pub(crate) struct Config {
    pub bind_if: String,
    pub port: u16,
    /// Route manager `host:port`; `None` selects static-file mode.
    pub rtg_svc: Option<String>,
    pub seed_rt: Option<PathBuf>,
    pub src_id: Option<String>,
    pub name_only: bool,
    pub warnings: bool,
    pub vctl_file: Option<PathBuf>,
    pub ctl_port: u16,
    pub rtreq_freq: u64,
}

impl Config {
    pub(crate) fn from_env(port: Option<u16>) -> Config {
        let rtg_svc = match env::var(ENV_RTG_SVC) {
            Ok(v) => {
                // a bare integer < 1 turns the dynamic collector off
                match v.trim().parse::<i64>() {
                    Ok(n) if n < 1 => None,
                    Ok(n) => Some(format!("routemgr:{}", n)),
                    Err(_) => Some(v),
                }
            }
            Err(_) => Some(DEF_RTG_SVC.to_string()),
        };

        Config {
            bind_if: env::var(ENV_BIND_IF).unwrap_or_else(|_| "0.0.0.0".to_string()),
            port: port.unwrap_or(DEF_COMM_PORT),
            rtg_svc,
            seed_rt: env::var(ENV_SEED_RT).ok().map(PathBuf::from),
            src_id: env::var(ENV_SRC_ID).ok(),
            name_only: flag_set(ENV_NAME_ONLY),
            warnings: flag_set(ENV_WARNINGS),
            vctl_file: env::var(ENV_VCTL_FILE).ok().map(PathBuf::from),
            ctl_port: env::var(ENV_CTL_PORT)
                .ok()
                .and_then(|v| v.trim().parse().ok())
                .unwrap_or(DEF_CTL_PORT),
            rtreq_freq: env::var(ENV_RTREQ_FREQ)
                .ok()
                .and_then(|v| v.trim().parse().ok())
                .unwrap_or(DEF_RTREQ_FREQ),
        }
    }
}

fn flag_set(name: &str) -> bool {
    matches!(env::var(name), Ok(v) if v.trim() == "1")
}
