use clap::Parser;
use reqwest::Url;

use piw_master_core::MasterConfig;

fn default_pypi_root() -> Url {
    Url::parse("https://pypi.python.org/pypi").expect("default pypi root must be a valid URL")
}

#[derive(Debug, Clone, Parser)]
#[command(name = "piw-master", version, about = "piwheels build coordinator")]
pub struct Cli {
    /// Root URL of the upstream package index to poll.
    #[arg(long, env = "PIW_PYPI_ROOT", default_value_t = default_pypi_root())]
    pub pypi_root: Url,

    /// Postgres connection string.
    #[arg(long, env = "PIW_DSN", default_value = "postgres:///piwheels")]
    pub dsn: String,

    /// Root of the output (served) wheel tree.
    #[arg(long, env = "PIW_OUTPUT", default_value = "~/www")]
    pub output: std::path::PathBuf,

    /// Bind address for the worker (build dispatch) socket.
    #[arg(long, env = "PIW_WORKER_BIND", default_value_t = MasterConfig::DEFAULT_WORKER_BIND.to_string())]
    pub worker_bind: String,

    /// Bind address for the file (artifact transfer) socket.
    #[arg(long, env = "PIW_FILE_BIND", default_value_t = MasterConfig::DEFAULT_FILE_BIND.to_string())]
    pub file_bind: String,

    /// Bind address for the control socket.
    #[arg(long, env = "PIW_CONTROL_BIND", default_value_t = MasterConfig::DEFAULT_CONTROL_BIND.to_string())]
    pub control_bind: String,

    /// Bind address for the external status publish socket.
    #[arg(long, env = "PIW_STATUS_BIND", default_value_t = MasterConfig::DEFAULT_STATUS_BIND.to_string())]
    pub status_bind: String,

    /// Log level / `tracing-subscriber` filter directive.
    #[arg(long, env = "RUST_LOG", default_value = "info")]
    pub log_level: String,
}

impl Cli {
    /// Expand a leading `~/` in `--output` against `$HOME`, matching shell
    /// tilde expansion since clap does not do this for us.
    pub fn expand_output(&self) -> std::path::PathBuf {
        let path = &self.output;
        if let Ok(rest) = path.strip_prefix("~") {
            if let Some(home) = std::env::var_os("HOME") {
                return std::path::PathBuf::from(home).join(rest);
            }
        }
        path.clone()
    }
}
