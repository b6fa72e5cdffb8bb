use std::{net::SocketAddr, path::PathBuf, time::Duration};

use anyhow::{bail, Context, Result};
use clap::Parser;

use crate::multiplexer::BufferPolicy;
use crate::process::LaunchContract;

pub const DEFAULT_LISTEN_ADDR: &str = "0.0.0.0:42424";
pub const DEFAULT_ORIGIN: &str = "http://juergen-sauermann.de";
pub const DEFAULT_FRAME_BUFFER: usize = 64;
pub const DEFAULT_STDIN_BUFFER_BYTES: usize = 1 << 20;

#[derive(Debug, Parser)]
#[command(
    name = "apl-relay",
    author,
    version,
    about = "Relay WebSocket clients to sandboxed GNU APL workers"
)]
pub struct Cli {
    /// Address to bind the websocket listener to.
    #[arg(long, env = "APL_RELAY_LISTEN_ADDR", default_value = DEFAULT_LISTEN_ADDR)]
    pub listen_addr: String,

    /// Optional address for the Prometheus `/metrics` and `/healthz` listener.
    #[arg(long, env = "APL_RELAY_METRICS_ADDR")]
    pub metrics_addr: Option<String>,

    /// Origins allowed to open a session (repeat or comma separate).
    #[arg(
        long = "allowed-origin",
        env = "APL_RELAY_ALLOWED_ORIGINS",
        value_delimiter = ',',
        default_value = DEFAULT_ORIGIN
    )]
    pub allowed_origins: Vec<String>,

    /// Interpreter binary launched for every connection.
    #[arg(long, env = "APL_RELAY_WORKER_BIN", default_value = "/usr/local/bin/apl")]
    pub worker_bin: PathBuf,

    /// Directory the interpreter chroots into.
    #[arg(long, env = "APL_RELAY_CHROOT", default_value = "/home/www-data/apl-chroot")]
    pub chroot: PathBuf,

    /// Effective user id the interpreter drops to.
    #[arg(long, env = "APL_RELAY_UID", default_value_t = 33)]
    pub uid: u32,

    /// CPU time limit per worker, in seconds.
    #[arg(long, env = "APL_RELAY_CPU_LIMIT_SECS", default_value_t = 5)]
    pub cpu_limit_secs: u32,

    /// Print precision handed to the interpreter.
    #[arg(long, env = "APL_RELAY_PRINT_PRECISION", default_value_t = 2)]
    pub print_precision: u32,

    /// Print width handed to the interpreter.
    #[arg(long, env = "APL_RELAY_PRINT_WIDTH", default_value_t = 300)]
    pub print_width: u32,

    /// Line written to the worker's stdin to ask it to exit.
    #[arg(long, env = "APL_RELAY_SHUTDOWN_DIRECTIVE", default_value = ")OFF")]
    pub shutdown_directive: String,

    /// Time the worker gets to honour the shutdown directive.
    #[arg(long, env = "APL_RELAY_DIRECTIVE_GRACE_MS", default_value_t = 500)]
    pub directive_grace_ms: u64,

    /// Time the worker gets between SIGHUP and SIGKILL.
    #[arg(long, env = "APL_RELAY_SIGNAL_GRACE_MS", default_value_t = 1000)]
    pub signal_grace_ms: u64,

    /// Upper bound on waiting for a killed worker to be reaped.
    #[arg(long, env = "APL_RELAY_KILL_GRACE_MS", default_value_t = 2000)]
    pub kill_grace_ms: u64,

    /// How worker output is cut into websocket frames.
    #[arg(long, env = "APL_RELAY_BUFFER_POLICY", value_enum, default_value_t = BufferPolicy::Passthrough)]
    pub buffer_policy: BufferPolicy,

    /// Outbound frames queued per connection before the worker pipes are back-pressured.
    #[arg(long, env = "APL_RELAY_FRAME_BUFFER", default_value_t = DEFAULT_FRAME_BUFFER)]
    pub frame_buffer: usize,

    /// Peer input held for a worker that is not reading before the session is closed.
    #[arg(long, env = "APL_RELAY_STDIN_BUFFER_BYTES", default_value_t = DEFAULT_STDIN_BUFFER_BYTES)]
    pub stdin_buffer_bytes: usize,

    /// Time live sessions get to tear down when the server stops.
    #[arg(long, env = "APL_RELAY_SHUTDOWN_GRACE_SECS", default_value_t = 5)]
    pub shutdown_grace_secs: u64,
}

/// Sandbox parameters passed to every worker. Not negotiated per connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SandboxConfig {
    pub worker_bin: PathBuf,
    pub chroot: PathBuf,
    pub uid: u32,
    pub cpu_limit_secs: u32,
    pub print_precision: u32,
    pub print_width: u32,
}

impl SandboxConfig {
    pub fn launch_contract(&self) -> LaunchContract {
        let args = vec![
            "-C".to_string(),
            self.chroot.display().to_string(),
            "-u".to_string(),
            self.uid.to_string(),
            "--safe".to_string(),
            "--noSV".to_string(),
            "--noCONT".to_string(),
            "--OFF".to_string(),
            "--rawCIN".to_string(),
            "--CPU_limit_secs".to_string(),
            self.cpu_limit_secs.to_string(),
            "-p".to_string(),
            self.print_precision.to_string(),
            "-w".to_string(),
            self.print_width.to_string(),
        ];
        LaunchContract::new(self.worker_bin.clone(), args)
    }
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            worker_bin: PathBuf::from("/usr/local/bin/apl"),
            chroot: PathBuf::from("/home/www-data/apl-chroot"),
            uid: 33,
            cpu_limit_secs: 5,
            print_precision: 2,
            print_width: 300,
        }
    }
}

/// Escalation timings for tearing a worker down.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShutdownPolicy {
    pub directive: String,
    pub directive_grace: Duration,
    pub signal_grace: Duration,
    pub kill_grace: Duration,
}

impl Default for ShutdownPolicy {
    fn default() -> Self {
        Self {
            directive: ")OFF".to_string(),
            directive_grace: Duration::from_millis(500),
            signal_grace: Duration::from_millis(1000),
            kill_grace: Duration::from_millis(2000),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub launch: LaunchContract,
    pub shutdown: ShutdownPolicy,
    pub buffer_policy: BufferPolicy,
    pub frame_buffer: usize,
    pub stdin_buffer_bytes: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            launch: SandboxConfig::default().launch_contract(),
            shutdown: ShutdownPolicy::default(),
            buffer_policy: BufferPolicy::Passthrough,
            frame_buffer: DEFAULT_FRAME_BUFFER,
            stdin_buffer_bytes: DEFAULT_STDIN_BUFFER_BYTES,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub listen_addr: SocketAddr,
    pub metrics_addr: Option<SocketAddr>,
    pub allowed_origins: Vec<String>,
    pub session: SessionConfig,
    pub shutdown_grace: Duration,
}

impl TryFrom<Cli> for RelayConfig {
    type Error = anyhow::Error;

    fn try_from(cli: Cli) -> Result<Self, Self::Error> {
        let listen_addr: SocketAddr = cli
            .listen_addr
            .parse()
            .with_context(|| format!("invalid listen address: {}", cli.listen_addr))?;
        let metrics_addr = cli
            .metrics_addr
            .as_deref()
            .map(|addr| {
                addr.parse::<SocketAddr>()
                    .with_context(|| format!("invalid metrics address: {addr}"))
            })
            .transpose()?;

        let allowed_origins: Vec<String> = cli
            .allowed_origins
            .iter()
            .map(|origin| origin.trim().trim_end_matches('/').to_string())
            .filter(|origin| !origin.is_empty())
            .collect();
        if allowed_origins.is_empty() {
            bail!("at least one allowed origin is required");
        }
        if cli.frame_buffer == 0 {
            bail!("frame buffer must be greater than zero");
        }
        if cli.stdin_buffer_bytes == 0 {
            bail!("stdin buffer must be greater than zero");
        }
        if cli.shutdown_directive.contains('\n') {
            bail!("shutdown directive must be a single line");
        }

        let sandbox = SandboxConfig {
            worker_bin: cli.worker_bin,
            chroot: cli.chroot,
            uid: cli.uid,
            cpu_limit_secs: cli.cpu_limit_secs,
            print_precision: cli.print_precision,
            print_width: cli.print_width,
        };

        Ok(RelayConfig {
            listen_addr,
            metrics_addr,
            allowed_origins,
            session: SessionConfig {
                launch: sandbox.launch_contract(),
                shutdown: ShutdownPolicy {
                    directive: cli.shutdown_directive,
                    directive_grace: Duration::from_millis(cli.directive_grace_ms),
                    signal_grace: Duration::from_millis(cli.signal_grace_ms),
                    kill_grace: Duration::from_millis(cli.kill_grace_ms),
                },
                buffer_policy: cli.buffer_policy,
                frame_buffer: cli.frame_buffer,
                stdin_buffer_bytes: cli.stdin_buffer_bytes,
            },
            shutdown_grace: Duration::from_secs(cli.shutdown_grace_secs),
        })
    }
}
