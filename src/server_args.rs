use std::fmt;
use std::path::PathBuf;

/// Command-line configuration for one server instance.
///
/// The server is driven purely through its arguments; [`ServerArgs::to_args`]
/// renders them in the order the server expects and [`fmt::Display`] gives the
/// argument string used in logs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerArgs {
    /// Path of a server configuration file (`-c`)
    pub config_file: Option<PathBuf>,
    /// Enable the JetStream storage subsystem (`--jetstream`)
    pub jetstream: bool,
    /// Token clients must present in CONNECT (`--auth`)
    pub auth_token: Option<String>,
    /// Verbose debug and trace logging (`-DV`)
    pub verbose: bool,
    /// Additional raw arguments appended as-is
    pub extra: Vec<String>,
}

impl ServerArgs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.config_file = Some(path.into());
        self
    }

    pub fn with_jetstream(mut self) -> Self {
        self.jetstream = true;
        self
    }

    pub fn with_auth_token(mut self, token: impl Into<String>) -> Self {
        self.auth_token = Some(token.into());
        self
    }

    pub fn with_verbose(mut self) -> Self {
        self.verbose = true;
        self
    }

    pub fn with_extra(mut self, arg: impl Into<String>) -> Self {
        self.extra.push(arg.into());
        self
    }

    /// Renders the full argument vector for a server listening on `port`.
    pub fn to_args(&self, port: u16) -> Vec<String> {
        let mut args = vec!["-p".to_string(), port.to_string()];

        if let Some(ref path) = self.config_file {
            args.push("-c".to_string());
            args.push(path.display().to_string());
        }
        if self.jetstream {
            args.push("--jetstream".to_string());
        }
        if let Some(ref token) = self.auth_token {
            args.push("--auth".to_string());
            args.push(token.clone());
        }
        if self.verbose {
            args.push("-DV".to_string());
        }
        args.extend(self.extra.iter().cloned());

        args
    }
}

/// Arguments asking the server executable to put the running instance `pid`
/// into lame duck mode.
pub fn lame_duck_signal_args(pid: i32) -> Vec<String> {
    vec!["--signal".to_string(), format!("ldm={}", pid)]
}

impl fmt::Display for ServerArgs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Port is owned by the handle, so it is rendered without it.
        let rendered = self.to_args(0);
        write!(f, "{}", rendered[2..].join(" "))
    }
}
