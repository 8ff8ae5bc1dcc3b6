use tokio::process::{Child, Command};

use crate::error::SupervisorError;

/// How the supervisor starts a remote client process (spec section 4.6).
#[derive(Debug, Clone)]
pub enum Launcher {
    /// Forked child processes on the same host.
    Local,
    /// One SSH session per node in the file.
    Ssh { nodefile: Vec<String> },
    /// `mpiexec -machinefile <file> hyper-shell client ...`.
    Mpi { machinefile: String },
}

impl Launcher {
    /// Build and spawn the `index`th client process. `client_args` are the
    /// flags passed after `hyper-shell client` (server address, authkey,
    /// template, capacity, ...).
    pub fn spawn(&self, index: usize, client_exe: &str, client_args: &[String]) -> Result<Child, SupervisorError> {
        let child = match self {
            Launcher::Local => Command::new(client_exe).args(client_args).spawn()?,
            Launcher::Ssh { nodefile } => {
                let node = nodefile
                    .get(index % nodefile.len().max(1))
                    .ok_or(SupervisorError::MissingExe)?;
                let mut remote = vec![client_exe.to_string(), "client".to_string()];
                remote.extend(client_args.iter().cloned());
                Command::new("ssh").arg(node).arg(remote.join(" ")).spawn()?
            }
            Launcher::Mpi { machinefile } => Command::new("mpiexec")
                .arg("-machinefile")
                .arg(machinefile)
                .arg(client_exe)
                .arg("client")
                .args(client_args)
                .spawn()?,
        };
        Ok(child)
    }
}

/// Resolve the client binary: `HYPERSHELL_EXE` if set, else `hyper-shell` on
/// PATH (spec section 4.6).
pub fn resolve_client_exe() -> String {
    std::env::var("HYPERSHELL_EXE").unwrap_or_else(|_| "hyper-shell".to_string())
}
