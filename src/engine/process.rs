//! Engine tasks and servers run as child processes.
//!
//! Tasks (`ingest`, `infer`) run to completion. Servers stay up for the life
//! of their handle and answer one JSON request per line on stdin with one
//! JSON reply per line on stdout: `{"result": ...}` or `{"error": "..."}`.

use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io::{self, BufRead, BufReader, Write};
use std::path::Path;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use tracing::{debug, info, warn};

use super::{EngineRunner, EngineValue, PredictRequest, PredictServer, ProjectPaths, QueryServer, ServerFactory};
use crate::config::EngineSettings;
use crate::constants::layout;
use crate::error::{Error, Result};

/// `<python> -m <module>` with the store directory exported to the child only.
fn engine_command(python: &str, module: &str, store: &Path) -> Command {
    let mut cmd = Command::new(python);
    cmd.args(["-m", module]);
    cmd.env(layout::STORE_ENV, store);
    cmd
}

/// Runs the engine's task module through an interpreter.
#[derive(Debug, Clone)]
pub struct LoomCli {
    python: String,
    task_module: String,
}

impl LoomCli {
    pub fn new(settings: &EngineSettings) -> Self {
        Self {
            python: settings.python.clone(),
            task_module: settings.task_module.clone(),
        }
    }

    fn command(&self, store: &Path, args: &[String]) -> Command {
        let mut cmd = engine_command(&self.python, &self.task_module, store);
        cmd.args(args);
        cmd
    }

    fn run(&self, store: &Path, name: &str, args: Vec<String>) -> Result<()> {
        debug!("Running {} -m {} {:?}", self.python, self.task_module, args);
        let output = self.command(store, &args).output()?;
        if output.status.success() {
            return Ok(());
        }
        Err(Error::Task(format!(
            "task '{}' for project {} exited with {}: {}",
            args.first().map(String::as_str).unwrap_or_default(),
            name,
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        )))
    }
}

impl EngineRunner for LoomCli {
    fn ingest(&self, store: &Path, name: &str, rows_csv: &Path, schema: &Path) -> Result<()> {
        info!("Ingesting project {} into {}", name, store.display());
        self.run(
            store,
            name,
            vec![
                "ingest".to_string(),
                name.to_string(),
                schema.display().to_string(),
                rows_csv.display().to_string(),
            ],
        )
    }

    fn infer(&self, store: &Path, name: &str, sample_count: usize) -> Result<()> {
        info!("Inferring {} models for project {}", sample_count, name);
        self.run(
            store,
            name,
            vec![
                "infer".to_string(),
                name.to_string(),
                format!("sample_count={sample_count}"),
            ],
        )
    }
}

#[derive(Debug, Serialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum ServerRequest<'a> {
    Score {
        row: &'a [Option<EngineValue>],
    },
    MutualInformation {
        columns0: &'a [String],
        columns1: &'a [String],
        sample_count: usize,
    },
    Predict {
        csv: String,
        count: usize,
    },
    Similar {
        row: &'a [Option<String>],
        target: &'a [Option<String>],
    },
}

#[derive(Debug, Deserialize)]
struct ServerReply {
    #[serde(default)]
    result: Option<serde_json::Value>,
    #[serde(default)]
    error: Option<String>,
}

struct Pipes {
    child: Child,
    stdin: ChildStdin,
    stdout: BufReader<ChildStdout>,
}

impl Pipes {
    /// Send one request line and read one reply line. An empty reply means
    /// the server closed its output.
    fn exchange(&mut self, request: &[u8]) -> io::Result<String> {
        self.stdin.write_all(request)?;
        self.stdin.flush()?;
        let mut reply = String::new();
        self.stdout.read_line(&mut reply)?;
        Ok(reply)
    }
}

/// A running engine server. Calls are serialized; the child is killed when
/// the handle is dropped.
struct ServerProcess {
    label: String,
    pipes: Mutex<Pipes>,
}

impl ServerProcess {
    fn spawn(mut cmd: Command, label: String) -> Result<Self> {
        let mut child = cmd
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(|e| Error::Task(format!("starting {label}: {e}")))?;
        let (Some(stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
            // Unreachable with piped stdio.
            let _ = child.kill();
            return Err(Error::Task(format!("{label} started without pipes")));
        };
        debug!("Started {} as pid {}", label, child.id());
        Ok(Self {
            label,
            pipes: Mutex::new(Pipes {
                child,
                stdin,
                stdout: BufReader::new(stdout),
            }),
        })
    }

    fn call<T: DeserializeOwned>(&self, request: &ServerRequest<'_>) -> Result<T> {
        let mut line = serde_json::to_vec(request)?;
        line.push(b'\n');
        let reply = self.pipes.lock().exchange(&line).map_err(|e| self.failure(e))?;
        if reply.is_empty() {
            return Err(self.failure("exited without replying"));
        }
        let reply: ServerReply =
            serde_json::from_str(&reply).map_err(|e| self.failure(format!("malformed reply: {e}")))?;
        match (reply.error, reply.result) {
            (Some(message), _) => Err(self.failure(message)),
            (None, Some(result)) => {
                serde_json::from_value(result).map_err(|e| self.failure(format!("unexpected result: {e}")))
            }
            (None, None) => Err(self.failure("reply carries no result")),
        }
    }

    fn failure(&self, message: impl fmt::Display) -> Error {
        Error::Task(format!("{}: {}", self.label, message))
    }
}

impl Drop for ServerProcess {
    fn drop(&mut self) {
        let pipes = self.pipes.get_mut();
        if let Err(e) = pipes.child.kill() {
            warn!("Failed to stop {}: {}", self.label, e);
        }
        let _ = pipes.child.wait();
        debug!("Stopped {}", self.label);
    }
}

struct LoomQueryServer(ServerProcess);

impl QueryServer for LoomQueryServer {
    fn score(&self, row: &[Option<EngineValue>]) -> Result<f64> {
        self.0.call(&ServerRequest::Score { row })
    }

    fn mutual_information(&self, names0: &[String], names1: &[String], sample_count: usize) -> Result<f64> {
        self.0.call(&ServerRequest::MutualInformation {
            columns0: names0,
            columns1: names1,
            sample_count,
        })
    }
}

struct LoomPredictServer(ServerProcess);

impl PredictServer for LoomPredictServer {
    fn predict(&self, request: &PredictRequest, count: usize) -> Result<String> {
        self.0.call(&ServerRequest::Predict {
            csv: request.to_csv()?,
            count,
        })
    }

    fn similar(&self, row: &[Option<String>], target: &[Option<String>]) -> Result<f64> {
        self.0.call(&ServerRequest::Similar { row, target })
    }
}

/// Opens engine servers as children of the configured interpreter:
/// `<python> -m <server_module> query|predict <project root>`.
#[derive(Debug, Clone)]
pub struct LoomServers {
    python: String,
    server_module: String,
}

impl LoomServers {
    pub fn new(settings: &EngineSettings) -> Self {
        Self {
            python: settings.python.clone(),
            server_module: settings.server_module.clone(),
        }
    }

    fn command(&self, kind: &str, project: &ProjectPaths) -> Command {
        let mut cmd = engine_command(&self.python, &self.server_module, project.store());
        cmd.arg(kind);
        cmd.arg(project.root());
        cmd
    }

    fn open(&self, kind: &str, project: &ProjectPaths) -> Result<ServerProcess> {
        info!("Opening {} server for project {}", kind, project.name());
        ServerProcess::spawn(
            self.command(kind, project),
            format!("{} server for project {}", kind, project.name()),
        )
    }
}

impl ServerFactory for LoomServers {
    fn open_query_server(&self, project: &ProjectPaths) -> Result<Box<dyn QueryServer>> {
        Ok(Box::new(LoomQueryServer(self.open("query", project)?)))
    }

    fn open_predict_server(&self, project: &ProjectPaths) -> Result<Box<dyn PredictServer>> {
        Ok(Box::new(LoomPredictServer(self.open("predict", project)?)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ffi::OsStr;

    fn settings(python: &str, server_module: &str) -> EngineSettings {
        EngineSettings {
            python: python.to_string(),
            server_module: server_module.to_string(),
            ..EngineSettings::default()
        }
    }

    #[test]
    fn test_store_is_scoped_to_child() {
        let cli = LoomCli::new(&EngineSettings::default());
        let cmd = cli.command(Path::new("/tmp/store"), &["infer".to_string()]);
        let envs: Vec<_> = cmd.get_envs().collect();
        assert_eq!(envs.len(), 1);
        assert_eq!(envs[0].0, layout::STORE_ENV);
    }

    #[test]
    fn test_failed_task_reports_stderr() {
        let cli = LoomCli::new(&EngineSettings {
            python: "false".to_string(),
            ..EngineSettings::default()
        });
        let err = cli.infer(Path::new("/tmp"), "proj", 2).unwrap_err();
        assert!(matches!(err, Error::Task(_)));
        assert!(err.to_string().contains("proj"));
    }

    #[test]
    fn test_server_command() {
        let servers = LoomServers::new(&EngineSettings::default());
        let cmd = servers.command("query", &ProjectPaths::new("/tmp/store", "p"));
        let args: Vec<&OsStr> = cmd.get_args().collect();
        assert_eq!(args, ["-m", "loom.server", "query", "/tmp/store/p"]);
        let envs: Vec<_> = cmd.get_envs().collect();
        assert_eq!(envs, [(OsStr::new(layout::STORE_ENV), Some(OsStr::new("/tmp/store")))]);
    }

    #[test]
    fn test_request_lines() {
        let row = [Some(EngineValue::Real(1.5)), None, Some(EngineValue::Code(2))];
        assert_eq!(
            serde_json::to_string(&ServerRequest::Score { row: &row }).unwrap(),
            r#"{"op":"score","row":[1.5,null,2]}"#
        );
        let request = ServerRequest::MutualInformation {
            columns0: &["color".to_string()],
            columns1: &["size".to_string()],
            sample_count: 10,
        };
        assert_eq!(
            serde_json::to_string(&request).unwrap(),
            r#"{"op":"mutual_information","columns0":["color"],"columns1":["size"],"sample_count":10}"#
        );
    }

    #[cfg(unix)]
    #[test]
    fn test_server_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("server.sh");
        std::fs::write(
            &script,
            "read -r line; echo '{\"result\": -1.25}'\n\
             read -r line; echo '{\"error\": \"unknown column\"}'\n",
        )
        .unwrap();
        let servers = LoomServers::new(&settings("sh", &script.display().to_string()));
        let server = servers
            .open_query_server(&ProjectPaths::new(dir.path(), "p"))
            .unwrap();

        assert_eq!(server.score(&[Some(EngineValue::Real(0.0))]).unwrap(), -1.25);
        let err = server.score(&[None]).unwrap_err();
        assert!(err.to_string().contains("unknown column"), "{err}");
        // The script has exited.
        assert!(matches!(server.score(&[None]), Err(Error::Task(_))));
    }

    #[test]
    fn test_server_that_exits_fails_calls() {
        let servers = LoomServers::new(&settings("true", "loom.server"));
        let server = servers
            .open_predict_server(&ProjectPaths::new("/tmp/store", "p"))
            .unwrap();
        assert!(matches!(server.similar(&[], &[]), Err(Error::Task(_))));
    }

    #[test]
    fn test_missing_interpreter() {
        let servers = LoomServers::new(&settings("/nonexistent/python", "loom.server"));
        let err = servers
            .open_query_server(&ProjectPaths::new("/tmp/store", "p"))
            .err()
            .unwrap();
        assert!(matches!(err, Error::Task(_)));
    }
}
